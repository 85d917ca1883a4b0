use std::collections::{BTreeMap, VecDeque};
use std::ffi::CString;
use std::path::Path;
use std::ptr::{null, null_mut};
use std::sync::Arc;

use ffmpeg_next::ffi::{
    AVChannelOrder, av_channel_layout_default, av_find_input_format, avformat_find_stream_info,
    avformat_open_input,
};
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::{Packet, Rational, codec, decoder, format, frame, media};
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::convert::{PictureSpec, PixelConverter};
use super::error::{MediaError, Result, check, is_again};
use super::frame::Layout;
use super::hw::{HwDecode, HwDevice};
use super::options::Options;
use super::output::{MediaFrame, OutputFile, OutputSettings};
use super::timestamp::is_rational_valid;

/// Pixel format of every frame [`Input::next_video_frame`] returns.
pub const HOST_PIXEL_FORMAT: Pixel = Pixel::RGB24;

/// Where and how to open a source.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub url: String,
    /// Explicit demuxer name, e.g. `v4l2`.
    pub format: Option<String>,
    pub options: BTreeMap<String, String>,
    /// Hardware device type used for video decoding, e.g. `vaapi`.
    pub hw_type: Option<String>,
    /// Reject sources without a video stream.
    pub require_video: bool,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
            options: BTreeMap::new(),
            hw_type: None,
            require_video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Decoder-side parameters an encoder is derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamParams {
    Video {
        width: u32,
        height: u32,
        format: Pixel,
        aspect_ratio: Rational,
        frame_rate: Option<Rational>,
    },
    Audio {
        format: Sample,
        layout: Layout,
        rate: u32,
    },
}

/// Snapshot of one decoded input stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSpec {
    pub index: usize,
    pub time_base: Rational,
    pub params: StreamParams,
}

impl StreamSpec {
    pub fn kind(&self) -> StreamKind {
        match self.params {
            StreamParams::Video { .. } => StreamKind::Video,
            StreamParams::Audio { .. } => StreamKind::Audio,
        }
    }
}

struct Shared {
    fps: f64,
    settings: OutputSettings,
    streams: RwLock<Vec<StreamSpec>>,
    session: RwLock<Option<Mutex<OutputFile>>>,
}

/// Thread-safe handle to an [`Input`]'s recording session and stream facts.
#[derive(Clone)]
pub struct InputHandle {
    shared: Arc<Shared>,
}

impl InputHandle {
    pub fn fps(&self) -> f64 {
        self.shared.fps
    }

    pub fn streams(&self) -> Vec<StreamSpec> {
        self.shared.streams.read().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.session.read().is_some()
    }

    /// Opens a new recording at `path`, replacing any running one.
    ///
    /// The output is built before the session lock is taken, and a replaced
    /// session is finalised after it is released.
    pub fn start_recording(&self, path: &Path) -> Result<()> {
        let streams = self.streams();
        let output = OutputFile::create(path, &streams, &self.shared.settings)?;
        let previous = self.shared.session.write().replace(Mutex::new(output));
        if previous.is_some() {
            info!(path = %path.display(), "Replacing running recording");
        }
        drop(previous);
        info!(path = %path.display(), "Recording started");
        Ok(())
    }

    /// Finalises the running recording, if any.
    pub fn stop_recording(&self) {
        let previous = self.shared.session.write().take();
        if let Some(output) = previous {
            let output = output.into_inner();
            let path = output.path().to_path_buf();
            drop(output);
            info!(path = %path.display(), "Recording stopped");
        }
    }

    fn encode_write_frame(&self, frame: MediaFrame<'_>, stream_index: usize) -> Result<()> {
        let session = self.shared.session.read();
        if let Some(output) = session.as_ref() {
            output.lock().encode_write_frame(frame, stream_index)?;
        }
        Ok(())
    }

    fn update_video_picture(&self, stream_index: usize, picture: PictureSpec) {
        let mut streams = self.shared.streams.write();
        for spec in streams.iter_mut().filter(|spec| spec.index == stream_index) {
            if let StreamParams::Video {
                width,
                height,
                format,
                ..
            } = &mut spec.params
            {
                *width = picture.width;
                *height = picture.height;
                *format = picture.format;
            }
        }
    }
}

struct VideoDecoder {
    decoder: decoder::Video,
    // Dropped after the decoder that references it.
    hw: Option<HwDecode>,
    stream_index: usize,
    converter: Option<PixelConverter>,
}

struct AudioDecoder {
    decoder: decoder::Audio,
    stream_index: usize,
}

/// Demux/decode engine: pulls packets, decodes them and hands out host frames.
pub struct Input {
    video: Option<VideoDecoder>,
    audio: Option<AudioDecoder>,
    ictx: format::context::Input,
    pending: VecDeque<RgbImage>,
    handle: InputHandle,
    finished: bool,
    url: String,
}

// SAFETY: every native handle inside is exclusively owned by `Input`, which
// is only ever driven from one thread at a time through `&mut self`.
unsafe impl Send for Input {}

impl Input {
    pub fn open(source: &SourceDescriptor, settings: OutputSettings) -> Result<Self> {
        super::init();

        let hw_device = match source.hw_type.as_deref() {
            Some(name) => Some(HwDevice::create(name)?),
            None => None,
        };

        let ictx = open_format_context(source)?;

        let mut video: Option<VideoDecoder> = None;
        let mut audio: Option<AudioDecoder> = None;
        let mut streams = Vec::new();
        let mut fps = 0.0;

        for stream in ictx.streams() {
            let index = stream.index();
            let parameters = stream.parameters();
            let medium = parameters.medium();
            if medium != media::Type::Video && medium != media::Type::Audio {
                debug!(index, ?medium, "Ignoring stream");
                continue;
            }
            if medium == media::Type::Video && video.is_some() {
                warn!(index, "Ignoring additional video stream");
                continue;
            }
            if medium == media::Type::Audio && audio.is_some() {
                warn!(index, "Ignoring additional audio stream");
                continue;
            }

            let codec = codec::decoder::find(parameters.id()).ok_or_else(|| {
                MediaError::setup(format!(
                    "Failed to find decoder for stream #{index} ({:?})",
                    parameters.id()
                ))
            })?;
            let mut context = codec::Context::from_parameters(parameters)
                .map_err(|e| MediaError::decode(format!("copy parameters of stream #{index}"), e))?;
            let time_base = stream.time_base();
            unsafe {
                (*context.as_mut_ptr()).pkt_timebase = time_base.into();
            }

            if medium == media::Type::Video {
                let hw = match &hw_device {
                    Some(device) => Some(unsafe {
                        HwDecode::attach(context.as_mut_ptr(), codec.as_ptr(), device.clone())?
                    }),
                    None => None,
                };
                let decoder = context
                    .decoder()
                    .video()
                    .map_err(|e| MediaError::decode(format!("open video decoder #{index}"), e))?;

                let frame_rate = valid_frame_rate(&stream);
                fps = frame_rate.map(f64::from).unwrap_or(0.0);
                let format = match &hw {
                    Some(_) => Pixel::NV12,
                    None => decoder.format(),
                };
                info!(
                    index,
                    codec = ?decoder.id(),
                    width = decoder.width(),
                    height = decoder.height(),
                    ?format,
                    fps,
                    "Video stream"
                );
                streams.push(StreamSpec {
                    index,
                    time_base,
                    params: StreamParams::Video {
                        width: decoder.width(),
                        height: decoder.height(),
                        format,
                        aspect_ratio: decoder.aspect_ratio(),
                        frame_rate,
                    },
                });
                video = Some(VideoDecoder {
                    decoder,
                    hw,
                    stream_index: index,
                    converter: None,
                });
            } else {
                unsafe {
                    let ptr = context.as_mut_ptr();
                    if (*ptr).ch_layout.order == AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC {
                        let channels = (*ptr).ch_layout.nb_channels;
                        av_channel_layout_default(&mut (*ptr).ch_layout, channels);
                    }
                }
                let decoder = context
                    .decoder()
                    .audio()
                    .map_err(|e| MediaError::decode(format!("open audio decoder #{index}"), e))?;
                let layout = unsafe { Layout::from_codec(decoder.as_ptr()) };
                info!(
                    index,
                    rate = decoder.rate(),
                    channels = layout.channels,
                    format = ?decoder.format(),
                    "Audio stream"
                );
                streams.push(StreamSpec {
                    index,
                    time_base,
                    params: StreamParams::Audio {
                        format: decoder.format(),
                        layout,
                        rate: decoder.rate(),
                    },
                });
                audio = Some(AudioDecoder {
                    decoder,
                    stream_index: index,
                });
            }
        }

        if video.is_none() && source.require_video {
            return Err(MediaError::setup(format!(
                "No video stream found in {}",
                source.url
            )));
        }

        Ok(Self {
            video,
            audio,
            ictx,
            pending: VecDeque::new(),
            handle: InputHandle {
                shared: Arc::new(Shared {
                    fps,
                    settings,
                    streams: RwLock::new(streams),
                    session: RwLock::new(None),
                }),
            },
            finished: false,
            url: source.url.clone(),
        })
    }

    pub fn handle(&self) -> InputHandle {
        self.handle.clone()
    }

    /// Nominal frame rate of the video stream, zero without one.
    pub fn fps(&self) -> f64 {
        self.handle.fps()
    }

    pub fn streams(&self) -> Vec<StreamSpec> {
        self.handle.streams()
    }

    pub fn is_recording(&self) -> bool {
        self.handle.is_recording()
    }

    pub fn start_recording(&self, path: &Path) -> Result<()> {
        self.handle.start_recording(path)
    }

    pub fn stop_recording(&self) {
        self.handle.stop_recording()
    }

    /// Returns the next decoded video frame converted to [`HOST_PIXEL_FORMAT`].
    pub fn next_video_frame(&mut self) -> Result<RgbImage> {
        loop {
            if let Some(image) = self.pending.pop_front() {
                return Ok(image);
            }
            if self.finished {
                return Err(MediaError::SourceExhausted);
            }
            self.pump()?;
        }
    }

    fn pump(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.ictx) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => {
                debug!(url = %self.url, "End of input, draining decoders");
                self.finished = true;
                self.decode_video(None)?;
                return self.decode_audio(None);
            }
            Err(error) if is_again(&error) => return Ok(()),
            Err(error) => return Err(MediaError::decode("read packet", error)),
        }

        let index = packet.stream();
        if self.video.as_ref().is_some_and(|v| v.stream_index == index) {
            self.decode_video(Some(&packet))
        } else if self.audio.as_ref().is_some_and(|a| a.stream_index == index) {
            self.decode_audio(Some(&packet))
        } else {
            trace!(index, "Skipping packet of unused stream");
            Ok(())
        }
    }

    fn decode_video(&mut self, packet: Option<&Packet>) -> Result<()> {
        let Some(video) = self.video.as_mut() else {
            return Ok(());
        };
        let sent = match packet {
            Some(packet) => video.decoder.send_packet(packet),
            None => video.decoder.send_eof(),
        };
        match sent {
            Ok(()) => {}
            Err(error) if is_again(&error) => {}
            Err(ffmpeg_next::Error::Eof) => {}
            Err(error) => return Err(MediaError::decode("send video packet", error)),
        }

        let mut decoded = frame::Video::empty();
        loop {
            match video.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    decoded.set_pts(decoded.timestamp());
                    let downloaded;
                    let host_frame = match &video.hw {
                        Some(hw) if decoded.format() == hw.pixel() => {
                            downloaded = super::hw::download(&decoded)?;
                            &downloaded
                        }
                        _ => &decoded,
                    };
                    self.handle
                        .encode_write_frame(MediaFrame::Video(host_frame), video.stream_index)?;

                    let picture = PictureSpec::of(host_frame);
                    let converter = match video.converter.take() {
                        Some(converter) if converter.source() == picture => converter,
                        previous => {
                            if previous.is_some() {
                                warn!(?picture, "Video frame geometry changed, rebuilding converter");
                            }
                            self.handle.update_video_picture(video.stream_index, picture);
                            PixelConverter::new(
                                picture,
                                PictureSpec {
                                    format: HOST_PIXEL_FORMAT,
                                    ..picture
                                },
                            )?
                        }
                    };
                    let converter = video.converter.insert(converter);
                    self.pending.push_back(converter.frame_to_host_image(host_frame)?);
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(error) if is_again(&error) => break,
                Err(error) => return Err(MediaError::decode("receive video frame", error)),
            }
        }
        Ok(())
    }

    fn decode_audio(&mut self, packet: Option<&Packet>) -> Result<()> {
        let Some(audio) = self.audio.as_mut() else {
            return Ok(());
        };
        let sent = match packet {
            Some(packet) => audio.decoder.send_packet(packet),
            None => audio.decoder.send_eof(),
        };
        match sent {
            Ok(()) => {}
            Err(error) if is_again(&error) => {}
            Err(ffmpeg_next::Error::Eof) => {}
            Err(error) => return Err(MediaError::decode("send audio packet", error)),
        }

        let mut decoded = frame::Audio::empty();
        loop {
            match audio.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    decoded.set_pts(decoded.timestamp());
                    self.handle
                        .encode_write_frame(MediaFrame::Audio(&decoded), audio.stream_index)?;
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(error) if is_again(&error) => break,
                Err(error) => return Err(MediaError::decode("receive audio frame", error)),
            }
        }
        Ok(())
    }
}

impl Drop for Input {
    fn drop(&mut self) {
        self.handle.stop_recording();
    }
}

/// Opens the demuxer and probes streams, failing on options it did not consume.
fn open_format_context(source: &SourceDescriptor) -> Result<format::context::Input> {
    let url = CString::new(source.url.as_str())
        .map_err(|_| MediaError::setup(format!("Invalid source url {:?}", source.url)))?;
    let input_format = match source.format.as_deref() {
        Some(name) => {
            let c_name = CString::new(name)
                .map_err(|_| MediaError::setup(format!("Invalid input format {name:?}")))?;
            let found = unsafe { av_find_input_format(c_name.as_ptr()) };
            if found.is_null() {
                return Err(MediaError::setup(format!("Unknown input format '{name}'")));
            }
            found
        }
        None => null(),
    };

    let mut options = Options::from_map(&source.options);
    let mut ptr = null_mut();
    let ret = options.apply(|dict| unsafe {
        avformat_open_input(&mut ptr, url.as_ptr(), input_format, dict)
    });
    check(ret).map_err(|e| MediaError::decode(format!("open input {}", source.url), e))?;
    // SAFETY: a successful avformat_open_input hands over a valid context.
    let mut ictx = unsafe { format::context::Input::wrap(ptr) };
    options.ensure_consumed("demuxer")?;

    let ret = unsafe { avformat_find_stream_info(ictx.as_mut_ptr(), null_mut()) };
    check(ret).map_err(|e| MediaError::decode("find stream info", e))?;
    debug!(url = %source.url, format = ictx.format().name(), "Input opened");
    Ok(ictx)
}

/// Frame rate from avg_frame_rate, falling back to r_frame_rate.
fn valid_frame_rate(stream: &ffmpeg_next::Stream) -> Option<Rational> {
    let avg_fps = stream.avg_frame_rate();
    if is_rational_valid(avg_fps) {
        return Some(avg_fps);
    }
    let r_fps = stream.rate();
    if is_rational_valid(r_fps) {
        debug!(?avg_fps, ?r_fps, "avg_frame_rate invalid, using r_frame_rate");
        return Some(r_fps);
    }
    warn!(?avg_fps, ?r_fps, "Unable to determine a valid frame rate");
    None
}
