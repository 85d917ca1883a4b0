use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr::{null, null_mut};
use std::sync::{Arc, LazyLock};

use ffmpeg_next::ffi::{
    AVCodecContext, AVFMT_GLOBALHEADER, AVFMT_NOFILE, AVFMT_NOTIMESTAMPS, AVFMT_TS_NONSTRICT,
    AVIO_FLAG_WRITE, AVSampleFormat, av_channel_layout_copy, av_samples_set_silence, avcodec_open2,
    avformat_alloc_output_context2, avio_open,
};
use ffmpeg_next::codec::Capabilities;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::{Packet, Rational, codec, encoder, format, frame, picture, threading};
use tracing::{debug, error, info, trace, warn};

use super::convert::{AudioSpec, PictureSpec, PixelConverter, Resampler};
use super::error::{MediaError, Result, check, is_again};
use super::fifo::AudioFifo;
use super::frame::{Layout, alloc_audio_frame, new_ref, samples};
use super::hw::{HwDevice, HwFrames, HwMethod, find_hw_pix_fmt};
use super::input::{StreamParams, StreamSpec};
use super::options::Options;
use super::timestamp::{DtsGuard, StreamClock, is_rational_valid};

/// Software format uploaded into hardware encoder surfaces.
const HW_UPLOAD_FORMAT: Pixel = Pixel::NV12;

static NUM_CPUS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = if n > 16 { 16 } else { n };
    info!(num, "Detecting CPU cores");
    num
});

/// A decoded frame handed to a recording session.
#[derive(Clone, Copy)]
pub enum MediaFrame<'a> {
    Video(&'a frame::Video),
    Audio(&'a frame::Audio),
}

/// Encoder choices for recordings.
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub video_codec: String,
    /// Hardware device type used for video encoding, e.g. `vaapi`.
    pub video_hw_type: Option<String>,
    /// Private options of the video encoder, e.g. `crf`.
    pub video_options: BTreeMap<String, String>,
    pub video_bitrate: Option<usize>,
    pub audio_codec: String,
    pub audio_bitrate: Option<usize>,
    /// Container name; guessed from the file extension when `None`.
    pub container: Option<String>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            video_hw_type: None,
            video_options: BTreeMap::new(),
            video_bitrate: None,
            audio_codec: "aac".to_string(),
            audio_bitrate: None,
            container: None,
        }
    }
}

struct VideoPath {
    encoder: encoder::video::Encoder,
    input_index: usize,
    output_index: usize,
    input_tb: Rational,
    encoder_tb: Rational,
    /// Picture the encoder consumes before any hardware upload.
    target: PictureSpec,
    converter: Option<PixelConverter>,
    hw_frames: Option<Arc<HwFrames>>,
    clock: StreamClock,
    flushable: bool,
}

struct AudioPath {
    encoder: encoder::audio::Encoder,
    input_index: usize,
    output_index: usize,
    input_tb: Rational,
    encoder_tb: Rational,
    spec: AudioSpec,
    resampler: Resampler,
    fifo: AudioFifo,
    scratch: Option<frame::Audio>,
    /// Samples per encoder frame; zero when the encoder takes any size.
    frame_size: usize,
    pad_last_frame: bool,
    clock: StreamClock,
    flushable: bool,
}

enum StreamPath {
    Video(VideoPath),
    Audio(AudioPath),
}

impl StreamPath {
    fn input_index(&self) -> usize {
        match self {
            StreamPath::Video(video) => video.input_index,
            StreamPath::Audio(audio) => audio.input_index,
        }
    }
}

/// One recording: an output container with an encoder per recorded stream.
///
/// Dropping the file flushes buffered audio and encoder delay, then writes
/// the trailer. Failures at that point are only logged.
pub struct OutputFile {
    // encoders are released before the format context
    paths: Vec<StreamPath>,
    octx: format::context::Output,
    guards: Vec<DtsGuard>,
    path: PathBuf,
    finished: bool,
}

// SAFETY: the format context and every encoder are exclusively owned and only
// touched through `&mut self`.
unsafe impl Send for OutputFile {}

impl OutputFile {
    /// Opens `path` and writes the container header for `streams`.
    pub fn create(path: &Path, streams: &[StreamSpec], settings: &OutputSettings) -> Result<Self> {
        super::init();
        if streams.is_empty() {
            return Err(MediaError::setup("Nothing to record: no input streams"));
        }

        let mut octx = alloc_output_context(path, settings.container.as_deref())?;
        let format_flags = unsafe { (*(*octx.as_ptr()).oformat).flags };
        let global_header = format_flags & AVFMT_GLOBALHEADER as i32 != 0;

        let mut paths = Vec::with_capacity(streams.len());
        for spec in streams {
            let stream_path = match spec.params {
                StreamParams::Video { .. } => {
                    StreamPath::Video(open_video(&mut octx, spec, settings, global_header)?)
                }
                StreamParams::Audio { .. } => {
                    StreamPath::Audio(open_audio(&mut octx, spec, settings, global_header)?)
                }
            };
            paths.push(stream_path);
        }

        if format_flags & AVFMT_NOFILE as i32 == 0 {
            let c_path = CString::new(path.to_string_lossy().as_bytes())
                .map_err(|_| MediaError::setup(format!("Invalid output path {}", path.display())))?;
            unsafe {
                check(avio_open(
                    &mut (*octx.as_mut_ptr()).pb,
                    c_path.as_ptr(),
                    AVIO_FLAG_WRITE as i32,
                ))
                .map_err(|e| MediaError::encode(format!("open {}", path.display()), e))?;
            }
        }

        octx.write_header()
            .map_err(|e| MediaError::encode("write header", e))?;

        let strict = format_flags & AVFMT_TS_NONSTRICT as i32 == 0;
        let enabled = format_flags & AVFMT_NOTIMESTAMPS as i32 == 0;
        let guards = (0..octx.nb_streams())
            .map(|_| DtsGuard::new(strict, enabled))
            .collect();

        info!(path = %path.display(), streams = paths.len(), "Recording started");
        Ok(Self {
            paths,
            octx,
            guards,
            path: path.to_path_buf(),
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encodes one decoded frame of input stream `input_index`.
    ///
    /// Frames of streams this file does not record are ignored.
    pub fn encode_write_frame(&mut self, frame: MediaFrame<'_>, input_index: usize) -> Result<()> {
        let Self {
            paths,
            octx,
            guards,
            ..
        } = self;
        let Some(stream_path) = paths.iter_mut().find(|p| p.input_index() == input_index) else {
            trace!(input_index, "Frame of unrecorded stream");
            return Ok(());
        };
        match (stream_path, frame) {
            (StreamPath::Video(video), MediaFrame::Video(frame)) => video.encode(frame, octx, guards),
            (StreamPath::Audio(audio), MediaFrame::Audio(frame)) => audio.encode(frame, octx, guards),
            _ => Err(MediaError::setup(format!(
                "Frame kind does not match recorded stream #{input_index}"
            ))),
        }
    }

    /// Flushes and closes the file, reporting what `Drop` would only log.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let Self {
            paths,
            octx,
            guards,
            ..
        } = self;
        for stream_path in paths.iter_mut() {
            if let StreamPath::Audio(audio) = stream_path {
                audio.drain(true, octx, guards)?;
            }
        }
        for stream_path in paths.iter_mut() {
            match stream_path {
                StreamPath::Video(video) if video.flushable => {
                    send_eof(&mut video.encoder)?;
                    write_packets(&mut video.encoder, video.output_index, video.encoder_tb, octx, guards)?;
                }
                StreamPath::Audio(audio) if audio.flushable => {
                    send_eof(&mut audio.encoder)?;
                    write_packets(&mut audio.encoder, audio.output_index, audio.encoder_tb, octx, guards)?;
                }
                _ => {}
            }
        }
        octx.write_trailer()
            .map_err(|e| MediaError::encode("write trailer", e))?;
        info!(path = %self.path.display(), "Recording finished");
        Ok(())
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if let Err(error) = self.finish() {
            error!(path = %self.path.display(), %error, "Failed to finish recording");
        }
    }
}

impl VideoPath {
    fn encode(
        &mut self,
        frame: &frame::Video,
        octx: &mut format::context::Output,
        guards: &mut [DtsGuard],
    ) -> Result<()> {
        let Some(pts) = frame.pts() else {
            warn!(stream = self.input_index, "Video frame without timestamp, skipping");
            return Ok(());
        };

        let picture = PictureSpec::of(frame);
        let mut encoded = if picture == self.target {
            new_ref(frame)?
        } else {
            let converter = match self.converter.take() {
                Some(converter) if converter.source() == picture => converter,
                _ => {
                    debug!(?picture, target = ?self.target, "Converting recorded video frames");
                    PixelConverter::new(picture, self.target)?
                }
            };
            self.converter.insert(converter).scale(frame)?
        };
        if let Some(hw_frames) = &self.hw_frames {
            encoded = hw_frames.upload(&encoded)?;
        }
        let pts = self.clock.rebase(pts, self.input_tb, self.encoder_tb);
        stamp_for_encoder(&mut encoded, pts);

        self.encoder
            .send_frame(&encoded)
            .map_err(|e| MediaError::encode("send video frame", e))?;
        write_packets(&mut self.encoder, self.output_index, self.encoder_tb, octx, guards)
    }
}

impl AudioPath {
    fn encode(
        &mut self,
        frame: &frame::Audio,
        octx: &mut format::context::Output,
        guards: &mut [DtsGuard],
    ) -> Result<()> {
        let needed = self.resampler.out_samples(samples(frame)).max(1);
        let scratch = match self.scratch.take() {
            Some(scratch) if samples(&scratch) >= needed => scratch,
            _ => alloc_audio_frame(self.spec.format, self.spec.layout, self.spec.rate, needed)?,
        };
        let scratch = self.scratch.insert(scratch);
        let written = self.resampler.convert(frame, scratch)?;
        self.fifo.push(scratch, written)?;
        self.drain(false, octx, guards)
    }

    /// Encodes whole frames from the FIFO; `last` also encodes the remainder.
    fn drain(
        &mut self,
        last: bool,
        octx: &mut format::context::Output,
        guards: &mut [DtsGuard],
    ) -> Result<()> {
        if last && let Some(scratch) = self.scratch.as_mut() {
            let flushed = self.resampler.flush(scratch)?;
            self.fifo.push(scratch, flushed)?;
        }
        loop {
            let available = self.fifo.len();
            let chunk = if self.frame_size == 0 || (last && available < self.frame_size) {
                available
            } else if available >= self.frame_size {
                self.frame_size
            } else {
                0
            };
            if chunk == 0 {
                return Ok(());
            }

            let padded = self.pad_last_frame && self.frame_size > 0 && chunk < self.frame_size;
            let capacity = if padded { self.frame_size } else { chunk };
            let mut audio = alloc_audio_frame(self.spec.format, self.spec.layout, self.spec.rate, capacity)?;
            let read = self.fifo.pop_into(&mut audio, chunk)?;
            unsafe {
                let ptr = audio.as_mut_ptr();
                if padded {
                    av_samples_set_silence(
                        (*ptr).extended_data,
                        read as i32,
                        (capacity - read) as i32,
                        self.spec.layout.channels as i32,
                        AVSampleFormat::from(self.spec.format),
                    );
                } else {
                    (*ptr).nb_samples = read as i32;
                }
            }
            let pts = self.clock.audio_pts(
                audio.pts(),
                samples(&audio) as i64,
                self.input_tb,
                self.encoder_tb,
            );
            audio.set_pts(Some(pts));

            self.encoder
                .send_frame(&audio)
                .map_err(|e| MediaError::encode("send audio frame", e))?;
            write_packets(&mut self.encoder, self.output_index, self.encoder_tb, octx, guards)?;
        }
    }
}

/// Sets the encoder timestamp and drops the decoder's picture type, so the
/// encoder places key frames by its own GOP settings.
fn stamp_for_encoder(frame: &mut frame::Video, pts: i64) {
    frame.set_pts(Some(pts));
    frame.set_kind(picture::Type::None);
}

fn alloc_output_context(path: &Path, container: Option<&str>) -> Result<format::context::Output> {
    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| MediaError::setup(format!("Invalid output path {}", path.display())))?;
    let c_format = container
        .map(CString::new)
        .transpose()
        .map_err(|_| MediaError::setup("Invalid container name"))?;
    let mut ptr = null_mut();
    unsafe {
        check(avformat_alloc_output_context2(
            &mut ptr,
            null(),
            c_format.as_ref().map_or(null(), |name| name.as_ptr()),
            c_path.as_ptr(),
        ))
        .map_err(|e| {
            MediaError::encode(format!("allocate output context for {}", path.display()), e)
        })?;
        if ptr.is_null() {
            return Err(MediaError::setup(format!(
                "No container matches {}",
                path.display()
            )));
        }
        Ok(format::context::Output::wrap(ptr))
    }
}

/// Opens a configured encoder context; options it did not recognise are an error.
///
/// # Safety
/// `ctx` must point to an unopened codec context allocated for `codec`.
unsafe fn open_encoder(
    ctx: *mut AVCodecContext,
    codec: codec::Codec,
    options: &mut Options,
    scope: &'static str,
) -> Result<()> {
    let ret = options.apply(|dict| unsafe { avcodec_open2(ctx, codec.as_ptr(), dict) });
    check(ret).map_err(|e| MediaError::encode(format!("open {} encoder", codec.name()), e))?;
    options.ensure_consumed(scope)
}

#[allow(clippy::field_reassign_with_default)]
fn open_video(
    octx: &mut format::context::Output,
    spec: &StreamSpec,
    settings: &OutputSettings,
    global_header: bool,
) -> Result<VideoPath> {
    let StreamParams::Video {
        width,
        height,
        format: input_format,
        aspect_ratio,
        frame_rate,
    } = spec.params
    else {
        return Err(MediaError::setup("Expected a video stream"));
    };

    let codec = encoder::find_by_name(&settings.video_codec).ok_or_else(|| {
        MediaError::setup(format!("Video encoder '{}' not found", settings.video_codec))
    })?;
    let frame_rate = match frame_rate.filter(|r| is_rational_valid(*r)) {
        Some(rate) => rate,
        None => {
            warn!(stream = spec.index, "Unknown input frame rate, assuming 25 fps");
            Rational::new(25, 1)
        }
    };
    let time_base = frame_rate.invert();

    let mut video = codec::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| MediaError::encode("create video encoder", e))?;

    let mut threading_config = threading::Config::default();
    threading_config.count = *NUM_CPUS;
    threading_config.kind = threading::Type::Slice;
    video.set_threading(threading_config);

    let mut flags = codec::Flags::CLOSED_GOP;
    if global_header {
        flags |= codec::Flags::GLOBAL_HEADER;
    }
    video.set_flags(flags);
    video.set_width(width);
    video.set_height(height);
    video.set_aspect_ratio(aspect_ratio);
    video.set_time_base(time_base);
    video.set_frame_rate(Some(frame_rate));
    video.set_max_b_frames(2);
    video.set_gop((f64::from(frame_rate) / 2.0).round().max(1.0) as u32);
    if let Some(bitrate) = settings.video_bitrate {
        video.set_bit_rate(bitrate);
    }

    let (target_format, hw_frames) = match &settings.video_hw_type {
        Some(hw_type) => {
            let device = HwDevice::create(hw_type)?;
            let hw_format = unsafe {
                find_hw_pix_fmt(codec.as_ptr(), device.device_type(), HwMethod::FramesContext)
                    .or_else(|| {
                        find_hw_pix_fmt(codec.as_ptr(), device.device_type(), HwMethod::DeviceContext)
                    })
            }
            .ok_or_else(|| {
                MediaError::setup(format!(
                    "Encoder '{}' does not support {hw_type} devices",
                    settings.video_codec
                ))
            })?;
            let frames = HwFrames::create(device, hw_format, HW_UPLOAD_FORMAT, width, height)?;
            video.set_format(frames.hw_format());
            unsafe {
                (*video.as_mut_ptr()).hw_frames_ctx = frames.new_ref()?;
            }
            (HW_UPLOAD_FORMAT, Some(frames))
        }
        None => {
            let supported: Option<Vec<Pixel>> =
                codec.video().ok().and_then(|v| v.formats()).map(|it| it.collect());
            let format = match supported {
                Some(formats) if !formats.contains(&input_format) => {
                    let first = formats.first().copied().ok_or_else(|| {
                        MediaError::setup(format!(
                            "Encoder '{}' lists no pixel formats",
                            settings.video_codec
                        ))
                    })?;
                    debug!(?input_format, encoder_format = ?first, "Input pixel format not supported by encoder");
                    first
                }
                _ => input_format,
            };
            video.set_format(format);
            (format, None)
        }
    };

    let mut options = Options::from_map(&settings.video_options);
    if matches!(codec.name(), "libx264" | "libx265") {
        options.set_default("preset", "veryfast");
        options.set_default("tune", "zerolatency");
    }
    unsafe { open_encoder(video.as_mut_ptr(), codec, &mut options, "video encoder")? };
    let encoder = encoder::video::Encoder(video);
    let encoder_tb = unsafe { Rational::from((*encoder.as_ptr()).time_base) };

    let mut ost = octx
        .add_stream(codec)
        .map_err(|e| MediaError::encode("add video stream", e))?;
    ost.set_parameters(&encoder);
    ost.set_time_base(encoder_tb);
    let output_index = ost.index();

    debug!(
        codec = codec.name(),
        width,
        height,
        ?target_format,
        ?encoder_tb,
        output_index,
        "Video encoder opened"
    );

    Ok(VideoPath {
        encoder,
        input_index: spec.index,
        output_index,
        input_tb: spec.time_base,
        encoder_tb,
        target: PictureSpec {
            format: target_format,
            width,
            height,
        },
        converter: None,
        hw_frames,
        clock: StreamClock::new(),
        flushable: codec.capabilities().contains(Capabilities::DELAY),
    })
}

fn open_audio(
    octx: &mut format::context::Output,
    spec: &StreamSpec,
    settings: &OutputSettings,
    global_header: bool,
) -> Result<AudioPath> {
    let StreamParams::Audio {
        format: input_format,
        layout,
        rate,
    } = spec.params
    else {
        return Err(MediaError::setup("Expected an audio stream"));
    };

    let codec = encoder::find_by_name(&settings.audio_codec).ok_or_else(|| {
        MediaError::setup(format!("Audio encoder '{}' not found", settings.audio_codec))
    })?;
    let sample_format: Sample = codec
        .audio()
        .ok()
        .and_then(|a| a.formats())
        .and_then(|mut formats| formats.next())
        .unwrap_or(input_format);
    let encoder_tb = Rational::new(1, rate as i32);

    let mut audio = codec::Context::new_with_codec(codec)
        .encoder()
        .audio()
        .map_err(|e| MediaError::encode("create audio encoder", e))?;
    audio.set_rate(rate as i32);
    audio.set_format(sample_format);
    audio.set_time_base(encoder_tb);
    if global_header {
        audio.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    if let Some(bitrate) = settings.audio_bitrate {
        audio.set_bit_rate(bitrate);
    }
    let native = layout.to_native();
    unsafe {
        check(av_channel_layout_copy(&mut (*audio.as_mut_ptr()).ch_layout, &native.0))
            .map_err(|e| MediaError::encode("set encoder channel layout", e))?;
    }

    unsafe { open_encoder(audio.as_mut_ptr(), codec, &mut Options::new(), "audio encoder")? };
    let encoder = encoder::audio::Encoder(audio);

    let capabilities = codec.capabilities();
    let raw_frame_size = unsafe { (*encoder.as_ptr()).frame_size.max(0) as usize };
    let frame_size = if capabilities.contains(Capabilities::VARIABLE_FRAME_SIZE) {
        0
    } else {
        raw_frame_size
    };
    let encoder_layout = unsafe { Layout::from_codec(encoder.as_ptr()) };
    let encoder_spec = AudioSpec {
        format: sample_format,
        layout: encoder_layout,
        rate,
    };
    let resampler = Resampler::new(
        AudioSpec {
            format: input_format,
            layout,
            rate,
        },
        encoder_spec,
    )?;
    let fifo = AudioFifo::new(sample_format, encoder_layout.channels)?;

    let mut ost = octx
        .add_stream(codec)
        .map_err(|e| MediaError::encode("add audio stream", e))?;
    ost.set_parameters(&encoder);
    ost.set_time_base(encoder_tb);
    let output_index = ost.index();

    debug!(
        codec = codec.name(),
        ?sample_format,
        rate,
        channels = encoder_layout.channels,
        frame_size,
        output_index,
        "Audio encoder opened"
    );

    Ok(AudioPath {
        encoder,
        input_index: spec.index,
        output_index,
        input_tb: spec.time_base,
        encoder_tb,
        spec: encoder_spec,
        resampler,
        fifo,
        scratch: None,
        frame_size,
        pad_last_frame: !capabilities.contains(Capabilities::SMALL_LAST_FRAME),
        clock: StreamClock::new(),
        flushable: capabilities.contains(Capabilities::DELAY),
    })
}

fn send_eof(encoder: &mut encoder::Encoder) -> Result<()> {
    match encoder.send_eof() {
        Ok(()) | Err(ffmpeg_next::Error::Eof) => Ok(()),
        Err(error) => Err(MediaError::encode("flush encoder", error)),
    }
}

/// Moves every packet the encoder has ready into the container.
fn write_packets(
    encoder: &mut encoder::Encoder,
    output_index: usize,
    encoder_tb: Rational,
    octx: &mut format::context::Output,
    guards: &mut [DtsGuard],
) -> Result<()> {
    let stream_tb = octx
        .stream(output_index)
        .ok_or_else(|| MediaError::setup(format!("Missing output stream #{output_index}")))?
        .time_base();

    let mut packet = Packet::empty();
    loop {
        match encoder.receive_packet(&mut packet) {
            Ok(()) => {
                trace!(
                    output_index,
                    pts = ?packet.pts(),
                    dts = ?packet.dts(),
                    ?encoder_tb,
                    "Packet from encoder"
                );
                packet.set_stream(output_index);
                packet.rescale_ts(encoder_tb, stream_tb);
                if let Some(guard) = guards.get_mut(output_index) {
                    let (pts, dts) = guard.fix(output_index, packet.pts(), packet.dts());
                    packet.set_pts(pts);
                    packet.set_dts(dts);
                }
                trace!(output_index, pts = ?packet.pts(), dts = ?packet.dts(), ?stream_tb, "Writing packet");
                packet
                    .write_interleaved(octx)
                    .map_err(|e| MediaError::encode("write packet", e))?;
            }
            Err(ffmpeg_next::Error::Eof) => return Ok(()),
            Err(error) if is_again(&error) => return Ok(()),
            Err(error) => return Err(MediaError::encode("receive packet", error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_clears_decoded_picture_type() {
        let mut decoded = frame::Video::new(Pixel::YUV420P, 16, 16);
        decoded.set_kind(picture::Type::B);
        decoded.set_pts(Some(900));

        let mut encoded = new_ref(&decoded).unwrap();
        assert_eq!(encoded.kind(), picture::Type::B);
        stamp_for_encoder(&mut encoded, 3);

        assert_eq!(encoded.kind(), picture::Type::None);
        assert_eq!(encoded.pts(), Some(3));
        // the decoded frame is untouched
        assert_eq!(decoded.kind(), picture::Type::B);
        assert_eq!(decoded.pts(), Some(900));
    }

    #[test]
    fn test_create_without_streams_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = OutputFile::create(&dir.path().join("empty.mkv"), &[], &OutputSettings::default());
        assert!(matches!(result, Err(MediaError::Setup(_))));
    }
}
