use std::mem;

use ffmpeg_next::ffi::{
    AVChannelLayout, AVChannelOrder, AVCodecContext, AVSampleFormat, av_channel_layout_default,
    av_channel_layout_from_mask, av_channel_layout_uninit, av_frame_get_buffer, av_frame_ref,
};
use ffmpeg_next::format::Sample;
use ffmpeg_next::frame;

use super::error::{MediaError, Result, check};

/// Plain-data description of an audio channel layout.
///
/// `mask` is zero when the layout is unspecified and the default order for
/// `channels` should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub channels: u16,
    pub mask: u64,
}

impl Layout {
    pub fn default_for(channels: u16) -> Self {
        Self { channels, mask: 0 }
    }

    /// Reads the layout a codec context negotiated.
    ///
    /// # Safety
    /// `ctx` must point to a valid codec context.
    pub(crate) unsafe fn from_codec(ctx: *const AVCodecContext) -> Self {
        unsafe {
            let layout = &(*ctx).ch_layout;
            let channels = layout.nb_channels.max(0) as u16;
            let mask = if layout.order == AVChannelOrder::AV_CHANNEL_ORDER_NATIVE {
                layout.u.mask
            } else {
                0
            };
            Self { channels, mask }
        }
    }

    /// Builds the native layout, falling back to the default order when the
    /// mask is missing or disagrees with the channel count.
    pub(crate) fn to_native(self) -> NativeLayout {
        // SAFETY: a zeroed AVChannelLayout is the documented "unspecified" state.
        unsafe {
            let mut layout: AVChannelLayout = mem::zeroed();
            if self.mask != 0
                && av_channel_layout_from_mask(&mut layout, self.mask) == 0
                && layout.nb_channels == self.channels as i32
            {
                return NativeLayout(layout);
            }
            av_channel_layout_uninit(&mut layout);
            av_channel_layout_default(&mut layout, self.channels as i32);
            NativeLayout(layout)
        }
    }
}

/// Owned native channel layout, uninitialised on drop.
pub(crate) struct NativeLayout(pub(crate) AVChannelLayout);

impl Drop for NativeLayout {
    fn drop(&mut self) {
        unsafe { av_channel_layout_uninit(&mut self.0) }
    }
}

/// Allocates an audio frame with buffers for `nb_samples` samples.
pub fn alloc_audio_frame(
    format: Sample,
    layout: Layout,
    rate: u32,
    nb_samples: usize,
) -> Result<frame::Audio> {
    if nb_samples == 0 {
        return Err(MediaError::setup("Audio frame must hold at least one sample"));
    }
    let mut audio = frame::Audio::empty();
    let native = layout.to_native();
    // SAFETY: the frame is freshly allocated and exclusively owned here.
    unsafe {
        let ptr = audio.as_mut_ptr();
        (*ptr).format = AVSampleFormat::from(format) as i32;
        (*ptr).nb_samples = nb_samples as i32;
        (*ptr).sample_rate = rate as i32;
        check(ffmpeg_next::ffi::av_channel_layout_copy(
            &mut (*ptr).ch_layout,
            &native.0,
        ))
        .map_err(|e| MediaError::encode("copy channel layout", e))?;
        check(av_frame_get_buffer(ptr, 0))
            .map_err(|e| MediaError::encode("allocate audio frame", e))?;
    }
    Ok(audio)
}

/// New reference to the buffers of `video`, so its timestamp can be changed
/// without copying pixels.
pub fn new_ref(video: &frame::Video) -> Result<frame::Video> {
    let mut copy = frame::Video::empty();
    check(unsafe { av_frame_ref(copy.as_mut_ptr(), video.as_ptr()) })
        .map_err(|e| MediaError::encode("reference frame", e))?;
    Ok(copy)
}

/// Number of samples stored in an audio frame.
pub fn samples(audio: &frame::Audio) -> usize {
    unsafe { (*audio.as_ptr()).nb_samples.max(0) as usize }
}
