use std::ptr::{NonNull, null_mut};

use ffmpeg_next::ffi::{
    AVSampleFormat, SwrContext, swr_alloc_set_opts2, swr_convert, swr_free, swr_get_out_samples,
    swr_init,
};
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::frame;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use image::RgbImage;
use tracing::debug;

use super::error::{MediaError, Result, check};
use super::frame::{Layout, samples};

/// Geometry and pixel format of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureSpec {
    pub format: Pixel,
    pub width: u32,
    pub height: u32,
}

impl PictureSpec {
    pub fn of(video: &frame::Video) -> Self {
        Self {
            format: video.format(),
            width: video.width(),
            height: video.height(),
        }
    }
}

/// Pixel format and size conversion with fixed endpoints.
pub struct PixelConverter {
    scaler: Scaler,
    src: PictureSpec,
    dst: PictureSpec,
}

// SAFETY: the scaling context is exclusively owned and only used through
// `&mut self`, so moving it to another thread is sound.
unsafe impl Send for PixelConverter {}

impl PixelConverter {
    pub fn new(src: PictureSpec, dst: PictureSpec) -> Result<Self> {
        let scaler = Scaler::get(
            src.format,
            src.width,
            src.height,
            dst.format,
            dst.width,
            dst.height,
            Flags::BILINEAR,
        )
        .map_err(|e| MediaError::decode(format!("create scaler {src:?} -> {dst:?}"), e))?;
        debug!(?src, ?dst, "Pixel converter created");
        Ok(Self { scaler, src, dst })
    }

    pub fn source(&self) -> PictureSpec {
        self.src
    }

    pub fn destination(&self) -> PictureSpec {
        self.dst
    }

    /// Whether `video` matches the source endpoint this converter was built for.
    pub fn accepts(&self, video: &frame::Video) -> bool {
        PictureSpec::of(video) == self.src
    }

    /// Converts into a newly allocated frame carrying the source timestamp.
    pub fn scale(&mut self, video: &frame::Video) -> Result<frame::Video> {
        let mut scaled = frame::Video::new(self.dst.format, self.dst.width, self.dst.height);
        self.scaler
            .run(video, &mut scaled)
            .map_err(|e| MediaError::decode("scale frame", e))?;
        scaled.set_pts(video.pts());
        Ok(scaled)
    }

    /// Converts and copies the picture into a packed row-major RGB buffer.
    pub fn frame_to_host_image(&mut self, video: &frame::Video) -> Result<RgbImage> {
        if self.dst.format != Pixel::RGB24 {
            return Err(MediaError::setup(format!(
                "Host images need RGB24 output, converter produces {:?}",
                self.dst.format
            )));
        }
        let scaled = self.scale(video)?;
        let (width, height) = (self.dst.width as usize, self.dst.height as usize);
        let stride = scaled.stride(0);
        let data = scaled.data(0);
        let row_len = width * 3;
        let mut buffer = Vec::with_capacity(row_len * height);
        for row in 0..height {
            let start = row * stride;
            buffer.extend_from_slice(&data[start..start + row_len]);
        }
        RgbImage::from_raw(self.dst.width, self.dst.height, buffer)
            .ok_or_else(|| MediaError::setup("Converted frame does not fit host image"))
    }
}

/// Sample format, rate and channel layout of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub format: Sample,
    pub layout: Layout,
    pub rate: u32,
}

/// Audio resampler with fixed endpoints.
pub struct Resampler {
    ptr: NonNull<SwrContext>,
    src: AudioSpec,
    dst: AudioSpec,
}

// SAFETY: see `PixelConverter`.
unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(src: AudioSpec, dst: AudioSpec) -> Result<Self> {
        let in_layout = src.layout.to_native();
        let out_layout = dst.layout.to_native();
        let mut ptr = null_mut();
        unsafe {
            check(swr_alloc_set_opts2(
                &mut ptr,
                &out_layout.0,
                AVSampleFormat::from(dst.format),
                dst.rate as i32,
                &in_layout.0,
                AVSampleFormat::from(src.format),
                src.rate as i32,
                0,
                null_mut(),
            ))
            .map_err(|e| MediaError::encode("allocate resampler", e))?;
            if let Err(error) = check(swr_init(ptr)) {
                swr_free(&mut ptr);
                return Err(MediaError::encode("initialise resampler", error));
            }
        }
        let ptr = NonNull::new(ptr).ok_or_else(|| MediaError::setup("Resampler was not allocated"))?;
        debug!(?src, ?dst, "Resampler created");
        Ok(Self { ptr, src, dst })
    }

    pub fn source(&self) -> AudioSpec {
        self.src
    }

    pub fn destination(&self) -> AudioSpec {
        self.dst
    }

    /// Upper bound of output samples produced for `in_samples` more input.
    pub fn out_samples(&self, in_samples: usize) -> usize {
        let count = unsafe { swr_get_out_samples(self.ptr.as_ptr(), in_samples as i32) };
        count.max(0) as usize
    }

    /// Resamples all of `input` into the caller's `output` buffers and returns
    /// the number of samples written. `output` must have room for
    /// [`Resampler::out_samples`] samples.
    pub fn convert(&mut self, input: &frame::Audio, output: &mut frame::Audio) -> Result<usize> {
        let in_count = samples(input) as i32;
        let in_data = unsafe { (*input.as_ptr()).extended_data as *mut *const u8 };
        self.run(in_data, in_count, output)
    }

    /// Drains samples buffered inside the resampler.
    pub fn flush(&mut self, output: &mut frame::Audio) -> Result<usize> {
        self.run(null_mut(), 0, output)
    }

    fn run(
        &mut self,
        in_data: *mut *const u8,
        in_count: i32,
        output: &mut frame::Audio,
    ) -> Result<usize> {
        let capacity = samples(output) as i32;
        let written = unsafe {
            let out_data = (*output.as_mut_ptr()).extended_data;
            swr_convert(self.ptr.as_ptr(), out_data, capacity, in_data, in_count)
        };
        let written = check(written).map_err(|e| MediaError::encode("resample audio", e))?;
        Ok(written as usize)
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        let mut ptr = self.ptr.as_ptr();
        unsafe { swr_free(&mut ptr) }
    }
}
