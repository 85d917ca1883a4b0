use std::ffi::c_void;
use std::ptr::NonNull;

use ffmpeg_next::ffi::{
    AVAudioFifo, AVSampleFormat, av_audio_fifo_alloc, av_audio_fifo_free, av_audio_fifo_read,
    av_audio_fifo_size, av_audio_fifo_write,
};
use ffmpeg_next::format::Sample;
use ffmpeg_next::frame;

use super::error::{MediaError, Result, check};
use super::frame::samples;

/// Growable queue of audio samples in one fixed sample format.
pub struct AudioFifo {
    ptr: NonNull<AVAudioFifo>,
    format: Sample,
    channels: u16,
}

// SAFETY: the FIFO is exclusively owned and only touched through `&mut self`.
unsafe impl Send for AudioFifo {}

impl AudioFifo {
    pub fn new(format: Sample, channels: u16) -> Result<Self> {
        let ptr = unsafe { av_audio_fifo_alloc(AVSampleFormat::from(format), channels as i32, 1) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| MediaError::setup("Could not allocate audio FIFO"))?;
        Ok(Self {
            ptr,
            format,
            channels,
        })
    }

    pub fn format(&self) -> Sample {
        self.format
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel currently queued.
    pub fn len(&self) -> usize {
        unsafe { av_audio_fifo_size(self.ptr.as_ptr()).max(0) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the first `nb_samples` samples of `audio`.
    pub fn push(&mut self, audio: &frame::Audio, nb_samples: usize) -> Result<()> {
        if nb_samples == 0 {
            return Ok(());
        }
        if nb_samples > samples(audio) {
            return Err(MediaError::setup(format!(
                "Cannot queue {nb_samples} samples from a frame holding {}",
                samples(audio)
            )));
        }
        let written = unsafe {
            let data = (*audio.as_ptr()).extended_data as *mut *mut c_void;
            av_audio_fifo_write(self.ptr.as_ptr(), data, nb_samples as i32)
        };
        let written = check(written).map_err(|e| MediaError::encode("write audio FIFO", e))?;
        if written as usize != nb_samples {
            return Err(MediaError::setup(format!(
                "Audio FIFO accepted {written} of {nb_samples} samples"
            )));
        }
        Ok(())
    }

    /// Moves up to `nb_samples` samples into `audio`, returning how many were read.
    ///
    /// `audio` must have buffers for at least `nb_samples` samples.
    pub fn pop_into(&mut self, audio: &mut frame::Audio, nb_samples: usize) -> Result<usize> {
        let wanted = nb_samples.min(self.len()).min(samples(audio));
        if wanted == 0 {
            return Ok(0);
        }
        let read = unsafe {
            let data = (*audio.as_mut_ptr()).extended_data as *mut *mut c_void;
            av_audio_fifo_read(self.ptr.as_ptr(), data, wanted as i32)
        };
        let read = check(read).map_err(|e| MediaError::encode("read audio FIFO", e))?;
        Ok(read as usize)
    }
}

impl Drop for AudioFifo {
    fn drop(&mut self) {
        unsafe { av_audio_fifo_free(self.ptr.as_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::{Layout, alloc_audio_frame};
    use ffmpeg_next::format::sample::Type;

    const FORMAT: Sample = Sample::I16(Type::Packed);

    fn filled_frame(values: std::ops::Range<i16>) -> frame::Audio {
        let len = values.len();
        let mut audio = alloc_audio_frame(FORMAT, Layout::default_for(1), 8000, len).unwrap();
        let plane = audio.data_mut(0);
        for (i, value) in values.enumerate() {
            plane[i * 2..i * 2 + 2].copy_from_slice(&value.to_ne_bytes());
        }
        audio
    }

    fn read_values(audio: &frame::Audio, count: usize) -> Vec<i16> {
        let plane = audio.data(0);
        (0..count)
            .map(|i| i16::from_ne_bytes([plane[i * 2], plane[i * 2 + 1]]))
            .collect()
    }

    #[test]
    fn test_chunked_writes_drain_in_order_without_loss() {
        let mut fifo = AudioFifo::new(FORMAT, 1).unwrap();
        let chunks = [0..100i16, 100..800, 800..1133];
        for chunk in chunks {
            let audio = filled_frame(chunk.clone());
            fifo.push(&audio, chunk.len()).unwrap();
        }
        assert_eq!(fifo.len(), 1133);

        let frame_size = 256;
        let mut out = alloc_audio_frame(FORMAT, Layout::default_for(1), 8000, frame_size).unwrap();
        let mut drained = Vec::new();
        while fifo.len() >= frame_size {
            let read = fifo.pop_into(&mut out, frame_size).unwrap();
            assert_eq!(read, frame_size);
            drained.extend(read_values(&out, read));
        }
        assert!(fifo.len() < frame_size);

        let residual = fifo.len();
        let read = fifo.pop_into(&mut out, frame_size).unwrap();
        assert_eq!(read, residual);
        drained.extend(read_values(&out, read));

        assert!(fifo.is_empty());
        assert_eq!(drained, (0..1133).collect::<Vec<i16>>());
    }

    #[test]
    fn test_push_rejects_more_than_frame_holds() {
        let mut fifo = AudioFifo::new(FORMAT, 1).unwrap();
        let audio = filled_frame(0..10);
        assert!(fifo.push(&audio, 11).is_err());
        assert!(fifo.push(&audio, 0).is_ok());
        assert!(fifo.is_empty());
    }
}
