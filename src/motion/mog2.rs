use image::{DynamicImage, GrayImage};
use tracing::debug;

use super::{BackgroundSubtractor, FOREGROUND, SHADOW, Samples, distance2, is_shadow};

const INITIAL_VARIANCE: f32 = 15.0 * 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 5.0 * INITIAL_VARIANCE;

/// Running-gaussian subtractor: each pixel keeps a mean colour and one
/// variance, and is foreground when its squared deviation exceeds
/// `var_threshold` variances.
pub struct Mog2 {
    history: usize,
    var_threshold: f32,
    detect_shadows: bool,
    shape: (u32, u32, usize),
    means: Vec<f32>,
    variances: Vec<f32>,
    frames: usize,
}

impl Mog2 {
    pub fn new(history: usize, var_threshold: f32, detect_shadows: bool) -> Self {
        Self {
            history: history.max(1),
            var_threshold,
            detect_shadows,
            shape: (0, 0, 0),
            means: Vec::new(),
            variances: Vec::new(),
            frames: 0,
        }
    }

    fn learning_rate(&self) -> f32 {
        1.0 / self.frames.clamp(1, self.history) as f32
    }

    fn reset(&mut self, samples: &Samples<'_>) {
        debug!(shape = ?samples.shape(), "MOG2 model initialised");
        self.shape = samples.shape();
        self.means = samples.data.iter().map(|&v| v as f32).collect();
        self.variances = vec![INITIAL_VARIANCE; (samples.width * samples.height) as usize];
        self.frames = 1;
    }
}

impl BackgroundSubtractor for Mog2 {
    fn apply(&mut self, frame: &DynamicImage) -> GrayImage {
        let samples = Samples::of(frame);
        let mut mask = GrayImage::new(samples.width, samples.height);
        if samples.shape() != self.shape {
            self.reset(&samples);
            return mask;
        }

        self.frames += 1;
        let alpha = self.learning_rate();
        let channels = self.shape.2;

        for (((pixel, mean), variance), out) in samples
            .pixels()
            .zip(self.means.chunks_exact_mut(channels))
            .zip(self.variances.iter_mut())
            .zip(mask.iter_mut())
        {
            let d2 = distance2(pixel, mean);
            let threshold = self.var_threshold * *variance;
            *out = if d2 <= threshold {
                0
            } else if self.detect_shadows && is_shadow(pixel, mean, threshold) {
                SHADOW
            } else {
                FOREGROUND
            };

            for (m, &p) in mean.iter_mut().zip(pixel) {
                *m += alpha * (p as f32 - *m);
            }
            *variance = (*variance + alpha * (d2 / channels as f32 - *variance))
                .clamp(MIN_VARIANCE, MAX_VARIANCE);
        }

        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn test_static_scene_is_background() {
        let mut mog2 = Mog2::new(500, 16.0, true);
        let frame = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([90, 120, 30])));
        for _ in 0..5 {
            assert!(mog2.apply(&frame).iter().all(|&v| v == 0));
        }
    }

    #[test]
    fn test_bright_object_is_foreground() {
        let mut mog2 = Mog2::new(500, 16.0, true);
        let background = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([30])));
        for _ in 0..10 {
            mog2.apply(&background);
        }
        let mut with_object = GrayImage::from_pixel(8, 8, Luma([30]));
        with_object.put_pixel(3, 3, Luma([230]));
        let mask = mog2.apply(&DynamicImage::ImageLuma8(with_object));
        assert_eq!(mask.get_pixel(3, 3)[0], FOREGROUND);
        assert_eq!(mask.iter().filter(|&&v| v != 0).count(), 1);
    }

    #[test]
    fn test_darker_pixel_is_shadow() {
        let mut mog2 = Mog2::new(500, 16.0, true);
        let background = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([200, 160, 120])));
        for _ in 0..10 {
            mog2.apply(&background);
        }
        let mut shaded = RgbImage::from_pixel(4, 4, Rgb([200, 160, 120]));
        shaded.put_pixel(1, 1, Rgb([120, 96, 72]));
        let mask = mog2.apply(&DynamicImage::ImageRgb8(shaded));
        assert_eq!(mask.get_pixel(1, 1)[0], SHADOW);
    }

    #[test]
    fn test_learning_rate_follows_history() {
        let mut mog2 = Mog2::new(4, 16.0, false);
        let frame = DynamicImage::ImageLuma8(GrayImage::new(2, 2));
        mog2.apply(&frame);
        assert_eq!(mog2.learning_rate(), 1.0);
        for _ in 0..10 {
            mog2.apply(&frame);
        }
        assert_eq!(mog2.learning_rate(), 0.25);
    }
}
