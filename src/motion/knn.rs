use image::{DynamicImage, GrayImage};
use tracing::debug;

use super::{BackgroundSubtractor, FOREGROUND, SHADOW, Samples, distance2, is_shadow};

/// Background samples kept per pixel.
const SAMPLES: usize = 7;
/// Close samples needed to call a pixel background.
const K: usize = 2;

/// Sample-based subtractor: a pixel is background when at least [`K`] of its
/// stored samples lie within the squared distance threshold.
pub struct Knn {
    history: usize,
    dist2_threshold: f32,
    detect_shadows: bool,
    shape: (u32, u32, usize),
    /// `SAMPLES` background values per pixel, each `channels` wide.
    model: Vec<f32>,
    frames: usize,
}

impl Knn {
    pub fn new(history: usize, dist2_threshold: f32, detect_shadows: bool) -> Self {
        Self {
            history: history.max(1),
            dist2_threshold,
            detect_shadows,
            shape: (0, 0, 0),
            model: Vec::new(),
            frames: 0,
        }
    }

    /// Frames between two sample replacements, so the ring covers `history`.
    fn update_interval(&self) -> usize {
        (self.history / SAMPLES).max(1)
    }

    fn reset(&mut self, samples: &Samples<'_>) {
        debug!(shape = ?samples.shape(), "KNN model initialised");
        self.shape = samples.shape();
        self.model = samples
            .pixels()
            .flat_map(|pixel| {
                std::iter::repeat_n(pixel, SAMPLES).flat_map(|p| p.iter().map(|&v| v as f32))
            })
            .collect();
        self.frames = 1;
    }
}

impl BackgroundSubtractor for Knn {
    fn apply(&mut self, frame: &DynamicImage) -> GrayImage {
        let samples = Samples::of(frame);
        let mut mask = GrayImage::new(samples.width, samples.height);
        if samples.shape() != self.shape {
            self.reset(&samples);
            return mask;
        }

        let channels = self.shape.2;
        let stride = SAMPLES * channels;
        let replace = (self.frames % self.update_interval() == 0)
            .then(|| (self.frames / self.update_interval()) % SAMPLES);

        for ((pixel, model), out) in samples
            .pixels()
            .zip(self.model.chunks_exact_mut(stride))
            .zip(mask.iter_mut())
        {
            let close = model
                .chunks_exact(channels)
                .filter(|sample| distance2(pixel, sample) < self.dist2_threshold)
                .take(K)
                .count();
            *out = if close >= K {
                0
            } else if self.detect_shadows
                && model
                    .chunks_exact(channels)
                    .filter(|sample| is_shadow(pixel, sample, self.dist2_threshold))
                    .take(K)
                    .count()
                    >= K
            {
                SHADOW
            } else {
                FOREGROUND
            };

            if let Some(slot) = replace {
                for (stored, &value) in model[slot * channels..(slot + 1) * channels]
                    .iter_mut()
                    .zip(pixel)
                {
                    *stored = value as f32;
                }
            }
        }

        self.frames += 1;
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame_with_square(size: u32, square: Option<(u32, u32)>) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(size, size, |x, y| match square {
            Some((x0, y0)) if (x0..x0 + 4).contains(&x) && (y0..y0 + 4).contains(&y) => {
                Rgb([250, 250, 250])
            }
            _ => Rgb([20, 40, 60]),
        }))
    }

    #[test]
    fn test_static_scene_is_background() {
        let mut knn = Knn::new(500, 400.0, true);
        for _ in 0..5 {
            let mask = knn.apply(&frame_with_square(16, None));
            assert!(mask.iter().all(|&v| v == 0));
        }
    }

    #[test]
    fn test_new_object_is_foreground() {
        let mut knn = Knn::new(500, 400.0, false);
        knn.apply(&frame_with_square(16, None));
        knn.apply(&frame_with_square(16, None));
        let mask = knn.apply(&frame_with_square(16, Some((4, 4))));
        assert_eq!(mask.iter().filter(|&&v| v == FOREGROUND).count(), 16);
        assert_eq!(mask.get_pixel(5, 5)[0], FOREGROUND);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_object_is_absorbed_into_background() {
        let mut knn = Knn::new(SAMPLES * 2, 400.0, false);
        knn.apply(&frame_with_square(8, None));
        let moved = frame_with_square(8, Some((2, 2)));
        let mut last = 0;
        for _ in 0..SAMPLES * 2 * 3 {
            last = knn.apply(&moved).iter().filter(|&&v| v != 0).count();
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn test_grayscale_frames() {
        let mut knn = Knn::new(500, 400.0, true);
        let dark = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, image::Luma([10])));
        let bright = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, image::Luma([200])));
        knn.apply(&dark);
        assert_eq!(knn.apply(&bright).iter().filter(|&&v| v == FOREGROUND).count(), 16);
    }

    #[test]
    fn test_size_change_resets_model() {
        let mut knn = Knn::new(500, 400.0, true);
        knn.apply(&frame_with_square(8, None));
        let mask = knn.apply(&frame_with_square(16, Some((0, 0))));
        assert_eq!(mask.dimensions(), (16, 16));
        assert!(mask.iter().all(|&v| v == 0));
    }
}
