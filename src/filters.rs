//! Frame transforms applied before background subtraction.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::filter::{box_filter, gaussian_blur_f32, median_filter};
use tracing::info;

use crate::config::{PreprocessConfig, Smoothing};

/// A pure image-to-image step. Implementations never mutate their input.
pub trait FrameTransform: Send {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage;
}

pub struct Identity;

impl FrameTransform for Identity {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        frame.clone()
    }
}

/// Scales both dimensions by `factor`, never below one pixel.
pub struct Resize {
    pub factor: f64,
}

impl FrameTransform for Resize {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        let width = ((frame.width() as f64 * self.factor).round() as u32).max(1);
        let height = ((frame.height() as f64 * self.factor).round() as u32).max(1);
        frame.resize_exact(width, height, FilterType::Triangle)
    }
}

pub struct Grayscale;

impl FrameTransform for Grayscale {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        DynamicImage::ImageLuma8(frame.to_luma8())
    }
}

pub struct GaussianBlur {
    pub kernel_size: u32,
    /// Non-positive values derive sigma from the kernel size.
    pub sigma: f64,
}

impl GaussianBlur {
    pub fn effective_sigma(&self) -> f32 {
        if self.sigma > 0.0 {
            self.sigma as f32
        } else {
            let k = self.kernel_size as f64;
            (0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8).max(0.1) as f32
        }
    }
}

impl FrameTransform for GaussianBlur {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        let sigma = self.effective_sigma();
        map_planes(frame, |plane| gaussian_blur_f32(plane, sigma))
    }
}

pub struct Median {
    pub kernel_size: u32,
}

impl FrameTransform for Median {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        let radius = self.kernel_size / 2;
        map_planes(frame, |plane| median_filter(plane, radius, radius))
    }
}

/// Mean over a square window.
pub struct NormalizedBox {
    pub kernel_size: u32,
}

impl FrameTransform for NormalizedBox {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        let radius = self.kernel_size / 2;
        map_planes(frame, |plane| box_filter(plane, radius, radius))
    }
}

/// Applies its transforms in order.
#[derive(Default)]
pub struct TransformChain {
    transforms: Vec<Box<dyn FrameTransform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transform: impl FrameTransform + 'static) {
        self.transforms.push(Box::new(transform));
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl FrameTransform for TransformChain {
    fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        let mut transforms = self.transforms.iter();
        let Some(first) = transforms.next() else {
            return frame.clone();
        };
        transforms.fold(first.apply(frame), |image, transform| transform.apply(&image))
    }
}

/// Builds the preprocessing chain; identity when nothing is configured.
pub fn build(config: &PreprocessConfig) -> Box<dyn FrameTransform> {
    let mut chain = TransformChain::new();
    if let Some(factor) = config.resize_factor {
        info!(factor, "preprocess.resize_factor");
        chain.push(Resize { factor });
    }
    if config.convert_to_gray {
        info!("preprocess.convert_to_gray");
        chain.push(Grayscale);
    }
    match config.smoothing {
        Some(Smoothing::Gaussian { kernel_size, sigma }) => {
            info!(kernel_size, sigma, "preprocess.smoothing = gaussian");
            chain.push(GaussianBlur { kernel_size, sigma });
        }
        Some(Smoothing::Median { kernel_size }) => {
            info!(kernel_size, "preprocess.smoothing = median");
            chain.push(Median { kernel_size });
        }
        Some(Smoothing::NormalizedBox { kernel_size }) => {
            info!(kernel_size, "preprocess.smoothing = normalized_box");
            chain.push(NormalizedBox { kernel_size });
        }
        None => {}
    }

    if chain.is_empty() {
        Box::new(Identity)
    } else {
        Box::new(chain)
    }
}

/// Runs a single-channel filter on every channel of an 8-bit image.
fn map_planes(frame: &DynamicImage, filter: impl Fn(&GrayImage) -> GrayImage) -> DynamicImage {
    if let DynamicImage::ImageLuma8(gray) = frame {
        return DynamicImage::ImageLuma8(filter(gray));
    }
    let rgb = frame.to_rgb8();
    let planes: Vec<GrayImage> = (0..3)
        .map(|channel| {
            let plane = ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
                Luma([rgb.get_pixel(x, y)[channel]])
            });
            filter(&plane)
        })
        .collect();
    let merged = RgbImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        Rgb([
            planes[0].get_pixel(x, y)[0],
            planes[1].get_pixel(x, y)[0],
            planes[2].get_pixel(x, y)[0],
        ])
    });
    DynamicImage::ImageRgb8(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    #[test]
    fn test_empty_config_is_identity() {
        let transform = build(&PreprocessConfig::default());
        let frame = checkerboard(8, 6);
        assert_eq!(transform.apply(&frame), frame);
    }

    #[test]
    fn test_resize_never_collapses() {
        let frame = checkerboard(10, 4);
        let half = Resize { factor: 0.5 }.apply(&frame);
        assert_eq!((half.width(), half.height()), (5, 2));
        let tiny = Resize { factor: 0.01 }.apply(&frame);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }

    #[test]
    fn test_chain_applies_in_order() {
        let config = PreprocessConfig {
            resize_factor: Some(2.0),
            convert_to_gray: true,
            smoothing: Some(Smoothing::NormalizedBox { kernel_size: 3 }),
        };
        let result = build(&config).apply(&checkerboard(4, 4));
        assert_eq!((result.width(), result.height()), (8, 8));
        assert!(matches!(result, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_smoothing_flattens_checkerboard() {
        let frame = checkerboard(16, 16);
        for transform in [
            Box::new(NormalizedBox { kernel_size: 3 }) as Box<dyn FrameTransform>,
            Box::new(GaussianBlur {
                kernel_size: 5,
                sigma: 0.0,
            }),
        ] {
            let smoothed = transform.apply(&frame).to_rgb8();
            let center = smoothed.get_pixel(8, 8)[0];
            assert!((60..=200).contains(&center), "center value {center}");
        }
    }

    #[test]
    fn test_median_removes_salt_noise() {
        let mut gray = GrayImage::new(9, 9);
        gray.put_pixel(4, 4, Luma([255]));
        let filtered = Median { kernel_size: 3 }.apply(&DynamicImage::ImageLuma8(gray));
        assert_eq!(filtered.to_luma8().get_pixel(4, 4)[0], 0);
    }

    #[test]
    fn test_gaussian_sigma_from_kernel() {
        let blur = GaussianBlur {
            kernel_size: 3,
            sigma: 0.0,
        };
        assert!((blur.effective_sigma() - 0.8).abs() < 1e-6);
        let explicit = GaussianBlur {
            kernel_size: 3,
            sigma: 2.0,
        };
        assert_eq!(explicit.effective_sigma(), 2.0);
    }
}
