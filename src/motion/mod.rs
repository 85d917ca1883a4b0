//! Background subtraction and the published motion snapshot.

mod knn;
mod mog2;

pub use knn::Knn;
pub use mog2::Mog2;

use std::borrow::Cow;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, RgbImage};
use parking_lot::RwLock;
use tracing::info;

use crate::config::{Algorithm, BackgroundSubtractorConfig};

/// Mask value of a moving pixel.
pub const FOREGROUND: u8 = 255;
/// Mask value of a pixel that looks like a shadow of the background.
pub const SHADOW: u8 = 127;

/// Lower bound of the brightness ratio a shadow may have.
const SHADOW_TAU: f32 = 0.5;

/// Turns each frame into a foreground mask of the same size.
pub trait BackgroundSubtractor: Send {
    fn apply(&mut self, frame: &DynamicImage) -> GrayImage;
}

pub fn build(config: &BackgroundSubtractorConfig) -> Box<dyn BackgroundSubtractor> {
    match config.algorithm {
        Algorithm::Knn => {
            info!(
                history = config.history,
                dist_2_threshold = config.dist_2_threshold,
                detect_shadows = config.detect_shadows,
                "Using KNN background subtractor"
            );
            Box::new(Knn::new(
                config.history,
                config.dist_2_threshold as f32,
                config.detect_shadows,
            ))
        }
        Algorithm::Mog2 => {
            info!(
                history = config.history,
                var_threshold = config.var_threshold,
                detect_shadows = config.detect_shadows,
                "Using MOG2 background subtractor"
            );
            Box::new(Mog2::new(
                config.history,
                config.var_threshold as f32,
                config.detect_shadows,
            ))
        }
    }
}

/// Interleaved 8-bit samples of a frame, one or three channels per pixel.
struct Samples<'a> {
    width: u32,
    height: u32,
    channels: usize,
    data: Cow<'a, [u8]>,
}

impl<'a> Samples<'a> {
    fn of(frame: &'a DynamicImage) -> Self {
        let (channels, data) = match frame {
            DynamicImage::ImageLuma8(gray) => (1, Cow::Borrowed(gray.as_raw().as_slice())),
            DynamicImage::ImageRgb8(rgb) => (3, Cow::Borrowed(rgb.as_raw().as_slice())),
            other => (3, Cow::Owned(other.to_rgb8().into_raw())),
        };
        Self {
            width: frame.width(),
            height: frame.height(),
            channels,
            data,
        }
    }

    fn pixels(&self) -> std::slice::ChunksExact<'_, u8> {
        self.data.chunks_exact(self.channels)
    }

    fn shape(&self) -> (u32, u32, usize) {
        (self.width, self.height, self.channels)
    }
}

/// Squared distance between a pixel and a background value.
fn distance2(pixel: &[u8], background: &[f32]) -> f32 {
    pixel
        .iter()
        .zip(background)
        .map(|(&p, &b)| {
            let d = p as f32 - b;
            d * d
        })
        .sum()
}

/// Whether `pixel` is a darker version of `background` within `threshold`
/// squared distance, scaled to the brightness ratio.
fn is_shadow(pixel: &[u8], background: &[f32], threshold: f32) -> bool {
    let mut dot = 0.0;
    let mut norm = 0.0;
    for (&p, &b) in pixel.iter().zip(background) {
        dot += p as f32 * b;
        norm += b * b;
    }
    if norm <= f32::EPSILON {
        return false;
    }
    let ratio = dot / norm;
    if !(SHADOW_TAU..=1.0).contains(&ratio) {
        return false;
    }
    let residual: f32 = pixel
        .iter()
        .zip(background)
        .map(|(&p, &b)| {
            let d = p as f32 - ratio * b;
            d * d
        })
        .sum();
    residual < threshold * ratio * ratio
}

/// The latest analysed frame with its foreground mask.
#[derive(Debug, Clone)]
pub struct MotionSnapshot {
    frame: RgbImage,
    mask: GrayImage,
    moving_area: u64,
}

impl MotionSnapshot {
    pub fn new(frame: RgbImage, mask: GrayImage) -> Self {
        let moving_area = count_nonzero(&mask);
        Self {
            frame,
            mask,
            moving_area,
        }
    }

    pub fn frame(&self) -> &RgbImage {
        &self.frame
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Number of non-zero mask pixels.
    pub fn moving_area(&self) -> u64 {
        self.moving_area
    }
}

fn count_nonzero(mask: &GrayImage) -> u64 {
    mask.as_raw().iter().filter(|&&v| v != 0).count() as u64
}

/// Shared slot holding the latest [`MotionSnapshot`].
///
/// Snapshots are replaced whole; a reader keeps the `Arc` it got even if a
/// newer snapshot is published meanwhile.
#[derive(Debug, Default)]
pub struct MotionData {
    latest: RwLock<Option<Arc<MotionSnapshot>>>,
}

impl MotionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: MotionSnapshot) {
        let snapshot = Arc::new(snapshot);
        let previous = self.latest.write().replace(snapshot);
        drop(previous);
    }

    pub fn read(&self) -> Option<Arc<MotionSnapshot>> {
        self.latest.read().clone()
    }

    pub fn moving_area(&self) -> u64 {
        self.latest
            .read()
            .as_ref()
            .map_or(0, |snapshot| snapshot.moving_area())
    }
}
