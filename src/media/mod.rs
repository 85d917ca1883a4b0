//! Demux/decode and encode/mux engines built on ffmpeg.
//!
//! Every native handle is owned by exactly one wrapper and released in its
//! `Drop`. Hardware device and frame contexts are shared through `Arc` so
//! they outlive the codec contexts referencing them.

pub mod convert;
pub mod error;
pub mod fifo;
pub mod frame;
pub mod hw;
pub mod input;
pub mod options;
pub mod output;
pub mod timestamp;

use std::sync::OnceLock;

use ffmpeg_next::util::log;
use tracing::{debug, error};

pub use convert::{AudioSpec, PictureSpec, PixelConverter, Resampler};
pub use error::{MediaError, Result};
pub use fifo::AudioFifo;
pub use input::{Input, InputHandle, SourceDescriptor, StreamKind, StreamSpec};
pub use options::Options;
pub use output::{OutputFile, OutputSettings};

static INIT: OnceLock<()> = OnceLock::new();

/// Registers codecs and capture devices once per process.
///
/// Safe to call from any thread any number of times.
pub fn init() {
    INIT.get_or_init(|| {
        if let Err(error) = ffmpeg_next::init() {
            error!(?error, "Failed to initialise ffmpeg");
        }
        debug!("ffmpeg initialised");
    });
}

/// Sets the verbosity of ffmpeg's own logging, initialising it first.
pub fn init_with_log_level(level: log::Level) {
    init();
    log::set_level(level);
}
