use std::{io, result};

/// Result type of every media engine call.
pub type Result<T, E = MediaError> = result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum MediaError {
    /// Construction-time failure: missing stream, codec not found, bad configuration.
    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Unsupported {scope} options: {}", keys.join(", "))]
    UnsupportedOptions { scope: &'static str, keys: Vec<String> },

    #[error("Hardware device type '{name}' is not supported. Available types: [{}]", available.join(", "))]
    HwDeviceNotSupported { name: String, available: Vec<String> },

    #[error("Source exhausted")]
    SourceExhausted,

    #[error("Decode error ({context}): {source}")]
    Decode {
        context: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("Encode error ({context}): {source}")]
    Encode {
        context: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MediaError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    pub fn decode(context: impl Into<String>, source: impl Into<ffmpeg_next::Error>) -> Self {
        Self::Decode {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn encode(context: impl Into<String>, source: impl Into<ffmpeg_next::Error>) -> Self {
        Self::Encode {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Whether the error signals end of input rather than a failure.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::SourceExhausted)
    }
}

/// Maps a negative native return code into `Err`, leaving non-negative codes untouched.
pub(crate) fn check(ret: i32) -> result::Result<i32, ffmpeg_next::Error> {
    if ret < 0 {
        Err(ffmpeg_next::Error::from(ret))
    } else {
        Ok(ret)
    }
}

/// True for the "try again" condition every send/receive loop absorbs.
pub(crate) fn is_again(error: &ffmpeg_next::Error) -> bool {
    matches!(error, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}
