//! Error types for forkpool.

use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("System error: {0}")]
    Sys(#[from] nix::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel peer hung up")]
    Disconnected,

    #[error("Short {direction} on channel: {actual} of {expected} bytes")]
    ShortTransfer {
        direction: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Fork failed: {0}")]
    Fork(nix::Error),

    #[error("Frame of {0} bytes exceeds the channel limit")]
    FrameTooLarge(usize),
}

impl PoolError {
    /// Short write helper used by the frame codec.
    pub(crate) fn short_write(expected: usize, actual: usize) -> Self {
        Self::ShortTransfer {
            direction: "write",
            expected,
            actual,
        }
    }

    /// Short read helper used by the frame codec.
    pub(crate) fn short_read(expected: usize, actual: usize) -> Self {
        Self::ShortTransfer {
            direction: "read",
            expected,
            actual,
        }
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
