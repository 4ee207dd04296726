//! Error types for pwmplay
//!
//! Defines module-specific error types using thiserror for clear error propagation.
//!
//! Transient conditions are deliberately *not* errors: a decoder returning zero
//! frames is retried under a bound, and output underruns are padded and counted
//! rather than surfaced here.

use thiserror::Error;

/// Main error type for the pwmplay crate
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pin, sample rate, or timing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation called from the wrong playback state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Ring buffer or scratch buffer allocation failure
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Fatal decoder errors (open failure, unsupported stream)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// PWM/DMA output engine errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the pwmplay Error
pub type Result<T> = std::result::Result<T, Error>;
