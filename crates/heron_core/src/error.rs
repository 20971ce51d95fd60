//! Server Error Types
//!
//! Errors cross the client API boundary; the real-time threads never
//! return them upward; they degrade (silence, retry, standby) instead.

use thiserror::Error;

/// Errors surfaced to clients of the audio server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Audio hardware not initialized")]
    NotInitialized,

    #[error("Out of shared memory: {0}")]
    NoMemory(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("No such endpoint or track: {0}")]
    BadIndex(u32),

    #[error("Hardware error: {0}")]
    Hal(#[from] heron_hal::HalError),

    #[error("Mixer error: {0}")]
    Mix(#[from] heron_mix::MixError),
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;
