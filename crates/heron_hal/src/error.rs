//! Hardware Layer Error Types

use thiserror::Error;

/// Errors from hardware stream operations
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Hardware not initialized")]
    NotInitialized,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported stream profile: {0}")]
    UnsupportedProfile(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Stream write failed: {0}")]
    WriteFailed(String),

    #[error("Stream read failed: {0}")]
    ReadFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Stream is suspended")]
    Suspended,
}

/// Result type alias for hardware operations
pub type HalResult<T> = Result<T, HalError>;
