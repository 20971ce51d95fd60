//! Mix Pipeline Error Types

use thiserror::Error;

/// Errors from the mixer and its buffer providers
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MixError {
    /// The provider has no frames; the caller must substitute silence.
    #[error("not enough data")]
    NotEnoughData,

    #[error("invalid track name: {0}")]
    InvalidName(usize),

    #[error("track name {0} is not allocated")]
    NameNotAllocated(usize),

    #[error("unsupported sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("unsupported channel count: {0}")]
    InvalidChannelCount(u16),
}

/// Result type alias for mixer operations
pub type MixResult<T> = Result<T, MixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(MixError::NotEnoughData.to_string().contains("not enough"));
        assert!(MixError::InvalidSampleRate(99_000)
            .to_string()
            .contains("99000"));
    }
}
