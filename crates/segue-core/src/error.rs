//! Error types for Segue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Segue's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Segue.
#[derive(Error, Debug)]
pub enum Error {
    // Decode errors
    #[error("Codec not supported: {0}")]
    CodecUnsupported(String),

    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    #[error("Storage access failed: {0}")]
    StorageAccessFailure(String),

    // Programming errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Output errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Copyable classification of an [`Error`], carried in events and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CodecUnsupported,
    DecodeFailure,
    StorageAccessFailure,
    InvalidState,
    AudioOutput,
    InvalidArgument,
    Cancelled,
    Internal,
}

impl Error {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CodecUnsupported(_) => ErrorKind::CodecUnsupported,
            Self::DecodeFailure(_) => ErrorKind::DecodeFailure,
            Self::StorageAccessFailure(_) | Self::Io(_) => ErrorKind::StorageAccessFailure,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::AudioOutput(_) => ErrorKind::AudioOutput,
            Self::InvalidArgument(_) | Self::Json(_) => ErrorKind::InvalidArgument,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for programming errors that must not be swallowed.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Returns true if playback of the affected track cannot continue.
    pub const fn is_track_failure(&self) -> bool {
        matches!(
            self,
            Self::CodecUnsupported(_)
                | Self::DecodeFailure(_)
                | Self::StorageAccessFailure(_)
                | Self::Io(_)
        )
    }

    /// Rebuild an error from its kind and rendered message, used when an
    /// error crosses from the decode context to the rendering context.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::CodecUnsupported => Self::CodecUnsupported(message),
            ErrorKind::DecodeFailure => Self::DecodeFailure(message),
            ErrorKind::StorageAccessFailure => Self::StorageAccessFailure(message),
            ErrorKind::InvalidState => Self::InvalidState(message),
            ErrorKind::AudioOutput => Self::AudioOutput(message),
            ErrorKind::InvalidArgument => Self::InvalidArgument(message),
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Internal => Self::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(
            Error::CodecUnsupported("ape".into()).kind(),
            ErrorKind::CodecUnsupported
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(io).kind(), ErrorKind::StorageAccessFailure);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::InvalidState("parallel fill".into()).is_fatal());
        assert!(!Error::DecodeFailure("bad frame".into()).is_fatal());
        assert!(Error::DecodeFailure("bad frame".into()).is_track_failure());
        assert!(!Error::Cancelled.is_track_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::CodecUnsupported("test error".into());
        assert_eq!(err.to_string(), "Codec not supported: test error");
    }

    #[test]
    fn test_from_kind_keeps_message() {
        let err = Error::from_kind(ErrorKind::DecodeFailure, "truncated");
        assert_eq!(err.to_string(), "Decode failed: truncated");
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }
}
