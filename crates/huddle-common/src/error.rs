//! Common error types for Huddle.

use thiserror::Error;

/// Result type alias using Huddle's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Huddle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local media or peer link could not be set up for a call attempt
    #[error("setup failure: {0}")]
    Setup(String),

    /// A signaling message could not be published or read
    #[error("signaling failure: {0}")]
    Signaling(String),

    /// Shared store rejected a read or write
    #[error("storage error: {0}")]
    Storage(String),

    /// Peer transport reported an error
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation is not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A bounded queue is at capacity
    #[error("queue full: at most {0} entries")]
    QueueFull(usize),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a setup error from any displayable type.
    pub fn setup(msg: impl std::fmt::Display) -> Self {
        Self::Setup(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a storage error from any displayable type.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an invalid state error from any displayable type.
    pub fn invalid_state(msg: impl std::fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a forbidden error from any displayable type.
    pub fn forbidden(msg: impl std::fmt::Display) -> Self {
        Self::Forbidden(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Fatal to a call attempt: media or link could not be established.
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Transport(_))
    }

    /// Fatal to the current handshake step: the store or channel refused.
    pub fn is_signaling_failure(&self) -> bool {
        matches!(self, Self::Signaling(_) | Self::Storage(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert!(Error::setup("camera denied").is_setup_failure());
        assert!(Error::transport("link refused").is_setup_failure());
        assert!(Error::signaling("publish rejected").is_signaling_failure());
        assert!(Error::storage("write rejected").is_signaling_failure());
        assert!(!Error::not_found("call").is_setup_failure());
        assert!(!Error::QueueFull(3).is_signaling_failure());
    }

    #[test]
    fn test_display_includes_category() {
        assert_eq!(
            Error::setup("camera denied").to_string(),
            "setup failure: camera denied"
        );
        assert_eq!(Error::QueueFull(3).to_string(), "queue full: at most 3 entries");
    }
}
