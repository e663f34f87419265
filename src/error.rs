//! Error types for Mongotape

use std::io;
use thiserror::Error;

/// Result type for Mongotape operations
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Run-level errors.
///
/// Anything returned through this type stops the whole replay. Failures that
/// only affect one operation are reported as [`OpErrorKind`] on its stat
/// record instead.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A wire frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Could not open a connection to the target
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Underlying error
        source: io::Error,
    },

    /// The target rejected the configured credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The replay was cancelled by the caller or a timeout
    #[error("Replay cancelled")]
    Cancelled,

    /// Every lane failed to connect
    #[error("No lane could connect to the target ({attempted} attempted)")]
    NoLaneConnected {
        /// Number of lanes that tried to connect
        attempted: usize,
    },

    /// The operation stream producer failed
    #[error("Operation stream failed: {0}")]
    Stream(String),

    /// A lane task panicked or was aborted
    #[error("Lane task failed: {0}")]
    LaneTask(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Why a single replayed operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpErrorKind {
    /// The recorded frame could not be rewritten for transmission
    MalformedRequest,
    /// Writing the frame to the live connection failed
    Transmit,
    /// No response arrived within the response timeout
    ResponseTimeout,
    /// The response could not be decoded or did not answer the request
    MalformedResponse,
    /// The live connection closed while waiting for a response
    ConnectionClosed,
    /// The server answered with a failure flag (cursor not found, query failure)
    ServerError,
    /// The cursor id had no live binding and the miss policy rejects it
    StaleCursor,
    /// The lane was closed early and did not issue the operation
    LaneAborted,
    /// The replay was cancelled while the operation was in flight
    Cancelled,
}

impl OpErrorKind {
    /// Short name used in logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedRequest => "malformed_request",
            Self::Transmit => "transmit",
            Self::ResponseTimeout => "response_timeout",
            Self::MalformedResponse => "malformed_response",
            Self::ConnectionClosed => "connection_closed",
            Self::ServerError => "server_error",
            Self::StaleCursor => "stale_cursor",
            Self::LaneAborted => "lane_aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReplayError::NoLaneConnected { attempted: 3 };
        assert_eq!(
            err.to_string(),
            "No lane could connect to the target (3 attempted)"
        );
    }

    #[test]
    fn test_op_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&OpErrorKind::ResponseTimeout).unwrap();
        assert_eq!(json, "\"response_timeout\"");
        assert_eq!(OpErrorKind::StaleCursor.to_string(), "stale_cursor");
    }
}
