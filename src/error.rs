//! Error types for pgwire-logical.
//!
//! All errors in this crate are represented by [`PgWireError`], which covers:
//! - I/O errors on the transport
//! - Framing errors (short buffers, unknown message tags)
//! - Protocol violations (invalid lengths, truncated streams)
//! - Server errors (PostgreSQL `ErrorResponse` messages)
//! - Authentication requests this client cannot answer
//! - Task errors (worker panics, unexpected termination)

use thiserror::Error;

use crate::protocol::messages::ErrorResponse;

/// Error type for all pgwire-logical operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PgWireError {
    /// Transport error (connect refused, reset, timed out).
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// The buffer ends before the frame it declares.
    ///
    /// This is a "need more bytes" signal, not corruption: callers append the
    /// next read and decode again.
    #[error("malformed frame: need {needed} bytes, {available} buffered")]
    MalformedFrame { needed: usize, available: usize },

    /// Backend frame with a tag this client does not understand.
    #[error("unknown frame type: 0x{0:02x} ('{}')", tag_char(.0))]
    UnknownFrameType(u8),

    /// CopyData payload whose leading byte is neither `'w'` nor `'k'`.
    #[error("unknown CopyData payload: 0x{0:02x} ('{}')", tag_char(.0))]
    UnknownCopyPayload(u8),

    /// Protocol violation - invalid length, truncated stream, short sub-message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the startup packet.
    #[error("startup rejected: {0}")]
    StartupRejected(ErrorResponse),

    /// The server rejected `START_REPLICATION` (e.g. the slot does not exist).
    #[error("replication start rejected: {0}")]
    ReplicationStartRejected(ErrorResponse),

    /// The server asked for credentials; only trust authentication is supported.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The server reported an error while streaming.
    #[error("server error: {0}")]
    Server(ErrorResponse),

    /// Task error - worker panicked or terminated unexpectedly.
    #[error("task error: {0}")]
    Task(String),
}

impl PgWireError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, PgWireError::Io(_))
    }

    /// Returns `true` if the error only means more bytes are needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, PgWireError::MalformedFrame { .. })
    }

    /// Returns `true` for any error carrying a server `ErrorResponse`.
    #[inline]
    pub fn is_server(&self) -> bool {
        self.server_error().is_some()
    }

    /// Returns `true` if this is an authentication error.
    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, PgWireError::Auth(_))
    }

    /// The server-reported error behind this failure, if any.
    pub fn server_error(&self) -> Option<&ErrorResponse> {
        match self {
            PgWireError::Server(e)
            | PgWireError::StartupRejected(e)
            | PgWireError::ReplicationStartRejected(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if this error is likely transient and retryable.
    ///
    /// Transient errors include I/O errors and task errors. Reconnecting is
    /// left to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, PgWireError::Io(_) | PgWireError::Task(_))
    }
}

fn tag_char(tag: &u8) -> char {
    char::from(*tag)
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for PgWireError {
    fn from(err: std::io::Error) -> Self {
        PgWireError::Io(err.to_string())
    }
}

/// Result type alias for pgwire-logical operations.
pub type Result<T> = std::result::Result<T, PgWireError>;
