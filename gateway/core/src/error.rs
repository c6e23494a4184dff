//! Gateway Errors
//!
//! One error enum for the whole core. Stream failures are also summarized by
//! a `Copy` [`ErrorKind`] so the terminal status of a generation can carry the
//! failure class without owning the error itself.

use thiserror::Error;

use crate::messages::SessionId;

/// Failure class of a generation or request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect, timeout or reset talking to the vendor
    Transport,
    /// Vendor answered with a non-success status
    Upstream,
    /// Vendor stream could not be framed
    Protocol,
    /// A size cap was exceeded
    ResourceExceeded,
    /// The message store rejected a write
    Persistence,
    /// The request itself was refused
    Request,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Transport => "transport",
            Self::Upstream => "upstream",
            Self::Protocol => "protocol",
            Self::ResourceExceeded => "resource_exceeded",
            Self::Persistence => "persistence",
            Self::Request => "request",
        };
        f.write_str(label)
    }
}

/// Errors produced by the gateway core
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection to the vendor failed, timed out or was reset
    #[error("transport error: {0}")]
    Transport(String),

    /// Vendor returned a non-success status
    #[error("upstream returned {status}: {message}")]
    Upstream {
        /// HTTP status code (0 when the error arrived in-stream)
        status: u16,
        /// Vendor-provided error text, if any
        message: String,
    },

    /// Too many consecutive unparseable frames
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A configured size cap was exceeded
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// Final write failed after retry; the content is kept in memory
    #[error("failed to persist message for session {session_id}: {reason}")]
    Persistence {
        /// Session whose write failed
        session_id: SessionId,
        /// Store failure description
        reason: String,
    },

    /// A generation is already in flight for this session
    #[error("session {0} already has a generation in flight")]
    SessionBusy(SessionId),

    /// A previous final write is still waiting to be flushed
    #[error("session {0} has an unsaved response; retry persistence first")]
    PendingWrite(SessionId),

    /// Unknown session id
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// Regeneration target does not resolve to a user message
    #[error("no user message at or before index {0}")]
    InvalidTarget(usize),

    /// Store-level failure (not yet retried)
    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// Failure class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            Self::Persistence { .. } | Self::Store(_) => ErrorKind::Persistence,
            Self::SessionBusy(_)
            | Self::PendingWrite(_)
            | Self::SessionNotFound(_)
            | Self::InvalidTarget(_) => ErrorKind::Request,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result alias used throughout the core
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
