//! # Error Taxonomy
//!
//! Every component contract in the daemon reports failure through one closed
//! enumeration. Callers match on [`ErrorKind`] exhaustively rather than
//! inspecting message text.
//!
//! | Kind | Meaning | Typical caller reaction |
//! |------|---------|-------------------------|
//! | `NotFound` | Unknown UUID, generation, or key piece | Caller decides |
//! | `InvalidArgument` | Bad password, malformed request | Rejected, nothing applied |
//! | `Transport` | Dial, stream, or timeout failure | Logged, not retried here |
//! | `Persist` | Durable write or rename failed | Logged and returned; memory is ahead of disk |
//! | `Unknown` | Opaque failure from the consensus layer | Detail never leaves the node |
//!
//! `Error` is serializable so that a handler's typed failure is carried over
//! the wire and the remote caller observes the same kind.

use serde::{Deserialize, Serialize};

/// Closed set of failure categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Transport,
    Persist,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Transport => "transport error",
            ErrorKind::Persist => "persist error",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Error returned by registry, store, transport, discovery, and handler
/// operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    NotFound(String),
    InvalidArgument(String),
    Transport(String),
    Persist(String),
    Unknown(String),
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    pub fn persist(message: impl Into<String>) -> Self {
        Error::Persist(message.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Error::Unknown(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Persist(_) => ErrorKind::Persist,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::NotFound(m)
            | Error::InvalidArgument(m)
            | Error::Transport(m)
            | Error::Persist(m)
            | Error::Unknown(m) => m,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for Error {}
