//! # Error Types
//!
//! The error taxonomy shared by the tracker, the streaming transport, the
//! cookie registry and the dispatch side.

use crate::envelope::{RequestId, ResponseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors produced by bus operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Malformed envelope or missing required field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A tracked request needs a strictly positive timeout.
    #[error("invalid timeout: must be greater than zero")]
    InvalidTimeout,

    /// The request ID is already being tracked.
    #[error("duplicate request: {id} is already tracked")]
    DuplicateRequest { id: RequestId },

    /// No tracked request matches the response ID (late, spurious or resolved).
    #[error("unknown request: {id} is not tracked")]
    UnknownRequest { id: RequestId },

    /// No response arrived before the deadline.
    #[error("request timeout: {id}")]
    Timeout { id: RequestId },

    /// No handler is registered for the task.
    #[error("unknown task: {task}")]
    UnknownTask { task: String },

    /// The cookie does not name a live operation.
    #[error("unknown cookie: {cookie}")]
    UnknownCookie { cookie: u64 },

    /// The operation behind the cookie (or the supplied signal) was already cancelled.
    #[error("already cancelled: {cookie}")]
    AlreadyCancelled { cookie: u64 },

    /// Send or stream endpoint I/O failed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The handler reported a failure in its response.
    #[error("{0}")]
    Remote(ResponseError),
}

impl BusError {
    /// The wire-level kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::InvalidTimeout => ErrorKind::InvalidTimeout,
            Self::DuplicateRequest { .. } => ErrorKind::DuplicateRequest,
            Self::UnknownRequest { .. } => ErrorKind::UnknownRequest,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnknownTask { .. } => ErrorKind::UnknownTask,
            Self::UnknownCookie { .. } => ErrorKind::UnknownCookie,
            Self::AlreadyCancelled { .. } => ErrorKind::AlreadyCancelled,
            Self::TransportFailure(_) => ErrorKind::TransportFailure,
            Self::Remote(e) => e.kind,
        }
    }

    /// Shorthand for wrapping any displayable I/O error as a transport failure.
    pub fn transport(err: impl fmt::Display) -> Self {
        Self::TransportFailure(err.to_string())
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        Self::TransportFailure(err.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// Serializable error classification carried in `ResponseError.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidTimeout,
    DuplicateRequest,
    UnknownRequest,
    Timeout,
    UnknownTask,
    UnknownCookie,
    AlreadyCancelled,
    TransportFailure,
    /// Generic failure reported by a task handler.
    TaskFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid request",
            Self::InvalidTimeout => "invalid timeout",
            Self::DuplicateRequest => "duplicate request",
            Self::UnknownRequest => "unknown request",
            Self::Timeout => "timeout",
            Self::UnknownTask => "unknown task",
            Self::UnknownCookie => "unknown cookie",
            Self::AlreadyCancelled => "already cancelled",
            Self::TransportFailure => "transport failure",
            Self::TaskFailed => "task failed",
        };
        f.write_str(s)
    }
}
