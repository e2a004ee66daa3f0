use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that cross the store and control boundaries. Everything that reaches a client is one of
/// these, so each variant maps onto a stable [ErrorKind].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning { pid: u32 },
    #[error("store is corrupted: {0}")]
    Corrupted(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("daemon is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    NotFound,
    Conflict,
    AlreadyRunning,
    Corrupted,
    InvalidRequest,
    Unavailable,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::TransientIo(_) => ErrorKind::TransientIo,
            TrackerError::NotFound(_) => ErrorKind::NotFound,
            TrackerError::Conflict(_) => ErrorKind::Conflict,
            TrackerError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            TrackerError::Corrupted(_) => ErrorKind::Corrupted,
            TrackerError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            TrackerError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::TransientIo(_))
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        TrackerError::NotFound(format!("{what} '{id}'"))
    }
}

impl From<io::Error> for TrackerError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                TrackerError::Corrupted(value.to_string())
            }
            _ => TrackerError::TransientIo(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(value: serde_json::Error) -> Self {
        TrackerError::Corrupted(value.to_string())
    }
}
