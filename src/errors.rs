//! Error types shared across the application.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure (fatal at startup).
    Config(String),
    /// Task directory discovery failure (fatal at startup).
    Discovery(String),
    /// Slack API or Socket Mode failure.
    Slack(String),
    /// Unparseable message on the agent's streaming protocol.
    Protocol(String),
    /// PTY allocation, read, or write failure.
    Pty(String),
    /// Permission FIFO creation or I/O failure.
    Pipe(String),
    /// Agent subprocess exited with a failure status.
    Subprocess(String),
    /// Agent subprocess exceeded the configured execution timeout.
    Timeout(Duration),
    /// Agent subprocess was cancelled before completion.
    Cancelled,
    /// Session store or rule document write failure.
    Persistence(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Discovery(msg) => write!(f, "discovery: {msg}"),
            Self::Slack(msg) => write!(f, "slack: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Pty(msg) => write!(f, "pty: {msg}"),
            Self::Pipe(msg) => write!(f, "pipe: {msg}"),
            Self::Subprocess(msg) => write!(f, "subprocess: {msg}"),
            Self::Timeout(limit) => {
                write!(f, "agent execution timed out after {}s", limit.as_secs())
            }
            Self::Cancelled => write!(f, "agent execution was cancelled"),
            Self::Persistence(msg) => write!(f, "persistence: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
