//! Server error types
//!
//! Startup and transport failures are fatal and surface from
//! [`Server::bind`](super::Server::bind) or [`Server::run`](super::Server::run).
//! Per-connection failures are handled where they occur and never reach
//! these types' callers.

use thiserror::Error;

use crate::websocket::FrameError;

/// Errors that can occur in the server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Socket, poll or thread I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configured host/port do not form a socket address
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// A connection id was registered twice
    #[error("Connection already registered: {0}")]
    DuplicateConnection(usize),

    /// Received frame could not be decoded
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Worker thread could not be started
    #[error("Failed to spawn worker {index}: {error}")]
    WorkerSpawn { index: usize, error: String },
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;
