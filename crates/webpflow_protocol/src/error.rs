//! Protocol and transport error types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A message failed validation before or after the wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u64 },

    #[error("header too large: {0} bytes")]
    HeaderTooLarge(u32),

    #[error("input file doesn't exist: {0}")]
    MissingInput(PathBuf),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A TCP operation against a peer failed.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("send to {host}:{port} failed: {source}")]
    Send {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("connection closed after {got}/{expected} bytes")]
    ShortRead { got: usize, expected: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
