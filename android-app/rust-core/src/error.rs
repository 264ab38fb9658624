//! Error types for the BandBook core

use shared::{FrameError, TransportError};
use thiserror::Error;

/// Errors that can occur in the session, the transfer or the JNI bridge.
///
/// Every variant is cheap to clone so one handshake failure can be handed to
/// all callers waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Band did not answer the handshake in time, try restarting the phone")]
    HandshakeTimeout,
    #[error("Band protocol version {current} is older than the required {required}")]
    VersionIncompatible { current: u32, required: u32 },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Band storage is full ({usage} bytes used, limit {ceiling})")]
    StorageExceeded { usage: u64, ceiling: u64 },
    #[error("Band rejected chunk {count} {attempts} times in a row")]
    ChunkRejected { count: u32, attempts: u32 },
    #[error("Band disconnected")]
    Disconnected,
    #[error("A transfer is already in progress")]
    Busy,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("JNI error: {0}")]
    Jni(String),
    #[error("Invalid config: {0}")]
    Config(String),
}

impl From<FrameError> for CoreError {
    fn from(e: FrameError) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl From<jni::errors::Error> for CoreError {
    fn from(e: jni::errors::Error) -> Self {
        CoreError::Jni(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
