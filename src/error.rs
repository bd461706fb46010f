//! Engine error taxonomy
//!
//! Control-surface operations return structured errors; render-side failures
//! are never surfaced synchronously (they are logged and counted instead).

use thiserror::Error;

/// Errors returned by the engine's control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown sample id, pad key, plugin id, or parameter id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Out-of-range pad index, velocity, sample rate, channel count, BPM,
    /// or otherwise malformed input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current state (e.g. starting a recording
    /// while one is already running).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// File open/read/write failure, including insufficient disk space.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio device open/start failure, with the device-supplied text.
    #[error("audio device error: {0}")]
    Device(String),

    /// An event queue is full; older entries were dropped and counted.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// WAV header or chunk-size inconsistencies.
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
