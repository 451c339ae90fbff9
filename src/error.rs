use thiserror::Error;

/// Link level failures.
///
/// These never escape the console loop, every one of them ends in a
/// scheduled reconnection attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("failed to open connection to {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },
    #[error("connection closed by peer")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum DecodeError {
    #[error("map frame has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("link task is gone")]
    LinkGone,
}

#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("zenoh error {0:?}")]
    ZenohError(zenoh::Error),
}

/// Configuration values the console refuses to run with.
#[derive(Error, Debug, PartialEq, Clone, Copy)]
pub enum ConfigError {
    #[error("motion.{field} must be a positive finite number, got {value}")]
    NotPositive { field: &'static str, value: f32 },
    #[error("motion.joystick_deadzone must be within [0, 1), got {0}")]
    Deadzone(f32),
    #[error("map of {width}x{height} cells is empty or too large")]
    MapSize { width: usize, height: usize },
}
