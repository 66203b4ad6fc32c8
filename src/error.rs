//! Error types for device control and playback

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Native audio subsystem errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Audio subsystem unavailable: {0}")]
    SubsystemUnavailable(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid volume level: {0}")]
    InvalidLevel(f32),

    #[error("Not supported by this audio subsystem: {0}")]
    Unsupported(&'static str),

    #[error("Native audio error: {0}")]
    Native(String),
}

/// Notification channel discipline violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Already subscribed to {0} notifications")]
    AlreadySubscribed(&'static str),

    /// Teardown requested from inside a notification delivered on the same
    /// channel. Honouring it would block on the delivery machinery that is
    /// currently running the caller.
    #[error("Cannot tear down {0} notifications from inside a notification callback")]
    ReentrantTeardown(&'static str),
}

/// Playback engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Failed to open {path:?}: {reason}")]
    FileOpen { path: PathBuf, reason: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device rejected output: {0}")]
    DeviceRejected(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Output device failed: {0}")]
    DeviceFailure(String),

    #[error("Failed to spawn playback worker: {0}")]
    WorkerSpawn(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
