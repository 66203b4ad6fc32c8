//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every field
//! has a default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub notifications: NotificationConfig,
    pub controller: ControllerConfig,
    pub log: LogConfig,
}

/// Playback engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames per chunk read from the file
    pub chunk_frames: usize,
    /// Sample queue capacity between worker and output callback, in chunks
    pub queue_chunks: usize,
    /// A chunk that cannot be queued within this bound is a device failure
    pub write_timeout_ms: u64,
    /// Sleep interval while `stop()` waits for the worker
    pub stop_poll_ms: u64,
    /// Bound on the worker's stream-open handshake
    pub start_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            queue_chunks: DEFAULT_QUEUE_CHUNKS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            stop_poll_ms: DEFAULT_STOP_POLL_MS,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// Notification delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Capacity of channel-backed event sinks; events beyond it are dropped
    pub queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

/// Controller loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub poll_interval_ms: u64,
    pub refresh_delay_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            refresh_delay_ms: DEFAULT_REFRESH_DELAY_MS,
        }
    }
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Default location: `<config dir>/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "endpoint-player")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.playback.chunk_frames == 0 {
            return Err(Error::Config("playback.chunk_frames must be > 0".into()));
        }
        if self.playback.queue_chunks == 0 {
            return Err(Error::Config("playback.queue_chunks must be > 0".into()));
        }
        if self.playback.write_timeout_ms == 0 {
            return Err(Error::Config("playback.write_timeout_ms must be > 0".into()));
        }
        if self.notifications.queue_capacity == 0 {
            return Err(Error::Config("notifications.queue_capacity must be > 0".into()));
        }
        if self.controller.poll_interval_ms == 0 {
            return Err(Error::Config("controller.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}
