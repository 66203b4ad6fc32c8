//! # Endpoint Player
//!
//! Pick an output endpoint, control its master volume and mute, and play a
//! WAV file through it while staying in sync with changes made elsewhere
//! (another application, a hardware key, a device being unplugged).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Controller (controller.rs)                         │
//! │   pump(): drain events ─► update display ─► run deferred tasks ─► poll    │
//! └──────┬──────────────────────┬───────────────────────────┬────────────────┘
//!        │                      │                           │
//!        ▼                      ▼                           ▼
//! ┌──────────────┐   ┌─────────────────────────┐   ┌─────────────────────────┐
//! │  Device      │   │ Volume Control          │   │ Playback Engine         │
//! │  Directory   │   │  cached endpoint handle │   │  transport state        │
//! │              │   │  volume subscription ───┼─┐ │  command channel ──┐     │
//! └──────┬───────┘   └───────────┬─────────────┘ │ └───────────────────┼─────┘
//!        │                       │               │                     │
//!        │   ┌───────────────────┴──────────┐    │      ┌──────────────▼─────┐
//!        │   │ Device Notifications          │    │      │ Playback worker    │
//!        │   │  device-change subscription   │    │      │  thread            │
//!        │   └───────────────┬──────────────┘    │      │  WAV ─► chunk ─►   │
//!        │                   │                   │      │  sample queue      │
//!        ▼                   ▼                   ▼      └──────────┬─────────┘
//! ┌──────────────────────────────────────────────────┐  ┌──────────▼─────────┐
//! │   Native audio subsystem (native::AudioSubsystem) │  │ Output (cpal)      │
//! │   WASAPI / cpal host / simulated                  │  │  render callback   │
//! │   notification thread ──► EventSink (non-blocking)│  └────────────────────┘
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Notifications arrive on a thread owned by the native subsystem. Sinks only
//! enqueue; teardown of a subscription from inside its own callback is
//! refused with [`SubscriptionError::ReentrantTeardown`].

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod native;

pub use audio::facade::AudioFacade;
pub use audio::playback::PlaybackEngine;
pub use controller::Controller;
pub use error::{DeviceError, Error, PlaybackError, Result, SubscriptionError};

/// Application-wide constants
pub mod constants {
    /// Frames read from the WAV file and handed to the output per chunk
    pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

    /// Capacity of the worker-to-callback sample queue, in chunks
    pub const DEFAULT_QUEUE_CHUNKS: usize = 4;

    /// Bound on how long a single chunk may wait for queue space
    pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;

    /// Sleep interval of `stop()` while waiting for the worker
    pub const DEFAULT_STOP_POLL_MS: u64 = 10;

    /// Bound on the worker's stream-open handshake
    pub const DEFAULT_START_TIMEOUT_MS: u64 = 3000;

    /// Capacity of channel-backed notification sinks
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

    /// Controller completion polling interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// Delay before a deferred device-list refresh runs
    pub const DEFAULT_REFRESH_DELAY_MS: u64 = 100;

    /// Endpoint id prefix of render devices
    pub const RENDER_ENDPOINT_PREFIX: &str = "{0.0.0.00000000}";

    /// Endpoint id prefix of capture devices
    pub const CAPTURE_ENDPOINT_PREFIX: &str = "{0.0.1.00000000}";
}
