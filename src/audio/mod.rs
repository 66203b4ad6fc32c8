//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod facade;
pub mod notify;
pub mod playback;
pub mod volume;

pub use buffer::SampleQueue;
pub use device::{DataFlow, Device, DeviceChangeEvent, DeviceDirectory, DeviceId, DeviceState};
pub use facade::AudioFacade;
pub use notify::{handler, DeviceNotifications, EventSink};
pub use playback::{CompletionState, FinishReason, PlaybackEngine, TransportState};
pub use volume::{OriginTag, VolumeChangeEvent, VolumeControl, VolumeState};
