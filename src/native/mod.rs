//! Native audio subsystem seam
//!
//! The facades in [`crate::audio`] talk to the operating system only through
//! these traits. Backends:
//! - `wasapi`: Windows Core Audio (MMDevice API + endpoint volume)
//! - `cpal_host`: enumeration through cpal on hosts without an endpoint
//!   volume API
//! - `simulated`: in-process subsystem with its own notification thread

use std::sync::Arc;

use crate::audio::device::{Device, DeviceChangeEvent, DeviceId};
use crate::audio::notify::EventSink;
use crate::audio::volume::{OriginTag, VolumeChangeEvent};
use crate::error::DeviceError;

pub mod cpal_host;
pub mod simulated;
#[cfg(windows)]
pub mod wasapi;

/// Device enumeration and notification registration
pub trait AudioSubsystem: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Active render endpoints, names and channel counts filled in
    fn render_endpoints(&self) -> Result<Vec<Device>, DeviceError>;

    fn friendly_name(&self, id: &DeviceId) -> Result<String, DeviceError>;

    /// Open the endpoint volume control of one device
    fn activate_endpoint_volume(
        &self,
        id: &DeviceId,
    ) -> Result<Box<dyn EndpointVolume>, DeviceError>;

    /// Register a system-wide endpoint state listener
    fn register_endpoint_notifications(
        &self,
        sink: Arc<dyn EventSink<DeviceChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError>;
}

/// Live volume control of one endpoint.
///
/// Dropping it releases the native object, and with it any control-change
/// registration made through it.
pub trait EndpointVolume: Send + Sync {
    fn master_volume(&self) -> Result<f32, DeviceError>;

    fn set_master_volume(&self, level: f32, origin: OriginTag) -> Result<(), DeviceError>;

    fn mute(&self) -> Result<bool, DeviceError>;

    fn set_mute(&self, muted: bool, origin: OriginTag) -> Result<(), DeviceError>;

    fn register_control_change(
        &self,
        sink: Arc<dyn EventSink<VolumeChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError>;
}

/// Token of an active native registration
pub trait NativeRegistration: Send {
    /// Remove the registration. Blocks until in-flight deliveries finish.
    fn unregister(self: Box<Self>) -> Result<(), DeviceError>;
}

/// Subsystem of the current platform
pub fn default_subsystem() -> Result<Arc<dyn AudioSubsystem>, DeviceError> {
    #[cfg(windows)]
    {
        Ok(Arc::new(wasapi::WasapiSubsystem::new()?))
    }
    #[cfg(not(windows))]
    {
        Ok(Arc::new(cpal_host::CpalHostSubsystem::new()))
    }
}
