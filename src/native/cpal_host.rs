//! Enumeration through the cpal default host
//!
//! Used where no endpoint volume API is wired up. Device ids are the cpal
//! device names, which is all cpal exposes. Volume and notifications are
//! reported as unsupported.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait};

use crate::audio::device::{Device, DeviceChangeEvent, DeviceId};
use crate::audio::notify::EventSink;
use crate::error::DeviceError;
use crate::native::{AudioSubsystem, EndpointVolume, NativeRegistration};

/// cpal-backed directory. The host is opened per call, so every query sees
/// the current device set.
pub struct CpalHostSubsystem;

impl CpalHostSubsystem {
    pub fn new() -> Self {
        Self
    }

    fn output_devices(&self) -> Result<Vec<cpal::Device>, DeviceError> {
        cpal::default_host()
            .output_devices()
            .map(|devices| devices.collect())
            .map_err(|e| DeviceError::SubsystemUnavailable(e.to_string()))
    }
}

impl Default for CpalHostSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest channel count over the device's supported output configs
pub fn max_output_channels(device: &cpal::Device) -> u16 {
    device
        .supported_output_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

impl AudioSubsystem for CpalHostSubsystem {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn render_endpoints(&self) -> Result<Vec<Device>, DeviceError> {
        let mut devices = Vec::new();

        for device in self.output_devices()? {
            let name = match device.name() {
                Ok(name) => name,
                Err(e) => {
                    tracing::debug!("Skipping output device without a name: {}", e);
                    continue;
                }
            };
            let channels = max_output_channels(&device);
            devices.push(Device::new(DeviceId::new(name.clone()), name, channels));
        }

        Ok(devices)
    }

    fn friendly_name(&self, id: &DeviceId) -> Result<String, DeviceError> {
        self.output_devices()?
            .iter()
            .filter_map(|d| d.name().ok())
            .find(|name| name == id.as_str())
            .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))
    }

    fn activate_endpoint_volume(
        &self,
        _id: &DeviceId,
    ) -> Result<Box<dyn EndpointVolume>, DeviceError> {
        Err(DeviceError::Unsupported("endpoint volume"))
    }

    fn register_endpoint_notifications(
        &self,
        _sink: Arc<dyn EventSink<DeviceChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError> {
        Err(DeviceError::Unsupported("endpoint notifications"))
    }
}
