//! Output device directory and device data model
//!
//! Every call performs a fresh query against the native subsystem. A device
//! list is a snapshot: it goes stale as soon as a device-change notification
//! arrives, and the caller is expected to re-enumerate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{CAPTURE_ENDPOINT_PREFIX, RENDER_ENDPOINT_PREFIX};
use crate::error::DeviceError;
use crate::native::AudioSubsystem;

/// Opaque endpoint identifier assigned by the native subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Data flow encoded in the endpoint id, if it has the native shape
    pub fn flow(&self) -> Option<DataFlow> {
        DataFlow::from_endpoint_id(&self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An active render endpoint, as seen at enumeration time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Friendly name, read in the same pass as the id
    pub name: String,
    /// Channels of the endpoint's shared-mode mix format
    pub max_output_channels: u16,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, max_output_channels: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            max_output_channels,
        }
    }
}

/// Direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFlow {
    Render,
    Capture,
}

impl DataFlow {
    /// Classify a native endpoint id such as `{0.0.0.00000000}.{guid}`
    pub fn from_endpoint_id(id: &str) -> Option<Self> {
        if id.starts_with(RENDER_ENDPOINT_PREFIX) {
            Some(DataFlow::Render)
        } else if id.starts_with(CAPTURE_ENDPOINT_PREFIX) {
            Some(DataFlow::Capture)
        } else {
            None
        }
    }
}

/// Endpoint state reported by device-change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Active,
    Disabled,
    NotPresent,
    Unplugged,
}

impl DeviceState {
    /// Decode the native `DEVICE_STATE_*` bit value
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x1 => Some(DeviceState::Active),
            0x2 => Some(DeviceState::Disabled),
            0x4 => Some(DeviceState::NotPresent),
            0x8 => Some(DeviceState::Unplugged),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            DeviceState::Active => 0x1,
            DeviceState::Disabled => 0x2,
            DeviceState::NotPresent => 0x4,
            DeviceState::Unplugged => 0x8,
        }
    }
}

/// A device changed state somewhere in the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChangeEvent {
    pub device_id: DeviceId,
    pub state: DeviceState,
    /// `None` when the id does not carry the native flow prefix
    pub flow: Option<DataFlow>,
}

impl DeviceChangeEvent {
    pub fn new(device_id: DeviceId, state: DeviceState) -> Self {
        let flow = device_id.flow();
        Self {
            device_id,
            state,
            flow,
        }
    }

    pub fn is_render(&self) -> bool {
        self.flow == Some(DataFlow::Render)
    }
}

/// Enumerates output devices and resolves their names
pub struct DeviceDirectory {
    subsystem: Arc<dyn AudioSubsystem>,
}

impl DeviceDirectory {
    pub fn new(subsystem: Arc<dyn AudioSubsystem>) -> Self {
        Self { subsystem }
    }

    /// Snapshot of active render endpoints with at least one output channel
    pub fn list_output_devices(&self) -> Result<Vec<Device>, DeviceError> {
        let devices: Vec<Device> = self
            .subsystem
            .render_endpoints()?
            .into_iter()
            .filter(|d| {
                if d.max_output_channels == 0 {
                    tracing::debug!("Skipping {} ({}): no output channels", d.name, d.id);
                    false
                } else {
                    true
                }
            })
            .collect();

        tracing::debug!(
            "Enumerated {} output device(s) via {}",
            devices.len(),
            self.subsystem.name()
        );
        Ok(devices)
    }

    /// Display name of a device; `DeviceNotFound` once it is gone
    pub fn resolve_friendly_name(&self, device_id: &DeviceId) -> Result<String, DeviceError> {
        self.subsystem.friendly_name(device_id)
    }

    /// Fresh lookup of one device among the active outputs
    pub fn find(&self, device_id: &DeviceId) -> Result<Device, DeviceError> {
        self.list_output_devices()?
            .into_iter()
            .find(|d| &d.id == device_id)
            .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::simulated::SimulatedSubsystem;

    #[test]
    fn test_device_state_bits() {
        for state in [
            DeviceState::Active,
            DeviceState::Disabled,
            DeviceState::NotPresent,
            DeviceState::Unplugged,
        ] {
            assert_eq!(DeviceState::from_bits(state.bits()), Some(state));
        }
        assert_eq!(DeviceState::from_bits(0x3), None);
        assert_eq!(DeviceState::from_bits(0), None);
    }

    #[test]
    fn test_flow_from_endpoint_id() {
        assert_eq!(
            DataFlow::from_endpoint_id("{0.0.0.00000000}.{a1b2}"),
            Some(DataFlow::Render)
        );
        assert_eq!(
            DataFlow::from_endpoint_id("{0.0.1.00000000}.{a1b2}"),
            Some(DataFlow::Capture)
        );
        assert_eq!(DataFlow::from_endpoint_id("Built-in Output"), None);
    }

    #[test]
    fn test_list_filters_devices_without_outputs() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);
        sim.add_device("Line In Monitor", 0);

        let directory = DeviceDirectory::new(Arc::new(sim));
        let devices = directory.list_output_devices().unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, speakers);
        assert_eq!(devices[0].name, "Speakers");
        assert_eq!(devices[0].max_output_channels, 2);
    }

    #[test]
    fn test_list_reflects_state_changes() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);
        let headset = sim.add_device("Headset", 2);
        let directory = DeviceDirectory::new(Arc::new(sim.clone()));

        assert_eq!(directory.list_output_devices().unwrap().len(), 2);

        sim.set_device_state(&headset, DeviceState::Unplugged);
        let devices = directory.list_output_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, speakers);
    }

    #[test]
    fn test_resolve_friendly_name() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers (High Definition Audio)", 2);
        let directory = DeviceDirectory::new(Arc::new(sim.clone()));

        assert_eq!(
            directory.resolve_friendly_name(&speakers).unwrap(),
            "Speakers (High Definition Audio)"
        );

        sim.remove_device(&speakers);
        assert!(matches!(
            directory.resolve_friendly_name(&speakers),
            Err(DeviceError::DeviceNotFound(_))
        ));
        assert!(matches!(
            directory.find(&speakers),
            Err(DeviceError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_unavailable_subsystem() {
        let sim = SimulatedSubsystem::new();
        sim.add_device("Speakers", 2);
        sim.set_available(false);
        let directory = DeviceDirectory::new(Arc::new(sim));

        assert!(matches!(
            directory.list_output_devices(),
            Err(DeviceError::SubsystemUnavailable(_))
        ));
    }
}
