//! Controller-facing facade over the device directory, volume control and
//! both notification channels.

use std::sync::Arc;

use crate::audio::device::{Device, DeviceChangeEvent, DeviceDirectory, DeviceId};
use crate::audio::notify::{DeviceNotifications, EventSink};
use crate::audio::volume::{OriginTag, VolumeChangeEvent, VolumeControl, VolumeState};
use crate::error::{DeviceError, Result, SubscriptionError};
use crate::native::{self, AudioSubsystem};

/// One native subsystem, seen through the operations a controller needs
pub struct AudioFacade {
    subsystem: Arc<dyn AudioSubsystem>,
    directory: DeviceDirectory,
    volume: VolumeControl,
    device_changes: DeviceNotifications,
}

impl AudioFacade {
    pub fn new(subsystem: Arc<dyn AudioSubsystem>) -> Self {
        tracing::info!("Audio facade on {} subsystem", subsystem.name());
        Self {
            directory: DeviceDirectory::new(subsystem.clone()),
            volume: VolumeControl::new(subsystem.clone()),
            device_changes: DeviceNotifications::new(subsystem.clone()),
            subsystem,
        }
    }

    /// Facade over the platform's native subsystem
    pub fn with_default_subsystem() -> std::result::Result<Self, DeviceError> {
        Ok(Self::new(native::default_subsystem()?))
    }

    pub fn subsystem_name(&self) -> &'static str {
        self.subsystem.name()
    }

    pub fn list_output_devices(&self) -> std::result::Result<Vec<Device>, DeviceError> {
        self.directory.list_output_devices()
    }

    pub fn resolve_friendly_name(
        &self,
        device_id: &DeviceId,
    ) -> std::result::Result<String, DeviceError> {
        self.directory.resolve_friendly_name(device_id)
    }

    pub fn get_volume(&mut self, device_id: &DeviceId) -> std::result::Result<f32, DeviceError> {
        self.volume.get_volume(device_id)
    }

    pub fn get_mute(&mut self, device_id: &DeviceId) -> std::result::Result<bool, DeviceError> {
        self.volume.get_mute(device_id)
    }

    pub fn get_volume_state(
        &mut self,
        device_id: &DeviceId,
    ) -> std::result::Result<VolumeState, DeviceError> {
        self.volume.get_state(device_id)
    }

    /// Scalar volume in `[0.0, 1.0]`; does not touch mute
    pub fn set_volume(
        &mut self,
        device_id: &DeviceId,
        level: f32,
    ) -> std::result::Result<(), DeviceError> {
        self.volume.set_volume(device_id, level)
    }

    pub fn set_mute(
        &mut self,
        device_id: &DeviceId,
        muted: bool,
    ) -> std::result::Result<(), DeviceError> {
        self.volume.set_mute(device_id, muted)
    }

    /// Tag carried by every volume/mute write made through this facade
    pub fn origin(&self) -> OriginTag {
        self.volume.origin()
    }

    pub fn subscribe_device_change<S>(&mut self, sink: S) -> Result<()>
    where
        S: EventSink<DeviceChangeEvent> + 'static,
    {
        self.device_changes.subscribe(sink)
    }

    pub fn unsubscribe_device_change(&mut self) -> Result<()> {
        self.device_changes.unsubscribe()
    }

    pub fn is_device_change_subscribed(&self) -> bool {
        self.device_changes.is_subscribed()
    }

    pub fn subscribe_volume_change<S>(&mut self, device_id: &DeviceId, sink: S) -> Result<()>
    where
        S: EventSink<VolumeChangeEvent> + 'static,
    {
        self.volume.subscribe(device_id, sink)
    }

    pub fn unsubscribe_volume_change(&mut self, device_id: &DeviceId) -> Result<()> {
        self.volume.unsubscribe(device_id)
    }

    pub fn volume_subscription(&self) -> Option<&DeviceId> {
        self.volume.subscribed_device()
    }

    /// Drop the cached volume handle
    pub fn release(&mut self) -> std::result::Result<(), SubscriptionError> {
        self.volume.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::simulated::SimulatedSubsystem;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_facade_round_trip() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers (Realtek)", 2);
        let mut facade = AudioFacade::new(Arc::new(sim.clone()));

        let devices = facade.list_output_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(facade.resolve_friendly_name(&speakers).unwrap(), "Speakers (Realtek)");

        facade.set_volume(&speakers, 0.3).unwrap();
        facade.set_mute(&speakers, true).unwrap();
        assert!((facade.get_volume(&speakers).unwrap() - 0.3).abs() < 1e-6);
        assert!(facade.get_mute(&speakers).unwrap());
        assert_eq!(facade.subsystem_name(), "simulated");
    }

    #[test]
    fn test_both_channels_deliver() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);
        let mut facade = AudioFacade::new(Arc::new(sim.clone()));

        let (device_tx, device_rx) = unbounded();
        let (volume_tx, volume_rx) = unbounded();
        facade.subscribe_device_change(device_tx).unwrap();
        facade.subscribe_volume_change(&speakers, volume_tx).unwrap();

        sim.set_external_volume(&speakers, 0.8);
        sim.remove_device(&speakers);
        sim.flush();

        let volume = volume_rx.try_recv().unwrap();
        assert!(volume.origin.is_external());
        assert!(!volume.is_from(&facade.origin()));
        assert_eq!(device_rx.try_recv().unwrap().device_id, speakers);

        facade.unsubscribe_volume_change(&speakers).unwrap();
        facade.unsubscribe_device_change().unwrap();
        assert!(!facade.is_device_change_subscribed());
        assert!(facade.volume_subscription().is_none());
    }

    #[test]
    fn test_unsubscribe_when_never_subscribed() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);
        let mut facade = AudioFacade::new(Arc::new(sim));

        facade.unsubscribe_device_change().unwrap();
        facade.unsubscribe_volume_change(&speakers).unwrap();
        facade.release().unwrap();
    }
}
