//! Headless controller
//!
//! Owns the audio facade and the playback engine and drives both from a
//! single loop. Notification sinks are bounded channels: the native
//! notification thread only enqueues, and everything that tears down or
//! rebuilds a subscription runs later from [`Controller::pump`] through the
//! [`DeferredQueue`].

use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::audio::device::{Device, DeviceChangeEvent, DeviceId, DeviceState};
use crate::audio::facade::AudioFacade;
use crate::audio::playback::{FinishReason, PlaybackEngine, TransportState};
use crate::audio::volume::{VolumeChangeEvent, VolumeState};
use crate::config::{AppConfig, ControllerConfig};
use crate::error::{DeviceError, Error, Result};

/// Volume as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDisplay {
    pub percent: u8,
    pub muted: bool,
}

impl VolumeDisplay {
    pub fn from_state(state: VolumeState) -> Self {
        Self {
            percent: display_percent(state.level),
            muted: state.muted,
        }
    }
}

/// Scalar volume to a whole percentage, rounding half up
pub fn display_percent(level: f32) -> u8 {
    ((level + 0.005) * 100.0).floor().clamp(0.0, 100.0) as u8
}

/// Work that must not run on a notification thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredTask {
    /// Re-enumerate devices and re-bind the volume subscription
    RefreshDevices,
}

/// Time-ordered tasks run by the controller loop
#[derive(Debug, Default)]
pub struct DeferredQueue {
    pending: Vec<(Instant, DeferredTask)>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` at `due`. A task already pending keeps the earlier
    /// due time, so bursts of notifications collapse into one run.
    pub fn schedule(&mut self, task: DeferredTask, due: Instant) {
        match self.pending.iter_mut().find(|(_, pending)| *pending == task) {
            Some((at, _)) => *at = (*at).min(due),
            None => self.pending.push((due, task)),
        }
    }

    /// Remove and return every task due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<DeferredTask> {
        let mut due: Vec<(Instant, DeferredTask)> = Vec::new();
        self.pending.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, task)| task).collect()
    }

    pub fn is_pending(&self, task: DeferredTask) -> bool {
        self.pending.iter().any(|(_, pending)| *pending == task)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What one [`Controller::pump`] did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PumpReport {
    pub device_events: usize,
    pub volume_events: usize,
    pub tasks_run: usize,
    /// Set when a finished session was acknowledged
    pub finished: Option<FinishReason>,
}

pub struct Controller {
    facade: AudioFacade,
    engine: PlaybackEngine,
    config: ControllerConfig,
    deferred: DeferredQueue,
    device_rx: Receiver<DeviceChangeEvent>,
    volume_tx: Sender<VolumeChangeEvent>,
    volume_rx: Receiver<VolumeChangeEvent>,
    devices: Vec<Device>,
    selected: Option<DeviceId>,
    display: Option<VolumeDisplay>,
}

impl Controller {
    /// Subscribe to device changes, enumerate, and select the first device
    pub fn new(
        mut facade: AudioFacade,
        engine: PlaybackEngine,
        config: &AppConfig,
    ) -> Result<Self> {
        let capacity = config.notifications.queue_capacity;
        let (device_tx, device_rx) = bounded(capacity);
        let (volume_tx, volume_rx) = bounded(capacity);

        match facade.subscribe_device_change(device_tx) {
            Ok(()) => {}
            Err(Error::Device(DeviceError::Unsupported(what))) => {
                tracing::warn!(
                    "No {} on {}, device list will not follow changes",
                    what,
                    facade.subsystem_name()
                );
            }
            Err(e) => return Err(e),
        }

        let mut controller = Self {
            facade,
            engine,
            config: config.controller.clone(),
            deferred: DeferredQueue::new(),
            device_rx,
            volume_tx,
            volume_rx,
            devices: Vec::new(),
            selected: None,
            display: None,
        };
        controller.refresh_devices()?;
        Ok(controller)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn selected_device(&self) -> Option<&Device> {
        let id = self.selected.as_ref()?;
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn volume_display(&self) -> Option<VolumeDisplay> {
        self.display
    }

    pub fn transport(&self) -> TransportState {
        self.engine.transport()
    }

    pub fn is_playing(&self) -> bool {
        self.engine.is_playing()
    }

    pub fn facade(&self) -> &AudioFacade {
        &self.facade
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    /// Bind volume control to the device at `index` of [`devices`](Self::devices)
    pub fn select_device(&mut self, index: usize) -> Result<()> {
        let device = self
            .devices
            .get(index)
            .cloned()
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("device #{}", index)))?;
        self.bind(&device)
    }

    fn unbind(&mut self) -> Result<()> {
        if let Some(previous) = self.selected.take() {
            // A removed endpoint may refuse to unregister; the registration is gone either way
            match self.facade.unsubscribe_volume_change(&previous) {
                Ok(()) => {}
                Err(Error::Device(e)) => {
                    tracing::warn!("Volume unsubscribe for {} failed: {}", previous, e)
                }
                Err(e) => return Err(e),
            }
            self.facade.release()?;

            // Events of the old device must not reach the next one's display
            let stale = self.volume_rx.try_iter().count();
            if stale > 0 {
                tracing::debug!("Discarded {} volume event(s) of {}", stale, previous);
            }
        }
        self.display = None;
        Ok(())
    }

    fn bind(&mut self, device: &Device) -> Result<()> {
        self.unbind()?;
        self.selected = Some(device.id.clone());

        match self.facade.get_volume_state(&device.id) {
            Ok(state) => self.display = Some(VolumeDisplay::from_state(state)),
            Err(DeviceError::Unsupported(what)) => {
                tracing::warn!("No {} for {}", what, device.name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.facade
            .subscribe_volume_change(&device.id, self.volume_tx.clone())?;
        tracing::info!("Selected {} ({})", device.name, device.id);
        Ok(())
    }

    fn selected_id(&self) -> Result<DeviceId> {
        self.selected
            .clone()
            .ok_or_else(|| DeviceError::DeviceNotFound("no device selected".into()).into())
    }

    /// Set the volume from a 0..=100 slider. 0 % also mutes.
    pub fn set_volume_percent(&mut self, percent: u8) -> Result<()> {
        let id = self.selected_id()?;
        let percent = percent.min(100);

        self.facade
            .set_volume(&id, f32::from(percent) / 100.0)
            .map_err(|e| self.endpoint_error(e))?;
        let muted = if percent == 0 {
            self.facade.set_mute(&id, true).map_err(|e| self.endpoint_error(e))?;
            true
        } else {
            self.display.map_or(false, |d| d.muted)
        };

        self.display = Some(VolumeDisplay { percent, muted });
        Ok(())
    }

    /// Flip mute; returns the new state
    pub fn toggle_mute(&mut self) -> Result<bool> {
        let id = self.selected_id()?;
        let muted = !self.facade.get_mute(&id).map_err(|e| self.endpoint_error(e))?;
        self.facade.set_mute(&id, muted).map_err(|e| self.endpoint_error(e))?;

        if let Some(display) = &mut self.display {
            display.muted = muted;
        }
        Ok(muted)
    }

    /// An invalidated endpoint takes the volume subscription with it; rebind
    /// on the next pump.
    fn endpoint_error(&mut self, error: DeviceError) -> Error {
        if let DeviceError::DeviceNotFound(_) = &error {
            tracing::warn!("Volume endpoint lost ({}), scheduling rebind", error);
            self.deferred.schedule(DeferredTask::RefreshDevices, Instant::now());
        }
        error.into()
    }

    /// Play `path` on the selected device, or resume
    pub fn play(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let device = self
            .selected_device()
            .cloned()
            .ok_or_else(|| DeviceError::DeviceNotFound("no device selected".into()))?;
        self.engine.play(&device, path)?;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.engine.pause();
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    /// Re-enumerate and rebind the selection when the device survived,
    /// otherwise fall back to the first device. Rebinding re-activates the
    /// endpoint, since a state change may have invalidated the old one.
    pub fn refresh_devices(&mut self) -> Result<()> {
        self.devices = self.facade.list_output_devices()?;
        tracing::info!("{} output device(s)", self.devices.len());

        let keep = self
            .selected
            .as_ref()
            .and_then(|id| self.devices.iter().position(|d| &d.id == id));

        match keep {
            Some(index) => self.select_device(index),
            None if self.devices.is_empty() => self.unbind(),
            None => self.select_device(0),
        }
    }

    /// One iteration of the controller loop
    pub fn pump(&mut self, now: Instant) -> PumpReport {
        let mut report = PumpReport::default();

        while let Ok(event) = self.device_rx.try_recv() {
            report.device_events += 1;
            self.on_device_change(event, now);
        }

        while let Ok(event) = self.volume_rx.try_recv() {
            report.volume_events += 1;
            self.display = Some(VolumeDisplay {
                percent: display_percent(event.master_volume),
                muted: event.muted,
            });
        }

        for task in self.deferred.take_due(now) {
            report.tasks_run += 1;
            tracing::debug!("Running deferred {:?}", task);
            match task {
                DeferredTask::RefreshDevices => {
                    if let Err(e) = self.refresh_devices() {
                        tracing::error!("Device refresh failed: {}", e);
                    }
                }
            }
        }

        if self.engine.current_file().is_some() && !self.engine.is_playing() {
            report.finished = self.engine.acknowledge_finished();
        }

        report
    }

    fn on_device_change(&mut self, event: DeviceChangeEvent, now: Instant) {
        if !event.is_render() && event.flow.is_some() {
            tracing::trace!("Ignoring capture device change {}", event.device_id);
            return;
        }

        match event.state {
            DeviceState::Active => {
                tracing::info!("Device {} became active", event.device_id);
            }
            DeviceState::Disabled | DeviceState::NotPresent | DeviceState::Unplugged => {
                tracing::info!("Device {} is now {:?}", event.device_id, event.state);
            }
        }

        // The stream may sit on a device that no longer matches the list
        if self.engine.transport() != TransportState::Stopped {
            self.engine.stop();
        }
        let due = now + self.refresh_delay();
        self.deferred.schedule(DeferredTask::RefreshDevices, due);
    }

    fn refresh_delay(&self) -> Duration {
        self.config.refresh_delay()
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }

    /// Stop playback and drop every subscription. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.engine.stop();
        if let Err(e) = self.unbind() {
            tracing::error!("Volume teardown failed: {}", e);
        }
        if let Err(e) = self.facade.unsubscribe_device_change() {
            tracing::error!("Device notification teardown failed: {}", e);
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
