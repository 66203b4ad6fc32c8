//! In-process audio subsystem
//!
//! Behaves like the native endpoint API where it matters to the facades:
//! notifications are delivered on a dedicated thread, teardown waits for
//! in-flight deliveries, and releasing an endpoint volume object silently
//! drops the callbacks registered through it. Disabling a device invalidates
//! every endpoint object activated on it, as the native API does. Devices,
//! external volume changes and state transitions are driven through the
//! methods below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::audio::device::{DataFlow, Device, DeviceChangeEvent, DeviceId, DeviceState};
use crate::audio::notify::{self, EventSink};
use crate::audio::volume::{OriginTag, VolumeChangeEvent, VolumeState};
use crate::constants::{CAPTURE_ENDPOINT_PREFIX, RENDER_ENDPOINT_PREFIX};
use crate::error::DeviceError;
use crate::native::{AudioSubsystem, EndpointVolume, NativeRegistration};

/// How long teardown waits for an in-flight delivery before giving up
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_LEVEL: f32 = 0.5;

/// Simulated endpoint subsystem. Clones share the same devices.
#[derive(Clone)]
pub struct SimulatedSubsystem {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<SimState>,
    /// Held for the whole of every delivery
    delivery: Mutex<()>,
    queue: Sender<Notification>,
    next_token: AtomicU64,
    activations: AtomicUsize,
    live_handles: AtomicUsize,
}

struct SimState {
    available: bool,
    devices: Vec<SimDevice>,
    endpoint_clients: HashMap<u64, Arc<dyn EventSink<DeviceChangeEvent>>>,
    volume_clients: HashMap<u64, VolumeClient>,
}

struct VolumeClient {
    device_id: DeviceId,
    /// Generation of the endpoint object it was registered through
    generation: u64,
    sink: Arc<dyn EventSink<VolumeChangeEvent>>,
}

struct SimDevice {
    id: DeviceId,
    /// Bumped whenever existing endpoint objects become invalid
    generation: u64,
    name: String,
    channels: u16,
    state: DeviceState,
    level: f32,
    muted: bool,
}

impl SimDevice {
    fn volume_event(&self, origin: OriginTag) -> VolumeChangeEvent {
        VolumeChangeEvent {
            origin,
            muted: self.muted,
            master_volume: self.level,
            channel_volumes: vec![self.level; self.channels as usize],
        }
    }
}

enum Notification {
    Device(DeviceChangeEvent),
    Volume(DeviceId, VolumeChangeEvent),
    Barrier(Sender<()>),
}

impl SimulatedSubsystem {
    pub fn new() -> Self {
        let (queue, rx) = unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState {
                available: true,
                devices: Vec::new(),
                endpoint_clients: HashMap::new(),
                volume_clients: HashMap::new(),
            }),
            delivery: Mutex::new(()),
            queue,
            next_token: AtomicU64::new(1),
            activations: AtomicUsize::new(0),
            live_handles: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&shared);
        let spawned = thread::Builder::new()
            .name("sim-audio-notify".to_string())
            .spawn(move || run_notifications(weak, rx));
        if let Err(e) = spawned {
            tracing::error!("Failed to start simulated notification thread: {}", e);
        }

        Self { shared }
    }

    /// Add an active render device
    pub fn add_device(&self, name: &str, channels: u16) -> DeviceId {
        self.insert(RENDER_ENDPOINT_PREFIX, name, channels)
    }

    /// Add an active capture device; never listed as an output
    pub fn add_capture_device(&self, name: &str) -> DeviceId {
        self.insert(CAPTURE_ENDPOINT_PREFIX, name, 0)
    }

    fn insert(&self, prefix: &str, name: &str, channels: u16) -> DeviceId {
        let id = DeviceId::new(format!("{}.{{{}}}", prefix, Uuid::new_v4()));
        self.shared.state.lock().devices.push(SimDevice {
            id: id.clone(),
            generation: 0,
            name: name.to_string(),
            channels,
            state: DeviceState::Active,
            level: DEFAULT_LEVEL,
            muted: false,
        });
        id
    }

    /// Change a device's state and notify device-change listeners
    pub fn set_device_state(&self, id: &DeviceId, new_state: DeviceState) {
        let changed = {
            let mut state = self.shared.state.lock();
            match state.devices.iter_mut().find(|d| &d.id == id) {
                Some(device) if device.state != new_state => {
                    if device.state == DeviceState::Active {
                        device.generation += 1;
                    }
                    device.state = new_state;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.shared.post(Notification::Device(DeviceChangeEvent::new(
                id.clone(),
                new_state,
            )));
        }
    }

    /// Forget a device entirely, notifying `NotPresent`
    pub fn remove_device(&self, id: &DeviceId) {
        let removed = {
            let mut state = self.shared.state.lock();
            let before = state.devices.len();
            state.devices.retain(|d| &d.id != id);
            state.devices.len() != before
        };
        if removed {
            self.shared.post(Notification::Device(DeviceChangeEvent::new(
                id.clone(),
                DeviceState::NotPresent,
            )));
        }
    }

    /// Invalidate every endpoint object activated on `id` so far, as a
    /// driver reset does. The device stays listed; fresh activations work.
    pub fn invalidate_endpoints(&self, id: &DeviceId) {
        let mut state = self.shared.state.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| &d.id == id) {
            device.generation += 1;
        }
    }

    /// Volume change made by some other application
    pub fn set_external_volume(&self, id: &DeviceId, level: f32) {
        self.shared
            .update_volume(id, OriginTag::external(), |d| d.level = level.clamp(0.0, 1.0));
    }

    /// Mute change made by some other application
    pub fn set_external_mute(&self, id: &DeviceId, muted: bool) {
        self.shared
            .update_volume(id, OriginTag::external(), |d| d.muted = muted);
    }

    pub fn volume_state(&self, id: &DeviceId) -> Option<VolumeState> {
        self.shared
            .state
            .lock()
            .devices
            .iter()
            .find(|d| &d.id == id)
            .map(|d| VolumeState {
                level: d.level,
                muted: d.muted,
            })
    }

    /// Make every subsequent call fail with `SubsystemUnavailable`
    pub fn set_available(&self, available: bool) {
        self.shared.state.lock().available = available;
    }

    pub fn volume_listener_count(&self, id: &DeviceId) -> usize {
        self.shared
            .state
            .lock()
            .volume_clients
            .values()
            .filter(|client| &client.device_id == id)
            .count()
    }

    pub fn device_listener_count(&self) -> usize {
        self.shared.state.lock().endpoint_clients.len()
    }

    /// Endpoint volume objects currently alive
    pub fn live_volume_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    /// Endpoint volume objects activated so far
    pub fn activation_count(&self) -> usize {
        self.shared.activations.load(Ordering::SeqCst)
    }

    /// Wait until every notification posted so far has been delivered
    pub fn flush(&self) {
        let (done_tx, done_rx) = bounded(1);
        self.shared.post(Notification::Barrier(done_tx));
        if done_rx.recv_timeout(TEARDOWN_TIMEOUT).is_err() {
            tracing::warn!("Simulated notification flush timed out");
        }
    }
}

impl Default for SimulatedSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn post(&self, notification: Notification) {
        if self.queue.send(notification).is_err() {
            tracing::warn!("Simulated notification thread is gone");
        }
    }

    fn check_available(state: &SimState) -> Result<(), DeviceError> {
        if state.available {
            Ok(())
        } else {
            Err(DeviceError::SubsystemUnavailable(
                "simulated subsystem is offline".to_string(),
            ))
        }
    }

    fn update_volume(&self, id: &DeviceId, origin: OriginTag, apply: impl FnOnce(&mut SimDevice)) {
        let event = {
            let mut state = self.state.lock();
            let Some(device) = state.devices.iter_mut().find(|d| &d.id == id) else {
                return;
            };
            let before = (device.level, device.muted);
            apply(device);
            ((device.level, device.muted) != before).then(|| device.volume_event(origin))
        };
        if let Some(event) = event {
            self.post(Notification::Volume(id.clone(), event));
        }
    }

    fn deliver(&self, notification: Notification) {
        let _delivering = self.delivery.lock();

        match notification {
            Notification::Device(event) => {
                let sinks: Vec<_> = self.state.lock().endpoint_clients.values().cloned().collect();
                for sink in sinks {
                    notify::dispatch(sink.as_ref(), event.clone());
                }
            }
            Notification::Volume(id, event) => {
                let sinks: Vec<_> = {
                    let state = self.state.lock();
                    let current = state.devices.iter().find(|d| d.id == id);
                    let Some(generation) = current.map(|d| d.generation) else {
                        return;
                    };
                    state
                        .volume_clients
                        .values()
                        .filter(|client| client.device_id == id && client.generation == generation)
                        .map(|client| Arc::clone(&client.sink))
                        .collect()
                };
                for sink in sinks {
                    notify::dispatch(sink.as_ref(), event.clone());
                }
            }
            Notification::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn run_notifications(shared: Weak<Shared>, rx: Receiver<Notification>) {
    for notification in rx {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.deliver(notification);
    }
    tracing::trace!("Simulated notification thread exiting");
}

impl AudioSubsystem for SimulatedSubsystem {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn render_endpoints(&self) -> Result<Vec<Device>, DeviceError> {
        let state = self.shared.state.lock();
        Shared::check_available(&state)?;

        Ok(state
            .devices
            .iter()
            .filter(|d| d.state == DeviceState::Active && d.id.flow() == Some(DataFlow::Render))
            .map(|d| Device::new(d.id.clone(), d.name.clone(), d.channels))
            .collect())
    }

    fn friendly_name(&self, id: &DeviceId) -> Result<String, DeviceError> {
        let state = self.shared.state.lock();
        Shared::check_available(&state)?;

        state
            .devices
            .iter()
            .find(|d| &d.id == id)
            .map(|d| d.name.clone())
            .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))
    }

    fn activate_endpoint_volume(
        &self,
        id: &DeviceId,
    ) -> Result<Box<dyn EndpointVolume>, DeviceError> {
        let generation = {
            let state = self.shared.state.lock();
            Shared::check_available(&state)?;
            state
                .devices
                .iter()
                .find(|d| &d.id == id && d.state == DeviceState::Active)
                .map(|d| d.generation)
                .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))?
        };

        self.shared.activations.fetch_add(1, Ordering::SeqCst);
        self.shared.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimEndpointVolume {
            shared: Arc::clone(&self.shared),
            device_id: id.clone(),
            generation,
            tokens: Mutex::new(Vec::new()),
        }))
    }

    fn register_endpoint_notifications(
        &self,
        sink: Arc<dyn EventSink<DeviceChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError> {
        let mut state = self.shared.state.lock();
        Shared::check_available(&state)?;

        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        state.endpoint_clients.insert(token, sink);
        Ok(Box::new(SimRegistration {
            shared: Arc::downgrade(&self.shared),
            token,
            kind: RegistrationKind::Endpoint,
        }))
    }
}

struct SimEndpointVolume {
    shared: Arc<Shared>,
    device_id: DeviceId,
    generation: u64,
    /// Registrations made through this object
    tokens: Mutex<Vec<u64>>,
}

impl SimEndpointVolume {
    fn read<R>(&self, f: impl FnOnce(&SimDevice) -> R) -> Result<R, DeviceError> {
        let state = self.shared.state.lock();
        Shared::check_available(&state)?;
        let device = state
            .devices
            .iter()
            .find(|d| d.id == self.device_id && d.state == DeviceState::Active)
            .ok_or_else(|| DeviceError::DeviceNotFound(self.device_id.to_string()))?;
        if device.generation != self.generation {
            return Err(DeviceError::DeviceNotFound(format!(
                "{} (endpoint object invalidated)",
                self.device_id
            )));
        }
        Ok(f(device))
    }

    fn write(
        &self,
        origin: OriginTag,
        apply: impl FnOnce(&mut SimDevice),
    ) -> Result<(), DeviceError> {
        self.read(|_| ())?;
        self.shared.update_volume(&self.device_id, origin, apply);
        Ok(())
    }
}

impl EndpointVolume for SimEndpointVolume {
    fn master_volume(&self) -> Result<f32, DeviceError> {
        self.read(|d| d.level)
    }

    fn set_master_volume(&self, level: f32, origin: OriginTag) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(DeviceError::InvalidLevel(level));
        }
        self.write(origin, |d| d.level = level)
    }

    fn mute(&self) -> Result<bool, DeviceError> {
        self.read(|d| d.muted)
    }

    fn set_mute(&self, muted: bool, origin: OriginTag) -> Result<(), DeviceError> {
        self.write(origin, |d| d.muted = muted)
    }

    fn register_control_change(
        &self,
        sink: Arc<dyn EventSink<VolumeChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError> {
        self.read(|_| ())?;

        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        self.shared
            .state
            .lock()
            .volume_clients
            .insert(
                token,
                VolumeClient {
                    device_id: self.device_id.clone(),
                    generation: self.generation,
                    sink,
                },
            );
        self.tokens.lock().push(token);

        Ok(Box::new(SimRegistration {
            shared: Arc::downgrade(&self.shared),
            token,
            kind: RegistrationKind::Volume,
        }))
    }
}

impl Drop for SimEndpointVolume {
    fn drop(&mut self) {
        // Releasing the object takes its callbacks with it
        let tokens = std::mem::take(&mut *self.tokens.lock());
        if !tokens.is_empty() {
            let mut state = self.shared.state.lock();
            for token in tokens {
                if state.volume_clients.remove(&token).is_some() {
                    tracing::debug!("Volume callback {} dropped with its endpoint object", token);
                }
            }
        }
        self.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
enum RegistrationKind {
    Endpoint,
    Volume,
}

struct SimRegistration {
    shared: Weak<Shared>,
    token: u64,
    kind: RegistrationKind,
}

impl NativeRegistration for SimRegistration {
    fn unregister(self: Box<Self>) -> Result<(), DeviceError> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };

        // Wait for the delivery thread to go quiet
        let _quiesced = shared.delivery.try_lock_for(TEARDOWN_TIMEOUT).ok_or_else(|| {
            DeviceError::Native(format!(
                "{:?} teardown blocked by an in-flight notification",
                self.kind
            ))
        })?;

        let mut state = shared.state.lock();
        match self.kind {
            RegistrationKind::Endpoint => {
                state.endpoint_clients.remove(&self.token);
            }
            RegistrationKind::Volume => {
                state.volume_clients.remove(&self.token);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_devices_not_listed() {
        let sim = SimulatedSubsystem::new();
        sim.add_device("Speakers", 2);
        sim.add_capture_device("Microphone");

        let devices = sim.render_endpoints().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Speakers");
    }

    #[test]
    fn test_releasing_endpoint_drops_its_callbacks() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);

        let endpoint = sim.activate_endpoint_volume(&speakers).unwrap();
        let (tx, rx) = unbounded::<VolumeChangeEvent>();
        let _registration = endpoint.register_control_change(Arc::new(tx)).unwrap();
        assert_eq!(sim.volume_listener_count(&speakers), 1);

        drop(endpoint);
        assert_eq!(sim.volume_listener_count(&speakers), 0);

        sim.set_external_volume(&speakers, 0.9);
        sim.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unchanged_value_is_not_notified() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);

        let endpoint = sim.activate_endpoint_volume(&speakers).unwrap();
        let (tx, rx) = unbounded::<VolumeChangeEvent>();
        let registration = endpoint.register_control_change(Arc::new(tx)).unwrap();

        endpoint.set_mute(false, OriginTag::generate()).unwrap();
        endpoint.set_master_volume(DEFAULT_LEVEL, OriginTag::generate()).unwrap();
        sim.flush();
        assert!(rx.try_recv().is_err());

        registration.unregister().unwrap();
    }

    #[test]
    fn test_disabling_invalidates_endpoint_objects() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);

        let stale = sim.activate_endpoint_volume(&speakers).unwrap();
        let (tx, rx) = unbounded::<VolumeChangeEvent>();
        let _registration = stale.register_control_change(Arc::new(tx)).unwrap();

        sim.set_device_state(&speakers, DeviceState::Disabled);
        sim.set_device_state(&speakers, DeviceState::Active);
        assert!(matches!(stale.master_volume(), Err(DeviceError::DeviceNotFound(_))));

        let fresh = sim.activate_endpoint_volume(&speakers).unwrap();
        assert_eq!(fresh.master_volume().unwrap(), DEFAULT_LEVEL);

        // Callbacks registered through the stale object stay silent
        sim.set_external_volume(&speakers, 0.9);
        sim.flush();
        assert!(rx.try_recv().is_err());

        sim.invalidate_endpoints(&speakers);
        assert!(fresh.mute().is_err());
    }

    #[test]
    fn test_notifications_keep_order() {
        let sim = SimulatedSubsystem::new();
        let speakers = sim.add_device("Speakers", 2);

        let (tx, rx) = unbounded::<DeviceChangeEvent>();
        let registration = sim.register_endpoint_notifications(Arc::new(tx)).unwrap();

        sim.set_device_state(&speakers, DeviceState::Disabled);
        sim.set_device_state(&speakers, DeviceState::Unplugged);
        sim.set_device_state(&speakers, DeviceState::Active);
        sim.flush();

        let states: Vec<_> = rx.try_iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![DeviceState::Disabled, DeviceState::Unplugged, DeviceState::Active]
        );

        registration.unregister().unwrap();
        assert_eq!(sim.device_listener_count(), 0);
    }
}
