//! Endpoint volume and mute control
//!
//! The control keeps one endpoint handle cached between calls. Releasing a
//! native endpoint volume object also drops every control-change callback
//! registered through it, so the active subscription holds its own reference
//! to the handle: `release()` can never silently end a subscription, only
//! `unsubscribe()` can.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::audio::device::DeviceId;
use crate::audio::notify::{ensure_outside_delivery, EventSink, VOLUME_CHANNEL};
use crate::error::{DeviceError, Result, SubscriptionError};
use crate::native::{AudioSubsystem, EndpointVolume, NativeRegistration};

/// Correlation id attached to volume and mute writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginTag(Uuid);

impl OriginTag {
    /// Fresh random tag
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Tag carried by changes nobody tagged (the nil GUID)
    pub fn external() -> Self {
        Self(Uuid::nil())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_external(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for OriginTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0)
    }
}

/// Volume and mute of one endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeState {
    /// Scalar volume in `[0.0, 1.0]`
    pub level: f32,
    pub muted: bool,
}

/// Volume or mute of the subscribed endpoint changed
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeChangeEvent {
    /// Tag of the write that caused the change
    pub origin: OriginTag,
    pub muted: bool,
    pub master_volume: f32,
    /// One entry per channel of the endpoint
    pub channel_volumes: Vec<f32>,
}

impl VolumeChangeEvent {
    pub fn channel_count(&self) -> usize {
        self.channel_volumes.len()
    }

    /// Whether the change was caused by a write tagged with `origin`
    pub fn is_from(&self, origin: &OriginTag) -> bool {
        &self.origin == origin
    }
}

struct VolumeHandle {
    device_id: DeviceId,
    endpoint: Box<dyn EndpointVolume>,
}

struct VolumeSubscription {
    /// Keeps the endpoint object, and so the native callback, alive
    handle: Arc<VolumeHandle>,
    registration: Box<dyn NativeRegistration>,
}

/// Per-device volume and mute, plus the volume-change channel
pub struct VolumeControl {
    subsystem: Arc<dyn AudioSubsystem>,
    origin: OriginTag,
    cached: Option<Arc<VolumeHandle>>,
    subscription: Option<VolumeSubscription>,
}

impl VolumeControl {
    pub fn new(subsystem: Arc<dyn AudioSubsystem>) -> Self {
        let origin = OriginTag::generate();
        tracing::debug!("Volume control origin tag {}", origin);
        Self {
            subsystem,
            origin,
            cached: None,
            subscription: None,
        }
    }

    /// Tag attached to every write made through this control
    pub fn origin(&self) -> OriginTag {
        self.origin
    }

    fn handle(
        &mut self,
        device_id: &DeviceId,
    ) -> std::result::Result<Arc<VolumeHandle>, DeviceError> {
        if let Some(handle) = &self.cached {
            if &handle.device_id == device_id {
                return Ok(Arc::clone(handle));
            }
        }

        if let Some(subscription) = &self.subscription {
            if &subscription.handle.device_id == device_id {
                let handle = Arc::clone(&subscription.handle);
                self.cached = Some(Arc::clone(&handle));
                return Ok(handle);
            }
        }

        let endpoint = self.subsystem.activate_endpoint_volume(device_id)?;
        tracing::debug!("Activated endpoint volume for {}", device_id);

        let handle = Arc::new(VolumeHandle {
            device_id: device_id.clone(),
            endpoint,
        });
        self.cached = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn with_endpoint<R>(
        &mut self,
        device_id: &DeviceId,
        op: impl FnOnce(&dyn EndpointVolume) -> std::result::Result<R, DeviceError>,
    ) -> std::result::Result<R, DeviceError> {
        let handle = self.handle(device_id)?;
        let result = op(handle.endpoint.as_ref());

        if let Err(DeviceError::DeviceNotFound(_)) = &result {
            // Stale handle; the next call activates a fresh one
            tracing::debug!("Dropping stale volume handle for {}", device_id);
            self.cached = None;
            self.drop_stale_subscription(&handle);
        }
        result
    }

    /// A subscription registered through an invalidated handle never fires
    /// again and would hand the dead handle back on the next call. Drop it;
    /// the owner sees `is_subscribed() == false` and subscribes again.
    fn drop_stale_subscription(&mut self, stale: &Arc<VolumeHandle>) {
        let is_stale = self
            .subscription
            .as_ref()
            .is_some_and(|subscription| Arc::ptr_eq(&subscription.handle, stale));
        if !is_stale || ensure_outside_delivery(VOLUME_CHANNEL).is_err() {
            return;
        }

        if let Some(subscription) = self.subscription.take() {
            if let Err(e) = subscription.registration.unregister() {
                tracing::debug!("Unregistering stale {} callback failed: {}", VOLUME_CHANNEL, e);
            }
            tracing::warn!(
                "Volume handle for {} was invalidated, {} subscription dropped",
                subscription.handle.device_id,
                VOLUME_CHANNEL
            );
        }
    }

    pub fn get_volume(&mut self, device_id: &DeviceId) -> std::result::Result<f32, DeviceError> {
        self.with_endpoint(device_id, |endpoint| endpoint.master_volume())
    }

    pub fn get_mute(&mut self, device_id: &DeviceId) -> std::result::Result<bool, DeviceError> {
        self.with_endpoint(device_id, |endpoint| endpoint.mute())
    }

    pub fn get_state(
        &mut self,
        device_id: &DeviceId,
    ) -> std::result::Result<VolumeState, DeviceError> {
        self.with_endpoint(device_id, |endpoint| {
            Ok(VolumeState {
                level: endpoint.master_volume()?,
                muted: endpoint.mute()?,
            })
        })
    }

    /// Set the scalar volume, clamped to `[0.0, 1.0]`. Mute is left alone.
    pub fn set_volume(
        &mut self,
        device_id: &DeviceId,
        level: f32,
    ) -> std::result::Result<(), DeviceError> {
        if !level.is_finite() {
            return Err(DeviceError::InvalidLevel(level));
        }
        let level = level.clamp(0.0, 1.0);
        let origin = self.origin;

        tracing::debug!("Set volume of {} to {:.3} (origin {})", device_id, level, origin);
        self.with_endpoint(device_id, |endpoint| endpoint.set_master_volume(level, origin))
    }

    pub fn set_mute(
        &mut self,
        device_id: &DeviceId,
        muted: bool,
    ) -> std::result::Result<(), DeviceError> {
        let origin = self.origin;

        tracing::debug!("Set mute of {} to {} (origin {})", device_id, muted, origin);
        self.with_endpoint(device_id, |endpoint| endpoint.set_mute(muted, origin))
    }

    /// Drop the cached handle. No-op when nothing is cached. An active
    /// subscription keeps its own reference and stays registered.
    pub fn release(&mut self) -> std::result::Result<(), SubscriptionError> {
        if self.cached.is_none() {
            return Ok(());
        }
        ensure_outside_delivery(VOLUME_CHANNEL)?;

        if let Some(handle) = self.cached.take() {
            tracing::debug!("Released volume handle for {}", handle.device_id);
        }
        Ok(())
    }

    /// Register `sink` for volume changes of `device_id`.
    ///
    /// A no-op while a subscription is already active.
    pub fn subscribe<S>(&mut self, device_id: &DeviceId, sink: S) -> Result<()>
    where
        S: EventSink<VolumeChangeEvent> + 'static,
    {
        if let Some(subscription) = &self.subscription {
            if &subscription.handle.device_id != device_id {
                tracing::warn!(
                    "Ignoring {} subscribe for {}: already subscribed to {}",
                    VOLUME_CHANNEL,
                    device_id,
                    subscription.handle.device_id
                );
            }
            return Ok(());
        }

        let handle = self.handle(device_id)?;
        let registration = handle.endpoint.register_control_change(Arc::new(sink))?;
        self.subscription = Some(VolumeSubscription {
            handle,
            registration,
        });

        tracing::info!("Subscribed to {} notifications of {}", VOLUME_CHANNEL, device_id);
        Ok(())
    }

    /// Remove the subscription and release the handle. No-op when not
    /// subscribed to `device_id`.
    pub fn unsubscribe(&mut self, device_id: &DeviceId) -> Result<()> {
        match &self.subscription {
            None => return Ok(()),
            Some(subscription) if &subscription.handle.device_id != device_id => {
                tracing::debug!(
                    "Ignoring {} unsubscribe for {}: subscribed to {}",
                    VOLUME_CHANNEL,
                    device_id,
                    subscription.handle.device_id
                );
                return Ok(());
            }
            Some(_) => {}
        }
        ensure_outside_delivery(VOLUME_CHANNEL)?;

        if let Some(subscription) = self.subscription.take() {
            let result = subscription.registration.unregister();
            if self
                .cached
                .as_ref()
                .is_some_and(|cached| Arc::ptr_eq(cached, &subscription.handle))
            {
                self.cached = None;
            }
            drop(subscription.handle);
            result?;
            tracing::info!("Unsubscribed from {} notifications of {}", VOLUME_CHANNEL, device_id);
        }
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn subscribed_device(&self) -> Option<&DeviceId> {
        self.subscription.as_ref().map(|s| &s.handle.device_id)
    }
}

impl Drop for VolumeControl {
    fn drop(&mut self) {
        let Some(device_id) = self.subscribed_device().cloned() else {
            self.cached = None;
            return;
        };
        if let Err(e) = self.unsubscribe(&device_id) {
            tracing::error!("Leaking {} registration on drop: {}", VOLUME_CHANNEL, e);
            if let Some(subscription) = self.subscription.take() {
                std::mem::forget(subscription);
            }
        }
        self.cached = None;
    }
}
