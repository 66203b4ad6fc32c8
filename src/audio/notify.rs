//! Notification subscriptions
//!
//! Native notifications are delivered on a thread owned by the audio
//! subsystem. Anything registered here must return quickly and must not tear
//! down a subscription inline: the native teardown waits for in-flight
//! deliveries to finish, which can never happen while the caller is one of
//! them. Channel-backed sinks (`crossbeam_channel::Sender`) are the intended
//! way to hand events to the controller's own loop.

use std::cell::Cell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};

use crate::audio::device::DeviceChangeEvent;
use crate::error::{Result, SubscriptionError};
use crate::native::{AudioSubsystem, NativeRegistration};

/// Name of the device-change channel in errors and logs
pub const DEVICE_CHANNEL: &str = "device-change";

/// Name of the volume-change channel in errors and logs
pub const VOLUME_CHANNEL: &str = "volume-change";

/// Receiver side of a notification channel
pub trait EventSink<E>: Send + Sync {
    /// Called on the native notification thread
    fn deliver(&self, event: E);
}

impl<E: Send> EventSink<E> for Sender<E> {
    fn deliver(&self, event: E) {
        match self.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Notification queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("Notification receiver dropped, discarding event");
            }
        }
    }
}

/// Closure adapter, see [`handler`]
pub struct FnSink<F>(F);

impl<E, F> EventSink<E> for FnSink<F>
where
    F: Fn(E) + Send + Sync,
{
    fn deliver(&self, event: E) {
        (self.0)(event)
    }
}

/// Wrap a closure as a sink. The closure runs on the notification thread.
pub fn handler<F>(f: F) -> FnSink<F> {
    FnSink(f)
}

thread_local! {
    static DELIVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running a notification delivery
pub struct DeliveryScope {
    _not_send: PhantomData<*const ()>,
}

impl DeliveryScope {
    pub fn enter() -> Self {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// True while the current thread is inside a notification delivery
pub fn in_delivery() -> bool {
    DELIVERY_DEPTH.with(|depth| depth.get() > 0)
}

/// Deliver one event from a native notification thread.
///
/// Panics in the sink are caught and logged; they must not unwind into the
/// native caller.
pub fn dispatch<E>(sink: &dyn EventSink<E>, event: E) {
    let _scope = DeliveryScope::enter();
    if panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(event))).is_err() {
        tracing::error!("Notification handler panicked");
    }
}

/// Refuse teardown while running inside a delivery
pub(crate) fn ensure_outside_delivery(
    channel: &'static str,
) -> std::result::Result<(), SubscriptionError> {
    if in_delivery() {
        tracing::error!("Refusing {} teardown from inside a notification callback", channel);
        return Err(SubscriptionError::ReentrantTeardown(channel));
    }
    Ok(())
}

/// Device-change channel: one system-wide listener at a time
pub struct DeviceNotifications {
    subsystem: Arc<dyn AudioSubsystem>,
    registration: Option<Box<dyn NativeRegistration>>,
}

impl DeviceNotifications {
    pub fn new(subsystem: Arc<dyn AudioSubsystem>) -> Self {
        Self {
            subsystem,
            registration: None,
        }
    }

    /// Register `sink` for every endpoint state change in the system.
    ///
    /// Fails with `AlreadySubscribed` while a registration is active.
    pub fn subscribe<S>(&mut self, sink: S) -> Result<()>
    where
        S: EventSink<DeviceChangeEvent> + 'static,
    {
        if self.registration.is_some() {
            return Err(SubscriptionError::AlreadySubscribed(DEVICE_CHANNEL).into());
        }

        let registration = self
            .subsystem
            .register_endpoint_notifications(Arc::new(sink))?;
        self.registration = Some(registration);

        tracing::info!("Subscribed to {} notifications", DEVICE_CHANNEL);
        Ok(())
    }

    /// Remove the registration; a no-op when none is active
    pub fn unsubscribe(&mut self) -> Result<()> {
        if self.registration.is_none() {
            return Ok(());
        }
        ensure_outside_delivery(DEVICE_CHANNEL)?;

        if let Some(registration) = self.registration.take() {
            registration.unregister()?;
            tracing::info!("Unsubscribed from {} notifications", DEVICE_CHANNEL);
        }
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.registration.is_some()
    }
}

impl Drop for DeviceNotifications {
    fn drop(&mut self) {
        if self.registration.is_none() {
            return;
        }
        if let Err(e) = self.unsubscribe() {
            tracing::error!("Leaking {} registration on drop: {}", DEVICE_CHANNEL, e);
            if let Some(registration) = self.registration.take() {
                std::mem::forget(registration);
            }
        }
    }
}
