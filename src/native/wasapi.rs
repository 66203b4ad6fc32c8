//! Windows Core Audio backend
//!
//! MMDevice API for enumeration and endpoint notifications,
//! `IAudioEndpointVolume` for master volume and mute. COM is initialised
//! (multithreaded apartment) around every call.

use std::ffi::c_void;
use std::sync::Arc;

use uuid::Uuid;
use windows::core::{implement, Result as WinResult, GUID, HSTRING, PCWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::{BOOL, ERROR_NOT_FOUND, RPC_E_CHANGED_MODE};
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::{
    eRender, EDataFlow, ERole, IAudioClient, IMMDevice, IMMDeviceEnumerator,
    IMMNotificationClient, IMMNotificationClient_Impl, MMDeviceEnumerator,
    AUDCLNT_E_DEVICE_INVALIDATED, AUDIO_VOLUME_NOTIFICATION_DATA, DEVICE_STATE,
    DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::StructuredStorage::PropVariantClear;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::UI::Shell::PropertiesSystem::{PropVariantToStringAlloc, PROPERTYKEY};

use crate::audio::device::{Device, DeviceChangeEvent, DeviceId, DeviceState};
use crate::audio::notify::{self, EventSink};
use crate::audio::volume::{OriginTag, VolumeChangeEvent};
use crate::error::DeviceError;
use crate::native::{AudioSubsystem, EndpointVolume, NativeRegistration};

/// Scoped COM initialisation
struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    fn enter() -> Result<Self, DeviceError> {
        // SAFETY: paired with CoUninitialize in Drop when it succeeded
        match unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) } {
            Ok(()) => Ok(Self { initialized: true }),
            // Thread already lives in an STA; COM is usable, just not ours to tear down
            Err(e) if e.code() == RPC_E_CHANGED_MODE => Ok(Self { initialized: false }),
            Err(e) => Err(DeviceError::SubsystemUnavailable(e.message().to_string())),
        }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            // SAFETY: balances the successful CoInitializeEx in `enter`
            unsafe { CoUninitialize() };
        }
    }
}

fn map_error(e: windows::core::Error, id: &DeviceId) -> DeviceError {
    let code = e.code();
    if code == AUDCLNT_E_DEVICE_INVALIDATED || code == ERROR_NOT_FOUND.to_hresult() {
        DeviceError::DeviceNotFound(id.to_string())
    } else {
        DeviceError::Native(format!("{}: {}", id, e.message()))
    }
}

fn native(e: windows::core::Error) -> DeviceError {
    DeviceError::Native(e.message().to_string())
}

fn origin_guid(origin: OriginTag) -> GUID {
    GUID::from_u128(origin.as_uuid().as_u128())
}

fn enumerator() -> Result<IMMDeviceEnumerator, DeviceError> {
    // SAFETY: plain in-process COM activation
    unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
        .map_err(|e| DeviceError::SubsystemUnavailable(e.message().to_string()))
}

fn open_device(enumerator: &IMMDeviceEnumerator, id: &DeviceId) -> Result<IMMDevice, DeviceError> {
    // SAFETY: the HSTRING outlives the call
    unsafe { enumerator.GetDevice(&HSTRING::from(id.as_str())) }.map_err(|e| map_error(e, id))
}

fn device_id(device: &IMMDevice) -> Result<DeviceId, DeviceError> {
    // SAFETY: GetId returns a CoTaskMemAlloc'd string that we free exactly once
    unsafe {
        let raw = device.GetId().map_err(native)?;
        let id = raw.to_string();
        CoTaskMemFree(Some(raw.0 as *const c_void));
        id.map(DeviceId::new)
            .map_err(|e| DeviceError::Native(e.to_string()))
    }
}

fn device_name(device: &IMMDevice, id: &DeviceId) -> Result<String, DeviceError> {
    // SAFETY: the PROPVARIANT is cleared and the allocated string freed once
    unsafe {
        let store = device.OpenPropertyStore(STGM_READ).map_err(|e| map_error(e, id))?;
        let mut value = store
            .GetValue(&PKEY_Device_FriendlyName)
            .map_err(|e| map_error(e, id))?;
        let text = PropVariantToStringAlloc(&value);
        let _ = PropVariantClear(&mut value);

        let text = text.map_err(|e| map_error(e, id))?;
        let name = text.to_string();
        CoTaskMemFree(Some(text.0 as *const c_void));
        name.map_err(|e| DeviceError::Native(e.to_string()))
    }
}

fn mix_channels(device: &IMMDevice) -> Result<u16, DeviceError> {
    // SAFETY: the mix format is CoTaskMemAlloc'd and freed after reading it
    unsafe {
        let client: IAudioClient = device.Activate(CLSCTX_ALL, None).map_err(native)?;
        let format = client.GetMixFormat().map_err(native)?;
        let channels = (*format).nChannels;
        CoTaskMemFree(Some(format as *const c_void));
        Ok(channels)
    }
}

/// Core Audio subsystem
pub struct WasapiSubsystem;

impl WasapiSubsystem {
    /// Fails with `SubsystemUnavailable` when the device enumerator cannot be
    /// created
    pub fn new() -> Result<Self, DeviceError> {
        let _com = ComGuard::enter()?;
        enumerator()?;
        Ok(Self)
    }
}

impl AudioSubsystem for WasapiSubsystem {
    fn name(&self) -> &'static str {
        "wasapi"
    }

    fn render_endpoints(&self) -> Result<Vec<Device>, DeviceError> {
        let _com = ComGuard::enter()?;
        let enumerator = enumerator()?;

        // SAFETY: collection access on a live enumerator
        let collection = unsafe { enumerator.EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE) }
            .map_err(native)?;
        let count = unsafe { collection.GetCount() }.map_err(native)?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = unsafe { collection.Item(index) }.map_err(native)?;
            let id = device_id(&device)?;
            let name = device_name(&device, &id)?;
            let channels = mix_channels(&device).unwrap_or_else(|e| {
                tracing::warn!("No mix format for {}: {}", name, e);
                0
            });
            devices.push(Device::new(id, name, channels));
        }
        Ok(devices)
    }

    fn friendly_name(&self, id: &DeviceId) -> Result<String, DeviceError> {
        let _com = ComGuard::enter()?;
        let device = open_device(&enumerator()?, id)?;
        device_name(&device, id)
    }

    fn activate_endpoint_volume(
        &self,
        id: &DeviceId,
    ) -> Result<Box<dyn EndpointVolume>, DeviceError> {
        let _com = ComGuard::enter()?;
        let device = open_device(&enumerator()?, id)?;

        // SAFETY: activation on a live device
        let endpoint: IAudioEndpointVolume =
            unsafe { device.Activate(CLSCTX_ALL, None) }.map_err(|e| map_error(e, id))?;

        Ok(Box::new(WasapiEndpointVolume {
            device_id: id.clone(),
            endpoint,
        }))
    }

    fn register_endpoint_notifications(
        &self,
        sink: Arc<dyn EventSink<DeviceChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError> {
        let _com = ComGuard::enter()?;
        let enumerator = enumerator()?;
        let client: IMMNotificationClient = EndpointNotifier { sink }.into();

        // SAFETY: the client stays referenced by the registration until unregistered
        unsafe { enumerator.RegisterEndpointNotificationCallback(&client) }.map_err(native)?;

        Ok(Box::new(EndpointRegistration { enumerator, client }))
    }
}

struct WasapiEndpointVolume {
    device_id: DeviceId,
    endpoint: IAudioEndpointVolume,
}

// SAFETY: endpoint volume objects are created in the multithreaded apartment
// and are free-threaded
unsafe impl Send for WasapiEndpointVolume {}
// SAFETY: see above
unsafe impl Sync for WasapiEndpointVolume {}

impl EndpointVolume for WasapiEndpointVolume {
    fn master_volume(&self) -> Result<f32, DeviceError> {
        let _com = ComGuard::enter()?;
        // SAFETY: call on a live interface
        unsafe { self.endpoint.GetMasterVolumeLevelScalar() }
            .map_err(|e| map_error(e, &self.device_id))
    }

    fn set_master_volume(&self, level: f32, origin: OriginTag) -> Result<(), DeviceError> {
        let _com = ComGuard::enter()?;
        let context = origin_guid(origin);
        // SAFETY: the context GUID outlives the call
        unsafe { self.endpoint.SetMasterVolumeLevelScalar(level, &context) }
            .map_err(|e| map_error(e, &self.device_id))
    }

    fn mute(&self) -> Result<bool, DeviceError> {
        let _com = ComGuard::enter()?;
        // SAFETY: call on a live interface
        unsafe { self.endpoint.GetMute() }
            .map(|muted| muted.as_bool())
            .map_err(|e| map_error(e, &self.device_id))
    }

    fn set_mute(&self, muted: bool, origin: OriginTag) -> Result<(), DeviceError> {
        let _com = ComGuard::enter()?;
        let context = origin_guid(origin);
        // SAFETY: the context GUID outlives the call
        unsafe { self.endpoint.SetMute(BOOL::from(muted), &context) }
            .map_err(|e| map_error(e, &self.device_id))
    }

    fn register_control_change(
        &self,
        sink: Arc<dyn EventSink<VolumeChangeEvent>>,
    ) -> Result<Box<dyn NativeRegistration>, DeviceError> {
        let _com = ComGuard::enter()?;
        let callback: IAudioEndpointVolumeCallback = VolumeCallback { sink }.into();

        // SAFETY: the callback stays referenced by the registration until unregistered
        unsafe { self.endpoint.RegisterControlChangeNotify(&callback) }
            .map_err(|e| map_error(e, &self.device_id))?;

        Ok(Box::new(VolumeRegistration {
            endpoint: self.endpoint.clone(),
            callback,
        }))
    }
}

struct EndpointRegistration {
    enumerator: IMMDeviceEnumerator,
    client: IMMNotificationClient,
}

// SAFETY: MMDevice enumerator objects live in the multithreaded apartment
unsafe impl Send for EndpointRegistration {}

impl NativeRegistration for EndpointRegistration {
    fn unregister(self: Box<Self>) -> Result<(), DeviceError> {
        let _com = ComGuard::enter()?;
        // SAFETY: unregisters the client registered in `register_endpoint_notifications`
        unsafe { self.enumerator.UnregisterEndpointNotificationCallback(&self.client) }
            .map_err(native)
    }
}

struct VolumeRegistration {
    endpoint: IAudioEndpointVolume,
    callback: IAudioEndpointVolumeCallback,
}

// SAFETY: see WasapiEndpointVolume
unsafe impl Send for VolumeRegistration {}

impl NativeRegistration for VolumeRegistration {
    fn unregister(self: Box<Self>) -> Result<(), DeviceError> {
        let _com = ComGuard::enter()?;
        // SAFETY: unregisters the callback registered in `register_control_change`
        unsafe { self.endpoint.UnregisterControlChangeNotify(&self.callback) }.map_err(native)
    }
}

#[implement(IMMNotificationClient)]
struct EndpointNotifier {
    sink: Arc<dyn EventSink<DeviceChangeEvent>>,
}

impl IMMNotificationClient_Impl for EndpointNotifier {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> WinResult<()> {
        // SAFETY: the id string is valid for the duration of the callback
        let id = match unsafe { pwstrdeviceid.to_string() } {
            Ok(id) => DeviceId::new(id),
            Err(e) => {
                tracing::warn!("Unreadable endpoint id in state change: {}", e);
                return Ok(());
            }
        };

        match DeviceState::from_bits(dwnewstate.0) {
            Some(state) => notify::dispatch(self.sink.as_ref(), DeviceChangeEvent::new(id, state)),
            None => tracing::warn!("Unknown state {:#x} for {}", dwnewstate.0, id),
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, _pwstrdeviceid: &PCWSTR) -> WinResult<()> {
        Ok(())
    }

    fn OnDeviceRemoved(&self, _pwstrdeviceid: &PCWSTR) -> WinResult<()> {
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        _flow: EDataFlow,
        _role: ERole,
        _pwstrdefaultdeviceid: &PCWSTR,
    ) -> WinResult<()> {
        Ok(())
    }

    fn OnPropertyValueChanged(&self, _pwstrdeviceid: &PCWSTR, _key: &PROPERTYKEY) -> WinResult<()> {
        Ok(())
    }
}

#[implement(IAudioEndpointVolumeCallback)]
struct VolumeCallback {
    sink: Arc<dyn EventSink<VolumeChangeEvent>>,
}

impl IAudioEndpointVolumeCallback_Impl for VolumeCallback {
    fn OnNotify(&self, pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> WinResult<()> {
        // SAFETY: the notification data is valid for the duration of the callback
        let Some(data) = (unsafe { pnotify.as_ref() }) else {
            return Ok(());
        };

        // afChannelVolumes is declared with one element but holds nChannels
        let first = data.afChannelVolumes.as_ptr();
        // SAFETY: the subsystem allocates nChannels entries
        let channel_volumes =
            unsafe { std::slice::from_raw_parts(first, data.nChannels as usize) }.to_vec();

        let event = VolumeChangeEvent {
            origin: OriginTag::from_uuid(Uuid::from_u128(data.guidEventContext.to_u128())),
            muted: data.bMuted.as_bool(),
            master_volume: data.fMasterVolume,
            channel_volumes,
        };
        notify::dispatch(self.sink.as_ref(), event);
        Ok(())
    }
}
