//! Device manager
//!
//! Owns the device registry, at most one current device and the None device.
//! All methods run on the control thread. HAL hot-plug callbacks only bump a
//! sequence number that [`DeviceManager::idle`] picks up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{AppConfig, BackendKind, ManagerConfig, NoneDeviceConfig};
use crate::device::{none_device_caps, AudioDevice, CallbackDevice, ConnectionState, DriverDevice, NullDevice};
use crate::error::{DeviceError, DeviceResult, HalResult, Result};
use crate::hal::cpal_driver::CpalDriverHost;
use crate::hal::cpal_host::CpalHal;
use crate::hal::software::{SoftwareDeviceSpec, SoftwareDriverHost, SoftwareHal};
use crate::hal::{CallbackHal, DeviceListListener, DriverHost, HalDeviceCaps};
use crate::info::{DeviceFilter, DeviceInfo, DeviceRegistry, NONE_DEVICE_NAME};
use crate::notification::{DeviceClient, Notification, Notifier};

/// The native HAL family a manager drives
#[derive(Clone)]
pub enum HostApi {
    Callback(Arc<dyn CallbackHal>),
    Driver(Arc<dyn DriverHost>),
}

impl HostApi {
    /// cpal-backed host for the configured backend family
    pub fn from_config(config: &ManagerConfig) -> HalResult<Self> {
        Ok(match config.backend {
            BackendKind::Callback => HostApi::Callback(Arc::new(CpalHal::new(config.host.clone())?)),
            BackendKind::Driver => HostApi::Driver(Arc::new(CpalDriverHost::new(config.host.clone())?)),
        })
    }

    /// Virtual devices only, no hardware involved
    pub fn software(backend: BackendKind, specs: Vec<SoftwareDeviceSpec>) -> Self {
        match backend {
            BackendKind::Callback => HostApi::Callback(Arc::new(SoftwareHal::new(specs))),
            BackendKind::Driver => HostApi::Driver(Arc::new(SoftwareDriverHost::new(specs))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostApi::Callback(hal) => hal.name(),
            HostApi::Driver(host) => host.name(),
        }
    }

    fn device_caps(&self, name: &str) -> HalResult<HalDeviceCaps> {
        match self {
            HostApi::Callback(hal) => hal.device_caps(name),
            HostApi::Driver(host) => host.probe(name),
        }
    }

    fn set_device_list_listener(&self, listener: Option<DeviceListListener>) -> bool {
        match self {
            HostApi::Callback(hal) => hal.set_device_list_listener(listener),
            HostApi::Driver(host) => host.set_device_list_listener(listener),
        }
    }

    fn open(&self, name: &str, notifier: Notifier, config: &ManagerConfig) -> DeviceResult<AudioDevice> {
        Ok(match self {
            HostApi::Callback(hal) => AudioDevice::Callback(CallbackDevice::open(hal.clone(), name, notifier, config)?),
            HostApi::Driver(host) => AudioDevice::Driver(DriverDevice::open(host.clone(), name, notifier, config)?),
        })
    }
}

impl std::fmt::Debug for HostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HostApi").field(&self.name()).finish()
    }
}

pub struct DeviceManager {
    config: ManagerConfig,
    none_config: NoneDeviceConfig,
    host: HostApi,
    registry: DeviceRegistry,
    notifier: Notifier,
    current: Option<AudioDevice>,
    /// The None device while another device is current
    parked_none: Option<NullDevice>,
    list_changes: Arc<AtomicU64>,
    seen_list_changes: u64,
    hotplug_events: bool,
    last_scan: Instant,
}

impl DeviceManager {
    /// Create a manager and run a first enumeration.
    ///
    /// A failing first enumeration is logged; the registry then holds only
    /// the None device.
    pub fn new(config: AppConfig, host: HostApi, client: Option<Arc<dyn DeviceClient>>) -> Result<Self> {
        config.validate()?;
        let AppConfig { manager, none_device } = config;
        let notifier = Notifier::new(client);

        let list_changes = Arc::new(AtomicU64::new(0));
        let counter = list_changes.clone();
        let hotplug_events = host.set_device_list_listener(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        })));

        let mut this = Self {
            registry: DeviceRegistry::new(none_device_caps().to_info(0)),
            parked_none: Some(Self::make_none(&none_device, &notifier, &manager)),
            config: manager,
            none_config: none_device,
            host,
            notifier,
            current: None,
            list_changes,
            seen_list_changes: 0,
            hotplug_events,
            last_scan: Instant::now(),
        };
        if let Err(e) = this.enumerate() {
            tracing::warn!(host = this.host.name(), error = %e, "initial enumeration failed");
        }
        tracing::info!(
            host = this.host.name(),
            devices = this.registry.len(),
            hotplug_events,
            "device manager ready"
        );
        Ok(this)
    }

    /// Manager on the cpal host named by the configuration
    pub fn from_config(config: AppConfig, client: Option<Arc<dyn DeviceClient>>) -> Result<Self> {
        let host = HostApi::from_config(&config.manager)?;
        Self::new(config, host, client)
    }

    fn make_none(config: &NoneDeviceConfig, notifier: &Notifier, manager: &ManagerConfig) -> NullDevice {
        NullDevice::new(config, notifier.clone(), manager.buffer_size_policy)
    }

    pub fn host(&self) -> &HostApi {
        &self.host
    }

    pub fn filter(&self) -> DeviceFilter {
        self.config.filter
    }

    /// Change the device-class filter and re-enumerate
    pub fn set_filter(&mut self, filter: DeviceFilter) -> DeviceResult<()> {
        self.config.filter = filter;
        self.enumerate()
    }

    /// Query the HAL and publish a new registry.
    ///
    /// Devices that fail to report capabilities are skipped. A current
    /// driver device is never re-probed, and an open callback device that
    /// the HAL hides keeps its live capabilities.
    pub fn enumerate(&mut self) -> DeviceResult<()> {
        self.last_scan = Instant::now();
        self.seen_list_changes = self.list_changes.load(Ordering::Acquire);

        let live = self
            .current
            .as_ref()
            .filter(|d| !d.is_none_device() && d.connection_state() != ConnectionState::Disconnected);
        let current_open = live.map_or(false, |d| d.is_active());
        let current = live.map(|d| d.info());
        let found: Vec<HalResult<DeviceInfo>> = match &self.host {
            HostApi::Callback(hal) => {
                let mut found: Vec<HalResult<DeviceInfo>> = hal
                    .enumerate()?
                    .into_iter()
                    .map(|caps| caps.map(|c| c.to_info(0)))
                    .collect();
                // An open device can be hidden from enumeration while in use.
                // Its loss arrives as DeviceDied instead.
                if let Some(info) = current.filter(|_| current_open) {
                    let listed = found.iter().any(|r| matches!(r, Ok(i) if i.name == info.name));
                    if !listed {
                        tracing::debug!(device = %info.name, "open device missing from enumeration, keeping it");
                        let slot = self
                            .registry
                            .position(&info.name)
                            .map_or(found.len(), |p| p.saturating_sub(1).min(found.len()));
                        found.insert(slot, Ok(info));
                    }
                }
                found
            }
            HostApi::Driver(host) => host
                .driver_names()?
                .into_iter()
                .map(|name| match &current {
                    Some(info) if info.name == name => Ok(info.clone()),
                    _ => host.probe(&name).map(|c| c.to_info(0)),
                })
                .collect(),
        };

        let mut candidates = Vec::with_capacity(found.len());
        for result in found {
            match result {
                Ok(info) if self.config.filter.admits(&info) => candidates.push(info),
                Ok(info) => tracing::debug!(device = %info.name, filter = ?self.config.filter, "device filtered out"),
                Err(e) => tracing::warn!(error = %e, "skipping device that failed to report capabilities"),
            }
        }

        let changed = self.registry.replace(candidates);
        if !changed {
            return Ok(());
        }
        tracing::info!(devices = ?self.registry.names(), "device list changed");

        let Some(device) = self.current.as_mut() else {
            self.notifier.notify(Notification::DeviceListChanged);
            return Ok(());
        };
        let name = device.name().to_string();
        if self.registry.contains(&name) {
            device.mark_available();
            self.notifier.notify(Notification::DeviceListChanged);
        } else {
            device.mark_disconnected();
            self.notifier.notify(Notification::DeviceConnectionLost { name: &name });
        }
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.registry.snapshot()
    }

    pub fn find_device_by_name(&self, name: &str) -> Option<DeviceInfo> {
        self.registry.find_by_name(name)
    }

    pub fn current_device(&self) -> Option<&AudioDevice> {
        self.current.as_ref()
    }

    pub fn current_device_mut(&mut self) -> Option<&mut AudioDevice> {
        self.current.as_mut()
    }

    /// Replace the current device with the one named `name`.
    ///
    /// The previous device is torn down first. On failure there is no
    /// current device; the error is logged and reported to the client.
    pub fn init_new_current_device(&mut self, name: &str) -> Option<&mut AudioDevice> {
        self.destroy_current_device();

        let opened = if name == NONE_DEVICE_NAME {
            Ok(self.take_none())
        } else if !self.registry.contains(name) {
            Err(DeviceError::DeviceNotFound(name.to_string()))
        } else {
            self.host.open(name, self.notifier.clone(), &self.config)
        };

        match opened {
            Ok(device) => {
                tracing::info!(device = %name, kind = ?device.kind(), "current device changed");
                self.current = Some(device);
            }
            Err(e) => {
                tracing::error!(device = %name, error = %e, "could not open device");
                let message = e.to_string();
                self.notifier.notify(Notification::DeviceError { message: &message });
            }
        }
        self.current.as_mut()
    }

    fn take_none(&mut self) -> AudioDevice {
        let none = self.parked_none.take().unwrap_or_else(|| {
            Self::make_none(&self.none_config, &self.notifier, &self.config)
        });
        AudioDevice::None(none)
    }

    /// Stop, deactivate and release the current device. The None device is
    /// parked for reuse.
    pub fn destroy_current_device(&mut self) {
        match self.current.take() {
            Some(AudioDevice::None(mut none)) => {
                none.close();
                self.parked_none = Some(none);
            }
            Some(mut device) => {
                if let Err(e) = device.set_active(false) {
                    tracing::warn!(device = %device.name(), error = %e, "error while releasing device");
                }
                tracing::info!(device = %device.name(), "device released");
            }
            None => {}
        }
    }

    /// Forward a notification to the client, if any
    pub fn notify_client(&self, notification: Notification<'_>) {
        self.notifier.notify(notification);
    }

    /// Sample rates of `name`: live device, then registry, then the HAL
    pub fn device_sample_rates(&self, name: &str) -> Vec<u32> {
        if let Some(device) = self.current.as_ref().filter(|d| d.name() == name) {
            return device.sample_rates().to_vec();
        }
        if let Some(info) = self.registry.find_by_name(name) {
            return info.sample_rates;
        }
        self.query_caps(name).map(|c| c.sample_rates).unwrap_or_default()
    }

    /// Buffer sizes of `name`: live device, then registry, then the HAL
    pub fn device_buffer_sizes(&self, name: &str) -> Vec<u32> {
        if let Some(device) = self.current.as_ref().filter(|d| d.name() == name) {
            return device.buffer_sizes().to_vec();
        }
        if let Some(info) = self.registry.find_by_name(name) {
            return info.buffer_sizes;
        }
        self.query_caps(name).map(|c| c.buffer_sizes).unwrap_or_default()
    }

    fn query_caps(&self, name: &str) -> Option<HalDeviceCaps> {
        match self.host.device_caps(name) {
            Ok(caps) => Some(caps),
            Err(e) => {
                tracing::debug!(device = %name, error = %e, "capability query failed");
                None
            }
        }
    }

    /// Non-real-time housekeeping: report device events and pick up
    /// hot-plug changes. Call this periodically from the control thread.
    pub fn idle(&mut self) {
        if let Some(device) = self.current.as_mut() {
            device.idle();
        }

        let listed = self.list_changes.load(Ordering::Acquire) != self.seen_list_changes;
        let poll_due = !self.hotplug_events
            && self
                .config
                .hotplug_poll()
                .map_or(false, |interval| self.last_scan.elapsed() >= interval);
        if listed || poll_due {
            if let Err(e) = self.enumerate() {
                tracing::warn!(error = %e, "re-enumeration failed");
            }
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.host.set_device_list_listener(None);
        self.destroy_current_device();
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("host", &self.host)
            .field("devices", &self.registry.len())
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferSizePolicy, TimeoutConfig};
    use crate::device::DeviceKind;
    use crate::hal::{DriverMessage, HalProperty};
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    /// Records notifications as strings, audio callbacks as frame counts
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        frames: Mutex<Vec<usize>>,
        nonzero_input: Mutex<bool>,
    }

    impl Recorder {
        fn count(&self, reason: &str) -> usize {
            self.events.lock().iter().filter(|e| e.as_str() == reason).count()
        }

        fn callbacks(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl DeviceClient for Recorder {
        fn notify(&self, notification: Notification<'_>) {
            match notification {
                Notification::AudioCallback(data) => {
                    if data.input.map_or(false, |i| i.iter().any(|&s| s != 0.0)) {
                        *self.nonzero_input.lock() = true;
                    }
                    self.frames.lock().push(data.frames);
                }
                other => self.events.lock().push(other.reason().to_string()),
            }
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.manager.hotplug_poll_ms = 0;
        config.manager.timeouts = TimeoutConfig {
            rate_change_ms: 200,
            rate_poll_ms: 5,
            command_ms: 2000,
            reinit_retries: 3,
            reinit_retry_delay_ms: 10,
        };
        config
    }

    fn manager_with(host: HostApi, config: AppConfig) -> (DeviceManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let manager = DeviceManager::new(config, host, Some(recorder.clone() as Arc<dyn DeviceClient>))
            .expect("valid configuration");
        (manager, recorder)
    }

    fn callback_manager(specs: Vec<SoftwareDeviceSpec>) -> (DeviceManager, Arc<Recorder>, SoftwareHal) {
        let hal = SoftwareHal::new(specs);
        let (manager, recorder) = manager_with(HostApi::Callback(Arc::new(hal.clone())), fast_config());
        (manager, recorder, hal)
    }

    fn driver_manager(specs: Vec<SoftwareDeviceSpec>) -> (DeviceManager, Arc<Recorder>, SoftwareDriverHost) {
        let host = SoftwareDriverHost::new(specs);
        let mut config = fast_config();
        config.manager.backend = BackendKind::Driver;
        let (manager, recorder) = manager_with(HostApi::Driver(Arc::new(host.clone())), config);
        (manager, recorder, host)
    }

    fn interface() -> SoftwareDeviceSpec {
        SoftwareDeviceSpec::new("Interface", 2, 2).with_buffer_sizes(&[64, 128, 256, 512], 256)
    }

    #[test]
    fn test_registry_has_exactly_one_none_entry() {
        let (mut manager, _, _) = callback_manager(SoftwareDeviceSpec::demo_set());
        manager.enumerate().unwrap();
        let devices = manager.list_devices();
        assert_eq!(devices.iter().filter(|d| d.name == NONE_DEVICE_NAME).count(), 1);
        assert_eq!(devices[0].name, NONE_DEVICE_NAME);
        assert_eq!(devices.len(), 4);
    }

    #[test]
    fn test_enumerate_is_idempotent() {
        let (mut manager, recorder, _) = callback_manager(SoftwareDeviceSpec::demo_set());
        let first = manager.list_devices();
        manager.enumerate().unwrap();
        manager.enumerate().unwrap();
        assert_eq!(manager.list_devices(), first);
        // Only the first pass changed anything.
        assert_eq!(recorder.count("device-list-changed"), 1);
    }

    #[test]
    fn test_input_only_filter() {
        let hal = SoftwareHal::new(vec![
            SoftwareDeviceSpec::new("Speakers", 0, 2),
            SoftwareDeviceSpec::new("Mic", 1, 0),
        ]);
        let mut config = fast_config();
        config.manager.filter = DeviceFilter::InputOnly;
        let (manager, _) = manager_with(HostApi::Callback(Arc::new(hal)), config);
        assert!(manager.find_device_by_name("Speakers").is_none());
        assert!(manager.find_device_by_name("Mic").is_some());
        assert!(manager.find_device_by_name(NONE_DEVICE_NAME).is_some());
    }

    #[test]
    fn test_failing_device_is_skipped() {
        let (manager, _, _) = callback_manager(vec![
            interface(),
            SoftwareDeviceSpec::new("Broken", 2, 2).failing_probe(),
        ]);
        assert!(manager.find_device_by_name("Interface").is_some());
        assert!(manager.find_device_by_name("Broken").is_none());
    }

    #[test]
    fn test_enumeration_failure_keeps_registry() {
        let (mut manager, _, hal) = callback_manager(vec![interface()]);
        hal.set_enumeration_failure(true);
        assert!(manager.enumerate().is_err());
        assert!(manager.find_device_by_name("Interface").is_some());
    }

    #[test]
    fn test_unknown_device_leaves_no_current() {
        let (mut manager, recorder, _) = callback_manager(vec![interface()]);
        assert!(manager.init_new_current_device(NONE_DEVICE_NAME).is_some());
        assert!(manager.init_new_current_device("Nope").is_none());
        assert!(manager.current_device().is_none());
        assert_eq!(recorder.count("device-error"), 1);
    }

    #[test]
    fn test_nearest_buffer_size_substitution() {
        let (mut manager, recorder, hal) = callback_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        assert_eq!(device.set_current_buffer_size(100).unwrap(), 128);
        assert_eq!(device.current_buffer_size(), 128);
        assert_eq!(recorder.count("buffer-size-changed"), 1);

        device.set_active(true).unwrap();
        assert_eq!(hal.buffer_size("Interface"), Some(128));
    }

    #[test]
    fn test_strict_buffer_size_rejects() {
        let hal = SoftwareHal::new(vec![interface()]);
        let mut config = fast_config();
        config.manager.buffer_size_policy = BufferSizePolicy::Strict;
        let (mut manager, _) = manager_with(HostApi::Callback(Arc::new(hal)), config);
        let device = manager.init_new_current_device("Interface").unwrap();
        assert!(matches!(
            device.set_current_buffer_size(100),
            Err(DeviceError::NotSupported(_))
        ));
        assert_eq!(device.current_buffer_size(), 256);
    }

    #[test]
    fn test_none_device_streams_zero_input() {
        let mut config = fast_config();
        config.none_device.buffer_size = 128;
        let (mut manager, recorder) = manager_with(HostApi::software(BackendKind::Callback, vec![]), config);

        let device = manager.init_new_current_device(NONE_DEVICE_NAME).unwrap();
        assert_eq!(device.kind(), DeviceKind::None);
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        thread::sleep(Duration::from_millis(50));
        device.set_active(false).unwrap();

        let frames = recorder.frames.lock().clone();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|&f| f == 128));
        assert!(!*recorder.nonzero_input.lock());
    }

    #[test]
    fn test_none_device_is_reused() {
        let (mut manager, _, _) = callback_manager(vec![interface()]);
        manager
            .init_new_current_device(NONE_DEVICE_NAME)
            .unwrap()
            .set_current_sampling_rate(96000)
            .unwrap();
        manager.init_new_current_device("Interface").unwrap();
        let device = manager.init_new_current_device(NONE_DEVICE_NAME).unwrap();
        assert_eq!(device.current_sampling_rate(), 96000);
    }

    #[test]
    fn test_switching_devices_never_overlaps_units() {
        let (mut manager, _, hal) = callback_manager(vec![
            interface(),
            SoftwareDeviceSpec::new("Second", 2, 2),
        ]);
        for name in ["Interface", "Second", "Interface"] {
            let device = manager.init_new_current_device(name).unwrap();
            device.set_active(true).unwrap();
            device.set_streaming(true).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        manager.destroy_current_device();
        assert_eq!(hal.peak_open_units(), 1);
        assert_eq!(hal.open_units(), 0);
    }

    #[test]
    fn test_double_start_is_noop() {
        let (mut manager, recorder, hal) = callback_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        device.set_streaming(true).unwrap();
        assert_eq!(recorder.count("device-started-streaming"), 1);
        assert_eq!(hal.open_units(), 1);
    }

    #[test]
    fn test_no_callback_after_deactivation() {
        let (mut manager, recorder, _) = callback_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        thread::sleep(Duration::from_millis(30));
        device.set_active(false).unwrap();
        assert!(!device.is_streaming());

        let seen = recorder.callbacks();
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(recorder.callbacks(), seen);
    }

    #[test]
    fn test_repeated_resets_notify_once() {
        let (mut manager, recorder, hal) = callback_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();

        hal.fire_property("Interface", HalProperty::DeviceReconfigured);
        hal.fire_property("Interface", HalProperty::DeviceReconfigured);
        manager.idle();
        manager.idle();
        assert_eq!(recorder.count("request-reset"), 1);
    }

    #[test]
    fn test_external_rate_change() {
        let (mut manager, recorder, hal) = callback_manager(vec![interface()]);
        manager.init_new_current_device("Interface").unwrap().set_active(true).unwrap();
        hal.change_nominal_rate("Interface", 96000).unwrap();
        manager.idle();
        assert_eq!(manager.current_device().unwrap().current_sampling_rate(), 96000);
        assert_eq!(recorder.count("sampling-rate-changed"), 1);
    }

    #[test]
    fn test_slow_rate_switch_times_out() {
        let (mut manager, _, _) = callback_manager(vec![interface().with_rate_settle_polls(10_000)]);
        let device = manager.init_new_current_device("Interface").unwrap();
        let err = device.set_current_sampling_rate(96000).unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[test]
    fn test_unplug_reports_connection_lost() {
        let (mut manager, recorder, hal) = callback_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();

        assert!(hal.remove_device("Interface"));
        manager.idle();

        assert_eq!(recorder.count("device-connection-lost"), 1);
        let device = manager.current_device().unwrap();
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
        assert!(!device.is_active());
        assert!(manager.find_device_by_name("Interface").is_none());

        // Plugging it back in makes it usable again.
        hal.add_device(interface());
        manager.idle();
        assert_eq!(
            manager.current_device().unwrap().connection_state(),
            ConnectionState::Available
        );
        manager.current_device_mut().unwrap().set_active(true).unwrap();
    }

    #[test]
    fn test_hotplug_adds_device() {
        let (mut manager, recorder, hal) = callback_manager(vec![interface()]);
        hal.add_device(SoftwareDeviceSpec::new("Late", 2, 2));
        manager.idle();
        assert!(manager.find_device_by_name("Late").is_some());
        assert_eq!(recorder.count("device-list-changed"), 2);
    }

    #[test]
    fn test_open_device_hidden_from_enumeration_stays_current() {
        let (mut manager, recorder, hal) = callback_manager(vec![
            interface(),
            SoftwareDeviceSpec::new("Second", 2, 2),
        ]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();

        // A device in use stops answering capability queries; a hot-plug triggers a rescan.
        hal.set_capability_failure("Interface", true);
        hal.add_device(SoftwareDeviceSpec::new("Late", 2, 2));
        manager.idle();

        let names: Vec<String> = manager.list_devices().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec![NONE_DEVICE_NAME, "Interface", "Second", "Late"]);
        assert_eq!(recorder.count("device-connection-lost"), 0);
        let device = manager.current_device().unwrap();
        assert!(device.is_streaming());
        assert_eq!(device.connection_state(), ConnectionState::Available);
        assert_eq!(hal.open_units(), 1);

        // Once closed, the HAL's answer stands.
        manager.current_device_mut().unwrap().set_active(false).unwrap();
        manager.enumerate().unwrap();
        assert!(manager.find_device_by_name("Interface").is_none());
        assert_eq!(recorder.count("device-connection-lost"), 1);
    }

    #[test]
    fn test_every_supported_rate_and_size_reads_back() {
        let (mut callback, _, _) = callback_manager(vec![interface()]);
        let (mut driver, _, host) = driver_manager(vec![interface()]);

        for manager in [&mut callback, &mut driver] {
            let device = manager.init_new_current_device("Interface").unwrap();
            device.set_active(true).unwrap();
            let rates = device.sample_rates().to_vec();
            assert_eq!(rates, vec![44100, 48000, 88200, 96000]);
            for rate in rates {
                device.set_current_sampling_rate(rate).unwrap();
                for size in device.buffer_sizes().to_vec() {
                    assert_eq!(device.set_current_buffer_size(size).unwrap(), size);
                    assert_eq!(device.current_sampling_rate(), rate);
                    assert_eq!(device.current_buffer_size(), size);
                }
            }
            assert!(device.is_active());
            assert_eq!(device.connection_state(), ConnectionState::Available);
        }
        assert_eq!(host.affinity_violations(), 0);
    }

    #[test]
    fn test_capability_lookup_fallbacks() {
        let (mut manager, _, _) = callback_manager(vec![
            interface().with_high_rate_min_buffer(256).with_sample_rates(&[48000, 192000]),
            SoftwareDeviceSpec::new("Mic", 1, 0),
        ]);
        manager.set_filter(DeviceFilter::OutputOnly).unwrap();
        assert!(manager.find_device_by_name("Mic").is_none());
        // Not registered any more, so the HAL answers.
        assert_eq!(manager.device_buffer_sizes("Mic"), vec![64, 128, 256, 512, 1024]);

        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_current_sampling_rate(192000).unwrap();
        // Live data wins over the registry snapshot.
        assert_eq!(manager.device_buffer_sizes("Interface"), vec![256, 512]);
        assert_eq!(manager.device_sample_rates("Interface"), vec![48000, 192000]);
        assert!(manager.device_sample_rates("Missing").is_empty());
    }

    #[test]
    fn test_driver_device_streams_on_one_thread() {
        let (mut manager, recorder, host) = driver_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        assert_eq!(device.kind(), DeviceKind::Driver);
        device.set_current_buffer_size(128).unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(device.output_latency().unwrap(), 32);
        device.show_config_panel().unwrap();
        device.set_active(false).unwrap();

        assert!(recorder.frames.lock().iter().all(|&f| f == 128));
        assert!(recorder.callbacks() > 0);
        assert_eq!(host.panel_opens("Interface"), 1);

        manager.enumerate().unwrap();
        manager.destroy_current_device();
        assert_eq!(host.affinity_violations(), 0);
        assert_eq!(host.loaded_drivers(), 0);
    }

    #[test]
    fn test_driver_messages_become_notifications() {
        let (mut manager, recorder, host) = driver_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();

        assert!(host.post_message("Interface", DriverMessage::ResyncRequest));
        assert!(host.post_message("Interface", DriverMessage::ResyncRequest));
        assert!(host.post_message("Interface", DriverMessage::LatenciesChanged));
        // The worker drains driver messages on its own thread.
        thread::sleep(Duration::from_millis(50));
        manager.idle();

        assert_eq!(recorder.count("request-resync"), 1);
        assert_eq!(recorder.count("latency-changed"), 1);
    }

    #[test]
    fn test_driver_buffer_size_request_restarts_device() {
        let (mut manager, recorder, host) = driver_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();

        assert!(host.post_message("Interface", DriverMessage::BufferSizeChange(512)));
        thread::sleep(Duration::from_millis(50));
        manager.idle();

        let device = manager.current_device().unwrap();
        assert_eq!(device.current_buffer_size(), 512);
        assert!(device.is_streaming());
        assert_eq!(recorder.count("buffer-size-changed"), 1);
        assert_eq!(host.affinity_violations(), 0);
    }

    #[test]
    fn test_driver_reset_retries_reload() {
        let (mut manager, _, host) = driver_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();

        host.fail_next_loads("Interface", 2);
        device.reset_device().unwrap();
        assert!(device.is_streaming());
        assert_eq!(device.connection_state(), ConnectionState::Available);
        // One initial load, two failed retries are not counted, one success.
        assert_eq!(host.loads("Interface"), 2);
        assert_eq!(host.peak_loaded_drivers(), 1);
    }

    #[test]
    fn test_driver_reset_gives_up() {
        let (mut manager, _, host) = driver_manager(vec![interface()]);
        let device = manager.init_new_current_device("Interface").unwrap();
        device.set_active(true).unwrap();

        host.fail_next_loads("Interface", 10);
        assert!(device.reset_device().is_err());
        assert_eq!(device.connection_state(), ConnectionState::Error);
        assert!(!device.is_active());
    }
}
