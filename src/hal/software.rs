//! Software HAL bindings
//!
//! Virtual interfaces with software-timed IO. [`SoftwareHal`] behaves like a
//! synchronous callback HAL, [`SoftwareDriverHost`] like a thread-affine
//! driver host. Both can inject the things real hardware does on its own:
//! hot-plug, property changes, driver messages, refused parameters and slow
//! rate switches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{HalError, HalResult};
use crate::hal::clock::{ClockConfig, ClockThread};
use crate::hal::{
    channel_names, CallbackHal, DeviceListListener, Driver, DriverHost, DriverMessage,
    DriverMessageSink, HalDeviceCaps, HalProperty, IoProc, IoUnit, IoUnitConfig, Latency,
    PropertyListener,
};

/// Description of one virtual device
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareDeviceSpec {
    pub name: String,
    pub inputs: u32,
    pub outputs: u32,
    pub sample_rates: Vec<u32>,
    pub buffer_sizes: Vec<u32>,
    pub default_sample_rate: u32,
    pub default_buffer_size: u32,
    /// Advertised sizes the device still refuses when asked
    pub rejected_buffer_sizes: Vec<u32>,
    /// Nominal-rate reads before a requested rate takes effect
    pub rate_settle_polls: u32,
    /// Above 96 kHz only sizes from this value up are offered
    pub high_rate_min_buffer: Option<u32>,
    pub fail_open: bool,
    pub fail_probe: bool,
    pub latency: Latency,
}

impl SoftwareDeviceSpec {
    pub fn new(name: &str, inputs: u32, outputs: u32) -> Self {
        Self {
            name: name.to_string(),
            inputs,
            outputs,
            sample_rates: vec![44100, 48000, 88200, 96000],
            buffer_sizes: vec![64, 128, 256, 512, 1024],
            default_sample_rate: 48000,
            default_buffer_size: 256,
            rejected_buffer_sizes: Vec::new(),
            rate_settle_polls: 0,
            high_rate_min_buffer: None,
            fail_open: false,
            fail_probe: false,
            latency: Latency {
                input: 32,
                output: 32,
            },
        }
    }

    pub fn with_sample_rates(mut self, rates: &[u32]) -> Self {
        self.sample_rates = rates.to_vec();
        if !rates.contains(&self.default_sample_rate) {
            self.default_sample_rate = rates.first().copied().unwrap_or(48000);
        }
        self
    }

    pub fn with_buffer_sizes(mut self, sizes: &[u32], default: u32) -> Self {
        self.buffer_sizes = sizes.to_vec();
        self.default_buffer_size = default;
        self
    }

    pub fn rejecting(mut self, sizes: &[u32]) -> Self {
        self.rejected_buffer_sizes = sizes.to_vec();
        self
    }

    pub fn with_rate_settle_polls(mut self, polls: u32) -> Self {
        self.rate_settle_polls = polls;
        self
    }

    pub fn with_high_rate_min_buffer(mut self, frames: u32) -> Self {
        self.high_rate_min_buffer = Some(frames);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_probe(mut self) -> Self {
        self.fail_probe = true;
        self
    }

    /// Capabilities while running at `rate`
    pub fn caps_at(&self, rate: u32) -> HalDeviceCaps {
        let floor = match self.high_rate_min_buffer {
            Some(min) if rate > 96000 => min,
            _ => 0,
        };
        HalDeviceCaps {
            name: self.name.clone(),
            input_channels: channel_names("Input", self.inputs),
            output_channels: channel_names("Output", self.outputs),
            sample_rates: self.sample_rates.clone(),
            buffer_sizes: self
                .buffer_sizes
                .iter()
                .copied()
                .filter(|&s| s >= floor)
                .collect(),
            default_buffer_size: self.default_buffer_size,
        }
    }

    fn accepts_buffer_size(&self, rate: u32, frames: u32) -> bool {
        self.caps_at(rate).buffer_sizes.contains(&frames)
            && !self.rejected_buffer_sizes.contains(&frames)
    }

    /// A small set of devices for demos and smoke tests
    pub fn demo_set() -> Vec<SoftwareDeviceSpec> {
        vec![
            SoftwareDeviceSpec::new("Virtual Interface", 2, 2),
            SoftwareDeviceSpec::new("Virtual Microphone", 1, 0)
                .with_sample_rates(&[44100, 48000]),
            SoftwareDeviceSpec::new("Virtual Speakers", 0, 2),
        ]
    }
}

fn not_found(name: &str) -> HalError {
    HalError::DeviceNotFound(name.to_string())
}

struct CallbackEntry {
    spec: SoftwareDeviceSpec,
    nominal_rate: u32,
    /// Requested rate and reads left until it lands
    pending_rate: Option<(u32, u32)>,
    buffer_size: u32,
    listeners: HashMap<u64, Arc<dyn PropertyListener>>,
    delivered_frames: HashMap<u64, Arc<AtomicU32>>,
}

#[derive(Default)]
struct CallbackShared {
    devices: Vec<CallbackEntry>,
    list_listener: Option<DeviceListListener>,
    fail_enumeration: bool,
    open_units: usize,
    peak_open_units: usize,
    next_token: u64,
}

impl CallbackShared {
    fn entry(&mut self, name: &str) -> HalResult<&mut CallbackEntry> {
        self.devices
            .iter_mut()
            .find(|d| d.spec.name == name)
            .ok_or_else(|| not_found(name))
    }
}

/// Synchronous callback HAL over virtual devices
#[derive(Clone, Default)]
pub struct SoftwareHal {
    shared: Arc<Mutex<CallbackShared>>,
}

impl SoftwareHal {
    pub fn new(specs: Vec<SoftwareDeviceSpec>) -> Self {
        let hal = Self::default();
        for spec in specs {
            hal.insert(spec);
        }
        hal
    }

    fn insert(&self, spec: SoftwareDeviceSpec) {
        let mut shared = self.shared.lock();
        shared.devices.retain(|d| d.spec.name != spec.name);
        shared.devices.push(CallbackEntry {
            nominal_rate: spec.default_sample_rate,
            pending_rate: None,
            buffer_size: spec.default_buffer_size,
            listeners: HashMap::new(),
            delivered_frames: HashMap::new(),
            spec,
        });
    }

    fn list_changed(&self) {
        let listener = self.shared.lock().list_listener.clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Hot-plug a device
    pub fn add_device(&self, spec: SoftwareDeviceSpec) {
        tracing::debug!(device = %spec.name, "virtual device plugged");
        self.insert(spec);
        self.list_changed();
    }

    /// Hot-unplug a device; open units see it die
    pub fn remove_device(&self, name: &str) -> bool {
        let mut shared = self.shared.lock();
        let Some(index) = shared.devices.iter().position(|d| d.spec.name == name) else {
            return false;
        };
        let entry = shared.devices.remove(index);
        drop(shared);
        tracing::debug!(device = %name, "virtual device unplugged");
        for listener in entry.listeners.values() {
            listener.property_changed(HalProperty::DeviceDied);
        }
        self.list_changed();
        true
    }

    /// Deliver a property notification to the device's listeners
    pub fn fire_property(&self, name: &str, property: HalProperty) {
        let mut shared = self.shared.lock();
        let listeners: Vec<_> = match shared.entry(name) {
            Ok(entry) => entry.listeners.values().cloned().collect(),
            Err(_) => return,
        };
        drop(shared);
        for listener in listeners {
            listener.property_changed(property);
        }
    }

    /// Another process switched the device's nominal rate
    pub fn change_nominal_rate(&self, name: &str, rate: u32) -> HalResult<()> {
        {
            let mut shared = self.shared.lock();
            let entry = shared.entry(name)?;
            if !entry.spec.sample_rates.contains(&rate) {
                return Err(HalError::UnsupportedSampleRate(rate));
            }
            entry.nominal_rate = rate;
            entry.pending_rate = None;
        }
        self.fire_property(name, HalProperty::NominalSampleRate);
        Ok(())
    }

    /// Make running units deliver `frames` per callback regardless of the
    /// configured buffer size
    pub fn force_delivered_frames(&self, name: &str, frames: u32) {
        let mut shared = self.shared.lock();
        if let Ok(entry) = shared.entry(name) {
            for delivered in entry.delivered_frames.values() {
                delivered.store(frames, Ordering::Release);
            }
        }
    }

    pub fn set_enumeration_failure(&self, fail: bool) {
        self.shared.lock().fail_enumeration = fail;
    }

    /// Make one device fail capability queries, as a busy device does
    pub fn set_capability_failure(&self, name: &str, fail: bool) {
        if let Ok(entry) = self.shared.lock().entry(name) {
            entry.spec.fail_probe = fail;
        }
    }

    pub fn open_units(&self) -> usize {
        self.shared.lock().open_units
    }

    /// Highest number of simultaneously open units seen so far
    pub fn peak_open_units(&self) -> usize {
        self.shared.lock().peak_open_units
    }

    pub fn buffer_size(&self, name: &str) -> Option<u32> {
        self.shared.lock().entry(name).ok().map(|e| e.buffer_size)
    }
}

impl CallbackHal for SoftwareHal {
    fn name(&self) -> &'static str {
        "software"
    }

    fn enumerate(&self) -> HalResult<Vec<HalResult<HalDeviceCaps>>> {
        let shared = self.shared.lock();
        if shared.fail_enumeration {
            return Err(HalError::Enumeration("virtual device list unavailable".into()));
        }
        Ok(shared
            .devices
            .iter()
            .map(|d| {
                if d.spec.fail_probe {
                    Err(HalError::Enumeration(format!("{}: probe failed", d.spec.name)))
                } else {
                    Ok(d.spec.caps_at(d.nominal_rate))
                }
            })
            .collect())
    }

    fn device_caps(&self, device: &str) -> HalResult<HalDeviceCaps> {
        let mut shared = self.shared.lock();
        let entry = shared.entry(device)?;
        Ok(entry.spec.caps_at(entry.nominal_rate))
    }

    fn nominal_sample_rate(&self, device: &str) -> HalResult<u32> {
        let mut shared = self.shared.lock();
        let entry = shared.entry(device)?;
        if let Some((rate, polls)) = entry.pending_rate {
            if polls == 0 {
                entry.nominal_rate = rate;
                entry.pending_rate = None;
            } else {
                entry.pending_rate = Some((rate, polls - 1));
            }
        }
        Ok(entry.nominal_rate)
    }

    fn set_nominal_sample_rate(&self, device: &str, rate: u32) -> HalResult<()> {
        let mut shared = self.shared.lock();
        let entry = shared.entry(device)?;
        if !entry.spec.sample_rates.contains(&rate) {
            return Err(HalError::UnsupportedSampleRate(rate));
        }
        if entry.spec.rate_settle_polls == 0 {
            entry.nominal_rate = rate;
        } else {
            entry.pending_rate = Some((rate, entry.spec.rate_settle_polls));
        }
        Ok(())
    }

    fn set_buffer_size(&self, device: &str, frames: u32) -> HalResult<()> {
        let mut shared = self.shared.lock();
        let entry = shared.entry(device)?;
        if !entry.spec.accepts_buffer_size(entry.nominal_rate, frames) {
            return Err(HalError::UnsupportedBufferSize(frames));
        }
        entry.buffer_size = frames;
        Ok(())
    }

    fn open_io_unit(
        &self,
        device: &str,
        config: IoUnitConfig,
        proc: Box<dyn IoProc>,
        listener: Arc<dyn PropertyListener>,
    ) -> HalResult<Box<dyn IoUnit>> {
        let mut shared = self.shared.lock();
        shared.next_token += 1;
        let token = shared.next_token;
        let frames = Arc::new(AtomicU32::new(config.buffer_size));

        let entry = shared.entry(device)?;
        if entry.spec.fail_open {
            return Err(HalError::Stream(format!("{} refused to open", device)));
        }
        let latency = entry.spec.latency;
        entry.listeners.insert(token, listener);
        entry.delivered_frames.insert(token, frames.clone());

        shared.open_units += 1;
        shared.peak_open_units = shared.peak_open_units.max(shared.open_units);

        Ok(Box::new(SoftwareIoUnit {
            shared: self.shared.clone(),
            device: device.to_string(),
            token,
            config,
            frames,
            latency,
            proc: Some(proc),
            clock: None,
        }))
    }

    fn show_control_panel(&self, device: &str) -> HalResult<()> {
        self.shared.lock().entry(device)?;
        tracing::info!(device = %device, "virtual control panel requested");
        Ok(())
    }

    fn set_device_list_listener(&self, listener: Option<DeviceListListener>) -> bool {
        self.shared.lock().list_listener = listener;
        true
    }
}

struct SoftwareIoUnit {
    shared: Arc<Mutex<CallbackShared>>,
    device: String,
    token: u64,
    config: IoUnitConfig,
    frames: Arc<AtomicU32>,
    latency: Latency,
    proc: Option<Box<dyn IoProc>>,
    clock: Option<ClockThread>,
}

impl IoUnit for SoftwareIoUnit {
    fn start(&mut self) -> HalResult<()> {
        if self.clock.is_some() {
            return Ok(());
        }
        let proc = self
            .proc
            .take()
            .ok_or_else(|| HalError::Stream(format!("{}: IO proc lost", self.device)))?;
        let config = ClockConfig {
            sample_rate: self.config.sample_rate,
            frames: self.frames.clone(),
            input_channels: self.config.input_channels,
            output_channels: self.config.output_channels,
        };
        self.clock = Some(ClockThread::spawn(&self.device, config, proc)?);
        Ok(())
    }

    fn stop(&mut self) -> HalResult<()> {
        if let Some(mut clock) = self.clock.take() {
            self.proc = clock.stop();
        }
        Ok(())
    }

    fn reset(&mut self) {}

    fn latency(&self) -> Latency {
        self.latency
    }
}

impl Drop for SoftwareIoUnit {
    fn drop(&mut self) {
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }
        let mut shared = self.shared.lock();
        shared.open_units = shared.open_units.saturating_sub(1);
        if let Ok(entry) = shared.entry(&self.device) {
            entry.listeners.remove(&self.token);
            entry.delivered_frames.remove(&self.token);
        }
    }
}

struct DriverEntry {
    spec: SoftwareDeviceSpec,
    sink: Option<DriverMessageSink>,
    fail_loads: u32,
    loads: u32,
    panel_opens: u32,
}

#[derive(Default)]
struct DriverShared {
    drivers: Vec<DriverEntry>,
    list_listener: Option<DeviceListListener>,
    loaded: usize,
    peak_loaded: usize,
    affinity_violations: usize,
}

impl DriverShared {
    fn entry(&mut self, name: &str) -> HalResult<&mut DriverEntry> {
        self.drivers
            .iter_mut()
            .find(|d| d.spec.name == name)
            .ok_or_else(|| not_found(name))
    }
}

/// Thread-affine driver host over virtual devices.
///
/// Every driver call checks that it runs on the thread that loaded the
/// driver and counts violations instead of crashing.
#[derive(Clone, Default)]
pub struct SoftwareDriverHost {
    shared: Arc<Mutex<DriverShared>>,
}

impl SoftwareDriverHost {
    pub fn new(specs: Vec<SoftwareDeviceSpec>) -> Self {
        let host = Self::default();
        {
            let mut shared = host.shared.lock();
            for spec in specs {
                shared.drivers.push(DriverEntry {
                    spec,
                    sink: None,
                    fail_loads: 0,
                    loads: 0,
                    panel_opens: 0,
                });
            }
        }
        host
    }

    /// Post a message as if the loaded driver sent it. Returns `false` if
    /// the driver is not loaded.
    pub fn post_message(&self, name: &str, message: DriverMessage) -> bool {
        let sink = self.shared.lock().entry(name).ok().and_then(|e| e.sink.clone());
        match sink {
            Some(sink) => {
                sink.post(message);
                true
            }
            None => false,
        }
    }

    /// Make the next `count` loads of a driver fail
    pub fn fail_next_loads(&self, name: &str, count: u32) {
        if let Ok(entry) = self.shared.lock().entry(name) {
            entry.fail_loads = count;
        }
    }

    pub fn remove_device(&self, name: &str) -> bool {
        let removed = {
            let mut shared = self.shared.lock();
            let before = shared.drivers.len();
            shared.drivers.retain(|d| d.spec.name != name);
            before != shared.drivers.len()
        };
        if removed {
            let listener = self.shared.lock().list_listener.clone();
            if let Some(listener) = listener {
                listener();
            }
        }
        removed
    }

    pub fn loads(&self, name: &str) -> u32 {
        self.shared.lock().entry(name).map(|e| e.loads).unwrap_or(0)
    }

    pub fn panel_opens(&self, name: &str) -> u32 {
        self.shared.lock().entry(name).map(|e| e.panel_opens).unwrap_or(0)
    }

    pub fn loaded_drivers(&self) -> usize {
        self.shared.lock().loaded
    }

    pub fn peak_loaded_drivers(&self) -> usize {
        self.shared.lock().peak_loaded
    }

    /// Driver calls made from a thread other than the loading one
    pub fn affinity_violations(&self) -> usize {
        self.shared.lock().affinity_violations
    }
}

impl DriverHost for SoftwareDriverHost {
    fn name(&self) -> &'static str {
        "software-driver"
    }

    fn driver_names(&self) -> HalResult<Vec<String>> {
        Ok(self
            .shared
            .lock()
            .drivers
            .iter()
            .map(|d| d.spec.name.clone())
            .collect())
    }

    fn probe(&self, name: &str) -> HalResult<HalDeviceCaps> {
        let mut shared = self.shared.lock();
        let entry = shared.entry(name)?;
        if entry.spec.fail_probe {
            return Err(HalError::Driver(format!("{}: probe failed", name)));
        }
        Ok(entry.spec.caps_at(entry.spec.default_sample_rate))
    }

    fn load(&self, name: &str) -> HalResult<Box<dyn Driver>> {
        let mut shared = self.shared.lock();
        let entry = shared.entry(name)?;
        if entry.fail_loads > 0 {
            entry.fail_loads -= 1;
            return Err(HalError::Driver(format!("{}: load failed", name)));
        }
        entry.loads += 1;
        let spec = entry.spec.clone();
        shared.loaded += 1;
        shared.peak_loaded = shared.peak_loaded.max(shared.loaded);

        Ok(Box::new(SoftwareDriver {
            shared: self.shared.clone(),
            owner: thread::current().id(),
            sample_rate: spec.default_sample_rate,
            buffer_size: spec.default_buffer_size,
            spec,
            initialized: false,
            buffers: None,
            proc: None,
            clock: None,
        }))
    }

    fn set_device_list_listener(&self, listener: Option<DeviceListListener>) -> bool {
        self.shared.lock().list_listener = listener;
        true
    }
}

struct SoftwareDriver {
    shared: Arc<Mutex<DriverShared>>,
    owner: ThreadId,
    spec: SoftwareDeviceSpec,
    sample_rate: u32,
    buffer_size: u32,
    initialized: bool,
    buffers: Option<IoUnitConfig>,
    proc: Option<Box<dyn IoProc>>,
    clock: Option<ClockThread>,
}

impl SoftwareDriver {
    fn check_thread(&self) {
        if thread::current().id() != self.owner {
            tracing::error!(driver = %self.spec.name, "driver called off its owning thread");
            self.shared.lock().affinity_violations += 1;
        }
    }

    fn check_initialized(&self) -> HalResult<()> {
        self.check_thread();
        if self.initialized {
            Ok(())
        } else {
            Err(HalError::Driver(format!("{} is not initialized", self.spec.name)))
        }
    }
}

impl Driver for SoftwareDriver {
    fn init(&mut self, sink: DriverMessageSink) -> HalResult<()> {
        self.check_thread();
        self.shared.lock().entry(&self.spec.name)?.sink = Some(sink);
        self.initialized = true;
        Ok(())
    }

    fn caps(&self) -> HalResult<HalDeviceCaps> {
        self.check_initialized()?;
        Ok(self.spec.caps_at(self.sample_rate))
    }

    fn preferred_buffer_size(&self) -> HalResult<u32> {
        self.check_initialized()?;
        Ok(self.spec.default_buffer_size)
    }

    fn sample_rate(&self) -> HalResult<u32> {
        self.check_initialized()?;
        Ok(self.sample_rate)
    }

    fn can_sample_rate(&self, rate: u32) -> bool {
        self.check_thread();
        self.spec.sample_rates.contains(&rate)
    }

    fn set_sample_rate(&mut self, rate: u32) -> HalResult<()> {
        self.check_initialized()?;
        if !self.spec.sample_rates.contains(&rate) {
            return Err(HalError::UnsupportedSampleRate(rate));
        }
        self.sample_rate = rate;
        Ok(())
    }

    fn set_buffer_size(&mut self, frames: u32) -> HalResult<()> {
        self.check_initialized()?;
        if !self.spec.accepts_buffer_size(self.sample_rate, frames) {
            return Err(HalError::UnsupportedBufferSize(frames));
        }
        self.buffer_size = frames;
        Ok(())
    }

    fn create_buffers(&mut self, config: IoUnitConfig, proc: Box<dyn IoProc>) -> HalResult<()> {
        self.check_initialized()?;
        if self.buffers.is_some() {
            return Err(HalError::Driver("buffers already created".into()));
        }
        if self.spec.fail_open {
            return Err(HalError::Driver(format!("{}: buffer creation failed", self.spec.name)));
        }
        if config.buffer_size != self.buffer_size {
            return Err(HalError::UnsupportedBufferSize(config.buffer_size));
        }
        self.buffers = Some(config);
        self.proc = Some(proc);
        Ok(())
    }

    fn dispose_buffers(&mut self) -> HalResult<()> {
        self.check_thread();
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }
        self.buffers = None;
        self.proc = None;
        Ok(())
    }

    fn start(&mut self) -> HalResult<()> {
        self.check_initialized()?;
        let config = self
            .buffers
            .ok_or_else(|| HalError::Driver("start without buffers".into()))?;
        if self.clock.is_some() {
            return Ok(());
        }
        let proc = self
            .proc
            .take()
            .ok_or_else(|| HalError::Driver("IO proc lost".into()))?;
        let clock_config = ClockConfig {
            sample_rate: self.sample_rate,
            frames: Arc::new(AtomicU32::new(config.buffer_size)),
            input_channels: config.input_channels,
            output_channels: config.output_channels,
        };
        self.clock = Some(ClockThread::spawn(&self.spec.name, clock_config, proc)?);
        Ok(())
    }

    fn stop(&mut self) -> HalResult<()> {
        self.check_initialized()?;
        if let Some(mut clock) = self.clock.take() {
            self.proc = clock.stop();
        }
        Ok(())
    }

    fn latencies(&self) -> HalResult<Latency> {
        self.check_initialized()?;
        Ok(self.spec.latency)
    }

    fn control_panel(&mut self) -> HalResult<()> {
        self.check_initialized()?;
        self.shared.lock().entry(&self.spec.name)?.panel_opens += 1;
        Ok(())
    }
}

impl Drop for SoftwareDriver {
    fn drop(&mut self) {
        self.check_thread();
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }
        let mut shared = self.shared.lock();
        shared.loaded = shared.loaded.saturating_sub(1);
        if let Ok(entry) = shared.entry(&self.spec.name) {
            entry.sink = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{IoBuffers, IoStatus};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Ticks(Arc<AtomicUsize>);

    impl IoProc for Ticks {
        fn process(&mut self, _buffers: IoBuffers<'_>) -> IoStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            IoStatus::Continue
        }
    }

    struct Silent;

    impl PropertyListener for Silent {
        fn property_changed(&self, _property: HalProperty) {}
    }

    fn config() -> IoUnitConfig {
        IoUnitConfig {
            sample_rate: 48000,
            buffer_size: 64,
            input_channels: 2,
            output_channels: 2,
        }
    }

    #[test]
    fn test_rate_settles_after_polls() {
        let hal = SoftwareHal::new(vec![SoftwareDeviceSpec::new("A", 2, 2).with_rate_settle_polls(2)]);
        hal.set_nominal_sample_rate("A", 96000).unwrap();
        assert_eq!(hal.nominal_sample_rate("A").unwrap(), 48000);
        assert_eq!(hal.nominal_sample_rate("A").unwrap(), 48000);
        assert_eq!(hal.nominal_sample_rate("A").unwrap(), 96000);
        assert!(matches!(
            hal.set_nominal_sample_rate("A", 22050),
            Err(HalError::UnsupportedSampleRate(22050))
        ));
    }

    #[test]
    fn test_rejected_and_high_rate_sizes() {
        let hal = SoftwareHal::new(vec![SoftwareDeviceSpec::new("A", 2, 2)
            .with_sample_rates(&[48000, 192000])
            .rejecting(&[128])
            .with_high_rate_min_buffer(256)]);
        assert!(hal.set_buffer_size("A", 128).is_err());
        hal.set_buffer_size("A", 64).unwrap();

        hal.set_nominal_sample_rate("A", 192000).unwrap();
        let caps = hal.device_caps("A").unwrap();
        assert_eq!(caps.buffer_sizes, vec![256, 512, 1024]);
        assert!(hal.set_buffer_size("A", 64).is_err());
    }

    #[test]
    fn test_io_unit_ticks_and_counts() {
        let hal = SoftwareHal::new(vec![SoftwareDeviceSpec::new("A", 2, 2)]);
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut unit = hal
            .open_io_unit("A", config(), Box::new(Ticks(ticks.clone())), Arc::new(Silent))
            .unwrap();
        assert_eq!(hal.open_units(), 1);

        unit.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        unit.stop().unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);

        drop(unit);
        assert_eq!(hal.open_units(), 0);
        assert_eq!(hal.peak_open_units(), 1);
    }

    #[test]
    fn test_unplug_notifies_listeners() {
        struct Died(Arc<AtomicUsize>);
        impl PropertyListener for Died {
            fn property_changed(&self, property: HalProperty) {
                if property == HalProperty::DeviceDied {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let hal = SoftwareHal::new(vec![SoftwareDeviceSpec::new("A", 2, 2)]);
        let list_changes = Arc::new(AtomicUsize::new(0));
        let counter = list_changes.clone();
        assert!(hal.set_device_list_listener(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))));

        let died = Arc::new(AtomicUsize::new(0));
        let _unit = hal
            .open_io_unit("A", config(), Box::new(Ticks(Arc::new(AtomicUsize::new(0)))), Arc::new(Died(died.clone())))
            .unwrap();
        assert!(hal.remove_device("A"));
        assert_eq!(died.load(Ordering::SeqCst), 1);
        assert_eq!(list_changes.load(Ordering::SeqCst), 1);
        assert!(hal.device_caps("A").is_err());
    }

    #[test]
    fn test_driver_affinity_is_tracked() {
        let host = SoftwareDriverHost::new(vec![SoftwareDeviceSpec::new("D", 2, 2)]);
        let mut driver = host.load("D").unwrap();
        let (sink, _rx) = DriverMessageSink::channel(4);
        driver.init(sink).unwrap();
        assert_eq!(host.loaded_drivers(), 1);
        assert_eq!(host.affinity_violations(), 0);

        // Only the host side crosses threads here; the driver stays put.
        let other = host.clone();
        thread::spawn(move || {
            assert!(other.post_message("D", DriverMessage::ResetRequest));
        })
        .join()
        .unwrap();
        assert_eq!(host.affinity_violations(), 0);

        drop(driver);
        assert_eq!(host.loaded_drivers(), 0);
        assert!(!host.post_message("D", DriverMessage::ResetRequest));
    }

    #[test]
    fn test_driver_load_failures() {
        let host = SoftwareDriverHost::new(vec![SoftwareDeviceSpec::new("D", 2, 2)]);
        host.fail_next_loads("D", 1);
        assert!(host.load("D").is_err());
        assert!(host.load("D").is_ok());
        assert_eq!(host.loads("D"), 1);
    }
}
