//! Device capability snapshots and the device registry

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Name of the synthetic software device that is always present
pub const NONE_DEVICE_NAME: &str = "None";

/// Immutable capability snapshot of one device.
///
/// `id` is only meaningful for the enumeration pass that produced it and
/// must not be kept across a re-enumeration; look devices up by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u32,
    pub name: String,
    /// Supported sample rates, ascending
    pub sample_rates: Vec<u32>,
    /// Supported buffer sizes in frames, ascending
    pub buffer_sizes: Vec<u32>,
    pub max_input_channels: u32,
    pub max_output_channels: u32,
    pub default_buffer_size: u32,
}

impl DeviceInfo {
    pub fn is_none_device(&self) -> bool {
        self.name == NONE_DEVICE_NAME
    }

    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }

    pub fn supports_buffer_size(&self, size: u32) -> bool {
        self.buffer_sizes.contains(&size)
    }

    /// Same device shape, ignoring the per-pass id
    pub fn same_capabilities(&self, other: &DeviceInfo) -> bool {
        self.name == other.name
            && self.sample_rates == other.sample_rates
            && self.buffer_sizes == other.buffer_sizes
            && self.max_input_channels == other.max_input_channels
            && self.max_output_channels == other.max_output_channels
    }
}

/// Device-class filter applied during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFilter {
    #[default]
    All,
    /// Devices with at least one input
    InputOnly,
    /// Devices with at least one output
    OutputOnly,
    /// Devices with both inputs and outputs
    FullDuplex,
    /// Devices with the same, non-zero number of inputs and outputs
    MatchedDuplex,
}

impl DeviceFilter {
    /// Whether a device passes the filter. The None device always does.
    pub fn admits(&self, info: &DeviceInfo) -> bool {
        if info.is_none_device() {
            return true;
        }
        let inputs = info.max_input_channels;
        let outputs = info.max_output_channels;
        match self {
            DeviceFilter::All => true,
            DeviceFilter::InputOnly => inputs > 0,
            DeviceFilter::OutputOnly => outputs > 0,
            DeviceFilter::FullDuplex => inputs > 0 && outputs > 0,
            DeviceFilter::MatchedDuplex => inputs > 0 && inputs == outputs,
        }
    }
}

/// Ordered list of known devices.
///
/// Only ever replaced wholesale, so readers never see a half-updated list.
/// The None device is always the first entry.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<DeviceInfo>>,
    none_info: DeviceInfo,
}

impl DeviceRegistry {
    pub fn new(none_info: DeviceInfo) -> Self {
        debug_assert!(none_info.is_none_device());
        Self {
            devices: Mutex::new(vec![none_info.clone()]),
            none_info,
        }
    }

    /// Publish a new list. Any None entries in `candidates` are dropped and
    /// the registry's own None device is put first. Returns `true` if the
    /// published list differs structurally from the previous one.
    pub fn replace(&self, candidates: Vec<DeviceInfo>) -> bool {
        let mut next = Vec::with_capacity(candidates.len() + 1);
        next.push(DeviceInfo {
            id: 0,
            ..self.none_info.clone()
        });
        next.extend(candidates.into_iter().filter(|d| !d.is_none_device()));
        for (index, info) in next.iter_mut().enumerate() {
            info.id = index as u32;
        }

        let mut devices = self.devices.lock();
        let changed = devices.len() != next.len()
            || devices
                .iter()
                .zip(next.iter())
                .any(|(old, new)| !old.same_capabilities(new));
        *devices = next;
        changed
    }

    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.lock().clone()
    }

    pub fn find_by_name(&self, name: &str) -> Option<DeviceInfo> {
        self.devices.lock().iter().find(|d| d.name == name).cloned()
    }

    /// Index of `name`, the None device being 0
    pub fn position(&self, name: &str) -> Option<usize> {
        self.devices.lock().iter().position(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.lock().iter().any(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.lock().iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}
