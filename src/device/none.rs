//! The None device
//!
//! Always present, needs no hardware. A software clock invokes the client at
//! the configured buffer period with an all-zero input.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use super::{DeviceBackend, DeviceCore};
use crate::config::{BufferSizePolicy, NoneDeviceConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::hal::clock::{ClockConfig, ClockThread};
use crate::hal::{channel_names, HalDeviceCaps, IoProc, Latency};
use crate::info::NONE_DEVICE_NAME;
use crate::notification::Notifier;

pub const NONE_SAMPLE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

pub const NONE_BUFFER_SIZES: [u32; 7] = [32, 64, 128, 256, 512, 1024, 2048];

const NONE_CHANNELS: u32 = 2;

pub fn none_device_caps() -> HalDeviceCaps {
    HalDeviceCaps {
        name: NONE_DEVICE_NAME.to_string(),
        input_channels: channel_names("None In", NONE_CHANNELS),
        output_channels: channel_names("None Out", NONE_CHANNELS),
        sample_rates: NONE_SAMPLE_RATES.to_vec(),
        buffer_sizes: NONE_BUFFER_SIZES.to_vec(),
        default_buffer_size: crate::constants::DEFAULT_BUFFER_SIZE,
    }
}

pub struct NullDevice {
    core: DeviceCore,
    /// Context prepared at activation, handed to the clock on start
    proc: Option<Box<dyn IoProc>>,
    clock: Option<ClockThread>,
}

impl NullDevice {
    pub(crate) fn new(config: &NoneDeviceConfig, notifier: Notifier, policy: BufferSizePolicy) -> Self {
        let core = DeviceCore::new(
            &none_device_caps(),
            config.sample_rate,
            config.buffer_size,
            notifier,
            policy,
        );
        Self {
            core,
            proc: None,
            clock: None,
        }
    }

    pub(crate) fn close(&mut self) {
        self.shutdown();
    }
}

impl DeviceBackend for NullDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn native_activate(&mut self) -> DeviceResult<()> {
        self.proc = Some(Box::new(self.core.io_context()));
        Ok(())
    }

    fn native_deactivate(&mut self) -> DeviceResult<()> {
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }
        self.proc = None;
        Ok(())
    }

    fn native_start(&mut self) -> DeviceResult<()> {
        let proc = self
            .proc
            .take()
            .ok_or_else(|| DeviceError::NotInitialized("None device has no IO context".into()))?;
        let config = ClockConfig {
            sample_rate: self.core.sample_rate,
            frames: Arc::new(AtomicU32::new(self.core.buffer_size)),
            input_channels: self.core.input_channels.len(),
            output_channels: self.core.output_channels.len(),
        };
        self.clock = Some(ClockThread::spawn("none-device", config, proc)?);
        Ok(())
    }

    fn native_stop(&mut self) -> DeviceResult<()> {
        if let Some(mut clock) = self.clock.take() {
            // Keep the context so streaming can resume without reactivation.
            self.proc = clock.stop();
        }
        if self.proc.is_none() {
            self.proc = Some(Box::new(self.core.io_context()));
        }
        Ok(())
    }

    fn native_set_sample_rate(&mut self, _rate: u32) -> DeviceResult<()> {
        Ok(())
    }

    fn native_set_buffer_size(&mut self, _frames: u32) -> DeviceResult<()> {
        Ok(())
    }

    fn native_query_caps(&mut self) -> DeviceResult<HalDeviceCaps> {
        Ok(none_device_caps())
    }

    fn native_sample_rate(&mut self) -> DeviceResult<u32> {
        Ok(self.core.sample_rate)
    }

    fn native_latency(&mut self) -> DeviceResult<Latency> {
        Ok(Latency::default())
    }

    fn native_control_panel(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
