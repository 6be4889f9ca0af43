//! Thread-affine driver model on top of cpal
//!
//! With the `asio` feature on Windows this opens ASIO drivers through cpal's
//! ASIO host. Elsewhere it wraps the selected cpal host, which keeps the
//! driver backend usable on every platform.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait};

use super::cpal_host::{build_streams, find_device, open_host, probe_device, CpalStreams, FaultHandler, StreamFault};
use crate::error::{HalError, HalResult};
use crate::hal::{
    Driver, DriverHost, DriverMessage, DriverMessageSink, HalDeviceCaps, IoProc, IoUnitConfig,
    Latency,
};

#[cfg(all(windows, feature = "asio"))]
const DEFAULT_DRIVER_HOST: Option<&str> = Some("ASIO");
#[cfg(not(all(windows, feature = "asio")))]
const DEFAULT_DRIVER_HOST: Option<&str> = None;

pub struct CpalDriverHost {
    host_name: Option<String>,
}

impl CpalDriverHost {
    pub fn new(host_name: Option<String>) -> HalResult<Self> {
        let host_name = host_name.or_else(|| DEFAULT_DRIVER_HOST.map(str::to_string));
        let host = open_host(host_name.as_deref())?;
        tracing::info!(host = host.id().name(), "using cpal driver host");
        Ok(Self { host_name })
    }

    fn host(&self) -> HalResult<cpal::Host> {
        open_host(self.host_name.as_deref())
    }
}

impl DriverHost for CpalDriverHost {
    fn name(&self) -> &'static str {
        "cpal-driver"
    }

    fn driver_names(&self) -> HalResult<Vec<String>> {
        let devices = self
            .host()?
            .devices()
            .map_err(|e| HalError::Enumeration(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn probe(&self, name: &str) -> HalResult<HalDeviceCaps> {
        probe_device(&find_device(&self.host()?, name)?)
    }

    fn load(&self, name: &str) -> HalResult<Box<dyn Driver>> {
        let device = find_device(&self.host()?, name)?;
        let caps = probe_device(&device)?;
        let sample_rate = super::cpal_host::default_sample_rate(&device)
            .filter(|r| caps.sample_rates.contains(r))
            .or_else(|| caps.sample_rates.first().copied())
            .ok_or_else(|| HalError::Driver(format!("{}: no sample rates", name)))?;
        Ok(Box::new(CpalDriver {
            device,
            buffer_size: caps.default_buffer_size,
            sample_rate,
            caps,
            sink: None,
            streams: None,
            config: None,
        }))
    }
}

struct CpalDriver {
    device: cpal::Device,
    caps: HalDeviceCaps,
    sample_rate: u32,
    buffer_size: u32,
    sink: Option<DriverMessageSink>,
    streams: Option<CpalStreams>,
    config: Option<IoUnitConfig>,
}

impl CpalDriver {
    fn sink(&self) -> HalResult<DriverMessageSink> {
        self.sink
            .clone()
            .ok_or_else(|| HalError::Driver(format!("{}: not initialized", self.caps.name)))
    }

    fn streams(&self) -> HalResult<&CpalStreams> {
        self.streams
            .as_ref()
            .ok_or_else(|| HalError::Driver(format!("{}: no buffers", self.caps.name)))
    }
}

impl Driver for CpalDriver {
    fn init(&mut self, sink: DriverMessageSink) -> HalResult<()> {
        self.sink = Some(sink);
        Ok(())
    }

    fn caps(&self) -> HalResult<HalDeviceCaps> {
        Ok(self.caps.clone())
    }

    fn preferred_buffer_size(&self) -> HalResult<u32> {
        Ok(self.caps.default_buffer_size)
    }

    fn sample_rate(&self) -> HalResult<u32> {
        Ok(self.sample_rate)
    }

    fn can_sample_rate(&self, rate: u32) -> bool {
        self.caps.sample_rates.contains(&rate)
    }

    fn set_sample_rate(&mut self, rate: u32) -> HalResult<()> {
        if !self.can_sample_rate(rate) {
            return Err(HalError::UnsupportedSampleRate(rate));
        }
        if self.sample_rate != rate && self.streams.is_some() {
            // Open streams keep the old rate until rebuilt.
            if let Some(sink) = &self.sink {
                sink.post(DriverMessage::ResetRequest);
            }
        }
        self.sample_rate = rate;
        Ok(())
    }

    fn set_buffer_size(&mut self, frames: u32) -> HalResult<()> {
        if !self.caps.buffer_sizes.contains(&frames) {
            return Err(HalError::UnsupportedBufferSize(frames));
        }
        self.buffer_size = frames;
        Ok(())
    }

    fn create_buffers(&mut self, config: IoUnitConfig, proc: Box<dyn IoProc>) -> HalResult<()> {
        if self.streams.is_some() {
            return Err(HalError::Driver(format!("{}: buffers already created", self.caps.name)));
        }
        let sink = self.sink()?;
        let on_fault: FaultHandler = Arc::new(move |fault| {
            sink.post(match fault {
                StreamFault::DeviceGone | StreamFault::BackendError => DriverMessage::ResetRequest,
                StreamFault::Overload => DriverMessage::Overload,
            })
        });
        let config = IoUnitConfig {
            sample_rate: self.sample_rate,
            buffer_size: self.buffer_size,
            ..config
        };
        self.streams = Some(build_streams(&self.device, config, proc, on_fault)?);
        self.config = Some(config);
        Ok(())
    }

    fn dispose_buffers(&mut self) -> HalResult<()> {
        if let Some(streams) = self.streams.take() {
            streams.pause()?;
        }
        self.config = None;
        Ok(())
    }

    fn start(&mut self) -> HalResult<()> {
        self.streams()?.play()
    }

    fn stop(&mut self) -> HalResult<()> {
        self.streams()?.pause()
    }

    fn latencies(&self) -> HalResult<Latency> {
        let config = self
            .config
            .ok_or_else(|| HalError::Driver(format!("{}: no buffers", self.caps.name)))?;
        Ok(Latency {
            input: if config.input_channels > 0 { config.buffer_size } else { 0 },
            output: if config.output_channels > 0 { config.buffer_size } else { 0 },
        })
    }
}
