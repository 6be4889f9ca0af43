//! Devices on a synchronous-callback HAL
//!
//! Control calls go straight to the HAL on the caller's thread. The HAL owns
//! the real-time thread and calls back into the device's
//! [`IoContext`](crate::device::io::IoContext). Property listeners run on OS
//! threads and only record events.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::{DeviceBackend, DeviceCore};
use crate::config::{ManagerConfig, TimeoutConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::events::{DeviceEvents, EventKind};
use crate::hal::{CallbackHal, HalDeviceCaps, HalProperty, IoUnit, Latency, PropertyListener};
use crate::notification::Notifier;

/// Forwards HAL property notifications into the device's event queue
struct EventListener {
    events: Arc<DeviceEvents>,
}

impl PropertyListener for EventListener {
    fn property_changed(&self, property: HalProperty) {
        match property {
            HalProperty::NominalSampleRate => self.events.signal(EventKind::SampleRateChanged),
            HalProperty::DeviceReconfigured => self.events.signal(EventKind::ResetRequested),
            HalProperty::ProcessorOverload => self.events.overload(),
            HalProperty::DeviceDied => self.events.signal(EventKind::Disconnected),
        }
    }
}

pub struct CallbackDevice {
    core: DeviceCore,
    hal: Arc<dyn CallbackHal>,
    unit: Option<Box<dyn IoUnit>>,
    timeouts: TimeoutConfig,
}

impl CallbackDevice {
    pub(crate) fn open(
        hal: Arc<dyn CallbackHal>,
        name: &str,
        notifier: Notifier,
        config: &ManagerConfig,
    ) -> DeviceResult<Self> {
        let caps = hal.device_caps(name)?;
        let nominal = hal.nominal_sample_rate(name).unwrap_or(crate::constants::DEFAULT_SAMPLE_RATE);
        let core = DeviceCore::new(
            &caps,
            nominal,
            caps.default_buffer_size,
            notifier,
            config.buffer_size_policy,
        );
        tracing::info!(
            device = %name,
            hal = hal.name(),
            inputs = core.input_channels.len(),
            outputs = core.output_channels.len(),
            "opened callback device"
        );
        Ok(Self {
            core,
            hal,
            unit: None,
            timeouts: config.timeouts.clone(),
        })
    }

    /// Set the nominal rate and wait until the HAL reports it
    fn negotiate_sample_rate(&self, rate: u32) -> DeviceResult<()> {
        let name = &self.core.name;
        if self.hal.nominal_sample_rate(name)? == rate {
            return Ok(());
        }
        self.hal.set_nominal_sample_rate(name, rate)?;

        let deadline = Instant::now() + self.timeouts.rate_change();
        loop {
            if self.hal.nominal_sample_rate(name)? == rate {
                tracing::debug!(device = %name, rate, "nominal rate settled");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout(format!(
                    "{} did not switch to {} Hz within {:?}",
                    name,
                    rate,
                    self.timeouts.rate_change()
                )));
            }
            thread::sleep(self.timeouts.rate_poll());
        }
    }

    fn unit(&mut self) -> DeviceResult<&mut Box<dyn IoUnit>> {
        self.unit
            .as_mut()
            .ok_or_else(|| DeviceError::NotInitialized(format!("{} has no open IO unit", self.core.name)))
    }
}

impl DeviceBackend for CallbackDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn native_activate(&mut self) -> DeviceResult<()> {
        self.negotiate_sample_rate(self.core.sample_rate)?;
        self.hal
            .set_buffer_size(&self.core.name, self.core.buffer_size)?;

        let listener = Arc::new(EventListener {
            events: self.core.events.clone(),
        });
        let unit = self.hal.open_io_unit(
            &self.core.name,
            self.core.io_config(),
            Box::new(self.core.io_context()),
            listener,
        )?;
        self.unit = Some(unit);
        Ok(())
    }

    fn native_deactivate(&mut self) -> DeviceResult<()> {
        if let Some(mut unit) = self.unit.take() {
            if let Err(e) = unit.stop() {
                tracing::debug!(device = %self.core.name, error = %e, "stop while closing IO unit");
            }
        }
        Ok(())
    }

    fn native_start(&mut self) -> DeviceResult<()> {
        self.unit()?.start()?;
        Ok(())
    }

    fn native_stop(&mut self) -> DeviceResult<()> {
        let unit = self.unit()?;
        unit.stop()?;
        unit.reset();
        Ok(())
    }

    fn native_set_sample_rate(&mut self, rate: u32) -> DeviceResult<()> {
        self.negotiate_sample_rate(rate)
    }

    fn native_set_buffer_size(&mut self, frames: u32) -> DeviceResult<()> {
        self.hal.set_buffer_size(&self.core.name, frames)?;
        Ok(())
    }

    fn native_query_caps(&mut self) -> DeviceResult<HalDeviceCaps> {
        Ok(self.hal.device_caps(&self.core.name)?)
    }

    fn native_sample_rate(&mut self) -> DeviceResult<u32> {
        Ok(self.hal.nominal_sample_rate(&self.core.name)?)
    }

    fn native_latency(&mut self) -> DeviceResult<Latency> {
        Ok(self.unit.as_ref().map(|u| u.latency()).unwrap_or_default())
    }

    fn native_control_panel(&mut self) -> DeviceResult<()> {
        Ok(self.hal.show_control_panel(&self.core.name)?)
    }
}

impl Drop for CallbackDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
