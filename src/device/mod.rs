//! Audio devices and their shared state machine
//!
//! ```text
//!   ┌────────────┐ set_active(true)  ┌────────┐ set_streaming(true)  ┌───────────┐
//!   │  Inactive  │ ────────────────▶ │ Active │ ───────────────────▶ │ Streaming │
//!   │            │ ◀──────────────── │        │ ◀─────────────────── │           │
//!   └────────────┘ set_active(false) └────────┘ set_streaming(false) └───────────┘
//! ```
//!
//! Orthogonal to that, every device carries a [`ConnectionState`]. Native
//! failures move it to `Error`, a vanished device to `Disconnected`.
//!
//! The state machine lives once, in the default methods of
//! [`DeviceBackend`]. Each variant only supplies the native hooks.

mod callback;
mod driver;
pub mod io;
mod none;

use std::sync::Arc;

use serde::Serialize;

pub use callback::CallbackDevice;
pub use driver::DriverDevice;
pub use none::{none_device_caps, NullDevice, NONE_BUFFER_SIZES, NONE_SAMPLE_RATES};

use crate::config::BufferSizePolicy;
use crate::error::{DeviceError, DeviceResult};
use crate::events::{DeviceEvents, EventDrain, EventKind, PendingEvent};
use crate::hal::{HalDeviceCaps, IoUnitConfig, Latency};
use crate::info::DeviceInfo;
use crate::notification::{Notification, Notifier};
use io::{IoContext, IoShared};

/// Whether the native device is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Available,
    Disconnected,
    Error,
}

/// Input monitoring selection. Channels index the device's input list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub left: Option<u32>,
    pub right: Option<u32>,
    pub gain: f32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            left: None,
            right: None,
            gain: 1.0,
        }
    }
}

/// Which backend a device runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceKind {
    None,
    Callback,
    Driver,
}

/// Snapshot of a device's operating state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub kind: DeviceKind,
    pub connection: ConnectionState,
    pub active: bool,
    pub streaming: bool,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub drop_count: u32,
}

/// Candidate order for a buffer-size request over an ascending set: the
/// size itself if supported, then larger sizes ascending, then smaller
/// sizes descending.
pub(crate) fn buffer_size_candidates(sizes: &[u32], requested: u32) -> Vec<u32> {
    let mut candidates = Vec::with_capacity(sizes.len());
    if sizes.contains(&requested) {
        candidates.push(requested);
    }
    candidates.extend(sizes.iter().copied().filter(|&s| s > requested));
    candidates.extend(sizes.iter().rev().copied().filter(|&s| s < requested));
    candidates
}

fn preferred_sample_rate(rates: &[u32], wanted: u32) -> u32 {
    if rates.contains(&wanted) {
        return wanted;
    }
    [crate::constants::DEFAULT_SAMPLE_RATE, 44100]
        .into_iter()
        .find(|r| rates.contains(r))
        .or_else(|| rates.first().copied())
        .unwrap_or(wanted)
}

fn sorted(values: &[u32]) -> Vec<u32> {
    let mut values = values.to_vec();
    values.sort_unstable();
    values.dedup();
    values
}

/// State common to every device variant
pub(crate) struct DeviceCore {
    pub(crate) name: String,
    pub(crate) input_channels: Vec<String>,
    pub(crate) output_channels: Vec<String>,
    pub(crate) sample_rates: Vec<u32>,
    pub(crate) buffer_sizes: Vec<u32>,
    pub(crate) default_buffer_size: u32,
    pub(crate) connection: ConnectionState,
    pub(crate) active: bool,
    pub(crate) streaming: bool,
    pub(crate) sample_rate: u32,
    pub(crate) buffer_size: u32,
    pub(crate) monitor: MonitorSettings,
    pub(crate) latency: Latency,
    pub(crate) policy: BufferSizePolicy,
    pub(crate) notifier: Notifier,
    pub(crate) events: Arc<DeviceEvents>,
    pub(crate) drain: EventDrain,
    pub(crate) io: Arc<IoShared>,
}

impl DeviceCore {
    /// Build from a capability snapshot. `sample_rate` and `buffer_size`
    /// are wishes; they are replaced by supported values if needed.
    pub(crate) fn new(
        caps: &HalDeviceCaps,
        sample_rate: u32,
        buffer_size: u32,
        notifier: Notifier,
        policy: BufferSizePolicy,
    ) -> Self {
        let mut core = Self {
            name: caps.name.clone(),
            input_channels: Vec::new(),
            output_channels: Vec::new(),
            sample_rates: Vec::new(),
            buffer_sizes: Vec::new(),
            default_buffer_size: caps.default_buffer_size,
            connection: ConnectionState::Available,
            active: false,
            streaming: false,
            sample_rate: 0,
            buffer_size: 0,
            monitor: MonitorSettings::default(),
            latency: Latency::default(),
            policy,
            notifier,
            events: Arc::new(DeviceEvents::new()),
            drain: EventDrain::new(),
            io: Arc::new(IoShared::default()),
        };
        core.apply_caps(caps);
        core.sample_rate = preferred_sample_rate(&core.sample_rates, sample_rate);
        core.buffer_size = buffer_size_candidates(&core.buffer_sizes, buffer_size)
            .first()
            .copied()
            .unwrap_or(buffer_size);
        core
    }

    /// Take a fresh capability snapshot. Returns the replacement buffer size
    /// if the current one is no longer offered.
    pub(crate) fn apply_caps(&mut self, caps: &HalDeviceCaps) -> Option<u32> {
        self.input_channels = caps.input_channels.clone();
        self.output_channels = caps.output_channels.clone();
        self.sample_rates = sorted(&caps.sample_rates);
        self.buffer_sizes = sorted(&caps.buffer_sizes);
        self.default_buffer_size = caps.default_buffer_size;

        if self.buffer_size == 0 || self.buffer_sizes.contains(&self.buffer_size) {
            return None;
        }
        let replacement = buffer_size_candidates(&self.buffer_sizes, self.buffer_size)
            .first()
            .copied()?;
        self.buffer_size = replacement;
        Some(replacement)
    }

    pub(crate) fn io_config(&self) -> IoUnitConfig {
        IoUnitConfig {
            sample_rate: self.sample_rate,
            buffer_size: self.buffer_size,
            input_channels: self.input_channels.len(),
            output_channels: self.output_channels.len(),
        }
    }

    /// Fresh real-time context for the current parameters
    pub(crate) fn io_context(&self) -> IoContext {
        IoContext::new(
            self.notifier.clone(),
            self.io.clone(),
            self.events.clone(),
            self.buffer_size as usize,
            self.input_channels.len(),
            self.output_channels.len(),
        )
    }

    pub(crate) fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            tracing::debug!(device = %self.name, from = ?self.connection, to = ?state, "connection state");
            self.connection = state;
            self.notifier
                .notify(Notification::DeviceStatusChanged(state));
        }
    }

    /// Record a native failure: Error state plus a client notification
    pub(crate) fn fail(&mut self, err: &DeviceError) {
        tracing::error!(device = %self.name, error = %err, "device failure");
        self.set_connection(ConnectionState::Error);
        let message = err.to_string();
        self.notifier
            .notify(Notification::DeviceError { message: &message });
    }

    fn wrong_state(&self, what: &str) -> DeviceError {
        DeviceError::WrongState(format!("{}: {}", self.name, what))
    }
}

/// Native hooks of a device variant, plus the state machine built on them.
///
/// Only the default methods touch `active`/`streaming`; the hooks must not.
pub(crate) trait DeviceBackend {
    fn core(&self) -> &DeviceCore;
    fn core_mut(&mut self) -> &mut DeviceCore;

    /// Acquire native resources for the current rate and buffer size
    fn native_activate(&mut self) -> DeviceResult<()>;
    /// Release native resources; must tolerate a half-activated device
    fn native_deactivate(&mut self) -> DeviceResult<()>;
    fn native_start(&mut self) -> DeviceResult<()>;
    /// Stop delivery; no client callback runs after this returns
    fn native_stop(&mut self) -> DeviceResult<()>;
    /// Only called while inactive
    fn native_set_sample_rate(&mut self, rate: u32) -> DeviceResult<()>;
    /// Only called while inactive
    fn native_set_buffer_size(&mut self, frames: u32) -> DeviceResult<()>;
    fn native_query_caps(&mut self) -> DeviceResult<HalDeviceCaps>;
    /// Rate the native layer currently runs at
    fn native_sample_rate(&mut self) -> DeviceResult<u32>;
    fn native_latency(&mut self) -> DeviceResult<Latency>;
    fn native_control_panel(&mut self) -> DeviceResult<()>;

    /// Bring the native side back from scratch, called while inactive
    fn native_reinitialize(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn set_active(&mut self, active: bool) -> DeviceResult<()> {
        if self.core().active == active {
            return Ok(());
        }

        if !active {
            if self.core().streaming {
                if let Err(e) = self.set_streaming(false) {
                    tracing::warn!(device = %self.core().name, error = %e, "stop before deactivation failed");
                    self.core_mut().streaming = false;
                }
            }
            let result = self.native_deactivate();
            let core = self.core_mut();
            core.active = false;
            match &result {
                Ok(()) => tracing::info!(device = %core.name, "device deactivated"),
                Err(e) => tracing::warn!(device = %core.name, error = %e, "deactivation reported an error"),
            }
            return result;
        }

        if self.core().connection == ConnectionState::Disconnected {
            return Err(self.core().wrong_state("device is disconnected"));
        }
        {
            let core = self.core_mut();
            core.events.clear();
            core.drain.reset();
            core.io.reset();
        }
        if let Err(e) = self.native_activate() {
            if let Err(cleanup) = self.native_deactivate() {
                tracing::debug!(error = %cleanup, "cleanup after failed activation");
            }
            self.core_mut().fail(&e);
            return Err(e);
        }

        let core = self.core_mut();
        core.active = true;
        core.set_connection(ConnectionState::Available);
        tracing::info!(
            device = %core.name,
            sample_rate = core.sample_rate,
            buffer_size = core.buffer_size,
            "device activated"
        );
        Ok(())
    }

    fn set_streaming(&mut self, streaming: bool) -> DeviceResult<()> {
        if self.core().streaming == streaming {
            return Ok(());
        }

        if streaming {
            if !self.core().active {
                return Err(self.core().wrong_state("device is not active"));
            }
            self.core().io.clear_stop();
            self.core().events.reset_drops();
            if let Err(e) = self.native_start() {
                self.core().io.request_stop();
                self.core_mut().fail(&e);
                return Err(e);
            }
            let core = self.core_mut();
            core.streaming = true;
            tracing::info!(device = %core.name, "streaming started");
            core.notifier.notify(Notification::DeviceStartedStreaming);
            return Ok(());
        }

        self.core().io.request_stop();
        if let Err(e) = self.native_stop() {
            self.core_mut().fail(&e);
            return Err(e);
        }
        let core = self.core_mut();
        core.streaming = false;
        tracing::info!(device = %core.name, "streaming stopped");
        core.notifier.notify(Notification::DeviceStoppedStreaming);
        Ok(())
    }

    fn set_current_sampling_rate(&mut self, rate: u32) -> DeviceResult<()> {
        let core = self.core();
        if core.streaming {
            return Err(core.wrong_state("cannot change the sample rate while streaming"));
        }
        if !core.sample_rates.contains(&rate) {
            return Err(DeviceError::NotSupported(format!(
                "{} does not support {} Hz",
                core.name, rate
            )));
        }
        if core.sample_rate == rate {
            return Ok(());
        }

        let was_active = core.active;
        if was_active {
            self.set_active(false)?;
        }
        if let Err(e) = self.native_set_sample_rate(rate) {
            tracing::error!(device = %self.core().name, rate, error = %e, "sample rate change failed");
            if was_active {
                self.set_active(true)?;
            }
            return Err(e);
        }

        self.core_mut().sample_rate = rate;
        if let Err(e) = self.update_device_info() {
            tracing::warn!(device = %self.core().name, error = %e, "capability refresh after rate change failed");
        }
        tracing::info!(device = %self.core().name, rate, "sample rate changed");
        self.core()
            .notifier
            .notify(Notification::SamplingRateChanged(rate));
        if was_active {
            self.set_active(true)?;
        }
        Ok(())
    }

    /// Returns the effective buffer size, which differs from `frames` when a
    /// substitute was chosen.
    fn set_current_buffer_size(&mut self, frames: u32) -> DeviceResult<u32> {
        let core = self.core();
        if core.streaming {
            return Err(core.wrong_state("cannot change the buffer size while streaming"));
        }
        let supported = core.buffer_sizes.contains(&frames);
        if supported && core.buffer_size == frames {
            return Ok(frames);
        }
        let candidates = match core.policy {
            BufferSizePolicy::Strict if !supported => {
                return Err(DeviceError::NotSupported(format!(
                    "{} does not support a buffer of {} frames",
                    core.name, frames
                )));
            }
            BufferSizePolicy::Strict => vec![frames],
            BufferSizePolicy::Nearest => buffer_size_candidates(&core.buffer_sizes, frames),
        };
        let previous = core.buffer_size;
        let was_active = core.active;

        if was_active {
            self.set_active(false)?;
        }
        let mut effective = None;
        let mut last_error = None;
        for candidate in candidates {
            match self.native_set_buffer_size(candidate) {
                Ok(()) => {
                    effective = Some(candidate);
                    break;
                }
                Err(e) => {
                    tracing::debug!(device = %self.core().name, candidate, error = %e, "buffer size refused");
                    last_error = Some(e);
                }
            }
        }
        let Some(effective) = effective else {
            if was_active {
                self.set_active(true)?;
            }
            return Err(last_error.unwrap_or_else(|| {
                DeviceError::NotSupported(format!("no usable buffer size near {} frames", frames))
            }));
        };

        let core = self.core_mut();
        core.buffer_size = effective;
        if effective != frames {
            tracing::info!(device = %core.name, requested = frames, effective, "buffer size substituted");
        }
        if effective != frames || effective != previous {
            core.notifier
                .notify(Notification::BufferSizeChanged(effective));
        }
        if was_active {
            self.set_active(true)?;
        }
        Ok(effective)
    }

    /// Re-query capabilities from the native layer
    fn update_device_info(&mut self) -> DeviceResult<()> {
        let caps = self.native_query_caps()?;
        let replaced = self.core_mut().apply_caps(&caps);
        if let Some(frames) = replaced {
            if !self.core().active {
                self.native_set_buffer_size(frames)?;
            }
            self.core()
                .notifier
                .notify(Notification::BufferSizeChanged(frames));
        }
        let core = self.core();
        if !core.sample_rates.contains(&core.sample_rate) {
            let err = DeviceError::NotSupported(format!(
                "{} no longer supports {} Hz",
                core.name, core.sample_rate
            ));
            self.core_mut().fail(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Full reset, restoring the prior active and streaming flags
    fn reset_device(&mut self) -> DeviceResult<()> {
        let was_active = self.core().active;
        let was_streaming = self.core().streaming;
        tracing::info!(device = %self.core().name, was_active, was_streaming, "resetting device");

        if was_active {
            if let Err(e) = self.set_active(false) {
                tracing::warn!(device = %self.core().name, error = %e, "deactivation during reset failed");
            }
        }
        if let Err(e) = self.native_reinitialize() {
            self.core_mut().fail(&e);
            return Err(e);
        }
        if self.core().connection == ConnectionState::Error {
            self.core_mut().set_connection(ConnectionState::Available);
        }
        if was_active {
            self.set_active(true)?;
        }
        if was_streaming {
            self.set_streaming(true)?;
        }
        Ok(())
    }

    fn set_monitor_channels(&mut self, left: Option<u32>, right: Option<u32>) -> DeviceResult<()> {
        let core = self.core_mut();
        let inputs = core.input_channels.len() as u32;
        if let Some(channel) = [left, right].into_iter().flatten().find(|&c| c >= inputs) {
            return Err(DeviceError::NotSupported(format!(
                "{} has no input channel {}",
                core.name, channel
            )));
        }
        core.monitor.left = left;
        core.monitor.right = right;
        Ok(())
    }

    fn set_monitor_gain(&mut self, gain: f32) -> DeviceResult<()> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(DeviceError::NotSupported(format!("monitor gain {}", gain)));
        }
        self.core_mut().monitor.gain = gain;
        Ok(())
    }

    fn latency(&mut self) -> DeviceResult<Latency> {
        if self.core().active {
            let latency = self.native_latency()?;
            self.core_mut().latency = latency;
        }
        Ok(self.core().latency)
    }

    /// Drain pending events and report them to the client
    fn idle(&mut self) {
        let core = self.core_mut();
        let pending = core.drain.drain(&core.events);
        for event in pending {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: PendingEvent) {
        tracing::debug!(device = %self.core().name, kind = ?event.kind, value = event.value, "device event");
        match event.kind {
            EventKind::ResetRequested => self.core().notifier.notify(Notification::RequestReset),
            EventKind::ResyncRequested => self.core().notifier.notify(Notification::RequestResync),
            EventKind::SampleRateChanged => self.handle_rate_change(),
            EventKind::BufferSizeChanged => self.handle_buffer_size_change(event.value),
            EventKind::Dropout => {
                tracing::warn!(device = %self.core().name, drops = event.value, "dropout");
                self.core().notifier.notify(Notification::Dropout {
                    drop_count: event.value,
                });
            }
            EventKind::Disconnected => self.mark_disconnected(),
            EventKind::LatencyChanged => match self.native_latency() {
                Ok(latency) => {
                    let core = self.core_mut();
                    core.latency = latency;
                    core.notifier.notify(Notification::LatencyChanged {
                        input: latency.input,
                        output: latency.output,
                    });
                }
                Err(e) => tracing::warn!(device = %self.core().name, error = %e, "latency query failed"),
            },
        }
    }

    /// The native rate changed under us
    fn handle_rate_change(&mut self) {
        let rate = match self.native_sample_rate() {
            Ok(rate) => rate,
            Err(e) => {
                tracing::warn!(device = %self.core().name, error = %e, "rate query failed");
                return;
            }
        };
        if rate == self.core().sample_rate {
            return;
        }
        if !self.core().sample_rates.contains(&rate) {
            if let Ok(caps) = self.native_query_caps() {
                self.core_mut().apply_caps(&caps);
            }
        }
        if !self.core().sample_rates.contains(&rate) {
            let err = DeviceError::NotSupported(format!("device switched to unsupported {} Hz", rate));
            self.core_mut().fail(&err);
            return;
        }
        let core = self.core_mut();
        core.sample_rate = rate;
        tracing::info!(device = %core.name, rate, "sample rate changed externally");
        core.notifier.notify(Notification::SamplingRateChanged(rate));
    }

    /// The native layer runs at (or asks for) a different buffer size
    fn handle_buffer_size_change(&mut self, frames: u32) {
        if frames == 0 || frames == self.core().buffer_size {
            return;
        }
        if !self.core().buffer_sizes.contains(&frames) {
            if let Ok(caps) = self.native_query_caps() {
                self.core_mut().apply_caps(&caps);
            }
        }
        if !self.core().buffer_sizes.contains(&frames) {
            let err = DeviceError::NotSupported(format!("device switched to unsupported buffer of {} frames", frames));
            self.core_mut().fail(&err);
            return;
        }

        let was_active = self.core().active;
        let was_streaming = self.core().streaming;
        if was_active {
            if let Err(e) = self.set_active(false) {
                tracing::warn!(device = %self.core().name, error = %e, "deactivation for buffer change failed");
            }
        }
        if let Err(e) = self.native_set_buffer_size(frames) {
            self.core_mut().fail(&e);
            return;
        }
        let core = self.core_mut();
        core.buffer_size = frames;
        tracing::info!(device = %core.name, frames, "buffer size changed by the native layer");
        core.notifier.notify(Notification::BufferSizeChanged(frames));

        // A failed activation already moved the device to Error.
        if was_active && self.set_active(true).is_ok() && was_streaming {
            if let Err(e) = self.set_streaming(true) {
                tracing::warn!(device = %self.core().name, error = %e, "restart after buffer change failed");
                if self.core().connection != ConnectionState::Error {
                    self.core_mut().fail(&e);
                }
            }
        }
    }

    /// Tear down after the native device went away
    fn mark_disconnected(&mut self) {
        if self.core().connection == ConnectionState::Disconnected {
            return;
        }
        if self.core().active {
            if let Err(e) = self.set_active(false) {
                tracing::debug!(device = %self.core().name, error = %e, "deactivating a vanished device");
            }
        }
        let core = self.core_mut();
        tracing::warn!(device = %core.name, "device disconnected");
        core.set_connection(ConnectionState::Disconnected);
        core.notifier.notify(Notification::DeviceDisconnected);
    }

    /// Stop and deactivate, logging instead of failing
    fn shutdown(&mut self) {
        if let Err(e) = self.set_active(false) {
            tracing::warn!(device = %self.core().name, error = %e, "error while closing device");
        }
    }
}

macro_rules! with_backend {
    ($device:expr, $backend:ident => $body:expr) => {
        match $device {
            AudioDevice::None($backend) => $body,
            AudioDevice::Callback($backend) => $body,
            AudioDevice::Driver($backend) => $body,
        }
    };
}

/// A device the manager can make current
pub enum AudioDevice {
    None(NullDevice),
    Callback(CallbackDevice),
    Driver(DriverDevice),
}

impl AudioDevice {
    fn core(&self) -> &DeviceCore {
        with_backend!(self, d => d.core())
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            AudioDevice::None(_) => DeviceKind::None,
            AudioDevice::Callback(_) => DeviceKind::Callback,
            AudioDevice::Driver(_) => DeviceKind::Driver,
        }
    }

    pub fn is_none_device(&self) -> bool {
        matches!(self, AudioDevice::None(_))
    }

    pub fn name(&self) -> &str {
        &self.core().name
    }

    pub fn input_channels(&self) -> &[String] {
        &self.core().input_channels
    }

    pub fn output_channels(&self) -> &[String] {
        &self.core().output_channels
    }

    pub fn sample_rates(&self) -> &[u32] {
        &self.core().sample_rates
    }

    pub fn buffer_sizes(&self) -> &[u32] {
        &self.core().buffer_sizes
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core().connection
    }

    pub fn is_active(&self) -> bool {
        self.core().active
    }

    pub fn is_streaming(&self) -> bool {
        self.core().streaming
    }

    pub fn current_sampling_rate(&self) -> u32 {
        self.core().sample_rate
    }

    pub fn current_buffer_size(&self) -> u32 {
        self.core().buffer_size
    }

    pub fn monitor(&self) -> MonitorSettings {
        self.core().monitor
    }

    /// Dropouts since streaming started
    pub fn drop_count(&self) -> u32 {
        self.core().events.drop_count()
    }

    /// Frames delivered to the client since activation
    pub fn sample_time(&self) -> u64 {
        self.core().io.sample_time()
    }

    pub fn callback_count(&self) -> u64 {
        self.core().io.callbacks()
    }

    pub fn status(&self) -> DeviceStatus {
        let core = self.core();
        DeviceStatus {
            name: core.name.clone(),
            kind: self.kind(),
            connection: core.connection,
            active: core.active,
            streaming: core.streaming,
            sample_rate: core.sample_rate,
            buffer_size: core.buffer_size,
            drop_count: core.events.drop_count(),
        }
    }

    /// Capability snapshot as the registry would publish it
    pub fn info(&self) -> DeviceInfo {
        let core = self.core();
        DeviceInfo {
            id: 0,
            name: core.name.clone(),
            sample_rates: core.sample_rates.clone(),
            buffer_sizes: core.buffer_sizes.clone(),
            max_input_channels: core.input_channels.len() as u32,
            max_output_channels: core.output_channels.len() as u32,
            default_buffer_size: core.default_buffer_size,
        }
    }

    pub fn set_active(&mut self, active: bool) -> DeviceResult<()> {
        with_backend!(self, d => d.set_active(active))
    }

    pub fn set_streaming(&mut self, streaming: bool) -> DeviceResult<()> {
        with_backend!(self, d => d.set_streaming(streaming))
    }

    pub fn set_current_sampling_rate(&mut self, rate: u32) -> DeviceResult<()> {
        with_backend!(self, d => d.set_current_sampling_rate(rate))
    }

    /// Returns the buffer size actually applied
    pub fn set_current_buffer_size(&mut self, frames: u32) -> DeviceResult<u32> {
        with_backend!(self, d => d.set_current_buffer_size(frames))
    }

    pub fn reset_device(&mut self) -> DeviceResult<()> {
        with_backend!(self, d => d.reset_device())
    }

    pub fn update_device_info(&mut self) -> DeviceResult<()> {
        with_backend!(self, d => d.update_device_info())
    }

    pub fn show_config_panel(&mut self) -> DeviceResult<()> {
        with_backend!(self, d => d.native_control_panel())
    }

    /// Input latency in frames
    pub fn input_latency(&mut self) -> DeviceResult<u32> {
        with_backend!(self, d => d.latency()).map(|l| l.input)
    }

    /// Output latency in frames
    pub fn output_latency(&mut self) -> DeviceResult<u32> {
        with_backend!(self, d => d.latency()).map(|l| l.output)
    }

    pub fn set_monitor_channels(&mut self, left: Option<u32>, right: Option<u32>) -> DeviceResult<()> {
        with_backend!(self, d => d.set_monitor_channels(left, right))
    }

    pub fn set_monitor_gain(&mut self, gain: f32) -> DeviceResult<()> {
        with_backend!(self, d => d.set_monitor_gain(gain))
    }

    /// Report pending device events to the client. Called from the
    /// manager's idle tick.
    pub fn idle(&mut self) {
        with_backend!(self, d => d.idle())
    }

    pub(crate) fn mark_disconnected(&mut self) {
        with_backend!(self, d => d.mark_disconnected())
    }

    /// The device showed up again after a disconnect
    pub(crate) fn mark_available(&mut self) {
        with_backend!(self, d => {
            if d.core().connection == ConnectionState::Disconnected {
                d.core_mut().set_connection(ConnectionState::Available);
            }
        })
    }
}

impl std::fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AudioDevice").field(&self.status()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::channel_names;
    use crate::notification::DeviceClient;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Backend with scripted native behaviour
    struct ScriptedBackend {
        core: DeviceCore,
        calls: Vec<String>,
        refuse_sizes: Vec<u32>,
        fail_activate: bool,
        fail_start: bool,
        native_rate: u32,
    }

    impl DeviceBackend for ScriptedBackend {
        fn core(&self) -> &DeviceCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut DeviceCore {
            &mut self.core
        }
        fn native_activate(&mut self) -> DeviceResult<()> {
            self.calls.push("activate".into());
            if self.fail_activate {
                return Err(DeviceError::Native("activation refused".into()));
            }
            Ok(())
        }
        fn native_deactivate(&mut self) -> DeviceResult<()> {
            self.calls.push("deactivate".into());
            Ok(())
        }
        fn native_start(&mut self) -> DeviceResult<()> {
            self.calls.push("start".into());
            if self.fail_start {
                return Err(DeviceError::Native("start refused".into()));
            }
            Ok(())
        }
        fn native_stop(&mut self) -> DeviceResult<()> {
            self.calls.push("stop".into());
            Ok(())
        }
        fn native_set_sample_rate(&mut self, rate: u32) -> DeviceResult<()> {
            self.calls.push(format!("rate {}", rate));
            self.native_rate = rate;
            Ok(())
        }
        fn native_set_buffer_size(&mut self, frames: u32) -> DeviceResult<()> {
            self.calls.push(format!("size {}", frames));
            if self.refuse_sizes.contains(&frames) {
                return Err(DeviceError::Native(format!("refused {}", frames)));
            }
            Ok(())
        }
        fn native_query_caps(&mut self) -> DeviceResult<HalDeviceCaps> {
            Ok(caps())
        }
        fn native_sample_rate(&mut self) -> DeviceResult<u32> {
            Ok(self.native_rate)
        }
        fn native_latency(&mut self) -> DeviceResult<Latency> {
            Ok(Latency { input: 10, output: 20 })
        }
        fn native_control_panel(&mut self) -> DeviceResult<()> {
            Ok(())
        }
    }

    fn caps() -> HalDeviceCaps {
        HalDeviceCaps {
            name: "Scripted".into(),
            input_channels: channel_names("In", 2),
            output_channels: channel_names("Out", 2),
            sample_rates: vec![48000, 44100, 96000],
            buffer_sizes: vec![512, 64, 256, 128],
            default_buffer_size: 64,
        }
    }

    fn backend(policy: BufferSizePolicy) -> (ScriptedBackend, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let client: Arc<dyn DeviceClient> = Arc::new(move |n: Notification<'_>| {
            let entry = match n {
                Notification::BufferSizeChanged(size) => format!("buffer {}", size),
                Notification::SamplingRateChanged(rate) => format!("rate {}", rate),
                Notification::DeviceStatusChanged(state) => format!("status {:?}", state),
                other => other.reason().to_string(),
            };
            sink.lock().push(entry);
        });
        let core = DeviceCore::new(&caps(), 48000, 64, Notifier::new(Some(client)), policy);
        (
            ScriptedBackend {
                core,
                calls: Vec::new(),
                refuse_sizes: Vec::new(),
                fail_activate: false,
                fail_start: false,
                native_rate: 48000,
            },
            log,
        )
    }

    #[test]
    fn test_capability_sets_are_sorted() {
        let (device, _) = backend(BufferSizePolicy::Nearest);
        assert_eq!(device.core.sample_rates, vec![44100, 48000, 96000]);
        assert_eq!(device.core.buffer_sizes, vec![64, 128, 256, 512]);
        assert_eq!(device.core.buffer_size, 64);
    }

    #[test]
    fn test_streaming_requires_active() {
        let (mut device, _) = backend(BufferSizePolicy::Nearest);
        assert!(matches!(device.set_streaming(true), Err(DeviceError::WrongState(_))));
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        device.set_streaming(true).unwrap();
        assert_eq!(device.calls.iter().filter(|c| *c == "start").count(), 1);
    }

    #[test]
    fn test_deactivate_stops_first() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        device.set_active(false).unwrap();
        assert_eq!(device.calls, vec!["activate", "start", "stop", "deactivate"]);
        assert!(!device.core.streaming);
        assert!(log.lock().contains(&"device-stopped-streaming".to_string()));
    }

    #[test]
    fn test_failed_activation_moves_to_error() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.fail_activate = true;
        assert!(matches!(device.set_active(true), Err(DeviceError::Native(_))));
        assert!(!device.core.active);
        assert_eq!(device.core.connection, ConnectionState::Error);
        assert!(log.lock().contains(&"device-error".to_string()));

        device.fail_activate = false;
        device.set_active(true).unwrap();
        assert_eq!(device.core.connection, ConnectionState::Available);
    }

    #[test]
    fn test_rate_change_rules() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        assert!(matches!(
            device.set_current_sampling_rate(22050),
            Err(DeviceError::NotSupported(_))
        ));

        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        assert!(matches!(
            device.set_current_sampling_rate(96000),
            Err(DeviceError::WrongState(_))
        ));

        device.set_streaming(false).unwrap();
        device.calls.clear();
        device.set_current_sampling_rate(96000).unwrap();
        assert_eq!(device.calls, vec!["deactivate", "rate 96000", "activate"]);
        assert!(device.core.active);
        assert_eq!(device.core.sample_rate, 96000);
        assert!(log.lock().contains(&"rate 96000".to_string()));
    }

    #[test]
    fn test_buffer_size_substitution() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        assert_eq!(device.set_current_buffer_size(100).unwrap(), 128);
        assert_eq!(device.core.buffer_size, 128);
        assert!(log.lock().contains(&"buffer 128".to_string()));

        device.refuse_sizes = vec![256];
        assert_eq!(device.set_current_buffer_size(256).unwrap(), 512);
        assert_eq!(device.calls, vec!["size 128", "size 256", "size 512"]);
    }

    #[test]
    fn test_buffer_size_falls_back_to_smaller() {
        let (mut device, _) = backend(BufferSizePolicy::Nearest);
        device.refuse_sizes = vec![512];
        assert_eq!(device.set_current_buffer_size(1000).unwrap(), 256);
    }

    #[test]
    fn test_strict_policy_rejects_unlisted_size() {
        let (mut device, log) = backend(BufferSizePolicy::Strict);
        assert!(matches!(
            device.set_current_buffer_size(100),
            Err(DeviceError::NotSupported(_))
        ));
        assert_eq!(device.core.buffer_size, 64);
        assert!(log.lock().is_empty());
        assert_eq!(device.set_current_buffer_size(256).unwrap(), 256);
    }

    #[test]
    fn test_reset_restores_flags() {
        let (mut device, _) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        device.calls.clear();
        device.reset_device().unwrap();
        assert_eq!(device.calls, vec!["stop", "deactivate", "activate", "start"]);
        assert!(device.core.active && device.core.streaming);
    }

    #[test]
    fn test_idle_reports_each_event_once() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        log.lock().clear();

        device.core.events.signal(EventKind::ResetRequested);
        device.core.events.signal(EventKind::ResetRequested);
        device.idle();
        device.idle();
        let resets = log.lock().iter().filter(|e| *e == "request-reset").count();
        assert_eq!(resets, 1);
    }

    #[test]
    fn test_external_rate_change() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        device.native_rate = 44100;
        device.core.events.signal(EventKind::SampleRateChanged);
        device.idle();
        assert_eq!(device.core.sample_rate, 44100);
        assert!(log.lock().contains(&"rate 44100".to_string()));
    }

    #[test]
    fn test_native_buffer_change_restarts_stream() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        device.calls.clear();

        device.handle_buffer_size_change(256);
        assert_eq!(device.calls, vec!["stop", "deactivate", "size 256", "activate", "start"]);
        assert!(device.core.active && device.core.streaming);
        assert!(log.lock().contains(&"buffer 256".to_string()));
    }

    #[test]
    fn test_failed_restart_after_buffer_change_moves_to_error() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        log.lock().clear();

        device.fail_start = true;
        device.handle_buffer_size_change(128);
        assert_eq!(device.core.buffer_size, 128);
        assert!(device.core.active);
        assert!(!device.core.streaming);
        assert_eq!(device.core.connection, ConnectionState::Error);
        let errors = log.lock().iter().filter(|e| *e == "device-error").count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_disconnect_event() {
        let (mut device, log) = backend(BufferSizePolicy::Nearest);
        device.set_active(true).unwrap();
        device.set_streaming(true).unwrap();
        device.core.events.signal(EventKind::Disconnected);
        device.idle();
        assert_eq!(device.core.connection, ConnectionState::Disconnected);
        assert!(!device.core.active);
        assert!(log.lock().contains(&"device-disconnected".to_string()));
        assert!(matches!(device.set_active(true), Err(DeviceError::WrongState(_))));
    }

    #[test]
    fn test_monitor_validation() {
        let (mut device, _) = backend(BufferSizePolicy::Nearest);
        device.set_monitor_channels(Some(0), Some(1)).unwrap();
        assert!(device.set_monitor_channels(Some(2), None).is_err());
        assert_eq!(device.core.monitor.left, Some(0));
        assert!(device.set_monitor_gain(f32::NAN).is_err());
        device.set_monitor_gain(0.5).unwrap();
        assert_eq!(device.core.monitor.gain, 0.5);
    }

    #[test]
    fn test_candidate_order() {
        let sizes = [64, 128, 256, 512];
        assert_eq!(buffer_size_candidates(&sizes, 100), vec![128, 256, 512, 64]);
        assert_eq!(buffer_size_candidates(&sizes, 256), vec![256, 512, 128, 64]);
        assert_eq!(buffer_size_candidates(&sizes, 4096), vec![512, 256, 128, 64]);
    }

    proptest! {
        #[test]
        fn prop_candidates_cover_the_set(
            mut sizes in prop::collection::vec(1u32..4096, 1..12),
            requested in 1u32..5000,
        ) {
            sizes.sort_unstable();
            sizes.dedup();
            let candidates = buffer_size_candidates(&sizes, requested);

            let mut covered = candidates.clone();
            covered.sort_unstable();
            prop_assert_eq!(&covered, &sizes);

            let first = candidates[0];
            match sizes.iter().copied().find(|&s| s >= requested) {
                Some(expected) => prop_assert_eq!(first, expected),
                None => prop_assert_eq!(first, *sizes.last().unwrap()),
            }
        }
    }
}
