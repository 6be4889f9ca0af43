//! Devices on a thread-affine driver HAL
//!
//! Every driver call has to happen on the thread that loaded the driver, so
//! each device owns one long-lived processing thread:
//!
//! ```text
//!  control thread                      device-processing thread
//!  ──────────────                      ────────────────────────
//!  call(Command) ──── rendezvous ────▶ select! { commands, driver messages }
//!       │                                   │            │
//!  recv_timeout(reply) ◀── one-shot ─── handle(cmd)   DeviceEvents
//! ```
//!
//! Driver messages (buffer size change, reset/resync requests, overloads) are
//! handled on the worker without a waiting caller and land in the device's
//! event queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};

use super::{DeviceBackend, DeviceCore};
use crate::config::{ManagerConfig, TimeoutConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::events::{DeviceEvents, EventKind};
use crate::hal::{
    Driver, DriverHost, DriverMessage, DriverMessageSink, HalDeviceCaps, IoProc, IoUnitConfig,
    Latency,
};
use crate::notification::Notifier;

/// Capacity of the driver message channel
const DRIVER_MESSAGE_CAPACITY: usize = 32;

enum Command {
    Load,
    QueryCaps,
    Activate {
        config: IoUnitConfig,
        proc: Box<dyn IoProc>,
    },
    Deactivate,
    Start,
    Stop,
    SetSampleRate(u32),
    SetBufferSize(u32),
    SampleRate,
    Latency,
    ControlPanel,
    Reinitialize {
        sample_rate: u32,
        buffer_size: u32,
    },
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::QueryCaps => "query-caps",
            Command::Activate { .. } => "activate",
            Command::Deactivate => "deactivate",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::SetSampleRate(_) => "set-sample-rate",
            Command::SetBufferSize(_) => "set-buffer-size",
            Command::SampleRate => "sample-rate",
            Command::Latency => "latency",
            Command::ControlPanel => "control-panel",
            Command::Reinitialize { .. } => "reinitialize",
        }
    }
}

#[derive(Debug)]
enum Reply {
    Done,
    Caps(HalDeviceCaps),
    Rate(u32),
    Latency(Latency),
}

impl Reply {
    fn into_caps(self) -> DeviceResult<HalDeviceCaps> {
        match self {
            Reply::Caps(caps) => Ok(caps),
            other => Err(unexpected(other)),
        }
    }

    fn into_rate(self) -> DeviceResult<u32> {
        match self {
            Reply::Rate(rate) => Ok(rate),
            other => Err(unexpected(other)),
        }
    }

    fn into_latency(self) -> DeviceResult<Latency> {
        match self {
            Reply::Latency(latency) => Ok(latency),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> DeviceError {
    DeviceError::Failed(format!("unexpected worker reply {:?}", reply))
}

struct Request {
    command: Command,
    reply: Sender<DeviceResult<Reply>>,
}

/// Control-thread side of a device-processing thread
struct WorkerHandle {
    name: String,
    commands: Option<Sender<Request>>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl WorkerHandle {
    fn spawn(
        host: Arc<dyn DriverHost>,
        name: &str,
        events: Arc<DeviceEvents>,
        timeouts: &TimeoutConfig,
    ) -> DeviceResult<Self> {
        // Rendezvous: a command is handed over only when the worker takes it.
        let (command_tx, command_rx) = bounded::<Request>(0);
        let (done_tx, done_rx) = bounded::<()>(1);
        let (sink, messages) = DriverMessageSink::channel(DRIVER_MESSAGE_CAPACITY);

        let worker_name = name.to_string();
        let retries = timeouts.reinit_retries;
        let retry_delay = timeouts.reinit_retry_delay();
        // The driver is created on the worker, so the worker state is built there.
        let thread = thread::Builder::new()
            .name(format!("driver-{}", name))
            .spawn(move || {
                let worker = DriverWorker {
                    host,
                    name: worker_name,
                    driver: None,
                    buffers_created: false,
                    running: false,
                    events,
                    sink,
                    retries,
                    retry_delay,
                };
                worker.run(command_rx, messages, done_tx)
            })
            .map_err(|e| DeviceError::Failed(format!("spawn device thread: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            commands: Some(command_tx),
            done: done_rx,
            thread: Some(thread),
            timeout: timeouts.command(),
        })
    }

    fn call(&self, command: Command) -> DeviceResult<Reply> {
        self.call_with_timeout(command, self.timeout)
    }

    fn call_with_timeout(&self, command: Command, timeout: Duration) -> DeviceResult<Reply> {
        let label = command.label();
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| DeviceError::NotInitialized(format!("{} worker stopped", self.name)))?;
        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send_timeout(
                Request {
                    command,
                    reply: reply_tx,
                },
                timeout,
            )
            .map_err(|_| {
                DeviceError::Timeout(format!("{} worker did not accept {}", self.name, label))
            })?;

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DeviceError::Timeout(format!(
                "{} did not answer {} within {:?}",
                self.name, label, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Failed(format!(
                "{} worker exited during {}",
                self.name, label
            ))),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Closing the command channel ends the worker loop.
        self.commands.take();
        match self.done.recv_timeout(self.timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        tracing::error!(device = %self.name, "device thread panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(device = %self.name, "device thread did not exit, detaching");
            }
        }
    }
}

/// COM apartment for the lifetime of the worker thread
struct ComApartment {
    #[cfg(windows)]
    initialized: bool,
}

impl ComApartment {
    #[cfg(windows)]
    fn enter() -> Self {
        use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};
        // SAFETY: first COM call on this freshly spawned thread.
        let initialized = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) }.is_ok();
        if !initialized {
            tracing::warn!("COM initialization failed on device thread");
        }
        Self { initialized }
    }

    #[cfg(not(windows))]
    fn enter() -> Self {
        Self {}
    }
}

#[cfg(windows)]
impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.initialized {
            // SAFETY: balanced with the successful CoInitializeEx in `enter`.
            unsafe { windows::Win32::System::Com::CoUninitialize() };
        }
    }
}

/// Device-processing thread state. Owns the driver.
struct DriverWorker {
    host: Arc<dyn DriverHost>,
    name: String,
    driver: Option<Box<dyn Driver>>,
    buffers_created: bool,
    running: bool,
    events: Arc<DeviceEvents>,
    sink: DriverMessageSink,
    retries: u32,
    retry_delay: Duration,
}

impl DriverWorker {
    fn run(mut self, commands: Receiver<Request>, messages: Receiver<DriverMessage>, _done: Sender<()>) {
        let _com = ComApartment::enter();
        tracing::debug!(device = %self.name, "device thread started");

        loop {
            select! {
                recv(commands) -> request => match request {
                    Ok(Request { command, reply }) => {
                        let result = self.handle(command);
                        // The caller may have timed out and gone.
                        let _ = reply.send(result);
                    }
                    Err(_) => break,
                },
                recv(messages) -> message => {
                    if let Ok(message) = message {
                        self.handle_message(message);
                    }
                }
            }
        }

        self.unload();
        tracing::debug!(device = %self.name, "device thread finished");
    }

    fn driver(&mut self) -> DeviceResult<&mut Box<dyn Driver>> {
        self.driver
            .as_mut()
            .ok_or_else(|| DeviceError::NotInitialized(format!("driver {} is not loaded", self.name)))
    }

    fn handle(&mut self, command: Command) -> DeviceResult<Reply> {
        tracing::trace!(device = %self.name, command = command.label(), "worker command");
        match command {
            Command::Load => {
                self.load()?;
                Ok(Reply::Caps(self.driver()?.caps()?))
            }
            Command::QueryCaps => Ok(Reply::Caps(self.driver()?.caps()?)),
            Command::Activate { config, proc } => {
                let driver = self.driver()?;
                if !driver.can_sample_rate(config.sample_rate) {
                    return Err(DeviceError::NotSupported(format!(
                        "{} Hz",
                        config.sample_rate
                    )));
                }
                if driver.sample_rate()? != config.sample_rate {
                    driver.set_sample_rate(config.sample_rate)?;
                }
                driver.set_buffer_size(config.buffer_size)?;
                driver.create_buffers(config, proc)?;
                self.buffers_created = true;
                Ok(Reply::Done)
            }
            Command::Deactivate => {
                self.dispose();
                Ok(Reply::Done)
            }
            Command::Start => {
                self.driver()?.start()?;
                self.running = true;
                Ok(Reply::Done)
            }
            Command::Stop => {
                if self.running {
                    self.driver()?.stop()?;
                    self.running = false;
                }
                Ok(Reply::Done)
            }
            Command::SetSampleRate(rate) => {
                let driver = self.driver()?;
                if !driver.can_sample_rate(rate) {
                    return Err(DeviceError::NotSupported(format!("{} Hz", rate)));
                }
                driver.set_sample_rate(rate)?;
                Ok(Reply::Done)
            }
            Command::SetBufferSize(frames) => {
                self.driver()?.set_buffer_size(frames)?;
                Ok(Reply::Done)
            }
            Command::SampleRate => Ok(Reply::Rate(self.driver()?.sample_rate()?)),
            Command::Latency => Ok(Reply::Latency(self.driver()?.latencies()?)),
            Command::ControlPanel => {
                self.driver()?.control_panel()?;
                Ok(Reply::Done)
            }
            Command::Reinitialize {
                sample_rate,
                buffer_size,
            } => self.reinitialize(sample_rate, buffer_size).map(Reply::Caps),
        }
    }

    fn handle_message(&mut self, message: DriverMessage) {
        tracing::debug!(device = %self.name, ?message, "driver message");
        match message {
            DriverMessage::BufferSizeChange(frames) => {
                self.events.signal_value(EventKind::BufferSizeChanged, frames)
            }
            DriverMessage::ResetRequest => self.events.signal(EventKind::ResetRequested),
            DriverMessage::ResyncRequest => self.events.signal(EventKind::ResyncRequested),
            DriverMessage::LatenciesChanged => self.events.signal(EventKind::LatencyChanged),
            DriverMessage::Overload => self.events.overload(),
        }
    }

    fn load(&mut self) -> DeviceResult<()> {
        let mut driver = self.host.load(&self.name)?;
        driver.init(self.sink.clone())?;
        self.driver = Some(driver);
        tracing::info!(device = %self.name, "driver loaded");
        Ok(())
    }

    /// Stop and dispose buffers, keeping the driver loaded
    fn dispose(&mut self) {
        let name = self.name.clone();
        let running = std::mem::take(&mut self.running);
        let buffers = std::mem::take(&mut self.buffers_created);
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        if running {
            if let Err(e) = driver.stop() {
                tracing::warn!(device = %name, error = %e, "driver stop failed");
            }
        }
        if buffers {
            if let Err(e) = driver.dispose_buffers() {
                tracing::warn!(device = %name, error = %e, "disposing driver buffers failed");
            }
        }
    }

    fn unload(&mut self) {
        self.dispose();
        if self.driver.take().is_some() {
            tracing::info!(device = %self.name, "driver unloaded");
        }
    }

    /// Unload, reload and check the rate/size combination, with retries
    fn reinitialize(&mut self, sample_rate: u32, buffer_size: u32) -> DeviceResult<HalDeviceCaps> {
        self.unload();
        let attempts = self.retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.load_and_validate(sample_rate, buffer_size) {
                Ok(caps) => {
                    tracing::info!(device = %self.name, attempt, "driver reinitialized");
                    return Ok(caps);
                }
                Err(e) => {
                    tracing::warn!(device = %self.name, attempt, error = %e, "driver reinitialization failed");
                    self.unload();
                    last_error = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DeviceError::Failed("driver reinitialization".into())))
    }

    fn load_and_validate(&mut self, sample_rate: u32, buffer_size: u32) -> DeviceResult<HalDeviceCaps> {
        self.load()?;
        let driver = self.driver()?;
        if !driver.can_sample_rate(sample_rate) {
            return Err(DeviceError::NotSupported(format!("{} Hz after reset", sample_rate)));
        }
        driver.set_sample_rate(sample_rate)?;
        driver.set_buffer_size(buffer_size)?;
        Ok(driver.caps()?)
    }
}

pub struct DriverDevice {
    core: DeviceCore,
    worker: WorkerHandle,
    reinit_timeout: Duration,
}

impl DriverDevice {
    pub(crate) fn open(
        host: Arc<dyn DriverHost>,
        name: &str,
        notifier: Notifier,
        config: &ManagerConfig,
    ) -> DeviceResult<Self> {
        let events = Arc::new(DeviceEvents::new());
        let worker = WorkerHandle::spawn(host, name, events.clone(), &config.timeouts)?;
        let caps = worker.call(Command::Load)?.into_caps()?;
        let rate = worker.call(Command::SampleRate)?.into_rate()?;

        let mut core = DeviceCore::new(
            &caps,
            rate,
            caps.default_buffer_size,
            notifier,
            config.buffer_size_policy,
        );
        core.events = events;

        let t = &config.timeouts;
        let reinit_timeout = t.command() + (t.command() + t.reinit_retry_delay()) * t.reinit_retries.max(1);
        tracing::info!(
            device = %name,
            inputs = core.input_channels.len(),
            outputs = core.output_channels.len(),
            "opened driver device"
        );
        Ok(Self {
            core,
            worker,
            reinit_timeout,
        })
    }
}

impl DeviceBackend for DriverDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn native_activate(&mut self) -> DeviceResult<()> {
        self.worker.call(Command::Activate {
            config: self.core.io_config(),
            proc: Box::new(self.core.io_context()),
        })?;
        Ok(())
    }

    fn native_deactivate(&mut self) -> DeviceResult<()> {
        self.worker.call(Command::Deactivate)?;
        Ok(())
    }

    fn native_start(&mut self) -> DeviceResult<()> {
        self.worker.call(Command::Start)?;
        Ok(())
    }

    fn native_stop(&mut self) -> DeviceResult<()> {
        self.worker.call(Command::Stop)?;
        Ok(())
    }

    fn native_set_sample_rate(&mut self, rate: u32) -> DeviceResult<()> {
        self.worker.call(Command::SetSampleRate(rate))?;
        Ok(())
    }

    fn native_set_buffer_size(&mut self, frames: u32) -> DeviceResult<()> {
        self.worker.call(Command::SetBufferSize(frames))?;
        Ok(())
    }

    fn native_query_caps(&mut self) -> DeviceResult<HalDeviceCaps> {
        self.worker.call(Command::QueryCaps)?.into_caps()
    }

    fn native_sample_rate(&mut self) -> DeviceResult<u32> {
        self.worker.call(Command::SampleRate)?.into_rate()
    }

    fn native_latency(&mut self) -> DeviceResult<Latency> {
        self.worker.call(Command::Latency)?.into_latency()
    }

    fn native_control_panel(&mut self) -> DeviceResult<()> {
        self.worker.call(Command::ControlPanel)?;
        Ok(())
    }

    fn native_reinitialize(&mut self) -> DeviceResult<()> {
        let caps = self
            .worker
            .call_with_timeout(
                Command::Reinitialize {
                    sample_rate: self.core.sample_rate,
                    buffer_size: self.core.buffer_size,
                },
                self.reinit_timeout,
            )?
            .into_caps()?;
        if let Some(frames) = self.core.apply_caps(&caps) {
            tracing::warn!(device = %self.core.name, frames, "buffer size no longer offered after reset");
        }
        Ok(())
    }
}

impl Drop for DriverDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
