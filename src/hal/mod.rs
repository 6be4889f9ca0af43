//! Native audio HAL bindings
//!
//! Two HAL families are modelled, matching the two ways native audio
//! subsystems expose devices:
//!
//! ```text
//! ┌──────────────────────────────────┐   ┌──────────────────────────────────┐
//! │ CallbackHal (synchronous model)  │   │ DriverHost / Driver (thread-     │
//! │                                  │   │ affine, event-driven model)      │
//! │ control calls from any thread,   │   │ every Driver call must happen on │
//! │ the HAL owns the real-time       │   │ the thread that loaded it; the   │
//! │ thread and invokes an IoProc     │   │ driver posts DriverMessages      │
//! └──────────────┬───────────────────┘   └──────────────┬───────────────────┘
//!                │                                      │
//!        cpal_host::CpalHal                    cpal_driver::CpalDriverHost
//!        software::SoftwareHal                 software::SoftwareDriverHost
//! ```
//!
//! The `software` bindings model virtual interfaces with software-timed IO
//! threads. They need no hardware, which makes them the reference for tests.

pub mod clock;
pub mod cpal_driver;
pub mod cpal_host;
pub mod software;

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::HalResult;
use crate::info::DeviceInfo;

/// Sample rates probed against native rate ranges
pub const STANDARD_SAMPLE_RATES: [u32; 8] =
    [44100, 48000, 88200, 96000, 176400, 192000, 352800, 384000];

/// Buffer sizes assumed when a HAL cannot report its own
pub const DEFAULT_BUFFER_SIZES: [u32; 7] = [32, 64, 128, 256, 512, 1024, 2048];

/// Upper bound on frames per callback any binding allocates scratch for
pub const MAX_FRAMES_PER_CALLBACK: usize = 8192;

/// Capabilities of one device as reported by a HAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HalDeviceCaps {
    pub name: String,
    pub input_channels: Vec<String>,
    pub output_channels: Vec<String>,
    pub sample_rates: Vec<u32>,
    pub buffer_sizes: Vec<u32>,
    pub default_buffer_size: u32,
}

impl HalDeviceCaps {
    pub fn to_info(&self, id: u32) -> DeviceInfo {
        DeviceInfo {
            id,
            name: self.name.clone(),
            sample_rates: self.sample_rates.clone(),
            buffer_sizes: self.buffer_sizes.clone(),
            max_input_channels: self.input_channels.len() as u32,
            max_output_channels: self.output_channels.len() as u32,
            default_buffer_size: self.default_buffer_size,
        }
    }
}

/// Generate "Input 1", "Input 2", ... style channel names
pub fn channel_names(prefix: &str, count: u32) -> Vec<String> {
    (1..=count).map(|i| format!("{} {}", prefix, i)).collect()
}

/// A min/max/preferred/granularity buffer-size description.
///
/// `granularity == -1` means powers of two between `min` and `max`,
/// `0` means only `preferred`, a positive value is a linear step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    pub min: u32,
    pub max: u32,
    pub preferred: u32,
    pub granularity: i32,
}

impl BufferSizeRange {
    /// Expand the range into the ordered list of selectable sizes
    pub fn sizes(&self) -> Vec<u32> {
        let min = self.min.max(1);
        let max = self.max.min(MAX_FRAMES_PER_CALLBACK as u32).max(min);
        let mut sizes = Vec::new();
        match self.granularity {
            0 => sizes.push(self.preferred.clamp(min, max)),
            g if g < 0 => {
                let mut size = min.next_power_of_two();
                while size <= max {
                    sizes.push(size);
                    size *= 2;
                }
            }
            g => {
                let mut size = min;
                while size <= max {
                    sizes.push(size);
                    size += g as u32;
                }
            }
        }
        if sizes.is_empty() {
            sizes.push(self.preferred.clamp(min, max));
        }
        sizes
    }
}

/// Latency in frames, excluding the buffer itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latency {
    pub input: u32,
    pub output: u32,
}

/// Stream parameters handed to a HAL when opening IO.
///
/// A direction with zero channels is not enabled at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoUnitConfig {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl IoUnitConfig {
    pub fn period_secs(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate.max(1) as f64
    }
}

/// Buffers of one native IO cycle, interleaved `f32`
pub struct IoBuffers<'a> {
    pub input: Option<&'a [f32]>,
    pub output: Option<&'a mut [f32]>,
    pub frames: usize,
    pub host_time_ns: u64,
}

/// Whether the HAL should keep delivering callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Continue,
    Stop,
}

/// Real-time IO procedure invoked by a HAL on its audio thread
pub trait IoProc: Send + 'static {
    fn process(&mut self, buffers: IoBuffers<'_>) -> IoStatus;
}

/// Properties a synchronous HAL reports through listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalProperty {
    /// Nominal sample rate changed, possibly by another process
    NominalSampleRate,
    /// The device configuration changed under us
    DeviceReconfigured,
    ProcessorOverload,
    /// The device is no longer alive
    DeviceDied,
}

/// Receives property notifications, on arbitrary OS threads.
///
/// Implementations must not block and must not call into client code.
pub trait PropertyListener: Send + Sync {
    fn property_changed(&self, property: HalProperty);
}

/// Called when the set of devices known to a HAL changes
pub type DeviceListListener = Arc<dyn Fn() + Send + Sync>;

/// An open native stream of a synchronous HAL
pub trait IoUnit {
    fn start(&mut self) -> HalResult<()>;
    /// Stop delivery; no callback runs after this returns
    fn stop(&mut self) -> HalResult<()>;
    /// Drop any samples buffered on the native side
    fn reset(&mut self);
    fn latency(&self) -> Latency;
}

/// Synchronous-callback HAL: control calls run on the caller's thread and
/// the HAL owns the real-time thread.
pub trait CallbackHal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Query every device. The outer error aborts the pass, inner errors
    /// only concern one device.
    fn enumerate(&self) -> HalResult<Vec<HalResult<HalDeviceCaps>>>;

    fn device_caps(&self, device: &str) -> HalResult<HalDeviceCaps>;

    fn nominal_sample_rate(&self, device: &str) -> HalResult<u32>;

    /// Request a nominal rate. The change may land asynchronously; callers
    /// poll [`nominal_sample_rate`](Self::nominal_sample_rate).
    fn set_nominal_sample_rate(&self, device: &str, rate: u32) -> HalResult<()>;

    fn set_buffer_size(&self, device: &str, frames: u32) -> HalResult<()>;

    /// Open the IO unit. `listener` stays installed for the lifetime of the
    /// returned unit.
    fn open_io_unit(
        &self,
        device: &str,
        config: IoUnitConfig,
        proc: Box<dyn IoProc>,
        listener: Arc<dyn PropertyListener>,
    ) -> HalResult<Box<dyn IoUnit>>;

    fn show_control_panel(&self, device: &str) -> HalResult<()> {
        Err(crate::error::HalError::NotSupported(format!(
            "control panel for {}",
            device
        )))
    }

    /// Install a hot-plug listener. Returns `false` if the HAL cannot
    /// report device list changes.
    fn set_device_list_listener(&self, _listener: Option<DeviceListListener>) -> bool {
        false
    }
}

/// Messages a driver posts from its own threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMessage {
    /// The driver's preferred buffer size changed (e.g. from its own panel)
    BufferSizeChange(u32),
    ResetRequest,
    ResyncRequest,
    LatenciesChanged,
    Overload,
}

/// Non-blocking handle a driver uses to post messages
#[derive(Debug, Clone)]
pub struct DriverMessageSink {
    tx: Sender<DriverMessage>,
}

impl DriverMessageSink {
    /// Create a sink and the receiver the processing thread waits on
    pub fn channel(capacity: usize) -> (Self, Receiver<DriverMessage>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }

    /// Post without blocking; a full queue drops the message
    pub fn post(&self, message: DriverMessage) {
        if self.tx.try_send(message).is_err() {
            tracing::debug!(?message, "driver message dropped");
        }
    }
}

/// Host side of the thread-affine HAL: lists and loads drivers
pub trait DriverHost: Send + Sync {
    fn name(&self) -> &'static str;

    fn driver_names(&self) -> HalResult<Vec<String>>;

    /// Capabilities of one driver. May load and unload it on the calling
    /// thread.
    fn probe(&self, name: &str) -> HalResult<HalDeviceCaps>;

    /// Load a driver. The returned driver must only be used on the thread
    /// that called `load`.
    fn load(&self, name: &str) -> HalResult<Box<dyn Driver>>;

    fn set_device_list_listener(&self, _listener: Option<DeviceListListener>) -> bool {
        false
    }
}

/// A loaded, thread-affine driver. Dropping it unloads the driver.
pub trait Driver {
    fn init(&mut self, sink: DriverMessageSink) -> HalResult<()>;

    fn caps(&self) -> HalResult<HalDeviceCaps>;

    fn preferred_buffer_size(&self) -> HalResult<u32>;

    fn sample_rate(&self) -> HalResult<u32>;

    fn can_sample_rate(&self, rate: u32) -> bool;

    fn set_sample_rate(&mut self, rate: u32) -> HalResult<()>;

    /// Validate and remember the buffer size used by the next
    /// [`create_buffers`](Self::create_buffers)
    fn set_buffer_size(&mut self, frames: u32) -> HalResult<()>;

    fn create_buffers(&mut self, config: IoUnitConfig, proc: Box<dyn IoProc>) -> HalResult<()>;

    fn dispose_buffers(&mut self) -> HalResult<()>;

    fn start(&mut self) -> HalResult<()>;

    fn stop(&mut self) -> HalResult<()>;

    fn latencies(&self) -> HalResult<Latency>;

    fn control_panel(&mut self) -> HalResult<()> {
        Err(crate::error::HalError::NotSupported(
            "driver has no control panel".to_string(),
        ))
    }
}
