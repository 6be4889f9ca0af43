//! Client notifications
//!
//! Everything a device or the manager reports to the application goes
//! through a single [`DeviceClient`]. Most notifications are delivered on the
//! control thread from [`DeviceManager::idle`](crate::manager::DeviceManager::idle),
//! but [`Notification::AudioCallback`] is delivered synchronously on the
//! real-time audio thread, so a client must handle that reason without
//! blocking or allocating.

use std::fmt;
use std::sync::Arc;

use crate::device::ConnectionState;

/// Buffers handed to the client for one real-time callback.
///
/// Samples are interleaved `f32`. The references are only valid for the
/// duration of the callback.
pub struct AudioCallbackData<'a> {
    /// Input samples, `None` for devices without inputs
    pub input: Option<&'a [f32]>,
    /// Output samples to fill, `None` for input-only devices
    pub output: Option<&'a mut [f32]>,
    /// Frames in this callback
    pub frames: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Running sample counter at the first frame of this buffer
    pub sample_time: u64,
    /// Host time of the callback in nanoseconds
    pub host_time_ns: u64,
}

impl fmt::Debug for AudioCallbackData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioCallbackData")
            .field("frames", &self.frames)
            .field("input_channels", &self.input_channels)
            .field("output_channels", &self.output_channels)
            .field("sample_time", &self.sample_time)
            .field("host_time_ns", &self.host_time_ns)
            .finish()
    }
}

/// Reason codes (with payloads) delivered to the client
#[derive(Debug)]
pub enum Notification<'a> {
    /// The registry was replaced with a structurally different list
    DeviceListChanged,
    /// The current device no longer shows up in enumeration
    DeviceConnectionLost { name: &'a str },
    /// The native layer reported the current device as gone
    DeviceDisconnected,
    /// The native layer missed a deadline
    Dropout { drop_count: u32 },
    /// The driver asks the application to reset the device
    RequestReset,
    /// The driver lost sync and asks for a resync
    RequestResync,
    /// Effective sample rate after a change
    SamplingRateChanged(u32),
    /// Effective buffer size after a change or substitution
    BufferSizeChanged(u32),
    /// Input/output latency in frames changed
    LatencyChanged { input: u32, output: u32 },
    DeviceStartedStreaming,
    DeviceStoppedStreaming,
    DeviceStatusChanged(ConnectionState),
    DeviceError { message: &'a str },
    AudioCallback(AudioCallbackData<'a>),
}

impl Notification<'_> {
    /// Short, stable name of the reason, used for logging
    pub fn reason(&self) -> &'static str {
        match self {
            Notification::DeviceListChanged => "device-list-changed",
            Notification::DeviceConnectionLost { .. } => "device-connection-lost",
            Notification::DeviceDisconnected => "device-disconnected",
            Notification::Dropout { .. } => "dropout",
            Notification::RequestReset => "request-reset",
            Notification::RequestResync => "request-resync",
            Notification::SamplingRateChanged(_) => "sampling-rate-changed",
            Notification::BufferSizeChanged(_) => "buffer-size-changed",
            Notification::LatencyChanged { .. } => "latency-changed",
            Notification::DeviceStartedStreaming => "device-started-streaming",
            Notification::DeviceStoppedStreaming => "device-stopped-streaming",
            Notification::DeviceStatusChanged(_) => "device-status-changed",
            Notification::DeviceError { .. } => "device-error",
            Notification::AudioCallback(_) => "audio-callback",
        }
    }
}

/// The application side of the notification channel
pub trait DeviceClient: Send + Sync {
    fn notify(&self, notification: Notification<'_>);
}

impl<F> DeviceClient for F
where
    F: Fn(Notification<'_>) + Send + Sync,
{
    fn notify(&self, notification: Notification<'_>) {
        self(notification)
    }
}

/// Forwards notifications to the manager's single registered client.
///
/// The client is fixed when the manager is built, so the audio thread can
/// read it without any locking.
#[derive(Clone, Default)]
pub struct Notifier {
    client: Option<Arc<dyn DeviceClient>>,
}

impl Notifier {
    pub fn new(client: Option<Arc<dyn DeviceClient>>) -> Self {
        Self { client }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Deliver a notification, a no-op without a client
    #[inline]
    pub fn notify(&self, notification: Notification<'_>) {
        if let Some(client) = &self.client {
            client.notify(notification);
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("has_client", &self.has_client())
            .finish()
    }
}
