//! Real-time callback path
//!
//! [`IoContext`] is the one [`IoProc`] every device variant hands to its
//! HAL. It runs on the real-time thread: no locks, no allocation, no
//! logging. Anything that needs the control thread goes through
//! [`DeviceEvents`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::events::{DeviceEvents, EventKind};
use crate::hal::{IoBuffers, IoProc, IoStatus};
use crate::notification::{AudioCallbackData, Notification, Notifier};

/// State shared between a device and its running IO context
#[derive(Debug, Default)]
pub struct IoShared {
    stop_requested: AtomicBool,
    sample_time: AtomicU64,
    callbacks: AtomicU64,
}

impl IoShared {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    /// Running sample counter, advanced by each delivered buffer
    pub fn sample_time(&self) -> u64 {
        self.sample_time.load(Ordering::Acquire)
    }

    /// Callbacks delivered to the client since activation
    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.sample_time.store(0, Ordering::Release);
        self.callbacks.store(0, Ordering::Release);
    }
}

/// Per-activation IO procedure
pub struct IoContext {
    notifier: Notifier,
    shared: Arc<IoShared>,
    events: Arc<DeviceEvents>,
    frames: usize,
    input_channels: usize,
    output_channels: usize,
}

impl IoContext {
    pub fn new(
        notifier: Notifier,
        shared: Arc<IoShared>,
        events: Arc<DeviceEvents>,
        frames: usize,
        input_channels: usize,
        output_channels: usize,
    ) -> Self {
        Self {
            notifier,
            shared,
            events,
            frames,
            input_channels,
            output_channels,
        }
    }
}

impl IoProc for IoContext {
    fn process(&mut self, buffers: IoBuffers<'_>) -> IoStatus {
        let IoBuffers {
            input,
            output,
            frames,
            host_time_ns,
        } = buffers;

        if self.shared.stop_requested.load(Ordering::Acquire) {
            if let Some(output) = output {
                output.fill(0.0);
            }
            return IoStatus::Stop;
        }

        if frames != self.frames {
            if let Some(output) = output {
                output.fill(0.0);
            }
            self.events
                .signal_value(EventKind::BufferSizeChanged, frames as u32);
            return IoStatus::Continue;
        }

        let sample_time = self.shared.sample_time.load(Ordering::Relaxed);
        self.notifier
            .notify(Notification::AudioCallback(AudioCallbackData {
                input,
                output,
                frames,
                input_channels: self.input_channels,
                output_channels: self.output_channels,
                sample_time,
                host_time_ns,
            }));
        // Only this thread writes the counter.
        self.shared
            .sample_time
            .store(sample_time + frames as u64, Ordering::Release);
        self.shared.callbacks.fetch_add(1, Ordering::AcqRel);
        IoStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDrain;
    use crate::notification::DeviceClient;
    use parking_lot::Mutex;

    fn context(frames: usize) -> (IoContext, Arc<IoShared>, Arc<DeviceEvents>, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let client: Arc<dyn DeviceClient> = Arc::new(move |n: Notification<'_>| {
            if let Notification::AudioCallback(data) = n {
                sink.lock().push(data.sample_time);
                if let Some(output) = data.output {
                    output.fill(0.25);
                }
            }
        });
        let shared = Arc::new(IoShared::default());
        let events = Arc::new(DeviceEvents::new());
        let ctx = IoContext::new(
            Notifier::new(Some(client)),
            shared.clone(),
            events.clone(),
            frames,
            2,
            2,
        );
        (ctx, shared, events, seen)
    }

    fn run(ctx: &mut IoContext, frames: usize, output: &mut [f32]) -> IoStatus {
        let input = vec![0.0f32; frames * 2];
        ctx.process(IoBuffers {
            input: Some(&input),
            output: Some(&mut output[..frames * 2]),
            frames,
            host_time_ns: 0,
        })
    }

    #[test]
    fn test_sample_time_advances() {
        let (mut ctx, shared, _, seen) = context(64);
        let mut out = vec![0.0f32; 128];
        for _ in 0..3 {
            assert_eq!(run(&mut ctx, 64, &mut out), IoStatus::Continue);
        }
        assert_eq!(*seen.lock(), vec![0, 64, 128]);
        assert_eq!(shared.sample_time(), 192);
        assert_eq!(shared.callbacks(), 3);
        assert!(out.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_frame_mismatch_outputs_silence() {
        let (mut ctx, shared, events, seen) = context(64);
        let mut out = vec![1.0f32; 256];
        assert_eq!(run(&mut ctx, 128, &mut out), IoStatus::Continue);
        assert!(out[..256].iter().all(|&s| s == 0.0));
        assert!(seen.lock().is_empty());
        assert_eq!(shared.sample_time(), 0);

        let pending = EventDrain::new().drain(&events);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, EventKind::BufferSizeChanged);
        assert_eq!(pending[0].value, 128);
    }

    #[test]
    fn test_stop_request_suppresses_client() {
        let (mut ctx, shared, _, seen) = context(64);
        let mut out = vec![1.0f32; 128];
        shared.request_stop();
        assert_eq!(run(&mut ctx, 64, &mut out), IoStatus::Stop);
        assert!(seen.lock().is_empty());
        assert!(out.iter().all(|&s| s == 0.0));

        shared.clear_stop();
        assert_eq!(run(&mut ctx, 64, &mut out), IoStatus::Continue);
        assert_eq!(seen.lock().len(), 1);
    }
}
