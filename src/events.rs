//! Lock-free device event queue
//!
//! OS notification threads, driver callbacks and the real-time audio thread
//! never call client code directly. They record what happened here, and the
//! control thread drains the queue on its idle tick.
//!
//! Every event kind carries a monotonic sequence number. The consumer keeps
//! the last sequence it reported per kind, so a burst of identical events
//! between two idle ticks is reported exactly once.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Capacity of the pre-allocated queue
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Kinds of asynchronous device events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The device configuration changed under us, client should reset
    ResetRequested,
    ResyncRequested,
    /// Value: the new nominal rate reported by the OS
    SampleRateChanged,
    /// Value: the buffer size observed or reported by the driver
    BufferSizeChanged,
    /// Value: the total drop count
    Dropout,
    /// The native device is gone
    Disconnected,
    LatencyChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::ResetRequested,
        EventKind::ResyncRequested,
        EventKind::SampleRateChanged,
        EventKind::BufferSizeChanged,
        EventKind::Dropout,
        EventKind::Disconnected,
        EventKind::LatencyChanged,
    ];

    const COUNT: usize = Self::ALL.len();

    fn index(self) -> usize {
        self as usize
    }
}

/// An event ready to be reported, with the latest value for its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub value: u32,
}

#[derive(Debug, Clone, Copy)]
struct QueuedEvent {
    kind: EventKind,
    sequence: u64,
}

/// Producer side, shared between the device and every thread that can
/// report an event. All methods are wait-free and allocation-free.
#[derive(Debug)]
pub struct DeviceEvents {
    queue: ArrayQueue<QueuedEvent>,
    sequences: [AtomicU64; EventKind::COUNT],
    values: [AtomicU32; EventKind::COUNT],
    drop_count: AtomicU32,
    /// Set on (re)activation; the first overload after that is start-up noise
    suppress_next_overload: AtomicBool,
}

impl DeviceEvents {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(EVENT_QUEUE_CAPACITY),
            sequences: Default::default(),
            values: Default::default(),
            drop_count: AtomicU32::new(0),
            suppress_next_overload: AtomicBool::new(true),
        }
    }

    /// Record an event without a value
    #[inline]
    pub fn signal(&self, kind: EventKind) {
        self.signal_value(kind, 0);
    }

    /// Record an event with a value; later values for the same kind win
    #[inline]
    pub fn signal_value(&self, kind: EventKind, value: u32) {
        let index = kind.index();
        self.values[index].store(value, Ordering::Relaxed);
        let sequence = self.sequences[index].fetch_add(1, Ordering::AcqRel) + 1;
        // A full queue is fine: the drain also compares sequences directly.
        let _ = self.queue.push(QueuedEvent { kind, sequence });
    }

    /// Native processor-overload notification.
    ///
    /// The first one after activation is ignored, every later one bumps the
    /// drop counter and queues a dropout.
    pub fn overload(&self) {
        if self.suppress_next_overload.swap(false, Ordering::AcqRel) {
            return;
        }
        let drops = self.drop_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.signal_value(EventKind::Dropout, drops);
    }

    pub fn drop_count(&self) -> u32 {
        self.drop_count.load(Ordering::Acquire)
    }

    pub fn sequence(&self, kind: EventKind) -> u64 {
        self.sequences[kind.index()].load(Ordering::Acquire)
    }

    /// Forget everything: sequences, values, drops and queued events.
    /// The matching [`EventDrain`] must be reset at the same time.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
        for (sequence, value) in self.sequences.iter().zip(self.values.iter()) {
            sequence.store(0, Ordering::Release);
            value.store(0, Ordering::Release);
        }
        self.drop_count.store(0, Ordering::Release);
        self.suppress_next_overload.store(true, Ordering::Release);
    }

    /// Reset only the per-session drop counter
    pub fn reset_drops(&self) {
        self.drop_count.store(0, Ordering::Release);
    }
}

impl Default for DeviceEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side. Owned by the device and only used on the control thread.
#[derive(Debug, Default)]
pub struct EventDrain {
    reported: [u64; EventKind::COUNT],
}

impl EventDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.reported = [0; EventKind::COUNT];
    }

    /// Take every event that has not been reported yet, in arrival order,
    /// one entry per kind.
    pub fn drain(&mut self, events: &DeviceEvents) -> Vec<PendingEvent> {
        let mut pending = Vec::new();
        while let Some(queued) = events.queue.pop() {
            self.take(events, queued.kind, queued.sequence, &mut pending);
        }
        // Anything that overflowed the queue is still visible in the sequences.
        for kind in EventKind::ALL {
            self.take(events, kind, events.sequence(kind), &mut pending);
        }
        pending
    }

    fn take(
        &mut self,
        events: &DeviceEvents,
        kind: EventKind,
        sequence: u64,
        pending: &mut Vec<PendingEvent>,
    ) {
        let index = kind.index();
        if sequence <= self.reported[index] {
            return;
        }
        self.reported[index] = events.sequence(kind);
        pending.push(PendingEvent {
            kind,
            value: events.values[index].load(Ordering::Acquire),
        });
    }
}
