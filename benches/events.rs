//! Event queue throughput: the producer side runs on audio and OS threads,
//! the drain on the control thread's idle tick.

use audio_device_layer::events::{DeviceEvents, EventDrain, EventKind};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_signal(c: &mut Criterion) {
    let events = DeviceEvents::new();
    let mut drain = EventDrain::new();
    c.bench_function("signal_value", |b| {
        b.iter(|| {
            events.signal_value(black_box(EventKind::BufferSizeChanged), black_box(256));
            // Keep the queue from saturating.
            if events.sequence(EventKind::BufferSizeChanged) % 32 == 0 {
                drain.drain(&events);
            }
        })
    });
}

fn bench_drain_burst(c: &mut Criterion) {
    let events = DeviceEvents::new();
    let mut drain = EventDrain::new();
    c.bench_function("drain_burst_of_16", |b| {
        b.iter(|| {
            for kind in EventKind::ALL.iter().cycle().take(16) {
                events.signal(*kind);
            }
            black_box(drain.drain(&events))
        })
    });
}

fn bench_overload(c: &mut Criterion) {
    let events = DeviceEvents::new();
    c.bench_function("overload", |b| {
        b.iter(|| {
            events.overload();
            if events.drop_count() % 32 == 0 {
                events.clear();
            }
        })
    });
}

criterion_group!(benches, bench_signal, bench_drain_burst, bench_overload);
criterion_main!(benches);
