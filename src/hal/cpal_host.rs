//! System audio through cpal
//!
//! cpal has no notion of a device-wide nominal rate or buffer size; both are
//! chosen per stream. [`CpalHal`] keeps the requested values per device and
//! applies them when the IO unit opens. cpal also delivers whatever block
//! size the backend likes, so the stream callbacks re-block into exactly the
//! configured number of frames before calling the [`IoProc`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedBufferSize;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::error::{HalError, HalResult};
use crate::hal::{
    channel_names, BufferSizeRange, CallbackHal, HalDeviceCaps, HalProperty, IoBuffers, IoProc,
    IoStatus, IoUnit, IoUnitConfig, Latency, PropertyListener, DEFAULT_BUFFER_SIZES,
    STANDARD_SAMPLE_RATES,
};

const LOOKUP_ATTEMPTS: usize = 3;
const LOOKUP_INTERVAL: Duration = Duration::from_millis(50);

/// A callback this late (in periods) counts as an overload
const OVERLOAD_GAP_PERIODS: f64 = 2.0;

/// Open a cpal host by name, or the default host
pub(crate) fn open_host(name: Option<&str>) -> HalResult<cpal::Host> {
    let Some(name) = name else {
        return Ok(cpal::default_host());
    };
    let id = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| HalError::NotSupported(format!("audio host {}", name)))?;
    cpal::host_from_id(id).map_err(|e| HalError::Cpal(e.to_string()))
}

/// Find a device by name, retrying briefly while the OS settles
pub(crate) fn find_device(host: &cpal::Host, name: &str) -> HalResult<cpal::Device> {
    for attempt in 0..LOOKUP_ATTEMPTS {
        let devices = host
            .devices()
            .map_err(|e| HalError::Enumeration(e.to_string()))?;
        for device in devices {
            if device.name().ok().as_deref() == Some(name) {
                return Ok(device);
            }
        }
        tracing::debug!(device = %name, attempt = attempt + 1, "device lookup miss");
        if attempt + 1 < LOOKUP_ATTEMPTS {
            thread::sleep(LOOKUP_INTERVAL);
        }
    }
    Err(HalError::DeviceNotFound(name.to_string()))
}

fn f32_configs<I>(configs: I) -> Vec<cpal::SupportedStreamConfigRange>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    let all: Vec<_> = configs.collect();
    let f32_only: Vec<_> = all
        .iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .cloned()
        .collect();
    if f32_only.is_empty() {
        all
    } else {
        f32_only
    }
}

fn rates_in(configs: &[cpal::SupportedStreamConfigRange]) -> Vec<u32> {
    STANDARD_SAMPLE_RATES
        .iter()
        .copied()
        .filter(|&rate| {
            configs
                .iter()
                .any(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        })
        .collect()
}

fn buffer_sizes_in(configs: &[cpal::SupportedStreamConfigRange]) -> Vec<u32> {
    let mut sizes = Vec::new();
    for config in configs {
        match config.buffer_size() {
            SupportedBufferSize::Range { min, max } => sizes.extend(
                BufferSizeRange {
                    min: *min,
                    max: *max,
                    preferred: *min,
                    granularity: -1,
                }
                .sizes(),
            ),
            SupportedBufferSize::Unknown => sizes.extend_from_slice(&DEFAULT_BUFFER_SIZES),
        }
    }
    sizes.sort_unstable();
    sizes.dedup();
    if sizes.is_empty() {
        sizes.extend_from_slice(&DEFAULT_BUFFER_SIZES);
    }
    sizes
}

/// Capabilities of a cpal device
pub(crate) fn probe_device(device: &cpal::Device) -> HalResult<HalDeviceCaps> {
    let name = device.name().map_err(|e| HalError::Cpal(e.to_string()))?;
    let inputs = device
        .supported_input_configs()
        .map(f32_configs)
        .unwrap_or_default();
    let outputs = device
        .supported_output_configs()
        .map(f32_configs)
        .unwrap_or_default();
    if inputs.is_empty() && outputs.is_empty() {
        return Err(HalError::Enumeration(format!("{}: no usable stream configuration", name)));
    }

    let max_inputs = inputs.iter().map(|c| c.channels() as u32).max().unwrap_or(0);
    let max_outputs = outputs.iter().map(|c| c.channels() as u32).max().unwrap_or(0);

    // Duplex streams need a rate both directions accept.
    let sample_rates = match (inputs.is_empty(), outputs.is_empty()) {
        (false, false) => {
            let input_rates = rates_in(&inputs);
            rates_in(&outputs)
                .into_iter()
                .filter(|r| input_rates.contains(r))
                .collect()
        }
        (true, false) => rates_in(&outputs),
        _ => rates_in(&inputs),
    };
    if sample_rates.is_empty() {
        return Err(HalError::Enumeration(format!("{}: no standard sample rate", name)));
    }

    let all: Vec<_> = inputs.iter().chain(outputs.iter()).cloned().collect();
    let buffer_sizes = buffer_sizes_in(&all);
    let default_buffer_size = if buffer_sizes.contains(&crate::constants::DEFAULT_BUFFER_SIZE) {
        crate::constants::DEFAULT_BUFFER_SIZE
    } else {
        buffer_sizes[buffer_sizes.len() / 2]
    };

    Ok(HalDeviceCaps {
        name,
        input_channels: channel_names("Input", max_inputs),
        output_channels: channel_names("Output", max_outputs),
        sample_rates,
        buffer_sizes,
        default_buffer_size,
    })
}

/// Rate the device runs at when nobody asked for one
pub(crate) fn default_sample_rate(device: &cpal::Device) -> Option<u32> {
    device
        .default_output_config()
        .or_else(|_| device.default_input_config())
        .ok()
        .map(|c| c.sample_rate().0)
}

/// Stream faults reported by cpal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamFault {
    DeviceGone,
    BackendError,
    Overload,
}

pub(crate) type FaultHandler = Arc<dyn Fn(StreamFault) + Send + Sync>;

enum Tick {
    Restarted,
    Late,
    OnTime,
}

/// Tracks callback arrival to spot gaps longer than a couple of periods
struct CallbackClock {
    last: Option<Instant>,
    restarted: Arc<AtomicBool>,
    sample_rate: f64,
}

impl CallbackClock {
    fn new(restarted: Arc<AtomicBool>, sample_rate: u32) -> Self {
        Self {
            last: None,
            restarted,
            sample_rate: sample_rate.max(1) as f64,
        }
    }

    fn tick(&mut self, frames: usize) -> Tick {
        let now = Instant::now();
        let previous = self.last.replace(now);
        if self.restarted.swap(false, Ordering::AcqRel) {
            return Tick::Restarted;
        }
        match previous {
            Some(prev)
                if now.duration_since(prev).as_secs_f64()
                    > OVERLOAD_GAP_PERIODS * frames as f64 / self.sample_rate =>
            {
                Tick::Late
            }
            _ => Tick::OnTime,
        }
    }
}

/// Re-blocks cpal's variable callbacks into fixed-size IoProc calls.
/// All buffers are allocated up front.
struct BlockAdapter {
    proc: Box<dyn IoProc>,
    frames: usize,
    input_channels: usize,
    input_block: Vec<f32>,
    input_fill: usize,
    output_block: Vec<f32>,
    output_pos: usize,
    input_ring: Option<Arc<ArrayQueue<f32>>>,
    stopped: bool,
    start: Instant,
}

impl BlockAdapter {
    fn new(proc: Box<dyn IoProc>, config: &IoUnitConfig, input_ring: Option<Arc<ArrayQueue<f32>>>) -> Self {
        let frames = (config.buffer_size as usize).max(1);
        let output_block = vec![0.0; frames * config.output_channels];
        Self {
            proc,
            frames,
            input_channels: config.input_channels,
            input_block: vec![0.0; frames * config.input_channels],
            input_fill: 0,
            output_pos: output_block.len(),
            output_block,
            input_ring,
            stopped: false,
            start: Instant::now(),
        }
    }

    fn run_block(&mut self, with_output: bool) {
        if let Some(ring) = &self.input_ring {
            for sample in self.input_block.iter_mut() {
                *sample = ring.pop().unwrap_or(0.0);
            }
        }
        self.output_block.fill(0.0);
        if !self.stopped {
            let status = self.proc.process(IoBuffers {
                input: (self.input_channels > 0).then(|| &self.input_block[..]),
                output: with_output.then(|| &mut self.output_block[..]),
                frames: self.frames,
                host_time_ns: self.start.elapsed().as_nanos() as u64,
            });
            self.stopped = status == IoStatus::Stop;
        }
        self.output_pos = 0;
    }

    /// Output callback: fill `out` from whole proc blocks
    fn render(&mut self, out: &mut [f32]) {
        if self.output_block.is_empty() {
            out.fill(0.0);
            return;
        }
        let mut written = 0;
        while written < out.len() {
            if self.output_pos >= self.output_block.len() {
                self.run_block(true);
            }
            let n = (out.len() - written).min(self.output_block.len() - self.output_pos);
            out[written..written + n]
                .copy_from_slice(&self.output_block[self.output_pos..self.output_pos + n]);
            written += n;
            self.output_pos += n;
        }
    }

    /// Input-only callback: run the proc for every completed block
    fn capture(&mut self, data: &[f32]) {
        if self.input_block.is_empty() {
            return;
        }
        let mut read = 0;
        while read < data.len() {
            let n = (data.len() - read).min(self.input_block.len() - self.input_fill);
            self.input_block[self.input_fill..self.input_fill + n]
                .copy_from_slice(&data[read..read + n]);
            self.input_fill += n;
            read += n;
            if self.input_fill == self.input_block.len() {
                self.input_fill = 0;
                self.run_block(false);
            }
        }
    }

    /// Forget partial blocks left over from before a pause
    fn rearm(&mut self) {
        self.stopped = false;
        self.input_fill = 0;
        self.output_pos = self.output_block.len();
        if let Some(ring) = &self.input_ring {
            while ring.pop().is_some() {}
        }
    }
}

/// The cpal streams of one IO unit, built paused
pub(crate) struct CpalStreams {
    input: Option<cpal::Stream>,
    output: Option<cpal::Stream>,
    restarted: Arc<AtomicBool>,
}

impl CpalStreams {
    pub(crate) fn play(&self) -> HalResult<()> {
        self.restarted.store(true, Ordering::Release);
        // Input first so the ring has data when output starts pulling.
        for stream in self.input.iter().chain(self.output.iter()) {
            stream.play().map_err(|e| HalError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    pub(crate) fn pause(&self) -> HalResult<()> {
        for stream in self.output.iter().chain(self.input.iter()) {
            stream.pause().map_err(|e| HalError::Stream(e.to_string()))?;
        }
        Ok(())
    }
}

/// Ask for a fixed native buffer only when the device advertises it
fn native_buffer_size(ranges: &[cpal::SupportedStreamConfigRange], frames: u32) -> cpal::BufferSize {
    let fixed = ranges.iter().any(|r| match r.buffer_size() {
        SupportedBufferSize::Range { min, max } => *min <= frames && frames <= *max,
        SupportedBufferSize::Unknown => false,
    });
    if fixed {
        cpal::BufferSize::Fixed(frames)
    } else {
        cpal::BufferSize::Default
    }
}

fn stream_config(
    ranges: &[cpal::SupportedStreamConfigRange],
    channels: usize,
    config: &IoUnitConfig,
) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: native_buffer_size(ranges, config.buffer_size),
    }
}

fn error_callback(on_fault: FaultHandler) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => on_fault(StreamFault::DeviceGone),
        cpal::StreamError::BackendSpecific { err } => {
            tracing::warn!(error = %err, "stream error");
            on_fault(StreamFault::BackendError);
        }
    }
}

fn build_error(config: &IoUnitConfig, err: cpal::BuildStreamError) -> HalError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => HalError::DeviceNotFound(err.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported => {
            HalError::UnsupportedSampleRate(config.sample_rate)
        }
        other => HalError::Stream(other.to_string()),
    }
}

/// Build the input and/or output streams for `config`.
///
/// With both directions the output callback drives the proc and input
/// samples travel through a lock-free ring. Input-only devices drive the
/// proc from the input callback.
pub(crate) fn build_streams(
    device: &cpal::Device,
    config: IoUnitConfig,
    proc: Box<dyn IoProc>,
    on_fault: FaultHandler,
) -> HalResult<CpalStreams> {
    if config.input_channels == 0 && config.output_channels == 0 {
        return Err(HalError::Stream("no channels enabled".into()));
    }
    let restarted = Arc::new(AtomicBool::new(true));
    let duplex = config.input_channels > 0 && config.output_channels > 0;
    let ring = duplex.then(|| {
        Arc::new(ArrayQueue::new(
            (config.buffer_size as usize * config.input_channels * 4).max(1),
        ))
    });
    let mut adapter = Some(BlockAdapter::new(proc, &config, ring.clone()));

    let input = if config.input_channels > 0 {
        let ranges = f32_configs(
            device
                .supported_input_configs()
                .map_err(|e| HalError::Stream(e.to_string()))?,
        );
        let stream_config = stream_config(&ranges, config.input_channels, &config);
        let stream = match (ring, adapter.take()) {
            (Some(ring), driving) => {
                // Duplex: only feed the ring, the output callback drives.
                adapter = driving;
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            if ring.push(sample).is_err() {
                                break;
                            }
                        }
                    },
                    error_callback(on_fault.clone()),
                    None,
                )
            }
            (None, Some(mut adapter)) => {
                let mut clock = CallbackClock::new(restarted.clone(), config.sample_rate);
                let fault = on_fault.clone();
                let channels = config.input_channels;
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        match clock.tick(data.len() / channels) {
                            Tick::Restarted => adapter.rearm(),
                            Tick::Late => fault(StreamFault::Overload),
                            Tick::OnTime => {}
                        }
                        adapter.capture(data);
                    },
                    error_callback(on_fault.clone()),
                    None,
                )
            }
            (None, None) => return Err(HalError::Stream("IO proc already attached".into())),
        }
        .map_err(|e| build_error(&config, e))?;
        stream.pause().map_err(|e| HalError::Stream(e.to_string()))?;
        Some(stream)
    } else {
        None
    };

    let output = match adapter.take() {
        Some(mut adapter) if config.output_channels > 0 => {
            let ranges = f32_configs(
                device
                    .supported_output_configs()
                    .map_err(|e| HalError::Stream(e.to_string()))?,
            );
            let mut clock = CallbackClock::new(restarted.clone(), config.sample_rate);
            let fault = on_fault.clone();
            let channels = config.output_channels;
            let stream = device
                .build_output_stream(
                    &stream_config(&ranges, channels, &config),
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        match clock.tick(out.len() / channels) {
                            Tick::Restarted => adapter.rearm(),
                            Tick::Late => fault(StreamFault::Overload),
                            Tick::OnTime => {}
                        }
                        adapter.render(out);
                    },
                    error_callback(on_fault),
                    None,
                )
                .map_err(|e| build_error(&config, e))?;
            stream.pause().map_err(|e| HalError::Stream(e.to_string()))?;
            Some(stream)
        }
        _ => None,
    };

    Ok(CpalStreams {
        input,
        output,
        restarted,
    })
}

/// cpal as a synchronous callback HAL
pub struct CpalHal {
    host_name: Option<String>,
    nominal_rates: Mutex<HashMap<String, u32>>,
}

impl CpalHal {
    pub fn new(host_name: Option<String>) -> HalResult<Self> {
        let host = open_host(host_name.as_deref())?;
        tracing::info!(host = host.id().name(), "using cpal host");
        Ok(Self {
            host_name,
            nominal_rates: Mutex::new(HashMap::new()),
        })
    }

    fn host(&self) -> HalResult<cpal::Host> {
        open_host(self.host_name.as_deref())
    }

    fn device(&self, name: &str) -> HalResult<cpal::Device> {
        find_device(&self.host()?, name)
    }
}

impl CallbackHal for CpalHal {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn enumerate(&self) -> HalResult<Vec<HalResult<HalDeviceCaps>>> {
        let devices = self
            .host()?
            .devices()
            .map_err(|e| HalError::Enumeration(e.to_string()))?;
        Ok(devices.map(|d| probe_device(&d)).collect())
    }

    fn device_caps(&self, device: &str) -> HalResult<HalDeviceCaps> {
        probe_device(&self.device(device)?)
    }

    fn nominal_sample_rate(&self, device: &str) -> HalResult<u32> {
        if let Some(rate) = self.nominal_rates.lock().get(device) {
            return Ok(*rate);
        }
        let device = self.device(device)?;
        Ok(default_sample_rate(&device).unwrap_or(crate::constants::DEFAULT_SAMPLE_RATE))
    }

    fn set_nominal_sample_rate(&self, device: &str, rate: u32) -> HalResult<()> {
        if !self.device_caps(device)?.sample_rates.contains(&rate) {
            return Err(HalError::UnsupportedSampleRate(rate));
        }
        self.nominal_rates.lock().insert(device.to_string(), rate);
        Ok(())
    }

    /// cpal takes the buffer size per stream, so this only validates it.
    /// [`open_io_unit`](CallbackHal::open_io_unit) applies it.
    fn set_buffer_size(&self, device: &str, frames: u32) -> HalResult<()> {
        if !self.device_caps(device)?.buffer_sizes.contains(&frames) {
            return Err(HalError::UnsupportedBufferSize(frames));
        }
        Ok(())
    }

    fn open_io_unit(
        &self,
        device: &str,
        config: IoUnitConfig,
        proc: Box<dyn IoProc>,
        listener: Arc<dyn PropertyListener>,
    ) -> HalResult<Box<dyn IoUnit>> {
        let cpal_device = self.device(device)?;
        let on_fault: FaultHandler = Arc::new(move |fault| {
            listener.property_changed(match fault {
                StreamFault::DeviceGone => HalProperty::DeviceDied,
                StreamFault::BackendError => HalProperty::DeviceReconfigured,
                StreamFault::Overload => HalProperty::ProcessorOverload,
            })
        });
        let streams = build_streams(&cpal_device, config, proc, on_fault)?;
        tracing::debug!(device = %device, ?config, "cpal IO unit opened");
        Ok(Box::new(CpalIoUnit { streams, config }))
    }
}

struct CpalIoUnit {
    streams: CpalStreams,
    config: IoUnitConfig,
}

impl IoUnit for CpalIoUnit {
    fn start(&mut self) -> HalResult<()> {
        self.streams.play()
    }

    fn stop(&mut self) -> HalResult<()> {
        self.streams.pause()
    }

    fn reset(&mut self) {}

    fn latency(&self) -> Latency {
        // cpal reports no device latency; one buffer per enabled direction.
        let frames = self.config.buffer_size;
        Latency {
            input: if self.config.input_channels > 0 { frames } else { 0 },
            output: if self.config.output_channels > 0 { frames } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        blocks: Arc<AtomicUsize>,
        frames: usize,
    }

    impl IoProc for Counter {
        fn process(&mut self, buffers: IoBuffers<'_>) -> IoStatus {
            assert_eq!(buffers.frames, self.frames);
            if let Some(out) = buffers.output {
                out.fill(1.0);
            }
            self.blocks.fetch_add(1, Ordering::SeqCst);
            IoStatus::Continue
        }
    }

    fn adapter(frames: u32, inputs: usize, outputs: usize) -> (BlockAdapter, Arc<AtomicUsize>) {
        let blocks = Arc::new(AtomicUsize::new(0));
        let config = IoUnitConfig {
            sample_rate: 48000,
            buffer_size: frames,
            input_channels: inputs,
            output_channels: outputs,
        };
        let proc = Counter {
            blocks: blocks.clone(),
            frames: frames as usize,
        };
        (BlockAdapter::new(Box::new(proc), &config, None), blocks)
    }

    #[test]
    fn test_render_reblocks_output() {
        let (mut adapter, blocks) = adapter(64, 0, 2);
        // 100 stereo frames span two 64-frame blocks.
        let mut out = vec![0.0f32; 200];
        adapter.render(&mut out);
        assert_eq!(blocks.load(Ordering::SeqCst), 2);
        assert!(out.iter().all(|&s| s == 1.0));

        // The 28 frames left over serve the next small callback.
        let mut out = vec![0.0f32; 56];
        adapter.render(&mut out);
        assert_eq!(blocks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_capture_runs_per_full_block() {
        let (mut adapter, blocks) = adapter(32, 1, 0);
        adapter.capture(&[0.0; 20]);
        assert_eq!(blocks.load(Ordering::SeqCst), 0);
        adapter.capture(&[0.0; 50]);
        assert_eq!(blocks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rearm_discards_partial_block() {
        let (mut adapter, blocks) = adapter(32, 1, 0);
        adapter.capture(&[0.0; 20]);
        adapter.rearm();
        adapter.capture(&[0.0; 20]);
        assert_eq!(blocks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_callback_is_overload() {
        let restarted = Arc::new(AtomicBool::new(true));
        let mut clock = CallbackClock::new(restarted.clone(), 48000);
        assert!(matches!(clock.tick(4800), Tick::Restarted));
        assert!(matches!(clock.tick(4800), Tick::OnTime));
        thread::sleep(Duration::from_millis(250));
        assert!(matches!(clock.tick(4800), Tick::Late));

        // The first callback after a restart never counts.
        restarted.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(250));
        assert!(matches!(clock.tick(4800), Tick::Restarted));
    }
}
