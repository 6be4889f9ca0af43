//! Software-timed IO thread
//!
//! Drives an [`IoProc`] from a plain OS thread, one buffer period at a time.
//! Deadlines are absolute so sleep jitter does not accumulate into drift.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{HalError, HalResult};
use crate::hal::{IoBuffers, IoProc, IoStatus, MAX_FRAMES_PER_CALLBACK};

/// Parameters of a clock thread
#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub sample_rate: u32,
    /// Frames per tick. Shared so a binding can change what it delivers.
    pub frames: Arc<AtomicU32>,
    pub input_channels: usize,
    pub output_channels: usize,
}

/// A running clock thread. Dropping it stops and joins the thread.
pub struct ClockThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Box<dyn IoProc>>>,
}

impl ClockThread {
    pub fn spawn(name: &str, config: ClockConfig, proc: Box<dyn IoProc>) -> HalResult<Self> {
        if config.sample_rate == 0 {
            return Err(HalError::UnsupportedSampleRate(0));
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-clock", name))
            .spawn(move || run_clock(config, proc, flag))
            .map_err(|e| HalError::Stream(format!("spawn clock thread: {}", e)))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop the thread and hand back the proc. No tick runs after this
    /// returns.
    pub fn stop(&mut self) -> Option<Box<dyn IoProc>> {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(proc) => Some(proc),
            Err(_) => {
                tracing::error!("clock thread panicked");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ClockThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_clock(
    config: ClockConfig,
    mut proc: Box<dyn IoProc>,
    running: Arc<AtomicBool>,
) -> Box<dyn IoProc> {
    let input = vec![0.0f32; MAX_FRAMES_PER_CALLBACK * config.input_channels];
    let mut output = vec![0.0f32; MAX_FRAMES_PER_CALLBACK * config.output_channels];
    let start = Instant::now();
    let mut deadline = start;

    while running.load(Ordering::Acquire) {
        let frames = (config.frames.load(Ordering::Relaxed) as usize).clamp(1, MAX_FRAMES_PER_CALLBACK);
        let period = Duration::from_secs_f64(frames as f64 / config.sample_rate as f64);
        deadline += period;

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else if now - deadline > period * 4 {
            // Fell far behind (suspended process, debugger); resynchronise.
            deadline = now;
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        let out_len = frames * config.output_channels;
        output[..out_len].fill(0.0);
        let buffers = IoBuffers {
            input: (config.input_channels > 0).then(|| &input[..frames * config.input_channels]),
            output: (config.output_channels > 0).then(|| &mut output[..out_len]),
            frames,
            host_time_ns: start.elapsed().as_nanos() as u64,
        };
        if proc.process(buffers) == IoStatus::Stop {
            break;
        }
    }
    proc
}
