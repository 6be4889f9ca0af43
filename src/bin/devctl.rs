//! Device control tool
//!
//! Lists audio devices or streams from one of them, printing what the
//! device layer reports.
//!
//! ```text
//! devctl [--virtual] [--driver] [--config <path>] list [--json]
//! devctl [--virtual] [--driver] [--config <path>] stream <name> [seconds]
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_device_layer::{
    constants::IDLE_INTERVAL_MS,
    hal::software::SoftwareDeviceSpec,
    AppConfig, BackendKind, DeviceClient, DeviceManager, HostApi, Notification,
};

enum Command {
    List { json: bool },
    Stream { name: String, seconds: Option<u64> },
}

struct Options {
    software: bool,
    driver: bool,
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Options> {
    let mut software = false;
    let mut driver = false;
    let mut config = None;
    let mut rest = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--virtual" => software = true,
            "--driver" => driver = true,
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            _ => rest.push(arg),
        }
    }

    let command = match rest.first().map(String::as_str) {
        None | Some("list") => Command::List {
            json: rest.iter().any(|a| a == "--json"),
        },
        Some("stream") => {
            let name = rest.get(1).context("stream needs a device name")?.clone();
            let seconds = match rest.get(2) {
                Some(s) => Some(s.parse().with_context(|| format!("invalid duration {:?}", s))?),
                None => None,
            };
            Command::Stream { name, seconds }
        }
        Some(other) => bail!("unknown command {:?}", other),
    };

    Ok(Options {
        software,
        driver,
        config,
        command,
    })
}

/// Counts callbacks on the audio thread, logs everything else
#[derive(Default)]
struct Meter {
    callbacks: AtomicU64,
    frames: AtomicU64,
    /// Input peak as f32 bits
    peak: AtomicU32,
}

impl DeviceClient for Meter {
    fn notify(&self, notification: Notification<'_>) {
        match notification {
            Notification::AudioCallback(data) => {
                self.callbacks.fetch_add(1, Ordering::Relaxed);
                self.frames.fetch_add(data.frames as u64, Ordering::Relaxed);
                if let Some(input) = data.input {
                    let peak = input.iter().fold(0.0f32, |p, s| p.max(s.abs()));
                    self.peak.fetch_max(peak.to_bits(), Ordering::Relaxed);
                }
            }
            other => tracing::info!(reason = other.reason(), "{:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = parse_args()?;
    let mut config = match &options.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default()?,
    };
    if options.driver {
        config.manager.backend = BackendKind::Driver;
    }

    let host = if options.software {
        HostApi::software(config.manager.backend, SoftwareDeviceSpec::demo_set())
    } else {
        HostApi::from_config(&config.manager)?
    };
    let meter = Arc::new(Meter::default());
    let mut manager = DeviceManager::new(config, host, Some(meter.clone() as Arc<dyn DeviceClient>))?;

    match options.command {
        Command::List { json } => list(&manager, json),
        Command::Stream { name, seconds } => stream(&mut manager, &meter, &name, seconds).await,
    }
}

fn list(manager: &DeviceManager, json: bool) -> Result<()> {
    let devices = manager.list_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    println!("\n=== Audio Devices ({}) ===", manager.host().name());
    for device in &devices {
        println!("  [{}] {}", device.id, device.name);
        println!("    Channels: {} in / {} out", device.max_input_channels, device.max_output_channels);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Buffer sizes: {:?} (default {})", device.buffer_sizes, device.default_buffer_size);
    }
    println!();
    Ok(())
}

async fn stream(manager: &mut DeviceManager, meter: &Meter, name: &str, seconds: Option<u64>) -> Result<()> {
    let device = manager
        .init_new_current_device(name)
        .with_context(|| format!("could not open {:?}", name))?;
    device.set_active(true)?;
    device.set_streaming(true)?;
    tracing::info!(
        device = %device.name(),
        sample_rate = device.current_sampling_rate(),
        buffer_size = device.current_buffer_size(),
        "streaming, press Ctrl-C to stop"
    );

    let deadline = tokio::time::sleep(Duration::from_secs(seconds.unwrap_or(365 * 24 * 3600)));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupted);
    let mut idle = tokio::time::interval(Duration::from_millis(IDLE_INTERVAL_MS));
    let mut report = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = idle.tick() => manager.idle(),
            _ = report.tick() => {
                let drops = manager.current_device().map_or(0, |d| d.drop_count());
                let peak = f32::from_bits(meter.peak.swap(0, Ordering::Relaxed));
                println!(
                    "callbacks: {:>8}  frames: {:>10}  peak: {:>6.3}  drops: {}",
                    meter.callbacks.load(Ordering::Relaxed),
                    meter.frames.load(Ordering::Relaxed),
                    peak,
                    drops,
                );
            }
            _ = &mut deadline => break,
            _ = &mut interrupted => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    manager.destroy_current_device();
    Ok(())
}
