use anyhow::{Context, Result, anyhow};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::Deserialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use u3stream::{
    ChannelPair, DeviceConfig, JsonLinesSink, NusbTransport, Resolution, RestartPolicy, StreamConfig,
    StreamController, StreamWorker, TelemetrySink,
};

/// Streams analog inputs from a LabJack U3 and prints the latest scan as JSON lines.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON settings file with `device`, `stream` and `restart` sections.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Serial number of the U3 to open. Defaults to the first one found.
    #[arg(short, long)]
    serial: Option<u32>,
    /// Stream AIN0 through AIN(n-1), single ended.
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u8).range(1..=25))]
    channels: Option<u8>,
    /// Samples per StreamData packet. Must be a multiple of the channel count.
    #[arg(long)]
    samples_per_packet: Option<u8>,
    /// Scan period in stream clock ticks.
    #[arg(long)]
    scan_interval: Option<u16>,
    /// Resolution index, 0 (best) to 3 (fastest).
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=3))]
    resolution: Option<u8>,
    /// How often the latest scan is printed, in milliseconds.
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,
    /// Stop after this many scans.
    #[arg(long)]
    scans: Option<u64>,
    /// Stop after this many seconds.
    #[arg(short, long)]
    duration: Option<u64>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    device: DeviceConfig,
    stream: StreamConfig,
    restart: RestartPolicy,
}

fn setup_logging(log_file_path: Option<&Path>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // stdout carries the JSON lines
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("Failed to read config file {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("Invalid config file {:?}", path))?
        }
        None => Settings::default(),
    };

    if cli.serial.is_some() {
        settings.device.serial = cli.serial;
    }
    if let Some(n) = cli.channels {
        settings.stream.channels = (0..n).map(ChannelPair::single_ended).collect();
        settings.stream.samples_per_packet = n;
    }
    if let Some(spp) = cli.samples_per_packet {
        settings.stream.samples_per_packet = spp;
    }
    if let Some(interval) = cli.scan_interval {
        settings.stream.scan_interval = interval;
    }
    if let Some(index) = cli.resolution {
        settings.stream.scan.resolution =
            Resolution::try_from(index).map_err(|_| anyhow!("Unknown resolution index {}", index))?;
    }

    settings.stream.validate().context("Invalid stream settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Streaming failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(&cli)?;
    info!(
        channels = settings.stream.num_channels(),
        samples_per_packet = settings.stream.samples_per_packet,
        scan_rate_hz = settings.stream.scan_rate_hz(),
        resolution = %settings.stream.scan.resolution,
        "Stream settings"
    );

    // Opening and calibration readout block on USB transfers
    let device = settings.device.clone();
    let stream = settings.stream.clone();
    let controller = tokio::task::spawn_blocking(move || {
        let transport = NusbTransport::open(&device)?;
        StreamController::connect(transport, stream)
    })
    .await
    .context("Device setup task panicked")?
    .context("Failed to connect to LabJack U3")?;

    if let Some(device) = controller.device_info() {
        info!(
            serial = device.serial_number,
            hardware = device.hardware_version,
            firmware = device.firmware_version,
            "Connected to LabJack U3"
        );
    }

    let worker = StreamWorker::spawn(controller, settings.restart)?;
    let handoff = worker.handoff();
    let mut sink = JsonLinesSink::new(std::io::stdout());

    let deadline = cli.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut ticker = tokio::time::interval(Duration::from_millis(cli.interval_ms.max(1)));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last_generation = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl+C received, shutting down gracefully.");
                break;
            }
        }

        if worker.is_finished() {
            warn!("Stream worker exited");
            break;
        }
        if let Some(snapshot) = handoff.latest() {
            if snapshot.generation != last_generation {
                last_generation = snapshot.generation;
                sink.publish(&snapshot).context("Failed to write snapshot")?;
            }
        }
        if cli.scans.is_some_and(|limit| last_generation >= limit) {
            info!(scans = last_generation, "Scan limit reached");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Duration limit reached");
            break;
        }
    }

    let report = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("Stream worker panicked")?;
    info!(
        packets = report.stats.packets_decoded,
        scans = report.stats.scans_decoded,
        checksum_errors = report.stats.checksum_errors,
        transport_errors = report.stats.transport_errors,
        dropped_scans = report.stats.total_dropped_scans,
        restarts = report.restarts,
        state = %report.final_state,
        "Stream finished"
    );

    match report.error {
        Some(e) => Err(e).context("Stream worker failed"),
        None => Ok(()),
    }
}
