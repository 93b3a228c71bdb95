use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use capture_encoder::config::{AppConfig, ConfigStore, EncoderConsumerConfig};
use capture_encoder::control::ControlSurface;
use capture_encoder::video::device::{list_video_devices, CaptureDevice};
use capture_encoder::video::encoder::{EncodedPacket, EncodedSink};
use capture_encoder::video::format::Resolution;
use capture_encoder::video::session::SessionState;
use capture_encoder::video::unit::ConsumerDescriptor;
use capture_encoder::video::v4l2::V4l2Device;
use capture_encoder::video::virtual_device::{VirtualDevice, VirtualDeviceConfig};

/// Session id used by the CLI
const DEVICE_ID: i32 = 0;

/// Encoded packets buffered per output file
const OUTPUT_QUEUE: usize = 64;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// capture-encoder command line arguments
#[derive(Parser, Debug)]
#[command(name = "capture-encoder")]
#[command(version, about = "V4L2 capture with preview and encoder fan-out", long_about = None)]
struct CliArgs {
    /// Video device path (default: from config, then /dev/video0)
    #[arg(short = 'd', long, value_name = "PATH", conflicts_with = "virtual_device")]
    device: Option<String>,

    /// Use the built-in test pattern device
    #[arg(long = "virtual")]
    virtual_device: bool,

    /// List V4L2 capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Requested capture width
    #[arg(long)]
    width: Option<u32>,

    /// Requested capture height
    #[arg(long)]
    height: Option<u32>,

    /// Capture frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Attach an encoder: WIDTHxHEIGHT[@FPS] (repeatable)
    #[arg(short = 'e', long = "encoder", value_name = "WxH[@FPS]")]
    encoders: Vec<EncoderConsumerConfig>,

    /// Directory encoder output is written to
    #[arg(short = 'o', long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the effective configuration back to --config
    #[arg(long, requires = "config")]
    save_config: bool,

    /// Statistics report interval in seconds (0 disables)
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    stats_interval: u64,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting capture-encoder v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices();
    }

    let config = load_config(&args)?;
    let device = open_device(&args, &config)?;

    let control = Arc::new(ControlSurface::with_opener(
        config.pipeline.clone(),
        Box::new(move |_id: i32| -> capture_encoder::Result<Arc<dyn CaptureDevice>> {
            Ok(device.clone())
        }),
    ));
    let status = control.init(DEVICE_ID);
    if status != 0 {
        anyhow::bail!("Failed to initialize capture device (status {})", status);
    }
    let session = control
        .session(DEVICE_ID)
        .context("capture session missing after init")?;

    tokio::fs::create_dir_all(&args.output_dir).await?;
    let mut writers = Vec::new();
    for encoder in &config.encoders {
        let (tx, rx) = mpsc::channel::<EncodedPacket>(OUTPUT_QUEUE);
        let sink: Arc<dyn EncodedSink> = Arc::new(tx);
        let id = control.add_consumer(
            DEVICE_ID,
            ConsumerDescriptor::Encoder {
                config: encoder.clone(),
                sink,
            },
        );
        if id < 0 {
            anyhow::bail!("Failed to add encoder {}x{} (status {})", encoder.width, encoder.height, id);
        }
        let path = args.output_dir.join(format!("encoder-{}.mjpeg", id));
        tracing::info!(
            "Encoder {} ({}x{}@{}) -> {}",
            id,
            encoder.width,
            encoder.height,
            encoder.fps,
            path.display()
        );
        writers.push(tokio::spawn(write_packets(path, rx)));
    }

    let capture = config.capture.clone();
    let status = {
        let control = control.clone();
        tokio::task::spawn_blocking(move || {
            control.start_capture(
                DEVICE_ID,
                None,
                capture.width as i32,
                capture.height as i32,
                capture.fps as i32,
            )
        })
        .await?
    };
    if status != 0 {
        anyhow::bail!("Failed to start capture (status {})", status);
    }
    if let Some(format) = session.format() {
        tracing::info!("Capturing {} at {} fps", format, capture.fps);
    }

    let mut state = session.subscribe_state();
    let stats_every = Duration::from_secs(args.stats_interval.max(1));
    let mut stats_tick = tokio::time::interval(stats_every);
    stats_tick.tick().await;
    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = &mut deadline => {
                tracing::info!("Capture duration reached");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == SessionState::Faulted {
                    tracing::error!(
                        "Capture faulted: {}",
                        session.fault().unwrap_or_else(|| "unknown".to_string())
                    );
                    break;
                }
            }
            _ = stats_tick.tick(), if args.stats_interval > 0 => {
                report_stats(&session);
            }
        }
    }

    report_stats(&session);
    drop(session);
    let status = tokio::task::spawn_blocking(move || {
        let stopped = control.stop_capture(DEVICE_ID);
        control.release(DEVICE_ID);
        stopped
    })
    .await?;
    if status != 0 {
        tracing::warn!("Capture stop returned status {}", status);
    }

    for writer in writers {
        if let Err(e) = writer.await? {
            tracing::error!("Encoder output failed: {}", e);
        }
    }

    tracing::info!("capture-encoder stopped");
    Ok(())
}

fn load_config(args: &CliArgs) -> anyhow::Result<AppConfig> {
    let store = args.config.as_ref().map(ConfigStore::new);
    let mut config = match &store {
        Some(store) => store
            .load()
            .with_context(|| format!("loading {}", store.path().display()))?,
        None => AppConfig::default(),
    };

    if let Some(device) = &args.device {
        config.capture.device = Some(device.clone());
    }
    if let Some(width) = args.width {
        config.capture.width = width;
    }
    if let Some(height) = args.height {
        config.capture.height = height;
    }
    if let Some(fps) = args.fps {
        config.capture.fps = fps;
    }
    if !args.encoders.is_empty() {
        config.encoders = args.encoders.clone();
    }
    config.validate()?;

    if args.save_config {
        if let Some(store) = &store {
            store.save(&config)?;
            tracing::info!("Configuration saved to {}", store.path().display());
        }
    }
    Ok(config)
}

fn open_device(args: &CliArgs, config: &AppConfig) -> anyhow::Result<Arc<dyn CaptureDevice>> {
    if args.virtual_device {
        let device = VirtualDevice::new(VirtualDeviceConfig {
            sizes: vec![
                Resolution::VGA,
                Resolution::new(1280, 720),
                Resolution::HD1080,
            ],
            paced: true,
            ..Default::default()
        });
        return Ok(Arc::new(device));
    }

    let path = config
        .capture
        .device
        .clone()
        .unwrap_or_else(|| "/dev/video0".to_string());
    let device = V4l2Device::open(&path).with_context(|| format!("opening {}", path))?;
    Ok(Arc::new(device))
}

fn list_devices() -> anyhow::Result<()> {
    let devices = list_video_devices()?;
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for device in devices {
        let formats: Vec<String> = device
            .formats
            .iter()
            .map(|f| format!("{} ({} sizes)", f.format, f.resolutions.len()))
            .collect();
        println!(
            "{}: {} [{}] {}",
            device.path.display(),
            device.card,
            device.driver,
            formats.join(", ")
        );
    }
    Ok(())
}

fn report_stats(session: &capture_encoder::video::session::CaptureSession) {
    let stats = session.stats();
    tracing::info!(
        "fps={:.1} dequeued={} returned={} dropped={} timeouts={} errors={}",
        stats.current_fps,
        stats.frames_dequeued,
        stats.frames_returned,
        stats.frames_dropped_backpressure,
        stats.poll_timeouts,
        stats.poll_errors
    );
    for unit in session.units() {
        match serde_json::to_string(&unit) {
            Ok(json) => tracing::debug!("unit {}", json),
            Err(e) => tracing::warn!("Failed to serialize unit stats: {}", e),
        }
    }
}

async fn write_packets(path: PathBuf, mut rx: mpsc::Receiver<EncodedPacket>) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(&path).await?;
    let mut written = 0u64;
    while let Some(packet) = rx.recv().await {
        file.write_all(&packet.data).await?;
        written += 1;
    }
    file.flush().await?;
    tracing::info!("{}: {} packets written", path.display(), written);
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "capture_encoder=error",
        LogLevel::Warn => "capture_encoder=warn",
        LogLevel::Info => "capture_encoder=info",
        LogLevel::Verbose => "capture_encoder=debug,v4l=info",
        LogLevel::Debug => "capture_encoder=debug,v4l=debug",
        LogLevel::Trace => "capture_encoder=trace,v4l=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
