//! Vehicle Bridge CLI Application
//!
//! Replays a recorded OpenXC trace through the vehicle-bridge library,
//! printing every value change as it is delivered and a final snapshot
//! of all tracked channels.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vehicle_bridge::{
    Bridge, DispatchMode, PendingNotification, TelemetryService, TraceService,
};

mod config;

use config::{AppConfig, OutputFormat};

/// Vehicle Bridge - Replay vehicle telemetry and report value changes
#[derive(Parser, Debug)]
#[command(name = "vehicle-bridge-cli")]
#[command(about = "Replay OpenXC traces through the vehicle telemetry bridge", long_about = None)]
#[command(version)]
struct Args {
    /// Path to JSON-lines trace file to replay
    #[arg(short, long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Measurement to subscribe to (can be repeated, default: all)
    #[arg(short, long, value_name = "NAME")]
    measurement: Vec<String>,

    /// Pace the replay by the recorded timestamps
    #[arg(long)]
    realtime: bool,

    /// Print notifications and the summary as JSON
    #[arg(long)]
    json: bool,

    /// Seconds to wait for the replay to finish
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

/// Final report printed in JSON mode
#[derive(Debug, Serialize)]
struct Summary {
    trace: PathBuf,
    records: usize,
    notifications: u64,
    decode_errors: u64,
    unrouted: u64,
    subscribed: Vec<String>,
    snapshot: BTreeMap<String, serde_json::Value>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("Vehicle Bridge CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using bridge library v{}", vehicle_bridge::VERSION);

    let config = build_config(&args)?;
    config.validate()?;

    run(&config)
}

/// Merge the config file (if any) with command line overrides
fn build_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(trace) = &args.trace {
        config.trace.file = Some(trace.clone());
    }
    if !args.measurement.is_empty() {
        config.set_measurements(&args.measurement)?;
    }
    if args.realtime {
        config.trace.realtime = true;
    }
    if args.json {
        config.output.format = OutputFormat::Json;
    }
    if let Some(timeout) = args.timeout {
        config.trace.timeout_secs = timeout;
    }
    if args.quiet {
        config.output.show_changes = false;
    }

    Ok(config)
}

fn run(config: &AppConfig) -> Result<()> {
    let trace_path = config
        .trace
        .file
        .clone()
        .context("No trace file configured")?;

    let mut service = TraceService::from_file(&trace_path)
        .with_context(|| format!("Failed to load trace: {:?}", trace_path))?
        .with_realtime(config.trace.realtime)
        .with_disconnect_at_end(config.trace.disconnect_at_end);
    if let Some(supported) = &config.trace.supported {
        service = service.with_supported(supported.clone());
    }
    let service = Arc::new(service);
    log::info!("Loaded {} trace records from {:?}", service.record_count(), trace_path);

    let bridge = Bridge::new(
        Arc::clone(&service) as Arc<dyn TelemetryService>,
        config.bridge.clone(),
    )
    .context("Failed to start bridge")?;

    if config.output.show_changes {
        let format = config.output.format;
        bridge.register_on_change(move |notification: &PendingNotification| {
            print_change(format, notification)
        });
    }

    bridge.create();
    let state = bridge.on_foreground();
    log::debug!("Connection state after foreground: {}", state);

    let timeout = Duration::from_secs(config.trace.timeout_secs);
    if !service.wait_until_finished(timeout) {
        log::warn!("Replay did not finish within {}s", config.trace.timeout_secs);
    }
    drain(&bridge, timeout);

    let stats = bridge.stats();
    let replay = service.stats();
    let snapshot = bridge.snapshot();

    match config.output.format {
        OutputFormat::Json => {
            let summary = Summary {
                trace: trace_path,
                records: service.record_count(),
                notifications: stats.dispatch.delivered,
                decode_errors: stats.detector.decode_errors,
                unrouted: replay.unrouted,
                subscribed: stats.subscribed.iter().map(|m| m.name().to_string()).collect(),
                snapshot: snapshot
                    .iter()
                    .map(|(channel, value)| (channel.to_string(), value.to_json()))
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("═══════════════════════════════════════════════");
            println!("  Replay Summary: {:?}", trace_path);
            println!("═══════════════════════════════════════════════");
            println!("  Records:       {}", service.record_count());
            println!("  Notifications: {}", stats.dispatch.delivered);
            println!("  Unchanged:     {}", stats.detector.unchanged);
            println!("  Decode errors: {}", stats.detector.decode_errors);
            println!("  Unrouted:      {}", replay.unrouted);
            println!("  Subscribed:    {}", stats.subscribed.len());
            println!("\nCurrent values:");
            if snapshot.is_empty() {
                println!("  (none)");
            }
            for (channel, value) in &snapshot {
                println!("  {:<34} {}", channel.to_string(), value);
            }
        }
    }

    bridge.on_destroy();
    Ok(())
}

/// Wait until every accepted change has been delivered to the listener
fn drain(bridge: &Bridge, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if bridge.config().dispatch_mode == DispatchMode::Manual {
            bridge.pump();
        }
        let dispatch = bridge.stats().dispatch;
        if dispatch.delivered + dispatch.discarded >= dispatch.submitted {
            return;
        }
        if Instant::now() >= deadline {
            log::warn!(
                "{} notifications still pending",
                dispatch.submitted - dispatch.delivered - dispatch.discarded
            );
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn print_change(format: OutputFormat, notification: &PendingNotification) {
    match format {
        OutputFormat::Json => {
            let line = serde_json::json!({
                "sequence": notification.sequence,
                "channel": notification.channel.to_string(),
                "old": notification.old.map(|v| v.to_json()),
                "new": notification.new.to_json(),
                "accepted_at": notification.accepted_at.to_rfc3339(),
            });
            println!("{}", line);
        }
        OutputFormat::Text => {
            let old = notification
                .old
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "[#{}] {}: {} -> {}",
                notification.sequence, notification.channel, old, notification.new
            );
        }
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_overrides_config() {
        let args = Args::parse_from([
            "vehicle-bridge-cli",
            "--trace",
            "drive.json",
            "-m",
            "vehicle_speed",
            "-m",
            "door_status",
            "--json",
            "--timeout",
            "3",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.trace.file, Some(PathBuf::from("drive.json")));
        assert_eq!(config.bridge.measurements.len(), 2);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.trace.timeout_secs, 3);
        assert!(config.output.show_changes);
    }

    #[test]
    fn test_unknown_measurement_is_rejected() {
        let args = Args::parse_from(["vehicle-bridge-cli", "-m", "warp_drive"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_replay_sample_trace() {
        let mut config = AppConfig::default();
        config.trace.file = Some(PathBuf::from(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/traces/short_drive.json"
        )));
        config.trace.timeout_secs = 10;
        config.output.show_changes = false;
        config.validate().unwrap();
        run(&config).unwrap();
    }
}
