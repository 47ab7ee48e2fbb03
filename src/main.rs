//! CLI entry point for daq_relay
//!
//! Provides a command-line interface for:
//! - Running the relay against the simulated device until Ctrl+C
//! - Checking a configuration file and its calibration table
//!
//! # Usage
//!
//! Run for ten seconds, printing the latest value per channel:
//! ```bash
//! daq_relay run --config config/daq_relay.toml --duration 10 --echo
//! ```
//!
//! Check a configuration:
//! ```bash
//! daq_relay check-config --config config/daq_relay.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_relay::config::{AppConfig, DEFAULT_CONFIG_PATH};
use daq_relay::hardware::{SimulatedDevice, SimulatedDeviceConfig};
use daq_relay::pipeline::{connect_sink, Pipeline};
use daq_relay::telemetry::{Codec, JsonCodec, TelemetrySink};
use daq_relay::tracing_setup;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq_relay")]
#[command(about = "Continuous DAQ acquisition with calibrated telemetry relay", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from the simulated device and relay to the configured sink
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        duration: Option<u64>,

        /// Print the latest value per channel of every published batch
        #[arg(long)]
        echo: bool,

        /// Override acquisition.sample_rate
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Override acquisition.samples_per_channel
        #[arg(long)]
        samples_per_channel: Option<usize>,
    },

    /// Load and validate the configuration, then print the calibration table
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            duration,
            echo,
            sample_rate,
            samples_per_channel,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(rate) = sample_rate {
                config.acquisition.sample_rate = rate;
            }
            if let Some(samples) = samples_per_channel {
                config.acquisition.samples_per_channel = samples;
            }
            config.validate()?;
            run(config, duration.map(Duration::from_secs), echo).await
        }
        Commands::CheckConfig => check_config(&cli.config),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

async fn run(config: AppConfig, duration: Option<Duration>, echo: bool) -> Result<()> {
    tracing_setup::init_from_config(&config)?;
    info!(
        application = %config.application.name,
        backend = %config.telemetry.backend,
        "Starting relay"
    );

    let sink = connect_sink(&config.telemetry).await?;
    if echo {
        spawn_echo(sink.as_ref(), &config.telemetry.data_channel).await?;
    }

    let device = SimulatedDevice::with_config(SimulatedDeviceConfig {
        name: config.acquisition.device.clone(),
        ..Default::default()
    });
    let pipeline = Pipeline::new(config, device, sink);

    let mut status = pipeline.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("{current}");
        }
    });

    pipeline.start_from_config()?;

    match duration {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => info!(seconds = limit.as_secs(), "Run duration reached"),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            println!("Relay running - Press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    let engine_stats = pipeline.engine().stats();
    let publisher_stats = pipeline.shutdown().await;
    println!();
    println!("Reads completed:   {}", engine_stats.reads_completed);
    println!("Batches published: {}", publisher_stats.batches_published);
    println!("Batches dropped:   {}", publisher_stats.batches_dropped);
    println!(
        "Sink failures:     {}",
        publisher_stats.publish_failures + publisher_stats.upsert_failures
    );
    Ok(())
}

async fn spawn_echo(sink: &dyn TelemetrySink, channel: &str) -> Result<()> {
    let mut messages = sink.subscribe(channel).await?;
    tokio::spawn(async move {
        while let Some(payload) = messages.recv().await {
            match JsonCodec.decode_batch(&payload) {
                Ok(batch) => {
                    for m in batch.latest_per_channel() {
                        println!(
                            "[{}] {}: {:.2}",
                            m.timestamp.format("%H:%M:%S"),
                            m.channel_id,
                            m.value
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Undecodable message on data channel"),
            }
        }
    });
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    config.validate()?;
    let table = config.calibration()?;

    println!("Configuration OK: {}", path.display());
    println!(
        "  Device {} ({} channels, {}..{} V) at {} Hz, {} samples/read",
        config.acquisition.device,
        config.acquisition.channel_count,
        config.acquisition.min_voltage,
        config.acquisition.max_voltage,
        config.acquisition.sample_rate,
        config.acquisition.samples_per_channel
    );
    println!(
        "  Telemetry: {} -> channel '{}', keys '{}*'",
        config.telemetry.backend, config.telemetry.data_channel, config.telemetry.key_prefix
    );
    if table.is_empty() {
        println!("  No calibrated channels: nothing will be published");
    }
    for entry in table.iter() {
        println!(
            "  Channel{:<3} slope {:>10.4}  intercept {:>10.4}",
            entry.channel_index, entry.slope, entry.intercept
        );
    }
    Ok(())
}
