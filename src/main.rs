//! CLI entry point for edl-daq
//!
//! Runs the host procedures against the simulated amplifier:
//!
//! ```bash
//! edl-daq detect
//! edl-daq configure
//! edl-daq compensate
//! edl-daq record --packets 5000 --output run.f32
//! edl-daq stream --batches 20
//! edl-daq decode data/run.f32 --show 5
//! ```
//!
//! Settings come from `config/edl_daq.toml` (or `--config`) and `EDL_DAQ_*`
//! environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edl_daq::config::AppConfig;
use edl_daq::driver::{frame_packets, read_packet_file, WorkerConfig};
use edl_daq::logging::{self, LoggingConfig};
use edl_daq::procedures::{Rig, TriangularWave, WorkingModality};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "edl-daq")]
#[command(about = "E4 amplifier control and acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices
    Detect,

    /// Connect and set 5 kHz, 200 pA, SR/2 bandwidth
    Configure,

    /// Configure, then run the digital offset compensation
    Compensate,

    /// Full bench run: configure, compensate, triangular wave, record
    Record {
        /// Packets to record
        #[arg(long)]
        packets: Option<usize>,

        /// Output file (relative paths go under recording.output_dir)
        #[arg(long, default_value = "recording.f32")]
        output: PathBuf,
    },

    /// Stream batches from the background worker and print channel means
    Stream {
        /// Batches to collect
        #[arg(long, default_value = "10")]
        batches: u64,

        /// Packets per batch
        #[arg(long, default_value = "1000")]
        batch_packets: usize,

        /// Drop batches instead of waiting when the consumer is behind
        #[arg(long)]
        drop_on_full: bool,
    },

    /// Print the contents of a recording
    Decode {
        file: PathBuf,

        /// Packets to print
        #[arg(long, default_value = "10")]
        show: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("loading configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    let verbosity = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let logging_config = LoggingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .at_least(verbosity);
    logging::init(logging_config).map_err(anyhow::Error::msg)?;

    info!(name = %config.application.name, "Starting");

    match cli.command {
        Commands::Detect => detect(&config),
        Commands::Configure => configure(&config, false),
        Commands::Compensate => configure(&config, true),
        Commands::Record { packets, output } => {
            record(&config, packets.unwrap_or(config.recording.packets), output)
        }
        Commands::Stream {
            batches,
            batch_packets,
            drop_on_full,
        } => {
            let worker = WorkerConfig {
                batch_packets,
                drop_on_full,
                max_batches: Some(batches),
                ..Default::default()
            };
            stream(&config, worker).await
        }
        Commands::Decode { file, show } => decode(&config, file, show),
    }
}

fn detect(config: &AppConfig) -> Result<()> {
    let (mut rig, _sim) = Rig::simulated(config);
    let devices = rig.session_mut().detect_devices()?;
    for device in devices {
        println!("{}", device);
    }
    Ok(())
}

fn configure(config: &AppConfig, compensate: bool) -> Result<()> {
    let (mut rig, _sim) = Rig::simulated(config);

    println!("{}", rig.bring_up()?);
    println!("{}", rig.configure_working_modality(WorkingModality::default())?);
    if compensate {
        println!("{}", rig.compensate_digital_offset()?);
    }
    println!("{}", rig.shutdown()?);
    Ok(())
}

fn record(config: &AppConfig, packets: usize, output: PathBuf) -> Result<()> {
    let (mut rig, _sim) = Rig::simulated(config);

    println!("{}", rig.bring_up()?);
    println!("{}", rig.configure_working_modality(WorkingModality::default())?);
    println!("{}", rig.compensate_digital_offset()?);
    println!("{}", rig.set_triangular_potential(TriangularWave::default())?);

    let recording = rig.record_to_file(&output, packets)?;
    println!("{}", recording.procedure);
    println!(
        "Wrote {} packets to {}",
        recording.read.actual,
        recording.path.display()
    );

    println!("{}", rig.shutdown()?);
    Ok(())
}

async fn stream(config: &AppConfig, worker: WorkerConfig) -> Result<()> {
    let (mut rig, _sim) = Rig::simulated(config);

    println!("{}", rig.bring_up()?);
    println!("{}", rig.configure_working_modality(WorkingModality::default())?);
    println!("{}", rig.set_triangular_potential(TriangularWave::default())?);

    let (mut rig, summary) = rig.stream(worker).await?;
    println!(
        "{} batches, {} packets ({} dropped, {} overflow, {} lost-data events)",
        summary.batches,
        summary.packets,
        summary.dropped_batches,
        summary.overflow_events,
        summary.lost_data_events
    );
    for (channel, mean) in summary.channel_means.iter().enumerate() {
        println!("  channel {}: mean {:.3}", channel, mean);
    }

    if let Some(e) = summary.error {
        return Err(e).context("stream ended early");
    }
    println!("{}", rig.shutdown()?);
    Ok(())
}

fn decode(config: &AppConfig, file: PathBuf, show: usize) -> Result<()> {
    let channels = config.session.acquisition.channels;
    let samples = read_packet_file(&file, channels)
        .with_context(|| format!("reading {}", file.display()))?;
    let packets = frame_packets(&samples, channels)?;

    println!(
        "{}: {} packets of {} channels",
        file.display(),
        packets.len(),
        channels
    );
    for (i, packet) in packets.iter().take(show).enumerate() {
        let currents: Vec<String> = packet
            .currents()
            .iter()
            .map(|v| format!("{:10.3}", v))
            .collect();
        println!("{:6}  {:8.2} mV  {}", i, packet.voltage(), currents.join(" "));
    }
    Ok(())
}
