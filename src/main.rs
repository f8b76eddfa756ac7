//! CLI Entry Point for vna-stream
//!
//! Provides a headless front end to the streaming engine:
//! - `probe`: identify the instrument and exit
//! - `collect`: run one collection, printing each sweep as it is drained and optionally
//!   exporting records as JSON lines
//!
//! # Usage
//!
//! ```bash
//! vna-stream --config config/vna_stream.toml probe
//! vna-stream collect --sweeps 20 --refresh-ms 100 --output sweeps.jsonl
//! vna-stream collect --mock --sweeps 5
//! ```
//!
//! Ctrl-C during `collect` cancels the collection; the engine is torn down before exit.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vna_stream::config::DEFAULT_CONFIG_PATH;
use vna_stream::tracing_config::{self, OutputFormat, TracingConfig};
use vna_stream::{
    AcquisitionSession, CalibrationMetadata, LifecyclePhase, SessionHandle, SweepRecord,
    VnaConfig,
};

#[derive(Parser)]
#[command(name = "vna-stream")]
#[command(about = "Continuous-sweep streaming from SCPI vector network analyzers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated instrument
    #[arg(long, global = true)]
    mock: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the instrument and exit
    Probe,

    /// Collect sweeps until the limit is reached or Ctrl-C
    Collect {
        /// Stop after this many sweeps (overrides acquisition.total_sweeps)
        #[arg(long)]
        sweeps: Option<u64>,

        /// Consumer refresh period in milliseconds
        #[arg(long, default_value = "100")]
        refresh_ms: u64,

        /// Append every drained sweep to this file as JSON lines
        #[arg(long)]
        output: Option<PathBuf>,

        /// Calibration file (overrides acquisition.calibration_path)
        #[arg(long)]
        calibration: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = VnaConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.mock {
        config.instrument.mock = true;
    }

    let level = tracing_config::parse_log_level(&config.application.log_level)
        .map_err(anyhow::Error::msg)?;
    let format = match cli.log_format {
        LogFormat::Pretty => OutputFormat::Pretty,
        LogFormat::Compact => OutputFormat::Compact,
        LogFormat::Json => OutputFormat::Json,
    };
    tracing_config::init(TracingConfig::new(level).with_format(format))
        .map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Probe => probe(config).await,
        Commands::Collect {
            sweeps,
            refresh_ms,
            output,
            calibration,
        } => collect(config, sweeps, refresh_ms, output, calibration).await,
    }
}

/// Longest time the initial probe may take, cold start included.
fn ready_timeout(config: &VnaConfig) -> Duration {
    let engine = &config.engine;
    let attempts = u32::max(engine.start_attempts, 1);
    (engine.start_timeout() + config.acquisition.command_timeout()) * attempts
        + config.acquisition.probe_timeout()
}

async fn probe(config: VnaConfig) -> Result<()> {
    let timeout = ready_timeout(&config);
    let session = AcquisitionSession::from_config(config)
        .spawn()
        .context("Failed to start acquisition session")?;

    let result = session.wait_for_phase(LifecyclePhase::Ready, timeout).await;
    let identity = match result {
        Ok(()) => session.probe().await,
        Err(e) => Err(e),
    };
    session.shutdown().await?;

    let identity = identity.context("Instrument did not become ready")?;
    println!("{identity}");
    Ok(())
}

async fn collect(
    mut config: VnaConfig,
    sweeps: Option<u64>,
    refresh_ms: u64,
    output: Option<PathBuf>,
    calibration: Option<PathBuf>,
) -> Result<()> {
    if refresh_ms == 0 {
        bail!("--refresh-ms must be positive");
    }
    if calibration.is_some() {
        config.acquisition.calibration_path = calibration;
    }
    let total_sweeps = sweeps.or(config.acquisition.total_sweeps);
    let timeout = ready_timeout(&config);

    let mut builder = AcquisitionSession::from_config(config.clone());
    if config.instrument.mock && config.acquisition.calibration_path.is_none() {
        builder = builder.with_calibration(CalibrationMetadata::new(1_000_000, 3_000_000_000, 201));
    }
    let session = builder
        .spawn()
        .context("Failed to start acquisition session")?;

    let mut export = match &output {
        Some(path) => Some(open_export(path)?),
        None => None,
    };

    let outcome = run_collection(&session, total_sweeps, refresh_ms, timeout, &mut export).await;
    session.shutdown().await?;
    if let Some(writer) = export.as_mut() {
        writer.flush().context("Failed to flush sweep export")?;
    }
    outcome
}

async fn run_collection(
    session: &SessionHandle,
    total_sweeps: Option<u64>,
    refresh_ms: u64,
    ready_timeout: Duration,
    export: &mut Option<BufWriter<File>>,
) -> Result<()> {
    session
        .wait_for_phase(LifecyclePhase::Ready, ready_timeout)
        .await
        .context("Instrument did not become ready")?;

    let ticket = session
        .begin_collection(total_sweeps)
        .await
        .context("Collection was not accepted")?;
    let finished = ticket.finished();
    tokio::pin!(finished);

    let dispatcher = session.dispatcher();
    let mut refresh = tokio::time::interval(Duration::from_millis(refresh_ms));
    let mut cancelled = false;

    let summary = loop {
        tokio::select! {
            result = &mut finished => break result,
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                println!("Cancelling collection...");
                session.cancel();
                cancelled = true;
            }
            _ = refresh.tick() => {
                if let Some(record) = dispatcher.drain() {
                    present(&record, export)?;
                }
            }
        }
    };
    if let Some(record) = dispatcher.drain() {
        present(&record, export)?;
    }

    let summary = summary.context("Collection failed")?;
    let stats = dispatcher.stats();
    println!(
        "Collection {:?}: {} sweeps delivered in {:.1} s ({} drained, {} superseded before display)",
        summary.ending,
        summary.sweeps_delivered,
        summary.elapsed.as_secs_f64(),
        stats.drained,
        stats.coalesced
    );
    Ok(())
}

fn open_export(path: &Path) -> Result<BufWriter<File>> {
    let file = File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn present(record: &SweepRecord, export: &mut Option<BufWriter<File>>) -> Result<()> {
    match record.minimum_db() {
        Some((frequency_hz, db)) => println!(
            "{} #{:<5} {} points, minimum {:.2} dB at {:.3} MHz",
            record.port,
            record.sequence_no,
            record.len(),
            db,
            frequency_hz as f64 / 1e6
        ),
        None => println!("{} #{} (empty)", record.port, record.sequence_no),
    }

    if let Some(writer) = export.as_mut() {
        serde_json::to_writer(&mut *writer, record).context("Failed to serialize sweep")?;
        writer.write_all(b"\n").context("Failed to write sweep")?;
    }
    Ok(())
}
