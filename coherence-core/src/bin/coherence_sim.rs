//! Coherence simulator - run a hub in real time and export the session
//!
//! Usage:
//!     coherence-sim --duration-secs 10
//!     coherence-sim --config sync.json --format json --out-dir exports/
//!     COHERENCE_LOG=coherence_core=debug coherence-sim -v

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use coherence_core::{
    AggregatorConfig, AggregatorInput, BreathingPattern, EngineConfig, ExportFormat,
    ExportOutcome, FieldSource, FileExportSink, LevelBands, Oscillator, RecorderConfig,
    SyncConfig, SyncHub, ThreadTimerBackend, TracingReporter,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "coherence-sim")]
#[command(about = "Run coherence engines in real time and export the recorded session")]
#[command(version)]
struct Args {
    /// Path to a sync configuration JSON file (default: built-in demo)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to record
    #[arg(short, long, default_value_t = 10)]
    duration_secs: u64,

    /// Export format: csv or json
    #[arg(short, long, default_value = "csv")]
    format: ExportFormat,

    /// Directory the export is written to
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Verbose output (debug logging)
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "coherence_core=debug,coherence_sim=debug"
    } else {
        "coherence_core=info,coherence_sim=info"
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("COHERENCE_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(args: &Args) -> coherence_core::Result<()> {
    let config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => demo_config(),
    };

    let reporter = Arc::new(TracingReporter);
    let backend = Arc::new(ThreadTimerBackend::with_reporter(reporter.clone())?);

    let mut builder = SyncHub::builder(config.clone())
        .backend(backend.clone())
        .reporter(reporter)
        .sink(Arc::new(FileExportSink::new(&args.out_dir)));
    for (index, engine) in config.engines.iter().enumerate() {
        builder = builder.boxed_source(&engine.name, source_for(&engine.name, index)?);
    }
    let hub = builder.build()?;

    hub.recorder().start()?;
    hub.start_all()?;
    tracing::info!(duration_secs = args.duration_secs, "simulation running");
    std::thread::sleep(Duration::from_secs(args.duration_secs));

    let summary = hub.shutdown()?;
    backend.shutdown();

    match hub.recorder().export(args.format)? {
        ExportOutcome::Exported { file_name, bytes } => {
            println!("Exported {} ({} bytes) to {}", file_name, bytes, args.out_dir.display());
        }
        ExportOutcome::NothingToExport => println!("Nothing recorded"),
    }
    if let Some(summary) = summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

/// Breathing pattern for engines named `breath*`, oscillators otherwise
fn source_for(engine: &str, index: usize) -> coherence_core::Result<Box<dyn FieldSource>> {
    if engine.starts_with("breath") {
        return Ok(Box::new(BreathingPattern::box_breathing(Duration::from_secs(4))?));
    }
    let period = Duration::from_secs(8 + 3 * index as u64);
    let bands = LevelBands::new()
        .band(0.0, "scattered")
        .band(0.4, "settling")
        .band(0.7, "coherent");
    Ok(Box::new(Oscillator::new(0.6, 0.3, period)?.with_bands(bands)))
}

fn demo_config() -> SyncConfig {
    SyncConfig::new()
        .engine(
            EngineConfig::new("coherence")
                .namespace("consciousness")
                .interval_ms(100)
                .high_threshold(0.85),
        )
        .engine(EngineConfig::new("breath").namespace("breathing").interval_ms(100))
        .aggregator(
            AggregatorConfig::new()
                .input(AggregatorInput::new("coherence").weight(0.6))
                .input(AggregatorInput::new("breath").weight(0.4)),
        )
        .recorder(
            RecorderConfig::new()
                .capture("consciousness:update")
                .capture("breathing:update")
                .capture("meta:update"),
        )
}
