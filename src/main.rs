//! CLI entry point.
//!
//! Provides command-line access to the sample handler:
//! - validate a sample sheet without touching hardware
//! - run a holder batch against the simulated rig (dry run)
//! - run a standalone needle wash cycle
//!
//! The real beamline deployment binds the signals to the device transport
//! instead of the simulated rig; everything above the signal layer is the
//! same code path exercised here.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sol_daq::batch::BatchOrchestrator;
use sol_daq::config::Settings;
use sol_daq::fluidics::{FluidicControlUnit, SolutionSequencer, WashOption};
use sol_daq::hardware::mock::{AutoConfirm, MockDetector, MockRealigner, MockStage, SimulatedRig};
use sol_daq::sample::{autofill_rows, validate_rows, Needle, SheetRow, ValidationOptions};
use sol_daq::watchdog::{BeamWatchdog, BeamlineSignals};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sol-daq")]
#[command(about = "Solution-scattering sample handling and acquisition sequencing", long_about = None)]
struct Cli {
    /// Configuration name under config/ (default: "default")
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a sample sheet (JSON rows) without any hardware motion
    Validate {
        /// Path to the sample sheet
        sheet: PathBuf,

        /// Check needle alternation for concurrent operation
        #[arg(long)]
        concurrent: bool,
    },

    /// Run a holder batch against the simulated rig
    Run {
        /// Path to the sample sheet
        sheet: PathBuf,
    },

    /// Run a standalone wash cycle on one needle
    Wash {
        /// Which needle to wash: "upstream" or "downstream"
        needle: String,
    },
}

fn load_rows(path: &PathBuf) -> Result<Vec<SheetRow>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read sample sheet {}", path.display()))?;
    let mut rows: Vec<SheetRow> =
        serde_json::from_str(&text).context("sample sheet is not a JSON array of rows")?;
    autofill_rows(&mut rows);
    Ok(rows)
}

fn build_stack(
    settings: &Settings,
) -> (
    Arc<SolutionSequencer>,
    Arc<BeamWatchdog>,
    SimulatedRig,
    Arc<MockDetector>,
) {
    let ctrl = Arc::new(FluidicControlUnit::new("sol:ctrl:"));
    let rig = SimulatedRig::spawn(Arc::clone(&ctrl));

    let holder_x = Arc::new(MockStage::new());
    let flowcell_y = Arc::new(MockStage::new());
    let sequencer = Arc::new(
        SolutionSequencer::new(ctrl, holder_x, flowcell_y, settings.fluidics.clone())
            .expect("sequencer construction against soft channels cannot fail"),
    );

    let beam = Arc::new(BeamlineSignals::new());
    let realigner = Arc::new(MockRealigner::new(beam.clone(), 1.0e-6, 160_000.0));
    let watchdog = Arc::new(BeamWatchdog::new(
        beam,
        settings.watchdog.clone(),
        realigner,
        Arc::new(AutoConfirm),
    ));

    let detector = Arc::new(MockDetector::new());
    (sequencer, watchdog, rig, detector)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;
    sol_daq::logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Validate { sheet, concurrent } => {
            let rows = load_rows(&sheet)?;
            let opts = ValidationOptions {
                min_volume: settings.batch.min_volume,
                default_repeats: settings.batch.repeats,
                default_volume: Some(settings.batch.volume),
                default_exposure: Some(settings.batch.exposure),
                concurrent_op: concurrent,
                ..Default::default()
            };
            let samples = validate_rows(&rows, &opts)?;
            println!("sheet OK: {} samples", samples.len());
            for s in &samples {
                println!(
                    "  {:>2}  {}  {:.0} ul  {:.1} s x{}  via {}",
                    s.position,
                    s.name,
                    s.volume,
                    s.exposure,
                    s.repeats,
                    s.needle()
                );
            }
            Ok(())
        }

        Commands::Run { sheet } => {
            let rows = load_rows(&sheet)?;
            let opts = ValidationOptions {
                min_volume: settings.batch.min_volume,
                default_repeats: settings.batch.repeats,
                default_volume: Some(settings.batch.volume),
                default_exposure: Some(settings.batch.exposure),
                concurrent_op: settings.batch.concurrent_op,
                ..Default::default()
            };
            let samples = validate_rows(&rows, &opts)?;

            let (sequencer, watchdog, _rig, detector) = build_stack(&settings);
            let orchestrator =
                BatchOrchestrator::new(sequencer, watchdog, settings.batch.clone());

            println!("running {} samples against the simulated rig", samples.len());
            let outcome = orchestrator.run_holder(detector.as_ref(), &samples).await?;

            for run in &outcome.runs {
                println!("  {}  {}  ({} triggers)", run.run_id, run.sample, run.repeats);
            }
            for err in &outcome.errors {
                eprintln!(
                    "  FAILED {}: {}",
                    err.sample.as_deref().unwrap_or("<batch>"),
                    err.error
                );
            }
            println!(
                "batch finished: {}/{} samples, {} detector triggers",
                outcome.runs.len(),
                samples.len(),
                detector.trigger_count()
            );
            if !outcome.is_complete() {
                anyhow::bail!("batch aborted early");
            }
            Ok(())
        }

        Commands::Wash { needle } => {
            let needle = match needle.as_str() {
                "upstream" => Needle::Upstream,
                "downstream" => Needle::Downstream,
                other => anyhow::bail!("unrecognized needle '{other}'"),
            };
            let (sequencer, _watchdog, _rig, _detector) = build_stack(&settings);
            sequencer.wash_needle(needle, WashOption::Full).await?;
            println!("{needle} washed and dried");
            Ok(())
        }
    }
}
