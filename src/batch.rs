//! Batch orchestration.
//!
//! [`BatchOrchestrator`] walks an ordered, validated sample list and runs
//! one measurement cycle per sample, gated on the beam watchdog and the
//! operator pause channel. It never touches hardware directly: fluidics go
//! through the sequencer, acquisition through the detector capability
//! traits, beam recovery through the watchdog.
//!
//! Retry policy: a beam-quality fault after a completed acquisition means
//! the data is suspect, so the *same* sample is re-run after recovery with
//! the sample index left where it is. There is no partial credit: a sample
//! either yields exactly one run record or (after bounded retries) an error
//! that aborts the batch. Run records collected before an abort are always
//! returned to the caller.
//!
//! A second entry point drives the chromatograph handshake: per injection,
//! switch the column valve, arm, wait for the injection edge, keep the
//! detector exposing until the run finishes, collect the export.

use crate::chromatograph::{Chromatogram, Chromatograph};
use crate::config::BatchSettings;
use crate::error::{SolError, SolResult};
use crate::fluidics::sequencer::{FlowCell, MeasureRequest, SolutionSequencer, WashOption};
use crate::hardware::capabilities::{ExposureControl, OperatorPrompt, Triggerable};
use crate::sample::{Needle, Sample, ValidationOptions};
use crate::signal::SoftSignal;
use crate::watchdog::BeamWatchdog;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One completed sample measurement.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Identifier handed to downstream packaging.
    pub run_id: Uuid,
    /// Sample name.
    pub sample: String,
    /// Tube position measured.
    pub position: u32,
    /// Needle used.
    pub needle: Needle,
    /// Volume loaded, microliters.
    pub volume: f64,
    /// Per-frame exposure, seconds.
    pub exposure: f64,
    /// Detector triggers taken.
    pub repeats: u32,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// An error annotated with the sample it occurred on.
#[derive(Debug)]
pub struct BatchError {
    /// Sample name, when the failure was sample-scoped.
    pub sample: Option<String>,
    /// The underlying failure.
    pub error: SolError,
}

/// What a batch produced, preserved even on abort.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// One record per successfully measured sample, in order.
    pub runs: Vec<RunRecord>,
    /// Errors encountered; non-empty means the batch aborted early.
    pub errors: Vec<BatchError>,
}

impl BatchOutcome {
    /// Run identifiers collected so far.
    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs.iter().map(|r| r.run_id).collect()
    }

    /// Whether every sample produced a run.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One chromatograph injection to acquire against.
#[derive(Debug, Clone)]
pub struct Injection {
    /// Sample name (becomes the run directory name).
    pub name: String,
    /// Column-selection valve position for this sample.
    pub valve_position: u32,
    /// Per-frame exposure, seconds.
    pub exposure: f64,
}

/// One completed chromatograph run.
#[derive(Debug)]
pub struct ChromatographRun {
    /// Identifier handed to downstream packaging.
    pub run_id: Uuid,
    /// Sample name.
    pub sample: String,
    /// Detector triggers taken during elution.
    pub triggers: u32,
    /// The collected chromatogram.
    pub chromatogram: Chromatogram,
}

/// Orchestrates sample batches over the sequencer, watchdog and detector.
pub struct BatchOrchestrator {
    sequencer: Arc<SolutionSequencer>,
    watchdog: Arc<BeamWatchdog>,
    cfg: BatchSettings,
}

impl BatchOrchestrator {
    /// Build an orchestrator.
    pub fn new(
        sequencer: Arc<SolutionSequencer>,
        watchdog: Arc<BeamWatchdog>,
        cfg: BatchSettings,
    ) -> Self {
        Self {
            sequencer,
            watchdog,
            cfg,
        }
    }

    fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            min_volume: self.cfg.min_volume,
            default_repeats: self.cfg.repeats,
            default_volume: Some(self.cfg.volume),
            default_exposure: Some(self.cfg.exposure),
            concurrent_op: self.cfg.concurrent_op,
            ..Default::default()
        }
    }

    fn request_for(&self, sample: &Sample) -> MeasureRequest {
        MeasureRequest {
            sample_name: sample.name.clone(),
            tube: sample.position,
            needle: sample.needle,
            volume: sample.volume,
            exposure: sample.exposure,
            repeats: sample.repeats,
            return_sample: self.cfg.return_sample,
            wash_after: true,
            oscillate: false,
            delay: self.cfg.pre_exposure_delay,
        }
    }

    /// Cooperative pause gate, checked at sample boundaries only.
    ///
    /// On a pause request the holder parks, the request is acknowledged,
    /// and the batch blocks until the operator releases it. Mechanical
    /// state re-homes through the next tube selection.
    async fn pause_gate(&self) -> SolResult<()> {
        if !self.watchdog.pause_requested() {
            return Ok(());
        }
        self.sequencer.park().await?;
        self.watchdog.acknowledge_pause()?;
        self.watchdog.wait_resume().await
    }

    /// Block until the watchdog reports a usable beam.
    async fn beam_gate(&self) -> SolResult<()> {
        while !self.watchdog.verify_beam_on().await? {
            info!("beam is down, waiting for recovery");
            self.watchdog.wait_for_beam().await?;
        }
        Ok(())
    }

    /// Measure every sample of a holder, in order.
    ///
    /// Pre-flight validation (duplicates, minimum volume, needle
    /// alternation under concurrent operation) runs before any hardware
    /// motion; a bad list never moves the holder. Afterwards each sample
    /// goes through: pause gate → beam gate → measurement cycle → beam
    /// re-check → post-acquisition quality check, with bounded same-sample
    /// retries on transient faults. At batch end any needle still flagged
    /// dirty is force-washed.
    pub async fn run_holder<D>(&self, detector: &D, samples: &[Sample]) -> SolResult<BatchOutcome>
    where
        D: Triggerable + ExposureControl + ?Sized,
    {
        crate::sample::verify_samples(samples, &self.validation_options())?;

        let mut outcome = BatchOutcome::default();

        'samples: for sample in samples {
            let needle = sample.needle();
            let mut attempts = 0u32;

            loop {
                if let Err(e) = self.pause_gate().await {
                    outcome.errors.push(BatchError {
                        sample: Some(sample.name.clone()),
                        error: e,
                    });
                    break 'samples;
                }
                if let Err(e) = self.beam_gate().await {
                    outcome.errors.push(BatchError {
                        sample: Some(sample.name.clone()),
                        error: e,
                    });
                    break 'samples;
                }

                let req = self.request_for(sample);
                let record = match self.sequencer.measure(detector, &req).await {
                    Ok(record) => record,
                    Err(e) if e.is_transient() && attempts < self.cfg.max_beam_retries => {
                        attempts += 1;
                        warn!(
                            sample = %sample.name,
                            attempt = attempts,
                            error = %e,
                            "transient failure, repeating sample"
                        );
                        continue;
                    }
                    Err(e) => {
                        error!(sample = %sample.name, error = %e, "sample cycle failed, aborting batch");
                        outcome.errors.push(BatchError {
                            sample: Some(sample.name.clone()),
                            error: e,
                        });
                        break 'samples;
                    }
                };

                // The beam may have dropped out during the measurement;
                // wash first so the needle is not left wet while waiting.
                loop {
                    match self.watchdog.verify_beam_on().await {
                        Ok(true) => break,
                        Ok(false) => {
                            let recovery: SolResult<()> = async {
                                if self.sequencer.is_dirty(needle) {
                                    self.sequencer
                                        .wash_needle(needle, WashOption::Full)
                                        .await?;
                                }
                                self.watchdog.wait_for_beam().await
                            }
                            .await;
                            if let Err(e) = recovery {
                                outcome.errors.push(BatchError {
                                    sample: Some(sample.name.clone()),
                                    error: e,
                                });
                                break 'samples;
                            }
                        }
                        Err(e) => {
                            outcome.errors.push(BatchError {
                                sample: Some(sample.name.clone()),
                                error: e,
                            });
                            break 'samples;
                        }
                    }
                }

                match self.watchdog.collection_ok(&sample.name).await {
                    Ok(()) => {
                        let run = RunRecord {
                            run_id: Uuid::new_v4(),
                            sample: sample.name.clone(),
                            position: record.tube,
                            needle: record.needle,
                            volume: record.volume,
                            exposure: record.exposure,
                            repeats: record.repeats,
                            completed_at: Utc::now(),
                        };
                        info!(sample = %run.sample, run_id = %run.run_id, "sample complete");
                        outcome.runs.push(run);
                        break;
                    }
                    Err(e) if attempts < self.cfg.max_beam_retries => {
                        attempts += 1;
                        warn!(
                            sample = %sample.name,
                            attempt = attempts,
                            error = %e,
                            "beam was substandard during acquisition, repeating sample"
                        );
                        // No partial credit: the whole cycle re-runs.
                        continue;
                    }
                    Err(e) => {
                        error!(sample = %sample.name, error = %e, "beam retries exhausted");
                        outcome.errors.push(BatchError {
                            sample: Some(sample.name.clone()),
                            error: e,
                        });
                        break 'samples;
                    }
                }
            }
        }

        // Leave no needle wet: force-wash anything still flagged dirty.
        for needle in [Needle::Upstream, Needle::Downstream] {
            if self.sequencer.is_dirty(needle) {
                if let Err(e) = self.sequencer.wash_needle(needle, WashOption::Full).await {
                    warn!(%needle, error = %e, "end-of-batch wash failed");
                    outcome.errors.push(BatchError {
                        sample: None,
                        error: e,
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Acquire a sequence of chromatograph injections.
    ///
    /// The vendor software owns the injection schedule; the operator
    /// confirms it has been started, then per injection the column valve is
    /// switched, the handshake armed, and the detector kept exposing until
    /// the run-finished edge. The beam goes through the middle flow cell
    /// for the chromatograph line.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_chromatograph_batch<D>(
        &self,
        detector: &D,
        handshake: &Arc<Chromatograph>,
        column_valve: &SoftSignal<u32>,
        prompt: &dyn OperatorPrompt,
        injections: &[Injection],
        start_timeout: Duration,
    ) -> SolResult<Vec<ChromatographRun>>
    where
        D: Triggerable + ExposureControl + ?Sized,
    {
        if injections.is_empty() {
            return Err(SolError::Validation("no injections to run".into()));
        }

        prompt
            .confirm("sequence imported; start it in the instrument software, then continue")
            .await?;

        self.sequencer.select_flow_cell(FlowCell::Middle).await?;
        handshake.stage();

        let mut runs = Vec::with_capacity(injections.len());
        for injection in injections {
            self.pause_gate().await?;
            self.beam_gate().await?;

            info!(sample = %injection.name, valve = injection.valve_position, "switching column valve");
            column_valve.write(injection.valve_position)?;

            detector.set_exposure(injection.exposure).await?;
            detector.set_num_frames(1).await?;
            detector.arm().await?;

            // The instrument resets its lines between runs; let them clear
            // so arming cannot trip over a stale level.
            handshake.wait_lines_clear(start_timeout).await?;
            handshake.arm()?;
            info!(sample = %injection.name, "waiting for injection");
            handshake.await_start(start_timeout).await?;

            let triggers = handshake.run_acquisition(detector).await?;
            let chromatogram = handshake.collect().await?;

            let run = ChromatographRun {
                run_id: Uuid::new_v4(),
                sample: injection.name.clone(),
                triggers,
                chromatogram,
            };
            info!(sample = %run.sample, run_id = %run.run_id, triggers, "injection complete");
            runs.push(run);
        }

        handshake.unstage()?;
        Ok(runs)
    }
}
