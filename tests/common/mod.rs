//! Shared fixtures: a full sequencing stack over the simulated rig with
//! compressed timing.
#![allow(dead_code)] // not every test binary uses every fixture

use sol_daq::config::{BatchSettings, FluidicsSettings, WashSettings, WatchdogSettings};
use sol_daq::fluidics::{FluidicControlUnit, SolutionSequencer};
use sol_daq::hardware::mock::{
    AutoConfirm, MockDetector, MockRealigner, MockStage, SimulatedRig,
};
use sol_daq::watchdog::{BeamWatchdog, BeamlineSignals};
use std::sync::Arc;
use std::time::Duration;

/// Nominal diagnostics the mocks restore to.
pub const GOOD_BPM: f64 = 1.0e-6;
pub const GOOD_MONITOR: f64 = 160_000.0;

pub fn fast_fluidics() -> FluidicsSettings {
    FluidicsSettings {
        wash: WashSettings {
            fill: Duration::from_millis(1),
            drain: Duration::from_millis(1),
            repeats: 3,
            dry: Duration::from_millis(3),
            standalone_dry: Duration::from_millis(2),
        },
        holder_settle: Duration::from_millis(1),
        idle_timeout: Duration::from_secs(2),
        ready_timeout: Duration::from_secs(2),
        holder_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

pub fn fast_watchdog() -> WatchdogSettings {
    WatchdogSettings {
        check_period: Duration::from_millis(5),
        beam_wait_timeout: Duration::from_secs(2),
        pause_timeout: Duration::from_secs(2),
        post_check_readings: 3,
        post_check_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn fast_batch() -> BatchSettings {
    BatchSettings {
        max_beam_retries: 5,
        ..Default::default()
    }
}

pub struct TestStack {
    pub ctrl: Arc<FluidicControlUnit>,
    /// Keeps the rig emulation tasks alive for the test's lifetime.
    pub rig: SimulatedRig,
    pub holder_x: Arc<MockStage>,
    pub sequencer: Arc<SolutionSequencer>,
    pub beam: Arc<BeamlineSignals>,
    pub realigner: Arc<MockRealigner>,
    pub watchdog: Arc<BeamWatchdog>,
    pub detector: Arc<MockDetector>,
}

pub fn build_stack() -> TestStack {
    build_stack_with(fast_fluidics(), fast_watchdog())
}

pub fn build_stack_with(
    fluidics: FluidicsSettings,
    watchdog_cfg: WatchdogSettings,
) -> TestStack {
    let ctrl = Arc::new(FluidicControlUnit::new("sim:ctrl:"));
    let rig = SimulatedRig::spawn_with_timing(
        Arc::clone(&ctrl),
        Duration::from_millis(2),
        Duration::from_millis(1),
    );

    let holder_x = Arc::new(MockStage::with_speed(50_000.0));
    let flowcell_y = Arc::new(MockStage::with_speed(50_000.0));
    let sequencer = Arc::new(
        SolutionSequencer::new(
            Arc::clone(&ctrl),
            holder_x.clone(),
            flowcell_y,
            fluidics,
        )
        .expect("soft channels accept the initial pump speed"),
    );

    let beam = Arc::new(BeamlineSignals::new());
    let realigner = Arc::new(MockRealigner::new(beam.clone(), GOOD_BPM, GOOD_MONITOR));
    let watchdog = Arc::new(BeamWatchdog::new(
        beam.clone(),
        watchdog_cfg,
        realigner.clone(),
        Arc::new(AutoConfirm),
    ));

    let detector = Arc::new(MockDetector::new());

    TestStack {
        ctrl,
        rig,
        holder_x,
        sequencer,
        beam,
        realigner,
        watchdog,
        detector,
    }
}
