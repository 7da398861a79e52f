//! Simulated hardware.
//!
//! Everything needed to run the full sequencing stack without a beamline:
//!
//! - [`SimulatedRig`] emulates the control-box firmware behind the fluidic
//!   channels (pneumatic actuation feeding the holder sensor, pump strokes
//!   toggling the status line and re-raising the hydraulic settle interlock)
//! - [`MockStage`] is a motion stage with realistic-but-compressed timing
//! - [`MockDetector`] counts triggers and supports a per-trigger hook so
//!   tests can fault the beam mid-acquisition
//! - [`MockRealigner`] restores the beamline diagnostics when invoked
//! - [`AutoConfirm`] answers every operator prompt immediately
//!
//! All mocks use `tokio::time::sleep`, never blocking sleeps.

use crate::error::{SolError, SolResult};
use crate::fluidics::control::{FluidicControlUnit, HolderCmd};
use crate::hardware::capabilities::{
    BeamRealignment, ExposureControl, Movable, OperatorPrompt, Triggerable,
};
use crate::watchdog::BeamlineSignals;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

// =============================================================================
// SimulatedRig - control-box firmware emulation
// =============================================================================

/// Emulates the hardware side of the fluidic control box.
///
/// Spawns background tasks that answer channel writes the way the firmware
/// would: holder actuation moves the position sensor after a pneumatic
/// delay, piston setpoint changes blip the status line and re-raise the
/// hydraulic settle interlock once the stroke completes.
///
/// Tasks are aborted when the rig is dropped.
pub struct SimulatedRig {
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatedRig {
    /// Spawn the emulation with default (compressed) timing.
    pub fn spawn(ctrl: Arc<FluidicControlUnit>) -> Self {
        Self::spawn_with_timing(ctrl, Duration::from_millis(20), Duration::from_millis(5))
    }

    /// Spawn with explicit pneumatic and pump-stroke delays.
    pub fn spawn_with_timing(
        ctrl: Arc<FluidicControlUnit>,
        actuation_delay: Duration,
        stroke_delay: Duration,
    ) -> Self {
        let mut tasks = Vec::new();

        // Pneumatic actuator: command -> (delay) -> position sensor.
        {
            let ctrl = Arc::clone(&ctrl);
            let mut cmd_rx = ctrl.holder_cmd.subscribe();
            tasks.push(tokio::spawn(async move {
                while cmd_rx.changed().await.is_ok() {
                    let cmd = *cmd_rx.borrow();
                    sleep(actuation_delay).await;
                    let down = match cmd {
                        HolderCmd::Down => 1,
                        HolderCmd::Up => 0,
                    };
                    debug!(?cmd, "rig: holder actuated");
                    ctrl.holder_down.apply_update(down);
                }
            }));
        }

        // Pump controller: setpoint change -> busy -> idle -> settled.
        {
            let ctrl = Arc::clone(&ctrl);
            let mut pos_rx = ctrl.piston_pos.subscribe();
            tasks.push(tokio::spawn(async move {
                while pos_rx.changed().await.is_ok() {
                    ctrl.status.apply_update(1);
                    sleep(stroke_delay).await;
                    ctrl.status.apply_update(0);
                    // Hydraulics settled; the next delayed move may start.
                    ctrl.ready.apply_update(1);
                }
            }));
        }

        Self { tasks }
    }
}

impl Drop for SimulatedRig {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// =============================================================================
// MockStage - simulated motion stage
// =============================================================================

/// Simulated linear stage for the holder translation / flow-cell stages.
///
/// Motion time scales with distance (compressed relative to the real
/// hardware); settling is a short fixed delay.
pub struct MockStage {
    position: Arc<RwLock<f64>>,
    speed_mm_per_sec: f64,
}

impl MockStage {
    /// Create a stage at position 0.0 mm.
    pub fn new() -> Self {
        Self::with_speed(500.0)
    }

    /// Create a stage with a custom simulated speed.
    pub fn with_speed(speed_mm_per_sec: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(0.0)),
            speed_mm_per_sec,
        }
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> SolResult<()> {
        let current = *self.position.read().await;
        let distance = (target - current).abs();
        let delay_ms = (distance / self.speed_mm_per_sec * 1000.0) as u64;
        debug!(current, target, delay_ms, "MockStage: moving");
        sleep(Duration::from_millis(delay_ms)).await;
        *self.position.write().await = target;
        Ok(())
    }

    async fn position(&self) -> SolResult<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> SolResult<()> {
        sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}

// =============================================================================
// MockDetector - simulated X-ray detector
// =============================================================================

/// Trigger hook invoked with the running trigger count (1-based).
pub type TriggerHook = Box<dyn Fn(u32) + Send + Sync>;

/// Simulated detector that counts triggers.
///
/// Exposure timing is compressed to a fixed short readout so tests run
/// fast; the exposure/frame configuration is still validated and recorded.
pub struct MockDetector {
    armed: AtomicBool,
    exposure_s: Mutex<f64>,
    num_frames: Mutex<u32>,
    triggers: AtomicU32,
    on_trigger: Mutex<Option<TriggerHook>>,
}

impl MockDetector {
    /// Create an unarmed detector.
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            exposure_s: Mutex::new(1.0),
            num_frames: Mutex::new(1),
            triggers: AtomicU32::new(0),
            on_trigger: Mutex::new(None),
        }
    }

    /// Install a hook called synchronously on each trigger with the
    /// 1-based trigger count. Used to fault the beam mid-acquisition.
    pub fn set_trigger_hook(&self, hook: TriggerHook) {
        if let Ok(mut slot) = self.on_trigger.lock() {
            *slot = Some(hook);
        }
    }

    /// Total triggers taken since construction.
    pub fn trigger_count(&self) -> u32 {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Triggerable for MockDetector {
    async fn arm(&self) -> SolResult<()> {
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn trigger(&self) -> SolResult<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Err(SolError::Hardware("detector not armed".into()));
        }
        let count = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(hook) = self.on_trigger.lock() {
            if let Some(hook) = hook.as_ref() {
                hook(count);
            }
        }
        debug!(count, "MockDetector: frame");
        sleep(Duration::from_millis(2)).await;
        Ok(())
    }

    async fn is_armed(&self) -> SolResult<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ExposureControl for MockDetector {
    async fn set_exposure(&self, seconds: f64) -> SolResult<()> {
        if seconds <= 0.0 {
            return Err(SolError::Hardware("exposure must be positive".into()));
        }
        if let Ok(mut exp) = self.exposure_s.lock() {
            *exp = seconds;
        }
        Ok(())
    }

    async fn exposure(&self) -> SolResult<f64> {
        Ok(self.exposure_s.lock().map(|e| *e).unwrap_or(0.0))
    }

    async fn set_num_frames(&self, frames: u32) -> SolResult<()> {
        if frames == 0 {
            return Err(SolError::Hardware("frame count must be positive".into()));
        }
        if let Ok(mut n) = self.num_frames.lock() {
            *n = frames;
        }
        Ok(())
    }

    async fn num_frames(&self) -> SolResult<u32> {
        Ok(self.num_frames.lock().map(|n| *n).unwrap_or(0))
    }
}

// =============================================================================
// MockRealigner / AutoConfirm
// =============================================================================

/// Realigner that restores the beamline diagnostics it is pointed at.
pub struct MockRealigner {
    signals: Arc<BeamlineSignals>,
    calls: AtomicU32,
    good_bpm: f64,
    good_monitor: f64,
}

impl MockRealigner {
    /// Create a realigner restoring the given nominal diagnostics.
    pub fn new(signals: Arc<BeamlineSignals>, good_bpm: f64, good_monitor: f64) -> Self {
        Self {
            signals,
            calls: AtomicU32::new(0),
            good_bpm,
            good_monitor,
        }
    }

    /// How many realignment scans ran.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BeamRealignment for MockRealigner {
    async fn realign(&self) -> SolResult<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Sweep-and-fit compressed to a short delay; the fitted peak lands
        // near zero with a little scan noise.
        sleep(Duration::from_millis(5)).await;
        self.signals.bpm_intensity.apply_update(self.good_bpm);
        self.signals.monitor_counts.apply_update(self.good_monitor);
        let peak = rand::thread_rng().gen_range(-0.05..0.05);
        Ok(peak)
    }
}

/// Operator prompt that confirms everything immediately.
pub struct AutoConfirm;

#[async_trait]
impl OperatorPrompt for AutoConfirm {
    async fn confirm(&self, message: &str) -> SolResult<()> {
        debug!(message, "auto-confirming operator prompt");
        Ok(())
    }
}
