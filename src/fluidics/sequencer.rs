//! Sample-handling state machine.
//!
//! [`SolutionSequencer`] runs one measurement cycle per sample through the
//! shared needle/valve/pump assembly: select the flow cell, wash a dirty
//! needle, align the tube, load the requested volume, collect with the
//! detector while the piston advances in the background, return the sample,
//! and wash.
//!
//! Mechanical safety is enforced here, not in the orchestrator: every holder
//! raise/lower is interlock-checked *before* any actuator fires, so a
//! violation leaves the hardware exactly where it was. Interlock failures
//! abort the remainder of the sample's cycle, flag the needle dirty, and
//! propagate with the sample context attached; they are never retried
//! automatically.
//!
//! Needle bookkeeping invariant: a needle is dirty from the moment a load
//! begins until a wash+dry cycle completes. A dirty needle is washed before
//! the next load; a clean needle washed again is a harmless no-op beyond the
//! standard cycle.

use crate::config::FluidicsSettings;
use crate::error::{SolError, SolResult};
use crate::fluidics::control::{FluidicControlUnit, HolderCmd, SelValve, Switch, ValvePos};
use crate::hardware::capabilities::{ExposureControl, Movable, Triggerable};
use crate::sample::{Needle, TubePosition};
use crate::signal::wait_for;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Which flow cell the beam goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCell {
    Top,
    Middle,
    Bottom,
}

impl FlowCell {
    /// The cell fed by a given needle.
    pub fn for_needle(needle: Needle) -> FlowCell {
        match needle {
            Needle::Upstream => FlowCell::Top,
            Needle::Downstream => FlowCell::Bottom,
        }
    }
}

/// Options for a wash cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WashOption {
    /// Wash loops followed by a gas-purge dry; clears the dirty flag.
    #[default]
    Full,
    /// Wash loops only; the needle stays dirty until dried.
    WashOnly,
    /// Gas-purge dry only.
    DryOnly,
}

/// One measurement request, resolved from a validated sample.
#[derive(Debug, Clone)]
pub struct MeasureRequest {
    /// Sample name, for logging and error context.
    pub sample_name: String,
    /// Tube position, 1..=N.
    pub tube: u32,
    /// Needle override; `None` resolves by parity.
    pub needle: Option<Needle>,
    /// Load volume, microliters.
    pub volume: f64,
    /// Per-frame exposure, seconds.
    pub exposure: f64,
    /// Number of detector triggers.
    pub repeats: u32,
    /// Dump the sample back into its tube after collecting.
    pub return_sample: bool,
    /// Wash the needle at the end of the cycle.
    pub wash_after: bool,
    /// Oscillate the plug instead of a single advance.
    pub oscillate: bool,
    /// Equilibration delay between load and exposure.
    pub delay: Duration,
}

/// What a completed measurement cycle did.
#[derive(Debug, Clone)]
pub struct MeasureRecord {
    /// Needle the sample was loaded through.
    pub needle: Needle,
    /// Tube position measured.
    pub tube: u32,
    /// Volume loaded, microliters.
    pub volume: f64,
    /// Per-frame exposure, seconds.
    pub exposure: f64,
    /// Detector triggers taken.
    pub repeats: u32,
}

#[derive(Debug)]
struct SequencerState {
    dirty_upstream: bool,
    dirty_downstream: bool,
    tube_pos: TubePosition,
    return_piston_pos: f64,
}

/// The sample-handling state machine.
///
/// Owns the fluidic control unit exclusively; nothing else may command the
/// pump or valves while a sequencer exists for them.
pub struct SolutionSequencer {
    ctrl: Arc<FluidicControlUnit>,
    holder_x: Arc<dyn Movable>,
    flowcell_y: Arc<dyn Movable>,
    cfg: FluidicsSettings,
    state: Mutex<SequencerState>,
}

impl SolutionSequencer {
    /// Build a sequencer over its hardware.
    ///
    /// Both needles start flagged dirty: their history is unknown until the
    /// first wash. The pump is put at its plumbing speed.
    pub fn new(
        ctrl: Arc<FluidicControlUnit>,
        holder_x: Arc<dyn Movable>,
        flowcell_y: Arc<dyn Movable>,
        cfg: FluidicsSettings,
    ) -> SolResult<Self> {
        ctrl.set_pump_speed(cfg.default_pump_speed)?;
        let return_piston_pos = cfg.default_piston_pos;
        Ok(Self {
            ctrl,
            holder_x,
            flowcell_y,
            cfg,
            state: Mutex::new(SequencerState {
                dirty_upstream: true,
                dirty_downstream: true,
                tube_pos: TubePosition::WashWell,
                return_piston_pos,
            }),
        })
    }

    /// Shared access to the control unit (read-side introspection).
    pub fn control(&self) -> &Arc<FluidicControlUnit> {
        &self.ctrl
    }

    /// Whether a needle is flagged dirty.
    pub fn is_dirty(&self, needle: Needle) -> bool {
        let state = self.lock_state();
        match needle {
            Needle::Upstream => state.dirty_upstream,
            Needle::Downstream => state.dirty_downstream,
        }
    }

    fn set_dirty(&self, needle: Needle, dirty: bool) {
        let mut state = self.lock_state();
        match needle {
            Needle::Upstream => state.dirty_upstream = dirty,
            Needle::Downstream => state.dirty_downstream = dirty,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SequencerState> {
        // A poisoned lock means a panic mid-cycle; the conservative state
        // (both needles dirty) is still recorded, so continue with it.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The tube position the holder translation currently serves.
    pub fn tube_position(&self) -> TubePosition {
        self.lock_state().tube_pos
    }

    /// Resolve which needle serves a tube, honoring an explicit override.
    pub fn resolve_needle(&self, tube: u32, requested: Option<Needle>) -> Needle {
        requested.unwrap_or_else(|| Needle::for_tube(tube))
    }

    /// Move the flow-cell stage so the beam goes through the given cell.
    pub async fn select_flow_cell(&self, cell: FlowCell) -> SolResult<()> {
        if self.cfg.flow_cell.disable_move {
            warn!("flow cell motion disabled, staying put");
            return Ok(());
        }
        let y = match cell {
            FlowCell::Top => self.cfg.flow_cell.top,
            FlowCell::Middle => self.cfg.flow_cell.middle,
            FlowCell::Bottom => self.cfg.flow_cell.bottom,
        };
        info!(?cell, y, "moving to flow cell");
        self.flowcell_y.move_abs(y).await?;
        self.flowcell_y.wait_settled().await
    }

    /// Translate the holder so the needles serve the given position.
    ///
    /// Requires the tube holder down: moving the translation with tubes
    /// raised would bend the needles.
    pub async fn select_tube(&self, pos: TubePosition) -> SolResult<()> {
        if let TubePosition::Tube(n) = pos {
            if n < 1 || n > self.cfg.max_tube {
                return Err(SolError::InvalidTubePosition {
                    position: n as i64,
                    max: self.cfg.max_tube,
                });
            }
        }
        if !self.ctrl.holder_is_down() {
            return Err(SolError::InterlockViolation {
                condition: format!(
                    "tube holder is up; it must be down before moving to {pos}"
                ),
            });
        }

        let x = match pos {
            TubePosition::WashWell => self.cfg.drain_pos,
            TubePosition::Tube(n) => {
                self.cfg.drain_pos
                    + self.cfg.tube1_offset
                    + self.cfg.tube_spacing * f64::from(n - 1)
            }
            TubePosition::Parked => self.cfg.park_pos,
        };
        info!(%pos, x, "moving holder translation");
        self.holder_x.move_abs(x).await?;
        self.holder_x.wait_settled().await?;
        self.lock_state().tube_pos = pos;
        Ok(())
    }

    /// Park the holder translation (used between holders and while paused).
    pub async fn park(&self) -> SolResult<()> {
        self.select_tube(TubePosition::Parked).await
    }

    /// Raise or lower the pneumatic tube holder, interlock-gated.
    ///
    /// Raising requires a holder present in the carrier and the translation
    /// aligned (unless the alignment sensor is explicitly bypassed). The
    /// checks run before the actuator command is written, so a violation
    /// leaves mechanical state untouched and the call can simply be retried
    /// once the interlock clears.
    pub async fn move_holder(&self, cmd: HolderCmd) -> SolResult<()> {
        if cmd == HolderCmd::Up {
            if !self.ctrl.holder_is_present() {
                return Err(SolError::InterlockViolation {
                    condition: "no tube holder present in the carrier".into(),
                });
            }
            if !self.ctrl.holder_is_aligned() && !self.cfg.bypass_alignment_sensor {
                return Err(SolError::InterlockViolation {
                    condition: "attempting to raise tubes while mis-aligned".into(),
                });
            }
        }

        info!(?cmd, "tube holder actuation");
        self.ctrl.holder_cmd.write(cmd)?;
        let expect_down = match cmd {
            HolderCmd::Down => 1,
            HolderCmd::Up => 0,
        };
        wait_for(&self.ctrl.holder_down, self.cfg.holder_timeout, |v| {
            *v == expect_down
        })
        .await?;
        // Let the pneumatics stop bouncing before fluid moves.
        tokio::time::sleep(self.cfg.holder_settle).await;
        Ok(())
    }

    /// Wash (and/or dry) a needle over its wash well.
    ///
    /// Repeats the fill/drain loop, then purges with gas; only a completed
    /// dry clears the dirty flag. Washing a clean needle runs the same cycle
    /// and is otherwise a no-op.
    pub async fn wash_needle(&self, needle: Needle, option: WashOption) -> SolResult<()> {
        let wash = self.cfg.wash.clone();
        self.select_tube(TubePosition::WashWell).await?;
        self.ctrl
            .set_port4(self.cfg.p4_needle_to_wash.get(needle))?;
        self.move_holder(HolderCmd::Up).await?;

        let result = self.wash_cycle(needle, option, &wash).await;
        // The holder comes down even when the cycle failed mid-way.
        let lowered = self.move_holder(HolderCmd::Down).await;
        result.and(lowered)
    }

    async fn wash_cycle(
        &self,
        needle: Needle,
        option: WashOption,
        wash: &crate::config::WashSettings,
    ) -> SolResult<()> {
        if option != WashOption::DryOnly {
            for n in 0..wash.repeats {
                info!(loop_ = n + 1, total = wash.repeats, %needle, "wash loop");
                self.ctrl.sel_valve.write(SelValve::Water)?;
                self.ctrl.water_pump.write(Switch::On)?;
                tokio::time::sleep(wash.fill).await;
                self.ctrl.water_pump.write(Switch::Off)?;

                self.ctrl.drain(needle).write(Switch::On)?;
                tokio::time::sleep(wash.drain).await;
                self.ctrl.drain(needle).write(Switch::Off)?;
            }
        }

        if option != WashOption::WashOnly {
            info!(%needle, secs = wash.dry.as_secs(), "drying");
            self.ctrl.drain(needle).write(Switch::On)?;
            self.ctrl.sel_valve.write(SelValve::Nitrogen)?;
            self.ctrl.sv_n2.write(Switch::On)?;
            tokio::time::sleep(wash.dry).await;
            self.ctrl.sv_n2.write(Switch::Off)?;
            self.ctrl.drain(needle).write(Switch::Off)?;

            self.set_dirty(needle, false);
        }
        Ok(())
    }

    /// Standalone gas-purge dry of an already-washed needle.
    pub async fn dry_needle(&self, needle: Needle) -> SolResult<()> {
        self.select_tube(TubePosition::WashWell).await?;
        self.ctrl
            .set_port4(self.cfg.p4_needle_to_wash.get(needle))?;
        self.move_holder(HolderCmd::Up).await?;

        self.ctrl.drain(needle).write(Switch::On)?;
        self.ctrl.sel_valve.write(SelValve::Nitrogen)?;
        self.ctrl.sv_n2.write(Switch::On)?;
        tokio::time::sleep(self.cfg.wash.standalone_dry).await;
        self.ctrl.sv_n2.write(Switch::Off)?;
        self.ctrl.drain(needle).write(Switch::Off)?;

        self.move_holder(HolderCmd::Down).await
    }

    /// Wash the needle if dirty, then align the tube for loading.
    pub async fn prepare_load(&self, tube: u32, needle: Needle) -> SolResult<()> {
        if self.is_dirty(needle) {
            self.wash_needle(needle, WashOption::Full).await?;
        }
        self.select_tube(TubePosition::Tube(tube)).await
    }

    /// Draw the requested volume from the aligned tube into the flow cell.
    ///
    /// The needle is flagged dirty as soon as loading starts; only a later
    /// wash+dry clears it. Piston choreography: reset to the reference
    /// position on the reservoir path, prime the sample path up to the flow
    /// channel, raise the holder, draw volume plus headroom at load speed,
    /// lower the holder, then push the plug from the tube line into the cell.
    pub async fn load_sample(&self, volume: f64, needle: Needle) -> SolResult<()> {
        let cfg = &self.cfg;
        self.set_dirty(needle, true);

        self.ctrl.set_port4(cfg.p4_needle_to_load.get(needle))?;

        // Make room to draw the sample from the tube.
        self.ctrl.set_pump_speed(cfg.default_pump_speed)?;
        self.ctrl.set_valve(ValvePos::Reservoir)?;
        self.ctrl.pump_move_abs(cfg.default_piston_pos)?;
        self.ctrl.wait_idle(cfg.idle_timeout).await?;

        // Fill the tubing with water only up to the end of the flow channel.
        self.ctrl.set_valve(ValvePos::Sample)?;
        self.ctrl
            .pump_move_rel(cfg.vol_p4_to_cell.get(needle))?;
        self.ctrl.wait_idle(cfg.idle_timeout).await?;

        let return_pos = self.ctrl.piston_pos.read();
        self.lock_state().return_piston_pos = return_pos;

        self.ctrl.set_pump_speed(cfg.load_pump_speed)?;
        self.move_holder(HolderCmd::Up).await?;
        self.ctrl
            .pump_move_rel(volume + cfg.vol_sample_headroom)?;
        self.ctrl.wait_idle(cfg.idle_timeout).await?;
        self.move_holder(HolderCmd::Down).await?;

        if !self.ctrl.holder_is_down() {
            return Err(SolError::InterlockViolation {
                condition: "tube holder did not come down after loading".into(),
            });
        }

        self.ctrl
            .pump_move_abs(return_pos + cfg.vol_tube_to_cell.get(needle))?;
        self.ctrl.wait_idle(cfg.idle_timeout).await
    }

    /// Collect: advance the plug in the background while triggering the
    /// detector.
    ///
    /// Pump speed is chosen so hydraulic delivery matches total detector
    /// integration (`60·vol / (repeats·exp)` µL/min). The advance is a
    /// delayed move gated on the hydraulic settle interlock; the detector is
    /// triggered `repeats` times; both the background motion and the counting
    /// must finish before the cycle proceeds.
    pub async fn collect<D>(
        &self,
        detector: &D,
        volume: f64,
        exposure: f64,
        repeats: u32,
    ) -> SolResult<()>
    where
        D: Triggerable + ExposureControl + ?Sized,
    {
        let cfg = &self.cfg;
        detector.set_exposure(exposure).await?;
        detector.set_num_frames(1).await?;
        detector.arm().await?;

        let total = f64::from(repeats) * exposure;
        self.ctrl.set_pump_speed(60.0 * volume / total)?;

        let motion =
            self.ctrl
                .delayed_move_rel(volume, cfg.ready_timeout, cfg.idle_timeout);

        let mut trigger_result = Ok(());
        for n in 0..repeats {
            info!(repeat = n + 1, total = repeats, "collecting");
            if let Err(e) = detector.trigger().await {
                trigger_result = Err(e);
                break;
            }
        }

        let motion_result = match motion.await {
            Ok(res) => res,
            Err(join_err) => Err(SolError::Hardware(format!(
                "background piston motion task failed: {join_err}"
            ))),
        };

        self.ctrl.set_pump_speed(cfg.default_pump_speed)?;
        self.ctrl.wait_idle(cfg.idle_timeout).await?;

        trigger_result.and(motion_result)
    }

    /// Oscillating collect: sweep the plug back and forth through the cell.
    ///
    /// Pump speed matches a single stroke to one exposure. With an odd
    /// number of strokes the plug ends displaced by one stroke, so it is
    /// pushed back before returning the sample.
    pub async fn collect_oscillating<D>(
        &self,
        detector: &D,
        volume: f64,
        exposure: f64,
        repeats: u32,
    ) -> SolResult<()>
    where
        D: Triggerable + ExposureControl + ?Sized,
    {
        let cfg = &self.cfg;
        detector.set_exposure(exposure).await?;
        detector.set_num_frames(1).await?;
        detector.arm().await?;

        self.ctrl.set_pump_speed(60.0 * volume / exposure)?;

        let motion = self.ctrl.delayed_oscillate_rel(
            volume,
            repeats,
            cfg.ready_timeout,
            cfg.idle_timeout,
        );

        let mut trigger_result = Ok(());
        for n in 0..repeats {
            info!(repeat = n + 1, total = repeats, "collecting (oscillating)");
            if let Err(e) = detector.trigger().await {
                trigger_result = Err(e);
                break;
            }
        }

        let motion_result = match motion.await {
            Ok(res) => res,
            Err(join_err) => Err(SolError::Hardware(format!(
                "background piston motion task failed: {join_err}"
            ))),
        };

        self.ctrl.set_pump_speed(cfg.default_pump_speed)?;
        if repeats % 2 == 1 {
            self.ctrl.pump_move_rel(-volume)?;
        }
        self.ctrl.wait_idle(cfg.idle_timeout).await?;

        trigger_result.and(motion_result)
    }

    /// Dump the just-measured sample back into its tube.
    pub async fn return_sample(&self) -> SolResult<()> {
        let return_pos = self.lock_state().return_piston_pos;
        self.ctrl.set_valve(ValvePos::Sample)?;
        self.move_holder(HolderCmd::Up).await?;
        self.ctrl.pump_move_abs(return_pos)?;
        self.ctrl.wait_idle(self.cfg.idle_timeout).await?;
        self.move_holder(HolderCmd::Down).await
    }

    /// Run one full measurement cycle for a sample.
    ///
    /// Any failure aborts the remaining steps, leaves the needle flagged
    /// dirty, and propagates with the sample context attached.
    pub async fn measure<D>(&self, detector: &D, req: &MeasureRequest) -> SolResult<MeasureRecord>
    where
        D: Triggerable + ExposureControl + ?Sized,
    {
        let needle = self.resolve_needle(req.tube, req.needle);
        let span = info_span!(
            "measure",
            sample = %req.sample_name,
            tube = req.tube,
            needle = %needle
        );

        let cycle = async {
            self.select_flow_cell(FlowCell::for_needle(needle)).await?;
            self.prepare_load(req.tube, needle).await?;
            self.load_sample(req.volume, needle).await?;

            if !req.delay.is_zero() {
                info!(secs = req.delay.as_secs(), "delay before exposure");
                tokio::time::sleep(req.delay).await;
            }

            if req.oscillate {
                self.collect_oscillating(detector, req.volume, req.exposure, req.repeats)
                    .await?;
            } else {
                self.collect(detector, req.volume, req.exposure, req.repeats)
                    .await?;
            }

            if req.return_sample {
                self.return_sample().await?;
            }
            if req.wash_after {
                self.wash_needle(needle, WashOption::Full).await?;
            }
            Ok::<MeasureRecord, SolError>(MeasureRecord {
                needle,
                tube: req.tube,
                volume: req.volume,
                exposure: req.exposure,
                repeats: req.repeats,
            })
        };

        match cycle.instrument(span).await {
            Ok(record) => Ok(record),
            Err(e) => {
                // The cycle died somewhere in the fluidic path; whatever is
                // in the lines now contaminates the needle.
                self.set_dirty(needle, true);
                Err(e.in_sample_cycle(&req.sample_name, req.tube, needle))
            }
        }
    }
}
