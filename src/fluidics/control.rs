//! Low-level fluidic hardware facade.
//!
//! [`FluidicControlUnit`] gathers every channel of the syringe-pump/valve
//! box behind one struct: piston position and speed, the reservoir/sample
//! selector valve, the 4-port needle routing valve, wash-water and gas-purge
//! solenoids, per-needle drains, the pneumatic tube-holder actuator, and the
//! interlock sensors around it.
//!
//! The unit is an exclusively-owned resource: only the sequencer mutates it.
//! It exposes two kinds of motion:
//!
//! - immediate piston moves (`pump_move_abs` / `pump_move_rel`), with
//!   completion observed via [`FluidicControlUnit::wait_idle`];
//! - *delayed* background moves, which gate on the hydraulic `ready`
//!   interlock before moving so that successive slow strokes serialize on
//!   the hardware's own settling signal. Delayed moves run as tokio tasks
//!   and hand back a [`JoinHandle`]; the sequencer joins them at its
//!   synchronization point instead of spawning raw threads per motion.

use crate::error::{SolError, SolResult};
use crate::sample::Needle;
use crate::signal::{wait_for, Direction, SoftSignal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Position of the syringe-pump selector valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValvePos {
    /// Reservoir path: piston strokes move water to/from the reservoir.
    Reservoir,
    /// Sample path: piston strokes move liquid through the needle.
    Sample,
}

/// Two-state solenoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Switch {
    Off,
    On,
}

/// Media selector in the syringe pump box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelValve {
    /// Wash water supply.
    Water,
    /// Nitrogen purge supply.
    Nitrogen,
}

/// Pneumatic tube-holder command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HolderCmd {
    Down,
    Up,
}

/// Channel facade for the solution-scattering control box.
pub struct FluidicControlUnit {
    /// Pump reset trigger.
    pub reset_pump: SoftSignal<u32>,
    /// Pump halt trigger.
    pub halt_pump: SoftSignal<u32>,
    /// Piston position setpoint/readback, microliters.
    pub piston_pos: SoftSignal<f64>,
    /// Pump speed, microliters per minute.
    pub pump_spd: SoftSignal<f64>,
    /// Reservoir/sample selector valve.
    pub valve_pos: SoftSignal<ValvePos>,
    /// Pump controller status readback; 0 = idle.
    pub status: SoftSignal<u32>,
    /// Serial link busy readback; 0 = idle.
    pub serial_busy: SoftSignal<u32>,
    /// Hydraulic settle interlock: hardware raises it when the previous
    /// slow motion settled; a delayed move consumes it (writes 0).
    pub ready: SoftSignal<u32>,
    /// Wash-water pump solenoid.
    pub water_pump: SoftSignal<Switch>,
    /// Water/nitrogen media selector.
    pub sel_valve: SoftSignal<SelValve>,
    /// Nitrogen purge solenoid.
    pub sv_n2: SoftSignal<Switch>,
    /// Drain solenoid under the upstream wash well.
    pub drain_upstream: SoftSignal<Switch>,
    /// Drain solenoid under the downstream wash well.
    pub drain_downstream: SoftSignal<Switch>,
    /// 4-port valve routing the needles to wash or load paths.
    pub port4_valve: SoftSignal<u32>,
    /// Pneumatic tube-holder actuator command.
    pub holder_cmd: SoftSignal<HolderCmd>,
    /// Tube-holder position sensor; 1 = fully down.
    pub holder_down: SoftSignal<u32>,
    /// Alignment sensor: 1 = holder translation aligned, tubes may go up.
    pub holder_aligned: SoftSignal<u32>,
    /// Holder-present sensor: 1 = a tube holder is seated in the carrier.
    pub holder_present: SoftSignal<u32>,
}

impl FluidicControlUnit {
    /// Create the channel set under an address prefix
    /// (e.g. `"sol:ctrl:"`).
    pub fn new(prefix: &str) -> Self {
        let addr = |suffix: &str| format!("{prefix}{suffix}");
        Self {
            reset_pump: SoftSignal::new(addr("pp1c_reset"), 0),
            halt_pump: SoftSignal::new(addr("pp1c_halt"), 0),
            piston_pos: SoftSignal::new(addr("pp1c_piston_pos"), 0.0),
            pump_spd: SoftSignal::new(addr("pp1c_spd"), 0.0),
            valve_pos: SoftSignal::new(addr("pp1c_valve_pos"), ValvePos::Reservoir),
            status: SoftSignal::read_only(addr("pp1c_status"), 0),
            serial_busy: SoftSignal::read_only(addr("busy"), 0),
            ready: SoftSignal::new(addr("ready"), 1),
            water_pump: SoftSignal::new(addr("sv_water"), Switch::Off),
            sel_valve: SoftSignal::new(addr("sv_sel"), SelValve::Water),
            sv_n2: SoftSignal::new(addr("sv_N2"), Switch::Off),
            drain_upstream: SoftSignal::new(addr("sv_drain1"), Switch::Off),
            drain_downstream: SoftSignal::new(addr("sv_drain2"), Switch::Off),
            port4_valve: SoftSignal::new(addr("vc_4port_valve"), 0),
            holder_cmd: SoftSignal::new(addr("sv_pcr_tubes"), HolderCmd::Down),
            holder_down: SoftSignal::read_only(addr("holder_down"), 1),
            holder_aligned: SoftSignal::read_only(addr("sample_align"), 1),
            holder_present: SoftSignal::with_direction(
                addr("holder_present"),
                1,
                Direction::ReadOnly,
            ),
        }
    }

    /// Drain solenoid for a needle's wash well.
    pub fn drain(&self, needle: Needle) -> &SoftSignal<Switch> {
        match needle {
            Needle::Upstream => &self.drain_upstream,
            Needle::Downstream => &self.drain_downstream,
        }
    }

    /// Block until the pump controller and serial link are both idle.
    ///
    /// Wakes on channel transitions rather than sleep-polling; fails with
    /// `HardwareTimeout` when the ceiling is exceeded.
    pub async fn wait_idle(&self, timeout: Duration) -> SolResult<()> {
        let mut status_rx = self.status.subscribe();
        let mut busy_rx = self.serial_busy.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                let idle = { *status_rx.borrow() == 0 && *busy_rx.borrow() == 0 };
                if idle {
                    return;
                }
                tokio::select! {
                    _ = status_rx.changed() => {}
                    _ = busy_rx.changed() => {}
                }
            }
        })
        .await;

        waited.map_err(|_| SolError::HardwareTimeout {
            what: format!("{} idle", self.status.address()),
            waited_ms: timeout.as_millis() as u64,
        })
    }

    /// Move the piston to an absolute position.
    pub fn pump_move_abs(&self, target: f64) -> SolResult<()> {
        debug!(target, "pump move (absolute)");
        self.piston_pos.write(target)
    }

    /// Move the piston relative to its current position.
    pub fn pump_move_rel(&self, delta: f64) -> SolResult<()> {
        let current = self.piston_pos.read();
        debug!(current, delta, "pump move (relative)");
        self.piston_pos.write(current + delta)
    }

    /// Set the pump speed in microliters per minute.
    pub fn set_pump_speed(&self, speed: f64) -> SolResult<()> {
        self.pump_spd.write(speed)
    }

    /// Switch the reservoir/sample selector valve.
    pub fn set_valve(&self, pos: ValvePos) -> SolResult<()> {
        self.valve_pos.write(pos)
    }

    /// Route the 4-port valve.
    pub fn set_port4(&self, pos: u32) -> SolResult<()> {
        self.port4_valve.write(pos)
    }

    /// Emergency stop: halt the pump and close every media solenoid.
    pub fn halt(&self) -> SolResult<()> {
        self.halt_pump.write(1)?;
        self.water_pump.write(Switch::Off)?;
        self.sv_n2.write(Switch::Off)?;
        self.drain_upstream.write(Switch::Off)?;
        self.drain_downstream.write(Switch::Off)?;
        Ok(())
    }

    /// Reset the pump controller.
    pub fn reset(&self) -> SolResult<()> {
        self.reset_pump.write(1)
    }

    /// Whether the tube holder reads fully down.
    pub fn holder_is_down(&self) -> bool {
        self.holder_down.read() == 1
    }

    /// Whether a tube holder is seated in the carrier.
    pub fn holder_is_present(&self) -> bool {
        self.holder_present.read() == 1
    }

    /// Whether the holder translation is aligned for raising tubes.
    pub fn holder_is_aligned(&self) -> bool {
        self.holder_aligned.read() == 1
    }

    /// Start a delayed relative piston move in the background.
    ///
    /// The task blocks on the hydraulic `ready` interlock (so the motion
    /// only starts once the previous one settled), consumes it, performs the
    /// stroke, and waits for the controller to go idle. Join the returned
    /// handle at the synchronization point; the task's result carries any
    /// gate timeout or write failure.
    pub fn delayed_move_rel(
        self: &Arc<Self>,
        delta: f64,
        ready_timeout: Duration,
        idle_timeout: Duration,
    ) -> JoinHandle<SolResult<()>> {
        let ctrl = Arc::clone(self);
        tokio::spawn(async move {
            wait_for(&ctrl.ready, ready_timeout, |v| *v == 1).await?;
            ctrl.ready.write(0)?;
            ctrl.pump_move_rel(delta)?;
            ctrl.wait_idle(idle_timeout).await
        })
    }

    /// Start a delayed oscillating piston move in the background.
    ///
    /// After the `ready` gate, performs `times` strokes of `delta`
    /// microliters with alternating sign, waiting for idle between strokes.
    /// Keeps the plug sweeping through the flow cell during long exposures.
    pub fn delayed_oscillate_rel(
        self: &Arc<Self>,
        delta: f64,
        times: u32,
        ready_timeout: Duration,
        idle_timeout: Duration,
    ) -> JoinHandle<SolResult<()>> {
        let ctrl = Arc::clone(self);
        tokio::spawn(async move {
            wait_for(&ctrl.ready, ready_timeout, |v| *v == 1).await?;
            ctrl.ready.write(0)?;
            let mut stroke = delta;
            for _ in 0..times {
                ctrl.pump_move_rel(stroke)?;
                ctrl.wait_idle(idle_timeout).await?;
                stroke = -stroke;
            }
            Ok(())
        })
    }
}
