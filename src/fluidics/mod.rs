//! The fluidic sample-handling subsystem.
//!
//! [`control::FluidicControlUnit`] is the channel-level facade over the
//! pump/valve box; [`sequencer::SolutionSequencer`] drives it through the
//! per-sample measurement cycle.

pub mod control;
pub mod sequencer;

pub use control::{FluidicControlUnit, HolderCmd, SelValve, Switch, ValvePos};
pub use sequencer::{FlowCell, MeasureRecord, MeasureRequest, SolutionSequencer, WashOption};
