//! # Solution-Scattering Sample Handler
//!
//! Core library for unattended multi-step sample measurement on a
//! solution-scattering beamline: fluidic sample handling through a shared
//! needle/valve/pump assembly, detector-synchronized collection, an
//! edge-triggered handshake with an external chromatograph, and batch
//! orchestration gated on beam quality.
//!
//! ## Crate Structure
//!
//! - **`signal`**: addressed hardware channels with read/write/subscribe and
//!   the edge-triggered [`signal::status::TransitionStatus`] completion
//!   object.
//! - **`hardware`**: capability traits (`Movable`, `Triggerable`, ...) and
//!   simulated devices, including the control-box rig emulation.
//! - **`fluidics`**: the channel-level control unit and the per-sample
//!   measurement sequencer with its mechanical interlocks.
//! - **`chromatograph`**: the armed/waiting-injection/waiting-done handshake
//!   protocol, the trigger-check acquisition loop, and the export reader.
//! - **`watchdog`**: beam-quality monitoring, realignment gating, bounded
//!   reading history, and the operator pause gate.
//! - **`batch`**: the orchestrator walking validated sample lists with
//!   retry-on-beam-fault semantics.
//! - **`sample`**: the sample model and fail-fast sheet validation.
//! - **`config`**: every duration/volume/speed/threshold constant, loaded
//!   from layered TOML.
//! - **`error`**: the `SolError` taxonomy shared across the crate.
//! - **`logging`**: tracing subscriber initialization.
//! - **`validation`**: small reusable validators.

pub mod batch;
pub mod chromatograph;
pub mod config;
pub mod error;
pub mod fluidics;
pub mod hardware;
pub mod logging;
pub mod sample;
pub mod signal;
pub mod validation;
pub mod watchdog;
