//! Atomic hardware capabilities.
//!
//! Fine-grained capability traits that the devices around the sample handler
//! implement. Instead of monolithic device classes, each piece of hardware
//! exposes exactly the contracts it supports:
//!
//! - The holder translation stage implements `Movable`
//! - The X-ray detector implements `Triggerable + ExposureControl`
//! - The monochromator recovery procedure implements `BeamRealignment`
//! - The operator console implements `OperatorPrompt`
//!
//! The sequencing code depends only on these interfaces, never on a device
//! class identity, so simulated devices slot in without touching a line of
//! the sequencer.
//!
//! Each capability trait is async (`#[async_trait]`), thread-safe
//! (`Send + Sync`), and returns [`SolResult`].

use crate::error::SolResult;
use async_trait::async_trait;

/// Capability: motion control.
///
/// Devices that can move to positions (the holder translation, the flow-cell
/// vertical stage).
///
/// # Contract
/// - Positions are in device-native units (mm here)
/// - `move_abs` initiates motion and may return before completion
/// - `wait_settled` blocks until motion completes, with an internal timeout
/// - `position` returns the current position, approximate during motion
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to an absolute position.
    async fn move_abs(&self, position: f64) -> SolResult<()>;

    /// Current position in device-native units.
    async fn position(&self) -> SolResult<f64>;

    /// Block until motion completes.
    async fn wait_settled(&self) -> SolResult<()>;
}

/// Capability: armed triggering.
///
/// The detector must be armed before it accepts triggers; a trigger runs one
/// complete exposure cycle (all configured frames) and returns after readout.
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Prepare the device to accept triggers.
    async fn arm(&self) -> SolResult<()>;

    /// Run one exposure cycle. Blocks until readout completes.
    async fn trigger(&self) -> SolResult<()>;

    /// Whether the device is currently armed.
    async fn is_armed(&self) -> SolResult<bool>;
}

/// Capability: exposure configuration.
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set per-frame exposure time in seconds.
    async fn set_exposure(&self, seconds: f64) -> SolResult<()>;

    /// Current per-frame exposure time in seconds.
    async fn exposure(&self) -> SolResult<f64>;

    /// Set the number of frames taken per trigger.
    async fn set_num_frames(&self, frames: u32) -> SolResult<()>;

    /// Current number of frames per trigger.
    async fn num_frames(&self) -> SolResult<u32>;
}

/// Capability: beam realignment.
///
/// An opaque recovery action the watchdog invokes when beam-position
/// intensity drops: sweep an optical element, fit the peak, apply the
/// correction. Returns the fitted peak position in device units.
#[async_trait]
pub trait BeamRealignment: Send + Sync {
    /// Run the realignment scan and apply the correction.
    async fn realign(&self) -> SolResult<f64>;
}

/// Capability: blocking operator interaction at batch boundaries.
///
/// Used for confirmations like "sequence imported, continue?"; core logic
/// never depends on the transport behind it.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Present a message and block until the operator confirms.
    ///
    /// Fails with `OperatorAbort` when the operator declines.
    async fn confirm(&self, message: &str) -> SolResult<()>;
}
