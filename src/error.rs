//! Custom error types for the application.
//!
//! This module defines the primary error type, `SolError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized taxonomy for
//! everything that can go wrong while handling liquid samples on the beamline,
//! from bad sample sheets to mechanical safety violations.
//!
//! ## Error Hierarchy
//!
//! The variants fall into four families with different propagation policies:
//!
//! - **Safety** (`InterlockViolation`): a mechanical precondition was not met.
//!   Fatal to the current sample cycle, never retried automatically; clearing
//!   it requires the precondition to change or an explicit operator bypass.
//! - **Transient hardware** (`HardwareTimeout`, `AwaitTimeout`, `MissedEdge`):
//!   a polled status or monitored transition did not arrive within budget.
//!   Callers may retry a bounded number of times before surfacing.
//! - **Input** (`Validation`): bad sample-sheet data. Raised during pre-flight
//!   checks, always before any hardware motion.
//! - **Acquisition quality** (`BeamQuality`): data was collected but the beam
//!   was substandard; the orchestrator re-runs the affected sample.
//!
//! All hardware-context variants carry enough information (channel address,
//! tube, needle) to identify where in the fluidic path the failure occurred.

use crate::sample::Needle;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SolResult<T> = std::result::Result<T, SolError>;

#[derive(Error, Debug)]
pub enum SolError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interlock violation: {condition}")]
    InterlockViolation {
        /// Human-readable description of the unsatisfied precondition.
        condition: String,
    },

    #[error("Hardware timeout waiting for {what} after {waited_ms} ms")]
    HardwareTimeout {
        /// What was being waited on (channel address or condition).
        what: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    #[error("Timed out awaiting transition on '{address}'")]
    AwaitTimeout {
        /// Address of the monitored channel.
        address: String,
    },

    #[error("Transition on '{address}' already happened before the status was bound")]
    MissedEdge {
        /// Address of the monitored channel.
        address: String,
    },

    #[error("Status bound to '{address}' was cancelled while a caller awaited it")]
    StatusCancelled {
        /// Address of the monitored channel.
        address: String,
    },

    #[error("Handshake already armed (state: {state})")]
    AlreadyArmed {
        /// The state the protocol was in when `arm` was called.
        state: String,
    },

    #[error("Handshake operation '{operation}' invalid in state {state}")]
    HandshakeState {
        /// The operation that was attempted.
        operation: String,
        /// The state the protocol was in.
        state: String,
    },

    #[error("Sample sheet validation failed: {0}")]
    Validation(String),

    #[error("Beam quality below threshold during acquisition of '{sample}' (mean {measured:.1}, threshold {threshold:.1})")]
    BeamQuality {
        /// Sample being measured when quality dropped.
        sample: String,
        /// Mean monitor reading over the acquisition.
        measured: f64,
        /// Configured acceptance threshold.
        threshold: f64,
    },

    #[error("Channel '{address}' is not writable")]
    ChannelReadOnly {
        /// Address of the channel.
        address: String,
    },

    #[error("Channel '{address}' is disconnected")]
    ChannelDisconnected {
        /// Address of the channel.
        address: String,
    },

    #[error("Unrecognized needle for tube {tube}")]
    UnknownNeedle {
        /// Tube number that failed needle resolution.
        tube: u32,
    },

    #[error("Invalid tube position {position}, must be 0 (wash well), 1-{max}, or parked")]
    InvalidTubePosition {
        /// The rejected position.
        position: i64,
        /// Largest valid tube number for the installed holder.
        max: u32,
    },

    #[error("Measurement of '{sample}' (tube {tube}, {needle}) aborted: {source}")]
    SampleCycle {
        /// Sample name the cycle was running for.
        sample: String,
        /// Tube position of the sample.
        tube: u32,
        /// Needle the cycle was using.
        needle: Needle,
        /// Underlying failure.
        #[source]
        source: Box<SolError>,
    },

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Chromatogram read failed: {0}")]
    ChromatogramRead(String),

    #[error("Operator declined to continue: {0}")]
    OperatorAbort(String),
}

impl SolError {
    /// Whether the error may clear on its own and is worth retrying.
    ///
    /// Safety interlocks and validation failures are never retryable; timeouts
    /// and beam-quality faults are.
    pub fn is_transient(&self) -> bool {
        match self {
            SolError::HardwareTimeout { .. }
            | SolError::AwaitTimeout { .. }
            | SolError::BeamQuality { .. } => true,
            SolError::SampleCycle { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap an error with the sample context it occurred in.
    pub fn in_sample_cycle(self, sample: &str, tube: u32, needle: Needle) -> Self {
        SolError::SampleCycle {
            sample: sample.to_string(),
            tube,
            needle,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interlock_violation_is_not_transient() {
        let err = SolError::InterlockViolation {
            condition: "holder not down".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn hardware_timeout_is_transient() {
        let err = SolError::HardwareTimeout {
            what: "pump status".into(),
            waited_ms: 5000,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn sample_cycle_context_preserves_transience() {
        let inner = SolError::AwaitTimeout {
            address: "sol:ctrl:busy".into(),
        };
        let wrapped = inner.in_sample_cycle("lysozyme_2mg", 4, Needle::Upstream);
        assert!(wrapped.is_transient());
        let msg = wrapped.to_string();
        assert!(msg.contains("lysozyme_2mg"));
        assert!(msg.contains("tube 4"));
    }
}
