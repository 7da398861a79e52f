//! Sample model and pre-flight sheet validation.
//!
//! A measurement batch starts life as rows parsed out of a user-supplied
//! spreadsheet by an external collaborator. This module owns everything that
//! happens after parsing and before the first hardware motion: auto-filling
//! omitted fields, structural validation (duplicates, numeric ranges,
//! minimum load volume), and the needle-alternation check required before a
//! batch may run with concurrent wash/load operation.
//!
//! Validation is deliberately fail-fast: a bad sheet must be rejected while
//! the holder is still in the storage box, never discovered mid-batch with a
//! sample already in the flow cell.

use crate::error::{SolError, SolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Fixed fluidic input lines shared across the tube holder.
///
/// The upstream needle feeds the top flow cell, the downstream needle the
/// bottom one. Tube parity decides which needle serves which tube: the holder
/// alternates tube/empty positions so that even tubes line up with the
/// upstream needle and odd tubes with the downstream one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Needle {
    Upstream,
    Downstream,
}

impl Needle {
    /// Resolve the needle serving a given tube number.
    ///
    /// Fixed policy: even tube numbers map to the upstream needle, odd ones
    /// to the downstream needle. Callers may override per measurement, but
    /// the holder geometry makes any other mapping physically wrong for the
    /// alternate tube/empty pattern.
    pub fn for_tube(tube: u32) -> Needle {
        if tube % 2 == 0 {
            Needle::Upstream
        } else {
            Needle::Downstream
        }
    }

    /// The other needle.
    pub fn other(self) -> Needle {
        match self {
            Needle::Upstream => Needle::Downstream,
            Needle::Downstream => Needle::Upstream,
        }
    }
}

impl fmt::Display for Needle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Needle::Upstream => write!(f, "upstream needle"),
            Needle::Downstream => write!(f, "downstream needle"),
        }
    }
}

/// Target of a holder-translation move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TubePosition {
    /// Position 0: needles over the washing wells / drains.
    WashWell,
    /// A sample tube, 1..=N from the inboard side.
    Tube(u32),
    /// Park offset used while exchanging holders.
    Parked,
}

impl fmt::Display for TubePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TubePosition::WashWell => write!(f, "wash well"),
            TubePosition::Tube(n) => write!(f, "tube {n}"),
            TubePosition::Parked => write!(f, "park"),
        }
    }
}

/// One validated sample, ready to be measured.
///
/// Created from sheet rows by [`validate_rows`]; immutable afterwards and
/// consumed once per measurement cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Unique sample name within its holder (becomes the run directory name).
    pub name: String,
    /// Tube position within the holder, 1..=N.
    pub position: u32,
    /// Needle override; `None` resolves by tube parity.
    pub needle: Option<Needle>,
    /// Load volume in microliters.
    pub volume: f64,
    /// Detector exposure time per frame, seconds.
    pub exposure: f64,
    /// Number of exposures.
    pub repeats: u32,
    /// Matching buffer sample, if any, for downstream subtraction.
    pub buffer: Option<String>,
}

impl Sample {
    /// The needle this sample will be loaded through.
    pub fn needle(&self) -> Needle {
        self.needle.unwrap_or_else(|| Needle::for_tube(self.position))
    }
}

/// Raw sheet row as handed over by the spreadsheet parser.
///
/// Optional fields may be empty in the sheet; [`autofill_rows`] copies them
/// down from the previous row before validation, mirroring how users fill in
/// only the first row of a block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SheetRow {
    #[serde(rename = "sampleName")]
    pub sample_name: String,
    pub position: Option<f64>,
    pub volume: Option<f64>,
    pub exposure: Option<f64>,
    pub repeats: Option<u32>,
    #[serde(rename = "bufferName", default)]
    pub buffer_name: Option<String>,
}

/// Options controlling batch-level validation.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Smallest load volume the pump can meter reliably, in microliters.
    pub min_volume: f64,
    /// Largest tube number the installed holder accepts.
    pub max_tube: u32,
    /// Default repeats applied when a row omits them.
    pub default_repeats: u32,
    /// Default load volume when a row (and its predecessors) omit it.
    pub default_volume: Option<f64>,
    /// Default exposure when a row (and its predecessors) omit it.
    pub default_exposure: Option<f64>,
    /// Whether the batch will run with concurrent wash/load operation.
    ///
    /// When set, consecutive samples must alternate needle parity so one
    /// needle can wash while the other loads.
    pub concurrent_op: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            min_volume: 20.0,
            max_tube: 18,
            default_repeats: 3,
            default_volume: None,
            default_exposure: None,
            concurrent_op: false,
        }
    }
}

/// Copy omitted optional fields down from the previous row.
///
/// Only `volume` and `exposure` participate; a missing sample name or
/// position is a real error, not something to paper over.
pub fn autofill_rows(rows: &mut [SheetRow]) {
    for i in 1..rows.len() {
        let (prev, rest) = rows.split_at_mut(i);
        let prev = &prev[i - 1];
        let row = &mut rest[0];
        if row.volume.is_none() {
            row.volume = prev.volume;
        }
        if row.exposure.is_none() {
            row.exposure = prev.exposure;
        }
        if row.repeats.is_none() {
            row.repeats = prev.repeats;
        }
    }
}

/// Validate sheet rows into an ordered sample list.
///
/// Checks, in order: required fields present and numeric, positive values,
/// minimum load volume, tube positions within the holder, duplicate sample
/// names, duplicate tube positions, and (when `concurrent_op` is set) needle
/// alternation between consecutive samples. The first failure aborts the
/// whole batch with [`SolError::Validation`].
pub fn validate_rows(rows: &[SheetRow], opts: &ValidationOptions) -> SolResult<Vec<Sample>> {
    if rows.is_empty() {
        return Err(SolError::Validation("sample sheet is empty".into()));
    }

    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        let name = row.sample_name.trim();
        if name.is_empty() {
            return Err(SolError::Validation("empty sample name".into()));
        }

        let position = row
            .position
            .ok_or_else(|| SolError::Validation(format!("missing position for '{name}'")))?;
        if position.fract() != 0.0 || position < 1.0 {
            return Err(SolError::Validation(format!(
                "invalid position {position} for '{name}', positive integer required"
            )));
        }
        let position = position as u32;
        if position > opts.max_tube {
            return Err(SolError::Validation(format!(
                "position {position} for '{name}' exceeds holder capacity {}",
                opts.max_tube
            )));
        }

        let volume = row
            .volume
            .or(opts.default_volume)
            .ok_or_else(|| SolError::Validation(format!("missing volume for '{name}'")))?;
        if !volume.is_finite() || volume <= 0.0 {
            return Err(SolError::Validation(format!(
                "invalid volume {volume} for '{name}', positive value required"
            )));
        }
        if volume < opts.min_volume {
            return Err(SolError::Validation(format!(
                "load volume for '{name}' must be at least {} ul, got {volume}",
                opts.min_volume
            )));
        }

        let exposure = row
            .exposure
            .or(opts.default_exposure)
            .ok_or_else(|| SolError::Validation(format!("missing exposure for '{name}'")))?;
        if !exposure.is_finite() || exposure <= 0.0 {
            return Err(SolError::Validation(format!(
                "invalid exposure {exposure} for '{name}', positive value required"
            )));
        }

        samples.push(Sample {
            name: name.to_string(),
            position,
            needle: None,
            volume,
            exposure,
            repeats: row.repeats.unwrap_or(opts.default_repeats),
            buffer: row.buffer_name.clone().filter(|b| !b.trim().is_empty()),
        });
    }

    verify_samples(&samples, opts)?;
    Ok(samples)
}

/// Structural checks on an already-built sample list.
///
/// Used both at sheet validation and as the orchestrator's pre-flight gate,
/// so a hand-assembled list goes through the same checks as a parsed sheet.
pub fn verify_samples(samples: &[Sample], opts: &ValidationOptions) -> SolResult<()> {
    let mut names = HashSet::new();
    for s in samples {
        if !names.insert(s.name.as_str()) {
            return Err(SolError::Validation(format!(
                "duplicate sample name: {}",
                s.name
            )));
        }
    }

    let mut positions = HashSet::new();
    for s in samples {
        if !positions.insert(s.position) {
            return Err(SolError::Validation(format!(
                "duplicate sample position: {}",
                s.position
            )));
        }
        if s.position < 1 || s.position > opts.max_tube {
            return Err(SolError::Validation(format!(
                "position {} for '{}' outside holder range 1-{}",
                s.position, s.name, opts.max_tube
            )));
        }
        if s.volume < opts.min_volume {
            return Err(SolError::Validation(format!(
                "load volume for '{}' must be at least {} ul, got {}",
                s.name, opts.min_volume, s.volume
            )));
        }
    }

    if opts.concurrent_op {
        check_needle_alternation(samples)?;
    }

    Ok(())
}

/// Verify consecutive samples alternate needles.
///
/// Concurrent operation washes one needle while the other loads, which only
/// makes sense when the sample sequence alternates even and odd tube
/// positions. Two consecutive same-parity tubes would serialize on one needle
/// mid-run, so the conflict is rejected up front.
pub fn check_needle_alternation(samples: &[Sample]) -> SolResult<()> {
    for pair in samples.windows(2) {
        if pair[0].needle() == pair[1].needle() {
            return Err(SolError::Validation(format!(
                "sample sequence is not suited for concurrent operation: '{}' (tube {}) and '{}' (tube {}) both use the {}",
                pair[0].name,
                pair[0].position,
                pair[1].name,
                pair[1].position,
                pair[0].needle(),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, pos: f64, vol: f64, exp: f64) -> SheetRow {
        SheetRow {
            sample_name: name.to_string(),
            position: Some(pos),
            volume: Some(vol),
            exposure: Some(exp),
            repeats: None,
            buffer_name: None,
        }
    }

    #[test]
    fn needle_resolution_follows_tube_parity() {
        for tube in 0..32 {
            let nd = Needle::for_tube(tube);
            if tube % 2 == 0 {
                assert_eq!(nd, Needle::Upstream, "tube {tube}");
            } else {
                assert_eq!(nd, Needle::Downstream, "tube {tube}");
            }
            // Resolution is a pure function of the tube number.
            assert_eq!(nd, Needle::for_tube(tube));
        }
    }

    #[test]
    fn autofill_copies_volume_and_exposure_down() {
        let mut rows = vec![row("a", 1.0, 45.0, 2.0), {
            let mut r = row("b", 2.0, 0.0, 0.0);
            r.volume = None;
            r.exposure = None;
            r
        }];
        autofill_rows(&mut rows);
        assert_eq!(rows[1].volume, Some(45.0));
        assert_eq!(rows[1].exposure, Some(2.0));
    }

    #[test]
    fn rejects_duplicate_names_and_positions() {
        let opts = ValidationOptions::default();
        let dup_name = vec![row("a", 1.0, 45.0, 2.0), row("a", 2.0, 45.0, 2.0)];
        assert!(matches!(
            validate_rows(&dup_name, &opts),
            Err(SolError::Validation(msg)) if msg.contains("duplicate sample name")
        ));

        let dup_pos = vec![row("a", 3.0, 45.0, 2.0), row("b", 3.0, 45.0, 2.0)];
        assert!(matches!(
            validate_rows(&dup_pos, &opts),
            Err(SolError::Validation(msg)) if msg.contains("duplicate sample position")
        ));
    }

    #[test]
    fn rejects_volume_below_minimum() {
        let opts = ValidationOptions::default();
        let rows = vec![row("a", 1.0, 5.0, 2.0)];
        assert!(matches!(
            validate_rows(&rows, &opts),
            Err(SolError::Validation(msg)) if msg.contains("at least")
        ));
    }

    #[test]
    fn concurrent_op_requires_alternating_parity() {
        let opts = ValidationOptions {
            concurrent_op: true,
            ..Default::default()
        };

        let alternating = vec![row("a", 2.0, 45.0, 2.0), row("b", 3.0, 45.0, 2.0)];
        assert!(validate_rows(&alternating, &opts).is_ok());

        let clashing = vec![row("a", 2.0, 45.0, 2.0), row("b", 4.0, 45.0, 2.0)];
        assert!(matches!(
            validate_rows(&clashing, &opts),
            Err(SolError::Validation(msg)) if msg.contains("concurrent operation")
        ));
    }

    #[test]
    fn non_integer_position_rejected_before_any_motion() {
        let opts = ValidationOptions::default();
        let rows = vec![row("a", 1.5, 45.0, 2.0)];
        assert!(validate_rows(&rows, &opts).is_err());
    }
}
