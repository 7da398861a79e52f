//! Configuration management.
//!
//! All tunable constants of the sample handler live here: wash/dry timing,
//! pump speeds, tubing volumes, holder geometry, watchdog thresholds, and the
//! timeout ceilings on every hardware wait. Settings are loaded from layered
//! TOML under `config/` with code defaults underneath, so a bare checkout
//! runs against the simulated rig without any file present.
//!
//! The defaults encode the measured geometry of the installed tube holder
//! (tube pitch, first-tube offset, park position) and the tubing volumes
//! calibrated for each needle; changing them requires re-measuring the
//! hardware, not editing code.

use crate::error::{SolError, SolResult};
use crate::sample::Needle;
use config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level filter (trace/debug/info/warn/error).
    pub log_level: String,
    /// Fluidic path constants and timeouts.
    pub fluidics: FluidicsSettings,
    /// Beam-quality thresholds and pause-gate behavior.
    pub watchdog: WatchdogSettings,
    /// External-instrument handshake budgets.
    pub chromatograph: ChromatographSettings,
    /// Batch-level defaults and retry policy.
    pub batch: BatchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            fluidics: FluidicsSettings::default(),
            watchdog: WatchdogSettings::default(),
            chromatograph: ChromatographSettings::default(),
            batch: BatchSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `config/{name}.toml` (default: `config/default`),
    /// merged over the built-in defaults. A missing file is not an error.
    pub fn new(config_name: Option<&str>) -> SolResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(Config::try_from(&Settings::default()).map_err(SolError::Config)?)
            .add_source(config::File::with_name(&config_path).required(false))
            .build()
            .map_err(SolError::Config)?;

        s.try_deserialize().map_err(SolError::Config)
    }
}

/// A value calibrated separately for each needle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerNeedle<T> {
    pub upstream: T,
    pub downstream: T,
}

impl<T: Copy> PerNeedle<T> {
    /// Value for the given needle.
    pub fn get(&self, needle: Needle) -> T {
        match needle {
            Needle::Upstream => self.upstream,
            Needle::Downstream => self.downstream,
        }
    }
}

/// Wash/dry cycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WashSettings {
    /// Time the wash pump runs per loop; enough water to fill the drain well.
    #[serde(with = "humantime_serde")]
    pub fill: Duration,
    /// Drain-open time per loop, assuming the well started empty.
    #[serde(with = "humantime_serde")]
    pub drain: Duration,
    /// Number of fill/drain loops per wash.
    pub repeats: u32,
    /// Gas-purge time at the end of a wash cycle.
    #[serde(with = "humantime_serde")]
    pub dry: Duration,
    /// Gas-purge time for a standalone dry (needle already washed).
    #[serde(with = "humantime_serde")]
    pub standalone_dry: Duration,
}

impl Default for WashSettings {
    fn default() -> Self {
        Self {
            fill: Duration::from_millis(300),
            drain: Duration::from_secs(2),
            repeats: 3,
            dry: Duration::from_secs(55),
            standalone_dry: Duration::from_secs(35),
        }
    }
}

/// Vertical offsets of the three flow cells, mm.
///
/// The upstream needle feeds the top cell, the downstream needle the bottom
/// one; the middle cell belongs to the chromatograph line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowCellSettings {
    pub top: f64,
    pub middle: f64,
    pub bottom: f64,
    /// Leave the flow-cell stage where it is (single-cell commissioning).
    pub disable_move: bool,
}

impl Default for FlowCellSettings {
    fn default() -> Self {
        Self {
            top: -5.41,
            middle: -0.72,
            bottom: 3.65,
            disable_move: false,
        }
    }
}

/// Fluidic path constants: pump, valves, tubing volumes, holder geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidicsSettings {
    /// Wash/dry cycle timing.
    pub wash: WashSettings,
    /// Flow-cell stage offsets.
    pub flow_cell: FlowCellSettings,
    /// Piston rest position before a load, in microliters.
    pub default_piston_pos: f64,
    /// Pump speed for plumbing moves, microliters per minute.
    pub default_pump_speed: f64,
    /// Reduced pump speed while drawing sample from a tube.
    pub load_pump_speed: f64,
    /// Tubing volume from the 4-port valve to the flow cell, per needle.
    /// Negative: the pump retracts to prime the line with water only.
    pub vol_p4_to_cell: PerNeedle<f64>,
    /// Tubing volume from the tube to the flow cell, per needle.
    pub vol_tube_to_cell: PerNeedle<f64>,
    /// Extra volume drawn past the requested amount to keep the plug clear
    /// of the needle tip.
    pub vol_sample_headroom: f64,
    /// 4-port valve position routing each needle to its wash well.
    pub p4_needle_to_wash: PerNeedle<u32>,
    /// 4-port valve position routing each needle to the sample path.
    pub p4_needle_to_load: PerNeedle<u32>,
    /// Holder-translation offset of the wash well, mm.
    pub drain_pos: f64,
    /// Holder-translation offset of tube 1 relative to the wash well, mm.
    pub tube1_offset: f64,
    /// Tube-to-tube pitch, mm. Mechanically determined; do not retune.
    pub tube_spacing: f64,
    /// Park offset used while exchanging holders, mm.
    pub park_pos: f64,
    /// Largest tube number the installed holder accepts.
    pub max_tube: u32,
    /// Pneumatic settle time after a holder raise/lower.
    #[serde(with = "humantime_serde")]
    pub holder_settle: Duration,
    /// Ceiling on waiting for the pump/serial path to go idle.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Ceiling on the ready gate before a delayed background move.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Ceiling on holder up/down actuation reaching its sensor.
    #[serde(with = "humantime_serde")]
    pub holder_timeout: Duration,
    /// Ignore the holder alignment sensor when raising tubes.
    ///
    /// Operator-level escape hatch for a failed sensor; leaves the
    /// holder-present interlock in force.
    pub bypass_alignment_sensor: bool,
}

impl Default for FluidicsSettings {
    fn default() -> Self {
        Self {
            wash: WashSettings::default(),
            flow_cell: FlowCellSettings::default(),
            default_piston_pos: 175.0,
            default_pump_speed: 1500.0,
            load_pump_speed: 350.0,
            vol_p4_to_cell: PerNeedle {
                upstream: -140.0,
                downstream: -140.0,
            },
            vol_tube_to_cell: PerNeedle {
                upstream: 90.0,
                downstream: 88.0,
            },
            vol_sample_headroom: 13.0,
            p4_needle_to_wash: PerNeedle {
                upstream: 1,
                downstream: 0,
            },
            p4_needle_to_load: PerNeedle {
                upstream: 0,
                downstream: 1,
            },
            drain_pos: 0.0,
            tube1_offset: -18.75,
            tube_spacing: -5.8417,
            park_pos: 31.0,
            max_tube: 18,
            holder_settle: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(120),
            holder_timeout: Duration::from_secs(10),
            bypass_alignment_sensor: false,
        }
    }
}

/// Beam-quality thresholds and recovery pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Ring current below which the beam counts as down, mA.
    pub ring_current_threshold: f64,
    /// Beam-position-monitor intensity below which realignment is needed.
    pub bpm_threshold: f64,
    /// Acceptance threshold on the transmitted-intensity monitor for a
    /// completed acquisition.
    pub monitor_threshold: f64,
    /// How long to sleep between beam checks while waiting for recovery.
    #[serde(with = "humantime_serde")]
    pub check_period: Duration,
    /// Ceiling on waiting for the beam to come back.
    #[serde(with = "humantime_serde")]
    pub beam_wait_timeout: Duration,
    /// Poll interval while the operator pause is asserted.
    #[serde(with = "humantime_serde")]
    pub pause_poll: Duration,
    /// Ceiling on an operator pause.
    #[serde(with = "humantime_serde")]
    pub pause_timeout: Duration,
    /// Bounded length of the validated-reading history.
    pub history_len: usize,
    /// A good reading younger than this skips realignment.
    #[serde(with = "humantime_serde")]
    pub good_reading_max_age: Duration,
    /// Number of trailing monitor readings averaged for the post-acquisition
    /// quality check.
    pub post_check_readings: usize,
    /// Spacing between those readings.
    #[serde(with = "humantime_serde")]
    pub post_check_interval: Duration,
    /// Relative deviation from the reference intensity still accepted as a
    /// good reading.
    pub intensity_tolerance: f64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            ring_current_threshold: 300.0,
            bpm_threshold: 1.0e-7,
            monitor_threshold: 30_000.0,
            check_period: Duration::from_secs(900),
            beam_wait_timeout: Duration::from_secs(12 * 3600),
            pause_poll: Duration::from_secs(1),
            pause_timeout: Duration::from_secs(8 * 3600),
            history_len: 32,
            good_reading_max_age: Duration::from_secs(900),
            post_check_readings: 10,
            post_check_interval: Duration::from_millis(250),
            intensity_tolerance: 0.05,
        }
    }
}

/// External-instrument handshake budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromatographSettings {
    /// Ceiling on waiting for the injection edge after arming.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
    /// Ceiling on a blocking wait for the run-finished edge.
    #[serde(with = "humantime_serde")]
    pub finish_timeout: Duration,
    /// Path the external software exports the chromatogram table to.
    pub export_path: String,
}

impl Default for ChromatographSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(3600),
            finish_timeout: Duration::from_secs(4 * 3600),
            export_path: "data/hplc_export.txt".to_string(),
        }
    }
}

/// Batch-level defaults and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Default load volume when the sheet omits it, microliters.
    pub volume: f64,
    /// Default exposure time when the sheet omits it, seconds.
    pub exposure: f64,
    /// Default number of exposures per sample.
    pub repeats: u32,
    /// Smallest load volume accepted from a sheet.
    pub min_volume: f64,
    /// Return the sample to its tube after measuring.
    pub return_sample: bool,
    /// Wash one needle while the other loads. Requires an alternating
    /// sample sequence, enforced at validation.
    pub concurrent_op: bool,
    /// Bounded number of same-sample re-runs after a beam-quality fault.
    pub max_beam_retries: u32,
    /// Optional delay between load and exposure (temperature equilibration).
    #[serde(with = "humantime_serde")]
    pub pre_exposure_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            volume: 45.0,
            exposure: 1.0,
            repeats: 5,
            min_volume: 20.0,
            return_sample: true,
            concurrent_op: false,
            max_beam_retries: 5,
            pre_exposure_delay: Duration::ZERO,
        }
    }
}
