//! Beam-quality watchdog.
//!
//! Monitors the storage-ring current and the beam-position-monitor intensity,
//! gates measurement progress on them, and owns the two recovery paths:
//!
//! - **ring current low**: the beam is down; wait (watch-driven, bounded)
//!   until it comes back, then re-validate the reference intensity;
//! - **BPM intensity low with the beam up**: either the photon shutter is
//!   closed (operator action) or the optics drifted, in which case an opaque
//!   realignment procedure is invoked and awaited.
//!
//! Validated readings are retained in a bounded history with timestamps; a
//! good reading that is still fresh short-circuits realignment so the batch
//! does not re-scan the optics after every brief dip.
//!
//! The operator pause gate also lives here: a request on the pause channel
//! is acknowledged, the caller parks mechanically, and
//! [`BeamWatchdog::wait_resume`] blocks (bounded) until the channel clears.

use crate::config::WatchdogSettings;
use crate::error::{SolError, SolResult};
use crate::hardware::capabilities::{BeamRealignment, OperatorPrompt};
use crate::signal::{wait_for, SoftSignal};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

/// Beamline diagnostic channels the watchdog polls.
pub struct BeamlineSignals {
    /// Storage-ring current, mA.
    pub ring_current: SoftSignal<f64>,
    /// Beam-position-monitor integrated intensity.
    pub bpm_intensity: SoftSignal<f64>,
    /// Transmitted-intensity monitor counts (downstream of the sample).
    pub monitor_counts: SoftSignal<f64>,
    /// Photon shutter status; 1 = open.
    pub shutter_open: SoftSignal<u32>,
    /// Operator pause channel: 1 = requested, 2 = acknowledged, 0 = released.
    pub pause_request: SoftSignal<u32>,
}

impl BeamlineSignals {
    /// Create the channel set with nominal values (beam up, shutter open).
    pub fn new() -> Self {
        Self {
            ring_current: SoftSignal::read_only("SR:OPS-BI{DCCT:1}I:Real-I", 400.0),
            bpm_intensity: SoftSignal::read_only("BPM0:Int", 1.0e-6),
            monitor_counts: SoftSignal::read_only("em2:sum_all:mean", 160_000.0),
            shutter_open: SoftSignal::read_only("PSh:Enbl-Sts", 1),
            pause_request: SoftSignal::new("sol:ctrl:pause_request", 0),
        }
    }
}

impl Default for BeamlineSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// One validated beam reading.
#[derive(Debug, Clone, Copy)]
pub struct BeamReading {
    /// When the reading was taken.
    pub at: DateTime<Utc>,
    /// Ring current at the time, mA.
    pub ring_current: f64,
    /// BPM intensity at the time.
    pub bpm_intensity: f64,
    /// Monitor counts at the time.
    pub monitor_counts: f64,
    /// Whether the reading passed the intensity-tolerance check.
    pub good: bool,
}

/// The beam-quality watchdog.
pub struct BeamWatchdog {
    signals: Arc<BeamlineSignals>,
    cfg: WatchdogSettings,
    realigner: Arc<dyn BeamRealignment>,
    prompt: Arc<dyn OperatorPrompt>,
    history: Mutex<VecDeque<BeamReading>>,
    reference_intensity: Mutex<Option<f64>>,
    previous_beam_on: AtomicBool,
}

impl BeamWatchdog {
    /// Build a watchdog over its diagnostics and recovery collaborators.
    pub fn new(
        signals: Arc<BeamlineSignals>,
        cfg: WatchdogSettings,
        realigner: Arc<dyn BeamRealignment>,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Self {
        Self {
            signals,
            cfg,
            realigner,
            prompt,
            history: Mutex::new(VecDeque::new()),
            reference_intensity: Mutex::new(None),
            previous_beam_on: AtomicBool::new(true),
        }
    }

    /// The diagnostic channels (for transports and tests).
    pub fn signals(&self) -> &BeamlineSignals {
        &self.signals
    }

    /// Whether the ring current reads above the beam-down threshold.
    pub fn beam_on(&self) -> bool {
        self.signals.ring_current.read() >= self.cfg.ring_current_threshold
    }

    fn sample_reading(&self, good: bool) -> BeamReading {
        BeamReading {
            at: Utc::now(),
            ring_current: self.signals.ring_current.read(),
            bpm_intensity: self.signals.bpm_intensity.read(),
            monitor_counts: self.signals.monitor_counts.read(),
            good,
        }
    }

    fn push_reading(&self, reading: BeamReading) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        history.push_back(reading);
        while history.len() > self.cfg.history_len {
            history.pop_front();
        }
    }

    /// Snapshot of the most recent readings, newest last.
    pub fn recent_readings(&self, n: usize) -> Vec<BeamReading> {
        self.history
            .lock()
            .map(|h| h.iter().rev().take(n).rev().copied().collect())
            .unwrap_or_default()
    }

    /// Compare the live monitor intensity against the stored reference.
    ///
    /// With `update` the current value becomes the new reference. Returns
    /// whether the reading was within tolerance; good readings are appended
    /// to the bounded history.
    pub fn log_reference_intensity(&self, update: bool) -> bool {
        let monitor = self.signals.monitor_counts.read();

        let mut reference = match self.reference_intensity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if update || reference.is_none() {
            *reference = Some(monitor);
        }
        let good = match *reference {
            Some(reference) if reference > 0.0 => {
                ((reference - monitor) / reference).abs() <= self.cfg.intensity_tolerance
            }
            _ => false,
        };
        drop(reference);

        self.push_reading(self.sample_reading(good));
        good
    }

    /// Whether a validated good reading is still fresh enough to skip
    /// realignment.
    pub fn recent_good_reading(&self) -> bool {
        let Ok(history) = self.history.lock() else {
            return false;
        };
        history.iter().rev().any(|r| {
            r.good
                && (Utc::now() - r.at)
                    .to_std()
                    .map_or(false, |age| age <= self.cfg.good_reading_max_age)
        })
    }

    /// Check alignment, realigning if the cached good reading is stale.
    ///
    /// The realignment procedure itself is an opaque external action; the
    /// watchdog invokes it, awaits it, and re-validates the reference
    /// intensity afterwards.
    pub async fn check_beam(&self) -> SolResult<()> {
        if self.recent_good_reading() && self.log_reference_intensity(false) {
            return Ok(());
        }

        info!("beam intensity off reference, running realignment");
        let peak = self.realigner.realign().await?;
        info!(peak, "realignment applied");
        self.log_reference_intensity(true);
        Ok(())
    }

    /// Verify the beam is usable, recovering where possible.
    ///
    /// Returns `false` when the ring current is below threshold (nothing to
    /// recover, the caller waits). With the beam up, drives the BPM
    /// intensity back above threshold: a closed shutter is an operator
    /// action, anything else a realignment. Bounded by the beam-wait
    /// ceiling.
    pub async fn verify_beam_on(&self) -> SolResult<bool> {
        let beam_on = self.beam_on();
        let was_on = self.previous_beam_on.swap(beam_on, Ordering::AcqRel);
        if !beam_on {
            return Ok(false);
        }
        if !was_on {
            // Ring current just recovered; refresh the reference reading.
            info!("ring current recovered, re-validating reference intensity");
            self.log_reference_intensity(false);
        }

        let deadline = Instant::now() + self.cfg.beam_wait_timeout;
        while self.signals.bpm_intensity.read() < self.cfg.bpm_threshold {
            if Instant::now() >= deadline {
                return Err(SolError::HardwareTimeout {
                    what: format!("{} recovery", self.signals.bpm_intensity.address()),
                    waited_ms: self.cfg.beam_wait_timeout.as_millis() as u64,
                });
            }
            if self.signals.shutter_open.read() == 0 {
                self.prompt
                    .confirm("photon shutter is closed; open it to continue")
                    .await?;
            } else {
                warn!("BPM counts low, attempting realignment");
                self.check_beam().await?;
            }
            if self.signals.bpm_intensity.read() < self.cfg.bpm_threshold {
                // Recovery did not take; pace the next attempt.
                tokio::time::sleep(self.cfg.check_period).await;
            }
        }
        Ok(true)
    }

    /// Block until the ring current is back above threshold, then verify.
    ///
    /// Watch-driven (wakes on the next current update), bounded by the
    /// beam-wait ceiling.
    pub async fn wait_for_beam(&self) -> SolResult<()> {
        let threshold = self.cfg.ring_current_threshold;
        wait_for(&self.signals.ring_current, self.cfg.beam_wait_timeout, |v| {
            *v >= threshold
        })
        .await?;
        self.verify_beam_on().await.map(|_| ())
    }

    /// Post-acquisition quality check for a just-measured sample.
    ///
    /// Averages a burst of monitor readings; below threshold fails with
    /// `BeamQuality`, which the orchestrator answers by re-running the same
    /// sample after recovery.
    pub async fn collection_ok(&self, sample: &str) -> SolResult<()> {
        let n = self.cfg.post_check_readings.max(1);
        let mut sum = 0.0;
        for i in 0..n {
            let counts = self.signals.monitor_counts.read();
            sum += counts;
            self.push_reading(self.sample_reading(counts >= self.cfg.monitor_threshold));
            if i + 1 < n {
                tokio::time::sleep(self.cfg.post_check_interval).await;
            }
        }
        let mean = sum / n as f64;
        if mean < self.cfg.monitor_threshold {
            return Err(SolError::BeamQuality {
                sample: sample.to_string(),
                measured: mean,
                threshold: self.cfg.monitor_threshold,
            });
        }
        Ok(())
    }

    /// Whether the operator has requested a pause.
    pub fn pause_requested(&self) -> bool {
        self.signals.pause_request.read() == 1
    }

    /// Acknowledge a pause request (caller parks mechanically first).
    pub fn acknowledge_pause(&self) -> SolResult<()> {
        self.signals.pause_request.write(2)
    }

    /// Block until the operator releases the pause.
    ///
    /// Wakes on the channel transition; the poll interval only paces the
    /// "still paused" progress line. Bounded by the pause ceiling.
    pub async fn wait_resume(&self) -> SolResult<()> {
        let started = Instant::now();
        let deadline = started + self.cfg.pause_timeout;
        let mut rx = self.signals.pause_request.subscribe();
        info!("data collection paused, waiting for release");

        loop {
            if *rx.borrow() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(SolError::HardwareTimeout {
                    what: format!("{} release", self.signals.pause_request.address()),
                    waited_ms: self.cfg.pause_timeout.as_millis() as u64,
                });
            }
            match tokio::time::timeout(self.cfg.pause_poll, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(SolError::HardwareTimeout {
                        what: format!("{} release", self.signals.pause_request.address()),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(_) => {
                    info!(
                        elapsed_s = started.elapsed().as_secs(),
                        "data collection paused ..."
                    );
                }
            }
        }
        info!("pause released, resuming");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Realigner that restores the watchdog's own BPM channel.
    struct CountingRealigner {
        calls: AtomicU32,
        signals: Arc<BeamlineSignals>,
    }

    #[async_trait]
    impl BeamRealignment for CountingRealigner {
        async fn realign(&self) -> SolResult<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.signals.bpm_intensity.apply_update(1.0e-6);
            self.signals.monitor_counts.apply_update(160_000.0);
            Ok(0.0)
        }
    }

    struct NoPrompt;

    #[async_trait]
    impl OperatorPrompt for NoPrompt {
        async fn confirm(&self, _message: &str) -> SolResult<()> {
            Ok(())
        }
    }

    fn fast_cfg() -> WatchdogSettings {
        WatchdogSettings {
            beam_wait_timeout: Duration::from_secs(2),
            check_period: Duration::from_millis(10),
            post_check_interval: Duration::from_millis(1),
            post_check_readings: 3,
            ..Default::default()
        }
    }

    fn watchdog(cfg: WatchdogSettings) -> (Arc<BeamWatchdog>, Arc<CountingRealigner>) {
        let signals = Arc::new(BeamlineSignals::new());
        let realigner = Arc::new(CountingRealigner {
            calls: AtomicU32::new(0),
            signals: signals.clone(),
        });
        let dog = Arc::new(BeamWatchdog::new(
            signals,
            cfg,
            realigner.clone(),
            Arc::new(NoPrompt),
        ));
        (dog, realigner)
    }

    #[tokio::test]
    async fn beam_off_reported_without_recovery() {
        let (dog, realigner) = watchdog(fast_cfg());
        dog.signals().ring_current.apply_update(50.0);
        assert!(!dog.verify_beam_on().await.unwrap());
        assert_eq!(realigner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_bpm_triggers_realignment() {
        let (dog, realigner) = watchdog(fast_cfg());
        dog.signals().bpm_intensity.apply_update(1.0e-9);
        assert!(dog.verify_beam_on().await.unwrap());
        assert_eq!(realigner.calls.load(Ordering::SeqCst), 1);
        // The BPM channel came back above threshold through the recovery.
        assert!(dog.signals().bpm_intensity.read() >= 1.0e-7);
    }

    #[tokio::test]
    async fn fresh_good_reading_skips_realignment() {
        let (dog, realigner) = watchdog(fast_cfg());
        // Seed the reference and a fresh validated reading.
        dog.log_reference_intensity(true);
        dog.check_beam().await.unwrap();
        assert_eq!(realigner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn collection_ok_fails_below_threshold() {
        let (dog, _) = watchdog(fast_cfg());
        dog.signals().monitor_counts.apply_update(1_000.0);
        let err = dog.collection_ok("lysozyme").await.unwrap_err();
        assert!(matches!(err, SolError::BeamQuality { .. }));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let cfg = WatchdogSettings {
            history_len: 4,
            ..fast_cfg()
        };
        let (dog, _) = watchdog(cfg);
        for _ in 0..20 {
            dog.log_reference_intensity(false);
        }
        assert_eq!(dog.recent_readings(100).len(), 4);
    }

    #[tokio::test]
    async fn pause_gate_roundtrip() {
        let (dog, _) = watchdog(fast_cfg());

        assert!(!dog.pause_requested());
        dog.signals().pause_request.write(1).unwrap();
        assert!(dog.pause_requested());
        dog.acknowledge_pause().unwrap();

        let waiter = dog.clone();
        let join = tokio::spawn(async move { waiter.wait_resume().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        dog.signals().pause_request.write(0).unwrap();
        join.await.unwrap().unwrap();
    }
}
