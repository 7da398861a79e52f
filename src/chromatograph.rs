//! Chromatograph acquisition handshake.
//!
//! The chromatograph runs its own vendor software; the beamline only sees
//! three digital lines: `ready` (we raise it when armed), `injected` (rises
//! when the instrument injects the sample) and `done` (rises when the run
//! completes), plus an operator `bypass` channel for the days the wiring or
//! the vendor software misbehaves.
//!
//! Protocol: `Idle → WaitingInjection → WaitingDone → Idle`.
//!
//! - [`Chromatograph::arm`] binds edge-triggered statuses to the `injected`
//!   and `done` lines *before* raising `ready`, then moves to
//!   `WaitingInjection`. Arming outside `Idle` fails with `AlreadyArmed`.
//! - [`Chromatograph::await_start`] blocks on the injection edge; on success
//!   it clears `ready` and moves to `WaitingDone`.
//! - While waiting for the run to finish, the caller drives
//!   [`Chromatograph::run_acquisition`]: a tight trigger-check loop that
//!   keeps exposing the detector and stops after the finish status is seen
//!   complete. The loop triggers before checking, so at least one exposure
//!   is captured even when the run finished before the loop was entered.
//! - [`Chromatograph::collect`] is valid only after the finish status
//!   completed; it delegates to the export reader and returns to `Idle`.
//!
//! A bypass value of 1 force-completes the injection wait, 2 the finish
//! wait — each only when the protocol is in the matching state. Out-of-state
//! bypasses are logged and discarded.

use crate::error::{SolError, SolResult};
use crate::hardware::capabilities::Triggerable;
use crate::signal::status::{EdgePolicy, TransitionStatus};
use crate::signal::{wait_for, SoftSignal, Subscription};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Handshake protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing armed; the instrument ignores us and vice versa.
    Idle,
    /// Armed, `ready` raised, waiting for the injection edge.
    WaitingInjection,
    /// Injection seen, waiting for the run-finished edge.
    WaitingDone,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Idle => write!(f, "idle"),
            HandshakeState::WaitingInjection => write!(f, "waiting-injection"),
            HandshakeState::WaitingDone => write!(f, "waiting-done"),
        }
    }
}

/// A parsed chromatogram export: numeric traces keyed by section name.
#[derive(Debug, Clone, Default)]
pub struct Chromatogram {
    /// Section name → (time, value) pairs.
    pub sections: BTreeMap<String, Vec<(f64, f64)>>,
}

impl Chromatogram {
    /// Total number of data points across sections.
    pub fn len(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }

    /// Whether no section carries data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External data-file reader: given a path, returns the tabular export the
/// vendor software wrote. Core treats this as an opaque call.
#[async_trait]
pub trait ChromatogramReader: Send + Sync {
    /// Read and parse an export file.
    async fn read_export(&self, path: &Path) -> SolResult<Chromatogram>;
}

/// Reader for the vendor ASCII export: `[Section]` headers followed by
/// tab-separated `time<TAB>value` rows. Non-numeric rows (column headers,
/// counts) inside a section are skipped.
#[derive(Debug, Default)]
pub struct TabularExportReader;

#[async_trait]
impl ChromatogramReader for TabularExportReader {
    async fn read_export(&self, path: &Path) -> SolResult<Chromatogram> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SolError::ChromatogramRead(format!("cannot read {}: {e}", path.display()))
        })?;

        let mut out = Chromatogram::default();
        let mut current: Option<String> = None;
        let mut body = String::new();

        let flush = |section: &Option<String>, body: &mut String, out: &mut Chromatogram| {
            if let Some(name) = section {
                let mut rows = Vec::new();
                let mut rdr = csv::ReaderBuilder::new()
                    .delimiter(b'\t')
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(body.as_bytes());
                for record in rdr.records().flatten() {
                    if record.len() < 2 {
                        continue;
                    }
                    if let (Ok(t), Ok(v)) = (
                        record[0].trim().parse::<f64>(),
                        record[1].trim().parse::<f64>(),
                    ) {
                        rows.push((t, v));
                    }
                }
                out.sections.insert(name.clone(), rows);
            }
            body.clear();
        };

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                flush(&current, &mut body, &mut out);
                current = Some(trimmed[1..trimmed.len() - 1].to_string());
            } else {
                body.push_str(line);
                body.push('\n');
            }
        }
        flush(&current, &mut body, &mut out);

        Ok(out)
    }
}

/// Digital handshake lines to the chromatograph.
pub struct ChromatographSignals {
    /// Output: beamline armed and counting.
    pub ready: SoftSignal<u32>,
    /// Input: rises 0→1 when the instrument injects.
    pub injected: SoftSignal<u32>,
    /// Input: rises 0→1 when the run completes.
    pub done: SoftSignal<u32>,
    /// Operator override: 1 forces the injection wait, 2 the finish wait.
    pub bypass: SoftSignal<u32>,
}

impl ChromatographSignals {
    /// Create the line set under an address prefix.
    pub fn new(prefix: &str) -> Self {
        Self {
            ready: SoftSignal::new(format!("{prefix}out"), 0),
            injected: SoftSignal::read_only(format!("{prefix}in1"), 0),
            done: SoftSignal::read_only(format!("{prefix}in2"), 0),
            bypass: SoftSignal::new(format!("{prefix}_bypass"), 0),
        }
    }
}

/// The handshake protocol driver.
pub struct Chromatograph {
    signals: ChromatographSignals,
    state: Mutex<HandshakeState>,
    injected_status: Mutex<Option<TransitionStatus>>,
    done_status: Mutex<Option<TransitionStatus>>,
    bypass_sub: Mutex<Option<Subscription>>,
    reader: Arc<dyn ChromatogramReader>,
    export_path: PathBuf,
}

impl Chromatograph {
    /// Build a protocol driver over its signal lines and export reader.
    pub fn new(
        signals: ChromatographSignals,
        reader: Arc<dyn ChromatogramReader>,
        export_path: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signals,
            state: Mutex::new(HandshakeState::Idle),
            injected_status: Mutex::new(None),
            done_status: Mutex::new(None),
            bypass_sub: Mutex::new(None),
            reader,
            export_path: export_path.into(),
        })
    }

    /// The handshake lines (for transports and tests).
    pub fn signals(&self) -> &ChromatographSignals {
        &self.signals
    }

    /// Current protocol state.
    pub fn state(&self) -> HandshakeState {
        self.lock_state_value()
    }

    fn lock_state_value(&self) -> HandshakeState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: HandshakeState) {
        match self.state.lock() {
            Ok(mut s) => *s = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn status_clone(
        slot: &Mutex<Option<TransitionStatus>>,
        operation: &str,
        state: HandshakeState,
    ) -> SolResult<TransitionStatus> {
        slot.lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or_else(|| SolError::HandshakeState {
                operation: operation.to_string(),
                state: state.to_string(),
            })
    }

    /// Install the bypass listener. Call once after construction.
    ///
    /// The listener matches the bypass value against the protocol state and
    /// force-completes the corresponding status; mismatches are discarded
    /// with a log line. The channel is reset to 0 after each request.
    pub fn stage(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let sub = self.signals.bypass.on_transition(move |_, new| {
            let value = *new;
            if value == 0 {
                return;
            }
            let Some(hs) = this.upgrade() else {
                return;
            };
            let state = hs.lock_state_value();
            info!(value, %state, "bypass request");
            match (value, state) {
                (1, HandshakeState::WaitingInjection) => {
                    if let Ok(guard) = hs.injected_status.lock() {
                        if let Some(status) = guard.as_ref() {
                            status.force_complete();
                        }
                    }
                }
                (2, HandshakeState::WaitingDone) => {
                    if let Ok(guard) = hs.done_status.lock() {
                        if let Some(status) = guard.as_ref() {
                            status.force_complete();
                        }
                    }
                }
                _ => {
                    warn!(value, %state, "bypass request does not match state, discarding");
                }
            }
            let _ = hs.signals.bypass.write(0);
        });
        if let Ok(mut slot) = self.bypass_sub.lock() {
            *slot = Some(sub);
        }
    }

    /// Tear the protocol down: cancel pending statuses (waking any waiter),
    /// drop the bypass listener, clear `ready`, return to `Idle`.
    pub fn unstage(&self) -> SolResult<()> {
        if let Ok(mut slot) = self.injected_status.lock() {
            if let Some(status) = slot.take() {
                status.cancel();
            }
        }
        if let Ok(mut slot) = self.done_status.lock() {
            if let Some(status) = slot.take() {
                status.cancel();
            }
        }
        if let Ok(mut sub) = self.bypass_sub.lock() {
            *sub = None;
        }
        self.signals.ready.write(0)?;
        self.set_state(HandshakeState::Idle);
        Ok(())
    }

    /// Wait for both input lines to be low.
    ///
    /// The instrument drops `injected` and `done` between runs; arming
    /// against a stale high level fails with `MissedEdge` under strict-edge
    /// semantics, so a batch lets the lines clear first.
    pub async fn wait_lines_clear(&self, timeout: Duration) -> SolResult<()> {
        wait_for(&self.signals.injected, timeout, |v| *v == 0).await?;
        wait_for(&self.signals.done, timeout, |v| *v == 0).await
    }

    /// Arm the handshake: bind both edge statuses, raise `ready`, move to
    /// `WaitingInjection`.
    ///
    /// Statuses are bound before `ready` rises, so under strict-edge
    /// semantics the armed edges cannot predate the bind. A stale high level
    /// on `injected` or `done` fails fast with `MissedEdge` instead of
    /// arming against a line that will never fall on its own.
    pub fn arm(&self) -> SolResult<()> {
        let state = self.lock_state_value();
        if state != HandshakeState::Idle {
            return Err(SolError::AlreadyArmed {
                state: state.to_string(),
            });
        }

        let injected = TransitionStatus::bind(
            &self.signals.injected,
            0,
            1,
            EdgePolicy::StrictEdge,
        )?;
        let done = TransitionStatus::bind(&self.signals.done, 0, 1, EdgePolicy::StrictEdge)?;

        if let Ok(mut slot) = self.injected_status.lock() {
            *slot = Some(injected);
        }
        if let Ok(mut slot) = self.done_status.lock() {
            *slot = Some(done);
        }

        self.signals.ready.write(1)?;
        self.set_state(HandshakeState::WaitingInjection);
        info!("armed, waiting for injection");
        Ok(())
    }

    /// Block until the instrument injects (or the operator bypasses).
    ///
    /// On success clears `ready` and moves to `WaitingDone`. On timeout the
    /// injection status stays pending and the call may be retried.
    pub async fn await_start(&self, timeout: Duration) -> SolResult<()> {
        let status =
            Self::status_clone(&self.injected_status, "await_start", self.lock_state_value())?;
        status.wait(timeout).await?;
        self.signals.ready.write(0)?;
        self.set_state(HandshakeState::WaitingDone);
        info!("injection seen, acquiring");
        Ok(())
    }

    /// Non-blocking check of the run-finished status.
    pub fn finish_is_done(&self) -> bool {
        self.done_status
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(TransitionStatus::is_done))
            .unwrap_or(false)
    }

    /// Block until the run finishes (or the operator bypasses).
    pub async fn await_finish(&self, timeout: Duration) -> SolResult<()> {
        let status =
            Self::status_clone(&self.done_status, "await_finish", self.lock_state_value())?;
        status.wait(timeout).await
    }

    /// Trigger-check loop run while the instrument is injecting/eluting.
    ///
    /// Busy-polls *with work*: each pass takes one detector exposure, then
    /// checks the finish status. Triggering first guarantees at least one
    /// exposure even when the finish edge beat the loop. Returns the number
    /// of triggers taken.
    pub async fn run_acquisition<D>(&self, detector: &D) -> SolResult<u32>
    where
        D: Triggerable + ?Sized,
    {
        let mut triggers = 0u32;
        loop {
            detector.trigger().await?;
            triggers += 1;
            if self.finish_is_done() {
                break;
            }
        }
        info!(triggers, "acquisition loop finished");
        Ok(triggers)
    }

    /// Collect the run's dataset via the export reader and return to `Idle`.
    ///
    /// Valid only after the finish status completed.
    pub async fn collect(&self) -> SolResult<Chromatogram> {
        let state = self.lock_state_value();
        if state != HandshakeState::WaitingDone || !self.finish_is_done() {
            return Err(SolError::HandshakeState {
                operation: "collect".to_string(),
                state: state.to_string(),
            });
        }

        let data = self.reader.read_export(&self.export_path).await?;

        if let Ok(mut slot) = self.injected_status.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.done_status.lock() {
            *slot = None;
        }
        self.set_state(HandshakeState::Idle);
        info!(points = data.len(), "chromatogram collected");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct EmptyReader;

    #[async_trait]
    impl ChromatogramReader for EmptyReader {
        async fn read_export(&self, _path: &Path) -> SolResult<Chromatogram> {
            Ok(Chromatogram::default())
        }
    }

    fn handshake() -> Arc<Chromatograph> {
        Chromatograph::new(
            ChromatographSignals::new("hplc:"),
            Arc::new(EmptyReader),
            "unused.txt",
        )
    }

    #[tokio::test]
    async fn arm_rejects_non_idle_state() {
        let hs = handshake();
        hs.arm().unwrap();
        let err = hs.arm().unwrap_err();
        assert!(matches!(err, SolError::AlreadyArmed { .. }));
    }

    #[tokio::test]
    async fn arm_fails_fast_on_stale_injected_level() {
        let hs = handshake();
        hs.signals().injected.apply_update(1);
        let err = hs.arm().unwrap_err();
        assert!(matches!(err, SolError::MissedEdge { .. }));
        assert_eq!(hs.state(), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn full_protocol_cycle() {
        let hs = handshake();
        hs.arm().unwrap();
        assert_eq!(hs.signals().ready.read(), 1);
        assert_eq!(hs.state(), HandshakeState::WaitingInjection);

        hs.signals().injected.apply_update(1);
        hs.await_start(Duration::from_secs(1)).await.unwrap();
        assert_eq!(hs.signals().ready.read(), 0);
        assert_eq!(hs.state(), HandshakeState::WaitingDone);
        assert!(!hs.finish_is_done());

        hs.signals().done.apply_update(1);
        hs.await_finish(Duration::from_secs(1)).await.unwrap();
        assert!(hs.finish_is_done());

        hs.collect().await.unwrap();
        assert_eq!(hs.state(), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn collect_rejected_before_finish() {
        let hs = handshake();
        hs.arm().unwrap();
        hs.signals().injected.apply_update(1);
        hs.await_start(Duration::from_secs(1)).await.unwrap();
        let err = hs.collect().await.unwrap_err();
        assert!(matches!(err, SolError::HandshakeState { .. }));
    }

    #[tokio::test]
    async fn bypass_forces_matching_wait_only() {
        let hs = handshake();
        hs.stage();
        hs.arm().unwrap();

        // A finish-bypass while waiting for injection must be discarded.
        hs.signals().bypass.write(2).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!hs.finish_is_done());
        assert_eq!(hs.state(), HandshakeState::WaitingInjection);

        // An injection-bypass in the matching state releases await_start.
        hs.signals().bypass.write(1).unwrap();
        hs.await_start(Duration::from_secs(1)).await.unwrap();
        assert_eq!(hs.state(), HandshakeState::WaitingDone);

        // Bypass channel auto-resets for the next request.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hs.signals().bypass.read(), 0);

        hs.signals().bypass.write(2).unwrap();
        hs.await_finish(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unstage_wakes_pending_waiters() {
        let hs = handshake();
        hs.arm().unwrap();
        let waiter = hs.clone();
        let join =
            tokio::spawn(async move { waiter.await_start(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        hs.unstage().unwrap();
        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, SolError::StatusCancelled { .. }));
        assert_eq!(hs.state(), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn export_reader_parses_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[LC Chromatogram(Detector A-Ch1)]").unwrap();
        writeln!(file, "R.Time (min)\tIntensity").unwrap();
        writeln!(file, "0.0000\t12").unwrap();
        writeln!(file, "0.0167\t15").unwrap();
        writeln!(file, "[Sample Information]").unwrap();
        writeln!(file, "Sample Name\tlysozyme").unwrap();

        let reader = TabularExportReader;
        let data = reader.read_export(file.path()).await.unwrap();
        let trace = &data.sections["LC Chromatogram(Detector A-Ch1)"];
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[1], (0.0167, 15.0));
        // The text-only section parses to an empty trace.
        assert!(data.sections["Sample Information"].is_empty());
    }
}
