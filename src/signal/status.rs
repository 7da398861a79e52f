//! Edge-triggered completion statuses.
//!
//! A [`TransitionStatus`] is a single-completion object bound to one
//! old-value → new-value transition on a [`SoftSignal`]. It completes exactly
//! once, stays queryable afterwards, and supports a bounded blocking wait
//! that leaves the status pending on timeout so the caller can retry.
//!
//! Completion is edge-triggered: a steady level does not satisfy the status,
//! only an observed transition does. What happens when the signal is
//! *already* at the target value at bind time is governed by [`EdgePolicy`]:
//!
//! - [`EdgePolicy::StrictEdge`] (default): binding fails fast with
//!   `MissedEdge`, forcing the caller to decide whether the level is stale.
//! - [`EdgePolicy::EdgeOrLevel`]: the status completes immediately.
//!
//! The handshake protocol binds its statuses before raising the ready flag,
//! so under strict-edge semantics the monitored edge can never predate the
//! bind. Manual bypass uses [`TransitionStatus::force_complete`], which is
//! policy-independent by design of the protocol, not of this type.

use crate::error::{SolError, SolResult};
use crate::signal::{SignalValue, SoftSignal};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Policy for a status bound while the signal already reads the target value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgePolicy {
    /// Only an observed transition counts; binding onto a matching level
    /// fails with `MissedEdge`.
    #[default]
    StrictEdge,
    /// A matching level at bind time completes the status immediately.
    EdgeOrLevel,
}

/// Lifecycle of a transition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusState {
    Pending,
    Complete,
    Cancelled,
}

struct StatusInner {
    address: String,
    state_tx: watch::Sender<StatusState>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl StatusInner {
    fn new(address: String) -> Self {
        let (state_tx, _) = watch::channel(StatusState::Pending);
        Self {
            address,
            state_tx,
            completed_at: Mutex::new(None),
        }
    }

    /// Transition to Complete exactly once; later calls are no-ops.
    fn complete(&self) {
        let Ok(mut at) = self.completed_at.lock() else {
            return;
        };
        if at.is_none() && *self.state_tx.borrow() == StatusState::Pending {
            *at = Some(Utc::now());
            self.state_tx.send_replace(StatusState::Complete);
        }
    }

    fn cancel(&self) {
        let Ok(at) = self.completed_at.lock() else {
            return;
        };
        if at.is_none() && *self.state_tx.borrow() == StatusState::Pending {
            self.state_tx.send_replace(StatusState::Cancelled);
        }
    }
}

/// Single-completion status bound to one monitored signal transition.
///
/// Cheap to clone; clones share completion state, so the acquisition loop
/// can poll `is_done` while another task blocks in `wait`.
pub struct TransitionStatus {
    inner: Arc<StatusInner>,
    monitor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for TransitionStatus {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            monitor: Arc::clone(&self.monitor),
        }
    }
}

impl std::fmt::Debug for TransitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionStatus")
            .field("address", &self.inner.address)
            .field("state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

impl TransitionStatus {
    /// Bind a status to the `from` → `to` transition of a signal.
    ///
    /// Spawns a monitor that watches the signal and completes the status on
    /// the first matching edge; the monitor stops afterwards, so a repeated
    /// matching transition cannot re-fire anything.
    pub fn bind<T: SignalValue>(
        signal: &SoftSignal<T>,
        from: T,
        to: T,
        policy: EdgePolicy,
    ) -> SolResult<Self> {
        let mut rx = signal.subscribe();
        let current = rx.borrow().clone();
        let inner = Arc::new(StatusInner::new(signal.address().to_string()));

        if current == to {
            return match policy {
                EdgePolicy::EdgeOrLevel => {
                    inner.complete();
                    Ok(Self {
                        inner,
                        monitor: Arc::new(Mutex::new(None)),
                    })
                }
                EdgePolicy::StrictEdge => Err(SolError::MissedEdge {
                    address: signal.address().to_string(),
                }),
            };
        }

        let watcher = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut prev = current;
            while rx.changed().await.is_ok() {
                let cur = rx.borrow().clone();
                if prev == from && cur == to {
                    watcher.complete();
                    break;
                }
                prev = cur;
            }
        });

        Ok(Self {
            inner,
            monitor: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Address of the monitored channel.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Whether the transition has been observed (or forced).
    ///
    /// Idempotent; keeps answering `true` after completion.
    pub fn is_done(&self) -> bool {
        *self.inner.state_tx.borrow() == StatusState::Complete
    }

    /// When the status completed, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.completed_at.lock().ok().and_then(|at| *at)
    }

    /// Block the calling task until the transition occurs or the timeout
    /// elapses.
    ///
    /// On timeout the status is left pending and the caller may retry. A
    /// cancelled status fails with `StatusCancelled` rather than hanging.
    pub async fn wait(&self, timeout: Duration) -> SolResult<()> {
        let mut rx = self.inner.state_tx.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s != StatusState::Pending)
                .await
                .map(|s| *s)
        })
        .await;

        match outcome {
            Ok(Ok(StatusState::Complete)) => Ok(()),
            Ok(_) => Err(SolError::StatusCancelled {
                address: self.inner.address.clone(),
            }),
            Err(_) => Err(SolError::AwaitTimeout {
                address: self.inner.address.clone(),
            }),
        }
    }

    /// Force the status complete, regardless of the monitored signal.
    ///
    /// This is the bypass path: an operator decides the external transition
    /// happened (or does not matter) and releases whoever is waiting.
    pub fn force_complete(&self) {
        self.inner.complete();
        self.stop_monitor();
    }

    /// Cancel a pending status, waking any waiter with `StatusCancelled`.
    ///
    /// A status that already completed stays completed.
    pub fn cancel(&self) {
        self.inner.cancel();
        self.stop_monitor();
    }

    fn stop_monitor(&self) {
        if let Ok(mut guard) = self.monitor.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
