//! Hardware signal channels.
//!
//! Every physical I/O point (pump piston position, valve selector, drain
//! solenoid, interlock sensor, beam monitor) is represented by a
//! [`SoftSignal`]: an addressed, typed value with synchronous read/write and
//! multi-subscriber change notification via `tokio::sync::watch`.
//!
//! The device-communication transport is an external collaborator that
//! exposes get/put on named channels; it feeds hardware-side updates in
//! through [`SoftSignal::apply_update`] and forwards writes out by
//! subscribing to the signal. The sequencing code never sees the transport,
//! only the signal, so the whole stack runs unchanged against the simulated
//! rig in `hardware::mock`.
//!
//! Waiting on a signal condition is notification-driven, not sleep-polled:
//! [`wait_for`] subscribes, checks, and wakes on each transition, bounded by
//! a timeout ceiling.

pub mod status;

use crate::error::{SolError, SolResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Values a hardware channel can carry.
///
/// Blanket-implemented; discrete states use small enums, analog channels
/// use `f64`.
pub trait SignalValue: Clone + PartialEq + Send + Sync + fmt::Debug + 'static {}
impl<T: Clone + PartialEq + Send + Sync + fmt::Debug + 'static> SignalValue for T {}

/// Direction of a channel relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sensor/readback; only the hardware side updates it.
    ReadOnly,
    /// Command channel; only this process writes it.
    WriteOnly,
    /// Both (e.g. a setpoint with hardware-confirmed readback).
    ReadWrite,
}

/// An addressed, observable hardware channel.
///
/// Holds the last-known value in a watch channel; reads are synchronous and
/// never touch the wire. Writes go through a direction/connection check, and
/// hardware-side updates bypass it.
pub struct SoftSignal<T: SignalValue> {
    address: String,
    direction: Direction,
    tx: watch::Sender<T>,
    connected: AtomicBool,
    last_changed: Mutex<DateTime<Utc>>,
}

impl<T: SignalValue> fmt::Debug for SoftSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftSignal")
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("value", &*self.tx.borrow())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: SignalValue> SoftSignal<T> {
    /// Create a read/write channel with an initial last-known value.
    pub fn new(address: impl Into<String>, initial: T) -> Self {
        Self::with_direction(address, initial, Direction::ReadWrite)
    }

    /// Create a sensor channel this process never writes.
    pub fn read_only(address: impl Into<String>, initial: T) -> Self {
        Self::with_direction(address, initial, Direction::ReadOnly)
    }

    /// Create a channel with an explicit direction.
    pub fn with_direction(address: impl Into<String>, initial: T, direction: Direction) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            address: address.into(),
            direction,
            tx,
            connected: AtomicBool::new(true),
            last_changed: Mutex::new(Utc::now()),
        }
    }

    /// The channel address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Last-known value (synchronous, no wire traffic).
    pub fn read(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Write a new value, notifying all subscribers.
    ///
    /// Fails on read-only or disconnected channels. The transport layer, if
    /// any, observes the change through its own subscription.
    pub fn write(&self, value: T) -> SolResult<()> {
        if self.direction == Direction::ReadOnly {
            return Err(SolError::ChannelReadOnly {
                address: self.address.clone(),
            });
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(SolError::ChannelDisconnected {
                address: self.address.clone(),
            });
        }
        self.stamp();
        self.tx.send_replace(value);
        Ok(())
    }

    /// Hardware-side update (readback, sensor edge).
    ///
    /// Always allowed; transitions are delivered at-least-once with
    /// monotonically increasing timestamps, so repeated identical updates
    /// are harmless to edge detection (no value change, no edge).
    pub fn apply_update(&self, value: T) {
        self.stamp();
        self.tx.send_replace(value);
    }

    fn stamp(&self) {
        if let Ok(mut t) = self.last_changed.lock() {
            *t = Utc::now();
        }
    }

    /// Timestamp of the most recent value update.
    pub fn last_changed(&self) -> DateTime<Utc> {
        self.last_changed
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Utc::now())
    }

    /// Whether the underlying transport currently considers the channel live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Mark the channel connected/disconnected (transport side).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Subscribe to value changes.
    ///
    /// The receiver is the subscription handle; dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Invoke a callback on every observed transition, with old and new
    /// values. Returns a handle; dropping it (or calling
    /// [`Subscription::cancel`]) ends delivery.
    pub fn on_transition<F>(&self, mut f: F) -> Subscription
    where
        F: FnMut(&T, &T) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            let mut prev = rx.borrow().clone();
            while rx.changed().await.is_ok() {
                let cur = rx.borrow().clone();
                if cur != prev {
                    f(&prev, &cur);
                }
                prev = cur;
            }
        });
        Subscription { handle }
    }
}

/// Handle for an [`SoftSignal::on_transition`] subscription.
///
/// Cancels the delivery task when dropped.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivering transitions.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Block until a signal satisfies a predicate, with a timeout ceiling.
///
/// Checks the current value first, then wakes on each transition; the
/// calling task suspends without spinning. On expiry the wait fails with
/// [`SolError::HardwareTimeout`] naming the channel.
pub async fn wait_for<T, F>(
    signal: &SoftSignal<T>,
    timeout: Duration,
    mut pred: F,
) -> SolResult<()>
where
    T: SignalValue,
    F: FnMut(&T) -> bool,
{
    let mut rx = signal.subscribe();
    let satisfied = { pred(&rx.borrow()) };
    if satisfied {
        return Ok(());
    }

    let waited = tokio::time::timeout(timeout, async {
        while rx.changed().await.is_ok() {
            let ok = { pred(&rx.borrow()) };
            if ok {
                return true;
            }
        }
        false
    })
    .await;

    match waited {
        Ok(true) => Ok(()),
        // Sender dropped without the condition becoming true: the channel
        // owner went away, report as a timeout on that address.
        Ok(false) | Err(_) => Err(SolError::HardwareTimeout {
            what: signal.address().to_string(),
            waited_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn read_returns_last_known_value() {
        let sig = SoftSignal::new("sol:ctrl:valve_pos", 0u32);
        assert_eq!(sig.read(), 0);
        sig.write(2).unwrap();
        assert_eq!(sig.read(), 2);
    }

    #[test]
    fn read_only_channel_rejects_writes() {
        let sig = SoftSignal::read_only("sol:ctrl:holder_down", 1u32);
        assert!(matches!(
            sig.write(0),
            Err(SolError::ChannelReadOnly { .. })
        ));
        // The hardware side still updates it.
        sig.apply_update(0);
        assert_eq!(sig.read(), 0);
    }

    #[test]
    fn disconnected_channel_rejects_writes() {
        let sig = SoftSignal::new("sol:ctrl:pump_spd", 1500.0f64);
        sig.set_connected(false);
        assert!(matches!(
            sig.write(350.0),
            Err(SolError::ChannelDisconnected { .. })
        ));
    }

    #[tokio::test]
    async fn wait_for_wakes_on_transition() {
        let sig = Arc::new(SoftSignal::new("sol:ctrl:status", 1u32));
        let writer = sig.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.apply_update(0);
        });
        wait_for(&sig, Duration::from_secs(1), |v| *v == 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_times_out_with_channel_context() {
        let sig = SoftSignal::new("sol:ctrl:busy", 1u32);
        let err = wait_for(&sig, Duration::from_millis(20), |v| *v == 0)
            .await
            .unwrap_err();
        match err {
            SolError::HardwareTimeout { what, .. } => assert_eq!(what, "sol:ctrl:busy"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn on_transition_sees_old_and_new() {
        let sig = SoftSignal::new("hplc:injected", 0u32);
        let edges = Arc::new(AtomicU32::new(0));
        let seen = edges.clone();
        let _sub = sig.on_transition(move |old, new| {
            if *old == 0 && *new == 1 {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::task::yield_now().await;
        sig.apply_update(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(edges.load(Ordering::SeqCst), 1);
    }
}
