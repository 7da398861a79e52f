//! Integration tests for batch orchestration: pre-flight validation,
//! beam-fault retry semantics, the pause gate, and partial-progress
//! preservation.

mod common;

use common::{build_stack, fast_batch, GOOD_MONITOR};
use sol_daq::batch::BatchOrchestrator;
use sol_daq::error::SolError;
use sol_daq::hardware::capabilities::Movable;
use sol_daq::sample::{Needle, Sample};
use std::sync::Arc;
use std::time::Duration;

fn sample(name: &str, position: u32) -> Sample {
    Sample {
        name: name.into(),
        position,
        needle: None,
        volume: 45.0,
        exposure: 1.0,
        repeats: 3,
        buffer: None,
    }
}

fn orchestrator(stack: &common::TestStack) -> BatchOrchestrator {
    BatchOrchestrator::new(
        stack.sequencer.clone(),
        stack.watchdog.clone(),
        fast_batch(),
    )
}

#[tokio::test]
async fn alternating_parity_passes_concurrent_preflight() {
    let stack = build_stack();
    let mut cfg = fast_batch();
    cfg.concurrent_op = true;
    let orchestrator =
        BatchOrchestrator::new(stack.sequencer.clone(), stack.watchdog.clone(), cfg);

    // Tubes 2 and 3: upstream then downstream, a valid alternation.
    let samples = vec![sample("a", 2), sample("b", 3)];
    let outcome = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.runs.len(), 2);
}

#[tokio::test]
async fn same_parity_fails_preflight_before_any_motion() {
    let stack = build_stack();
    let mut cfg = fast_batch();
    cfg.concurrent_op = true;
    let orchestrator =
        BatchOrchestrator::new(stack.sequencer.clone(), stack.watchdog.clone(), cfg);

    // Tubes 2 and 4 both resolve to the upstream needle.
    let samples = vec![sample("a", 2), sample("b", 4)];
    let err = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap_err();
    assert!(matches!(err, SolError::Validation(_)));

    // Fail-fast: no hardware was touched.
    assert_eq!(stack.detector.trigger_count(), 0);
    assert_eq!(stack.holder_x.position().await.unwrap(), 0.0);
}

#[tokio::test]
async fn beam_fault_reruns_same_sample_exactly_once() {
    let stack = build_stack();
    let orchestrator = orchestrator(&stack);

    // Samples at tubes 2 and 3, three triggers each. The monitor drops on
    // trigger 4 (first exposure of sample "b") and recovers on trigger 7
    // (first exposure of the re-run), so "b" fails its post-acquisition
    // check exactly once.
    let beam = stack.beam.clone();
    stack.detector.set_trigger_hook(Box::new(move |n| {
        if n == 4 {
            beam.monitor_counts.apply_update(1_000.0);
        } else if n == 7 {
            beam.monitor_counts.apply_update(GOOD_MONITOR);
        }
    }));

    let samples = vec![sample("a", 2), sample("b", 3)];
    let outcome = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap();

    // One id per input sample, no partial credit and no skipped samples.
    assert!(outcome.is_complete());
    assert_eq!(outcome.runs.len(), 2);
    assert_eq!(outcome.runs[0].sample, "a");
    assert_eq!(outcome.runs[1].sample, "b");
    // Sample "b" ran twice: 3 + 3 + 3 triggers in total.
    assert_eq!(stack.detector.trigger_count(), 9);
}

#[tokio::test]
async fn bpm_drop_during_batch_invokes_realignment() {
    let stack = build_stack();
    let orchestrator = orchestrator(&stack);

    // BPM intensity collapses while sample "a" is being measured; the
    // beam re-check after the cycle must realign before the quality check.
    let beam = stack.beam.clone();
    stack.detector.set_trigger_hook(Box::new(move |n| {
        if n == 2 {
            beam.bpm_intensity.apply_update(1.0e-9);
        }
    }));

    let samples = vec![sample("a", 2)];
    let outcome = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(stack.realigner.call_count(), 1);
    // Realignment restored the diagnostics.
    assert!(stack.beam.bpm_intensity.read() >= 1.0e-7);
}

#[tokio::test]
async fn pause_gate_parks_and_resumes_at_sample_boundary() {
    let stack = build_stack();
    let orchestrator = orchestrator(&stack);

    stack.beam.pause_request.write(1).unwrap();

    // Operator side: release the pause shortly after it is acknowledged.
    let beam = stack.beam.clone();
    let releaser = tokio::spawn(async move {
        let mut rx = beam.pause_request.subscribe();
        loop {
            if *rx.borrow() == 2 {
                break;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        beam.pause_request.apply_update(0);
    });

    let samples = vec![sample("a", 2)];
    let outcome = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap();

    releaser.await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(stack.beam.pause_request.read(), 0);
}

#[tokio::test]
async fn interlock_failure_aborts_but_preserves_partial_progress() {
    let stack = build_stack();
    let orchestrator = orchestrator(&stack);

    // The holder-present sensor drops right after sample "b"'s last
    // exposure; its return step then violates the raise interlock.
    let ctrl = Arc::clone(&stack.ctrl);
    stack.detector.set_trigger_hook(Box::new(move |n| {
        if n == 6 {
            ctrl.holder_present.apply_update(0);
        }
    }));

    let samples = vec![sample("a", 2), sample("b", 3)];
    let outcome = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap();

    // Sample "a"'s id survives the abort.
    assert!(!outcome.is_complete());
    assert_eq!(outcome.runs.len(), 1);
    assert_eq!(outcome.runs[0].sample, "a");

    // The recorded error names the sample and the interlock.
    let err = &outcome.errors[0];
    assert_eq!(err.sample.as_deref(), Some("b"));
    let msg = err.error.to_string();
    assert!(msg.contains("'b'"));
    assert!(msg.contains("tube 3"));
    assert!(err.error.to_string().contains("Interlock"));
}

#[tokio::test]
async fn end_of_batch_force_washes_dirty_needles() {
    let stack = build_stack();
    let orchestrator = orchestrator(&stack);

    let samples = vec![sample("a", 2), sample("b", 3)];
    let outcome = orchestrator
        .run_holder(stack.detector.as_ref(), &samples)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert!(!stack.sequencer.is_dirty(Needle::Upstream));
    assert!(!stack.sequencer.is_dirty(Needle::Downstream));
}
