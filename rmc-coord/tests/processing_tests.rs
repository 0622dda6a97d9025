//! Processing worker pipeline against a scripted device

mod common;

use common::{drain, status_lines, test_config, Harness, ProcessCall, Reply};
use rmc_common::events::{FinishReason, RmcEvent};
use rmc_coord::coordinator::ProcessStage;
use rmc_coord::workers::{ProcessingMode, ProcessingWorker};
use std::sync::atomic::Ordering;

fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| c.to_string()).collect()
}

/// Listing with FL at positions 1 and 0 (out of order) and FR at 0
fn seeded_harness() -> Harness {
    let harness = Harness::new(vec![]);
    harness.device.add_measurement("fl1", "FL_pos1");
    harness.device.add_measurement("fl0", "FL_pos0");
    harness.device.add_measurement("fr0", "FR_pos0");
    harness.device.add_measurement("imported", "Living room");
    harness
}

fn call(channel: &str, stage: ProcessStage, ids: &[&str]) -> ProcessCall {
    ProcessCall {
        channel: channel.to_string(),
        stage,
        ids: ids.iter().map(|id| id.to_string()).collect(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_mode_runs_both_stages_per_channel() {
    let harness = seeded_harness();
    let mut rx = harness.events.subscribe();

    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["FL", "FR"]),
        ProcessingMode::Full,
    );
    assert_eq!(worker.run().await, FinishReason::Completed);

    assert_eq!(
        harness.device.processes(),
        vec![
            call("FL", ProcessStage::CrossCorrAlign, &["fl0", "fl1"]),
            call("FL", ProcessStage::VectorAverage, &["fl0", "fl1"]),
            call("FR", ProcessStage::CrossCorrAlign, &["fr0"]),
            call("FR", ProcessStage::VectorAverage, &["fr0"]),
        ]
    );

    let renamed = harness.device.renamed();
    assert_eq!(renamed.len(), 2);
    assert_eq!(renamed[0].1, "FL_VectorAvg");
    assert_eq!(renamed[1].1, "FR_VectorAvg");

    let lines = status_lines(&drain(&mut rx));
    assert_eq!(lines.last().map(String::as_str), Some("All processing complete!"));
}

#[tokio::test(start_paused = true)]
async fn test_single_stage_modes() {
    let harness = seeded_harness();
    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["FR"]),
        ProcessingMode::CrossCorrOnly,
    );
    worker.run().await;
    assert_eq!(
        harness.device.processes(),
        vec![call("FR", ProcessStage::CrossCorrAlign, &["fr0"])]
    );
    assert!(harness.device.renamed().is_empty());

    let harness = seeded_harness();
    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["FR"]),
        ProcessingMode::VectorAvgOnly,
    );
    worker.run().await;
    assert_eq!(
        harness.device.processes(),
        vec![call("FR", ProcessStage::VectorAverage, &["fr0"])]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_alignment_still_averages() {
    let harness = seeded_harness();
    harness.device.script_process(
        "FR",
        ProcessStage::CrossCorrAlign,
        vec![Reply::Fail("bad".to_string()); 5],
    );
    let mut rx = harness.events.subscribe();

    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["FR"]),
        ProcessingMode::Full,
    );
    assert_eq!(worker.run().await, FinishReason::Completed);

    let stages: Vec<ProcessStage> = harness.device.processes().iter().map(|c| c.stage).collect();
    // 1 + 2 retries of alignment, then averaging
    assert_eq!(
        stages,
        vec![
            ProcessStage::CrossCorrAlign,
            ProcessStage::CrossCorrAlign,
            ProcessStage::CrossCorrAlign,
            ProcessStage::VectorAverage,
        ]
    );
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, RmcEvent::Warning { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_channel_without_captures_is_skipped() {
    let harness = seeded_harness();
    let mut rx = harness.events.subscribe();

    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["C", "FR"]),
        ProcessingMode::CrossCorrOnly,
    );
    assert_eq!(worker.run().await, FinishReason::Completed);

    assert_eq!(harness.device.processes().len(), 1);
    assert!(status_lines(&drain(&mut rx))
        .contains(&"No measurements found for C, skipping".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_rename_failure_does_not_abort() {
    let harness = seeded_harness();
    harness.device.rename_fails.store(true, Ordering::SeqCst);

    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["FL", "FR"]),
        ProcessingMode::VectorAvgOnly,
    );
    assert_eq!(worker.run().await, FinishReason::Completed);
    assert_eq!(harness.device.processes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_stage_aborts() {
    let harness = seeded_harness();
    harness
        .device
        .script_process("FL", ProcessStage::CrossCorrAlign, vec![Reply::Silent]);
    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        cancel.cancel();
    });

    let mut worker = ProcessingWorker::new(
        harness.context(test_config()),
        channels(&["FL", "FR"]),
        ProcessingMode::Full,
    );
    assert_eq!(worker.run().await, FinishReason::Aborted);
    assert_eq!(harness.device.processes().len(), 1);
}
