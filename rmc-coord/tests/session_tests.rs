//! Session lock, prompts and abort through the controller

mod common;

use common::{test_config, RecordingPlayer, Reply, ScriptedDevice, ScriptedEvaluator};
use rmc_common::config::RmcConfig;
use rmc_common::events::{EventBus, FinishReason, PromptKind, QualityAction, RmcEvent, WorkerKind};
use rmc_common::{MeasurementKey, QualityResult, Rating};
use rmc_coord::workers::ProcessingMode;
use rmc_coord::{Error, SessionController};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Fixture {
    device: Arc<ScriptedDevice>,
    player: Arc<RecordingPlayer>,
    session: SessionController,
    events: broadcast::Receiver<RmcEvent>,
}

fn fixture(config: RmcConfig) -> Fixture {
    let device = Arc::new(ScriptedDevice::new(Duration::from_secs(1)));
    let player = Arc::new(RecordingPlayer::new(None));
    let bus = EventBus::new(4096);
    let events = bus.subscribe();
    let session = SessionController::new(
        device.clone(),
        player.clone(),
        Arc::new(ScriptedEvaluator::new(vec![])),
        bus,
        Arc::new(config),
    );
    device.attach(session.coordinator());
    Fixture {
        device,
        player,
        session,
        events,
    }
}

/// Wait until the worker is suspended on a prompt
async fn wait_for_prompt(events: &mut broadcast::Receiver<RmcEvent>) -> PromptKind {
    loop {
        if let RmcEvent::PromptRequested { prompt, .. } = events.recv().await.unwrap() {
            return prompt;
        }
    }
}

async fn wait_for_finish(events: &mut broadcast::Receiver<RmcEvent>) -> FinishReason {
    loop {
        if let RmcEvent::WorkerFinished { reason, .. } = events.recv().await.unwrap() {
            return reason;
        }
    }
}

fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| c.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_validation() {
    let f = fixture(test_config());
    assert!(matches!(
        f.session.start_sweep(vec![], 2),
        Err(Error::Common(rmc_common::Error::InvalidInput(_)))
    ));
    assert!(f.session.start_sweep(channels(&["FL"]), 0).is_err());
    assert!(f.session.start_sweep(channels(&["FL", "FL"]), 1).is_err());
    assert!(f.session.start_repeat(None).await.is_err());
    assert!(!f.session.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected_while_running() {
    let mut config = test_config();
    config.sweep.prompt_first_position = true;
    let mut f = fixture(config);

    f.session.start_sweep(channels(&["FL"]), 1).unwrap();
    wait_for_prompt(&mut f.events).await;

    assert!(matches!(
        f.session.start_processing(channels(&["FL"]), ProcessingMode::Full),
        Err(Error::Busy(_))
    ));
    assert_eq!(f.session.active_kind(), Some(WorkerKind::Sweep));

    f.session.resume().await.unwrap();
    assert_eq!(wait_for_finish(&mut f.events).await, FinishReason::Completed);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!f.session.is_busy());
    assert_eq!(f.device.captures(), vec![MeasurementKey::new("FL", 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_commands_must_match_prompt() {
    let mut config = test_config();
    config.sweep.prompt_first_position = true;
    let mut f = fixture(config);

    assert!(matches!(f.session.resume().await, Err(Error::InvalidState(_))));

    f.session.start_sweep(channels(&["FL"]), 1).unwrap();
    assert_eq!(
        wait_for_prompt(&mut f.events).await,
        PromptKind::Position { position: 0 }
    );
    assert!(matches!(
        f.session.submit_decision(QualityAction::Continue).await,
        Err(Error::InvalidState(_))
    ));
    assert_eq!(
        f.session.snapshot().prompt,
        Some(PromptKind::Position { position: 0 })
    );
    f.session.abort().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_mid_suspension() {
    let mut config = test_config();
    config.sweep.prompt_first_position = true;
    let mut f = fixture(config);

    f.session.start_sweep(channels(&["FL", "FR"]), 2).unwrap();
    wait_for_prompt(&mut f.events).await;

    assert!(f.session.abort().await);
    assert_eq!(f.device.cancels.load(Ordering::SeqCst), 2);
    assert!(f.player.stops.load(Ordering::SeqCst) >= 1);
    assert_eq!(wait_for_finish(&mut f.events).await, FinishReason::Aborted);

    let snapshot = f.session.snapshot();
    assert!(!snapshot.running);
    assert!(snapshot.prompt.is_none());
    assert!(!f.session.is_busy());
    assert!(f.device.captures().is_empty());

    // Idle abort is a no-op
    assert!(!f.session.abort().await);
}

#[tokio::test(start_paused = true)]
async fn test_session_stays_locked_while_abort_waits_on_device() {
    let mut config = test_config();
    config.sweep.prompt_first_position = true;
    let mut f = fixture(config);
    f.device.cancel_delay_ms.store(3000, Ordering::SeqCst);

    let first = f.session.start_sweep(channels(&["FL"]), 1).unwrap();
    wait_for_prompt(&mut f.events).await;

    let (aborted, (busy, second_start, second_abort, snapshot)) = tokio::join!(
        f.session.abort(),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            (
                f.session.is_busy(),
                f.session.start_sweep(channels(&["FR"]), 1),
                f.session.abort().await,
                f.session.snapshot(),
            )
        }
    );

    assert!(aborted);
    assert!(busy);
    assert!(matches!(second_start, Err(Error::Busy(_))));
    assert!(!second_abort);
    // The worker stopped before the slow cancel acknowledgements came back
    assert_eq!(snapshot.session_id, Some(first));
    assert!(!snapshot.running);
    assert_eq!(wait_for_finish(&mut f.events).await, FinishReason::Aborted);
    assert_eq!(f.device.cancels.load(Ordering::SeqCst), 2);
    assert!(f.device.captures().is_empty());

    // Lock released only once the abort has returned
    assert!(!f.session.is_busy());
    let next = f.session.start_sweep(channels(&["FR"]), 1).unwrap();
    assert_eq!(
        wait_for_prompt(&mut f.events).await,
        PromptKind::Position { position: 0 }
    );
    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.session_id, Some(next));
    assert!(snapshot.running);
    f.session.abort().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_capture_poll() {
    let mut f = fixture(test_config());
    f.device
        .script_capture(MeasurementKey::new("FL", 0), vec![Reply::Silent]);

    f.session.start_sweep(channels(&["FL"]), 1).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(f.session.abort().await);
    assert_eq!(wait_for_finish(&mut f.events).await, FinishReason::Aborted);
    assert_eq!(f.device.captures().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_defaults_to_retake_candidates() {
    let mut f = fixture(test_config());
    for (channel, rating, id) in [("FL", Rating::Retake, "a"), ("FR", Rating::Pass, "b")] {
        f.session
            .qualities()
            .insert(QualityResult {
                key: MeasurementKey::new(channel, 0),
                rating,
                score: 10.0,
                detail: BTreeMap::new(),
                artifact_id: id.to_string(),
                verified: false,
            })
            .await;
    }

    f.session.start_repeat(None).await.unwrap();
    assert_eq!(
        wait_for_prompt(&mut f.events).await,
        PromptKind::Position { position: 0 }
    );
    f.session.resume().await.unwrap();
    assert_eq!(wait_for_finish(&mut f.events).await, FinishReason::Completed);

    assert_eq!(f.device.captures(), vec![MeasurementKey::new("FL", 0)]);
    assert_eq!(f.device.deleted(), vec!["a".to_string()]);
    assert!(f.session.qualities().retake_candidates().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_verify_rta_requires_quality_entry() {
    let f = fixture(test_config());
    let err = f.session.verify_rta("FL", 0).await.unwrap_err();
    assert!(matches!(err, Error::Common(rmc_common::Error::NotFound(_))));
}
