//! Session controller
//!
//! Owns the collaborators and the single-worker lock. At most one worker
//! (sweep, repeat, processing or RTA verification) runs at a time; start
//! requests while one is active fail with [`Error::Busy`].
//!
//! Suspended measurement workers are resumed through [`SessionController::resume`]
//! and [`SessionController::submit_decision`], which forward a
//! [`WorkerCommand`] over the worker's channel.

use chrono::Utc;
use rmc_common::config::RmcConfig;
use rmc_common::events::{EventBus, FinishReason, PromptKind, QualityAction, RmcEvent, WorkerKind};
use rmc_common::{MeasurementKey, QualityResult, RemeasurePair};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::device::MeasurementDevice;
use crate::error::{Error, Result};
use crate::metrics::MetricsEvaluator;
use crate::playback::MediaPlayer;
use crate::quality::QualityTable;
use crate::rta::{RtaCoordinator, RtaOutcome, RtaVerifier};
use crate::workers::{
    update_snapshot, MeasurementWorker, ProcessingMode, ProcessingWorker, SharedSnapshot,
    SweepPlan, WorkerCommand, WorkerContext, WorkerSnapshot,
};

/// Commands buffered per worker; the UI sends at most one per prompt
const COMMAND_BUFFER: usize = 4;

struct ActiveSession {
    id: Uuid,
    kind: WorkerKind,
    cancel: CancellationToken,
    commands: Option<mpsc::Sender<WorkerCommand>>,
    /// Taken by [`SessionController::abort`] while it waits for the worker
    handle: Option<JoinHandle<()>>,
    /// Set while an abort is in progress; the slot is then cleared only by
    /// the aborting call
    aborting: bool,
}

impl ActiveSession {
    fn new(
        id: Uuid,
        kind: WorkerKind,
        cancel: CancellationToken,
        commands: Option<mpsc::Sender<WorkerCommand>>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            kind,
            cancel,
            commands,
            handle: Some(handle),
            aborting: false,
        }
    }

    /// Still holds the lock: running, or being aborted
    fn is_active(&self) -> bool {
        self.aborting || self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

type ActiveSlot = Arc<Mutex<Option<ActiveSession>>>;

/// Clear the slot when a worker ends on its own
fn release(slot: &ActiveSlot, id: Uuid) {
    let mut active = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if active
        .as_ref()
        .is_some_and(|session| session.id == id && !session.aborting)
    {
        *active = None;
    }
}

pub struct SessionController {
    device: Arc<dyn MeasurementDevice>,
    player: Arc<dyn MediaPlayer>,
    evaluator: Arc<dyn MetricsEvaluator>,
    coordinator: Arc<Coordinator>,
    rta: Arc<RtaCoordinator>,
    events: EventBus,
    config: Arc<RmcConfig>,
    qualities: QualityTable,
    snapshot: SharedSnapshot,
    active: ActiveSlot,
}

impl SessionController {
    pub fn new(
        device: Arc<dyn MeasurementDevice>,
        player: Arc<dyn MediaPlayer>,
        evaluator: Arc<dyn MetricsEvaluator>,
        events: EventBus,
        config: Arc<RmcConfig>,
    ) -> Self {
        let rta = Arc::new(RtaCoordinator::new(config.rta.min_samples));
        Self {
            device,
            player,
            evaluator,
            coordinator: Arc::new(Coordinator::new()),
            rta,
            events,
            config,
            qualities: QualityTable::new(),
            snapshot: SharedSnapshot::default(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn rta(&self) -> Arc<RtaCoordinator> {
        Arc::clone(&self.rta)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &RmcConfig {
        &self.config
    }

    pub fn qualities(&self) -> &QualityTable {
        &self.qualities
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Kind of the worker holding the lock, if any
    pub fn active_kind(&self) -> Option<WorkerKind> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active
            .as_ref()
            .filter(|session| session.is_active())
            .map(|session| session.kind)
    }

    pub fn is_busy(&self) -> bool {
        self.active_kind().is_some()
    }

    /// Start a normal sweep over `channels` x `num_positions`
    pub fn start_sweep(&self, channels: Vec<String>, num_positions: u32) -> Result<Uuid> {
        validate_channels(&channels)?;
        if num_positions == 0 {
            return Err(rmc_common::Error::InvalidInput(
                "num_positions must be at least 1".to_string(),
            )
            .into());
        }

        let plan = SweepPlan::Grid {
            channels,
            num_positions,
        };
        self.spawn_measurement(WorkerKind::Sweep, plan)
    }

    /// Start repeat mode
    ///
    /// Without explicit pairs, every CAUTION/RETAKE entry of the quality
    /// table is retaken.
    pub async fn start_repeat(&self, pairs: Option<Vec<RemeasurePair>>) -> Result<Uuid> {
        let pairs = match pairs {
            Some(pairs) => pairs,
            None => self.qualities.retake_candidates().await,
        };
        if pairs.is_empty() {
            return Err(rmc_common::Error::InvalidInput(
                "No measurements selected for remeasurement".to_string(),
            )
            .into());
        }

        let plan = SweepPlan::Repeat {
            pairs: Arc::from(pairs),
        };
        self.spawn_measurement(WorkerKind::Repeat, plan)
    }

    pub fn start_processing(&self, channels: Vec<String>, mode: ProcessingMode) -> Result<Uuid> {
        validate_channels(&channels)?;

        let mut active = self.lock_idle()?;
        let (id, cancel) = self.prepare(WorkerKind::Processing);
        let mut worker = ProcessingWorker::new(self.context(id, cancel.clone()), channels, mode);

        let slot = Arc::clone(&self.active);
        let handle = tokio::spawn(async move {
            let reason = worker.run().await;
            info!(session_id = %id, ?reason, "Processing worker finished");
            release(&slot, id);
        });

        *active = Some(ActiveSession::new(id, WorkerKind::Processing, cancel, None, handle));
        Ok(id)
    }

    fn spawn_measurement(&self, kind: WorkerKind, plan: SweepPlan) -> Result<Uuid> {
        let mut active = self.lock_idle()?;
        let (id, cancel) = self.prepare(kind);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let mut worker = MeasurementWorker::new(
            self.context(id, cancel.clone()),
            plan,
            self.qualities.clone(),
            rx,
        );

        let slot = Arc::clone(&self.active);
        let handle = tokio::spawn(async move {
            let reason = worker.run().await;
            info!(session_id = %id, ?reason, "Measurement worker finished");
            release(&slot, id);
        });

        *active = Some(ActiveSession::new(id, kind, cancel, Some(tx), handle));
        Ok(id)
    }

    /// Lock the slot, failing if a worker is still running
    fn lock_idle(&self) -> Result<std::sync::MutexGuard<'_, Option<ActiveSession>>> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = active.as_ref() {
            if session.is_active() {
                return Err(Error::Busy(kind_label(session.kind).to_string()));
            }
        }
        Ok(active)
    }

    /// Fresh session id and token, with the snapshot reset for `kind`
    fn prepare(&self, kind: WorkerKind) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        update_snapshot(&self.snapshot, |s| {
            *s = WorkerSnapshot {
                session_id: Some(id),
                kind: Some(kind),
                running: true,
                ..WorkerSnapshot::default()
            };
        });
        info!(session_id = %id, kind = kind_label(kind), "Session started");
        (id, CancellationToken::new())
    }

    fn context(&self, session_id: Uuid, cancel: CancellationToken) -> WorkerContext {
        WorkerContext {
            session_id,
            device: Arc::clone(&self.device),
            player: Arc::clone(&self.player),
            evaluator: Arc::clone(&self.evaluator),
            coordinator: Arc::clone(&self.coordinator),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
            cancel,
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    /// Continue after a reposition prompt
    pub async fn resume(&self) -> Result<()> {
        match self.snapshot().prompt {
            Some(PromptKind::Position { .. }) => self.send_command(WorkerCommand::Resume).await,
            _ => Err(Error::InvalidState(
                "No position prompt is pending".to_string(),
            )),
        }
    }

    /// Answer a quality-gate prompt
    pub async fn submit_decision(&self, action: QualityAction) -> Result<()> {
        match self.snapshot().prompt {
            Some(PromptKind::Quality { .. }) => {
                self.send_command(WorkerCommand::Decision(action)).await
            }
            _ => Err(Error::InvalidState(
                "No quality decision is pending".to_string(),
            )),
        }
    }

    async fn send_command(&self, command: WorkerCommand) -> Result<()> {
        let sender = {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.as_ref().and_then(|session| session.commands.clone())
        };
        let sender =
            sender.ok_or_else(|| Error::InvalidState("No measurement is running".to_string()))?;
        sender
            .send(command)
            .await
            .map_err(|_| Error::InvalidState("The measurement has already finished".to_string()))
    }

    /// Abort the active worker
    ///
    /// The session keeps the lock until its worker has exited. The worker is
    /// cancelled first, then the device job is cancelled (repeated
    /// `cancel_repeats` times, errors only logged) and playback stopped.
    /// Returns false when nothing was running or another abort is already
    /// in progress.
    pub async fn abort(&self) -> bool {
        let (id, kind, handle) = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(session) = active.as_mut().filter(|session| session.is_active()) else {
                return false;
            };
            if session.aborting {
                return false;
            }
            session.aborting = true;
            session.cancel.cancel();
            (session.id, session.kind, session.handle.take())
        };

        info!(session_id = %id, "Aborting session");
        if kind != WorkerKind::RtaVerification {
            for attempt in 1..=self.config.sweep.cancel_repeats {
                if let Err(e) = self.device.cancel_capture().await {
                    warn!("Cancel request {} failed: {}", attempt, e);
                }
            }
        }
        self.player.stop();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(session_id = %id, "Worker task ended abnormally: {}", e);
            }
        }
        update_snapshot(&self.snapshot, |s| {
            if s.session_id == Some(id) {
                s.running = false;
                s.prompt = None;
            }
        });

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|session| session.id == id) {
            *active = None;
        }
        true
    }

    /// Run RTA verification for a stored quality entry
    ///
    /// Holds the session lock for the duration. A verified result replaces
    /// the table entry.
    pub async fn verify_rta(&self, channel: &str, position: u32) -> Result<RtaOutcome> {
        let key = MeasurementKey::new(channel, position);
        let initial: QualityResult = self.qualities.get(&key).await.ok_or_else(|| {
            rmc_common::Error::NotFound(format!("No quality entry for {}", key))
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut active = self.lock_idle()?;
            let (id, cancel) = self.prepare(WorkerKind::RtaVerification);
            let verifier = RtaVerifier::new(
                Arc::clone(&self.device),
                Arc::clone(&self.player),
                Arc::clone(&self.rta),
                self.events.clone(),
                self.config.rta.clone(),
                self.config.playback.stimulus_dir.clone(),
                self.config.server.webhook_url(),
            );
            let qualities = self.qualities.clone();
            let events = self.events.clone();
            let snapshot = Arc::clone(&self.snapshot);
            let slot = Arc::clone(&self.active);
            let task_cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let outcome = verifier.verify(initial, task_cancel.clone()).await;
                let reason = match &outcome {
                    Ok(outcome) => {
                        if outcome.verified {
                            qualities.insert(outcome.result.clone()).await;
                        }
                        FinishReason::Completed
                    }
                    Err(_) if task_cancel.is_cancelled() => FinishReason::Aborted,
                    Err(e) => {
                        warn!(session_id = %id, "RTA verification failed: {}", e);
                        events.emit_lossy(RmcEvent::error_notice(
                            "RTA verification failed",
                            e.to_string(),
                        ));
                        FinishReason::Failed
                    }
                };
                update_snapshot(&snapshot, |s| s.running = false);
                events.emit_lossy(RmcEvent::WorkerFinished {
                    session_id: id,
                    kind: WorkerKind::RtaVerification,
                    reason,
                    timestamp: Utc::now(),
                });
                release(&slot, id);
                let _ = tx.send(outcome);
            });

            *active = Some(ActiveSession::new(
                id,
                WorkerKind::RtaVerification,
                cancel,
                None,
                handle,
            ));
        }

        rx.await
            .map_err(|_| Error::CoordinatorAbort(format!("RTA verification of {}", key)))?
    }
}

fn kind_label(kind: WorkerKind) -> &'static str {
    match kind {
        WorkerKind::Sweep => "sweep",
        WorkerKind::Repeat => "repeat",
        WorkerKind::Processing => "processing",
        WorkerKind::RtaVerification => "RTA verification",
    }
}

/// Non-empty, no blanks, no duplicates
fn validate_channels(channels: &[String]) -> Result<()> {
    if channels.is_empty() {
        return Err(
            rmc_common::Error::InvalidInput("channels must not be empty".to_string()).into(),
        );
    }
    let mut seen = HashSet::new();
    for channel in channels {
        if channel.trim().is_empty() {
            return Err(rmc_common::Error::InvalidInput(
                "channel names must not be blank".to_string(),
            )
            .into());
        }
        if !seen.insert(channel.as_str()) {
            return Err(rmc_common::Error::InvalidInput(format!(
                "duplicate channel: {}",
                channel
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_channels() {
        assert!(validate_channels(&["FL".to_string(), "FR".to_string()]).is_ok());
        assert!(matches!(
            validate_channels(&[]),
            Err(Error::Common(rmc_common::Error::InvalidInput(_)))
        ));
        assert!(validate_channels(&["FL".to_string(), "FL".to_string()]).is_err());
        assert!(validate_channels(&[" ".to_string()]).is_err());
    }
}
