//! Sweep and processing workers
//!
//! Both workers drive the device one operation at a time through the
//! [`Coordinator`]: arm, send the request, then poll on a fixed tick until a
//! terminal status arrives or the tick budget runs out. Failures go through
//! [`RetryPolicy`]; exhausting it skips the cell instead of stalling.
//!
//! Cancellation is cooperative. Every wait (poll tick, retry delay, user
//! prompt) also watches the worker's [`CancellationToken`].

pub mod measurement;
pub mod processing;

pub use measurement::{MeasurementWorker, SweepPlan};
pub use processing::{ProcessingMode, ProcessingWorker};

use chrono::Utc;
use rmc_common::config::RmcConfig;
use rmc_common::events::{
    EventBus, FinishReason, PromptKind, QualityAction, RmcEvent, WorkerKind,
};
use rmc_common::MeasurementKey;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coordinator::{Coordinator, Signal};
use crate::device::MeasurementDevice;
use crate::metrics::MetricsEvaluator;
use crate::playback::MediaPlayer;

/// Input the UI sends to a suspended worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Continue after the reposition prompt
    Resume,
    /// Answer to a quality-gate prompt
    Decision(QualityAction),
}

/// Observable worker progress, served by `GET /session`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub session_id: Option<Uuid>,
    pub kind: Option<WorkerKind>,
    pub running: bool,
    /// Prompt the worker is suspended on
    pub prompt: Option<PromptKind>,
    pub current_key: Option<MeasurementKey>,
    pub position: u32,
    pub channel_index: usize,
    pub re_idx: usize,
    pub total_pairs: usize,
    pub retry_count: u32,
    /// Processing worker: channel being processed
    pub current_channel: Option<String>,
}

/// Snapshot shared between a worker and the session controller
pub type SharedSnapshot = Arc<RwLock<WorkerSnapshot>>;

/// Apply `f` to the shared snapshot
pub fn update_snapshot(snapshot: &SharedSnapshot, f: impl FnOnce(&mut WorkerSnapshot)) {
    let mut guard = snapshot.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

/// Collaborators and settings a worker runs with
#[derive(Clone)]
pub struct WorkerContext {
    pub session_id: Uuid,
    pub device: Arc<dyn MeasurementDevice>,
    pub player: Arc<dyn MediaPlayer>,
    pub evaluator: Arc<dyn MetricsEvaluator>,
    pub coordinator: Arc<Coordinator>,
    pub events: EventBus,
    pub config: Arc<RmcConfig>,
    pub cancel: CancellationToken,
    pub snapshot: SharedSnapshot,
}

impl WorkerContext {
    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(session_id = %self.session_id, "{}", message);
        self.events.emit_lossy(RmcEvent::status(message));
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(session_id = %self.session_id, "{}", message);
        self.events.emit_lossy(RmcEvent::warning(message));
    }

    /// Sleep unless cancelled first; returns false on cancellation
    pub async fn pause(&self, duration: Duration) -> bool {
        sleep_or_cancel(duration, &self.cancel).await
    }
}

/// Emit the end-of-run events for a worker
///
/// Early termination also raises a terminal notice for the UI.
pub fn report_finished(ctx: &WorkerContext, kind: WorkerKind, reason: FinishReason) {
    if reason.is_terminal_notice() {
        let (title, message) = match reason {
            FinishReason::Stopped => (
                "Measurement stopped",
                "The sweep was stopped at a quality prompt.",
            ),
            FinishReason::Aborted => ("Measurement aborted", "The operation was aborted."),
            _ => ("Measurement failed", "The operation could not continue."),
        };
        ctx.events.emit_lossy(RmcEvent::error_notice(title, message));
    }
    ctx.events.emit_lossy(RmcEvent::WorkerFinished {
        session_id: ctx.session_id,
        kind,
        reason,
        timestamp: Utc::now(),
    });
}

/// How an armed operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Signaled(Signal),
    Cancelled,
}

/// Poll `coordinator` every `tick` until signaled, cancelled, or `max_ticks`
/// ticks have elapsed, in which case the period resolves to TIMEOUT
pub async fn wait_for_signal(
    coordinator: &Coordinator,
    tick: Duration,
    max_ticks: u32,
    cancel: &CancellationToken,
) -> PollOutcome {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for _ in 0..max_ticks {
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = interval.tick() => {}
        }
        if let Some(signal) = coordinator.poll() {
            return PollOutcome::Signaled(signal);
        }
    }
    PollOutcome::Signaled(coordinator.trigger_timeout())
}

/// Sleep for `duration`; returns false if `cancel` fired first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; carries the new retry count
    Retry(u32),
    /// Give up on this cell
    Skip,
}

/// Bounded retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn next(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry(retry_count + 1)
        } else {
            RetryDecision::Skip
        }
    }

    /// Attempts made before a cell is skipped
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinatorKey, CoordinatorStatus};

    #[test]
    fn test_retry_policy_bound() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.next(0), RetryDecision::Retry(1));
        assert_eq!(policy.next(2), RetryDecision::Retry(3));
        assert_eq!(policy.next(3), RetryDecision::Skip);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_after_tick_budget() {
        let coordinator = Coordinator::new();
        coordinator.reset(CoordinatorKey::capture(MeasurementKey::new("FL", 0)));
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let outcome =
            wait_for_signal(&coordinator, Duration::from_millis(200), 1500, &cancel).await;

        match outcome {
            PollOutcome::Signaled(signal) => assert_eq!(signal.status, CoordinatorStatus::Timeout),
            other => panic!("Unexpected outcome: {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_observes_signal_on_next_tick() {
        let coordinator = Arc::new(Coordinator::new());
        coordinator.reset(CoordinatorKey::capture(MeasurementKey::new("FL", 0)));
        let cancel = CancellationToken::new();

        let signaller = Arc::clone(&coordinator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            signaller.signal(CoordinatorStatus::Success, None);
        });

        let start = tokio::time::Instant::now();
        let outcome =
            wait_for_signal(&coordinator, Duration::from_millis(200), 1500, &cancel).await;
        assert!(matches!(
            outcome,
            PollOutcome::Signaled(ref s) if s.status == CoordinatorStatus::Success
        ));
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let coordinator = Coordinator::new();
        coordinator.reset(CoordinatorKey::capture(MeasurementKey::new("FL", 0)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome =
            wait_for_signal(&coordinator, Duration::from_millis(200), 1500, &cancel).await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
