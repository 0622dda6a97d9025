//! Measurement sweep worker
//!
//! Normal mode visits the (position x channel) grid channel-minor: every
//! channel at position 0, then every channel at position 1, and so on.
//! Repeat mode walks a fixed list of [`RemeasurePair`]s with a pointer
//! (`re_idx`); the list itself is never modified.
//!
//! The worker suspends at two points and waits for a [`WorkerCommand`]:
//! before each new microphone position, and (when enabled) after a capture
//! rated CAUTION or RETAKE. While suspended it does no polling.

use chrono::Utc;
use rmc_common::events::{
    FinishReason, PromptKind, QualityAction, QualityPromptInfo, RmcEvent, WorkerKind,
};
use rmc_common::{MeasurementKey, QualityResult, RemeasurePair};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{
    report_finished, update_snapshot, wait_for_signal, PollOutcome, RetryDecision, RetryPolicy,
    WorkerCommand, WorkerContext,
};
use crate::coordinator::{CoordinatorKey, CoordinatorStatus};
use crate::error::Error;
use crate::playback::find_sweep_file;
use crate::quality::QualityTable;

/// What a measurement worker runs through
#[derive(Debug, Clone)]
pub enum SweepPlan {
    /// Every channel at every position
    Grid {
        channels: Vec<String>,
        num_positions: u32,
    },
    /// Retake of selected cells
    Repeat { pairs: Arc<[RemeasurePair]> },
}

/// Sweep progress, owned by the worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepState {
    pub channels: Vec<String>,
    pub num_positions: u32,
    pub current_position: u32,
    pub channel_index: usize,
    pub running: bool,
    pub repeat_mode: bool,
    pub retry_count: u32,
    pub re_idx: usize,
}

/// Result of working one cell
enum CellOutcome {
    /// Captured (with or without a quality entry); move on
    Advance,
    /// Retries exhausted; move on
    Skipped,
    /// Quality gate asked for the same cell again
    Remeasure,
    Finish(FinishReason),
}

pub struct MeasurementWorker {
    ctx: WorkerContext,
    pairs: Arc<[RemeasurePair]>,
    state: SweepState,
    policy: RetryPolicy,
    qualities: QualityTable,
    commands: mpsc::Receiver<WorkerCommand>,
}

impl MeasurementWorker {
    pub fn new(
        ctx: WorkerContext,
        plan: SweepPlan,
        qualities: QualityTable,
        commands: mpsc::Receiver<WorkerCommand>,
    ) -> Self {
        let policy = RetryPolicy::new(ctx.config.sweep.max_retries);
        let (state, pairs) = match plan {
            SweepPlan::Grid {
                channels,
                num_positions,
            } => (
                SweepState {
                    channels,
                    num_positions,
                    ..SweepState::default()
                },
                Arc::from(Vec::new()),
            ),
            SweepPlan::Repeat { pairs } => (
                SweepState {
                    repeat_mode: true,
                    ..SweepState::default()
                },
                pairs,
            ),
        };

        Self {
            ctx,
            pairs,
            state,
            policy,
            qualities,
            commands,
        }
    }

    pub fn kind(&self) -> WorkerKind {
        if self.state.repeat_mode {
            WorkerKind::Repeat
        } else {
            WorkerKind::Sweep
        }
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }

    /// Pairs driving repeat mode (empty in normal mode)
    pub fn pairs(&self) -> &[RemeasurePair] {
        &self.pairs
    }

    /// Run to completion, stop, abort, or failure
    pub async fn run(&mut self) -> FinishReason {
        self.state.running = true;
        self.publish();

        let reason = if self.state.repeat_mode {
            self.run_repeat().await
        } else {
            self.run_grid().await
        };

        self.state.running = false;
        self.ctx.coordinator.disarm();
        self.publish();
        update_snapshot(&self.ctx.snapshot, |s| s.prompt = None);
        report_finished(&self.ctx, self.kind(), reason);
        reason
    }

    fn publish(&self) {
        let state = &self.state;
        let total_pairs = self.pairs.len();
        let current_key = self.current_key();
        update_snapshot(&self.ctx.snapshot, |s| {
            s.running = state.running;
            s.position = state.current_position;
            s.channel_index = state.channel_index;
            s.re_idx = state.re_idx;
            s.total_pairs = total_pairs;
            s.retry_count = state.retry_count;
            s.current_key = current_key;
        });
    }

    fn current_key(&self) -> Option<MeasurementKey> {
        self.state
            .channels
            .get(self.state.channel_index)
            .map(|channel| MeasurementKey::new(channel.clone(), self.state.current_position))
    }

    async fn run_grid(&mut self) -> FinishReason {
        // The initial listing doubles as a connectivity check
        match self.ctx.device.get_all_measurements().await {
            Ok(listing) => debug!("Device holds {} measurements", listing.len()),
            Err(e) => {
                error!("Initial measurement listing failed: {}", e);
                self.ctx.status("Failed to connect to the measurement device.");
                return FinishReason::Failed;
            }
        }

        if self.state.channels.is_empty() || self.state.num_positions == 0 {
            self.ctx.status("Nothing to measure.");
            return FinishReason::Completed;
        }

        if self.ctx.config.sweep.prompt_first_position && !self.await_position(0).await {
            return FinishReason::Aborted;
        }

        while self.state.current_position < self.state.num_positions {
            if self.ctx.cancel.is_cancelled() {
                return FinishReason::Aborted;
            }

            let Some(key) = self.current_key() else {
                break;
            };
            match self.measure_cell(&key, None).await {
                CellOutcome::Advance | CellOutcome::Skipped => {}
                CellOutcome::Remeasure => continue,
                CellOutcome::Finish(reason) => return reason,
            }

            self.state.retry_count = 0;
            self.state.channel_index += 1;
            if self.state.channel_index >= self.state.channels.len() {
                self.state.channel_index = 0;
                self.state.current_position += 1;
                self.publish();
                if self.state.current_position < self.state.num_positions
                    && !self.await_position(self.state.current_position).await
                {
                    return FinishReason::Aborted;
                }
            }
            self.publish();
        }

        self.ctx.status("All samples complete!");
        FinishReason::Completed
    }

    async fn run_repeat(&mut self) -> FinishReason {
        while self.state.re_idx < self.pairs.len() {
            if self.ctx.cancel.is_cancelled() {
                return FinishReason::Aborted;
            }

            let pair = self.pairs[self.state.re_idx].clone();
            self.state.channels = vec![pair.channel.clone()];
            self.state.current_position = pair.position;
            self.state.channel_index = 0;
            self.state.retry_count = 0;
            self.publish();

            if !self.await_position(pair.position).await {
                return FinishReason::Aborted;
            }

            // No quality gate here, so a cell never asks to be remeasured
            let key = pair.key();
            if let CellOutcome::Finish(reason) = self
                .measure_cell(&key, pair.previous_artifact_id.as_deref())
                .await
            {
                return reason;
            }

            self.state.re_idx += 1;
            self.publish();
        }

        self.ctx.status("All remeasurements complete!");
        FinishReason::Completed
    }

    /// Stimulus file for `channel`
    ///
    /// `Ok(None)` when no stimulus directory is configured; the device then
    /// plays its own sweep.
    fn stimulus_for(&self, channel: &str) -> Result<Option<PathBuf>, Error> {
        match self.ctx.config.playback.stimulus_dir.as_deref() {
            None => Ok(None),
            Some(dir) => find_sweep_file(dir, channel)
                .map(Some)
                .ok_or_else(|| Error::StimulusMissing(channel.to_string())),
        }
    }

    fn stimulus_abort(&self, reason: &str) -> CellOutcome {
        error!("Stopping sweep: {}", reason);
        self.ctx.status("Measurement aborted: stimulus file not loaded.");
        self.ctx.events.emit_lossy(RmcEvent::error_notice(
            "Measurement aborted",
            "Load the sweep stimulus and try again.",
        ));
        CellOutcome::Finish(FinishReason::Failed)
    }

    /// Capture one cell, retrying per policy
    async fn measure_cell(&mut self, key: &MeasurementKey, previous: Option<&str>) -> CellOutcome {
        let stimulus = match self.stimulus_for(key.channel()) {
            Ok(stimulus) => stimulus,
            Err(e) => return self.stimulus_abort(&e.to_string()),
        };
        let verb = if self.state.repeat_mode {
            "Remeasuring"
        } else {
            "Starting measurement for"
        };

        loop {
            if self.ctx.cancel.is_cancelled() {
                return CellOutcome::Finish(FinishReason::Aborted);
            }
            self.publish();

            let retry_msg = if self.state.retry_count > 0 {
                format!(" (Retry {}/{})", self.state.retry_count, self.policy.max_retries)
            } else {
                String::new()
            };
            self.ctx.status(format!("{} {}{}...", verb, key, retry_msg));
            self.ctx.events.emit_lossy(RmcEvent::CaptureStarted {
                session_id: self.ctx.session_id,
                key: key.clone(),
                retry: self.state.retry_count,
                timestamp: Utc::now(),
            });

            self.ctx.coordinator.reset(CoordinatorKey::capture(key.clone()));
            let failure = match self.ctx.device.start_capture(key).await {
                Err(source) => {
                    let err = Error::CaptureStart {
                        key: key.to_string(),
                        source,
                    };
                    warn!("{}", err);
                    self.ctx.status(format!("Failed to start capture for {}", key));
                    err.to_string()
                }
                Ok(()) => {
                    if let Some(file) = stimulus.as_deref() {
                        if let Err(e) = self.ctx.player.play(file, Box::new(|| {})) {
                            warn!("Stimulus playback failed for {}: {}", key, e);
                        }
                    }

                    let sweep = &self.ctx.config.sweep;
                    let outcome = wait_for_signal(
                        &self.ctx.coordinator,
                        sweep.poll_tick(),
                        sweep.timeout_ticks,
                        &self.ctx.cancel,
                    )
                    .await;

                    let signal = match outcome {
                        PollOutcome::Cancelled => return CellOutcome::Finish(FinishReason::Aborted),
                        PollOutcome::Signaled(signal) => signal,
                    };
                    let message = signal.message.unwrap_or_default();
                    match signal.status {
                        CoordinatorStatus::Success => return self.on_success(key, previous).await,
                        CoordinatorStatus::Error => Error::CoordinatorError {
                            key: key.to_string(),
                            message,
                        }
                        .to_string(),
                        CoordinatorStatus::Abort => {
                            Error::CoordinatorAbort(key.to_string()).to_string()
                        }
                        CoordinatorStatus::Timeout | CoordinatorStatus::Armed => {
                            Error::CoordinatorTimeout(key.to_string()).to_string()
                        }
                    }
                }
            };

            self.ctx.player.stop();
            if failure.to_lowercase().contains("stimulus") {
                return self.stimulus_abort(&failure);
            }
            self.ctx.status(format!("Error: {}", failure));

            match self.policy.next(self.state.retry_count) {
                RetryDecision::Retry(count) => {
                    self.state.retry_count = count;
                    self.ctx.status(format!(
                        "Retrying {} ({}/{})...",
                        key, count, self.policy.max_retries
                    ));
                    if !self.ctx.pause(self.ctx.config.sweep.retry_delay()).await {
                        return CellOutcome::Finish(FinishReason::Aborted);
                    }
                }
                RetryDecision::Skip => {
                    let err = Error::RetryExhausted {
                        key: key.clone(),
                        attempts: self.policy.max_attempts(),
                    };
                    self.ctx
                        .warning(format!("Max retries reached for {}, skipping...", key));
                    self.ctx.events.emit_lossy(RmcEvent::CellSkipped {
                        session_id: self.ctx.session_id,
                        key: key.clone(),
                        reason: err.to_string(),
                        timestamp: Utc::now(),
                    });
                    self.state.retry_count = 0;
                    if !self.ctx.pause(self.ctx.config.sweep.skip_delay()).await {
                        return CellOutcome::Finish(FinishReason::Aborted);
                    }
                    return CellOutcome::Skipped;
                }
            }
        }
    }

    async fn advance_after_delay(&self) -> CellOutcome {
        if self.ctx.pause(self.ctx.config.sweep.advance_delay()).await {
            CellOutcome::Advance
        } else {
            CellOutcome::Finish(FinishReason::Aborted)
        }
    }

    async fn on_success(&mut self, key: &MeasurementKey, previous: Option<&str>) -> CellOutcome {
        self.ctx.status(format!("Completed {}", key));

        let artifact_id = match self.ctx.device.latest_measurement_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!("No artifact id for {}: {}", key, e);
                self.ctx.status("No measurement UUID found for evaluation.");
                return self.advance_after_delay().await;
            }
        };

        let evaluation = match self.ctx.evaluator.evaluate(&artifact_id).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!("Evaluation of {} failed: {}", artifact_id, e);
                self.ctx.status(format!("Error evaluating metrics: {}", e));
                return self.advance_after_delay().await;
            }
        };

        let result = QualityResult {
            key: key.clone(),
            rating: evaluation.rating,
            score: evaluation.score,
            detail: evaluation.detail,
            artifact_id,
            verified: false,
        };
        self.ctx.status(format!(
            "{} rated {} (score {:.1})",
            key, result.rating, result.score
        ));
        self.ctx.events.emit_lossy(RmcEvent::MeasurementEvaluated {
            session_id: self.ctx.session_id,
            result: result.clone(),
            timestamp: Utc::now(),
        });

        if self.state.repeat_mode {
            if result.rating == rmc_common::Rating::Pass {
                self.qualities.remove(key).await;
                if let Some(old_id) = previous {
                    match self.ctx.device.delete_measurement(old_id).await {
                        Ok(()) => debug!("Deleted stale take {} for {}", old_id, key),
                        Err(e) => warn!("Failed to delete stale take {}: {}", old_id, e),
                    }
                }
            }
            self.qualities.insert(result).await;
            return self.advance_after_delay().await;
        }

        self.qualities.insert(result.clone()).await;

        if self.ctx.config.sweep.pause_on_quality_issue && result.rating.needs_attention() {
            match self.await_decision(&result).await {
                None => return CellOutcome::Finish(FinishReason::Aborted),
                Some(QualityAction::Remeasure) => {
                    self.ctx.status(format!("Discarding {} and measuring again", key));
                    if let Err(e) = self.ctx.device.delete_measurement(&result.artifact_id).await {
                        warn!("Failed to delete {}: {}", result.artifact_id, e);
                    }
                    self.qualities.remove(key).await;
                    self.state.retry_count = 0;
                    return CellOutcome::Remeasure;
                }
                Some(QualityAction::Stop) => {
                    self.ctx.status("Measurement stopped by user.");
                    return CellOutcome::Finish(FinishReason::Stopped);
                }
                Some(QualityAction::Continue) => {}
            }
        }

        self.advance_after_delay().await
    }

    /// Suspend for the reposition prompt; false if aborted
    async fn await_position(&mut self, position: u32) -> bool {
        self.ctx.status(format!(
            "Place the microphone at position {} and continue",
            position
        ));
        matches!(
            self.suspend(PromptKind::Position { position }).await,
            Some(WorkerCommand::Resume)
        )
    }

    /// Suspend for a quality-gate decision; `None` if aborted
    async fn await_decision(&mut self, result: &QualityResult) -> Option<QualityAction> {
        let info = QualityPromptInfo {
            channel: result.key.channel().to_string(),
            position: result.key.position(),
            rating: result.rating,
            score: result.score,
            detail: result.detail.clone(),
            artifact_id: result.artifact_id.clone(),
        };
        match self.suspend(PromptKind::Quality { info }).await {
            Some(WorkerCommand::Decision(action)) => Some(action),
            _ => None,
        }
    }

    async fn suspend(&mut self, prompt: PromptKind) -> Option<WorkerCommand> {
        let wants_decision = matches!(prompt, PromptKind::Quality { .. });
        update_snapshot(&self.ctx.snapshot, |s| s.prompt = Some(prompt.clone()));
        self.ctx.events.emit_lossy(RmcEvent::PromptRequested {
            session_id: self.ctx.session_id,
            prompt: prompt.clone(),
            timestamp: Utc::now(),
        });

        let cancel = self.ctx.cancel.clone();
        let command = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                command = self.commands.recv() => match command {
                    None => break None,
                    Some(WorkerCommand::Resume) if !wants_decision => {
                        break Some(WorkerCommand::Resume)
                    }
                    Some(WorkerCommand::Decision(action)) if wants_decision => {
                        break Some(WorkerCommand::Decision(action))
                    }
                    Some(other) => warn!("Ignoring {:?} while waiting on {:?}", other, prompt),
                },
            }
        };

        update_snapshot(&self.ctx.snapshot, |s| s.prompt = None);
        command
    }
}
