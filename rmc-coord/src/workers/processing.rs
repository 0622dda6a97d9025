//! Post-capture processing pipeline
//!
//! For every selected channel that has captures on the device, run
//! cross-correlation alignment and/or vector averaging as remote jobs, one at
//! a time, through the same arm/request/poll cycle the sweep uses.

use rmc_common::events::{FinishReason, WorkerKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{
    report_finished, update_snapshot, wait_for_signal, PollOutcome, RetryDecision, RetryPolicy,
    WorkerContext,
};
use crate::coordinator::{CoordinatorKey, CoordinatorStatus, ProcessStage};
use crate::device::channels_with_measurements;
use crate::error::Error;

/// Which stages run per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    CrossCorrOnly,
    VectorAvgOnly,
    #[default]
    Full,
}

impl ProcessingMode {
    pub fn stages(&self) -> &'static [ProcessStage] {
        match self {
            ProcessingMode::CrossCorrOnly => &[ProcessStage::CrossCorrAlign],
            ProcessingMode::VectorAvgOnly => &[ProcessStage::VectorAverage],
            ProcessingMode::Full => &[ProcessStage::CrossCorrAlign, ProcessStage::VectorAverage],
        }
    }
}

/// How one stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Done,
    Skipped,
    Aborted,
}

pub struct ProcessingWorker {
    ctx: WorkerContext,
    channels: Vec<String>,
    mode: ProcessingMode,
    policy: RetryPolicy,
}

impl ProcessingWorker {
    pub fn new(ctx: WorkerContext, channels: Vec<String>, mode: ProcessingMode) -> Self {
        let policy = RetryPolicy::new(ctx.config.processing.max_retries);
        Self {
            ctx,
            channels,
            mode,
            policy,
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub async fn run(&mut self) -> FinishReason {
        update_snapshot(&self.ctx.snapshot, |s| s.running = true);
        let reason = self.run_channels().await;

        self.ctx.coordinator.disarm();
        update_snapshot(&self.ctx.snapshot, |s| {
            s.running = false;
            s.current_channel = None;
        });
        report_finished(&self.ctx, WorkerKind::Processing, reason);
        reason
    }

    async fn run_channels(&mut self) -> FinishReason {
        let listing = match self.ctx.device.get_all_measurements().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Measurement listing failed: {}", e);
                self.ctx.status("Failed to connect to the measurement device.");
                return FinishReason::Failed;
            }
        };
        let mut grouped: BTreeMap<String, Vec<String>> =
            channels_with_measurements(&listing, &self.channels);

        for channel in self.channels.clone() {
            if self.ctx.cancel.is_cancelled() {
                return FinishReason::Aborted;
            }
            let Some(ids) = grouped.remove(&channel).filter(|ids| !ids.is_empty()) else {
                self.ctx
                    .status(format!("No measurements found for {}, skipping", channel));
                continue;
            };

            update_snapshot(&self.ctx.snapshot, |s| s.current_channel = Some(channel.clone()));
            info!(
                channel = %channel,
                captures = ids.len(),
                mode = ?self.mode,
                "Processing channel"
            );

            for stage in self.mode.stages() {
                match self.run_stage(&channel, *stage, &ids).await {
                    StageOutcome::Aborted => return FinishReason::Aborted,
                    StageOutcome::Skipped => debug!("{} {} skipped", channel, stage),
                    StageOutcome::Done => {
                        if *stage == ProcessStage::VectorAverage {
                            self.rename_average(&channel).await;
                        }
                    }
                }
            }
        }

        self.ctx.status("All processing complete!");
        FinishReason::Completed
    }

    async fn run_stage(&self, channel: &str, stage: ProcessStage, ids: &[String]) -> StageOutcome {
        let mut retry_count = 0;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return StageOutcome::Aborted;
            }
            let retry_msg = if retry_count > 0 {
                format!(" (Retry {}/{})", retry_count, self.policy.max_retries)
            } else {
                String::new()
            };
            self.ctx.status(format!("Starting {} for {}{}...", stage, channel, retry_msg));

            self.ctx.coordinator.reset(CoordinatorKey::process(channel, stage));
            let started = match stage {
                ProcessStage::CrossCorrAlign => {
                    self.ctx.device.start_cross_corr_align(channel, ids).await
                }
                ProcessStage::VectorAverage => {
                    self.ctx.device.start_vector_average(channel, ids).await
                }
            };

            let failure = match started {
                Err(e) => format!("Failed to start {} for {}: {}", stage, channel, e),
                Ok(()) => {
                    let sweep = &self.ctx.config.sweep;
                    let outcome = wait_for_signal(
                        &self.ctx.coordinator,
                        sweep.poll_tick(),
                        sweep.timeout_ticks,
                        &self.ctx.cancel,
                    )
                    .await;
                    let signal = match outcome {
                        PollOutcome::Cancelled => return StageOutcome::Aborted,
                        PollOutcome::Signaled(signal) => signal,
                    };
                    let op = format!("{} {}", channel, stage);
                    match signal.status {
                        CoordinatorStatus::Success => {
                            self.ctx.status(format!("Completed {} for {}", stage, channel));
                            return StageOutcome::Done;
                        }
                        CoordinatorStatus::Error => Error::CoordinatorError {
                            key: op,
                            message: signal.message.unwrap_or_default(),
                        }
                        .to_string(),
                        CoordinatorStatus::Abort => Error::CoordinatorAbort(op).to_string(),
                        CoordinatorStatus::Timeout | CoordinatorStatus::Armed => {
                            Error::CoordinatorTimeout(op).to_string()
                        }
                    }
                }
            };

            self.ctx.status(format!("Error: {}", failure));
            match self.policy.next(retry_count) {
                RetryDecision::Retry(count) => {
                    retry_count = count;
                    update_snapshot(&self.ctx.snapshot, |s| s.retry_count = count);
                    if !self.ctx.pause(self.ctx.config.sweep.retry_delay()).await {
                        return StageOutcome::Aborted;
                    }
                }
                RetryDecision::Skip => {
                    self.ctx.warning(format!(
                        "Max retries reached for {} on {}, skipping...",
                        stage, channel
                    ));
                    update_snapshot(&self.ctx.snapshot, |s| s.retry_count = 0);
                    return StageOutcome::Skipped;
                }
            }
        }
    }

    /// Give the averaged result a stable name; failures are only logged
    async fn rename_average(&self, channel: &str) {
        let name = format!("{}_VectorAvg", channel);
        let id = match self.ctx.device.vector_average_result().await {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not locate vector average for {}: {}", channel, e);
                return;
            }
        };
        match self.ctx.device.rename_measurement(&id, &name).await {
            Ok(()) => self.ctx.status(format!("Renamed vector average to {}", name)),
            Err(source) => {
                let err = Error::RenameFailed { id, name, source };
                warn!("{}", err);
            }
        }
    }
}
