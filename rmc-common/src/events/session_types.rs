//! Session-related event payload types

use crate::measurement::Rating;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which worker a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Full (position x channel) sweep
    Sweep,
    /// Retake of selected cells
    Repeat,
    /// Alignment / averaging pipeline
    Processing,
    /// RTA verification of one capture
    RtaVerification,
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Every cell / pair / channel was visited
    Completed,
    /// The user answered `stop` at a quality prompt
    Stopped,
    /// Explicit abort request
    Aborted,
    /// Unrecoverable precondition (device unreachable, stimulus missing)
    Failed,
}

impl FinishReason {
    /// Early termination surfaces as a terminal notice in the UI
    pub fn is_terminal_notice(&self) -> bool {
        !matches!(self, FinishReason::Completed)
    }
}

/// Which suspension point a worker is parked at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptKind {
    /// Waiting for the microphone to be moved
    Position { position: u32 },
    /// Waiting for a quality-gate decision
    Quality { info: QualityPromptInfo },
}

/// Payload of a quality-gate decision request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPromptInfo {
    pub channel: String,
    pub position: u32,
    pub rating: Rating,
    pub score: f64,
    pub detail: BTreeMap<String, f64>,
    pub artifact_id: String,
}

/// User answer to a quality-gate prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityAction {
    /// Discard the take and capture the same cell again
    Remeasure,
    /// Keep the take and advance
    Continue,
    /// Abort the whole sweep
    Stop,
}
