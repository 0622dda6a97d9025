//! Event system for RMC
//!
//! Provides shared event definitions and the EventBus used to carry worker
//! output (status lines, prompts, results) to whatever UI is attached.

mod session_types;

pub use session_types::{
    FinishReason, PromptKind, QualityAction, QualityPromptInfo, WorkerKind,
};

use crate::measurement::{MeasurementKey, QualityResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// RMC event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RmcEvent {
    /// Free-form status line
    StatusUpdate {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Non-fatal problem worth surfacing (skip, rename failure, degraded RTA)
    Warning {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Error dialog request
    ErrorNotice {
        title: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Worker suspended; UI must answer with resume or a decision
    PromptRequested {
        session_id: Uuid,
        prompt: PromptKind,
        timestamp: DateTime<Utc>,
    },

    /// A capture attempt for a cell has been issued
    CaptureStarted {
        session_id: Uuid,
        key: MeasurementKey,
        /// 0 for the first attempt, n for the n-th retry
        retry: u32,
        timestamp: DateTime<Utc>,
    },

    /// A capture completed and was evaluated
    MeasurementEvaluated {
        session_id: Uuid,
        result: QualityResult,
        timestamp: DateTime<Utc>,
    },

    /// A cell exhausted its retries and was left out of the result set
    CellSkipped {
        session_id: Uuid,
        key: MeasurementKey,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// RTA verification finished (verified or degraded)
    RtaVerificationComplete {
        result: QualityResult,
        verified: bool,
        timestamp: DateTime<Utc>,
    },

    /// Progress text reported by the device through the webhook
    DeviceProgress {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A worker stopped running
    WorkerFinished {
        session_id: Uuid,
        kind: WorkerKind,
        reason: FinishReason,
        timestamp: DateTime<Utc>,
    },
}

impl RmcEvent {
    pub fn status(message: impl Into<String>) -> Self {
        RmcEvent::StatusUpdate {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        RmcEvent::Warning {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error_notice(title: impl Into<String>, message: impl Into<String>) -> Self {
        RmcEvent::ErrorNotice {
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Event name used for the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            RmcEvent::StatusUpdate { .. } => "StatusUpdate",
            RmcEvent::Warning { .. } => "Warning",
            RmcEvent::ErrorNotice { .. } => "ErrorNotice",
            RmcEvent::PromptRequested { .. } => "PromptRequested",
            RmcEvent::CaptureStarted { .. } => "CaptureStarted",
            RmcEvent::MeasurementEvaluated { .. } => "MeasurementEvaluated",
            RmcEvent::CellSkipped { .. } => "CellSkipped",
            RmcEvent::RtaVerificationComplete { .. } => "RtaVerificationComplete",
            RmcEvent::DeviceProgress { .. } => "DeviceProgress",
            RmcEvent::WorkerFinished { .. } => "WorkerFinished",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block workers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use rmc_common::events::{EventBus, RmcEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(RmcEvent::status("Starting measurement for FL_pos0..."));
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RmcEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RmcEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: RmcEvent) -> Result<usize, broadcast::error::SendError<RmcEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: RmcEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
