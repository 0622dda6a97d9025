//! Device webhook listener
//!
//! The measurement device POSTs job progress and completion here. Completion
//! events are correlated with the armed operation and forwarded to the
//! [`Coordinator`](crate::coordinator::Coordinator); distortion samples go to
//! the RTA window. Every well-formed event is acknowledged with 202, even
//! when it is ignored, so the device never sees an error for a late or
//! duplicate callback.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use rmc_common::events::RmcEvent;
use rmc_common::MeasurementKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::{CoordinatorKey, CoordinatorStatus, ProcessStage, SignalDisposition};
use crate::rta::DistortionSample;
use crate::AppState;

/// Inbound device event
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    Capture {
        channel: String,
        position: u32,
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    Process {
        channel: String,
        operation: ProcessStage,
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    Progress {
        message: String,
    },
    RtaDistortion(RtaPayload),
}

/// One sample inline, or a batch under `samples`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RtaPayload {
    Batch { samples: Vec<DistortionSample> },
    Single(DistortionSample),
}

/// What a device status string means for the armed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Terminal(CoordinatorStatus),
    Progress,
    Unknown,
}

impl DeviceStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "completed" | "success" => DeviceStatus::Terminal(CoordinatorStatus::Success),
            "error" | "failed" => DeviceStatus::Terminal(CoordinatorStatus::Error),
            "aborted" | "cancelled" => DeviceStatus::Terminal(CoordinatorStatus::Abort),
            "started" | "running" => DeviceStatus::Progress,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// Acknowledgement body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub disposition: String,
}

impl WebhookAck {
    fn new(disposition: impl Into<String>) -> Self {
        Self {
            disposition: disposition.into(),
        }
    }
}

fn disposition_label(disposition: SignalDisposition) -> &'static str {
    match disposition {
        SignalDisposition::Accepted => "accepted",
        SignalDisposition::NotArmed => "not_armed",
        SignalDisposition::KeyMismatch => "key_mismatch",
        SignalDisposition::Duplicate => "duplicate",
    }
}

/// POST /webhook
pub async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<WebhookEvent>,
) -> (StatusCode, Json<WebhookAck>) {
    let ack = match event {
        WebhookEvent::Capture {
            channel,
            position,
            status,
            message,
        } => {
            let key = CoordinatorKey::capture(MeasurementKey::new(channel, position));
            route_status(&state, key, &status, message)
        }
        WebhookEvent::Process {
            channel,
            operation,
            status,
            message,
        } => {
            let key = CoordinatorKey::process(channel, operation);
            route_status(&state, key, &status, message)
        }
        WebhookEvent::Progress { message } => {
            state.event_bus.emit_lossy(RmcEvent::status(message));
            WebhookAck::new("progress")
        }
        WebhookEvent::RtaDistortion(payload) => {
            let samples = match payload {
                RtaPayload::Batch { samples } => samples,
                RtaPayload::Single(sample) => vec![sample],
            };
            let accepted = samples
                .into_iter()
                .filter(|sample| state.rta.push_sample(*sample))
                .count();
            if accepted > 0 {
                WebhookAck::new("accepted")
            } else {
                WebhookAck::new("no_window")
            }
        }
    };

    (StatusCode::ACCEPTED, Json(ack))
}

fn route_status(
    state: &AppState,
    key: CoordinatorKey,
    status: &str,
    message: Option<String>,
) -> WebhookAck {
    match DeviceStatus::parse(status) {
        DeviceStatus::Terminal(terminal) => {
            let disposition = state.coordinator.signal_matching(&key, terminal, message);
            info!(key = %key, status = %terminal, ?disposition, "Device callback");
            WebhookAck::new(disposition_label(disposition))
        }
        DeviceStatus::Progress => {
            let text = match message {
                Some(message) => format!("{} {}: {}", key, status, message),
                None => format!("{} {}", key, status),
            };
            state.event_bus.emit_lossy(RmcEvent::DeviceProgress {
                message: text,
                timestamp: Utc::now(),
            });
            WebhookAck::new("progress")
        }
        DeviceStatus::Unknown => {
            debug!(key = %key, status, "Ignoring unknown device status");
            WebhookAck::new("ignored")
        }
    }
}

/// Build webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(receive_event))
}
