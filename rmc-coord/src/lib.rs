//! rmc-coord library interface
//!
//! Measurement coordination engine: drives multi-position loudspeaker sweeps
//! on an external measurement device, correlates its webhook callbacks with
//! the running worker, and exposes the UI boundary over HTTP + SSE.

pub mod api;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod metrics;
pub mod playback;
pub mod quality;
pub mod rta;
pub mod session;
pub mod workers;

pub use crate::error::{ApiError, ApiResult, Error, Result};
pub use crate::session::SessionController;

use axum::Router;
use chrono::{DateTime, Utc};
use rmc_common::events::EventBus;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::rta::RtaCoordinator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Worker lock and collaborators
    pub session: Arc<SessionController>,
    /// Event bridge signaled by the webhook listener
    pub coordinator: Arc<Coordinator>,
    /// RTA window fed by the webhook listener
    pub rta: Arc<RtaCoordinator>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(session: Arc<SessionController>) -> Self {
        Self {
            coordinator: session.coordinator(),
            rta: session.rta(),
            event_bus: session.events().clone(),
            session,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::webhook_routes())
        .merge(api::control_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
