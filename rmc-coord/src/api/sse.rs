//! Server-Sent Events stream for the UI

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events
///
/// Streams every [`RmcEvent`](rmc_common::events::RmcEvent): status lines,
/// warnings, prompts, evaluated captures and finish notices.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    rmc_common::sse::event_bus_sse_stream(state.event_bus.subscribe())
}
