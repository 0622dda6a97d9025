//! Server-Sent Events (SSE) utilities
//!
//! Turns an [`EventBus`](crate::events::EventBus) subscription into an axum
//! SSE response. Each event goes out with its variant name in the `event:`
//! field and its JSON form in `data:`.

use crate::events::RmcEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Keep-alive interval for every SSE stream
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Convert one event into an SSE frame
///
/// Returns `None` if the event cannot be serialized.
pub fn to_sse_event(event: &RmcEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event(event.event_type()).data(json)),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            None
        }
    }
}

/// Build the SSE response for a bus subscription
///
/// Starts with a `ConnectionStatus: connected` frame. Lagged receivers skip
/// the dropped events and keep streaming.
pub fn event_bus_sse_stream(
    rx: broadcast::Receiver<RmcEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected");

    let connected = futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().event("ConnectionStatus").data("connected"))
    });

    let events = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => {
                debug!("Broadcasting SSE event: {}", event.event_type());
                to_sse_event(&event).map(Ok)
            }
            Err(e) => {
                // Lagged; the next recv resumes at the oldest retained event
                warn!("SSE stream error: {:?}", e);
                None
            }
        }
    });

    Sse::new(connected.chain(events)).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}
