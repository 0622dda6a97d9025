//! HTTP API handlers for rmc-coord
//!
//! The device reaches the service through `/webhook`; everything else is
//! the UI boundary (control routes and the `/events` SSE stream).

pub mod control;
pub mod health;
pub mod sse;
pub mod webhook;

pub use control::control_routes;
pub use health::health_routes;
pub use sse::event_stream;
pub use webhook::webhook_routes;
