//! # RMC Common Library
//!
//! Shared code for the room measurement coordinator services including:
//! - Measurement identity and quality types
//! - Event types (RmcEvent enum) and the EventBus
//! - Bootstrap configuration loading
//! - SSE helpers

pub mod config;
pub mod error;
pub mod events;
pub mod measurement;
pub mod sse;

pub use error::{Error, Result};
pub use measurement::{MeasurementKey, QualityResult, Rating, RemeasurePair};
