//! Measurement device collaborator
//!
//! The device runs captures and batch processing jobs and reports completion
//! asynchronously through our webhook. [`MeasurementDevice`] is the seam the
//! workers drive; [`RewClient`] talks to the device's local HTTP API.

mod client;

pub use client::RewClient;

use async_trait::async_trait;
use rmc_common::MeasurementKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Device client errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Connection refused, DNS failure, request timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Device answered with a non-2xx status
    #[error("Device API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// Listing is empty where an artifact was expected
    #[error("Device has no measurements")]
    NoMeasurements,
}

/// One entry in the device's measurement listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMeasurement {
    /// Listing index (1-based, increasing with creation order)
    #[serde(default)]
    pub index: u32,
    pub uuid: String,
    pub title: String,
}

impl DeviceMeasurement {
    /// Capture cell this entry belongs to, if its title is a capture title
    pub fn key(&self) -> Option<MeasurementKey> {
        MeasurementKey::from_title(&self.title)
    }
}

/// Operations the coordination engine needs from the device
#[async_trait]
pub trait MeasurementDevice: Send + Sync {
    /// Register the webhook the device posts completion events to
    async fn subscribe(&self, callback_url: &str) -> Result<(), DeviceError>;

    /// Ask the device to start one capture
    async fn start_capture(&self, key: &MeasurementKey) -> Result<(), DeviceError>;

    /// Ask the device to cancel the in-flight capture
    async fn cancel_capture(&self) -> Result<(), DeviceError>;

    /// Full listing, oldest first
    async fn get_all_measurements(&self) -> Result<Vec<DeviceMeasurement>, DeviceError>;

    async fn delete_measurement(&self, id: &str) -> Result<(), DeviceError>;

    async fn rename_measurement(&self, id: &str, title: &str) -> Result<(), DeviceError>;

    async fn start_cross_corr_align(
        &self,
        channel: &str,
        ids: &[String],
    ) -> Result<(), DeviceError>;

    async fn start_vector_average(&self, channel: &str, ids: &[String]) -> Result<(), DeviceError>;

    async fn subscribe_rta_distortion(&self, callback_url: &str) -> Result<(), DeviceError>;

    async fn unsubscribe_rta_distortion(&self) -> Result<(), DeviceError>;

    /// Push the RTA and distortion settings used for verification
    async fn configure_rta(&self) -> Result<(), DeviceError>;

    async fn start_rta(&self) -> Result<(), DeviceError>;

    async fn stop_rta(&self) -> Result<(), DeviceError>;

    /// Id of the newest measurement
    async fn latest_measurement_id(&self) -> Result<String, DeviceError> {
        let listing = self.get_all_measurements().await?;
        listing
            .last()
            .map(|m| m.uuid.clone())
            .ok_or(DeviceError::NoMeasurements)
    }

    /// Id of the artifact produced by the last vector average
    async fn vector_average_result(&self) -> Result<String, DeviceError> {
        self.latest_measurement_id().await
    }
}

/// Capture ids grouped by channel, each group ordered by position
///
/// Only entries whose title parses as a capture title are included. When
/// `selected` is non-empty, other channels are left out.
pub fn channels_with_measurements(
    listing: &[DeviceMeasurement],
    selected: &[String],
) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
    for measurement in listing {
        let Some(key) = measurement.key() else {
            continue;
        };
        if !selected.is_empty() && !selected.iter().any(|c| c == key.channel()) {
            continue;
        }
        grouped
            .entry(key.channel().to_string())
            .or_default()
            .push((key.position(), measurement.uuid.clone()));
    }

    grouped
        .into_iter()
        .map(|(channel, mut entries)| {
            entries.sort_by_key(|(position, _)| *position);
            (channel, entries.into_iter().map(|(_, id)| id).collect())
        })
        .collect()
}
