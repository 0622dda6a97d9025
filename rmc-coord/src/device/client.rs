//! HTTP client for the measurement device's local API

use async_trait::async_trait;
use reqwest::{Client, Response};
use rmc_common::config::DeviceConfig;
use rmc_common::MeasurementKey;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::coordinator::ProcessStage;

use super::{DeviceError, DeviceMeasurement, MeasurementDevice};

/// RTA settings pushed before a verification window
fn rta_configuration() -> Value {
    json!({
        "mode": "RTA",
        "fftLength": 65536,
        "averaging": "None",
        "window": "Hann",
    })
}

/// Distortion settings pushed before a verification window
fn rta_distortion_configuration() -> Value {
    json!({
        "distortionUnit": "percent",
        "fundamentalMode": "Auto",
        "maxHarmonic": 9,
    })
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    uuid: String,
    title: String,
}

/// Device API client
pub struct RewClient {
    client: Client,
    base_url: String,
}

impl RewClient {
    /// Create a client for the device at `config.base_url`
    pub fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DeviceError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map transport failures and non-2xx answers to [`DeviceError`]
    async fn check(response: Result<Response, reqwest::Error>) -> Result<Response, DeviceError> {
        let response = response.map_err(|e| DeviceError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeviceError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<(), DeviceError> {
        debug!(path, "POST");
        Self::check(self.client.post(self.url(path)).json(&body).send().await).await?;
        Ok(())
    }

    async fn put_json(&self, path: &str, body: Value) -> Result<(), DeviceError> {
        debug!(path, "PUT");
        Self::check(self.client.put(self.url(path)).json(&body).send().await).await?;
        Ok(())
    }

    async fn start_process(
        &self,
        process_name: &str,
        channel: &str,
        ids: &[String],
    ) -> Result<(), DeviceError> {
        self.post_json(
            "/measurements/process-measurements",
            json!({
                "processName": process_name,
                "measurementUUIDs": ids,
                "channel": channel,
            }),
        )
        .await
    }
}

/// Parse the `{ "1": {uuid, title}, ... }` listing, ordered by index
fn parse_listing(value: Value) -> Result<Vec<DeviceMeasurement>, DeviceError> {
    let raw: BTreeMap<String, ListingEntry> =
        serde_json::from_value(value).map_err(|e| DeviceError::Parse(e.to_string()))?;

    let mut listing = Vec::with_capacity(raw.len());
    for (index, entry) in raw {
        let index = index
            .parse::<u32>()
            .map_err(|_| DeviceError::Parse(format!("Non-numeric measurement index: {}", index)))?;
        listing.push(DeviceMeasurement {
            index,
            uuid: entry.uuid,
            title: entry.title,
        });
    }
    listing.sort_by_key(|m| m.index);
    Ok(listing)
}

#[async_trait]
impl MeasurementDevice for RewClient {
    async fn subscribe(&self, callback_url: &str) -> Result<(), DeviceError> {
        self.post_json("/measure/subscribe", json!({ "url": callback_url }))
            .await
    }

    async fn start_capture(&self, key: &MeasurementKey) -> Result<(), DeviceError> {
        self.post_json(
            "/measure",
            json!({
                "channel": key.channel(),
                "position": key.position(),
                "title": key.title(),
            }),
        )
        .await
    }

    async fn cancel_capture(&self) -> Result<(), DeviceError> {
        self.post_json("/measure/cancel", json!({})).await
    }

    async fn get_all_measurements(&self) -> Result<Vec<DeviceMeasurement>, DeviceError> {
        let response = Self::check(self.client.get(self.url("/measurements")).send().await).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| DeviceError::Parse(e.to_string()))?;
        parse_listing(value)
    }

    async fn delete_measurement(&self, id: &str) -> Result<(), DeviceError> {
        debug!(id, "DELETE measurement");
        Self::check(
            self.client
                .delete(self.url(&format!("/measurements/{}", id)))
                .send()
                .await,
        )
        .await?;
        Ok(())
    }

    async fn rename_measurement(&self, id: &str, title: &str) -> Result<(), DeviceError> {
        self.put_json(&format!("/measurements/{}", id), json!({ "title": title }))
            .await
    }

    async fn start_cross_corr_align(
        &self,
        channel: &str,
        ids: &[String],
    ) -> Result<(), DeviceError> {
        self.start_process(ProcessStage::CrossCorrAlign.process_name(), channel, ids).await
    }

    async fn start_vector_average(&self, channel: &str, ids: &[String]) -> Result<(), DeviceError> {
        self.start_process(ProcessStage::VectorAverage.process_name(), channel, ids).await
    }

    async fn subscribe_rta_distortion(&self, callback_url: &str) -> Result<(), DeviceError> {
        self.post_json("/rta/distortion/subscribe", json!({ "url": callback_url }))
            .await
    }

    async fn unsubscribe_rta_distortion(&self) -> Result<(), DeviceError> {
        self.post_json("/rta/distortion/unsubscribe", json!({})).await
    }

    async fn configure_rta(&self) -> Result<(), DeviceError> {
        self.put_json("/rta/configuration", rta_configuration()).await?;
        self.put_json("/rta/distortion-configuration", rta_distortion_configuration())
            .await
    }

    async fn start_rta(&self) -> Result<(), DeviceError> {
        self.post_json("/rta/command", json!({ "command": "Start" })).await
    }

    async fn stop_rta(&self) -> Result<(), DeviceError> {
        if let Err(e) = self.post_json("/rta/command", json!({ "command": "Stop" })).await {
            warn!("Failed to stop RTA: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing_orders_numerically() {
        let value = json!({
            "10": {"uuid": "j", "title": "FR_pos4"},
            "2": {"uuid": "b", "title": "FL_pos0"},
            "1": {"uuid": "a", "title": "C_pos0"},
        });
        let listing = parse_listing(value).unwrap();
        let ids: Vec<_> = listing.iter().map(|m| m.uuid.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "j"]);
        assert_eq!(listing[2].index, 10);
    }

    #[test]
    fn test_parse_listing_rejects_bad_index() {
        let value = json!({"first": {"uuid": "a", "title": "C_pos0"}});
        assert!(matches!(parse_listing(value), Err(DeviceError::Parse(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = DeviceConfig {
            base_url: "http://127.0.0.1:4735/".to_string(),
            ..DeviceConfig::default()
        };
        let client = RewClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:4735");
    }
}
