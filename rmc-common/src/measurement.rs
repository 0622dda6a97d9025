//! Measurement identity and quality types
//!
//! A capture cell is identified by its (channel, position) pair. Quality
//! results are keyed by that pair and carry the device artifact id of the
//! take they describe.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one capture cell: a speaker channel at a microphone position.
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementKey {
    channel: String,
    position: u32,
}

impl MeasurementKey {
    pub fn new(channel: impl Into<String>, position: u32) -> Self {
        Self {
            channel: channel.into(),
            position,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// Device-side title of a capture, e.g. `FL_pos0`
    pub fn title(&self) -> String {
        format!("{}_pos{}", self.channel, self.position)
    }

    /// Parse a device title of the form `{channel}_pos{position}`.
    ///
    /// Returns `None` for titles produced by anything other than a capture
    /// (vector averages, imports, user renames).
    pub fn from_title(title: &str) -> Option<Self> {
        let (channel, position) = title.rsplit_once("_pos")?;
        if channel.is_empty() {
            return None;
        }
        let position = position.parse::<u32>().ok()?;
        Some(Self::new(channel, position))
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_pos{}", self.channel, self.position)
    }
}

/// Quality rating assigned by the metrics evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Rating {
    Pass,
    Caution,
    Retake,
}

impl Rating {
    /// CAUTION and RETAKE both warrant user attention
    pub fn needs_attention(&self) -> bool {
        matches!(self, Rating::Caution | Rating::Retake)
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rating::Pass => "PASS",
            Rating::Caution => "CAUTION",
            Rating::Retake => "RETAKE",
        };
        f.write_str(s)
    }
}

/// Quality of one completed capture
///
/// Written by the measurement worker after every successful capture and
/// read by the UI through the quality table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub key: MeasurementKey,
    pub rating: Rating,
    pub score: f64,
    /// Evaluator-specific metrics (SNR, THD, ...)
    #[serde(default)]
    pub detail: BTreeMap<String, f64>,
    /// Device id of the take this result describes
    pub artifact_id: String,
    /// Whether an RTA verification window confirmed this result
    #[serde(default)]
    pub verified: bool,
}

/// One cell selected for a retake, with the id of the take it replaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemeasurePair {
    pub channel: String,
    pub position: u32,
    pub previous_artifact_id: Option<String>,
}

impl RemeasurePair {
    pub fn new(
        channel: impl Into<String>,
        position: u32,
        previous_artifact_id: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            position,
            previous_artifact_id,
        }
    }

    pub fn key(&self) -> MeasurementKey {
        MeasurementKey::new(self.channel.clone(), self.position)
    }
}

impl From<&QualityResult> for RemeasurePair {
    fn from(result: &QualityResult) -> Self {
        Self {
            channel: result.key.channel().to_string(),
            position: result.key.position(),
            previous_artifact_id: Some(result.artifact_id.clone()),
        }
    }
}
