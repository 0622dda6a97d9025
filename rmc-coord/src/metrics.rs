//! Measurement quality evaluation seam
//!
//! Scoring algorithms live outside this service. The workers call
//! [`MetricsEvaluator::evaluate`] with the device artifact id of each
//! completed capture and store whatever it returns.

use async_trait::async_trait;
use rmc_common::Rating;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Evaluator output for one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub rating: Rating,
    pub score: f64,
    #[serde(default)]
    pub detail: BTreeMap<String, f64>,
}

#[async_trait]
pub trait MetricsEvaluator: Send + Sync {
    async fn evaluate(&self, artifact_id: &str) -> Result<Evaluation>;
}

/// Default evaluator: every capture passes with a perfect score
#[derive(Debug, Default, Clone, Copy)]
pub struct UnscoredEvaluator;

#[async_trait]
impl MetricsEvaluator for UnscoredEvaluator {
    async fn evaluate(&self, _artifact_id: &str) -> Result<Evaluation> {
        Ok(Evaluation {
            rating: Rating::Pass,
            score: 100.0,
            detail: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscored_evaluator_passes() {
        let evaluation = UnscoredEvaluator.evaluate("any").await.unwrap();
        assert_eq!(evaluation.rating, Rating::Pass);
        assert_eq!(evaluation.score, 100.0);
        assert!(evaluation.detail.is_empty());
    }
}
