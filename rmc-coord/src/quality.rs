//! UI-visible quality table
//!
//! Written by the measurement worker after every evaluated capture, read by
//! the control API and by repeat-mode setup.

use rmc_common::{MeasurementKey, QualityResult, RemeasurePair};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Quality results keyed by capture cell
#[derive(Debug, Clone, Default)]
pub struct QualityTable {
    inner: Arc<RwLock<BTreeMap<MeasurementKey, QualityResult>>>,
}

impl QualityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, result: QualityResult) {
        self.inner.write().await.insert(result.key.clone(), result);
    }

    pub async fn remove(&self, key: &MeasurementKey) -> Option<QualityResult> {
        self.inner.write().await.remove(key)
    }

    pub async fn get(&self, key: &MeasurementKey) -> Option<QualityResult> {
        self.inner.read().await.get(key).cloned()
    }

    /// All entries ordered by (channel, position)
    pub async fn snapshot(&self) -> Vec<QualityResult> {
        self.inner.read().await.values().cloned().collect()
    }

    /// CAUTION/RETAKE entries, ordered by position then channel
    pub async fn retake_candidates(&self) -> Vec<RemeasurePair> {
        let table = self.inner.read().await;
        let mut pairs: Vec<RemeasurePair> = table
            .values()
            .filter(|result| result.rating.needs_attention())
            .map(RemeasurePair::from)
            .collect();
        pairs.sort_by(|a, b| (a.position, &a.channel).cmp(&(b.position, &b.channel)));
        pairs
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
