use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A queryable metric and the dimensions it may be grouped by.
///
/// An empty dimension set is legal and means no group-by is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dimensions: BTreeSet<String>,
}

/// The complete metric set at a point in time. Replaced wholesale on rebuild,
/// never mutated in place.
///
/// Serialized shape (also the persisted snapshot file):
/// `{ "metrics": [{ "name", "description", "dimensions": [..] }], "builtAt"? }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotFile")]
pub struct MetricsSnapshot {
    metrics: Vec<Metric>,
    #[serde(rename = "builtAt", skip_serializing_if = "Option::is_none")]
    built_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(rename = "builtAt", default)]
    built_at: Option<DateTime<Utc>>,
}

impl From<SnapshotFile> for MetricsSnapshot {
    fn from(file: SnapshotFile) -> Self {
        Self::new(file.metrics, file.built_at)
    }
}

impl MetricsSnapshot {
    /// Orders metrics by name and keeps the first occurrence of each name.
    pub fn new(mut metrics: Vec<Metric>, built_at: Option<DateTime<Utc>>) -> Self {
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics.dedup_by(|later, earlier| later.name == earlier.name);
        Self { metrics, built_at }
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&Metric> {
        self.metrics
            .binary_search_by(|metric| metric.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.metrics[idx])
    }

    pub fn dimensions_for(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.find(name).map(|metric| &metric.dimensions)
    }

    /// Content equality ignoring `built_at`.
    pub fn same_metrics(&self, other: &MetricsSnapshot) -> bool {
        self.metrics == other.metrics
    }
}
