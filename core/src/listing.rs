//! Parsers for the discovery tools' output: the metric listing (one JSON
//! object per line), the per-metric dimension listing (bulleted text) and the
//! build manifest.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Error;

/// One entry of the metric listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedMetric {
    pub unique_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Deserialize)]
struct ListingLine {
    unique_id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Parses JSON-lines listing output. Lines that are not JSON objects (log
/// chatter) and entries without `unique_id` are skipped. A missing `name`
/// falls back to the last segment of `unique_id`.
pub fn parse_metric_listing(stdout: &str) -> Vec<ListedMetric> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<ListingLine>(line).ok())
        .filter_map(|entry| {
            let unique_id = entry.unique_id.filter(|id| !id.trim().is_empty())?;
            let name = entry
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| {
                    unique_id
                        .rsplit('.')
                        .next()
                        .unwrap_or(unique_id.as_str())
                        .to_string()
                });
            Some(ListedMetric {
                name,
                description: entry.description.unwrap_or_default(),
                unique_id,
            })
        })
        .collect()
}

const DIMENSION_BULLET: &str = "• ";

/// Extracts dimension names from the bulleted dimension listing.
pub fn parse_dimension_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('✔'))
        .filter_map(|line| line.strip_prefix(DIMENSION_BULLET))
        .map(str::trim)
        .filter(|dimension| !dimension.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    metrics: HashMap<String, ManifestMetric>,
}

#[derive(Deserialize)]
struct ManifestMetric {
    #[serde(default)]
    description: Option<String>,
}

/// Metric descriptions from the build manifest, keyed by `unique_id`.
#[derive(Debug, Clone, Default)]
pub struct ManifestDescriptions {
    by_unique_id: HashMap<String, String>,
}

impl ManifestDescriptions {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        let by_unique_id = manifest
            .metrics
            .into_iter()
            .filter_map(|(unique_id, metric)| {
                metric
                    .description
                    .filter(|description| !description.trim().is_empty())
                    .map(|description| (unique_id, description))
            })
            .collect();
        Ok(Self { by_unique_id })
    }

    pub fn len(&self) -> usize {
        self.by_unique_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_unique_id.is_empty()
    }

    /// The manifest description when present, else the listing's own.
    pub fn describe(&self, listed: &ListedMetric) -> String {
        self.by_unique_id
            .get(&listed.unique_id)
            .cloned()
            .unwrap_or_else(|| listed.description.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_listing_skips_noise_and_entries_without_id() {
        let stdout = r#"
18:02:11  Running with dbt=1.8.3
{"name": "revenue", "unique_id": "metric.coindbt.revenue", "description": "Gross revenue"}
{"name": "orphan"}
{"unique_id": "metric.coindbt.active_wallets"}
not json {
{"name": "orders", "unique_id": "metric.coindbt.orders"}
"#;
        let listed = parse_metric_listing(stdout);
        assert_eq!(
            listed,
            vec![
                ListedMetric {
                    unique_id: "metric.coindbt.revenue".to_string(),
                    name: "revenue".to_string(),
                    description: "Gross revenue".to_string(),
                },
                ListedMetric {
                    unique_id: "metric.coindbt.active_wallets".to_string(),
                    name: "active_wallets".to_string(),
                    description: String::new(),
                },
                ListedMetric {
                    unique_id: "metric.coindbt.orders".to_string(),
                    name: "orders".to_string(),
                    description: String::new(),
                },
            ]
        );
    }

    #[test]
    fn dimension_listing_reads_bullets_only() {
        let stdout = "✔ 🌱 We've found 3 common dimensions for metrics ['revenue'].\n\
                      • metric_time\n\
                      •  customer__region \n\
                      \n\
                      some footer\n\
                      • coin__symbol\n";
        assert_eq!(
            parse_dimension_listing(stdout),
            vec!["metric_time", "customer__region", "coin__symbol"]
        );
        assert!(parse_dimension_listing("").is_empty());
    }

    #[test]
    fn manifest_description_wins_over_listing() {
        let manifest = ManifestDescriptions::from_json(
            r#"{
                "nodes": {},
                "metrics": {
                    "metric.coindbt.revenue": { "description": "Revenue from the manifest" },
                    "metric.coindbt.orders": { "description": "" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.len(), 1);

        let revenue = ListedMetric {
            unique_id: "metric.coindbt.revenue".to_string(),
            name: "revenue".to_string(),
            description: "listing".to_string(),
        };
        let orders = ListedMetric {
            unique_id: "metric.coindbt.orders".to_string(),
            name: "orders".to_string(),
            description: "Orders from listing".to_string(),
        };
        assert_eq!(manifest.describe(&revenue), "Revenue from the manifest");
        assert_eq!(manifest.describe(&orders), "Orders from listing");
    }

    #[test]
    fn manifest_rejects_invalid_json() {
        assert!(ManifestDescriptions::from_json("{ not json").is_err());
        assert!(ManifestDescriptions::from_json("{}").unwrap().is_empty());
    }
}
