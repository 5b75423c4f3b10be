use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::codes;
use crate::table::Row;

/// A client query. Never stored server-side: `create_query` validates and
/// echoes it, and the client resubmits the same object to fetch results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Query {
    #[serde(deserialize_with = "names")]
    pub metrics: Vec<String>,
    #[serde(
        default,
        deserialize_with = "optional_names",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<serde_json::Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<OrderBy>>,
}

/// A metric or dimension reference: `"name"` or `{ "name": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameRef {
    Plain(String),
    Named { name: String },
}

impl NameRef {
    pub fn name(&self) -> &str {
        match self {
            NameRef::Plain(name) | NameRef::Named { name } => name,
        }
    }

    fn into_name(self) -> String {
        match self {
            NameRef::Plain(name) | NameRef::Named { name } => name,
        }
    }
}

fn names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs = Vec::<NameRef>::deserialize(deserializer)?;
    Ok(refs.into_iter().map(NameRef::into_name).collect())
}

fn optional_names<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs = Option::<Vec<NameRef>>::deserialize(deserializer)?;
    Ok(refs.map(|refs| refs.into_iter().map(NameRef::into_name).collect()))
}

/// Ordering entry, interpreted by the query tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderBy {
    /// A target name, `-` prefixed for descending.
    Name(String),
    Target {
        #[serde(default)]
        descending: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metric: Option<NameRef>,
        #[serde(rename = "groupBy", default, skip_serializing_if = "Option::is_none")]
        group_by: Option<NameRef>,
    },
}

impl OrderBy {
    /// Renders the entry in the query tool's `--order` syntax.
    pub fn to_order_arg(&self) -> Option<String> {
        match self {
            OrderBy::Name(name) => {
                let name = name.trim();
                (!name.is_empty()).then(|| name.to_string())
            }
            OrderBy::Target {
                descending,
                metric,
                group_by,
            } => {
                let target = metric.as_ref().or(group_by.as_ref())?.name().trim();
                if target.is_empty() {
                    return None;
                }
                Some(if *descending {
                    format!("-{target}")
                } else {
                    target.to_string()
                })
            }
        }
    }
}

impl Query {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
            group_by: None,
            limit: None,
            order_by: None,
        }
    }

    pub fn with_group_by<I, S>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(dimensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_limit(mut self, limit: impl Into<serde_json::Number>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn group_by(&self) -> &[String] {
        self.group_by.as_deref().unwrap_or_default()
    }

    /// The limit coerced to a positive integer; fractional values truncate.
    pub fn limit_value(&self) -> Option<u64> {
        let number = self.limit.as_ref()?;
        number
            .as_u64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|value| value.is_finite() && *value >= 1.0)
                    .map(|value| value.trunc() as u64)
            })
            .filter(|limit| *limit > 0)
    }

    pub fn order_args(&self) -> Vec<String> {
        self.order_by
            .iter()
            .flatten()
            .filter_map(OrderBy::to_order_arg)
            .collect()
    }

    /// Problems with the query's own shape, independent of the metric catalog.
    pub fn shape_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.metrics.is_empty() {
            problems.push("At least one metric is required.".to_string());
        }
        if self.limit.is_some() && self.limit_value().is_none() {
            problems.push("'limit' must be a positive integer.".to_string());
        }
        problems
    }

    /// Every (metric, group-by) pair the catalog does not support. `lookup`
    /// returns a metric's valid dimensions, or `None` for an unknown metric.
    pub fn invalid_dimensions<'a, F>(&self, lookup: F) -> Vec<InvalidDimension>
    where
        F: Fn(&str) -> Option<&'a BTreeSet<String>>,
    {
        let mut invalid = Vec::new();
        for metric in &self.metrics {
            let valid = lookup(metric);
            for dimension in self.group_by() {
                if valid.is_some_and(|valid| dimension_is_valid(dimension, valid)) {
                    continue;
                }
                invalid.push(InvalidDimension {
                    metric: metric.clone(),
                    dimension: dimension.clone(),
                    valid: valid.into_iter().flatten().cloned().collect(),
                });
            }
        }
        invalid
    }
}

/// A dimension is valid verbatim, or after stripping one trailing
/// `__<grain>` segment (`metric_time__month` -> `metric_time`).
pub fn dimension_is_valid(requested: &str, valid: &BTreeSet<String>) -> bool {
    valid.contains(requested)
        || requested
            .rsplit_once("__")
            .is_some_and(|(base, _)| valid.contains(base))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDimension {
    pub metric: String,
    pub dimension: String,
    pub valid: Vec<String>,
}

impl fmt::Display for InvalidDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dimension '{}' is not valid for metric '{}'.\nValid dimensions include: [{}]",
            self.dimension,
            self.metric,
            self.valid.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Created,
    Successful,
    Error,
}

/// Outcome of `create_query`: the validated query echoed back, or the reason
/// it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedQuery<Q = Query> {
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub query: Q,
}

impl<Q> CreatedQuery<Q> {
    pub fn created(query: Q) -> Self {
        Self {
            status: QueryStatus::Created,
            error: None,
            error_code: None,
            query,
        }
    }

    pub fn rejected(code: &'static str, error: impl Into<String>, query: Q) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error.into()),
            error_code: Some(code),
            query,
        }
    }

    pub fn is_created(&self) -> bool {
        self.status == QueryStatus::Created
    }
}

/// Outcome of `fetch_query_result`.
///
/// `results` wraps the row list in one extra array level (`[[row, ..]]`).
/// Clients depend on that shape, so it is kept even though it looks
/// accidental.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub results: Vec<Vec<Row>>,
    pub error: Option<String>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

impl QueryResult {
    pub fn successful(rows: Vec<Row>, diagnostic: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Successful,
            results: vec![rows],
            error: Some(diagnostic.into()),
            error_code: None,
        }
    }

    pub fn failed(code: &'static str, error: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Error,
            results: Vec::new(),
            error: Some(error.into()),
            error_code: Some(code),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self::failed(codes::VALIDATION_FAILED, error)
    }

    pub fn rows(&self) -> &[Row] {
        self.results.first().map(Vec::as_slice).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn dims(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn time_grain_suffix_is_stripped_once() {
        let valid = dims(&["metric_time", "customer__region"]);
        assert!(dimension_is_valid("metric_time", &valid));
        assert!(dimension_is_valid("metric_time__month", &valid));
        assert!(dimension_is_valid("customer__region", &valid));
        assert!(dimension_is_valid("customer__region__day", &valid));
        assert!(!dimension_is_valid("customer", &valid));
        assert!(!dimension_is_valid("metric_time__month__year", &valid));
        assert!(!dimension_is_valid("bogus", &valid));
    }

    #[test]
    fn unknown_metric_rejects_every_group_by() {
        let catalog = dims(&["d"]);
        let query = Query::new(["known", "unknown"]).with_group_by(["d"]);
        let invalid = query.invalid_dimensions(|metric| (metric == "known").then_some(&catalog));
        assert_eq!(
            invalid,
            vec![InvalidDimension {
                metric: "unknown".to_string(),
                dimension: "d".to_string(),
                valid: Vec::new(),
            }]
        );
        assert_eq!(
            invalid[0].to_string(),
            "Dimension 'd' is not valid for metric 'unknown'.\nValid dimensions include: []"
        );
    }

    #[test]
    fn deserializes_plain_and_named_references() {
        let query: Query = serde_json::from_value(json!({
            "metrics": [{ "name": "revenue" }, "orders"],
            "groupBy": ["metric_time__week", { "name": "coin__symbol" }],
            "limit": 25,
            "orderBy": ["-metric_time__week", { "descending": true, "metric": { "name": "revenue" } }]
        }))
        .unwrap();

        assert_eq!(query.metrics, vec!["revenue", "orders"]);
        assert_eq!(query.group_by(), ["metric_time__week", "coin__symbol"]);
        assert_eq!(query.limit_value(), Some(25));
        assert_eq!(query.order_args(), vec!["-metric_time__week", "-revenue"]);
    }

    #[test]
    fn plain_query_echoes_unchanged() {
        let raw = json!({ "metrics": ["m"], "groupBy": ["d"], "limit": 10, "orderBy": ["d"] });
        let query: Query = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&query).unwrap(), raw);

        let minimal = json!({ "metrics": ["m"] });
        let query: Query = serde_json::from_value(minimal.clone()).unwrap();
        assert_eq!(serde_json::to_value(&query).unwrap(), minimal);
    }

    #[test]
    fn rejects_unknown_fields_and_missing_metrics() {
        assert!(serde_json::from_value::<Query>(json!({ "metrics": ["m"], "where": [] })).is_err());
        assert!(serde_json::from_value::<Query>(json!({ "groupBy": ["d"] })).is_err());
        assert!(serde_json::from_value::<Query>(json!({ "metrics": "m" })).is_err());
    }

    #[test]
    fn limit_coercion() {
        let with = |limit: serde_json::Value| {
            serde_json::from_value::<Query>(json!({ "metrics": ["m"], "limit": limit }))
                .unwrap()
                .limit_value()
        };
        assert_eq!(with(json!(10)), Some(10));
        assert_eq!(with(json!(7.9)), Some(7));
        assert_eq!(with(json!(0)), None);
        assert_eq!(with(json!(-3)), None);
        assert_eq!(with(json!(0.5)), None);
        assert_eq!(with(json!(null)), None);
    }

    #[test]
    fn shape_problems_cover_empty_metrics_and_bad_limit() {
        assert!(Query::new(["m"]).shape_problems().is_empty());
        let problems = Query::new(Vec::<String>::new()).with_limit(0).shape_problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("At least one metric"));
        assert!(problems[1].contains("limit"));
    }

    #[test]
    fn result_envelope_nests_rows_once() {
        let row: Row = [("a".to_string(), "1".to_string())].into_iter().collect();
        let result = QueryResult::successful(vec![row.clone()], "diag");
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["status"], "successful");
        assert_eq!(encoded["results"], json!([[{ "a": "1" }]]));
        assert_eq!(result.rows(), &[row]);

        let failed = serde_json::to_value(QueryResult::invalid("nope")).unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["results"], json!([]));
        assert_eq!(failed["errorCode"], "validation_failed");
    }
}
