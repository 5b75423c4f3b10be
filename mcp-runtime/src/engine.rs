use std::sync::Arc;

use semlayer_core::error::codes;
use semlayer_core::{CreatedQuery, Query, QueryResult, Row, TableParser};

use crate::cache::MetricsCache;
use crate::runner::{CommandRunner, Invocation};

/// Validates client queries against the cache and runs them through the
/// metrics query tool.
pub struct QueryEngine {
    cache: Arc<MetricsCache>,
    runner: Arc<dyn CommandRunner>,
    parser: TableParser,
}

impl QueryEngine {
    pub fn new(
        cache: Arc<MetricsCache>,
        runner: Arc<dyn CommandRunner>,
        parser: TableParser,
    ) -> Self {
        Self {
            cache,
            runner,
            parser,
        }
    }

    /// Validation only; nothing is executed or stored. On success the query
    /// comes back unchanged and is what the client resubmits.
    pub fn create_query(&self, query: Query) -> CreatedQuery {
        let problems = query.shape_problems();
        if !problems.is_empty() {
            return CreatedQuery::rejected(
                codes::VALIDATION_FAILED,
                problems.join("\n"),
                query,
            );
        }

        let status = self.cache.fetch();
        let snapshot = status.snapshot();
        let invalid = query.invalid_dimensions(|metric| {
            snapshot.and_then(|snapshot| snapshot.dimensions_for(metric))
        });
        if invalid.is_empty() {
            tracing::debug!(
                metrics = ?query.metrics,
                group_by = ?query.group_by(),
                "query validated"
            );
            return CreatedQuery::created(query);
        }

        let mut message = invalid
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n\n");
        let code = if snapshot.is_none() {
            message.push_str(&format!(
                "\n\nThe metrics cache is not ready yet ({}), so no dimensions are known. \
                 Retry once fetch_metrics lists the metric.",
                status.as_str()
            ));
            codes::CACHE_NOT_READY
        } else {
            codes::VALIDATION_FAILED
        };
        tracing::info!(
            invalid_pairs = invalid.len(),
            cache = status.as_str(),
            "rejected query with invalid group-by"
        );
        CreatedQuery::rejected(code, message, query)
    }

    /// Executes a previously created query. Only the non-empty metric list is
    /// checked here.
    pub async fn run_query(&self, query: &Query) -> QueryResult {
        if query.metrics.is_empty() {
            return QueryResult::invalid("At least one metric is required.");
        }

        let invocation = self.query_invocation(query);
        tracing::info!(command = %invocation.display(), "submitting metrics query");

        let output = match self.runner.run(&invocation).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(
                    command = %invocation.display(),
                    error = %err,
                    "metrics query could not run"
                );
                return QueryResult::failed(codes::COMMAND_FAILED, err.to_string());
            }
        };
        if !output.success() {
            tracing::warn!(
                command = %invocation.display(),
                exit_code = %output.exit_code_label(),
                "metrics query failed"
            );
            return QueryResult::failed(
                codes::COMMAND_FAILED,
                format!(
                    "Command failed with code {}: {}",
                    output.exit_code_label(),
                    output.stderr.trim()
                ),
            );
        }

        let rows: Vec<Row> = self.parser.parse(&output.stdout).collect();
        tracing::info!(rows = rows.len(), "metrics query returned");
        let diagnostic = format!(
            "command: {}\nstdout:\n{}\nstderr:\n{}",
            invocation.display(),
            output.stdout.trim_end(),
            output.stderr.trim_end()
        );
        QueryResult::successful(rows, diagnostic)
    }

    pub fn query_invocation(&self, query: &Query) -> Invocation {
        let config = self.cache.config();
        let mut invocation = Invocation::new(&config.mf_bin, &config.project_dir)
            .args(["query", "--metrics"])
            .arg(query.metrics.join(","));
        if !query.group_by().is_empty() {
            invocation = invocation.arg("--group-by").arg(query.group_by().join(","));
        }
        if let Some(limit) = query.limit_value() {
            invocation = invocation.arg("--limit").arg(limit.to_string());
        }
        let order = query.order_args();
        if !order.is_empty() {
            invocation = invocation.arg("--order").arg(order.join(","));
        }
        invocation
    }
}
