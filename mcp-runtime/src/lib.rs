//! Model Context Protocol server for a dbt semantic layer.
//!
//! Requests arrive on stdin as one JSON object per line and every request is
//! answered with exactly one line on stdout. Logging goes to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Subcommand};
use semlayer_core::error::codes;
use semlayer_core::{CreatedQuery, Query, QueryResult, QueryStatus, TableParser};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub mod cache;
pub mod engine;
pub mod runner;
#[cfg(test)]
mod testing;
mod util;

use cache::{CacheStatus, MetricsCache};
use engine::QueryEngine;
use runner::{CommandRunner, ProcessRunner};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "dbt-semantic-layer-mcp";

const SERVER_INSTRUCTIONS: &str = "Call fetch_metrics to see the available metrics and their dimensions. \
Validate a query with create_query, then pass the returned query unchanged to fetch_query_result.";

const DOCUMENTATION: &str = "\
# dbt Semantic Layer MCP server

Tools exposed over JSON-RPC for exploring and querying the metrics defined in a dbt project.

## Tools
1. get_documentation: this guide.
2. fetch_metrics: every known metric with its description and valid dimensions.
3. create_query: validates metrics, groupBy, limit and orderBy against the metric catalog and
   returns the query to run. Nothing is executed yet.
4. fetch_query_result: runs a query returned by create_query. Pass it as {\"query\": ...}.

## Dimensions and time grains
Group by any dimension fetch_metrics lists for every metric in the query. Time dimensions take a
grain suffix, for example metric_time__day, metric_time__week or metric_time__month.

## Example
1. fetch_metrics
2. create_query {\"metrics\": [\"revenue\"], \"groupBy\": [\"metric_time__month\"], \"limit\": 12}
3. fetch_query_result {\"query\": <query from step 2>}

## Troubleshooting
- fetch_metrics returns an empty list with status \"building\" while the metric catalog is being built.
  Retry after a short wait.
- Metric and dimension names must match what fetch_metrics returns.
- A failed query reports the query tool's exit code and error output.
";

#[derive(Args, Clone, Debug)]
pub struct RuntimeArgs {
    /// dbt project the discovery and query tools run in
    #[arg(long, env = "DBT_PROJECT_DIR", default_value = ".", global = true)]
    pub project_dir: PathBuf,
    /// Metrics snapshot file (default: <project>/target/semantic_layer_cache.json)
    #[arg(long, env = "SEMLAYER_SNAPSHOT_PATH", global = true)]
    pub snapshot_path: Option<PathBuf>,
    /// Build manifest used for metric descriptions (default: <project>/target/manifest.json)
    #[arg(long, env = "SEMLAYER_MANIFEST_PATH", global = true)]
    pub manifest_path: Option<PathBuf>,
    /// Metric listing tool
    #[arg(long, env = "SEMLAYER_DBT_BIN", default_value = "dbt", global = true)]
    pub dbt_bin: String,
    /// MetricFlow CLI used for dimensions and queries
    #[arg(long, env = "SEMLAYER_MF_BIN", default_value = "mf", global = true)]
    pub mf_bin: String,
    /// Kill any external command that runs longer than this
    #[arg(long, env = "SEMLAYER_COMMAND_TIMEOUT_SECS", default_value_t = 120, global = true)]
    pub command_timeout_secs: u64,
    /// Abandon a metrics cache rebuild that runs longer than this
    #[arg(long, env = "SEMLAYER_BUILD_TIMEOUT_SECS", default_value_t = 900, global = true)]
    pub build_timeout_secs: u64,
    /// Parallel dimension lookups during a rebuild
    #[arg(long, env = "SEMLAYER_DIMENSION_CONCURRENCY", default_value_t = 8, global = true)]
    pub dimension_concurrency: usize,
    /// Extra substring marking non-data lines in query output (repeatable)
    #[arg(long = "noise-marker", global = true)]
    pub noise_markers: Vec<String>,
    /// Emit logs as JSON lines
    #[arg(long, env = "SEMLAYER_LOG_JSON", global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum McpCommands {
    /// Run the MCP server over stdio
    Serve,
    /// Rebuild and persist the metrics snapshot, then print a summary
    Refresh,
}

pub async fn run(args: RuntimeArgs, command: McpCommands) -> i32 {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(util::command_timeout(&args)));
    let cache = Arc::new(MetricsCache::new(util::cache_config(&args), Arc::clone(&runner)));

    match command {
        McpCommands::Serve => {
            let engine = QueryEngine::new(
                Arc::clone(&cache),
                runner,
                TableParser::new(args.noise_markers),
            );
            let server = McpServer::new(Arc::clone(&cache), engine);
            tracing::info!(
                server = MCP_SERVER_NAME,
                version = env!("CARGO_PKG_VERSION"),
                project_dir = %cache.config().project_dir.display(),
                "serving MCP over stdio"
            );
            let _initial_build = cache.start();
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(error = %err, "MCP server stopped");
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Refresh => match cache.refresh().await {
            Ok(snapshot) => {
                let payload = json!({
                    "status": "ready",
                    "metrics": snapshot.len(),
                    "builtAt": snapshot.built_at(),
                    "snapshotPath": cache.config().snapshot_path.display().to_string(),
                });
                println!("{}", to_pretty_json(&payload));
                0
            }
            Err(err) => {
                tracing::error!(error = %err, "metrics cache refresh failed");
                let payload = json!({
                    "error": "refresh_failed",
                    "message": err.to_string(),
                });
                eprintln!("{}", to_pretty_json(&payload));
                1
            }
        },
    }
}

/// Line-delimited JSON-RPC front end over the metrics cache and query engine.
#[derive(Clone)]
pub struct McpServer {
    cache: Arc<MetricsCache>,
    engine: Arc<QueryEngine>,
}

impl McpServer {
    pub fn new(cache: Arc<MetricsCache>, engine: QueryEngine) -> Self {
        Self {
            cache,
            engine: Arc::new(engine),
        }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        let reader = BufReader::new(io::stdin());
        let mut stdout = io::stdout();
        self.serve(reader, &mut stdout)
            .await
            .map_err(|e| format!("MCP transport failed: {e}"))
    }

    /// Answers one line at a time until `reader` is exhausted.
    pub async fn serve<R, W>(&self, mut reader: R, writer: &mut W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let incoming = match serde_json::from_str::<Value>(line) {
                Ok(incoming) => incoming,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed input line");
                    continue;
                }
            };
            if let Some(response) = self.handle_message(incoming).await {
                write_line(writer, &response).await?;
            }
        }
        tracing::info!("input closed; MCP server exiting");
        Ok(())
    }

    async fn handle_message(&self, incoming: Value) -> Option<Value> {
        let Value::Object(mut obj) = incoming else {
            tracing::warn!("skipping input line that is not a JSON object");
            return None;
        };

        let method = obj.get("method").and_then(Value::as_str).map(str::to_owned);
        let id = match obj.remove("id") {
            None | Some(Value::Null) => {
                match method {
                    Some(method) => self.handle_notification(&method),
                    None => tracing::debug!("ignoring message without id or method"),
                }
                return None;
            }
            Some(id) => id,
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }
        let Some(method) = method else {
            return Some(error_response(
                id,
                RpcError::invalid_request("Request requires string field 'method'"),
            ));
        };
        let params = obj.remove("params").unwrap_or(Value::Null);

        tracing::debug!(method = %method, id = %id, "handling request");
        let server = self.clone();
        let task = tokio::spawn({
            let method = method.clone();
            async move { server.handle_request(&method, params).await }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(method = %method, id = %id, error = %err, "request handler failed");
                Err(RpcError::internal(join_error_message(err)))
            }
        };

        Some(match result {
            Ok(payload) => success_response(id, payload),
            Err(err) => error_response(id, err),
        })
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" | "notifications/cancelled" => {
                tracing::debug!(method, "notification received");
            }
            _ => tracing::debug!(method, "ignoring unknown notification"),
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let call = ToolCall::parse(name, args)?;
        tracing::info!(tool = name, "tool call");
        let (envelope, is_error) = self.call_tool(&call).await;
        if is_error {
            tracing::info!(tool = name, "tool call returned an error result");
        }
        Ok(build_tool_call_response(&call, envelope, is_error))
    }

    async fn call_tool(&self, call: &ToolCall) -> (Value, bool) {
        match call {
            ToolCall::GetDocumentation => (json!({ "documentation": DOCUMENTATION }), false),
            ToolCall::FetchMetrics => (fetch_metrics_payload(&self.cache.fetch()), false),
            ToolCall::CreateQuery(args) => {
                let parsed = serde_json::from_value::<Query>(Value::Object(args.clone()));
                let created = match parsed {
                    Ok(query) => to_envelope(&self.engine.create_query(query)),
                    Err(err) => to_envelope(&CreatedQuery::rejected(
                        codes::INVALID_ARGUMENTS,
                        format!("Invalid create_query arguments: {err}"),
                        Value::Object(args.clone()),
                    )),
                };
                let is_error = created["status"] != "created";
                (created, is_error)
            }
            ToolCall::FetchQueryResult(args) => {
                let parsed =
                    serde_json::from_value::<FetchQueryResultArgs>(Value::Object(args.clone()));
                let result = match parsed {
                    Ok(args) => self.engine.run_query(&args.query).await,
                    Err(err) => QueryResult::failed(
                        codes::INVALID_ARGUMENTS,
                        format!("Invalid fetch_query_result arguments: {err}"),
                    ),
                };
                let is_error = result.status == QueryStatus::Error;
                (to_envelope(&result), is_error)
            }
        }
    }
}

/// A `tools/call` request resolved to a known tool.
#[derive(Debug, Clone, PartialEq)]
enum ToolCall {
    GetDocumentation,
    FetchMetrics,
    CreateQuery(Map<String, Value>),
    FetchQueryResult(Map<String, Value>),
}

impl ToolCall {
    fn parse(name: &str, args: Map<String, Value>) -> Result<Self, RpcError> {
        match name {
            "get_documentation" => Ok(Self::GetDocumentation),
            "fetch_metrics" => Ok(Self::FetchMetrics),
            "create_query" => Ok(Self::CreateQuery(args)),
            "fetch_query_result" => Ok(Self::FetchQueryResult(args)),
            _ => Err(RpcError::invalid_params(format!("Unknown tool: {name}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchQueryResultArgs {
    query: Query,
}

fn fetch_metrics_payload(status: &CacheStatus) -> Value {
    match status {
        CacheStatus::Ready(snapshot) => {
            let mut payload = json!({
                "metrics": snapshot.metrics(),
                "status": status.as_str(),
            });
            if let Some(built_at) = snapshot.built_at() {
                payload["builtAt"] = json!(built_at);
            }
            payload
        }
        CacheStatus::Building => json!({
            "metrics": [],
            "status": status.as_str(),
            "errorCode": codes::CACHE_NOT_READY,
            "warning": "The metrics cache is still building. Retry fetch_metrics shortly.",
        }),
        CacheStatus::Absent => json!({
            "metrics": [],
            "status": status.as_str(),
            "errorCode": codes::CACHE_NOT_READY,
            "warning": "No metrics cache is available. Check the server log for a failed build or run `semlayer-mcp refresh`.",
        }),
    }
}

fn initialize_payload() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "tools": {
                "listChanged": false
            }
        },
        "serverInfo": {
            "name": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "instructions": SERVER_INSTRUCTIONS
    })
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_documentation",
            description: "Guide to the semantic layer tools, dimension naming and time grains.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fetch_metrics",
            description: "List every metric with its description and valid group-by dimensions.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "create_query",
            description: "Validate a metrics query against the metric catalog. Returns the query to pass to fetch_query_result.",
            input_schema: query_schema(),
        },
        ToolDefinition {
            name: "fetch_query_result",
            description: "Run a query returned by create_query and return its rows.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": query_schema()
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        },
    ]
}

fn name_list_schema(description: &str) -> Value {
    json!({
        "type": "array",
        "description": description,
        "items": {
            "oneOf": [
                { "type": "string" },
                {
                    "type": "object",
                    "properties": { "name": { "type": "string" } },
                    "required": ["name"]
                }
            ]
        }
    })
}

fn query_schema() -> Value {
    let name_ref = json!({
        "type": "object",
        "properties": { "name": { "type": "string" } },
        "required": ["name"]
    });
    json!({
        "type": "object",
        "properties": {
            "metrics": name_list_schema("Metrics to query (at least one)"),
            "groupBy": name_list_schema("Dimensions to group by, e.g. metric_time__month"),
            "limit": {
                "type": "number",
                "description": "Maximum number of rows; must be a positive integer"
            },
            "orderBy": {
                "type": "array",
                "description": "Ordering: \"-name\" for descending, or {descending, metric|groupBy}",
                "items": {
                    "oneOf": [
                        { "type": "string" },
                        {
                            "type": "object",
                            "properties": {
                                "descending": { "type": "boolean" },
                                "metric": name_ref,
                                "groupBy": name_ref
                            }
                        }
                    ]
                }
            }
        },
        "required": ["metrics"],
        "additionalProperties": false
    })
}

fn tool_text_content(call: &ToolCall, envelope: &Value) -> String {
    match (call, envelope.get("documentation").and_then(Value::as_str)) {
        (ToolCall::GetDocumentation, Some(text)) => text.to_string(),
        _ => to_pretty_json(envelope),
    }
}

fn build_tool_call_response(call: &ToolCall, envelope: Value, is_error: bool) -> Value {
    let text = tool_text_content(call, &envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn to_envelope<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize tool result");
        json!({ "status": "error", "error": format!("Failed to serialize result: {err}") })
    })
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
        }
    }
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("Request handler was cancelled: {err}");
    }
    let panic = err.into_panic();
    let detail = panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Internal error: {detail}")
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    })
}

/// One compact JSON document per line; serde_json escapes embedded newlines.
async fn write_line<W>(writer: &mut W, value: &Value) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut body = serde_json::to_vec(value).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    body.push(b'\n');
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
