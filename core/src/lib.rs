//! Domain types shared by the semantic layer MCP server: metrics and their
//! snapshots, client queries and results, and parsers for the text the
//! external discovery and query tools print.

pub mod error;
pub mod listing;
pub mod metrics;
pub mod query;
pub mod table;

pub use metrics::{Metric, MetricsSnapshot};
pub use query::{CreatedQuery, InvalidDimension, Query, QueryResult, QueryStatus};
pub use table::{Row, TableParser};
