use thiserror::Error;

/// Errors raised while decoding discovery artifacts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Machine-readable codes carried in tool error payloads.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const INVALID_ARGUMENTS: &str = "invalid_arguments";
    pub const CACHE_NOT_READY: &str = "cache_not_ready";
    pub const COMMAND_FAILED: &str = "command_failed";
}
