//! Environment variable names used by this crate for convenient
//! configuration of the pipeline from services.
//!
//! These are purely helpers; [`crate::config::PipelineConfig`] can always be
//! built explicitly without touching the environment.

/// Controller base URL, e.g. `https://controller.example.com`.
pub const LOG_SINK_CONTROLLER_URL_ENV: &str = "LOG_SINK_CONTROLLER_URL";

/// Client id used for token acquisition and queue key namespacing.
pub const LOG_SINK_CLIENT_ID_ENV: &str = "LOG_SINK_CLIENT_ID";

/// Client secret used for token acquisition.
pub const LOG_SINK_CLIENT_SECRET_ENV: &str = "LOG_SINK_CLIENT_SECRET";

pub const LOG_SINK_ENVIRONMENT_ENV: &str = "LOG_SINK_ENVIRONMENT";
pub const LOG_SINK_APPLICATION_ENV: &str = "LOG_SINK_APPLICATION";
pub const LOG_SINK_APPLICATION_ID_ENV: &str = "LOG_SINK_APPLICATION_ID";

/// Minimum severity: `debug`, `info`, `warn` or `error`.
pub const LOG_SINK_LEVEL_ENV: &str = "LOG_SINK_LEVEL";

/// `true` to emit records in-process only.
pub const LOG_SINK_EMIT_EVENTS_ENV: &str = "LOG_SINK_EMIT_EVENTS";

pub const LOG_SINK_MASK_SENSITIVE_DATA_ENV: &str = "LOG_SINK_MASK_SENSITIVE_DATA";

/// Path to a JSON file overriding the sensitive keyword set.
pub const LOG_SINK_SENSITIVE_FIELDS_CONFIG_ENV: &str = "LOG_SINK_SENSITIVE_FIELDS_CONFIG";

/// Optional Redis URL enabling the key-value queue.
pub const LOG_SINK_REDIS_URL_ENV: &str = "LOG_SINK_REDIS_URL";

pub const LOG_SINK_AUDIT_ENABLED_ENV: &str = "LOG_SINK_AUDIT_ENABLED";
pub const LOG_SINK_AUDIT_BATCH_SIZE_ENV: &str = "LOG_SINK_AUDIT_BATCH_SIZE";
pub const LOG_SINK_AUDIT_BATCH_INTERVAL_MS_ENV: &str = "LOG_SINK_AUDIT_BATCH_INTERVAL_MS";

/// Comma-separated endpoint substrings excluded from audit capture.
pub const LOG_SINK_AUDIT_SKIP_ENDPOINTS_ENV: &str = "LOG_SINK_AUDIT_SKIP_ENDPOINTS";

pub const LOG_SINK_AUDIT_MAX_RESPONSE_SIZE_ENV: &str = "LOG_SINK_AUDIT_MAX_RESPONSE_SIZE";
pub const LOG_SINK_AUDIT_MAX_MASKING_SIZE_ENV: &str = "LOG_SINK_AUDIT_MAX_MASKING_SIZE";

pub const LOG_SINK_HTTP_TIMEOUT_MS_ENV: &str = "LOG_SINK_HTTP_TIMEOUT_MS";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a non-empty environment variable.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
