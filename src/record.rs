use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Severity of a [`LogRecord`].
///
/// Ordering follows verbosity for the regular levels. `Audit` sorts last but
/// is never compared against the configured threshold, see
/// [`LogLevel::passes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Audit,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Audit => "audit",
        }
    }

    /// Whether a record of this level should be emitted when the configured
    /// minimum is `minimum`. Audit records always pass.
    pub fn passes(&self, minimum: LogLevel) -> bool {
        match self {
            LogLevel::Audit => true,
            level => *level >= minimum,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "audit" => Ok(LogLevel::Audit),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// One emitted event, serialized as-is onto the wire (`POST /api/v1/logs`,
/// the batch endpoint, Redis payloads and in-process events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub environment: String,
    pub application: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_system_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_system_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_category: Option<String>,
}

impl LogRecord {
    /// A record with only the mandatory fields populated.
    pub fn new(
        level: LogLevel,
        message: impl Into<String>,
        environment: impl Into<String>,
        application: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            level,
            environment: environment.into(),
            application: application.into(),
            application_id: None,
            message: message.into(),
            context: Map::new(),
            stack_trace: None,
            correlation_id: correlation_id.into(),
            user_id: None,
            session_id: None,
            request_id: None,
            ip_address: None,
            user_agent: None,
            referer: None,
            source_key: None,
            source_display_name: None,
            external_system_key: None,
            external_system_display_name: None,
            record_key: None,
            record_display_name: None,
            credential_id: None,
            credential_type: None,
            request_size: None,
            response_size: None,
            duration_ms: None,
            error_category: None,
            http_status_category: None,
        }
    }
}

/// Classify an HTTP status into the bucket carried by
/// [`LogRecord::http_status_category`].
pub fn http_status_category(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_filter_by_threshold_except_audit() {
        assert!(!LogLevel::Debug.passes(LogLevel::Info));
        assert!(LogLevel::Debug.passes(LogLevel::Debug));
        assert!(LogLevel::Warn.passes(LogLevel::Info));
        assert!(!LogLevel::Info.passes(LogLevel::Error));
        assert!(LogLevel::Audit.passes(LogLevel::Error));
    }

    #[test]
    fn level_parsing_accepts_aliases() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" debug ".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn wire_format_is_camel_case_and_skips_empty_fields() {
        let mut record = LogRecord::new(LogLevel::Audit, "user.created", "prod", "api", "cid-1");
        record.user_id = Some("u1".to_string());
        record.duration_ms = Some(12);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["level"], "audit");
        assert_eq!(json["correlationId"], "cid-1");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["durationMs"], 12);
        assert!(json.get("sessionId").is_none());
        assert!(json.get("stackTrace").is_none());
    }

    #[test]
    fn status_categories() {
        assert_eq!(http_status_category(201), "2xx");
        assert_eq!(http_status_category(404), "4xx");
        assert_eq!(http_status_category(503), "5xx");
    }
}
