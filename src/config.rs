use crate::env::*;
use crate::error::ConfigError;
use crate::record::LogLevel;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::time::Duration;

/// Audit capture and batching settings.
///
/// **Fields**
/// - `enabled`: when `false`, `audit()` calls are no-ops.
/// - `batch_size`: flush once this many audit records are buffered; `0`
///   disables batching so audit records take the regular delivery path.
/// - `batch_interval`: flush this long after the first unflushed record.
/// - `skip_endpoints`: audit calls whose endpoint contains any of these
///   substrings are not captured.
/// - `max_response_size`: caller-context strings longer than this many
///   characters are truncated.
/// - `max_masking_size`: caller contexts serializing larger than this many
///   bytes are replaced by a placeholder instead of being walked.
/// - `shutdown_grace`: upper bound on the final flush at shutdown.
#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub skip_endpoints: Vec<String>,
    pub max_response_size: usize,
    pub max_masking_size: usize,
    pub shutdown_grace: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            batch_interval: Duration::from_millis(100),
            skip_endpoints: Vec::new(),
            max_response_size: 10 * 1024,
            max_masking_size: 50 * 1024,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl AuditConfig {
    pub fn batching(&self) -> bool {
        self.batch_size > 0
    }

    /// Whether an audit call for `endpoint` is excluded from capture.
    pub fn should_skip(&self, endpoint: &str) -> bool {
        self.skip_endpoints
            .iter()
            .any(|skip| !skip.is_empty() && endpoint.contains(skip.as_str()))
    }

    /// Enforce minimal thresholds to avoid degenerate configs.
    fn clamped(mut self) -> Self {
        if self.batch_interval < Duration::from_millis(10) {
            self.batch_interval = Duration::from_millis(10);
        }
        self
    }
}

/// Complete configuration of one pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub controller_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Defaults for records whose call chain carries no application context.
    pub environment: String,
    pub application: String,
    pub application_id: Option<String>,
    pub level: LogLevel,
    pub emit_events: bool,
    /// Capacity of the in-process event channel.
    pub event_capacity: usize,
    pub mask_sensitive_data: bool,
    pub sensitive_fields_config: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub http_timeout: Duration,
    pub audit: AuditConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            controller_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            environment: "development".to_string(),
            application: "unknown".to_string(),
            application_id: None,
            level: LogLevel::Info,
            emit_events: false,
            event_capacity: 1024,
            mask_sensitive_data: true,
            sensitive_fields_config: None,
            redis_url: None,
            http_timeout: Duration::from_secs(30),
            audit: AuditConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Start from defaults with the controller credentials filled in.
    pub fn new(
        controller_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            controller_url: controller_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from `LOG_SINK_*` environment variables. Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let audit_defaults = AuditConfig::default();

        let audit = AuditConfig {
            enabled: parse_env(LOG_SINK_AUDIT_ENABLED_ENV, audit_defaults.enabled)?,
            batch_size: parse_env(LOG_SINK_AUDIT_BATCH_SIZE_ENV, audit_defaults.batch_size)?,
            batch_interval: Duration::from_millis(parse_env(
                LOG_SINK_AUDIT_BATCH_INTERVAL_MS_ENV,
                audit_defaults.batch_interval.as_millis() as u64,
            )?),
            skip_endpoints: env_opt(LOG_SINK_AUDIT_SKIP_ENDPOINTS_ENV)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            max_response_size: parse_env(
                LOG_SINK_AUDIT_MAX_RESPONSE_SIZE_ENV,
                audit_defaults.max_response_size,
            )?,
            max_masking_size: parse_env(
                LOG_SINK_AUDIT_MAX_MASKING_SIZE_ENV,
                audit_defaults.max_masking_size,
            )?,
            shutdown_grace: audit_defaults.shutdown_grace,
        };

        let config = Self {
            controller_url: env_or(LOG_SINK_CONTROLLER_URL_ENV, &defaults.controller_url),
            client_id: env_or(LOG_SINK_CLIENT_ID_ENV, &defaults.client_id),
            client_secret: env_or(LOG_SINK_CLIENT_SECRET_ENV, &defaults.client_secret),
            environment: env_or(LOG_SINK_ENVIRONMENT_ENV, &defaults.environment),
            application: env_or(LOG_SINK_APPLICATION_ENV, &defaults.application),
            application_id: env_opt(LOG_SINK_APPLICATION_ID_ENV),
            level: parse_env(LOG_SINK_LEVEL_ENV, defaults.level)?,
            emit_events: parse_env(LOG_SINK_EMIT_EVENTS_ENV, defaults.emit_events)?,
            event_capacity: defaults.event_capacity,
            mask_sensitive_data: parse_env(
                LOG_SINK_MASK_SENSITIVE_DATA_ENV,
                defaults.mask_sensitive_data,
            )?,
            sensitive_fields_config: env_opt(LOG_SINK_SENSITIVE_FIELDS_CONFIG_ENV).map(PathBuf::from),
            redis_url: env_opt(LOG_SINK_REDIS_URL_ENV),
            http_timeout: Duration::from_millis(parse_env(
                LOG_SINK_HTTP_TIMEOUT_MS_ENV,
                defaults.http_timeout.as_millis() as u64,
            )?),
            audit,
        };
        Ok(config)
    }

    /// Check for structural misuse and clamp degenerate values.
    ///
    /// A client id is always required. Secret and controller URL are only
    /// required when records can leave the process.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if !self.emit_events {
            if self.client_secret.trim().is_empty() {
                return Err(ConfigError::MissingClientSecret);
            }
            let url = self.controller_url.trim();
            if url.is_empty() {
                return Err(ConfigError::MissingControllerUrl);
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidUrl {
                    url: url.to_string(),
                    reason: "expected an http:// or https:// scheme".to_string(),
                });
            }
        }

        Ok(Self {
            audit: self.audit.clamped(),
            event_capacity: self.event_capacity.max(16),
            ..self
        })
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}
