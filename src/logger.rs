//! The logging entry point.
//!
//! [`LoggerService`] turns a call (`info`, `audit`, ...) into a [`LogRecord`]
//! enriched from the ambient call-chain context, masks the caller-supplied
//! context, and routes the record to events, the audit batch queue, the
//! key-value queue or the controller. Calls never fail: delivery problems
//! are counted by a circuit breaker and the record is dropped.

use crate::backend::{make_key_value_queue, Delivery, DeliveryChannel, Outcome, StatsSnapshot};
use crate::circuit_breaker::CircuitBreaker;
use crate::claims::{decode_claims, TokenClaims};
use crate::config::PipelineConfig;
use crate::context::{self, LogContext};
use crate::error::ConfigError;
use crate::events::{EventChannel, LogEvent};
use crate::http::{ControllerClient, ControllerConfig};
use crate::masking::{truncate_strings, DataMasker, MASKED};
use crate::queue::AuditBatchQueue;
use crate::record::{http_status_category, LogLevel, LogRecord};
use crate::sink::{KeyValueQueue, LogApi};
use crate::token::{TokenFetcher, TokenManager};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CORRELATION_PREFIX_LEN: usize = 10;
const CORRELATION_COUNTER_MOD: u32 = 10_000;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub correlation_id: Option<String>,
    /// `Some(false)` disables masking for this call only.
    pub mask_sensitive_data: Option<bool>,
    pub application: Option<String>,
    pub application_id: Option<String>,
    pub environment: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub stack_trace: Option<String>,
    /// Request path of the audited operation, matched against
    /// `audit.skip_endpoints`.
    pub endpoint: Option<String>,
    /// Bearer token to decode for identity hints instead of the ambient one.
    pub token: Option<String>,
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn unmasked(mut self) -> Self {
        self.mask_sensitive_data = Some(false);
        self
    }

    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Log and audit entry point. Construct once and share (`Arc`) with
/// everything that logs.
pub struct LoggerService {
    config: PipelineConfig,
    masker: DataMasker,
    delivery: Arc<Delivery>,
    breaker: CircuitBreaker,
    queue: Option<AuditBatchQueue>,
    counter: AtomicU32,
}

impl LoggerService {
    /// Build a logger talking to the configured controller (and Redis, when
    /// a URL is set).
    ///
    /// **Returns**
    /// - `Err(ConfigError)` for missing credentials, a malformed URL, an
    ///   unreadable sensitive-fields file or an unusable Redis URL.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let client = Arc::new(ControllerClient::new(ControllerConfig {
            url: config.controller_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            timeout: config.http_timeout,
        })?);
        let key_value = make_key_value_queue(config.redis_url.as_deref())?;
        Self::with_backends(config, client.clone(), client, key_value)
    }

    /// Build a logger over explicit delivery backends.
    pub fn with_backends(
        config: PipelineConfig,
        api: Arc<dyn LogApi>,
        token_fetcher: Arc<dyn TokenFetcher>,
        key_value: Option<Arc<dyn KeyValueQueue>>,
    ) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let masker = match &config.sensitive_fields_config {
            Some(path) => DataMasker::from_config_file(path)?,
            None => DataMasker::default(),
        };

        let delivery = Arc::new(Delivery::new(
            config.client_id.clone(),
            config.emit_events,
            EventChannel::new(config.event_capacity),
            key_value,
            api,
            TokenManager::new(token_fetcher),
        ));

        let queue = (config.audit.enabled && config.audit.batching()).then(|| {
            AuditBatchQueue::new(
                Arc::clone(&delivery),
                config.audit.batch_size,
                config.audit.batch_interval,
                config.audit.shutdown_grace,
            )
        });

        Ok(LoggerService {
            config,
            masker,
            delivery,
            breaker: CircuitBreaker::new("logger-http"),
            queue,
            counter: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn masker(&self) -> &DataMasker {
        &self.masker
    }

    pub fn events(&self) -> &EventChannel {
        self.delivery.events()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.delivery.events().subscribe()
    }

    pub fn queue(&self) -> Option<&AuditBatchQueue> {
        self.queue.as_ref()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.delivery.stats()
    }

    pub async fn debug(&self, message: impl Into<String>, context: Value, options: LogOptions) {
        self.log(LogLevel::Debug, message.into(), context, options).await;
    }

    pub async fn info(&self, message: impl Into<String>, context: Value, options: LogOptions) {
        self.log(LogLevel::Info, message.into(), context, options).await;
    }

    pub async fn warn(&self, message: impl Into<String>, context: Value, options: LogOptions) {
        self.log(LogLevel::Warn, message.into(), context, options).await;
    }

    pub async fn error(&self, message: impl Into<String>, context: Value, options: LogOptions) {
        self.log(LogLevel::Error, message.into(), context, options).await;
    }

    /// Record that `action` was performed on `resource`. Audit records
    /// ignore the configured level; they are skipped only when audit is
    /// disabled or the endpoint is excluded.
    pub async fn audit(
        &self,
        action: impl Into<String>,
        resource: impl Into<String>,
        context: Value,
        options: LogOptions,
    ) {
        let (action, resource) = (action.into(), resource.into());
        let mut fields = into_map(context);
        fields.insert("action".to_string(), Value::String(action.clone()));
        fields.insert("resource".to_string(), Value::String(resource.clone()));

        let message = format!("Audit: {} on {}", action, resource);
        self.log(LogLevel::Audit, message, Value::Object(fields), options).await;
    }

    /// Build and route one record. Never fails.
    pub async fn log(&self, level: LogLevel, message: String, context: Value, options: LogOptions) {
        if !level.passes(self.config.level) {
            return;
        }
        if level == LogLevel::Audit {
            if !self.config.audit.enabled {
                return;
            }
            if let Some(endpoint) = &options.endpoint {
                if self.config.audit.should_skip(endpoint) {
                    return;
                }
            }
        }

        let record = self.build_record(level, message, context, options);
        let channel = self.delivery.channel_for(level, self.queue.is_some());
        match (channel, &self.queue) {
            (DeliveryChannel::Queue, Some(queue)) => queue.add(record).await,
            _ => {
                let outcome = self.delivery.deliver_record(&record, channel, &self.breaker).await;
                if let Outcome::Failed(err) = outcome {
                    tracing::debug!(level = %level, error = %err, "log record dropped");
                }
            }
        }
    }

    /// Flush pending audit records, bounded by the shutdown grace period.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.shutdown().await;
        }
    }

    /// Flush pending audit records when the process receives Ctrl-C or
    /// SIGTERM, then exit with status 130 or 143.
    ///
    /// The flush is bounded by `audit.shutdown_grace`. Without a batch queue
    /// nothing is installed and the signals keep their default action.
    pub fn install_shutdown_hook(&self) -> Option<JoinHandle<()>> {
        self.queue.as_ref().map(AuditBatchQueue::install_shutdown_hook)
    }

    /// Assemble the wire record for one call.
    pub fn build_record(
        &self,
        level: LogLevel,
        message: String,
        context: Value,
        options: LogOptions,
    ) -> LogRecord {
        let ambient = context::get();
        let claims = options
            .token
            .as_deref()
            .or(ambient.token.as_deref())
            .and_then(decode_claims)
            .unwrap_or_default();

        let mut fields = into_map(context);
        for (key, value) in &ambient.extra {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let fields = self.prepare_fields(fields, options.mask_sensitive_data);
        let lifted = Lifted::from_fields(&fields);

        let correlation_id = options
            .correlation_id
            .clone()
            .or(lifted.correlation_id)
            .or_else(|| ambient.correlation_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.next_correlation_id());

        let app = self.resolve_application(&options, lifted.application_id, &ambient, &claims);

        let mut record = LogRecord::new(level, message, app.environment, app.application, correlation_id);
        record.application_id = app.application_id;
        record.context = fields;
        record.stack_trace = options.stack_trace;
        record.user_id = options
            .user_id
            .or(lifted.user_id)
            .or(ambient.user_id)
            .or(claims.user_id);
        record.session_id = options
            .session_id
            .or(lifted.session_id)
            .or(ambient.session_id)
            .or(claims.session_id);
        record.request_id = options.request_id.or(lifted.request_id).or(ambient.request_id);
        record.ip_address = ambient.ip_address;
        record.user_agent = ambient.user_agent;
        record.referer = ambient.referer;
        record.source_key = ambient.source_key;
        record.source_display_name = ambient.source_display_name;
        record.external_system_key = ambient.external_system_key;
        record.external_system_display_name = ambient.external_system_display_name;
        record.record_key = ambient.record_key;
        record.record_display_name = ambient.record_display_name;
        record.credential_id = ambient.credential_id;
        record.credential_type = ambient.credential_type;
        record.request_size = ambient.request_size;
        record.response_size = ambient.response_size;
        record.duration_ms = ambient.duration_ms;
        record.error_category = ambient.error_category;
        record.http_status_category = ambient
            .http_status_category
            .or_else(|| lifted.status.map(|code| http_status_category(code).to_string()));
        record
    }

    fn prepare_fields(&self, fields: Map<String, Value>, mask_override: Option<bool>) -> Map<String, Value> {
        let audit = &self.config.audit;
        let fields = match truncate_strings(&Value::Object(fields), audit.max_response_size) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if mask_override.unwrap_or(self.config.mask_sensitive_data) {
            self.masker.mask_map_bounded(&fields, audit.max_masking_size)
        } else {
            fields
        }
    }

    fn resolve_application(
        &self,
        options: &LogOptions,
        lifted_application_id: Option<String>,
        ambient: &LogContext,
        claims: &TokenClaims,
    ) -> ResolvedApplication {
        let pick = |explicit: &Option<String>, ambient: &Option<String>, claim: &Option<String>| {
            explicit
                .clone()
                .or_else(|| ambient.clone())
                .or_else(|| claim.clone())
        };

        ResolvedApplication {
            application: pick(&options.application, &ambient.application, &claims.application)
                .unwrap_or_else(|| self.config.application.clone()),
            application_id: options
                .application_id
                .clone()
                .or(lifted_application_id)
                .or_else(|| pick(&None, &ambient.application_id, &claims.application_id))
                .or_else(|| self.config.application_id.clone()),
            environment: pick(&options.environment, &ambient.environment, &claims.environment)
                .unwrap_or_else(|| self.config.environment.clone()),
        }
    }

    /// `prefix(clientId, 10)-epochMillis-counter-random`.
    fn next_correlation_id(&self) -> String {
        let prefix: String = self.config.client_id.chars().take(CORRELATION_PREFIX_LEN).collect();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) % CORRELATION_COUNTER_MOD;
        let random = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            prefix,
            Utc::now().timestamp_millis(),
            counter,
            &random[..6]
        )
    }
}

struct ResolvedApplication {
    application: String,
    application_id: Option<String>,
    environment: String,
}

/// Identity fields the caller passed inside the context mapping.
///
/// Read from the already masked mapping: a field the masker hid (for
/// instance `sessionId`, which matches `session`) is not copied onto the
/// record either.
#[derive(Default)]
struct Lifted {
    status: Option<u16>,
    correlation_id: Option<String>,
    application_id: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    request_id: Option<String>,
}

impl Lifted {
    fn from_fields(fields: &Map<String, Value>) -> Self {
        let string = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty() && *s != MASKED)
                .map(str::to_string)
        };
        let status = ["statusCode", "status"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_u64))
            .and_then(|code| u16::try_from(code).ok());
        Lifted {
            status,
            correlation_id: string("correlationId"),
            application_id: string("applicationId"),
            user_id: string("userId"),
            session_id: string("sessionId"),
            request_id: string("requestId"),
        }
    }
}

fn into_map(context: Value) -> Map<String, Value> {
    match context {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
