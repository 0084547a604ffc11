use crate::context::{self, LogContext};
use crate::logger::{LogOptions, LoggerService};
use crate::record::LogLevel;
use serde_json::{Map, Value};
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events emitted by this crate itself are never bridged back into the
/// pipeline.
const OWN_TARGET: &str = "audit_log_sink";

struct BridgedEvent {
    level: LogLevel,
    message: String,
    fields: Map<String, Value>,
    context: LogContext,
}

/// `tracing_subscriber` layer that forwards application `tracing` events
/// into a [`LoggerService`] via a bounded channel and background task.
///
/// Only events at or above `min_level` are captured. The ambient
/// [`LogContext`] of the emitting task is captured with the event so
/// records keep their correlation data even though they are delivered
/// from the background task.
pub struct PipelineLayer {
    sender: mpsc::Sender<BridgedEvent>,
    min_level: Level,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully enqueued into channel.
    pub enqueued_events: Arc<AtomicU64>,
    /// Dropped because the channel was full.
    pub dropped_events: Arc<AtomicU64>,
}

impl PipelineLayer {
    /// Create a new layer and spawn the background task feeding `logger`.
    ///
    /// Must be called from within a tokio runtime. `buffer` is raised to
    /// at least 16.
    pub fn new(logger: Arc<LoggerService>, buffer: usize, min_level: Level) -> (Self, JoinHandle<()>) {
        let buffer = buffer.max(16);
        let (tx, mut rx) = mpsc::channel::<BridgedEvent>(buffer);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let BridgedEvent { level, message, fields, context } = event;
                context::scope(
                    context,
                    logger.log(level, message, Value::Object(fields), LogOptions::default()),
                )
                .await;
            }
        });

        (
            Self {
                sender: tx,
                min_level,
                total_events: Arc::new(AtomicU64::new(0)),
                enqueued_events: Arc::new(AtomicU64::new(0)),
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

impl<S> Layer<S> for PipelineLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if *meta.level() > self.min_level || meta.target().starts_with(OWN_TARGET) {
            return;
        }

        let mut visited = EventFields::default();
        event.record(&mut visited);
        let EventFields { message, mut fields } = visited;

        fields.insert("target".to_string(), Value::String(meta.target().to_string()));
        if let Some(module) = meta.module_path() {
            fields.insert("module".to_string(), Value::String(module.to_string()));
        }
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            fields.insert("location".to_string(), Value::String(format!("{}:{}", file, line)));
        }

        let bridged = BridgedEvent {
            level: level_of(meta.level()),
            message: message.unwrap_or_else(|| meta.name().to_string()),
            fields,
            context: context::get(),
        };

        match self.sender.try_send(bridged) {
            Ok(()) => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Fields of one event, with the formatted `message` split out.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(text)) => self.message = Some(text),
            (name, value) => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, value.to_string().into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{:?}", value).into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::events::LogEvent;
    use crate::memory_sink::{NoopApi, StaticTokenFetcher};
    use tokio::time::{timeout, Duration};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    fn event_logger() -> Arc<LoggerService> {
        let config = PipelineConfig {
            client_id: "bridge".into(),
            emit_events: true,
            ..PipelineConfig::default()
        };
        Arc::new(
            LoggerService::with_backends(
                config,
                Arc::new(NoopApi),
                Arc::new(StaticTokenFetcher::new(Duration::from_secs(60))),
                None,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn forwards_events_at_or_above_threshold() {
        let logger = event_logger();
        let mut rx = logger.subscribe();
        let (layer, _handle) = PipelineLayer::new(Arc::clone(&logger), 64, Level::WARN);
        let enqueued = Arc::clone(&layer.enqueued_events);
        let total = Arc::clone(&layer.total_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("ignored");
            tracing::warn!(order_id = 42, password = "pw", "payment slow");
            tracing::error!(target: "audit_log_sink::backend", "internal");
        });

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let LogEvent::Record(record) = event else {
            panic!("expected a single record");
        };
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.message, "payment slow");
        assert_eq!(record.context["order_id"], 42);
        assert_eq!(record.context["password"], crate::masking::MASKED);
        assert_eq!(total.load(Ordering::Relaxed), 3);
        assert_eq!(enqueued.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn carries_ambient_context_across_the_channel() {
        let logger = event_logger();
        let mut rx = logger.subscribe();
        let (layer, _handle) = PipelineLayer::new(Arc::clone(&logger), 64, Level::ERROR);
        let subscriber = Registry::default().with(layer);
        let ctx = LogContext::new().with_correlation_id("req-7").with_user_id("u9");

        context::scope(ctx, async {
            tracing::subscriber::with_default(subscriber, || {
                tracing::error!("boom");
            });
        })
        .await;

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let LogEvent::Record(record) = event else {
            panic!("expected a single record");
        };
        assert_eq!(record.correlation_id, "req-7");
        assert_eq!(record.user_id.as_deref(), Some("u9"));
    }
}
