use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ConfigError, DeliveryError};
use crate::events::{EventChannel, LogEvent};
use crate::record::{LogLevel, LogRecord};
use crate::sink::{audit_key, log_key, KeyValueQueue, LogApi};
use crate::token::TokenManager;

/// Where a record (or an audit batch) goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    /// In-process event emission only; no network.
    Events,
    /// Hand-off to the audit batch queue.
    Queue,
    /// Redis push, falling back to `Http` when it fails.
    KeyValue,
    /// Direct, breaker-gated delivery to the controller.
    Http,
}

/// Single routing decision shared by the logger and the batch queue.
///
/// Order: event emission wins over everything; audit records go to the
/// batch queue when batching is on; otherwise the key-value queue when one
/// is configured, else HTTP.
pub fn select_channel(
    emit_events: bool,
    level: LogLevel,
    audit_batching: bool,
    key_value_configured: bool,
) -> DeliveryChannel {
    if emit_events {
        DeliveryChannel::Events
    } else if level == LogLevel::Audit && audit_batching {
        DeliveryChannel::Queue
    } else if key_value_configured {
        DeliveryChannel::KeyValue
    } else {
        DeliveryChannel::Http
    }
}

/// Result of one routed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Emitted,
    Pushed,
    Delivered,
    /// The breaker was open; nothing was attempted.
    Skipped,
    Failed(DeliveryError),
}

/// Counters shared by every delivery path of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    emitted: AtomicU64,
    pushed: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub emitted: u64,
    pub pushed: u64,
    pub delivered: u64,
    /// Records never attempted because a breaker was open.
    pub breaker_skips: u64,
    /// Records lost after a failed attempt.
    pub dropped: u64,
}

impl PipelineStats {
    fn count(&self, outcome: &Outcome, records: u64) {
        let counter = match outcome {
            Outcome::Emitted => &self.emitted,
            Outcome::Pushed => &self.pushed,
            Outcome::Delivered => &self.delivered,
            Outcome::Skipped => &self.skipped,
            Outcome::Failed(_) => &self.dropped,
        };
        counter.fetch_add(records, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            breaker_skips: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Delivery backends of one pipeline plus the fallback chain over them.
///
/// Circuit breakers are not owned here: each caller (logger, batch queue)
/// passes its own so their failure counts stay independent.
pub struct Delivery {
    client_id: String,
    emit_events: bool,
    events: EventChannel,
    key_value: Option<Arc<dyn KeyValueQueue>>,
    api: Arc<dyn LogApi>,
    tokens: TokenManager,
    stats: Arc<PipelineStats>,
}

impl Delivery {
    pub fn new(
        client_id: impl Into<String>,
        emit_events: bool,
        events: EventChannel,
        key_value: Option<Arc<dyn KeyValueQueue>>,
        api: Arc<dyn LogApi>,
        tokens: TokenManager,
    ) -> Self {
        Delivery {
            client_id: client_id.into(),
            emit_events,
            events,
            key_value,
            api,
            tokens,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Channel for a single record.
    pub fn channel_for(&self, level: LogLevel, audit_batching: bool) -> DeliveryChannel {
        select_channel(self.emit_events, level, audit_batching, self.key_value.is_some())
    }

    /// Channel for a flushed batch: the same chain without the queue hop.
    pub fn channel_for_batch(&self) -> DeliveryChannel {
        select_channel(self.emit_events, LogLevel::Audit, false, self.key_value.is_some())
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Route one record starting at `channel`. Never fails; the outcome is
    /// returned for accounting only.
    pub async fn deliver_record(
        &self,
        record: &LogRecord,
        channel: DeliveryChannel,
        breaker: &CircuitBreaker,
    ) -> Outcome {
        let outcome = match channel {
            DeliveryChannel::Events => {
                self.events.emit(LogEvent::Record(record.clone()));
                Outcome::Emitted
            }
            DeliveryChannel::Queue | DeliveryChannel::KeyValue | DeliveryChannel::Http => {
                match self.push(&log_key(&self.client_id), record).await {
                    Some(outcome) => outcome,
                    None => {
                        self.http(breaker, |token| async move { self.api.send(record, &token).await })
                            .await
                    }
                }
            }
        };
        self.stats.count(&outcome, 1);
        outcome
    }

    /// Route a whole batch as one unit starting at `channel`.
    pub async fn deliver_batch(
        &self,
        records: Vec<LogRecord>,
        channel: DeliveryChannel,
        breaker: &CircuitBreaker,
    ) -> Outcome {
        let len = records.len() as u64;
        let outcome = match channel {
            DeliveryChannel::Events => {
                self.events.emit(LogEvent::Batch(records));
                Outcome::Emitted
            }
            DeliveryChannel::Queue | DeliveryChannel::KeyValue | DeliveryChannel::Http => {
                match self.push(&audit_key(&self.client_id), &records).await {
                    Some(outcome) => outcome,
                    None => {
                        let records = &records;
                        self.http(breaker, |token| async move {
                            self.api.send_batch(records, &token).await
                        })
                        .await
                    }
                }
            }
        };
        self.stats.count(&outcome, len);
        outcome
    }

    /// Try the key-value queue. `None` means fall through to HTTP.
    async fn push<T: serde::Serialize + ?Sized>(&self, key: &str, payload: &T) -> Option<Outcome> {
        let queue = self.key_value.as_ref()?;
        let payload = match serde_json::to_string(payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(error = %err, "cannot serialize payload for key-value queue");
                return None;
            }
        };
        match queue.push(key, payload).await {
            Ok(()) => Some(Outcome::Pushed),
            Err(err) => {
                tracing::debug!(key, error = %err, "key-value push failed, falling back to http");
                None
            }
        }
    }

    async fn http<F, Fut>(&self, breaker: &CircuitBreaker, attempt: F) -> Outcome
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<(), DeliveryError>>,
    {
        if breaker.is_open() {
            return Outcome::Skipped;
        }

        let result = match self.tokens.get_token().await {
            Ok(token) => attempt(token).await,
            Err(err) => Err(err),
        };
        if matches!(result, Err(ref err) if err.is_auth_failure()) {
            self.tokens.invalidate();
        }
        breaker.record(&result);

        match result {
            Ok(()) => Outcome::Delivered,
            Err(err) => {
                tracing::debug!(breaker = breaker.name(), error = %err, "log delivery failed, record dropped");
                Outcome::Failed(err)
            }
        }
    }
}

/// Build the key-value queue for a Redis URL.
///
/// Returns `Ok(None)` when no URL is configured.
pub fn make_key_value_queue(
    url: Option<&str>,
) -> Result<Option<Arc<dyn KeyValueQueue>>, ConfigError> {
    let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
        return Ok(None);
    };

    #[cfg(feature = "redis")]
    {
        let queue = crate::redis::RedisQueue::new(url, 8)?;
        Ok(Some(Arc::new(queue) as Arc<dyn KeyValueQueue>))
    }

    #[cfg(not(feature = "redis"))]
    {
        let _ = url;
        Err(ConfigError::KeyValue("redis feature is not enabled".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_sink::{MemoryQueue, RecordingApi, StaticTokenFetcher};
    use tokio::time::Duration;

    fn record(message: &str) -> LogRecord {
        LogRecord::new(LogLevel::Info, message, "test", "app", "cid")
    }

    fn delivery(
        emit_events: bool,
        queue: Option<Arc<MemoryQueue>>,
        api: Arc<RecordingApi>,
    ) -> Delivery {
        let tokens = TokenManager::new(Arc::new(StaticTokenFetcher::new(Duration::from_secs(3600))));
        Delivery::new(
            "client-1",
            emit_events,
            EventChannel::new(16),
            queue.map(|q| q as Arc<dyn KeyValueQueue>),
            api,
            tokens,
        )
    }

    #[test]
    fn channel_selection_order() {
        use DeliveryChannel::*;
        assert_eq!(select_channel(true, LogLevel::Audit, true, true), Events);
        assert_eq!(select_channel(false, LogLevel::Audit, true, true), Queue);
        assert_eq!(select_channel(false, LogLevel::Audit, false, true), KeyValue);
        assert_eq!(select_channel(false, LogLevel::Error, true, true), KeyValue);
        assert_eq!(select_channel(false, LogLevel::Error, true, false), Http);
    }

    #[tokio::test]
    async fn events_mode_never_touches_the_network() {
        let api = Arc::new(RecordingApi::new());
        let queue = Arc::new(MemoryQueue::new());
        let delivery = delivery(true, Some(queue.clone()), api.clone());
        let mut rx = delivery.events().subscribe();
        let breaker = CircuitBreaker::new("test");

        let channel = delivery.channel_for(LogLevel::Info, false);
        let outcome = delivery.deliver_record(&record("hi"), channel, &breaker).await;

        assert_eq!(outcome, Outcome::Emitted);
        assert!(matches!(rx.recv().await.unwrap(), LogEvent::Record(r) if r.message == "hi"));
        assert_eq!(api.attempts(), 0);
        assert!(queue.pushes().is_empty());
    }

    #[tokio::test]
    async fn key_value_success_stops_the_chain() {
        let api = Arc::new(RecordingApi::new());
        let queue = Arc::new(MemoryQueue::new());
        let delivery = delivery(false, Some(queue.clone()), api.clone());
        let breaker = CircuitBreaker::new("test");

        let outcome = delivery
            .deliver_record(&record("hi"), DeliveryChannel::KeyValue, &breaker)
            .await;

        assert_eq!(outcome, Outcome::Pushed);
        let pushes = queue.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "logs:client-1");
        let payload: serde_json::Value = serde_json::from_str(&pushes[0].1).unwrap();
        assert_eq!(payload["message"], "hi");
        assert_eq!(api.attempts(), 0);
    }

    #[tokio::test]
    async fn key_value_failure_falls_back_to_http() {
        let api = Arc::new(RecordingApi::new());
        let queue = Arc::new(MemoryQueue::new());
        queue.set_unavailable(true);
        let delivery = delivery(false, Some(queue), api.clone());
        let breaker = CircuitBreaker::new("test");

        let outcome = delivery
            .deliver_batch(vec![record("a"), record("b")], DeliveryChannel::KeyValue, &breaker)
            .await;

        assert_eq!(outcome, Outcome::Delivered);
        assert_eq!(api.batches().len(), 1);
        assert_eq!(api.batches()[0].len(), 2);
        assert_eq!(api.tokens(), vec!["token-1"]);
        assert_eq!(delivery.stats().delivered, 2);
    }

    #[tokio::test]
    async fn unauthorized_invalidates_token_without_tripping_breaker() {
        let api = Arc::new(RecordingApi::new());
        api.fail_next(DeliveryError::Unauthorized, 5);
        let delivery = delivery(false, None, api.clone());
        let breaker = CircuitBreaker::new("test");

        for _ in 0..5 {
            let outcome = delivery.deliver_record(&record("x"), DeliveryChannel::Http, &breaker).await;
            assert_eq!(outcome, Outcome::Failed(DeliveryError::Unauthorized));
        }

        assert!(!breaker.is_open());
        assert_eq!(
            api.tokens(),
            vec!["token-1", "token-2", "token-3", "token-4", "token-5"]
        );
    }

    #[tokio::test]
    async fn open_breaker_skips_delivery() {
        let api = Arc::new(RecordingApi::new());
        api.fail_next(DeliveryError::Transport("boom".into()), 3);
        let delivery = delivery(false, None, api.clone());
        let breaker = CircuitBreaker::new("test");

        for _ in 0..3 {
            delivery.deliver_record(&record("x"), DeliveryChannel::Http, &breaker).await;
        }
        let outcome = delivery.deliver_record(&record("x"), DeliveryChannel::Http, &breaker).await;

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(api.attempts(), 3);
        let stats = delivery.stats();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.breaker_skips, 1);
    }

    #[test]
    fn no_key_value_url_means_no_queue() {
        assert!(make_key_value_queue(None).unwrap().is_none());
        assert!(make_key_value_queue(Some("  ")).unwrap().is_none());
    }
}
