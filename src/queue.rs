use crate::backend::{Delivery, Outcome};
use crate::circuit_breaker::CircuitBreaker;
use crate::record::LogRecord;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// A buffered audit record.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub record: LogRecord,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    buffer: Vec<QueueEntry>,
    /// Id of the armed interval timer. A timer that wakes up and finds a
    /// different id (or none) was superseded by a flush and does nothing.
    armed_timer: Option<u64>,
    next_timer: u64,
}

struct QueueInner {
    delivery: Arc<Delivery>,
    breaker: CircuitBreaker,
    batch_size: usize,
    batch_interval: Duration,
    shutdown_grace: Duration,
    state: Mutex<QueueState>,
    flushing: AtomicBool,
    flushes: AtomicU64,
}

/// Buffers audit records and delivers them as one batch when the buffer
/// reaches `batch_size`, when `batch_interval` has passed since the first
/// unflushed record, or at shutdown; whichever comes first.
///
/// Only one flush runs at a time. Records added meanwhile wait for the next
/// batch. A batch is delivered or dropped as a whole; the queue owns its own
/// circuit breaker for the HTTP path.
#[derive(Clone)]
pub struct AuditBatchQueue {
    inner: Arc<QueueInner>,
}

impl AuditBatchQueue {
    pub fn new(
        delivery: Arc<Delivery>,
        batch_size: usize,
        batch_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        AuditBatchQueue {
            inner: Arc::new(QueueInner {
                delivery,
                breaker: CircuitBreaker::new("audit-batch"),
                batch_size: batch_size.max(1),
                batch_interval,
                shutdown_grace,
                state: Mutex::new(QueueState::default()),
                flushing: AtomicBool::new(false),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    /// Buffer `record`, flushing inline if the batch is now full.
    pub async fn add(&self, record: LogRecord) {
        let full = {
            let mut state = self.inner.lock();
            state.buffer.push(QueueEntry {
                record,
                enqueued_at: Utc::now(),
            });
            if state.buffer.len() == 1 && state.armed_timer.is_none() {
                QueueInner::arm_timer(&self.inner, &mut state);
            }
            state.buffer.len() >= self.inner.batch_size
        };

        if full {
            let _ = self.spawn_flush().await;
        }
    }

    /// Deliver everything buffered now. Returns `None` when another flush
    /// is running or there is nothing to send.
    ///
    /// The flush runs on its own task: dropping the returned future stops
    /// waiting for it but never interrupts the delivery.
    pub async fn flush(&self) -> Option<Outcome> {
        self.spawn_flush().await.ok().flatten()
    }

    /// Flush once, waiting at most the configured grace period. A flush
    /// still running after that keeps going in the background.
    pub async fn shutdown(&self) {
        if timeout(self.inner.shutdown_grace, self.spawn_flush()).await.is_err() {
            tracing::warn!(
                pending = self.len(),
                "audit queue flush did not finish within shutdown grace period"
            );
        }
    }

    /// Spawn a task that waits for Ctrl-C or SIGTERM, runs
    /// [`AuditBatchQueue::shutdown`], then exits the process with the
    /// conventional status (130 for Ctrl-C, 143 for SIGTERM).
    ///
    /// Listening for a signal replaces its default action, so the hook has
    /// to end the process itself once the bounded flush is over.
    pub fn install_shutdown_hook(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let signal = wait_for_shutdown_signal().await;
            tracing::debug!(?signal, "shutdown signal received, flushing audit queue");
            queue.shutdown().await;
            std::process::exit(signal.exit_code());
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    /// Number of non-empty flushes performed.
    pub fn flushes(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    fn spawn_flush(&self) -> JoinHandle<Option<Outcome>> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.flush().await })
    }
}

/// Holds the single-flush flag; releasing it on drop keeps the queue usable
/// even when a flush future is dropped midway.
struct FlushGuard<'a> {
    inner: &'a Arc<QueueInner>,
}

impl<'a> FlushGuard<'a> {
    fn acquire(inner: &'a Arc<QueueInner>) -> Option<Self> {
        if inner.flushing.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(FlushGuard { inner })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.inner.flushing.store(false, Ordering::Release);
        // Records that arrived while flushing may have found no timer.
        if tokio::runtime::Handle::try_current().is_ok() {
            let mut state = self.inner.lock();
            if !state.buffer.is_empty() && state.armed_timer.is_none() {
                QueueInner::arm_timer(self.inner, &mut state);
            }
        }
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm_timer(this: &Arc<Self>, state: &mut QueueState) {
        let id = state.next_timer;
        state.next_timer = state.next_timer.wrapping_add(1);
        state.armed_timer = Some(id);

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            sleep(inner.batch_interval).await;
            {
                let mut state = inner.lock();
                if state.armed_timer != Some(id) {
                    return;
                }
                state.armed_timer = None;
            }
            inner.flush().await;
        });
    }

    async fn flush(self: &Arc<Self>) -> Option<Outcome> {
        let _guard = FlushGuard::acquire(self)?;

        let mut last = None;
        loop {
            let batch: Vec<LogRecord> = {
                let mut state = self.lock();
                state.armed_timer = None;
                std::mem::take(&mut state.buffer)
                    .into_iter()
                    .map(|entry| entry.record)
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            let len = batch.len();
            let channel = self.delivery.channel_for_batch();
            let outcome = self.delivery.deliver_batch(batch, channel, &self.breaker).await;
            self.flushes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(batch_len = len, ?channel, ?outcome, "audit batch flushed");
            last = Some(outcome);

            // Only a full buffer is worth flushing again right away; the
            // guard re-arms the timer for a partial one.
            if self.lock().buffer.len() < self.batch_size {
                break;
            }
        }

        last
    }
}

/// Signal that triggered the shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Shell convention: 128 + signal number.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

async fn wait_for_shutdown_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return ShutdownSignal::Interrupt;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = terminate.recv() => ShutdownSignal::Terminate,
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        ShutdownSignal::Interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::events::EventChannel;
    use crate::memory_sink::{MemoryQueue, RecordingApi, StaticTokenFetcher};
    use crate::record::LogLevel;
    use crate::sink::KeyValueQueue;
    use crate::token::TokenManager;

    fn record(n: usize) -> LogRecord {
        LogRecord::new(LogLevel::Audit, format!("event-{}", n), "test", "app", format!("cid-{}", n))
    }

    fn queue_with(
        api: Arc<RecordingApi>,
        key_value: Option<Arc<MemoryQueue>>,
        batch_size: usize,
        interval: Duration,
    ) -> AuditBatchQueue {
        let tokens = TokenManager::new(Arc::new(StaticTokenFetcher::new(Duration::from_secs(3600))));
        let delivery = Delivery::new(
            "client-1",
            false,
            EventChannel::new(16),
            key_value.map(|q| q as Arc<dyn KeyValueQueue>),
            api,
            tokens,
        );
        AuditBatchQueue::new(Arc::new(delivery), batch_size, interval, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_one_batch() {
        let api = Arc::new(RecordingApi::new());
        let queue = queue_with(api.clone(), None, 3, Duration::from_secs(60));

        for n in 0..3 {
            queue.add(record(n)).await;
        }

        let batches = api.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][2].message, "event-2");
        assert!(queue.is_empty());
        assert_eq!(queue.flushes(), 1);

        // The superseded interval timer must not produce a second flush.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_trigger_flushes_after_interval() {
        let api = Arc::new(RecordingApi::new());
        let queue = queue_with(api.clone(), None, 10, Duration::from_millis(100));

        queue.add(record(0)).await;

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(queue.flushes(), 0);
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(queue.flushes(), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.flushes(), 1);
        assert_eq!(api.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_is_armed_only_by_first_record() {
        let api = Arc::new(RecordingApi::new());
        let queue = queue_with(api.clone(), None, 10, Duration::from_millis(100));

        queue.add(record(0)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        queue.add(record(1)).await;
        tokio::time::sleep(Duration::from_millis(41)).await;

        let batches = api.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn batches_go_to_key_value_queue_first() {
        let api = Arc::new(RecordingApi::new());
        let kv = Arc::new(MemoryQueue::new());
        let queue = queue_with(api.clone(), Some(kv.clone()), 2, Duration::from_secs(60));

        queue.add(record(0)).await;
        queue.add(record(1)).await;

        let pushes = kv.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "audit-logs:client-1");
        let payload: Vec<serde_json::Value> = serde_json::from_str(&pushes[0].1).unwrap();
        assert_eq!(payload.len(), 2);
        assert_eq!(api.attempts(), 0);
    }

    #[tokio::test]
    async fn failed_batch_is_dropped_whole() {
        let api = Arc::new(RecordingApi::new());
        api.fail_next(DeliveryError::Status { status: 500, body: "oops".into() }, 1);
        let queue = queue_with(api.clone(), None, 2, Duration::from_secs(60));

        queue.add(record(0)).await;
        queue.add(record(1)).await;
        assert!(queue.is_empty());
        assert!(api.batches().is_empty());

        queue.add(record(2)).await;
        queue.add(record(3)).await;
        let batches = api.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].message, "event-2");
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_skips_batches_after_repeated_failures() {
        let api = Arc::new(RecordingApi::new());
        api.fail_next(DeliveryError::Transport("down".into()), 3);
        let queue = queue_with(api.clone(), None, 1, Duration::from_secs(60));

        for n in 0..4 {
            queue.add(record(n)).await;
        }
        assert_eq!(api.attempts(), 3);
        assert!(queue.breaker().is_open());

        tokio::time::advance(Duration::from_secs(60)).await;
        queue.add(record(9)).await;
        assert_eq!(api.attempts(), 4);
        assert_eq!(api.batches().len(), 1);
    }

    #[tokio::test]
    async fn flush_of_empty_queue_is_a_no_op() {
        let api = Arc::new(RecordingApi::new());
        let queue = queue_with(api.clone(), None, 5, Duration::from_secs(60));
        assert_eq!(queue.flush().await, None);
        assert_eq!(queue.flushes(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_records() {
        let api = Arc::new(RecordingApi::new());
        let queue = queue_with(api.clone(), None, 50, Duration::from_secs(60));
        queue.add(record(0)).await;
        queue.add(record(1)).await;

        queue.shutdown().await;

        assert_eq!(api.batches().len(), 1);
        assert_eq!(api.batches()[0].len(), 2);
        assert!(!queue.is_flushing());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_add_does_not_stall_the_queue() {
        let api = Arc::new(RecordingApi::new().with_delay(Duration::from_millis(500)));
        let queue = queue_with(api.clone(), None, 2, Duration::from_secs(60));

        queue.add(record(0)).await;
        // The size-triggered flush outlives the caller that started it.
        assert!(timeout(Duration::from_millis(10), queue.add(record(1))).await.is_err());
        assert!(queue.is_flushing());

        for n in 2..10 {
            queue.add(record(n)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!queue.is_flushing());
        assert!(queue.is_empty());
        let delivered: usize = api.batches().iter().map(Vec::len).sum();
        assert_eq!(delivered, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn records_added_during_flush_get_their_own_timer() {
        let api = Arc::new(RecordingApi::new().with_delay(Duration::from_millis(500)));
        let queue = queue_with(api.clone(), None, 10, Duration::from_millis(100));

        queue.add(record(0)).await;
        // Interval flush starts at 100ms and holds the flag until 600ms.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_flushing());
        queue.add(record(1)).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        let batches = api.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].message, "event-1");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_by_grace_period() {
        let api = Arc::new(RecordingApi::new().with_delay(Duration::from_secs(5)));
        let queue = queue_with(api.clone(), None, 50, Duration::from_secs(60));
        queue.add(record(0)).await;

        let started = tokio::time::Instant::now();
        queue.shutdown().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
        assert!(api.batches().is_empty());

        // The slow flush finishes in the background and the queue keeps working.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.batches().len(), 1);
        assert!(!queue.is_flushing());

        queue.add(record(1)).await;
        assert_eq!(queue.flush().await, Some(Outcome::Delivered));
        assert_eq!(api.batches().len(), 2);
    }

    #[test]
    fn shutdown_signals_map_to_shell_exit_codes() {
        assert_eq!(ShutdownSignal::Interrupt.exit_code(), 130);
        assert_eq!(ShutdownSignal::Terminate.exit_code(), 143);
    }
}
