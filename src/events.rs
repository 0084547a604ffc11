use crate::record::LogRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Payload published on the in-process channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Record(LogRecord),
    /// A flushed audit batch, delivered as one unit.
    Batch(Vec<LogRecord>),
}

/// Callback interface for in-process consumers.
pub trait LogObserver: Send + Sync {
    fn on_record(&self, record: &LogRecord);

    fn on_batch(&self, records: &[LogRecord]) {
        for record in records {
            self.on_record(record);
        }
    }
}

/// In-process event channel used when the pipeline runs in event-emission
/// mode. Publishing never blocks; slow subscribers lag and lose the oldest
/// events.
#[derive(Clone)]
pub struct EventChannel {
    sender: broadcast::Sender<LogEvent>,
    emitted: Arc<AtomicU64>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventChannel {
            sender,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    /// Publish `event`; returns how many subscribers received it. Having no
    /// subscriber is not an error.
    pub fn emit(&self, event: LogEvent) -> usize {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.sender.send(event).unwrap_or(0)
    }

    /// Total events published so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Forward every future event to `observer` from a background task.
    pub fn observe(&self, observer: Arc<dyn LogObserver>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(LogEvent::Record(record)) => observer.on_record(&record),
                    Ok(LogEvent::Batch(records)) => observer.on_batch(&records),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "log observer lagging, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}
