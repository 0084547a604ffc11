//! In-memory delivery backends.
//!
//! Useful for measuring the overhead of the pipeline itself without any
//! external I/O, and for tests that need to observe what would have been
//! delivered or to script delivery failures.

use crate::error::DeliveryError;
use crate::record::LogRecord;
use crate::sink::{KeyValueQueue, LogApi};
use crate::token::{IssuedToken, TokenFetcher};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A [`LogApi`] that accepts and discards everything.
#[derive(Clone, Default)]
pub struct NoopApi;

#[async_trait]
impl LogApi for NoopApi {
    async fn send(&self, _record: &LogRecord, _token: &str) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn send_batch(&self, _records: &[LogRecord], _token: &str) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// A [`LogApi`] that records every delivery. Scripted failures are consumed
/// one per attempt before any attempt succeeds.
#[derive(Default)]
pub struct RecordingApi {
    records: Mutex<Vec<LogRecord>>,
    batches: Mutex<Vec<Vec<LogRecord>>>,
    tokens: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    attempts: AtomicUsize,
    delay: Duration,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every delivery for `delay` before it is attempted.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next `times` attempts fail with `err`.
    pub fn fail_next(&self, err: DeliveryError, times: usize) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(err).take(times));
    }

    pub fn records(&self) -> Vec<LogRecord> {
        lock(&self.records).clone()
    }

    pub fn batches(&self) -> Vec<Vec<LogRecord>> {
        lock(&self.batches).clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        lock(&self.tokens).clone()
    }

    /// Attempts made, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn attempt(&self, token: &str) -> Result<(), DeliveryError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.tokens).push(token.to_string());
        match lock(&self.failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LogApi for RecordingApi {
    async fn send(&self, record: &LogRecord, token: &str) -> Result<(), DeliveryError> {
        self.attempt(token).await?;
        lock(&self.records).push(record.clone());
        Ok(())
    }

    async fn send_batch(&self, records: &[LogRecord], token: &str) -> Result<(), DeliveryError> {
        self.attempt(token).await?;
        lock(&self.batches).push(records.to_vec());
        Ok(())
    }
}

/// A [`KeyValueQueue`] keeping pushed payloads in memory.
#[derive(Default)]
pub struct MemoryQueue {
    pushes: Mutex<Vec<(String, String)>>,
    unavailable: Mutex<bool>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every push fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    pub fn pushes(&self) -> Vec<(String, String)> {
        lock(&self.pushes).clone()
    }
}

#[async_trait]
impl KeyValueQueue for MemoryQueue {
    async fn push(&self, key: &str, payload: String) -> Result<(), DeliveryError> {
        if *lock(&self.unavailable) {
            return Err(DeliveryError::KeyValue("queue unavailable".to_string()));
        }
        lock(&self.pushes).push((key.to_string(), payload));
        Ok(())
    }
}

/// A [`TokenFetcher`] handing out numbered tokens (`token-1`, `token-2`, ...)
/// after an optional delay, counting invocations.
pub struct StaticTokenFetcher {
    expires_in: Duration,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticTokenFetcher {
    pub fn new(expires_in: Duration) -> Self {
        StaticTokenFetcher {
            expires_in,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenFetcher for StaticTokenFetcher {
    async fn fetch_token(&self) -> Result<IssuedToken, DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(IssuedToken {
            token: format!("token-{}", n),
            expires_in: self.expires_in,
        })
    }
}
