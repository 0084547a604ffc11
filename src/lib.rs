//! Async log and audit delivery pipeline.
//!
//! A [`LoggerService`] enriches every record from the ambient call-chain
//! [`context`], masks sensitive fields, and delivers it through in-process
//! events, a batching audit queue, a Redis list or the controller's HTTP
//! API behind a circuit breaker and a single-flight token manager.

pub mod backend;
pub mod circuit_breaker;
pub mod claims;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod events;
pub mod http;
pub mod init;
pub mod layer;
pub mod logger;
pub mod masking;
pub mod memory_sink;
pub mod queue;
pub mod record;
pub mod sink;
pub mod token;

#[cfg(feature = "redis")]
pub mod redis;

pub use circuit_breaker::CircuitBreaker;
pub use config::{AuditConfig, PipelineConfig};
pub use context::LogContext;
pub use error::{ConfigError, DeliveryError, InitError};
pub use events::{EventChannel, LogEvent, LogObserver};
pub use logger::{LogOptions, LoggerService};
pub use masking::DataMasker;
pub use queue::{AuditBatchQueue, ShutdownSignal};
pub use record::{LogLevel, LogRecord};
pub use token::TokenManager;
