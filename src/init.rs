use crate::error::InitError;
use crate::layer::PipelineLayer;
use crate::logger::LoggerService;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the `tracing` bridge.
///
/// **Fields**
/// - `channel_buffer`: maximum number of bridged events waiting for the
///   background task before new ones are dropped.
/// - `min_level`: least severe `tracing` level forwarded to the logger.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   added on top of [`PipelineLayer`] so events are also printed.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub channel_buffer: usize,
    pub min_level: Level,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1024,
            min_level: Level::WARN,
            enable_stdout: true,
        }
    }
}

/// Install a global `tracing` subscriber that bridges application events
/// into `logger`.
///
/// **Returns**
/// - the handle of the background task draining the bridge channel;
/// - `Err(InitError::NoRuntime)` when called outside a tokio runtime;
/// - `Err(InitError::SubscriberAlreadySet)` when another global
///   subscriber was installed first.
pub fn init_tracing_with_config(
    logger: Arc<LoggerService>,
    config: LayerConfig,
) -> Result<JoinHandle<()>, InitError> {
    tokio::runtime::Handle::try_current().map_err(|_| InitError::NoRuntime)?;

    let (layer, handle) = PipelineLayer::new(logger, config.channel_buffer, config.min_level);

    // Two variants keep the subscriber types concrete.
    let installed = if config.enable_stdout {
        let subscriber = Registry::default().with(layer).with(tracing_subscriber::fmt::layer());
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(err) = installed {
        handle.abort();
        return Err(err.into());
    }
    Ok(handle)
}

/// Install a plain `fmt` subscriber so the pipeline's own diagnostics are
/// printed, without bridging anything into a logger.
pub fn init_stdout() -> Result<(), InitError> {
    let subscriber = Registry::default().with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Install the bridge with [`LayerConfig::default`].
pub fn init_tracing(logger: Arc<LoggerService>) -> Result<JoinHandle<()>, InitError> {
    init_tracing_with_config(logger, LayerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::memory_sink::{NoopApi, StaticTokenFetcher};
    use tokio::time::Duration;

    fn logger() -> Arc<LoggerService> {
        let config = PipelineConfig {
            client_id: "init".into(),
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

    #[test]
    fn requires_a_runtime() {
        let err = init_tracing(logger()).unwrap_err();
        assert!(matches!(err, InitError::NoRuntime));
    }
}
