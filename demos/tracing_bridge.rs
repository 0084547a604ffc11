use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, warn, Level};

use audit_log_sink::context::{self, LogContext};
use audit_log_sink::events::LogEvent;
use audit_log_sink::init::{init_tracing_with_config, LayerConfig};
use audit_log_sink::{LoggerService, PipelineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig {
        client_id: "bridge-demo".into(),
        emit_events: true,
        ..PipelineConfig::default()
    };
    let logger = Arc::new(LoggerService::new(config)?);
    let mut rx = logger.subscribe();

    let layer_config = LayerConfig {
        channel_buffer: 4_096,
        min_level: Level::WARN,
        enable_stdout: true,
    };
    init_tracing_with_config(Arc::clone(&logger), layer_config)?;

    let printer = tokio::spawn(async move {
        while let Ok(LogEvent::Record(record)) = rx.recv().await {
            println!("bridged: {}", serde_json::to_string(&record).unwrap_or_default());
        }
    });

    context::scope(LogContext::new().with_correlation_id("bridge-1"), async {
        warn!(attempt = 2, "upstream slow");
        error!(api_key = "abc123", "upstream failed");
    })
    .await;

    sleep(Duration::from_millis(200)).await;
    printer.abort();
    Ok(())
}
