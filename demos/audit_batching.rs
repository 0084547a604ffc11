use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;

use audit_log_sink::context::{self, LogContext};
use audit_log_sink::events::LogObserver;
use audit_log_sink::{LogOptions, LogRecord, LoggerService, PipelineConfig};

struct PrintObserver;

impl LogObserver for PrintObserver {
    fn on_record(&self, record: &LogRecord) {
        println!("[{}] {} {}", record.level, record.correlation_id, record.message);
    }

    fn on_batch(&self, records: &[LogRecord]) {
        println!("batch of {} audit records", records.len());
        for record in records {
            self.on_record(record);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Events mode needs no controller; set LOG_SINK_* to deliver for real.
    let mut config = PipelineConfig::from_env()?;
    if config.client_id.is_empty() {
        config.client_id = "demo-client".into();
        config.emit_events = true;
    }
    config.audit.batch_size = 5;
    config.audit.batch_interval = Duration::from_millis(200);

    let logger = Arc::new(LoggerService::new(config)?);
    let observer = logger.events().observe(Arc::new(PrintObserver));
    let _hook = logger.install_shutdown_hook();

    let ctx = LogContext::new()
        .with_correlation_id("demo-request-1")
        .with_user_id("u1");

    context::scope(ctx, async {
        logger.info("request started", json!({ "path": "/users" }), LogOptions::new()).await;
        for i in 0..7 {
            logger
                .audit(
                    "user.updated",
                    "users",
                    json!({ "userId": format!("u{}", i), "password": "hunter2" }),
                    LogOptions::new().endpoint("/api/users"),
                )
                .await;
        }
    })
    .await;

    logger.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    observer.abort();
    println!("{:?}", logger.stats());
    Ok(())
}
