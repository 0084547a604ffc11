use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::error;

use audit_log_sink::init::init_tracing;
use audit_log_sink::memory_sink::{NoopApi, StaticTokenFetcher};
use audit_log_sink::{LoggerService, PipelineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::new("http://localhost:8080", "load-test", "secret");
    let logger = Arc::new(LoggerService::with_backends(
        config,
        Arc::new(NoopApi),
        Arc::new(StaticTokenFetcher::new(Duration::from_secs(3600))),
        None,
    )?);
    init_tracing(Arc::clone(&logger))?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // Give background task a little time to drain the channel
    sleep(Duration::from_secs(2)).await;
    println!("{:?}", logger.stats());
    Ok(())
}
