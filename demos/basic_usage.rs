use job_orchestra::{job_fn, JobError, Pool, PoolConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn my_job_fn(id: usize, delay_ms: u64) -> Result<(), JobError> {
  info!("Job {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  info!("Job {} finished successfully after {}ms", id, delay_ms);
  Ok(())
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let shutdown = CancellationToken::new();
  let pool = Arc::new(Pool::new(
    &shutdown,
    10, // Queue capacity
    PoolConfig::new().name("basic_pool"),
  ));
  let handle = pool.clone().spawn();

  for i in 0..5 {
    // Alternate sleep times for variety
    let sleep_duration: u64 = 200 + (i as u64 % 3 * 100);
    let job = job_fn(move |_token| my_job_fn(i, sleep_duration));
    match pool.add(job).await {
      Ok(()) => info!("Submitted job {}", i),
      Err(e) => tracing::error!("Failed to submit job {}: {:?}", i, e),
    }
  }

  info!("All jobs submitted. Letting them run...");
  tokio::time::sleep(Duration::from_secs(1)).await;

  info!("Cancelling the parent token.");
  shutdown.cancel();
  let result = handle.await_result().await;
  info!("Pool finished with: {:?}", result);
  info!("--- Basic Usage Example End ---");
}
