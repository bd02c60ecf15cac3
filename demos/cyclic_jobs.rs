use job_orchestra::{job_fn, JobError, Pool, PoolConfig, ShutdownMode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Cyclic Jobs Example ---");

  let pool = Arc::new(Pool::new(
    &CancellationToken::new(),
    4,
    PoolConfig::new()
      .name("heartbeat_pool")
      .cyclic(true)
      .cycle_interval(Duration::from_millis(250))
      .shutdown_mode(ShutdownMode::ForcefulCancel),
  ));

  let beats = Arc::new(AtomicUsize::new(0));
  for name in ["db", "cache", "queue"] {
    let beats = beats.clone();
    let job = job_fn(move |token: CancellationToken| {
      let beats = beats.clone();
      async move {
        if token.is_cancelled() {
          return Ok::<(), JobError>(());
        }
        let n = beats.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Heartbeat #{} from {}", n, name);
        Ok(())
      }
    });
    pool.add(job).await.expect("Pool should accept jobs before work starts");
  }

  let handle = pool.clone().spawn();
  tokio::time::sleep(Duration::from_secs(2)).await;

  info!("Stopping pool after {} heartbeats.", beats.load(Ordering::SeqCst));
  handle.stop();
  info!("Pool finished with: {:?}", handle.await_result().await);
  info!("--- Cyclic Jobs Example End ---");
}
