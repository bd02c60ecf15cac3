use job_orchestra::{job_fn, JobError, Pool, PoolConfig, PoolError, RetryPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Error Handling Example ---");

  let config = PoolConfig::new()
    .name("flaky_pool")
    .retry_policy(
      RetryPolicy::exponential()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_attempts(4)
        .with_jitter(0.1),
    )
    .error_handler(|err| match err {
      PoolError::JobPanicked { attempt } => {
        warn!("A job panicked on attempt {}; treating the run as finished.", attempt);
        Ok(())
      }
      other => Err(other),
    });

  let pool = Pool::new(&CancellationToken::new(), 2, config);

  let attempts = Arc::new(AtomicUsize::new(0));
  let flaky = {
    let attempts = attempts.clone();
    job_fn(move |_token| {
      let attempts = attempts.clone();
      async move {
        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Flaky job attempt {}", n);
        Err::<(), JobError>(format!("upstream unavailable (attempt {})", n).into())
      }
    })
  };
  pool.add(flaky).await.expect("Pool should accept jobs before work starts");

  match pool.work().await {
    Ok(()) => info!("Pool finished cleanly."),
    Err(e) => info!("Pool terminated with: {}", e),
  }
  info!("Flaky job ran {} time(s).", attempts.load(Ordering::SeqCst));
  info!("--- Error Handling Example End ---");
}
