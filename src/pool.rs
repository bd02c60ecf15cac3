use crate::config::{ErrorHandler, LogSink, PoolConfig, ShutdownMode};
use crate::error::PoolError;
use crate::handle::WorkHandle;
use crate::job::{Job, QueuedJob};
use crate::queue::{PoolQueues, QueueProducer};
use crate::retry::RetryPolicy;

use std::fmt;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// A bounded job pool driven by a single dispatch loop.
///
/// Jobs go in through [`Pool::add`]; [`Pool::work`] pulls them out one at a time
/// and runs each on its own Tokio task. The first failure any job reports is
/// passed to the configured error handler and decides what `work()` returns.
pub struct Pool {
  pool_name: Arc<String>,
  token: CancellationToken,
  queues: PoolQueues,
  error_handler: ErrorHandler,
  log_sink: LogSink,
  run_policy: Arc<RunPolicy>,
  shutdown_mode: ShutdownMode,
  tokio_handle: Option<TokioHandle>,
  work_started: AtomicBool,
}

/// What a job task does with its job once an attempt completes.
#[derive(Debug)]
struct RunPolicy {
  cyclic: bool,
  cycle_interval: Duration,
  retry: RetryPolicy,
}

impl RunPolicy {
  /// Delay before resubmitting, or `None` if the job should not go back into the queue.
  fn next_submission(&self, job: &QueuedJob, failed: bool) -> Option<Duration> {
    if failed {
      if self.cyclic || self.retry.has_attempts_remaining(job.consecutive_failures) {
        Some(self.retry.delay_for_failure(job.consecutive_failures))
      } else {
        None
      }
    } else if self.cyclic {
      Some(self.cycle_interval)
    } else {
      None
    }
  }
}

impl fmt::Debug for Pool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("pool_name", &self.pool_name)
      .field("queues", &self.queues)
      .field("run_policy", &self.run_policy)
      .field("shutdown_mode", &self.shutdown_mode)
      .field("cancelled", &self.token.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl Pool {
  /// Creates a pool whose token is a child of `parent`, with job and error queues
  /// of `capacity` slots each. A capacity of zero makes every `add` wait for the
  /// drive loop to take the job.
  pub fn new(parent: &CancellationToken, capacity: usize, config: PoolConfig) -> Self {
    let pool_id = NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let pool_name = config.name.unwrap_or_else(|| format!("pool-{}", pool_id));

    debug!(pool_name = %pool_name, capacity, cyclic = config.cyclic, "Creating pool.");

    Self {
      pool_name: Arc::new(pool_name),
      token: parent.child_token(),
      queues: PoolQueues::new(capacity),
      error_handler: config.error_handler,
      log_sink: config.log_sink,
      run_policy: Arc::new(RunPolicy {
        cyclic: config.cyclic,
        cycle_interval: config.cycle_interval,
        retry: config.retry,
      }),
      shutdown_mode: config.shutdown_mode,
      tokio_handle: config.tokio_handle,
      work_started: AtomicBool::new(false),
    }
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn capacity(&self) -> usize {
    self.queues.capacity()
  }

  /// Returns the current number of jobs waiting in the queue.
  pub fn queued_job_count(&self) -> usize {
    self.queues.len()
  }

  pub fn is_closed(&self) -> bool {
    self.queues.is_closed()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// The token handed to every job. Cancelling it is the same as calling `stop()`.
  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  /// Submits a job, waiting while the queue is full.
  ///
  /// # Errors
  /// Returns `PoolError::QueueClosed` if the pool has been closed, either before
  /// the call or while it was waiting for space. Submitting after `close()` or
  /// after `work()` has returned is a programming error.
  pub async fn add<J: Job>(&self, job: J) -> Result<(), PoolError> {
    self.add_shared(Arc::new(job)).await
  }

  /// Submits a job that the caller keeps a reference to.
  pub async fn add_shared(&self, job: Arc<dyn Job>) -> Result<(), PoolError> {
    if self.queues.is_closed() {
      warn!(pool_name = %self.pool_name, "Add: Attempted to submit a job to a closed pool.");
      return Err(PoolError::QueueClosed);
    }

    trace!(pool_name = %self.pool_name, "Submitting job to queue.");
    self.queues.producer().submit(QueuedJob::new(job)).await.map_err(|e| {
      error!(pool_name = %self.pool_name, "Add: Job queue closed while submitting.");
      e
    })
  }

  /// Requests cancellation. The drive loop stops at its next scheduling point;
  /// running jobs only stop if they watch their token.
  pub fn stop(&self) {
    info!(pool_name = %self.pool_name, "Stop requested. Cancelling pool token.");
    self.token.cancel();
  }

  /// Closes the job and error queues.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyClosed` if the queues were closed before, by an
  /// earlier `close()` or by a finished `work()`.
  pub fn close(&self) -> Result<(), PoolError> {
    self.queues.close()?;
    info!(pool_name = %self.pool_name, "Pool queues closed.");
    Ok(())
  }

  /// Runs the drive loop on the runtime and returns a handle to its result.
  pub fn spawn(self: Arc<Self>) -> WorkHandle {
    let token = self.token.clone();
    let pool_name = self.pool_name.clone();
    let join_handle = match self.tokio_handle.clone() {
      Some(handle) => handle.spawn(async move { self.work().await }),
      None => tokio::spawn(async move { self.work().await }),
    };
    WorkHandle::new(pool_name, token, join_handle)
  }

  /// Drives the pool until cancellation or the first reported job error.
  ///
  /// Each dequeued job is spawned as its own task and the loop goes straight back
  /// to waiting. On exit both queues are closed and every spawned task is awaited,
  /// so a job that never returns keeps this future pending.
  ///
  /// Returns `Err(PoolError::Cancelled)` on cancellation, or whatever the error
  /// handler returns for the first job error. Calling it a second time returns
  /// `Err(PoolError::AlreadyWorked)`.
  pub async fn work(&self) -> Result<(), PoolError> {
    if self.work_started.swap(true, AtomicOrdering::AcqRel) {
      warn!(pool_name = %self.pool_name, "Work: Drive loop was already started on this pool.");
      return Err(PoolError::AlreadyWorked);
    }

    let span = info_span!("job_pool_work_loop", pool_name = %*self.pool_name);
    self.run_work_loop().instrument(span).await
  }

  async fn run_work_loop(&self) -> Result<(), PoolError> {
    info!(pool_name = %*self.pool_name, capacity = self.queues.capacity(), "Drive loop started.");

    let tracker = TaskTracker::new();
    let tokio_handle = self.tokio_handle.clone().unwrap_or_else(TokioHandle::current);
    let mut dispatched: u64 = 0;
    // Cancelled once the loop exits, so resubmission delays end with the pool.
    let closing = self.token.child_token();

    // Receive futures live across iterations. A kanal receive dropped mid-handoff
    // discards the item, so they are only replaced after they complete.
    let mut next_error = Box::pin(self.queues.recv_error());
    let mut next_job = Box::pin(self.queues.recv_job());

    let outcome = loop {
      tokio::select! {
        _ = self.token.cancelled() => {
          info!(pool_name = %*self.pool_name, "Cancellation observed. Drive loop terminating.");
          break Err(PoolError::Cancelled);
        }

        recv_error = &mut next_error => {
          match recv_error {
            Ok(job_error) => {
              info!(pool_name = %*self.pool_name, error = %job_error, "Job error observed. Passing to error handler.");
              break (self.error_handler)(job_error);
            }
            Err(closed) => {
              warn!(pool_name = %*self.pool_name, "Error queue closed underneath the drive loop.");
              break Err(closed);
            }
          }
        }

        recv_job = &mut next_job => {
          match recv_job {
            Ok(queued_job) => {
              next_job = Box::pin(self.queues.recv_job());
              dispatched += 1;
              debug!(
                pool_name = %*self.pool_name,
                runs = queued_job.runs,
                in_flight = tracker.len(),
                "Dequeued job. Spawning task."
              );
              let task = run_job(
                queued_job,
                self.token.clone(),
                closing.clone(),
                self.queues.producer().clone(),
                self.run_policy.clone(),
              )
              .instrument(info_span!("pooled_job", pool_name = %*self.pool_name, dispatch = dispatched));
              tracker.spawn_on(task, &tokio_handle);
            }
            Err(closed) => {
              warn!(pool_name = %*self.pool_name, "Job queue closed underneath the drive loop.");
              break Err(closed);
            }
          }
        }
      }
    };
    drop(next_error);
    drop(next_job);

    self.shutdown(&tracker, &closing).await;

    info!(
      pool_name = %*self.pool_name,
      dispatched,
      ok = outcome.is_ok(),
      "Drive loop stopped."
    );
    outcome
  }

  async fn shutdown(&self, tracker: &TaskTracker, closing: &CancellationToken) {
    if let Err(close_error) = self.queues.close() {
      self.report_close_error(&close_error);
    }
    closing.cancel();

    if self.shutdown_mode == ShutdownMode::ForcefulCancel {
      info!(pool_name = %*self.pool_name, "Forceful shutdown: Cancelling pool token for in-flight jobs.");
      self.token.cancel();
    }

    tracker.close();
    if !tracker.is_empty() {
      info!(pool_name = %*self.pool_name, in_flight = tracker.len(), "Waiting for in-flight jobs to finish.");
    }
    tracker.wait().await;
  }

  fn report_close_error(&self, close_error: &PoolError) {
    warn!(pool_name = %*self.pool_name, "Error while closing pool queues: {}", close_error);
    let mut sink = self.log_sink.lock();
    if let Err(write_error) = writeln!(sink, "{}", close_error) {
      error!(pool_name = %*self.pool_name, "Failed to write to pool log sink: {}", write_error);
    }
  }
}

/// One execution attempt of a job, followed by error reporting and resubmission.
async fn run_job(
  mut queued_job: QueuedJob,
  token: CancellationToken,
  closing: CancellationToken,
  producer: QueueProducer,
  policy: Arc<RunPolicy>,
) {
  let job = queued_job.job.clone();
  queued_job.runs += 1;
  let attempt = queued_job.runs;

  let execution = AssertUnwindSafe(job.execute(token.clone())).catch_unwind().await;
  let failure = match execution {
    Ok(Ok(())) => {
      trace!(attempt, "Job attempt succeeded.");
      queued_job.consecutive_failures = 0;
      None
    }
    Ok(Err(source)) => {
      debug!(attempt, "Job attempt failed: {}", source);
      queued_job.consecutive_failures = queued_job.consecutive_failures.saturating_add(1);
      Some(PoolError::JobFailed { attempt, source })
    }
    Err(_panic_payload) => {
      error!(attempt, "Job panicked during execution.");
      queued_job.consecutive_failures = queued_job.consecutive_failures.saturating_add(1);
      Some(PoolError::JobPanicked { attempt })
    }
  };

  let failed = failure.is_some();
  if let Some(job_error) = failure {
    if producer.report(job_error).await.is_err() {
      trace!(attempt, "Error queue closed; dropping job error.");
    }
  }

  let next_delay = policy.next_submission(&queued_job, failed);

  let Some(delay) = next_delay else {
    if queued_job.consecutive_failures > 0 {
      warn!(
        attempt,
        failures = queued_job.consecutive_failures,
        "Job exhausted its retry attempts and will not be resubmitted."
      );
    }
    return;
  };

  if !delay.is_zero() {
    tokio::select! {
      _ = closing.cancelled() => {
        trace!(attempt, "Pool shut down during resubmission delay; dropping job.");
        return;
      }
      _ = tokio::time::sleep(delay) => {}
    }
  }

  if producer.submit(queued_job).await.is_err() {
    trace!(attempt, "Job queue closed; job not resubmitted.");
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    if self.queues.close().is_ok() {
      debug!(
        pool_name = %*self.pool_name,
        "Pool dropped without being closed. Closing job and error queues."
      );
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Queues already closed.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::job_fn;
  use crate::JobError;

  fn queued(consecutive_failures: u32) -> QueuedJob {
    let mut job = QueuedJob::new(Arc::new(job_fn(|_token| async move { Ok::<(), JobError>(()) })));
    job.consecutive_failures = consecutive_failures;
    job
  }

  fn policy(cyclic: bool, retry: RetryPolicy) -> RunPolicy {
    RunPolicy {
      cyclic,
      cycle_interval: Duration::from_millis(5),
      retry,
    }
  }

  #[test]
  fn test_retry_mode_resubmits_only_failures() {
    let policy = policy(false, RetryPolicy::forever());
    assert_eq!(policy.next_submission(&queued(0), false), None);
    assert_eq!(policy.next_submission(&queued(1), true), Some(Duration::ZERO));
    assert_eq!(policy.next_submission(&queued(1_000), true), Some(Duration::ZERO));
  }

  #[test]
  fn test_retry_mode_respects_attempt_limit() {
    let policy = policy(false, RetryPolicy::fixed(Duration::from_millis(10), 2));
    assert_eq!(policy.next_submission(&queued(1), true), Some(Duration::from_millis(10)));
    assert_eq!(policy.next_submission(&queued(2), true), None);
  }

  #[test]
  fn test_cyclic_mode_always_resubmits() {
    let policy = policy(true, RetryPolicy::no_retry());
    assert_eq!(policy.next_submission(&queued(0), false), Some(Duration::from_millis(5)));
    assert_eq!(policy.next_submission(&queued(4), true), Some(Duration::ZERO));
  }

  #[tokio::test]
  async fn test_failed_attempt_reports_then_resubmits() {
    let queues = PoolQueues::new(1);
    let token = CancellationToken::new();
    let policy = Arc::new(policy(false, RetryPolicy::forever()));
    let failing: Arc<dyn Job> = Arc::new(job_fn(|_token| async move { Err::<(), JobError>("nope".into()) }));

    let mut next = QueuedJob::new(failing);
    for expected_attempt in 1..=3u64 {
      run_job(next, token.clone(), token.child_token(), queues.producer().clone(), policy.clone()).await;

      match queues.recv_error().await {
        Ok(PoolError::JobFailed { attempt, .. }) => assert_eq!(attempt, expected_attempt),
        other => panic!("Expected JobFailed, got {:?}", other),
      }
      next = queues.recv_job().await.unwrap();
      assert_eq!(next.runs, expected_attempt);
      assert_eq!(next.consecutive_failures, expected_attempt as u32);
    }
  }

  #[tokio::test]
  async fn test_failure_reported_before_unbounded_backoff() {
    let queues = PoolQueues::new(1);
    let token = CancellationToken::new();
    let closing = token.child_token();
    let policy = Arc::new(policy(false, RetryPolicy::fixed(Duration::MAX, 3)));
    let failing: Arc<dyn Job> = Arc::new(job_fn(|_token| async move { Err::<(), JobError>("nope".into()) }));

    let task = tokio::spawn(run_job(
      QueuedJob::new(failing),
      token.clone(),
      closing.clone(),
      queues.producer().clone(),
      policy,
    ));

    let reported = tokio::time::timeout(Duration::from_secs(1), queues.recv_error())
      .await
      .expect("Failure must be reported before the backoff starts.");
    assert!(matches!(reported, Ok(PoolError::JobFailed { attempt: 1, .. })));

    closing.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
      .await
      .expect("Closing the pool must end the backoff sleep.")
      .unwrap();
    assert_eq!(queues.len(), 0, "A job abandoned during backoff is not resubmitted.");
    assert!(!token.is_cancelled());
  }

  #[tokio::test]
  async fn test_successful_attempt_is_dropped_outside_cyclic_mode() {
    let queues = PoolQueues::new(1);
    let policy = Arc::new(policy(false, RetryPolicy::forever()));
    let token = CancellationToken::new();
    run_job(queued(2), token.clone(), token.child_token(), queues.producer().clone(), policy).await;

    assert_eq!(queues.len(), 0);
    queues.close().unwrap();
    assert!(queues.recv_error().await.is_err());
  }

  #[tokio::test]
  async fn test_pool_names_are_unique_by_default() {
    let parent = CancellationToken::new();
    let a = Pool::new(&parent, 1, PoolConfig::default());
    let b = Pool::new(&parent, 1, PoolConfig::default());
    assert_ne!(a.name(), b.name());
    assert!(a.name().starts_with("pool-"));

    let named = Pool::new(&parent, 3, PoolConfig::new().name("ingest"));
    assert_eq!(named.name(), "ingest");
    assert_eq!(named.capacity(), 3);
  }

  #[tokio::test]
  async fn test_parent_cancellation_reaches_pool_token() {
    let parent = CancellationToken::new();
    let pool = Pool::new(&parent, 1, PoolConfig::default());
    assert!(!pool.is_cancelled());
    parent.cancel();
    assert!(pool.is_cancelled());

    let sibling_parent = CancellationToken::new();
    let sibling = Pool::new(&sibling_parent, 1, PoolConfig::default());
    sibling.stop();
    assert!(!sibling_parent.is_cancelled(), "Stopping a pool must not cancel its parent.");
  }
}
