use crate::error::JobError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// The future a job returns for one execution attempt.
pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'a>>;

/// A unit of work the pool can execute, possibly many times.
///
/// The token passed to `execute` is the pool's cancellation token. The pool never
/// aborts a running job, so long-running jobs should watch the token and return
/// once it fires.
pub trait Job: Send + Sync + 'static {
  fn execute(&self, token: CancellationToken) -> JobFuture<'_>;
}

impl<J: Job + ?Sized> Job for Arc<J> {
  fn execute(&self, token: CancellationToken) -> JobFuture<'_> {
    (**self).execute(token)
  }
}

/// A `Job` backed by a closure that builds a fresh future per attempt.
pub struct FnJob<F> {
  f: F,
}

impl<F> fmt::Debug for FnJob<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnJob").finish_non_exhaustive()
  }
}

impl<F, Fut> Job for FnJob<F>
where
  F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
  fn execute(&self, token: CancellationToken) -> JobFuture<'_> {
    Box::pin((self.f)(token))
  }
}

/// Wraps a closure as a job.
///
/// ```
/// use job_orchestra::job_fn;
///
/// let job = job_fn(|_token| async move { Ok::<(), job_orchestra::JobError>(()) });
/// # let _ = job;
/// ```
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
  F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
  FnJob { f }
}

/// Internal representation of a job travelling through the job queue.
///
/// The counters move with the job so resubmission needs no shared bookkeeping.
#[derive(Clone)]
pub(crate) struct QueuedJob {
  pub(crate) job: Arc<dyn Job>,
  /// Completed execution attempts so far.
  pub(crate) runs: u64,
  /// Failures since the last success.
  pub(crate) consecutive_failures: u32,
}

impl QueuedJob {
  pub(crate) fn new(job: Arc<dyn Job>) -> Self {
    Self {
      job,
      runs: 0,
      consecutive_failures: 0,
    }
  }
}

impl fmt::Debug for QueuedJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedJob")
      .field("runs", &self.runs)
      .field("consecutive_failures", &self.consecutive_failures)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn test_fn_job_runs_closure_each_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let job = {
      let calls = calls.clone();
      job_fn(move |_token| {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<(), JobError>(())
        }
      })
    };

    let token = CancellationToken::new();
    job.execute(token.clone()).await.unwrap();
    job.execute(token).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_shared_job_sees_token() {
    let job: Arc<dyn Job> = Arc::new(job_fn(|token: CancellationToken| async move {
      if token.is_cancelled() {
        Err::<(), JobError>("cancelled".into())
      } else {
        Ok(())
      }
    }));

    let token = CancellationToken::new();
    assert!(job.execute(token.clone()).await.is_ok());
    token.cancel();
    let err = job.execute(token).await.unwrap_err();
    assert_eq!(err.to_string(), "cancelled");
  }
}
