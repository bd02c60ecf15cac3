use thiserror::Error;

/// The error type a job returns when an execution attempt fails.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur within a `job_orchestra` pool.
#[derive(Error, Debug)]
pub enum PoolError {
  #[error("Job failed on attempt {attempt}: {source}")]
  JobFailed {
    attempt: u64,
    #[source]
    source: JobError,
  },

  #[error("Job panicked on attempt {attempt}")]
  JobPanicked { attempt: u64 },

  #[error("Pool was cancelled")]
  Cancelled,

  /// Returned when submitting to a pool whose queues are closed. Submitting after
  /// `close()` or after `work()` has returned is a programming error.
  #[error("Pool's job queue is closed, cannot accept new jobs")]
  QueueClosed,

  #[error("Pool's queues were already closed")]
  AlreadyClosed,

  #[error("Pool's drive loop was already started")]
  AlreadyWorked,

  #[error("Pool's drive loop panicked or was aborted: {0}")]
  WorkerPanicked(String),
}

impl PoolError {
  /// Returns `true` for errors produced by a failing or panicking job.
  pub fn is_job_error(&self) -> bool {
    matches!(self, PoolError::JobFailed { .. } | PoolError::JobPanicked { .. })
  }
}
