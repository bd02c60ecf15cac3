use crate::error::PoolError;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing;

/// A handle to a drive loop started with [`Pool::spawn`](crate::Pool::spawn).
///
/// Allows for stopping the pool and awaiting the loop's terminal result.
#[derive(Debug)]
pub struct WorkHandle {
  pool_name: Arc<String>,
  cancellation_token: CancellationToken,
  join_handle: JoinHandle<Result<(), PoolError>>,
}

impl WorkHandle {
  pub(crate) fn new(
    pool_name: Arc<String>,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<Result<(), PoolError>>,
  ) -> Self {
    Self {
      pool_name,
      cancellation_token,
      join_handle,
    }
  }

  pub fn pool_name(&self) -> &str {
    &self.pool_name
  }

  /// Requests cancellation of the pool. Same as [`Pool::stop`](crate::Pool::stop).
  pub fn stop(&self) {
    tracing::debug!(pool_name = %*self.pool_name, "WorkHandle: Stop requested.");
    self.cancellation_token.cancel();
  }

  /// Returns `true` once the drive loop has returned, including waiting for its jobs.
  pub fn is_finished(&self) -> bool {
    self.join_handle.is_finished()
  }

  /// Awaits the drive loop and returns its terminal result.
  ///
  /// # Errors
  /// Returns whatever `Pool::work` returned, or `PoolError::WorkerPanicked` if the
  /// loop's task panicked or was aborted by the runtime.
  pub async fn await_result(self) -> Result<(), PoolError> {
    match self.join_handle.await {
      Ok(work_result) => work_result,
      Err(join_error) => {
        tracing::warn!(pool_name = %*self.pool_name, "Drive loop task failed to join: {}", join_error);
        Err(PoolError::WorkerPanicked(join_error.to_string()))
      }
    }
  }
}
