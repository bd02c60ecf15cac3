use crate::error::PoolError;
use crate::retry::RetryPolicy;

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;

/// Decides the pool's terminal result from the first error the drive loop observes.
///
/// Returning `Ok(())` ends the loop cleanly even though a job failed.
pub type ErrorHandler = Arc<dyn Fn(PoolError) -> Result<(), PoolError> + Send + Sync + 'static>;

fn pass_through(err: PoolError) -> Result<(), PoolError> {
  Err(err)
}

/// Destination for errors hit while releasing the pool's queues.
pub(crate) type LogSink = Arc<Mutex<Box<dyn Write + Send + 'static>>>;

/// Defines what happens to in-flight jobs once the drive loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
  /// Waits for in-flight jobs as they are. Queued jobs that haven't started are dropped.
  #[default]
  Graceful,
  /// Cancels the pool's token before waiting, so cooperative jobs return early.
  /// Queued jobs that haven't started are dropped.
  ForcefulCancel,
}

/// Construction-time settings for a `Pool`.
///
/// Setters apply in call order; a later call overrides an earlier one.
#[derive(Clone)]
pub struct PoolConfig {
  pub(crate) name: Option<String>,
  pub(crate) error_handler: ErrorHandler,
  pub(crate) log_sink: LogSink,
  pub(crate) cyclic: bool,
  pub(crate) cycle_interval: Duration,
  pub(crate) retry: RetryPolicy,
  pub(crate) shutdown_mode: ShutdownMode,
  pub(crate) tokio_handle: Option<TokioHandle>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: None,
      error_handler: Arc::new(pass_through),
      log_sink: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
      cyclic: false,
      cycle_interval: Duration::ZERO,
      retry: RetryPolicy::default(),
      shutdown_mode: ShutdownMode::default(),
      tokio_handle: None,
    }
  }
}

impl fmt::Debug for PoolConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolConfig")
      .field("name", &self.name)
      .field("cyclic", &self.cyclic)
      .field("cycle_interval", &self.cycle_interval)
      .field("retry", &self.retry)
      .field("shutdown_mode", &self.shutdown_mode)
      .field("tokio_handle_is_some", &self.tokio_handle.is_some())
      .finish_non_exhaustive()
  }
}

impl PoolConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in log spans. Defaults to `pool-<n>`.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn error_handler<F>(mut self, handler: F) -> Self
  where
    F: Fn(PoolError) -> Result<(), PoolError> + Send + Sync + 'static,
  {
    self.error_handler = Arc::new(handler);
    self
  }

  /// Where close-time errors are written. Defaults to stdout.
  pub fn log_sink<W: Write + Send + 'static>(mut self, sink: W) -> Self {
    self.log_sink = Arc::new(Mutex::new(Box::new(sink)));
    self
  }

  /// Resubmit every job after each attempt, whatever its outcome.
  pub fn cyclic(mut self, cyclic: bool) -> Self {
    self.cyclic = cyclic;
    self
  }

  /// Pause between a successful cyclic run and its resubmission.
  pub fn cycle_interval(mut self, interval: Duration) -> Self {
    self.cycle_interval = interval;
    self
  }

  pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
    self.retry = policy;
    self
  }

  pub fn shutdown_mode(mut self, mode: ShutdownMode) -> Self {
    self.shutdown_mode = mode;
    self
  }

  /// Runtime that job tasks are spawned on. Defaults to the runtime driving `work()`.
  pub fn tokio_handle(mut self, handle: TokioHandle) -> Self {
    self.tokio_handle = Some(handle);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_handler_is_identity() {
    let config = PoolConfig::default();
    let result = (config.error_handler)(PoolError::Cancelled);
    assert!(matches!(result, Err(PoolError::Cancelled)));
    assert!(!config.cyclic);
    assert_eq!(config.shutdown_mode, ShutdownMode::Graceful);
    assert_eq!(config.retry, RetryPolicy::forever());
  }

  #[test]
  fn test_setters_apply_in_order() {
    let config = PoolConfig::new()
      .cyclic(true)
      .error_handler(|_| Ok(()))
      .cyclic(false)
      .name("first")
      .name("second");

    assert!(!config.cyclic);
    assert_eq!(config.name.as_deref(), Some("second"));
    assert!((config.error_handler)(PoolError::Cancelled).is_ok());
  }
}
