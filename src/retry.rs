//! Resubmission policy for failed jobs.

use std::time::Duration;

use rand::Rng;

/// Controls how often and how quickly a failed job is handed back to the queue.
///
/// The default retries forever with no delay, so a job that always fails keeps
/// spinning until the drive loop terminates on its first observed error.
///
/// ```
/// use job_orchestra::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///   .with_max_attempts(5)
///   .with_initial_interval(Duration::from_millis(100))
///   .with_max_interval(Duration::from_secs(5));
///
/// assert_eq!(policy.delay_for_failure(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_failure(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Maximum attempts including the first one. `None` means unlimited.
  max_attempts: Option<u32>,
  /// Delay before the first retry.
  initial_interval: Duration,
  /// Upper bound on any single delay.
  max_interval: Duration,
  backoff_coefficient: f64,
  /// Randomness factor in `0.0..=1.0`; 0.1 means +/-10%.
  jitter: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::forever()
  }
}

impl RetryPolicy {
  /// Unlimited attempts, resubmitted immediately.
  pub fn forever() -> Self {
    Self {
      max_attempts: None,
      initial_interval: Duration::ZERO,
      max_interval: Duration::ZERO,
      backoff_coefficient: 1.0,
      jitter: 0.0,
    }
  }

  /// Unlimited attempts with doubling delays from 100ms up to 30s.
  pub fn exponential() -> Self {
    Self {
      max_attempts: None,
      initial_interval: Duration::from_millis(100),
      max_interval: Duration::from_secs(30),
      backoff_coefficient: 2.0,
      jitter: 0.0,
    }
  }

  /// A fixed delay between attempts and a hard attempt limit.
  pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
    Self {
      max_attempts: Some(max_attempts),
      initial_interval: interval,
      max_interval: interval,
      backoff_coefficient: 1.0,
      jitter: 0.0,
    }
  }

  /// Never resubmit a failed job.
  pub fn no_retry() -> Self {
    Self::forever().with_max_attempts(1)
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts.max(1));
    self
  }

  pub fn with_unlimited_attempts(mut self) -> Self {
    self.max_attempts = None;
    self
  }

  pub fn with_initial_interval(mut self, interval: Duration) -> Self {
    self.initial_interval = interval;
    if self.max_interval < interval {
      self.max_interval = interval;
    }
    self
  }

  pub fn with_max_interval(mut self, interval: Duration) -> Self {
    self.max_interval = interval;
    self
  }

  pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
    self.backoff_coefficient = coefficient.max(1.0);
    self
  }

  /// Set the jitter factor, clamped to `0.0..=1.0`.
  pub fn with_jitter(mut self, jitter: f64) -> Self {
    self.jitter = jitter.clamp(0.0, 1.0);
    self
  }

  pub fn max_attempts(&self) -> Option<u32> {
    self.max_attempts
  }

  pub fn initial_interval(&self) -> Duration {
    self.initial_interval
  }

  pub fn max_interval(&self) -> Duration {
    self.max_interval
  }

  pub fn backoff_coefficient(&self) -> f64 {
    self.backoff_coefficient
  }

  pub fn jitter(&self) -> f64 {
    self.jitter
  }

  /// Whether a job that has failed `consecutive_failures` times in a row may run again.
  pub fn has_attempts_remaining(&self, consecutive_failures: u32) -> bool {
    match self.max_attempts {
      Some(max) => consecutive_failures < max,
      None => true,
    }
  }

  /// Delay to wait before resubmitting a job after its n-th consecutive failure (1-based).
  ///
  /// Never exceeds `max_interval`, including when the computed value overflows `Duration`.
  pub fn delay_for_failure(&self, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 || self.initial_interval.is_zero() {
      return Duration::ZERO;
    }

    let exponent = (consecutive_failures - 1).min(i32::MAX as u32) as i32;
    let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
    let capped = base.min(self.max_interval.as_secs_f64());

    let jittered = if self.jitter > 0.0 && capped > 0.0 {
      let range = capped * self.jitter;
      let offset = rand::rng().random_range(-range..=range);
      (capped + offset).max(0.0)
    } else {
      capped
    };

    Duration::try_from_secs_f64(jittered)
      .unwrap_or(self.max_interval)
      .min(self.max_interval)
  }
}
