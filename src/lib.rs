//! A Tokio-based bounded job pool with a single dispatch loop, retrying or
//! cyclic job resubmission, one error decision point and cooperative cancellation.

mod config;
mod error;
mod handle;
mod job;
mod pool;
mod queue;
mod retry;

pub use config::{ErrorHandler, PoolConfig, ShutdownMode};
pub use error::{JobError, PoolError};
pub use handle::WorkHandle;
pub use job::{job_fn, FnJob, Job, JobFuture};
pub use pool::Pool;
pub use retry::RetryPolicy;
