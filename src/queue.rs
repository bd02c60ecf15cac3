use crate::error::PoolError;
use crate::job::QueuedJob;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use kanal::{AsyncReceiver, AsyncSender};
use tracing::trace;

/// The pool's job queue and error queue, created together and closed together.
///
/// Both are bounded `kanal` channels of the same capacity. A capacity of zero gives
/// rendezvous channels where every send waits for the drive loop to take it.
/// The `closed` flag is the single shutdown transition: only the first `close()`
/// touches the channels.
pub(crate) struct PoolQueues {
  producer: QueueProducer,
  job_rx: AsyncReceiver<QueuedJob>,
  err_rx: AsyncReceiver<PoolError>,
  closed: AtomicBool,
  capacity: usize,
}

/// Sending halves of both queues. Cloned into every job task so it can report
/// failures and hand its job back.
#[derive(Clone)]
pub(crate) struct QueueProducer {
  job_tx: AsyncSender<QueuedJob>,
  err_tx: AsyncSender<PoolError>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("queued_jobs", &self.job_tx.len())
      .field("queued_errors", &self.err_tx.len())
      .finish_non_exhaustive()
  }
}

impl fmt::Debug for PoolQueues {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolQueues")
      .field("capacity", &self.capacity)
      .field("closed", &self.is_closed())
      .field("producer", &self.producer)
      .finish_non_exhaustive()
  }
}

impl PoolQueues {
  pub(crate) fn new(capacity: usize) -> Self {
    let (job_tx, job_rx) = kanal::bounded_async(capacity);
    let (err_tx, err_rx) = kanal::bounded_async(capacity);
    Self {
      producer: QueueProducer { job_tx, err_tx },
      job_rx,
      err_rx,
      closed: AtomicBool::new(false),
      capacity,
    }
  }

  pub(crate) fn producer(&self) -> &QueueProducer {
    &self.producer
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  /// Receives the next job in FIFO order.
  pub(crate) async fn recv_job(&self) -> Result<QueuedJob, PoolError> {
    self.job_rx.recv().await.map_err(|e| {
      trace!("Job queue receive failed: {}", e);
      PoolError::QueueClosed
    })
  }

  /// Receives the next reported job failure.
  pub(crate) async fn recv_error(&self) -> Result<PoolError, PoolError> {
    self.err_rx.recv().await.map_err(|e| {
      trace!("Error queue receive failed: {}", e);
      PoolError::QueueClosed
    })
  }

  /// Closes both queues. Only the first call does anything; every later call,
  /// from any path, gets `PoolError::AlreadyClosed`.
  ///
  /// Closing wakes every task blocked on either queue with an error, so nothing
  /// stays parked on a full queue after shutdown. Anything still buffered is dropped.
  pub(crate) fn close(&self) -> Result<(), PoolError> {
    if self
      .closed
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return Err(PoolError::AlreadyClosed);
    }
    let _ = self.producer.job_tx.close();
    let _ = self.producer.err_tx.close();
    trace!("Job and error queues closed.");
    Ok(())
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Number of jobs waiting in the job queue.
  pub(crate) fn len(&self) -> usize {
    self.job_rx.len()
  }
}

impl QueueProducer {
  /// Enqueues a job, waiting while the queue is full.
  pub(crate) async fn submit(&self, job: QueuedJob) -> Result<(), PoolError> {
    self.job_tx.send(job).await.map_err(|_| PoolError::QueueClosed)
  }

  /// Pushes a job failure, waiting while the error queue is full.
  pub(crate) async fn report(&self, error: PoolError) -> Result<(), PoolError> {
    self.err_tx.send(error).await.map_err(|_| PoolError::QueueClosed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{job_fn, QueuedJob};
  use crate::JobError;
  use std::sync::Arc;
  use std::time::Duration;

  fn dummy_job() -> QueuedJob {
    QueuedJob::new(Arc::new(job_fn(|_token| async move { Ok::<(), JobError>(()) })))
  }

  #[tokio::test]
  async fn test_queue_send_recv() {
    let queues = PoolQueues::new(5);

    let mut job = dummy_job();
    job.runs = 7;
    queues.producer().submit(job).await.unwrap();
    assert_eq!(queues.len(), 1);

    let received = queues.recv_job().await.unwrap();
    assert_eq!(received.runs, 7);
    assert_eq!(queues.len(), 0);
  }

  #[tokio::test]
  async fn test_queue_capacity_blocks_send() {
    let queues = PoolQueues::new(1);
    let producer = queues.producer().clone();

    producer.submit(dummy_job()).await.unwrap();

    let send_future = producer.submit(dummy_job());
    tokio::pin!(send_future);

    tokio::select! {
      _ = &mut send_future => {
        panic!("Send should have blocked because the queue is full.");
      },
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    queues.recv_job().await.unwrap();

    tokio::time::timeout(Duration::from_millis(50), send_future)
      .await
      .expect("Send did not complete after queue was drained.")
      .unwrap();
    assert_eq!(queues.len(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_zero_capacity_is_rendezvous() {
    let queues = Arc::new(PoolQueues::new(0));
    let producer = queues.producer().clone();

    let blocked = tokio::time::timeout(Duration::from_millis(50), producer.submit(dummy_job())).await;
    assert!(blocked.is_err(), "Send into a zero-capacity queue should wait for a receiver.");

    let receiver = {
      let queues = queues.clone();
      tokio::spawn(async move { queues.recv_job().await })
    };

    tokio::time::timeout(Duration::from_secs(1), producer.submit(dummy_job()))
      .await
      .expect("Send should complete once a receiver is waiting.")
      .unwrap();
    assert!(receiver.await.unwrap().is_ok());
  }

  #[tokio::test]
  async fn test_error_queue_carries_failures() {
    let queues = PoolQueues::new(1);
    queues
      .producer()
      .report(PoolError::JobPanicked { attempt: 1 })
      .await
      .unwrap();

    match queues.recv_error().await {
      Ok(PoolError::JobPanicked { attempt: 1 }) => {}
      other => panic!("Expected JobPanicked, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_close_happens_once() {
    let queues = PoolQueues::new(2);
    assert!(!queues.is_closed());
    assert!(queues.close().is_ok());
    assert!(queues.is_closed());
    assert!(matches!(queues.close(), Err(PoolError::AlreadyClosed)));

    assert!(matches!(queues.producer().submit(dummy_job()).await, Err(PoolError::QueueClosed)));
    assert!(matches!(queues.recv_job().await, Err(PoolError::QueueClosed)));
    assert!(matches!(queues.recv_error().await, Err(PoolError::QueueClosed)));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_close_releases_blocked_reporter() {
    let queues = Arc::new(PoolQueues::new(1));
    let producer = queues.producer().clone();
    producer.report(PoolError::Cancelled).await.unwrap();

    let blocked = tokio::spawn(async move { producer.report(PoolError::Cancelled).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    queues.close().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), blocked)
      .await
      .expect("Blocked reporter should be released by close.")
      .unwrap();
    assert!(matches!(result, Err(PoolError::QueueClosed)));
  }
}
