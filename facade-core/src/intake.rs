//! Batch intake loop
//!
//! Turns the broker delivery stream into batches bounded by size and by a
//! time window, and hands each batch to a bounded pool of workers. Acquiring
//! a worker slot blocks the loop itself, which is the backpressure point.

use crate::broker::{BrokerSession, Delivery};
use crate::config::IntakeConfig;
use crate::error::{Error, Result};
use crate::metrics::{BATCHES_DISPATCHED, IN_FLIGHT_BATCHES};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processes one dispatched batch
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Handle the batch. Errors are logged by the caller and the batch dropped.
    async fn process(&self, batch: Vec<Delivery>) -> Result<()>;
}

/// Why the intake loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeExit {
    /// External cancellation
    Cancelled,
    /// The delivery stream ended normally
    StreamEnded,
    /// The broker raised a close notification
    ConnectionLost(String),
}

/// Size/time batching over a delivery stream with bounded concurrency
pub struct BatchIntakeLoop {
    processor: Arc<dyn BatchProcessor>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    batch_size: usize,
    batch_timeout: Duration,
}

impl BatchIntakeLoop {
    /// Loop feeding `processor` with at most `config.workers` batches in flight
    pub fn new(processor: Arc<dyn BatchProcessor>, config: &IntakeConfig) -> Self {
        let capacity = config.workers.max(1);
        Self {
            processor,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout(),
        }
    }

    /// Batches currently being processed
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Consume `session` until cancellation, stream end or a close notification.
    /// Whatever is buffered at that point is dispatched before returning.
    pub async fn run(&self, session: &mut BrokerSession, cancel: &CancellationToken) -> IntakeExit {
        let mut buffer: Vec<Delivery> = Vec::with_capacity(self.batch_size);
        let timer = sleep(self.batch_timeout);
        tokio::pin!(timer);

        info!(
            batch_size = self.batch_size,
            workers = self.capacity,
            "Batch intake started"
        );

        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break IntakeExit::Cancelled,

                Some(reason) = session.closed.recv() => {
                    warn!("Broker close notification: {}", reason);
                    break IntakeExit::ConnectionLost(reason);
                }

                next = session.deliveries.recv() => match next {
                    Some(delivery) => {
                        buffer.push(delivery);
                        if buffer.len() == 1 {
                            timer.as_mut().reset(Instant::now() + self.batch_timeout);
                        }
                        if buffer.len() >= self.batch_size {
                            self.dispatch(&mut buffer).await;
                            timer.as_mut().reset(Instant::now() + self.batch_timeout);
                        }
                    }
                    None => break IntakeExit::StreamEnded,
                },

                _ = &mut timer => {
                    if !buffer.is_empty() {
                        self.dispatch(&mut buffer).await;
                    }
                    timer.as_mut().reset(Instant::now() + self.batch_timeout);
                }
            }
        };

        // Deliveries already handed over by the broker are acknowledged, so
        // pick up whatever is still queued before flushing.
        while let Ok(delivery) = session.deliveries.try_recv() {
            buffer.push(delivery);
            if buffer.len() >= self.batch_size {
                self.dispatch(&mut buffer).await;
            }
        }

        if !buffer.is_empty() {
            debug!(pending = buffer.len(), "Flushing buffered deliveries");
            self.dispatch(&mut buffer).await;
        }

        info!(?exit, "Batch intake stopped");
        exit
    }

    async fn dispatch(&self, buffer: &mut Vec<Delivery>) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(dropped = buffer.len(), "Worker pool closed, dropping batch");
                buffer.clear();
                return;
            }
        };

        let batch = std::mem::replace(buffer, Vec::with_capacity(self.batch_size));
        let batch_size = batch.len();
        let processor = self.processor.clone();

        BATCHES_DISPATCHED.inc();
        IN_FLIGHT_BATCHES.inc();
        debug!(batch_size, "Batch dispatched");

        tokio::spawn(async move {
            let _permit = permit;
            match AssertUnwindSafe(processor.process(batch)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(batch_size, code = e.code(), "Batch processing failed: {}", e);
                }
                Err(panic) => {
                    let e = Error::from_panic(panic);
                    error!(batch_size, code = e.code(), "Batch worker crashed: {}", e);
                }
            }
            IN_FLIGHT_BATCHES.dec();
        });
    }

    /// Wait for every in-flight batch to finish, up to `timeout`.
    /// Returns false when workers were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.semaphore.acquire_many(self.capacity as u32)).await
        {
            Ok(Ok(_all)) => true,
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(in_flight = self.in_flight(), "Drain timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<Delivery>>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        work: Duration,
        panic_on_first: bool,
    }

    impl Recorder {
        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl BatchProcessor for Recorder {
        async fn process(&self, batch: Vec<Delivery>) -> Result<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            if !self.work.is_zero() {
                sleep(self.work).await;
            }
            let first = {
                let mut batches = self.batches.lock().unwrap();
                batches.push(batch);
                batches.len() == 1
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on_first && first {
                panic!("bad batch");
            }
            Ok(())
        }
    }

    struct Harness {
        deliveries: mpsc::Sender<Delivery>,
        closed: mpsc::UnboundedSender<String>,
        session: BrokerSession,
    }

    fn harness() -> Harness {
        let (deliveries, rx) = mpsc::channel(64);
        let (closed, closed_rx) = mpsc::unbounded_channel();
        Harness {
            deliveries,
            closed,
            session: BrokerSession::new(rx, closed_rx),
        }
    }

    fn config(workers: usize, batch_size: usize) -> IntakeConfig {
        IntakeConfig {
            workers,
            batch_size,
            batch_timeout_ms: 50,
        }
    }

    async fn send(h: &Harness, n: usize) {
        for i in 0..n {
            let body = format!(r#"{{"machine_id": {}}}"#, i);
            h.deliveries.send(Delivery::new(body)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_dispatched_by_size() {
        let recorder = Arc::new(Recorder::default());
        let intake = BatchIntakeLoop::new(recorder.clone(), &config(10, 5));
        let mut h = harness();

        send(&h, 7).await;
        drop(h.deliveries);

        let exit = intake.run(&mut h.session, &CancellationToken::new()).await;
        assert_eq!(exit, IntakeExit::StreamEnded);
        assert!(intake.drain(Duration::from_secs(1)).await);

        // 5 by size, the remaining 2 flushed at stream end
        assert_eq!(recorder.sizes(), vec![5, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_dispatched_by_timeout() {
        let recorder = Arc::new(Recorder::default());
        let intake = Arc::new(BatchIntakeLoop::new(recorder.clone(), &config(10, 5)));
        let mut h = harness();
        let token = CancellationToken::new();

        send(&h, 2).await;
        let deliveries = h.deliveries.clone();
        let task = {
            let intake = intake.clone();
            let token = token.clone();
            tokio::spawn(async move { intake.run(&mut h.session, &token).await })
        };

        sleep(Duration::from_millis(120)).await;
        assert_eq!(recorder.sizes(), vec![2]);

        token.cancel();
        assert_eq!(task.await.unwrap(), IntakeExit::Cancelled);
        assert!(intake.drain(Duration::from_secs(1)).await);
        assert_eq!(recorder.sizes(), vec![2]);
        drop(deliveries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_buffer() {
        let recorder = Arc::new(Recorder::default());
        let intake = Arc::new(BatchIntakeLoop::new(recorder.clone(), &config(10, 5)));
        let mut h = harness();
        let token = CancellationToken::new();

        send(&h, 3).await;
        let deliveries = h.deliveries.clone();
        let task = {
            let intake = intake.clone();
            let token = token.clone();
            tokio::spawn(async move { intake.run(&mut h.session, &token).await })
        };

        // Inside the batch window: everything is still buffered
        sleep(Duration::from_millis(10)).await;
        assert!(recorder.sizes().is_empty());

        token.cancel();
        assert_eq!(task.await.unwrap(), IntakeExit::Cancelled);
        assert!(intake.drain(Duration::from_secs(1)).await);
        assert_eq!(recorder.sizes(), vec![3]);
        drop(deliveries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_picks_up_queued_deliveries() {
        let recorder = Arc::new(Recorder::default());
        let intake = BatchIntakeLoop::new(recorder.clone(), &config(10, 5));
        let mut h = harness();
        let token = CancellationToken::new();

        send(&h, 7).await;
        token.cancel();

        assert_eq!(intake.run(&mut h.session, &token).await, IntakeExit::Cancelled);
        assert!(intake.drain(Duration::from_secs(1)).await);
        assert_eq!(recorder.sizes(), vec![5, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_notification_picks_up_queued_deliveries() {
        let recorder = Arc::new(Recorder::default());
        let intake = BatchIntakeLoop::new(recorder.clone(), &config(10, 5));
        let mut h = harness();

        send(&h, 3).await;
        h.closed.send("connection lost".to_string()).unwrap();

        let exit = intake.run(&mut h.session, &CancellationToken::new()).await;
        assert_eq!(exit, IntakeExit::ConnectionLost("connection lost".to_string()));
        assert!(intake.drain(Duration::from_secs(1)).await);
        assert_eq!(recorder.sizes(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_notification_flushes_and_reports() {
        let recorder = Arc::new(Recorder::default());
        let intake = Arc::new(BatchIntakeLoop::new(recorder.clone(), &config(10, 5)));
        let mut h = harness();

        send(&h, 3).await;
        let closed = h.closed.clone();
        let deliveries = h.deliveries.clone();
        let task = {
            let intake = intake.clone();
            tokio::spawn(async move { intake.run(&mut h.session, &CancellationToken::new()).await })
        };

        sleep(Duration::from_millis(10)).await;
        closed.send("connection lost".to_string()).unwrap();

        let exit = task.await.unwrap();
        assert_eq!(exit, IntakeExit::ConnectionLost("connection lost".to_string()));
        assert!(intake.drain(Duration::from_secs(1)).await);
        assert_eq!(recorder.sizes(), vec![3]);
        drop(deliveries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounded_by_workers() {
        let recorder = Arc::new(Recorder {
            work: Duration::from_secs(1),
            ..Recorder::default()
        });
        let intake = BatchIntakeLoop::new(recorder.clone(), &config(2, 1));
        let mut h = harness();

        send(&h, 6).await;
        drop(h.deliveries);

        assert_eq!(
            intake.run(&mut h.session, &CancellationToken::new()).await,
            IntakeExit::StreamEnded
        );
        assert!(intake.drain(Duration::from_secs(10)).await);

        assert_eq!(recorder.sizes().len(), 6);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(intake.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_panic_does_not_stop_loop() {
        let recorder = Arc::new(Recorder {
            panic_on_first: true,
            ..Recorder::default()
        });
        let intake = BatchIntakeLoop::new(recorder.clone(), &config(1, 1));
        let mut h = harness();

        send(&h, 3).await;
        drop(h.deliveries);

        intake.run(&mut h.session, &CancellationToken::new()).await;
        assert!(intake.drain(Duration::from_secs(1)).await);
        assert_eq!(recorder.sizes(), vec![1, 1, 1]);
    }

    struct Failing;

    #[async_trait]
    impl BatchProcessor for Failing {
        async fn process(&self, _batch: Vec<Delivery>) -> Result<()> {
            Err(Error::EmptyBatch)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_releases_slot() {
        let intake = BatchIntakeLoop::new(Arc::new(Failing), &config(1, 1));
        let mut h = harness();

        send(&h, 4).await;
        drop(h.deliveries);

        assert_eq!(
            intake.run(&mut h.session, &CancellationToken::new()).await,
            IntakeExit::StreamEnded
        );
        assert!(intake.drain(Duration::from_secs(1)).await);
    }
}
