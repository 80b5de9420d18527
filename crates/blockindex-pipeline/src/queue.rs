//! Named in-process work queues.
//!
//! Each queue is a bounded `mpsc` channel drained by `concurrency` worker
//! tasks sharing one receiver. With a single worker, jobs run strictly in
//! enqueue order, which makes the queue a mutex over the block tables.
//!
//! A job whose handler fails with a retryable error ([`IndexerError::is_retryable`])
//! is re-run by the same worker after an exponential backoff, up to
//! `max_attempts`. Any other failure marks the job failed.

use async_trait::async_trait;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use blockindex_core::config::QueueSettings;
use blockindex_core::error::IndexerError;
use blockindex_core::events::JobCounts;

use crate::retry::RetryPolicy;

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: &J) -> Result<(), IndexerError>;
}

#[derive(Debug, Default)]
struct Counters {
    waiting: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

struct Shared {
    name: String,
    counters: Counters,
    closed: AtomicBool,
    idle: Notify,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn is_idle(&self) -> bool {
        self.counters.waiting.load(Ordering::SeqCst) == 0
            && self.counters.active.load(Ordering::SeqCst) == 0
    }
}

/// Producer side of a queue. Cheap to clone.
pub struct WorkQueue<J> {
    tx: mpsc::Sender<J>,
    shared: Arc<Shared>,
}

impl<J> Clone for WorkQueue<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consumer side of a queue, turned into worker tasks by [`QueueRunner::spawn`].
pub struct QueueRunner<J> {
    rx: mpsc::Receiver<J>,
    shared: Arc<Shared>,
    settings: QueueSettings,
}

impl<J> WorkQueue<J>
where
    J: Display + Send + Sync + 'static,
{
    /// Create a queue and the runner that will drain it.
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> (Self, QueueRunner<J>) {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: name.into(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
            shutdown,
        });
        (
            Self {
                tx,
                shared: Arc::clone(&shared),
            },
            QueueRunner {
                rx,
                shared,
                settings,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add a job, waiting for capacity if the queue is full.
    pub async fn enqueue(&self, job: J) -> Result<(), IndexerError> {
        if self.is_closed() {
            return Err(IndexerError::QueueClosed(self.shared.name.clone()));
        }
        self.shared.counters.waiting.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).await.is_err() {
            self.release_waiting();
            return Err(IndexerError::QueueClosed(self.shared.name.clone()));
        }
        Ok(())
    }

    /// Add a job without waiting. Fails if the queue is full or closed.
    pub fn try_enqueue(&self, job: J) -> Result<(), IndexerError> {
        if self.is_closed() {
            return Err(IndexerError::QueueClosed(self.shared.name.clone()));
        }
        self.shared.counters.waiting.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.release_waiting();
                Err(IndexerError::Other(format!("queue '{}' is full", self.shared.name)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.release_waiting();
                Err(IndexerError::QueueClosed(self.shared.name.clone()))
            }
        }
    }

    fn release_waiting(&self) {
        self.shared.counters.waiting.fetch_sub(1, Ordering::SeqCst);
        self.shared.idle.notify_waiters();
    }

    /// Snapshot of the job counters.
    pub fn counts(&self) -> JobCounts {
        let c = &self.shared.counters;
        JobCounts {
            queue: self.shared.name.clone(),
            waiting: c.waiting.load(Ordering::SeqCst),
            active: c.active.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            retried: c.retried.load(Ordering::SeqCst),
        }
    }

    /// Returns `true` if no job is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Resolve once no job is waiting or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and tell workers to exit after their current job.
    ///
    /// Jobs still waiting in the channel are dropped.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.shared.name, "queue closed");
            let _ = self.shared.shutdown.send(true);
        }
    }
}

impl<J> QueueRunner<J>
where
    J: Display + Send + Sync + 'static,
{
    /// Number of worker tasks [`spawn`](Self::spawn) starts.
    pub fn workers(&self) -> usize {
        self.settings.concurrency.max(1)
    }

    /// Spawn the worker tasks.
    pub fn spawn<H>(self, handler: Arc<H>) -> Vec<JoinHandle<()>>
    where
        H: JobHandler<J> + ?Sized,
    {
        let workers = self.workers();
        let rx = Arc::new(Mutex::new(self.rx));
        let policy = RetryPolicy::from_settings(&self.settings);
        (0..workers)
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    rx: Arc::clone(&rx),
                    shared: Arc::clone(&self.shared),
                    handler: Arc::clone(&handler),
                    policy: policy.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Worker<J, H: ?Sized> {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<J>>>,
    shared: Arc<Shared>,
    handler: Arc<H>,
    policy: RetryPolicy,
}

impl<J, H> Worker<J, H>
where
    J: Display + Send + Sync + 'static,
    H: JobHandler<J> + ?Sized,
{
    async fn run(self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else {
                break;
            };

            let c = &self.shared.counters;
            c.active.fetch_add(1, Ordering::SeqCst);
            c.waiting.fetch_sub(1, Ordering::SeqCst);
            self.execute(&job).await;
            c.active.fetch_sub(1, Ordering::SeqCst);
            self.shared.idle.notify_waiters();
        }
        debug!(queue = %self.shared.name, worker = self.id, "worker stopped");
    }

    async fn execute(&self, job: &J) {
        let queue = self.shared.name.as_str();
        let c = &self.shared.counters;
        let mut attempt = 1;
        loop {
            match self.handler.handle(job).await {
                Ok(()) => {
                    c.completed.fetch_add(1, Ordering::SeqCst);
                    debug!(queue, job = %job, attempt, "job completed");
                    return;
                }
                Err(e) if e.is_retryable() => match self.policy.next_delay(attempt) {
                    Some(delay) => {
                        c.retried.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            queue,
                            job = %job,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "job failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        c.failed.fetch_add(1, Ordering::SeqCst);
                        error!(queue, job = %job, attempt, error = %e, "job failed, out of attempts");
                        return;
                    }
                },
                Err(e) => {
                    c.failed.fetch_add(1, Ordering::SeqCst);
                    error!(queue, job = %job, attempt, error = %e, "job failed");
                    return;
                }
            }
        }
    }
}
