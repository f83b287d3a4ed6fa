//! Per-session serial, cross-session parallel job dispatch.
//!
//! Each session key gets a bounded FIFO queue and one consumer task; a
//! global semaphore caps how many jobs run at once across all sessions.
//! Enqueueing into a full queue blocks the caller, which is the intended
//! back-pressure for a chat-scale workload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use chatbridge_protocol::Job;

const DEFAULT_MAX_CONCURRENT: usize = 8;
const DEFAULT_PER_SESSION_BUFFER: usize = 64;

#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn run(&self, job: Job);
}

struct DispatcherInner {
    queues: Mutex<HashMap<String, mpsc::Sender<Job>>>,
    worker: Arc<dyn JobWorker>,
    semaphore: Arc<Semaphore>,
    buffer: usize,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(max_concurrent: usize, per_session_buffer: usize, worker: Arc<dyn JobWorker>) -> Self {
        let max_concurrent = if max_concurrent == 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        let per_session_buffer = if per_session_buffer == 0 {
            DEFAULT_PER_SESSION_BUFFER
        } else {
            per_session_buffer
        };
        Self {
            inner: Arc::new(DispatcherInner {
                queues: Mutex::new(HashMap::new()),
                worker,
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                buffer: per_session_buffer,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Appends the job to its session's queue, creating the queue and its
    /// consumer task on first use. Blocks when the queue is full.
    pub async fn enqueue(&self, job: Job) {
        let key = job.session_key.to_string();
        let sender = {
            let mut queues = self
                .inner
                .queues
                .lock()
                .expect("dispatcher queue map lock poisoned");
            queues
                .entry(key)
                .or_insert_with(|| {
                    let (sender, receiver) = mpsc::channel(self.inner.buffer);
                    tokio::spawn(consume(
                        receiver,
                        Arc::clone(&self.inner.worker),
                        Arc::clone(&self.inner.semaphore),
                        self.inner.shutdown.clone(),
                    ));
                    sender
                })
                .clone()
        };
        if sender.send(job).await.is_err() {
            tracing::warn!("dispatcher queue closed while enqueueing job");
        }
    }

    /// Stops every consumer task. Jobs already running finish; queued jobs
    /// are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn consume(
    mut receiver: mpsc::Receiver<Job>,
    worker: Arc<dyn JobWorker>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };
        let Ok(permit) = semaphore.acquire().await else {
            return;
        };
        worker.run(job).await;
        drop(permit);
    }
}
