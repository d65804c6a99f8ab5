//! Deferred cache population.
//!
//! Query results that must be written to the cache asynchronously are pushed here as ready-to-run futures and
//! executed by a small pool of worker tasks. The queue is bounded; what happens on overflow is decided by
//! [`QueueOverflow`].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::settings::CacheSettings;
use crate::settings::QueueOverflow;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, but the oldest pending job was discarded to make room.
    DisplacedOldest,
    /// The queue is closed; the job was dropped.
    Closed,
}

struct QueueState {
    jobs:     Mutex<VecDeque<Job>>,
    capacity: usize,
    overflow: QueueOverflow,
    workers:  usize,
    running:  AtomicUsize,
    dropped:  AtomicU64,
    closed:   AtomicBool,
    items:    Notify,
    space:    Notify,
    idle:     Notify,
}

impl QueueState {
    fn pending(&self) -> usize {
        // The lock makes "popped but not yet counted as running" unobservable.
        let jobs = self.jobs.lock();
        jobs.len() + self.running.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs.pop_front();
        if job.is_some() {
            self.running.fetch_add(1, Ordering::AcqRel);
            if !jobs.is_empty() {
                self.items.notify_one();
            }
        }
        job
    }
}

pub struct WriteQueue {
    state:   Arc<QueueState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn new(capacity: usize, workers: usize, overflow: QueueOverflow) -> Self {
        Self {
            state:   Arc::new(QueueState {
                jobs: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity: capacity.max(1),
                overflow,
                workers: workers.max(1),
                running: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                items: Notify::new(),
                space: Notify::new(),
                idle: Notify::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.queue_capacity(), settings.workers(), settings.overflow())
    }

    /// Number of jobs waiting or in progress.
    pub fn pending(&self) -> usize {
        self.state.pending()
    }

    /// Number of jobs discarded because of overflow.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub async fn push<F>(&self, job: F) -> PushOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = &self.state;
        let mut job: Option<Job> = Some(Box::pin(job));

        let outcome = loop {
            if self.is_closed() {
                log::warn!("Deferred cache write dropped: queue is closed");
                return PushOutcome::Closed;
            }

            let space = state.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut jobs = state.jobs.lock();
                if jobs.len() < state.capacity {
                    jobs.extend(job.take());
                    break PushOutcome::Queued;
                }
                if state.overflow == QueueOverflow::DropOldest {
                    jobs.pop_front();
                    jobs.extend(job.take());
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Deferred cache write queue is full (capacity={}); dropped the oldest job",
                        state.capacity
                    );
                    break PushOutcome::DisplacedOldest;
                }
            }

            // QueueOverflow::Wait
            self.ensure_workers();
            space.await;
        };

        state.items.notify_one();
        self.ensure_workers();
        outcome
    }

    /// Wait until every job queued so far is processed.
    pub async fn flush(&self) {
        loop {
            let idle = self.state.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting jobs, let the workers drain what is queued, and wait for them to exit.
    pub async fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.items.notify_waiters();
        self.state.space.notify_waiters();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                log::error!("Cache writer worker failed: {err}");
            }
        }
    }

    fn ensure_workers(&self) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        while handles.len() < self.state.workers {
            let state = Arc::clone(&self.state);
            handles.push(tokio::spawn(work(state)));
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.items.notify_waiters();
        self.state.space.notify_waiters();
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("capacity", &self.state.capacity)
            .field("overflow", &self.state.overflow)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn work(state: Arc<QueueState>) {
    loop {
        let items = state.items.notified();
        tokio::pin!(items);
        items.as_mut().enable();

        if let Some(job) = state.pop() {
            state.space.notify_waiters();
            // A panicking job must not take the worker down with it.
            if let Err(err) = tokio::spawn(job).await {
                log::error!("Deferred cache write failed: {err}");
            }
            state.running.fetch_sub(1, Ordering::AcqRel);
            state.idle.notify_waiters();
            continue;
        }

        if state.closed.load(Ordering::Acquire) {
            break;
        }

        items.await;
    }
}
