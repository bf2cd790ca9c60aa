//! Bounded worker pool for request cycles.
//!
//! Sizing follows the classic core/max/queue model: the first `core_size`
//! submissions each start a worker, later ones go to an idle worker or wait
//! in a bounded queue, and only a full queue starts extra workers up to
//! `max_size`. When the queue is full and every worker is taken the task is
//! rejected and handed back to the caller. Extra workers retire after
//! sitting idle for `keep_alive`.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::ThreadPoolConfig;

/// Unit of work run by a worker.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub queue_size: usize,
    pub keep_alive: Duration,
}

impl From<&ThreadPoolConfig> for PoolConfig {
    fn from(cfg: &ThreadPoolConfig) -> Self {
        Self {
            core_size: cfg.core_size,
            max_size: cfg.max_size.max(cfg.core_size).max(1),
            queue_size: cfg.queue_size,
            keep_alive: Duration::from_secs(cfg.keep_alive_time),
        }
    }
}

/// The pool refused a task; the task is returned untouched.
#[derive(Error)]
#[error("worker pool saturated, task rejected")]
pub struct Rejected(pub Task);

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected(..)")
    }
}

impl Rejected {
    pub fn into_task(self) -> Task {
        self.0
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

struct State {
    queue: VecDeque<Task>,
    workers: usize,
    busy: usize,
    shutdown: bool,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    available: Notify,
    idle: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        tracing::debug!(
            core = config.core_size,
            max = config.max_size,
            queue = config.queue_size,
            keep_alive_secs = config.keep_alive.as_secs(),
            "Worker pool created"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    workers: 0,
                    busy: 0,
                    shutdown: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Hands a task to the pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: Task) -> Result<(), Rejected> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();

        if state.shutdown {
            return Err(Rejected(task));
        }

        if state.workers < config.core_size {
            state.workers += 1;
            state.busy += 1;
            drop(state);
            self.start_worker(task);
            return Ok(());
        }

        // An idle worker picks the task up straight away
        if state.queue.len() < state.workers - state.busy {
            state.queue.push_back(task);
            drop(state);
            self.shared.available.notify_one();
            return Ok(());
        }

        if state.queue.len() < config.queue_size {
            state.queue.push_back(task);
            drop(state);
            self.shared.available.notify_one();
            return Ok(());
        }

        if state.workers < config.max_size {
            state.workers += 1;
            state.busy += 1;
            drop(state);
            self.start_worker(task);
            return Ok(());
        }

        tracing::warn!(
            workers = state.workers,
            queued = state.queue.len(),
            "Worker pool saturated, rejecting task"
        );
        Err(Rejected(task))
    }

    /// Boxes `future` and submits it.
    pub fn spawn<F>(&self, future: F) -> Result<(), Rejected>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(Box::pin(future))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            workers: state.workers,
            busy: state.busy,
            queued: state.queue.len(),
        }
    }

    /// Stops accepting tasks. Queued tasks still run; idle workers exit.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_waiters();
    }

    /// Waits until no task is queued or running. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.idle.notified();
                {
                    let state = self.shared.lock();
                    if state.busy == 0 && state.queue.is_empty() {
                        return;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn start_worker(&self, first: Task) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(worker_loop(shared, first));
    }
}

async fn worker_loop(shared: Arc<Shared>, first: Task) {
    let mut task = Some(first);

    loop {
        if let Some(current) = task.take() {
            if AssertUnwindSafe(current).catch_unwind().await.is_err() {
                tracing::error!("Worker task panicked");
            }

            let mut state = shared.lock();
            state.busy -= 1;
            if state.busy == 0 && state.queue.is_empty() {
                shared.idle.notify_waiters();
            }
        }

        // Registered before the queue check so a notify_one between the
        // check and the await wakes this worker instead of storing a permit
        let notified = shared.available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let extra = {
            let mut state = shared.lock();
            if let Some(next) = state.queue.pop_front() {
                state.busy += 1;
                task = Some(next);
                continue;
            }
            if state.shutdown {
                state.workers -= 1;
                return;
            }
            state.workers > shared.config.core_size
        };

        if !extra {
            notified.await;
            continue;
        }

        if tokio::time::timeout(shared.config.keep_alive, notified)
            .await
            .is_err()
        {
            let mut state = shared.lock();
            if state.queue.is_empty() && state.workers > shared.config.core_size {
                state.workers -= 1;
                tracing::trace!(workers = state.workers, "Idle worker retired");
                return;
            }
        }
    }
}
