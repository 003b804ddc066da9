//! In-process work queue: a bounded FIFO of jobs, an id → job map for O(1)
//! cancellation, and a fixed pool of worker threads.
//!
//! The queue is in-memory only; descriptors on disk survive a restart, the
//! queue does not. Workers poll with a short timeout so `stop` stays
//! responsive.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::job::Job;
use crate::server::ServerContext;

const POP_TIMEOUT: Duration = Duration::from_millis(200);

/// Shared queue state. Jobs hold a weak reference back to this for
/// successor chaining; strong ownership stays with [`WorkQueue`] and the
/// worker threads.
pub struct QueueShared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    space_ready: Condvar,
    running: AtomicBool,
    /// Pending-queue capacity; 0 = unbounded.
    capacity: usize,
}

#[derive(Default)]
struct QueueState {
    fifo: VecDeque<Arc<Job>>,
    tracked: HashMap<String, Arc<Job>>,
}

impl QueueShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register and enqueue a job. Blocks while a bounded queue is full;
    /// fails once the queue has been stopped.
    pub fn enqueue(&self, job: Arc<Job>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Malformed("work queue is stopped".to_string()));
        }
        // Persist QUEUED before the job becomes poppable so a worker can
        // never observe a pre-queue status.
        job.mark_queued()?;

        let mut state = self.state.lock();
        while self.capacity > 0 && state.fifo.len() >= self.capacity && self.is_running() {
            self.space_ready.wait(&mut state);
        }
        if !self.is_running() {
            return Err(Error::Malformed("work queue is stopped".to_string()));
        }
        state.tracked.insert(job.id().to_string(), job.clone());
        state.fifo.push_back(job);
        drop(state);
        self.work_ready.notify_one();
        Ok(())
    }

    /// The tracked job for `id`, if any.
    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.state.lock().tracked.get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.state.lock().tracked.contains_key(job_id)
    }

    /// Ids of all tracked (queued or running) jobs, FIFO position first.
    pub fn tracked_ids(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state.fifo.iter().map(|j| j.id().to_string()).collect();
        for id in state.tracked.keys() {
            if !ids.iter().any(|i| i == id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Terminate a tracked job and release its queue slot. Returns false
    /// when the id is not tracked. The job lock is taken outside the queue
    /// lock; lock order is always job-then-queue or queue-alone.
    pub fn terminate(&self, job_id: &str, shutdown: bool) -> bool {
        let job = {
            let mut state = self.state.lock();
            state.fifo.retain(|j| j.id() != job_id);
            state.tracked.remove(job_id)
        };
        self.space_ready.notify_one();
        match job {
            Some(job) => {
                info!(id = %job_id, shutdown, "terminating job");
                job.terminate(shutdown);
                true
            }
            None => false,
        }
    }

    /// Worker-side pop with timeout; `None` on timeout or shutdown.
    fn pop(&self) -> Option<Arc<Job>> {
        let mut state = self.state.lock();
        if let Some(job) = state.fifo.pop_front() {
            self.space_ready.notify_one();
            return Some(job);
        }
        if !self.is_running() {
            return None;
        }
        let _ = self.work_ready.wait_for(&mut state, POP_TIMEOUT);
        let job = state.fifo.pop_front();
        if job.is_some() {
            self.space_ready.notify_one();
        }
        job
    }

    /// Drop the tracking entry after a worker finished a job.
    fn untrack(&self, job_id: &str) {
        self.state.lock().tracked.remove(job_id);
        self.space_ready.notify_one();
    }
}

/// Worker pool plus queue lifecycle. Created by [`WorkQueue::start`] and
/// shut down exactly once by [`WorkQueue::stop`].
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawn the worker pool. Pool size and queue capacity come from the
    /// context's configuration.
    pub fn start(ctx: &Arc<ServerContext>) -> WorkQueue {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            running: AtomicBool::new(true),
            capacity: ctx.config.queuelimit,
        });

        let count = ctx.config.workers();
        let mut workers = Vec::with_capacity(count);
        for n in 0..count {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("pline-worker-{n}"))
                .spawn(move || worker_loop(&shared))
                .expect("spawn worker thread");
            workers.push(handle);
        }
        info!(workers = count, capacity = ctx.config.queuelimit, "work queue started");
        WorkQueue {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Handle for enqueueing and cancellation; safe to clone into jobs as a
    /// weak reference.
    pub fn handle(&self) -> Arc<QueueShared> {
        self.shared.clone()
    }

    /// Stop accepting work, terminate every tracked job with the shutdown
    /// sentinel, and join the workers.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let ids = self.shared.tracked_ids();
        for id in ids {
            self.shared.terminate(&id, true);
        }
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("work queue stopped");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Arc<QueueShared>) {
    loop {
        match shared.pop() {
            Some(job) => {
                debug!(id = %job.id(), "worker picked job");
                job.process();
                shared.untrack(job.id());
            }
            None => {
                if !shared.is_running() {
                    break;
                }
            }
        }
    }
}
