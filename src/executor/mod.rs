//! Background chunk io.
//!
//! A fixed pool of threads pulls jobs off one shared queue. Keyed jobs additionally go
//! through a lane per key, so two jobs for the same chunk never overlap and run in the
//! order they were submitted. Nothing is ever cancelled once submitted.

use crate::prelude::*;
use crate::config::StorageConfig;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

mod keyed;
use keyed::Lanes;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Orders io for one chunk of one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub world: u32,
    pub pos: ChunkPos,
}

thread_local! {
    static IS_WORKER: Cell<bool> = Cell::new(false);
}

struct Queue {
    jobs: VecDeque<Job>,
    live: usize,
    target: usize,
    stopping: bool,
    spawned: usize,
}

struct Shared {
    queue: Mutex<Queue>,
    work: Condvar,
    outstanding: Mutex<usize>,
    idle: Condvar,
    lanes: Lanes<TaskKey, Job>,
}
impl Shared {
    fn push(&self, job: Job) {
        let mut queue = self.queue.lock();
        if queue.stopping {
            drop(queue);
            log::warn!("io submitted after shutdown, running it inline");
            run(job);
            return;
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.work.notify_one();
    }
    fn begin(&self) {
        *self.outstanding.lock() += 1;
    }
}

/// Decrements the outstanding count when the job it lives in ends, panicking or not.
struct Done(Arc<Shared>);
impl Drop for Done {
    fn drop(&mut self) {
        let mut outstanding = self.0.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.0.idle.notify_all();
        }
    }
}

fn run(job: Job) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        log::error!("io task panicked: {msg}");
    }
}

fn lane_job(shared: Arc<Shared>, key: TaskKey, job: Job) -> Job {
    Box::new(move || {
        run(job);
        if let Some(next) = shared.lanes.finish(&key) {
            shared.push(lane_job(shared.clone(), key, next));
        }
    })
}

fn work(shared: Arc<Shared>, id: usize) {
    IS_WORKER.with(|w| w.set(true));
    log::trace!("io worker {id} started");
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.live > queue.target {
                    queue.live -= 1;
                    log::debug!("io worker {id} retiring");
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.stopping {
                    queue.live -= 1;
                    return;
                }
                shared.work.wait(&mut queue);
            }
        };
        run(job);
    }
}

pub struct IoExecutor {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    base_workers: usize,
    max_workers: usize,
    participants_per_worker: usize,
}

impl IoExecutor {
    pub fn new(config: &StorageConfig) -> Self {
        let executor = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    live: 0,
                    target: 0,
                    stopping: false,
                    spawned: 0,
                }),
                work: Condvar::new(),
                outstanding: Mutex::new(0),
                idle: Condvar::new(),
                lanes: Lanes::new(),
            }),
            handles: Mutex::new(vec![]),
            base_workers: config.base_workers.max(1),
            max_workers: config.max_workers.max(config.base_workers).max(1),
            participants_per_worker: config.participants_per_worker.max(1),
        };
        executor.resize(executor.base_workers);
        executor
    }
    pub fn with_workers(workers: usize) -> Self {
        Self::new(&StorageConfig {
            base_workers: workers.max(1),
            max_workers: workers.max(1),
            ..StorageConfig::default()
        })
    }

    /// Jobs submitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.lock()
    }
    /// The worker count the pool is converging on.
    pub fn workers(&self) -> usize {
        self.shared.queue.lock().target
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.begin();
        let done = Done(self.shared.clone());
        self.shared.push(Box::new(move || {
            let _done = done;
            task();
        }));
    }

    /// Like [`IoExecutor::submit`], but runs after every job already submitted under `key`
    /// and before any submitted later.
    pub fn submit_keyed(&self, key: TaskKey, task: impl FnOnce() + Send + 'static) {
        self.shared.begin();
        let done = Done(self.shared.clone());
        let job: Job = Box::new(move || {
            let _done = done;
            task();
        });
        if let Some(job) = self.shared.lanes.enqueue(key, job) {
            self.shared.push(lane_job(self.shared.clone(), key, job));
        }
    }

    /// Runs a load on the calling thread. The caller can't afford to queue behind saves
    /// it may itself have submitted.
    pub fn load_now<T>(&self, key: TaskKey, load: impl FnOnce() -> T) -> T {
        log::trace!("loading {:?} of world {} inline", key.pos, key.world);
        load()
    }

    /// Runs `load` on a worker and hands its result to `done` there.
    pub fn load_later<T: 'static>(
        &self,
        load: impl FnOnce() -> T + Send + 'static,
        done: impl FnOnce(T) + Send + 'static,
    ) {
        self.submit(move || done(load()));
    }

    /// Blocks until every submitted job has finished. Must not be called from a job.
    pub fn drain(&self) {
        if IS_WORKER.with(|w| w.get()) {
            log::error!("drain called from an io worker, it would wait on itself");
            debug_assert!(false, "drain called from an io worker");
            return;
        }
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }

    /// Grows or shrinks the pool. Queued jobs are kept; surplus workers finish their
    /// current job before leaving.
    pub fn resize(&self, workers: usize) {
        let workers = workers.clamp(1, self.max_workers);
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return;
        }
        if workers != queue.target {
            log::debug!("resizing io pool from {} to {workers} workers", queue.target);
        }
        queue.target = workers;
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        while queue.live < workers {
            let id = queue.spawned;
            let shared = self.shared.clone();
            match thread::Builder::new().name(format!("chunk-io-{id}")).spawn(move || work(shared, id)) {
                Ok(handle) => {
                    queue.live += 1;
                    queue.spawned += 1;
                    handles.push(handle);
                }
                Err(e) => {
                    log::error!("failed to spawn io worker: {e}");
                    break;
                }
            }
        }
        drop(handles);
        drop(queue);
        self.shared.work.notify_all();
    }

    /// Scales the pool with the number of connected players.
    pub fn adjust_for_participants(&self, participants: usize) {
        self.resize(self.base_workers + participants / self.participants_per_worker);
    }

    /// Finishes all queued work and stops the workers.
    pub fn shutdown(&self) {
        if IS_WORKER.with(|w| w.get()) {
            log::error!("shutdown called from an io worker");
            return;
        }
        self.drain();
        self.shared.queue.lock().stopping = true;
        self.shared.work.notify_all();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("io worker panicked");
            }
        }
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IoExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoExecutor")
            .field("workers", &self.workers())
            .field("outstanding", &self.outstanding())
            .field("active_keys", &self.shared.lanes.active())
            .finish()
    }
}
