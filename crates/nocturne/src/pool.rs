// src/pool.rs
//! Fixed-size worker pool over a FIFO task queue.
use crate::sync::{Semaphore, lock};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};

/// Work executed by the pool. `process` runs on some worker thread; if it
/// panics (and the `catch-panic` feature is on) `abort` runs for the same
/// task on that thread.
pub trait Process: Send + Sync + 'static {
    type Task: Send + Copy + std::fmt::Debug + 'static;

    fn process(&self, task: Self::Task);

    fn abort(&self, _task: Self::Task) {}
}

#[derive(Debug, Error)]
pub enum PoolError<T: std::fmt::Debug> {
    #[error("worker pool is shut down")]
    Rejected(T),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

struct TaskQueue<T> {
    tasks: Mutex<VecDeque<T>>,
    ready: Semaphore,
    closed: AtomicBool,
}

impl<T> TaskQueue<T> {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Block until a task is available or the queue is closed.
    fn pop(&self) -> Option<T> {
        loop {
            self.ready.wait();
            if let Some(task) = lock(&self.tasks).pop_front() {
                return Some(task);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub threads: usize,
    /// Pin worker `i` to core `i % cores` where affinity is available.
    pub pin_threads: bool,
}

pub struct WorkerPool<P: Process> {
    queue: Arc<TaskQueue<P::Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl<P: Process> WorkerPool<P> {
    pub fn start(processor: Arc<P>, options: PoolOptions) -> Result<Self, PoolError<P::Task>> {
        let threads = options.threads.max(1);
        let queue = Arc::new(TaskQueue::new());
        let core_ids = if options.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            queue,
            handles: Vec::with_capacity(threads),
        };
        for i in 0..threads {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let queue = Arc::clone(&pool.queue);
            let processor = Arc::clone(&processor);

            let spawned = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        } else {
                            debug!(worker = i, core = id.id, "failed to pin worker");
                        }
                    }
                    worker_loop(i, &queue, &*processor);
                });
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!(threads, pinned = !core_ids.is_empty(), "worker pool started");
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Tasks submitted but not yet picked up.
    pub fn pending(&self) -> usize {
        lock(&self.queue.tasks).len()
    }

    /// Append a task and wake one worker. Fails only after shutdown began.
    pub fn submit(&self, task: P::Task) -> Result<(), PoolError<P::Task>> {
        {
            let mut tasks = lock(&self.queue.tasks);
            if self.queue.closed.load(Ordering::Acquire) {
                return Err(PoolError::Rejected(task));
            }
            tasks.push_back(task);
        }
        self.queue.ready.post();
        Ok(())
    }

    /// Stop accepting tasks, let workers drain the queue, and join them.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        {
            let _tasks = lock(&self.queue.tasks);
            self.queue.closed.store(true, Ordering::Release);
        }
        self.queue.ready.post_n(self.handles.len());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside a task");
            }
        }
        debug!("worker pool joined");
    }
}

impl<P: Process> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<P: Process>(worker: usize, queue: &TaskQueue<P::Task>, processor: &P) {
    while let Some(task) = queue.pop() {
        run_task(worker, processor, task);
    }
    debug!(worker, "worker exiting");
}

#[cfg(feature = "catch-panic")]
fn run_task<P: Process>(worker: usize, processor: &P, task: P::Task) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| processor.process(task)));
    if result.is_err() {
        error!(worker, ?task, "task panicked");
        processor.abort(task);
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_task<P: Process>(_worker: usize, processor: &P, task: P::Task) {
    processor.process(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        sum: AtomicUsize,
        aborted: AtomicUsize,
    }

    impl Process for Counter {
        type Task = usize;

        fn process(&self, task: usize) {
            if task == 13 {
                panic!("unlucky task");
            }
            self.sum.fetch_add(task, Ordering::SeqCst);
        }

        fn abort(&self, task: usize) {
            self.aborted.fetch_add(task, Ordering::SeqCst);
        }
    }

    fn options(threads: usize) -> PoolOptions {
        PoolOptions {
            threads,
            pin_threads: false,
        }
    }

    #[test]
    fn test_every_task_runs_once() {
        let counter = Arc::new(Counter::default());
        let mut pool = WorkerPool::start(Arc::clone(&counter), options(4)).unwrap();
        assert_eq!(pool.threads(), 4);

        for i in 1..=100 {
            pool.submit(i).unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.sum.load(Ordering::SeqCst), 5050);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let counter = Arc::new(Counter::default());
        let mut pool = WorkerPool::start(Arc::clone(&counter), options(2)).unwrap();
        pool.shutdown();
        match pool.submit(7) {
            Err(PoolError::Rejected(task)) => assert_eq!(task, 7),
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
        // Second shutdown is a no-op.
        pool.shutdown();
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn test_panicking_task_is_aborted_and_worker_survives() {
        let counter = Arc::new(Counter::default());
        let mut pool = WorkerPool::start(Arc::clone(&counter), options(1)).unwrap();
        pool.submit(13).unwrap();
        pool.submit(2).unwrap();
        pool.shutdown();
        assert_eq!(counter.aborted.load(Ordering::SeqCst), 13);
        assert_eq!(counter.sum.load(Ordering::SeqCst), 2);
    }

    struct Slow {
        done: AtomicUsize,
    }

    impl Process for Slow {
        type Task = usize;

        fn process(&self, _task: usize) {
            thread::sleep(Duration::from_micros(50));
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drain_on_shutdown_runs_queued_tasks() {
        let slow = Arc::new(Slow {
            done: AtomicUsize::new(0),
        });
        let mut pool = WorkerPool::start(Arc::clone(&slow), options(3)).unwrap();
        for i in 0..200 {
            pool.submit(i).unwrap();
        }
        pool.shutdown();
        assert_eq!(slow.done.load(Ordering::SeqCst), 200);
    }
}
