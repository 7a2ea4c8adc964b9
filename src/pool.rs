//! Fixed-size CPU worker pool
//!
//! A bounded FIFO pool in the classic mutex + condition-variable shape:
//! workers sleep on `stop || !queue.empty()`, submission notifies one,
//! teardown sets the stop flag under the lock and broadcasts. Task bodies
//! run under `catch_unwind`, so a panicking task never takes a worker
//! thread down; the payload is surfaced through the task's
//! [`Completion`] handle instead.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

/// Handle to the eventual result of a submitted task
///
/// `wait` blocks until the task body has run and yields its result, or
/// the captured panic as [`Error::TaskPanicked`].
pub struct Completion<R> {
    shared: Arc<CompletionShared<R>>,
}

struct CompletionShared<R> {
    slot: Mutex<Option<std::thread::Result<R>>>,
    done: Condvar,
}

impl<R> Completion<R> {
    fn pair() -> (Self, Arc<CompletionShared<R>>) {
        let shared = Arc::new(CompletionShared {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            shared,
        )
    }

    /// Block until the task has finished and take its result
    ///
    /// A task discarded by pool teardown never fills its handle; use
    /// [`Completion::try_take`] when the pool may be dropped first.
    pub fn wait(self) -> Result<R> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.done.wait(&mut slot);
        }
        match slot.take().expect("completion slot filled") {
            Ok(value) => Ok(value),
            Err(payload) => Err(Error::TaskPanicked {
                task: "<pool task>".to_string(),
                message: Error::panic_message(payload.as_ref()),
            }),
        }
    }

    /// Non-blocking probe; returns `None` while the task is in flight
    pub fn try_take(&self) -> Option<Result<R>> {
        let mut slot = self.shared.slot.lock();
        slot.take().map(|result| match result {
            Ok(value) => Ok(value),
            Err(payload) => Err(Error::TaskPanicked {
                task: "<pool task>".to_string(),
                message: Error::panic_message(payload.as_ref()),
            }),
        })
    }
}

/// Fixed-size FIFO thread pool
///
/// Dropping the pool signals workers to stop, discards queued-but-
/// unstarted work, and joins every worker; in-flight tasks run to
/// completion first.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn a pool with `num_threads` workers
    ///
    /// Fails with [`Error::InvalidThreadCount`] for a zero thread count.
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::InvalidThreadCount);
        }

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stop: false,
            }),
            work_ready: Condvar::new(),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("taskr-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| Error::Internal(format!("failed to spawn worker: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(num_threads, "thread pool started");
        Ok(Self { shared, workers })
    }

    /// Number of worker threads
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task and return its completion handle
    ///
    /// Admission order is FIFO. The task body runs under `catch_unwind`;
    /// a panic is delivered through the handle, never to the worker.
    pub fn submit<F, R>(&self, task: F) -> Completion<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (completion, shared) = Completion::pair();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task));
            *shared.slot.lock() = Some(result);
            shared.done.notify_all();
        });

        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(job);
        }
        self.shared.work_ready.notify_one();

        completion
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            state.queue.clear();
        }
        self.shared.work_ready.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!("thread pool drained");
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.stop {
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                shared.work_ready.wait(&mut state);
            }
        };
        job();
    }
}
