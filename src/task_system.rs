// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_deque::{Injector, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send>;

/// A fixed pool of worker threads with per-worker FIFO queues and
/// work-stealing.
///
/// Tasks must run to completion without blocking on other tasks; fan-out is
/// expressed by submitting continuations. [`TaskSystem::finish`] blocks the
/// caller until the pool is quiescent, then joins the workers.
pub struct TaskSystem {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    sleep: Mutex<()>,
    work_available: Condvar,
    quiescent: Condvar,
    // Tasks submitted but not yet completed (or discarded).
    pending: AtomicUsize,
    shutdown: AtomicBool,
    cancelled: AtomicBool,
}

impl TaskSystem {
    /// Create a pool with `jobs` worker threads; zero means one thread per
    /// hardware core.
    pub fn new(jobs: usize) -> Arc<TaskSystem> {
        let jobs = if jobs == 0 { num_cpus::get() } else { jobs };
        let workers: Vec<Worker<Task>> = (0..jobs).map(|_| Worker::new_fifo()).collect();
        let stealers = workers.iter().map(Worker::stealer).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            sleep: Mutex::new(()),
            work_available: Condvar::new(),
            quiescent: Condvar::new(),
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        debug!(jobs, "starting task system");
        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(index, worker)| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || run_worker(index, worker, &shared))
            })
            .collect();
        Arc::new(TaskSystem {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Submit a task. After [`cancel`](Self::cancel) the task is dropped.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(Box::new(task));
        let _guard = self.shared.sleep.lock();
        self.shared.work_available.notify_one();
    }

    /// Abort the run: queued tasks are discarded and no new tasks are
    /// accepted. Running tasks complete.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        let _guard = self.shared.sleep.lock();
        self.shared.work_available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Wait until all submitted tasks (including transitively submitted
    /// continuations) have completed, then shut the workers down.
    pub fn finish(&self) {
        {
            let mut guard = self.shared.sleep.lock();
            while self.shared.pending.load(Ordering::Acquire) != 0 {
                self.shared.quiescent.wait(&mut guard);
            }
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.work_available.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        // Make sure worker threads never outlive the pool object.
        self.shared.cancelled.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleep.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.work_available.notify_all();
        }
        for handle in std::mem::take(&mut *self.handles.lock()) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSystem")
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .finish()
    }
}

fn run_worker(index: usize, local: Worker<Task>, shared: &Shared) {
    loop {
        match find_task(index, &local, shared) {
            Some(task) => {
                if !shared.cancelled.load(Ordering::Acquire) {
                    task();
                }
                if shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let _guard = shared.sleep.lock();
                    shared.quiescent.notify_all();
                }
            }
            None => {
                let mut guard = shared.sleep.lock();
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                // Re-check under the lock so a concurrent submit cannot be
                // missed between the failed pop and going to sleep.
                if queues_look_empty(index, &local, shared) {
                    shared.work_available.wait(&mut guard);
                }
            }
        }
    }
}

fn find_task(index: usize, local: &Worker<Task>, shared: &Shared) -> Option<Task> {
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        let steal = shared.injector.steal_batch_and_pop(local);
        if steal.is_success() {
            return steal.success();
        }
        if !steal.is_retry() {
            break;
        }
    }
    for (other, stealer) in shared.stealers.iter().enumerate() {
        if other == index {
            continue;
        }
        loop {
            let steal = stealer.steal();
            if steal.is_success() {
                return steal.success();
            }
            if !steal.is_retry() {
                break;
            }
        }
    }
    None
}

fn queues_look_empty(index: usize, local: &Worker<Task>, shared: &Shared) -> bool {
    local.is_empty()
        && shared.injector.is_empty()
        && shared
            .stealers
            .iter()
            .enumerate()
            .all(|(other, stealer)| other == index || stealer.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_tasks_run_before_finish_returns() {
        let ts = TaskSystem::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            ts.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        ts.finish();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn continuations_submitted_from_tasks_complete() {
        let ts = TaskSystem::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let ts_inner = Arc::clone(&ts);
            let counter = Arc::clone(&counter);
            ts.execute(move || {
                for _ in 0..10 {
                    let counter = Arc::clone(&counter);
                    ts_inner.execute(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
        ts.finish();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn cancellation_discards_queued_tasks() {
        let ts = TaskSystem::new(1);
        ts.cancel();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            ts.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        ts.finish();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
