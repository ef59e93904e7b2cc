//! M:N work-stealing scheduler backing the queue adapter's dispatcher.
//!
//! The scheduler maintains a pool of OS worker threads, each with a local
//! work-stealing deque. New tasks enter via a global injection queue and are
//! distributed to workers. When a worker's local queue is empty it attempts
//! to steal from peers before falling back to the global queue.
//!
//! # Work-stealing algorithm
//!
//! Each worker thread runs a loop with the following priority:
//! 1. Pop from local FIFO deque (cheapest — no contention).
//! 2. Steal a batch from the global [`Injector`] queue into the local deque.
//! 3. Steal from a random peer worker's [`Stealer`].
//! 4. Park briefly (1 ms) to avoid busy-spinning, then retry.
//!
//! Task completion is tracked via a shared [`AtomicUsize`] counter so callers
//! can wait for a known number of tasks to finish.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A schedulable unit of work.
///
/// Carries a boxed closure that the worker will invoke. The closure signature
/// `FnOnce()` is intentionally simple — callers correlate work back to their
/// own state (an operation, in this crate) via the closure's captures.
pub struct Task {
    /// The work to execute. `Option` so we can `.take()` to run it exactly once.
    work: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Task {
    /// Create a new task wrapping the given closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            work: Some(Box::new(f)),
        }
    }

    /// Execute the task's work closure, consuming it.
    ///
    /// Returns `true` if the closure was present and executed, `false` if the
    /// task had already been consumed.
    pub fn run(&mut self) -> bool {
        if let Some(f) = self.work.take() {
            f();
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("has_work", &self.work.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkerHandle (per-thread bookkeeping exposed to the Scheduler)
// ---------------------------------------------------------------------------

/// Per-worker metadata visible to the [`Scheduler`].
///
/// Each OS thread owns a [`Worker`] deque (push/pop from the owning thread)
/// and publishes a [`Stealer`] that peers can use to steal tasks.
struct WorkerHandle {
    /// A stealer handle that other workers can use.
    _stealer: Stealer<Task>,
    /// The join handle for the OS thread.
    join_handle: Option<thread::JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// An M:N work-stealing task scheduler.
///
/// The scheduler owns a pool of worker threads and a global injection queue.
/// Tasks are spawned into the global queue and picked up by workers. This is
/// the "underlying dispatcher" the queue adapter hands ready operations to —
/// it knows nothing about operations, conditions, or dependencies.
pub struct Scheduler {
    /// Global injection queue — new tasks land here.
    global_queue: Arc<Injector<Task>>,
    /// Per-worker metadata (stealers + join handles).
    workers: Vec<WorkerHandle>,
    /// Signal used to request graceful shutdown.
    shutdown: Arc<AtomicBool>,
    /// Number of worker threads.
    worker_count: usize,
    /// Number of tasks that have been completed across all workers.
    completed_count: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Create a new scheduler with `num_workers` OS threads.
    ///
    /// Passing `0` will default to the number of available CPUs.
    pub fn new(num_workers: usize) -> Self {
        let num_workers = if num_workers == 0 {
            num_cpus::get().max(1)
        } else {
            num_workers
        };

        let global_queue = Arc::new(Injector::<Task>::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let completed_count = Arc::new(AtomicUsize::new(0));

        // Phase 1: create all Worker deques and collect stealers.
        let mut local_workers: Vec<Worker<Task>> = Vec::with_capacity(num_workers);
        let mut stealers: Vec<Stealer<Task>> = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = Worker::new_fifo();
            stealers.push(w.stealer());
            local_workers.push(w);
        }

        let stealers = Arc::new(stealers);

        // Phase 2: spawn OS threads.
        let mut handles: Vec<WorkerHandle> = Vec::with_capacity(num_workers);

        for (idx, local) in local_workers.into_iter().enumerate() {
            let global = Arc::clone(&global_queue);
            let shutdown_flag = Arc::clone(&shutdown);
            let peer_stealers = Arc::clone(&stealers);
            let completed = Arc::clone(&completed_count);

            let jh = thread::Builder::new()
                .name(format!("operon-worker-{idx}"))
                .spawn(move || {
                    Self::worker_loop(idx, local, global, peer_stealers, shutdown_flag, completed);
                })
                .expect("failed to spawn worker thread");

            handles.push(WorkerHandle {
                _stealer: stealers[idx].clone(),
                join_handle: Some(jh),
            });
        }

        Self {
            global_queue,
            workers: handles,
            shutdown,
            worker_count: num_workers,
            completed_count,
        }
    }

    /// Return the number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Return the number of tasks completed so far.
    pub fn completed_count(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Spawn a new task onto the global injection queue.
    pub fn spawn(&self, task: Task) {
        self.global_queue.push(task);
    }

    /// Convenience: wrap a closure in a [`Task`] and push it to the global queue.
    pub fn spawn_fn<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.global_queue.push(Task::new(f));
    }

    /// Block until at least `expected` tasks have completed, or `timeout`
    /// elapses.
    ///
    /// Returns the actual completed count at the time the wait ended.
    pub fn wait_for_completion(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let current = self.completed_count.load(Ordering::Acquire);
            if current >= expected {
                return current;
            }
            if std::time::Instant::now() >= deadline {
                return current;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Request a graceful shutdown and wait for all workers to finish.
    ///
    /// Any tasks still in queues when workers notice the shutdown signal will
    /// be abandoned (not executed).
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for w in &mut self.workers {
            if let Some(jh) = w.join_handle.take() {
                let _ = jh.join();
            }
        }
    }

    /// Return `true` if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // -- internal worker loop ---------------------------------------------

    /// Simple deterministic pseudo-random number generator (xorshift32).
    ///
    /// Avoids pulling in the `rand` crate for this single use case. Each
    /// worker has its own state so there is no contention.
    fn xorshift32(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    /// The main loop executed by each worker thread.
    ///
    /// Priority order:
    /// 1. Pop from the local deque (cheapest).
    /// 2. Steal a batch from the global injection queue.
    /// 3. Steal from a random peer worker.
    /// 4. Park briefly (1 ms) to avoid busy-spinning.
    fn worker_loop(
        idx: usize,
        local: Worker<Task>,
        global: Arc<Injector<Task>>,
        stealers: Arc<Vec<Stealer<Task>>>,
        shutdown: Arc<AtomicBool>,
        completed: Arc<AtomicUsize>,
    ) {
        let mut rng_state: u32 = (idx as u32).wrapping_mul(2654435761).max(1);

        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }

            if let Some(mut task) = local.pop() {
                task.run();
                completed.fetch_add(1, Ordering::Release);
                continue;
            }

            match global.steal_batch_and_pop(&local) {
                Steal::Success(mut task) => {
                    task.run();
                    completed.fetch_add(1, Ordering::Release);
                    continue;
                }
                Steal::Retry => {
                    thread::yield_now();
                    continue;
                }
                Steal::Empty => {}
            }

            let num_peers = stealers.len();
            if num_peers > 0 {
                let start = Self::xorshift32(&mut rng_state) as usize % num_peers;
                let mut stolen = false;
                for offset in 0..num_peers {
                    let peer_idx = (start + offset) % num_peers;
                    if peer_idx == idx {
                        continue;
                    }
                    match stealers[peer_idx].steal_batch_and_pop(&local) {
                        Steal::Success(mut task) => {
                            task.run();
                            completed.fetch_add(1, Ordering::Release);
                            stolen = true;
                            break;
                        }
                        Steal::Retry => {}
                        Steal::Empty => {}
                    }
                }
                if stolen {
                    continue;
                }
            }

            // Nothing to do — a production scheduler would park on a condvar
            // here; a short timed park is adequate for this phase.
            thread::park_timeout(Duration::from_millis(1));
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count)
            .field("completed_count", &self.completed_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn scheduler_creates_requested_workers() {
        let mut sched = Scheduler::new(2);
        assert_eq!(sched.worker_count(), 2);
        sched.shutdown();
    }

    #[test]
    fn scheduler_default_workers_nonzero() {
        let mut sched = Scheduler::new(0);
        assert!(sched.worker_count() >= 1);
        sched.shutdown();
    }

    #[test]
    fn scheduler_spawn_and_execute() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut sched = Scheduler::new(2);

        let n = 100;
        for _ in 0..n {
            let ctr = Arc::clone(&counter);
            sched.spawn(Task::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let completed = sched.wait_for_completion(n, Duration::from_secs(5));
        sched.shutdown();
        assert_eq!(completed, n);
        assert_eq!(counter.load(Ordering::Relaxed), n);
    }

    #[test]
    fn scheduler_shutdown_is_idempotent() {
        let mut sched = Scheduler::new(1);
        sched.shutdown();
        assert!(sched.is_shutdown());
        sched.shutdown();
        assert!(sched.is_shutdown());
    }

    #[test]
    fn task_run_consumes_work() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let mut task = Task::new(move || {
            flag2.store(true, Ordering::Relaxed);
        });

        assert!(task.run());
        assert!(flag.load(Ordering::Relaxed));
        assert!(!task.run());
    }

    #[test]
    fn work_stealing_1000_tasks_4_workers() {
        let mut sched = Scheduler::new(4);

        let counter = Arc::new(AtomicUsize::new(0));
        let n = 1_000usize;
        for _ in 0..n {
            let ctr = Arc::clone(&counter);
            sched.spawn_fn(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            });
        }

        let completed = sched.wait_for_completion(n, Duration::from_secs(10));
        sched.shutdown();
        assert_eq!(completed, n);
        assert_eq!(counter.load(Ordering::Relaxed), n);
    }

    #[test]
    fn wait_for_completion_returns_on_timeout() {
        let mut sched = Scheduler::new(1);
        let completed = sched.wait_for_completion(100, Duration::from_millis(50));
        assert_eq!(completed, 0);
        sched.shutdown();
    }
}
