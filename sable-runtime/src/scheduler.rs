//! # Work-Stealing Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - Multiple worker threads each with a local FIFO deque
//! - Global injector for tasks submitted from outside the pool
//! - Work-stealing for load balancing
//! - Idle workers park on a condition variable instead of spinning
//!
//! A task is one slice of a fiber's execution: the interpreter runs until
//! the fiber suspends, finishes or spends its budget, then returns the
//! worker. Blocked fibers are not in any queue.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::panic::payload_message;
use crate::runtime::RuntimeError;

/// One slice of work.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// How long an idle worker sleeps before re-checking the queues.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// The local deque of the worker running on this thread, tagged with the
    /// id of the scheduler it belongs to.
    static LOCAL: RefCell<Option<(usize, Deque<Task>)>> = const { RefCell::new(None) };
}

struct Shared {
    id: usize,
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    shutdown: AtomicBool,
    sleepers: Mutex<usize>,
    wakeup: Condvar,
    active_workers: AtomicUsize,
}

impl Shared {
    /// Find work using work-stealing.
    fn find_work(&self, local: &Deque<Task>) -> Option<Task> {
        // 1. Try local queue first
        if let Some(task) = local.pop() {
            return Some(task);
        }

        // 2. Try global queue
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Try stealing from other workers
        for stealer in &self.stealers {
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn has_queued_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn notify_one(&self) {
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wakeup.notify_one();
        }
    }

    fn park(&self) {
        let mut sleepers = self.sleepers.lock();
        if self.shutdown.load(Ordering::Acquire) || self.has_queued_work() {
            return;
        }
        *sleepers += 1;
        self.wakeup.wait_for(&mut sleepers, PARK_TIMEOUT);
        *sleepers -= 1;
    }
}

/// Work-stealing scheduler running fiber slices.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl Scheduler {
    /// Create the scheduler and start its worker threads.
    pub fn new(config: &SchedulerConfig) -> Result<Self, RuntimeError> {
        let num_workers = config.num_workers.max(1);
        let deques: Vec<Deque<Task>> = (0..num_workers).map(|_| Deque::new_fifo()).collect();
        let stealers = deques.iter().map(Deque::stealer).collect();

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            sleepers: Mutex::new(0),
            wakeup: Condvar::new(),
            active_workers: AtomicUsize::new(0),
        });

        let scheduler = Scheduler {
            shared: shared.clone(),
            threads: Mutex::new(Vec::with_capacity(num_workers)),
            num_workers,
        };

        for (index, deque) in deques.into_iter().enumerate() {
            let name = format!("sable-worker-{}", index);
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(worker_shared, deque))
                .map_err(|source| RuntimeError::Spawn { name, source })?;
            scheduler.threads.lock().push(handle);
        }

        tracing::debug!(workers = num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of worker threads currently running their loop.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Queue a task. From a worker of this scheduler the task goes to that
    /// worker's local deque, otherwise to the global injector.
    pub(crate) fn submit(&self, task: Task) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let id = self.shared.id;
        let rejected = LOCAL.with(|local| match &*local.borrow() {
            Some((owner, deque)) if *owner == id => {
                deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = rejected {
            self.shared.injector.push(task);
        }
        self.shared.notify_one();
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers, join them and drop any queued tasks.
    ///
    /// Called from one of this scheduler's own workers, that worker is not
    /// joined; it exits after its current task.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _sleepers = self.shared.sleepers.lock();
            self.shared.wakeup.notify_all();
        }

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => drop(task),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        tracing::debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the worker loop.
fn run_worker(shared: Arc<Shared>, deque: Deque<Task>) {
    shared.active_workers.fetch_add(1, Ordering::AcqRel);
    LOCAL.with(|local| *local.borrow_mut() = Some((shared.id, deque)));

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let task = LOCAL.with(|local| match &*local.borrow() {
            Some((_, deque)) => shared.find_work(deque),
            None => None,
        });

        match task {
            Some(task) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    tracing::error!(
                        "scheduler task panicked: {}",
                        payload_message(payload.as_ref())
                    );
                }
            }
            None => shared.park(),
        }
    }

    // Queued slices die with the pool.
    LOCAL.with(|local| local.borrow_mut().take());
    shared.active_workers.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn config(num_workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            num_workers,
            ..Default::default()
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(&config(2)).unwrap();
        assert_eq!(scheduler.num_workers(), 2);
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
        assert_eq!(scheduler.active_workers(), 0);
    }

    #[test]
    fn test_task_execution() {
        let scheduler = Scheduler::new(&config(1)).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        scheduler.submit(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(7));
    }

    #[test]
    fn test_work_stealing() {
        let counter = Arc::new(AtomicI32::new(0));
        let scheduler = Scheduler::new(&config(4)).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        for _ in 0..100 {
            let c = counter.clone();
            let tx = tx.clone();
            scheduler.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }

        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_nested_submit_runs() {
        let scheduler = Arc::new(Scheduler::new(&config(2)).unwrap());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = scheduler.clone();
        scheduler.submit(Box::new(move || {
            inner.submit(Box::new(move || {
                let _ = tx.send("nested");
            }));
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("nested"));
        scheduler.shutdown();
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let scheduler = Scheduler::new(&config(1)).unwrap();
        scheduler.submit(Box::new(|| panic!("task failure")));
        let (tx, rx) = crossbeam_channel::bounded(1);
        scheduler.submit(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_submit_after_shutdown_is_dropped() {
        let scheduler = Scheduler::new(&config(1)).unwrap();
        scheduler.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        scheduler.submit(Box::new(move || flag.store(true, Ordering::SeqCst)));
        thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
