//! # Clock
//!
//! The time service behind `Effect::sleep` and `Effect::current_time`.
//!
//! ## Design
//!
//! - `Live`: one timer thread per runtime with a deadline heap; sleeping
//!   fibers never occupy a worker
//! - `Test`: time only moves when `TestClock::adjust` is called, and every
//!   sleep due by then fires in deadline order
//!
//! Timer callbacks only resume fibers, so they run on the timer thread (or
//! the adjusting thread) with no locks held.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

use crate::panic::catch_panic;
use crate::runtime::RuntimeError;

/// A callback fired when a sleep is due.
pub(crate) type TimerTask = Box<dyn FnOnce() + Send>;

fn run_task(task: TimerTask) {
    if let Err(defect) = catch_panic(task) {
        tracing::error!("timer callback panicked: {}", defect);
    }
}

/// The runtime's time service.
#[derive(Clone)]
pub enum Clock {
    /// Wall-clock time driven by a timer thread.
    Live(LiveClock),
    /// Manually advanced time.
    Test(TestClock),
}

impl Clock {
    /// Run `task` after `delay`; returns a key for `cancel`.
    pub(crate) fn schedule(&self, delay: Duration, task: TimerTask) -> u64 {
        match self {
            Clock::Live(clock) => clock.schedule(delay, task),
            Clock::Test(clock) => clock.schedule(delay, task),
        }
    }

    /// Drop a scheduled task that has not fired yet.
    pub(crate) fn cancel(&self, key: u64) -> bool {
        match self {
            Clock::Live(clock) => clock.cancel(key),
            Clock::Test(clock) => clock.cancel(key),
        }
    }

    /// Current time as a duration since the Unix epoch (live) or since the
    /// clock was created (test).
    pub fn current_time(&self) -> Duration {
        match self {
            Clock::Live(_) => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO),
            Clock::Test(clock) => clock.now(),
        }
    }

    /// Stop the timer thread; pending sleeps are dropped.
    pub(crate) fn shutdown(&self) {
        if let Clock::Live(clock) = self {
            clock.shutdown();
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clock::Live(_) => f.write_str("Clock::Live"),
            Clock::Test(clock) => write!(f, "Clock::Test({:?})", clock.now()),
        }
    }
}

// ============================================================================
// Live clock
// ============================================================================

struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, TimerTask>,
    next_key: u64,
    shutdown: bool,
}

struct LiveInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A clock backed by a dedicated timer thread.
#[derive(Clone)]
pub struct LiveClock {
    inner: Arc<LiveInner>,
}

impl LiveClock {
    /// Start the timer thread.
    pub(crate) fn start() -> Result<Self, RuntimeError> {
        let inner = Arc::new(LiveInner {
            state: Mutex::new(TimerState {
                deadlines: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_key: 1,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            thread: Mutex::new(None),
        });

        let name = "sable-timer".to_string();
        let timer = inner.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_timer(timer))
            .map_err(|source| RuntimeError::Spawn { name, source })?;
        *inner.thread.lock() = Some(handle);

        tracing::debug!("timer thread started");
        Ok(Self { inner })
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> u64 {
        let mut state = self.inner.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if state.shutdown {
            return key;
        }
        state.deadlines.push(Reverse((Instant::now() + delay, key)));
        state.tasks.insert(key, task);
        drop(state);
        self.inner.wakeup.notify_one();
        key
    }

    fn cancel(&self, key: u64) -> bool {
        // The heap entry is skipped when it surfaces.
        self.inner.state.lock().tasks.remove(&key).is_some()
    }

    /// Number of sleeps waiting to fire.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.tasks.clear();
            state.deadlines.clear();
        }
        self.inner.wakeup.notify_all();

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        tracing::debug!("timer thread stopped");
    }
}

fn run_timer(inner: Arc<LiveInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let next = state.deadlines.peek().map(|Reverse(entry)| *entry);
        match next {
            None => inner.wakeup.wait(&mut state),
            Some((deadline, key)) => {
                if deadline > Instant::now() {
                    inner.wakeup.wait_until(&mut state, deadline);
                    continue;
                }
                state.deadlines.pop();
                if let Some(task) = state.tasks.remove(&key) {
                    drop(state);
                    run_task(task);
                    state = inner.state.lock();
                }
            }
        }
    }
}

// ============================================================================
// Test clock
// ============================================================================

struct TestState {
    now: Duration,
    sleeps: BTreeMap<(Duration, u64), TimerTask>,
}

static NEXT_TEST_KEY: AtomicU64 = AtomicU64::new(1);

/// A clock whose time only moves when told to.
///
/// ```rust,ignore
/// let clock = runtime.test_clock().unwrap();
/// let fiber = runtime.fork_detached(Effect::sleep(Duration::from_secs(60)));
/// clock.adjust(Duration::from_secs(60));
/// ```
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestState>>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    /// A clock at time zero.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TestState {
                now: Duration::ZERO,
                sleeps: BTreeMap::new(),
            })),
        }
    }

    /// The current manual time.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of sleeps waiting for time to pass.
    pub fn pending_sleeps(&self) -> usize {
        self.state.lock().sleeps.len()
    }

    /// Move time forward by `by`, firing every sleep that becomes due.
    pub fn adjust(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;
            let later = state.sleeps.split_off(&(now, u64::MAX));
            std::mem::replace(&mut state.sleeps, later)
        };
        for (_, task) in due {
            run_task(task);
        }
    }

    /// Set the time to `to`, firing every sleep due by then. Time never
    /// moves backwards.
    pub fn set_time(&self, to: Duration) {
        let now = self.now();
        if to > now {
            self.adjust(to - now);
        }
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> u64 {
        let key = NEXT_TEST_KEY.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if delay.is_zero() {
            drop(state);
            run_task(task);
            return key;
        }
        let deadline = state.now + delay;
        state.sleeps.insert((deadline, key), task);
        key
    }

    fn cancel(&self, key: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.sleeps.len();
        state.sleeps.retain(|(_, k), _| *k != key);
        state.sleeps.len() != before
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestClock")
            .field("now", &state.now)
            .field("pending", &state.sleeps.len())
            .finish()
    }
}
