//! # Semaphore
//!
//! A counting semaphore for fibers.
//!
//! ## Design
//!
//! - `Available(n)` while nobody waits, `Waiting(queue)` otherwise
//! - Waiters are served FIFO; a waiter needing more permits than are
//!   released is partially satisfied in place and stays at the front
//! - Acquisition is a two-step `Acquisition`: an uninterruptible
//!   reservation, then an interruptible wait. Its `release` returns exactly
//!   the permits held at that moment, so an interrupted waiter gives back
//!   what it was already granted
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{Semaphore, UIO};
//!
//! let guarded = Semaphore::make(2).flat_map(|sem| sem.with_permit(work()));
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Data, Effect, Never, UIO};
use crate::exit::Exit;
use crate::managed::{Managed, Reservation};
use crate::promise::Promise;

struct Waiter {
    id: u64,
    promise: Promise<Never, ()>,
    needed: usize,
}

enum State {
    Available(usize),
    /// Never empty.
    Waiting(VecDeque<Waiter>),
}

struct Inner {
    state: State,
    next_id: u64,
}

/// A reserved (possibly not yet granted) set of permits.
#[derive(Clone)]
struct Acquisition {
    wait: UIO<()>,
    release: UIO<()>,
}

/// A counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        match &inner.state {
            State::Available(n) => f.debug_struct("Semaphore").field("available", n).finish(),
            State::Waiting(queue) => f
                .debug_struct("Semaphore")
                .field("waiters", &queue.len())
                .finish(),
        }
    }
}

impl Semaphore {
    /// A semaphore with `permits` permits, outside of any effect.
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Available(permits),
                next_id: 0,
            })),
        }
    }

    /// Create a semaphore inside an effect.
    pub fn make(permits: usize) -> UIO<Semaphore> {
        Effect::succeed_with(move || Semaphore::new(permits))
    }

    /// Permits free right now; zero while fibers are waiting.
    pub fn available(&self) -> UIO<usize> {
        let this = self.clone();
        Effect::succeed_with(move || this.available_now())
    }

    fn available_now(&self) -> usize {
        match &self.inner.lock().state {
            State::Available(n) => *n,
            State::Waiting(_) => 0,
        }
    }

    /// Run `effect` holding one permit.
    pub fn with_permit<R: Data, E: Data, A: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        self.with_permits(1, effect)
    }

    /// Run `effect` holding `n` permits. The permits are returned on every
    /// exit path, including interruption while waiting for them.
    pub fn with_permits<R: Data, E: Data, A: Data>(
        &self,
        n: usize,
        effect: Effect<R, E, A>,
    ) -> Effect<R, E, A> {
        self.prepare(n).lift::<R, E>().bracket(
            |acquisition: Acquisition| acquisition.release.widen_env(),
            move |acquisition: Acquisition| acquisition.wait.lift().zip_right(effect.clone()),
        )
    }

    /// A managed permit, held for the lifetime of the managed scope.
    pub fn with_permit_managed<R: Data, E: Data>(&self) -> Managed<R, E, ()> {
        self.with_permits_managed(1)
    }

    /// `n` managed permits.
    pub fn with_permits_managed<R: Data, E: Data>(&self, n: usize) -> Managed<R, E, ()> {
        let reservation = self.prepare(n).lift::<R, E>().map(|acquisition: Acquisition| {
            let release = acquisition.release.clone();
            Reservation::new(acquisition.wait.lift(), move |_| release.clone().widen_env())
        });
        Managed::reserve(reservation)
    }

    fn prepare(&self, n: usize) -> UIO<Acquisition> {
        let this = self.clone();
        Effect::succeed_with(move || this.acquire_now(n))
    }

    fn acquire_now(&self, n: usize) -> Acquisition {
        if n == 0 {
            return Acquisition {
                wait: Effect::unit(),
                release: Effect::unit(),
            };
        }
        let mut inner = self.inner.lock();
        if let State::Available(free) = &mut inner.state {
            if *free >= n {
                *free -= n;
                drop(inner);
                return Acquisition {
                    wait: Effect::unit(),
                    release: self.release(n),
                };
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let promise = Promise::new();
        let waiter = Waiter {
            id,
            promise: promise.clone(),
            needed: n,
        };
        inner.state = match std::mem::replace(&mut inner.state, State::Available(0)) {
            State::Available(free) => State::Waiting(VecDeque::from([Waiter {
                needed: n - free,
                ..waiter
            }])),
            State::Waiting(mut queue) => {
                queue.push_back(waiter);
                State::Waiting(queue)
            }
        };
        drop(inner);

        Acquisition {
            wait: promise.await_(),
            release: self.restore(id, n),
        }
    }

    /// Give back whatever waiter `id` holds: everything if it was served,
    /// otherwise the part granted so far.
    fn restore(&self, id: u64, n: usize) -> UIO<()> {
        let this = self.clone();
        Effect::succeed_with(move || {
            let held = {
                let mut inner = this.inner.lock();
                match &mut inner.state {
                    State::Waiting(queue) => match queue.iter().position(|w| w.id == id) {
                        Some(index) => {
                            let granted = queue
                                .remove(index)
                                .map_or(0, |waiter| n - waiter.needed);
                            if queue.is_empty() {
                                inner.state = State::Available(0);
                            }
                            granted
                        }
                        None => n,
                    },
                    State::Available(_) => n,
                }
            };
            this.release_now(held);
        })
    }

    fn release(&self, n: usize) -> UIO<()> {
        let this = self.clone();
        Effect::succeed_with(move || this.release_now(n))
    }

    fn release_now(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut woken = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut left = n;
            loop {
                match &mut inner.state {
                    State::Available(free) => {
                        *free += left;
                        break;
                    }
                    State::Waiting(queue) => {
                        let Some(front) = queue.front_mut() else {
                            inner.state = State::Available(left);
                            break;
                        };
                        if front.needed > left {
                            front.needed -= left;
                            break;
                        }
                        left -= front.needed;
                        if let Some(waiter) = queue.pop_front() {
                            woken.push(waiter.promise);
                        }
                        if queue.is_empty() {
                            inner.state = State::Available(left);
                            break;
                        }
                    }
                }
            }
        }
        for promise in woken {
            promise.try_complete(Exit::succeed(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked()).unwrap()
    }

    #[test]
    fn test_permits_are_returned() {
        let rt = runtime();
        let sem = Semaphore::new(3);
        let inside = sem.available();
        let effect = sem.with_permits(2, inside).zip(sem.available());
        assert_eq!(rt.run_sync(effect).unwrap(), (1, 3));
    }

    #[test]
    fn test_permits_returned_on_failure() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let effect = sem.with_permit(crate::IO::<&str, ()>::fail("inner"));
        assert_eq!(rt.run_sync_exit(effect), Exit::fail("inner"));
        assert_eq!(sem.available_now(), 1);
    }

    #[test]
    fn test_mutual_exclusion() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let shared = Arc::new(AtomicUsize::new(0));
        let counter = shared.clone();
        // A non-atomic read-modify-write with a yield in the middle.
        let increment = move || {
            let (read, write) = (counter.clone(), counter.clone());
            UIO::succeed_with(move || read.load(Ordering::SeqCst)).flat_map(move |n| {
                let write = write.clone();
                UIO::<()>::yield_now()
                    .zip_right(UIO::succeed_with(move || write.store(n + 1, Ordering::SeqCst)))
            })
        };
        let effect: UIO<()> = Effect::foreach_par_(0..8, move |_: i32| {
            let sem = sem.clone();
            let increment = increment.clone();
            UIO::<()>::foreach_(0..50, move |_: i32| sem.with_permit(increment()))
        });
        rt.run_sync(effect).unwrap();
        assert_eq!(shared.load(Ordering::SeqCst), 400);
    }

    #[test]
    fn test_waiter_is_partially_satisfied() {
        let rt = runtime();
        let sem = Semaphore::new(2);
        let hold = sem.prepare(2);
        let first = rt.run_sync(hold).unwrap();
        let second = rt.run_sync(sem.prepare(3)).unwrap();
        rt.run_sync(first.release.clone()).unwrap();
        // Two of the three permits are granted; the waiter still needs one.
        assert_eq!(sem.available_now(), 0);
        // Giving up returns the two granted permits.
        rt.run_sync(second.release.clone()).unwrap();
        assert_eq!(sem.available_now(), 2);
    }

    #[test]
    fn test_release_wakes_every_waiter() {
        let rt = runtime();
        let sem = Semaphore::new(0);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut fibers = Vec::new();
        for tag in 0..3 {
            let order = order.clone();
            let acquisition = rt.run_sync(sem.prepare(1)).unwrap();
            let fiber = rt.fork_detached(acquisition.wait.zip_right(UIO::succeed_with(move || {
                order.lock().push(tag)
            })));
            fibers.push(fiber);
        }
        rt.run_sync(sem.release(3)).unwrap();
        for fiber in fibers {
            rt.run_sync(fiber.join()).unwrap();
        }
        let mut seen = order.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(sem.available_now(), 0);
    }

    #[test]
    fn test_interrupted_waiter_frees_its_place() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let started = Promise::<Never, ()>::new();
        let holder = sem.with_permit(started.succeed(()).zip_right(UIO::<()>::never()));
        let blocked = sem.with_permit(UIO::succeed(()));
        let effect = holder
            .fork()
            .zip_left(started.await_())
            .flat_map(move |holding| {
                let blocked = blocked.clone();
                blocked.fork().flat_map(move |waiting| {
                    let holding = holding.clone();
                    UIO::<()>::sleep(Duration::from_millis(10))
                        .zip_right(waiting.interrupt())
                        .zip_right(holding.interrupt())
                })
            });
        assert!(rt.run_sync(effect).unwrap().is_interrupted());
        assert_eq!(sem.available_now(), 1);
    }

    #[test]
    fn test_managed_permit() {
        let rt = runtime();
        let sem = Semaphore::new(2);
        let inside = sem.available();
        let effect = sem
            .with_permits_managed::<(), Never>(2)
            .use_(move |_| inside.clone())
            .zip(sem.available());
        assert_eq!(rt.run_sync(effect).unwrap(), (0, 2));
    }
}
