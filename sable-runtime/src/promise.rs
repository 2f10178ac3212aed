//! # Promise
//!
//! A single-assignment cell that fibers can wait on. Every blocking
//! primitive in the runtime (semaphores, queues, parallel joins) parks its
//! fibers on a promise.
//!
//! ## Design
//!
//! - `Pending` holds the waiters keyed by registration, so an interrupted
//!   waiter can remove itself
//! - The first completion wins; later ones return `false`
//! - Waiters are called after the lock is released

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{AsyncCallback, Data, Effect, Never, Registered, IO, UIO};
use crate::exit::Exit;
use crate::fiber::FiberId;

type Waiter<E, A> = Box<dyn FnOnce(&Exit<E, A>) + Send>;

enum State<E, A> {
    Pending {
        waiters: BTreeMap<u64, Waiter<E, A>>,
        next: u64,
    },
    Done(Exit<E, A>),
}

/// A cell completed at most once with an `Exit<E, A>`.
pub struct Promise<E, A> {
    state: Arc<Mutex<State<E, A>>>,
}

impl<E, A> Clone for Promise<E, A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<E: Data, A: Data> fmt::Debug for Promise<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.state.lock(), State::Done(_));
        f.debug_struct("Promise")
            .field("done", &done)
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

impl<E: Data, A: Data> Default for Promise<E, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Data, A: Data> Promise<E, A> {
    /// A fresh, pending promise.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending {
                waiters: BTreeMap::new(),
                next: 0,
            })),
        }
    }

    /// Create a promise inside an effect.
    pub fn make() -> UIO<Promise<E, A>> {
        Effect::succeed_with(Promise::new)
    }

    /// Suspend until the promise is completed, then replay its exit.
    /// Interrupting the waiter unregisters it.
    pub fn await_(&self) -> IO<E, A> {
        let this = self.clone();
        Effect::effect_async_interrupt(move |cb: AsyncCallback<(), E, A>| {
            let mut state = this.state.lock();
            match &mut *state {
                State::Done(exit) => Registered::Ready(Effect::done(exit.clone())),
                State::Pending { waiters, next } => {
                    let key = *next;
                    *next += 1;
                    waiters.insert(key, Box::new(move |exit: &Exit<E, A>| cb.done(exit.clone())));
                    let this = this.clone();
                    Registered::Pending(Effect::succeed_with(move || this.remove_waiter(key)))
                }
            }
        })
    }

    fn remove_waiter(&self, key: u64) {
        if let State::Pending { waiters, .. } = &mut *self.state.lock() {
            waiters.remove(&key);
        }
    }

    /// Complete the promise outside of any effect. Returns false if it was
    /// already completed.
    pub fn try_complete(&self, exit: Exit<E, A>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Done(exit.clone());
                    waiters
                }
            }
        };
        for (_, waiter) in waiters {
            waiter(&exit);
        }
        true
    }

    /// Complete with `exit`.
    pub fn done(&self, exit: Exit<E, A>) -> UIO<bool> {
        let this = self.clone();
        Effect::succeed_with(move || this.try_complete(exit.clone()))
    }

    /// Complete with a value.
    pub fn succeed(&self, value: A) -> UIO<bool> {
        self.done(Exit::succeed(value))
    }

    /// Complete with a typed failure.
    pub fn fail(&self, error: E) -> UIO<bool> {
        self.done(Exit::fail(error))
    }

    /// Complete with a defect.
    pub fn die(&self, defect: Defect) -> UIO<bool> {
        self.done(Exit::die(defect))
    }

    /// Complete with a whole cause.
    pub fn halt(&self, cause: Cause<E>) -> UIO<bool> {
        self.done(Exit::halt(cause))
    }

    /// Complete with an interruption by the calling fiber.
    pub fn interrupt(&self) -> UIO<bool> {
        let this = self.clone();
        Effect::<(), Never, FiberId>::fiber_id().flat_map(move |id| this.interrupt_as(id))
    }

    /// Complete with an interruption by `id`.
    pub fn interrupt_as(&self, id: FiberId) -> UIO<bool> {
        self.done(Exit::interrupt(id))
    }

    /// Run `effect` and complete the promise with its exit. The completion
    /// happens even if the calling fiber is interrupted after `effect` ends.
    pub fn complete<R: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, Never, bool> {
        let this = self.clone();
        Effect::uninterruptible_mask(move |restore| {
            let this = this.clone();
            restore
                .restore(effect.clone())
                .to_exit()
                .flat_map(move |exit| this.done(exit).widen_env())
        })
    }

    /// The exit, if completed.
    pub fn poll(&self) -> UIO<Option<Exit<E, A>>> {
        let this = self.clone();
        Effect::succeed_with(move || this.poll_now())
    }

    /// The exit, if completed, outside of any effect.
    pub fn poll_now(&self) -> Option<Exit<E, A>> {
        match &*self.state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Whether the promise has been completed.
    pub fn is_done(&self) -> UIO<bool> {
        let this = self.clone();
        Effect::succeed_with(move || this.poll_now().is_some())
    }

    pub(crate) fn waiter_count(&self) -> usize {
        match &*self.state.lock() {
            State::Pending { waiters, .. } => waiters.len(),
            State::Done(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    #[test]
    fn test_single_assignment() {
        let promise = Promise::<String, i32>::new();
        assert!(promise.try_complete(Exit::succeed(1)));
        assert!(!promise.try_complete(Exit::succeed(2)));
        assert!(!promise.try_complete(Exit::fail("late".into())));
        assert_eq!(promise.poll_now(), Some(Exit::succeed(1)));
    }

    #[test]
    fn test_await_after_completion() {
        let rt = runtime();
        let promise = Promise::<String, i32>::new();
        let effect = promise.succeed(5).lift().zip_right(promise.await_());
        assert_eq!(rt.run_sync(effect).unwrap(), 5);
    }

    #[test]
    fn test_waiters_are_woken() {
        let rt = runtime();
        let promise = Promise::<String, i32>::new();
        let waiters: Vec<_> = (0..3).map(|_| rt.fork_detached(promise.await_())).collect();
        while promise.waiter_count() < 3 {
            std::thread::yield_now();
        }
        assert!(promise.try_complete(Exit::fail("gone".into())));
        for fiber in waiters {
            assert_eq!(rt.run_sync_exit(fiber.join()), Exit::fail("gone".to_string()));
        }
    }

    #[test]
    fn test_interrupted_waiter_is_removed() {
        let rt = runtime();
        let promise = Promise::<Never, ()>::new();
        let fiber = rt.fork_detached(promise.await_());
        while promise.waiter_count() == 0 {
            std::thread::yield_now();
        }
        let exit = rt.run_sync(fiber.interrupt()).unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(promise.waiter_count(), 0);
    }

    #[test]
    fn test_debug_shows_state() {
        let promise = Promise::<Never, u8>::new();
        assert_eq!(format!("{:?}", promise), "Promise { done: false, waiters: 0 }");
        promise.try_complete(Exit::succeed(1));
        assert_eq!(format!("{:?}", promise), "Promise { done: true, waiters: 0 }");
    }

    #[test]
    fn test_complete_with_effect() {
        let rt = runtime();
        let promise = Promise::<&str, u32>::new();
        let effect = promise.complete(IO::<&str, u32>::fail("nope"));
        assert!(rt.run_sync(effect).unwrap());
        assert_eq!(promise.poll_now(), Some(Exit::fail("nope")));
    }

    #[test]
    fn test_interrupt_completes_with_caller_id() {
        let rt = runtime();
        let promise = Promise::<Never, ()>::new();
        let effect = promise
            .interrupt()
            .zip_right(Effect::<(), Never, FiberId>::fiber_id());
        let id = rt.run_sync(effect).unwrap();
        assert_eq!(promise.poll_now(), Some(Exit::interrupt(id)));
    }

    #[test]
    fn test_await_times_out() {
        let rt = runtime();
        let promise = Promise::<Never, u8>::new();
        let effect = promise.await_().timeout(Duration::from_millis(20));
        assert_eq!(rt.run_sync(effect).unwrap(), None);
        assert_eq!(promise.waiter_count(), 0);
    }
}
