//! # RefM
//!
//! A shared cell whose updates are effects. Updates are serialized by a
//! one-permit semaphore: an update runs to completion (or failure) before
//! the next one reads the value, and a failed update leaves the value
//! unchanged.

use std::fmt;

use crate::effect::{Data, Effect, UIO};
use crate::reference::Ref;
use crate::semaphore::Semaphore;

/// A cell updated by effects, one update at a time.
pub struct RefM<A> {
    value: Ref<A>,
    lock: Semaphore,
}

impl<A> Clone for RefM<A> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            lock: self.lock.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for RefM<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefM")
            .field("value", &self.value)
            .field("lock", &self.lock)
            .finish()
    }
}

impl<A: Data> RefM<A> {
    /// A cell holding `initial`, outside of any effect.
    pub fn new(initial: A) -> Self {
        Self {
            value: Ref::new(initial),
            lock: Semaphore::new(1),
        }
    }

    /// Create a cell inside an effect.
    pub fn make(initial: A) -> UIO<RefM<A>> {
        Effect::succeed_with(move || RefM::new(initial.clone()))
    }

    /// Read the current value. Waits for a running update to finish.
    pub fn get(&self) -> UIO<A> {
        self.lock.with_permit(self.value.get())
    }

    /// Replace the value.
    pub fn set(&self, value: A) -> UIO<()> {
        self.lock.with_permit(self.value.set(value))
    }

    /// Run `f` on the current value and store the new value it produces.
    pub fn modify<R: Data, E: Data, B: Data>(
        &self,
        f: impl Fn(A) -> Effect<R, E, (B, A)> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        let value = self.value.clone();
        let update = value.get().lift::<R, E>().flat_map(move |current| {
            let value = value.clone();
            f(current).flat_map(move |(b, next)| value.set(next).lift().as_(b.clone()))
        });
        self.lock.with_permit(update)
    }

    /// Update the value with an effect.
    pub fn update<R: Data, E: Data>(
        &self,
        f: impl Fn(A) -> Effect<R, E, A> + Send + Sync + 'static,
    ) -> Effect<R, E, ()> {
        self.modify(move |a| f(a).map(|next| ((), next)))
    }

    /// Update and return the new value.
    pub fn update_and_get<R: Data, E: Data>(
        &self,
        f: impl Fn(A) -> Effect<R, E, A> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        self.modify(move |a| f(a).map(|next: A| (next.clone(), next)))
    }

    /// Update and return the old value.
    pub fn get_and_update<R: Data, E: Data>(
        &self,
        f: impl Fn(A) -> Effect<R, E, A> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        self.modify(move |a: A| f(a.clone()).map(move |next| (a.clone(), next)))
    }

    /// Replace the value, returning the old one.
    pub fn get_and_set(&self, value: A) -> UIO<A> {
        self.modify(move |old| Effect::succeed((old, value.clone())))
    }

    /// Like `modify`, for a partial function: when `pf` returns `None` the
    /// value is kept and `default` is returned.
    pub fn modify_some<R: Data, E: Data, B: Data>(
        &self,
        default: B,
        pf: impl Fn(&A) -> Option<Effect<R, E, (B, A)>> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        self.modify(move |a| match pf(&a) {
            Some(effect) => effect,
            None => Effect::succeed((default.clone(), a)),
        })
    }

    /// Like `update`, for a partial function.
    pub fn update_some<R: Data, E: Data>(
        &self,
        pf: impl Fn(&A) -> Option<Effect<R, E, A>> + Send + Sync + 'static,
    ) -> Effect<R, E, ()> {
        self.modify(move |a| match pf(&a) {
            Some(effect) => effect.map(|next| ((), next)),
            None => Effect::succeed(((), a)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use crate::IO;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked()).unwrap()
    }

    #[test]
    fn test_effectful_updates_are_serialized() {
        let rt = runtime();
        let cell = RefM::new(Vec::<u32>::new());
        let writer = cell.clone();
        let effect: UIO<()> = Effect::foreach_par_(0..20u32, move |n| {
            writer.update(move |seen: Vec<u32>| {
                UIO::<()>::sleep(Duration::from_millis(1)).map(move |_| {
                    let mut seen = seen.clone();
                    seen.push(n);
                    seen
                })
            })
        });
        rt.run_sync(effect).unwrap();
        let mut seen = rt.run_sync(cell.get()).unwrap();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_update_keeps_value() {
        let rt = runtime();
        let cell = RefM::new(10);
        let effect = cell.update(|_| IO::<&str, i32>::fail("rejected"));
        assert_eq!(rt.run_sync_exit(effect), Exit::fail("rejected"));
        assert_eq!(rt.run_sync(cell.get()).unwrap(), 10);
    }

    #[test]
    fn test_modify_variants() {
        let rt = runtime();
        let cell = RefM::new(2);
        let effect = cell
            .update_and_get(|n| UIO::succeed(n * 5))
            .zip(cell.get_and_update(|n| UIO::succeed(n + 1)))
            .zip(cell.get_and_set(100))
            .zip(cell.modify_some("skipped", |n| {
                (*n < 0).then(|| UIO::succeed(("negative", 0)))
            }))
            .zip(cell.get());
        assert_eq!(
            rt.run_sync(effect).unwrap(),
            ((((10, 10), 11), "skipped"), 100)
        );
    }

    #[test]
    fn test_update_some() {
        let rt = runtime();
        let cell = RefM::new(3);
        let effect = cell
            .update_some(|n| (*n > 1).then(|| UIO::succeed(n - 1)))
            .zip_right(cell.update_some(|n| (*n > 5).then(|| UIO::succeed(0))))
            .zip_right(cell.get());
        assert_eq!(rt.run_sync(effect).unwrap(), 2);
    }
}
