//! # Ref
//!
//! A mutable cell shared between fibers. Every operation runs its pure
//! update function under one lock, so updates are atomic with respect to
//! each other.
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{Ref, UIO};
//!
//! let program = Ref::make(0).flat_map(|counter| {
//!     counter.update(|n| n + 1).zip_right(counter.get())
//! });
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Data, Effect, UIO};

/// An atomically updated shared cell.
pub struct Ref<A> {
    value: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.value.lock()).finish()
    }
}

impl<A: Data> Ref<A> {
    /// A cell holding `initial`, outside of any effect.
    pub fn new(initial: A) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    /// Create a cell inside an effect.
    pub fn make(initial: A) -> UIO<Ref<A>> {
        Effect::succeed_with(move || Ref::new(initial.clone()))
    }

    /// Read the current value.
    pub fn get(&self) -> UIO<A> {
        let this = self.clone();
        Effect::succeed_with(move || this.value.lock().clone())
    }

    /// Replace the value.
    pub fn set(&self, value: A) -> UIO<()> {
        let this = self.clone();
        Effect::succeed_with(move || *this.value.lock() = value.clone())
    }

    /// Atomically compute a result and a new value from the current one.
    pub fn modify<B: Data>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> UIO<B> {
        let this = self.clone();
        Effect::succeed_with(move || {
            let mut value = this.value.lock();
            let (b, next) = f(value.clone());
            *value = next;
            b
        })
    }

    /// Atomically update the value.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<()> {
        self.modify(move |a| ((), f(a)))
    }

    /// Update and return the new value.
    pub fn update_and_get(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<A> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Replace the value, returning the old one.
    pub fn get_and_set(&self, value: A) -> UIO<A> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Update and return the old value.
    pub fn get_and_update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<A> {
        self.modify(move |old| {
            let next = f(old.clone());
            (old, next)
        })
    }

    /// Like `modify`, for a partial function: when `pf` returns `None` the
    /// value is kept and `default` is returned.
    pub fn modify_some<B: Data>(
        &self,
        default: B,
        pf: impl Fn(&A) -> Option<(B, A)> + Send + Sync + 'static,
    ) -> UIO<B> {
        self.modify(move |a| match pf(&a) {
            Some(result) => result,
            None => (default.clone(), a),
        })
    }

    /// Like `update`, for a partial function.
    pub fn update_some(&self, pf: impl Fn(&A) -> Option<A> + Send + Sync + 'static) -> UIO<()> {
        self.modify(move |a| ((), pf(&a).unwrap_or(a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked()).unwrap()
    }

    #[test]
    fn test_get_set_and_swaps() {
        let rt = runtime();
        let cell = Ref::new(1);
        let effect = cell
            .set(2)
            .zip_right(cell.get_and_set(3))
            .zip(cell.update_and_get(|n| n * 10))
            .zip(cell.get_and_update(|n| n + 1))
            .zip(cell.get());
        assert_eq!(rt.run_sync(effect).unwrap(), (((2, 30), 30), 31));
    }

    #[test]
    fn test_modify_some_keeps_value_on_none() {
        let rt = runtime();
        let cell = Ref::new(5);
        let missed = cell.modify_some("miss", |n| (*n > 10).then_some(("hit", 0)));
        let hit = cell.modify_some("miss", |n| (*n == 5).then_some(("hit", 6)));
        let effect = missed.zip(hit).zip(cell.get());
        assert_eq!(rt.run_sync(effect).unwrap(), (("miss", "hit"), 6));

        let effect = cell.update_some(|n| (*n % 2 == 1).then_some(n + 1)).zip_right(cell.get());
        assert_eq!(rt.run_sync(effect).unwrap(), 6);
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        let rt = runtime();
        let cell = Ref::new(0u64);
        let counter = cell.clone();
        let effect: UIO<()> = Effect::foreach_par_(0..100, move |_: i32| {
            let counter = counter.clone();
            UIO::<()>::foreach_(0..100, move |_: i32| counter.update(|n| n + 1))
        });
        rt.run_sync(effect).unwrap();
        assert_eq!(rt.run_sync(cell.get()).unwrap(), 10_000);
    }
}
