//! Fiber-Local References
//!
//! A `FiberRef<A>` is a reference whose value is private to each fiber, with
//! explicit rules for how values flow between parents and children.
//!
//! # Overview
//!
//! - A forked child starts from `fork(parent_value)`
//! - When a parent joins a child (or calls `inherit_refs`), the parent's value
//!   becomes `join(parent_value, child_value)`
//! - A fiber that never set a reference sees its initial value
//!
//! Typical uses are request-scoped context (trace ids, log annotations) that
//! must follow the logical flow of a computation across forks.
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{Effect, FiberRef, IO};
//!
//! let program: IO<(), usize> = FiberRef::make(0usize).flat_map(|counter| {
//!     let read = counter.get();
//!     counter.update(|n| n + 1).zip_right(read)
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::instr::{with_fiber, Erased, Instr};
use crate::effect::{Data, Effect, UIO};

/// Unique key for a fiber reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FiberRefKey(u64);

impl FiberRefKey {
    fn new() -> Self {
        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type-erased fork/join policy of one reference.
pub(crate) trait RefOps: Send + Sync {
    fn initial(&self) -> Erased;
    fn fork(&self, value: &Erased) -> Erased;
    fn join(&self, parent: &Erased, child: &Erased) -> Erased;
}

#[derive(Clone)]
struct Slot {
    value: Erased,
    ops: Arc<dyn RefOps>,
}

/// The fiber-ref table of one fiber.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    slots: HashMap<FiberRefKey, Slot>,
}

impl FiberRefs {
    fn get(&self, key: FiberRefKey) -> Option<&Erased> {
        self.slots.get(&key).map(|slot| &slot.value)
    }

    fn set(&mut self, key: FiberRefKey, value: Erased, ops: Arc<dyn RefOps>) {
        self.slots.insert(key, Slot { value, ops });
    }

    /// The table a freshly forked child starts from.
    pub(crate) fn fork(&self) -> FiberRefs {
        let slots = self
            .slots
            .iter()
            .map(|(key, slot)| {
                let value = slot.ops.fork(&slot.value);
                (
                    *key,
                    Slot {
                        value,
                        ops: slot.ops.clone(),
                    },
                )
            })
            .collect();
        FiberRefs { slots }
    }

    /// Merge a child's table into this one.
    pub(crate) fn join(&mut self, child: &FiberRefs) {
        for (key, slot) in &child.slots {
            let parent = match self.slots.get(key) {
                Some(own) => own.value.clone(),
                None => slot.ops.initial(),
            };
            let value = slot.ops.join(&parent, &slot.value);
            self.set(*key, value, slot.ops.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRefs")
            .field("len", &self.len())
            .finish()
    }
}

type ForkFn<A> = Arc<dyn Fn(&A) -> A + Send + Sync>;
type JoinFn<A> = Arc<dyn Fn(&A, &A) -> A + Send + Sync>;

struct TypedOps<A> {
    initial: A,
    fork: ForkFn<A>,
    join: JoinFn<A>,
}

impl<A: Data> TypedOps<A> {
    fn typed<'a>(&'a self, value: &'a Erased) -> &'a A {
        value.downcast_ref::<A>().unwrap_or(&self.initial)
    }
}

impl<A: Data> RefOps for TypedOps<A> {
    fn initial(&self) -> Erased {
        Erased::new(self.initial.clone())
    }

    fn fork(&self, value: &Erased) -> Erased {
        Erased::new((self.fork)(self.typed(value)))
    }

    fn join(&self, parent: &Erased, child: &Erased) -> Erased {
        Erased::new((self.join)(self.typed(parent), self.typed(child)))
    }
}

/// A fiber-local reference.
pub struct FiberRef<A> {
    key: FiberRefKey,
    ops: Arc<TypedOps<A>>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            ops: self.ops.clone(),
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FiberRef").field(&self.key.0).finish()
    }
}

impl<A: Data> FiberRef<A> {
    /// A reference that children copy and joins overwrite with the child's
    /// value.
    pub fn make(initial: A) -> UIO<FiberRef<A>> {
        Self::make_with(initial, A::clone, |_, child| child.clone())
    }

    /// A reference with explicit fork and join policies.
    pub fn make_with(
        initial: A,
        fork: impl Fn(&A) -> A + Send + Sync + 'static,
        join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> UIO<FiberRef<A>> {
        let fork: ForkFn<A> = Arc::new(fork);
        let join: JoinFn<A> = Arc::new(join);
        Effect::succeed_with(move || FiberRef {
            key: FiberRefKey::new(),
            ops: Arc::new(TypedOps {
                initial: initial.clone(),
                fork: fork.clone(),
                join: join.clone(),
            }),
        })
    }

    fn erased_ops(&self) -> Arc<dyn RefOps> {
        self.ops.clone()
    }

    /// Atomically read, transform and write the current fiber's value.
    pub fn modify<B: Data>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> UIO<B> {
        let this = self.clone();
        let f = Arc::new(f);
        Effect::from_build(move || {
            let this = this.clone();
            let f = f.clone();
            with_fiber(move |ctx| {
                let mut refs = ctx.fiber_refs();
                let current = refs
                    .get(this.key)
                    .and_then(|v| v.downcast_ref::<A>())
                    .cloned()
                    .unwrap_or_else(|| this.ops.initial.clone());
                let (out, next) = f(current);
                refs.set(this.key, Erased::new(next), this.erased_ops());
                Instr::succeed(out)
            })
        })
    }

    /// The current fiber's value.
    pub fn get(&self) -> UIO<A> {
        self.modify(|a| (a.clone(), a))
    }

    /// Replace the current fiber's value.
    pub fn set(&self, value: A) -> UIO<()> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Transform the current fiber's value.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> UIO<()> {
        self.modify(move |a| ((), f(a)))
    }

    /// Run `effect` with the reference set to `value`, restoring the previous
    /// value afterwards whatever the outcome.
    pub fn locally<R: Data, E: Data, B: Data>(
        &self,
        value: A,
        effect: Effect<R, E, B>,
    ) -> Effect<R, E, B> {
        let set = self.clone();
        let restore = self.clone();
        self.get()
            .lift::<R, E>()
            .zip_left(set.set(value).lift())
            .bracket(
                move |old: A| restore.set(old).widen_env(),
                move |_| effect.clone(),
            )
    }
}
