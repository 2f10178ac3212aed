//! # Fibers
//!
//! Lightweight, cooperatively-scheduled units of execution running an effect.
//!
//! ## Design
//!
//! - A `Fiber<E, A>` is a typed handle onto a running `FiberContext`
//! - Fibers never hold a worker thread while blocked; they suspend and are
//!   resumed by callback
//! - Every fiber belongs to a scope: its parent (the default), the global
//!   scope (daemons), or another fiber chosen with `fork_in`
//!
//! ## Technical References
//!
//! - [ZIO Fiber](https://zio.dev/reference/fiber/)
//! - [Tokio Scheduler Design](https://tokio.rs/blog/2019-10-scheduler)

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::effect::instr::{restore_exit, with_fiber, with_value, ErasedExit, Instr};
use crate::effect::{Data, Effect, UIO, IO};
use crate::exit::Exit;
use crate::interpreter::FiberContext;

// ============================================================================
// FiberId
// ============================================================================

/// Unique identifier for a fiber.
///
/// Ordered by sequence number; the start time only disambiguates ids across
/// process restarts in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId {
    seq: u64,
    start_time_millis: u64,
}

/// Global fiber ID counter. Zero is reserved for `FiberId::none()`.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Build an id from its parts.
    pub fn from_parts(seq: u64, start_time_millis: u64) -> Self {
        Self {
            seq,
            start_time_millis,
        }
    }

    /// The id used for interruptions that come from outside any fiber.
    pub fn none() -> Self {
        Self::from_parts(0, 0)
    }

    /// Allocate a fresh id.
    pub(crate) fn next() -> Self {
        let seq = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::from_parts(seq, start_time_millis)
    }

    /// The sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock start time in milliseconds since the epoch.
    pub fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber(#{})", self.seq)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Whether a region of an effect may be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptStatus {
    /// Interruption is observed at the next interruption point.
    #[default]
    Interruptible,
    /// Interruption is deferred until the region ends.
    Uninterruptible,
}

impl InterruptStatus {
    /// Convert from a flag.
    pub fn from_bool(interruptible: bool) -> Self {
        if interruptible {
            InterruptStatus::Interruptible
        } else {
            InterruptStatus::Uninterruptible
        }
    }

    /// True for `Interruptible`.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, InterruptStatus::Interruptible)
    }
}

/// Execution status of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing (or queued to execute) on a worker.
    Running {
        /// True while the fiber is unwinding because of an interruption.
        interrupting: bool,
    },
    /// Waiting for an async callback.
    Suspended {
        /// Whether an interruption would wake it.
        interruptible: bool,
        /// The suspension this status refers to.
        epoch: u64,
        /// Fibers this one is waiting on, if known.
        blocking_on: Vec<FiberId>,
    },
    /// Finished.
    Done,
}

impl FiberStatus {
    /// True for `Done`.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }
}

// ============================================================================
// Scopes
// ============================================================================

/// The scope owned by a running fiber; children forked into it are
/// interrupted when that fiber ends.
#[derive(Clone)]
pub struct FiberScope {
    pub(crate) owner: Weak<FiberContext>,
    pub(crate) id: FiberId,
}

impl FiberScope {
    /// The fiber owning this scope.
    pub fn fiber_id(&self) -> FiberId {
        self.id
    }

    /// True once the owner has finished.
    pub fn is_closed(&self) -> bool {
        self.owner
            .upgrade()
            .map_or(true, |owner| owner.poll_exit().is_some())
    }
}

impl fmt::Debug for FiberScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberScope({})", self.id)
    }
}

/// Where a forked fiber is supervised.
#[derive(Debug, Clone)]
pub enum ForkScope {
    /// No supervisor; the fiber outlives its creator.
    Global,
    /// Supervised by the given fiber.
    Fiber(FiberScope),
}

/// A snapshot of the running fiber.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// The fiber's id.
    pub id: FiberId,
    /// Its status when the snapshot was taken.
    pub status: FiberStatus,
    /// Fibers that have requested its interruption.
    pub interruptors: BTreeSet<FiberId>,
    /// Interruptibility of the current region.
    pub interrupt_status: InterruptStatus,
    /// The scope children forked by this fiber join.
    pub scope: FiberScope,
}

// ============================================================================
// Fiber handle
// ============================================================================

/// A handle to a running fiber producing `A` or failing with `E`.
pub struct Fiber<E, A> {
    ctx: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.ctx.id()).finish()
    }
}

impl<E: Data, A: Data> Fiber<E, A> {
    pub(crate) fn new(ctx: Arc<FiberContext>) -> Self {
        Self {
            ctx,
            _marker: PhantomData,
        }
    }

    pub(crate) fn context(&self) -> &Arc<FiberContext> {
        &self.ctx
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.ctx.id()
    }

    /// The scope this fiber owns, for use with `fork_in`.
    pub fn scope(&self) -> ForkScope {
        ForkScope::Fiber(self.ctx.scope())
    }

    /// Suspend until the fiber finishes and return its exit.
    pub fn await_exit(&self) -> UIO<Exit<E, A>> {
        let ctx = self.ctx.clone();
        Effect::from_build(move || {
            ctx.await_instr().flat_map(|v| {
                with_value(v, |exit: ErasedExit| Instr::succeed(restore_exit::<E, A>(exit)))
            })
        })
    }

    /// Suspend until the fiber finishes, inherit its fiber refs, and return
    /// its value or re-raise its failure.
    pub fn join(&self) -> IO<E, A> {
        let ctx = self.ctx.clone();
        Effect::from_build(move || {
            let child = ctx.clone();
            ctx.await_instr().flat_map(move |v| {
                with_value(v, move |exit: ErasedExit| {
                    with_fiber(move |me| {
                        me.inherit_refs(&child);
                        Instr::done(exit)
                    })
                })
            })
        })
    }

    /// Interrupt the fiber as the calling fiber and wait for it to finish.
    pub fn interrupt(&self) -> UIO<Exit<E, A>> {
        let ctx = self.ctx.clone();
        Effect::from_build(move || {
            let ctx = ctx.clone();
            with_fiber(move |me| {
                ctx.kill(me.id());
                ctx.await_instr()
            })
            .flat_map(|v| {
                with_value(v, |exit: ErasedExit| Instr::succeed(restore_exit::<E, A>(exit)))
            })
        })
    }

    /// Interrupt the fiber as `id` and wait for it to finish.
    pub fn interrupt_as(&self, id: FiberId) -> UIO<Exit<E, A>> {
        let ctx = self.ctx.clone();
        Effect::from_build(move || {
            ctx.kill(id);
            ctx.await_instr().flat_map(|v| {
                with_value(v, |exit: ErasedExit| Instr::succeed(restore_exit::<E, A>(exit)))
            })
        })
    }

    /// Request interruption without waiting for it to take effect.
    pub fn interrupt_fork(&self) -> UIO<()> {
        let ctx = self.ctx.clone();
        Effect::from_build(move || {
            let ctx = ctx.clone();
            with_fiber(move |me| {
                ctx.kill(me.id());
                Instr::unit()
            })
        })
    }

    /// The exit, if the fiber has finished.
    pub fn poll(&self) -> UIO<Option<Exit<E, A>>> {
        let fiber = self.clone();
        Effect::succeed_with(move || fiber.poll_now())
    }

    /// The exit, if the fiber has finished, outside of any effect.
    pub fn poll_now(&self) -> Option<Exit<E, A>> {
        self.ctx.poll_exit().map(restore_exit::<E, A>)
    }

    /// Merge the fiber's fiber-ref values into the calling fiber.
    pub fn inherit_refs(&self) -> UIO<()> {
        let ctx = self.ctx.clone();
        Effect::from_build(move || {
            let child = ctx.clone();
            with_fiber(move |me| {
                me.inherit_refs(&child);
                Instr::unit()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ids_are_unique_and_ordered() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert_ne!(a, b);
        assert!(a < b);
        assert!(FiberId::none() < a);
    }

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId::from_parts(42, 7).to_string(), "Fiber(#42)");
    }

    #[test]
    fn test_interrupt_status_roundtrip() {
        assert!(InterruptStatus::from_bool(true).is_interruptible());
        assert!(!InterruptStatus::from_bool(false).is_interruptible());
        assert_eq!(InterruptStatus::default(), InterruptStatus::Interruptible);
    }

    #[test]
    fn test_dangling_scope_is_closed() {
        let scope = FiberScope {
            owner: Weak::new(),
            id: FiberId::none(),
        };
        assert!(scope.is_closed());
        assert_eq!(scope.fiber_id(), FiberId::none());
    }
}
