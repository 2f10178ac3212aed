//! # Effects
//!
//! `Effect<R, E, A>` describes a computation that reads an environment `R`,
//! may fail with `E` and produces `A`. Building an effect runs nothing: the
//! description is handed to a `Runtime`, which interprets it on a fiber.
//!
//! ## Design
//!
//! - Descriptions are immutable and re-runnable; every run builds fresh IR
//!   nodes (see `instr`)
//! - Combinators take closures that may be called once per run, so they are
//!   `Fn + Send + Sync`
//! - Failures carry a full `Cause`: typed failures, defects and interruptions
//!   flow through the same channel and only `fold_cause_m`-style combinators
//!   see all of them
//!
//! ## Example
//!
//! ```rust,ignore
//! use sable_runtime::{Effect, Runtime, IO};
//!
//! let program: IO<String, u32> = Effect::succeed(20)
//!     .flat_map(|n| Effect::succeed(n + 1))
//!     .map(|n| n * 2);
//! assert_eq!(Runtime::new(Default::default())?.run_sync(program)?, 42);
//! ```

pub(crate) mod instr;

mod concurrent;
mod interrupt;
mod ops;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::{Descriptor, FiberId, ForkScope, InterruptStatus};

use instr::{erase_cause, erase_exit, mismatch, read_env, with_fiber, Build, Erased, Instr};

pub use concurrent::Either;
pub use interrupt::{AsyncCallback, InterruptStatusRestore, Registered};

/// Values that can flow through effects: cloneable and shareable across
/// worker threads.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// The error type of effects that cannot fail.
pub type Never = Infallible;

/// A lazy, re-runnable description of a computation.
pub struct Effect<R, E, A> {
    build: Build,
    _marker: PhantomData<fn(R) -> Result<A, E>>,
}

/// An effect that needs no environment.
pub type IO<E, A> = Effect<(), E, A>;

/// An effect that needs no environment and cannot fail.
pub type UIO<A> = Effect<(), Never, A>;

/// An effect that cannot fail.
pub type URIO<R, A> = Effect<R, Never, A>;

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            build: self.build.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Effect<{}, {}, {}>",
            std::any::type_name::<R>(),
            std::any::type_name::<E>(),
            std::any::type_name::<A>()
        )
    }
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_build(build: impl Fn() -> Instr + Send + Sync + 'static) -> Self {
        Self {
            build: Arc::new(build),
            _marker: PhantomData,
        }
    }

    /// The IR node the interpreter steps into.
    pub(crate) fn instr(&self) -> Instr {
        Instr::Suspend(self.build.clone())
    }

    fn retype<R2, E2, A2>(self) -> Effect<R2, E2, A2> {
        Effect {
            build: self.build,
            _marker: PhantomData,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    /// An effect producing `value`.
    pub fn succeed(value: A) -> Self {
        Effect::from_build(move || Instr::succeed(value.clone()))
    }

    /// An effect running a side effect that cannot fail. A panic inside `f`
    /// becomes a defect.
    pub fn succeed_with(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            Instr::total(move || Erased::new(f()))
        })
    }

    /// An effect running a side effect that may fail with `E`.
    pub fn attempt(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            Instr::EffectPartial(Box::new(move || {
                f().map(Erased::new).map_err(Erased::new)
            }))
        })
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self {
        Effect::from_build(move || Instr::Fail(Cause::fail(Erased::new(error.clone()))))
    }

    /// An effect that dies with `defect`.
    pub fn die(defect: Defect) -> Self {
        Effect::from_build(move || Instr::die(defect.clone()))
    }

    /// An effect that dies with a defect carrying `message`.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// An effect that fails with the whole `cause`.
    pub fn halt(cause: Cause<E>) -> Self {
        Effect::from_build(move || Instr::Fail(erase_cause(cause.clone())))
    }

    /// An effect replaying `exit`.
    pub fn done(exit: Exit<E, A>) -> Self {
        Effect::from_build(move || Instr::done(erase_exit(exit.clone())))
    }

    /// An effect replaying `result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        Self::done(result.into())
    }

    /// Build the effect lazily, once per run.
    pub fn suspend(f: impl Fn() -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Effect::from_build(move || f().instr())
    }

    /// An effect that never completes. It can still be interrupted.
    pub fn never() -> Self {
        Effect::from_build(|| Instr::Async(Box::new(|_| None), Vec::new()))
    }

    /// Interrupt the running fiber as itself.
    pub fn interrupt() -> Self {
        Effect::from_build(|| with_fiber(|ctx| Instr::Fail(Cause::interrupt(ctx.id()))))
    }

    /// Fail with an interruption attributed to `id`.
    pub fn interrupt_as(id: FiberId) -> Self {
        Effect::from_build(move || Instr::Fail(Cause::interrupt(id)))
    }

    /// Read a value out of the environment.
    pub fn access(f: impl Fn(&R) -> A + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            read_env(move |env| match (**env).downcast_ref::<R>() {
                Some(r) => Instr::succeed(f(r)),
                None => Instr::die(mismatch::<R>("a different environment")),
            })
        })
    }

    /// Continue with an effect chosen from the environment.
    pub fn access_m(f: impl Fn(&R) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            read_env(move |env| match (**env).downcast_ref::<R>() {
                Some(r) => f(r).instr(),
                None => Instr::die(mismatch::<R>("a different environment")),
            })
        })
    }
}

impl<R: Data, E: Data> Effect<R, E, ()> {
    /// An effect producing `()`.
    pub fn unit() -> Self {
        Effect::from_build(Instr::unit)
    }

    /// Give up the worker so other fibers can run.
    pub fn yield_now() -> Self {
        Effect::from_build(|| Instr::Yield)
    }
}

impl<R: Data, E: Data> Effect<R, E, R> {
    /// The whole environment.
    pub fn environment() -> Self {
        Effect::access(R::clone)
    }
}

impl<R: Data, E: Data> Effect<R, E, FiberId> {
    /// The running fiber's id.
    pub fn fiber_id() -> Self {
        Effect::from_build(|| with_fiber(|ctx| Instr::succeed(ctx.id())))
    }
}

impl<R: Data, E: Data> Effect<R, E, Descriptor> {
    /// A snapshot of the running fiber.
    pub fn descriptor() -> Self {
        Effect::from_build(|| Instr::Descriptor(Box::new(|d| Instr::succeed(d))))
    }
}

impl<R: Data, E: Data> Effect<R, E, ForkScope> {
    /// The scope the running fiber's children join; hand it to `fork_in` to
    /// supervise a fiber from elsewhere.
    pub fn fork_scope() -> Self {
        Effect::from_build(|| with_fiber(|ctx| Instr::succeed(ForkScope::Fiber(ctx.scope()))))
    }
}

impl<R: Data, E: Data> Effect<R, E, InterruptStatus> {
    /// The interruptibility of the current region.
    pub fn check_interruptible() -> Self {
        Effect::from_build(|| Instr::CheckInterrupt(Box::new(|s| Instr::succeed(s))))
    }
}

// ============================================================================
// Widening
// ============================================================================

impl<R: Data, A: Data> Effect<R, Never, A> {
    /// View an infallible effect as one failing with any `E2`.
    pub fn widen_err<E2: Data>(self) -> Effect<R, E2, A> {
        self.retype()
    }
}

impl<E: Data, A: Data> Effect<(), E, A> {
    /// Run an environment-free effect inside any environment.
    pub fn widen_env<R2: Data>(self) -> Effect<R2, E, A> {
        self.provide_all(())
    }
}

impl<A: Data> Effect<(), Never, A> {
    /// Widen both the environment and the error type.
    pub fn lift<R2: Data, E2: Data>(self) -> Effect<R2, E2, A> {
        self.widen_err::<E2>().widen_env::<R2>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    #[test]
    fn test_succeed_and_fail() {
        let rt = runtime();
        assert_eq!(rt.run_sync(IO::<String, i32>::succeed(5)).unwrap(), 5);
        let exit = rt.run_sync_exit(IO::<String, i32>::fail("no".into()));
        assert_eq!(exit, Exit::fail("no".to_string()));
    }

    #[test]
    fn test_effects_are_rerunnable() {
        let rt = runtime();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let effect: UIO<usize> =
            Effect::succeed_with(move || c.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1);
        assert_eq!(rt.run_sync(effect.clone()).unwrap(), 1);
        assert_eq!(rt.run_sync(effect).unwrap(), 2);
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let effect: UIO<i32> = Effect::succeed_with(|| panic!("kaboom"));
        let exit = rt.run_sync_exit(effect);
        let cause = exit.cause().unwrap();
        assert!(cause.died());
        assert_eq!(cause.defects()[0].message(), "kaboom");
    }

    #[test]
    fn test_attempt() {
        let rt = runtime();
        let ok: IO<String, u8> = Effect::attempt(|| "7".parse::<u8>().map_err(|e| e.to_string()));
        let bad: IO<String, u8> = Effect::attempt(|| "x".parse::<u8>().map_err(|e| e.to_string()));
        assert_eq!(rt.run_sync(ok).unwrap(), 7);
        assert!(rt.run_sync_exit(bad).cause().unwrap().failed());
    }

    #[test]
    fn test_access_and_provide() {
        let rt = runtime();
        let read: Effect<String, Never, usize> = Effect::access(|s: &String| s.len());
        assert_eq!(rt.run_sync(read.provide_all("hello".to_string())).unwrap(), 5);
    }

    #[test]
    fn test_fiber_id_and_descriptor() {
        let rt = runtime();
        let effect: UIO<(FiberId, Descriptor)> = Effect::fiber_id().zip(Effect::descriptor());
        let (id, descriptor) = rt.run_sync(effect).unwrap();
        assert_eq!(id, descriptor.id);
        assert!(descriptor.interrupt_status.is_interruptible());
    }

    #[test]
    fn test_interrupt_self() {
        let rt = runtime();
        let exit = rt.run_sync_exit(UIO::<()>::interrupt());
        assert!(exit.is_interrupted());
    }
}
