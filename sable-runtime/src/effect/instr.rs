//! The effect IR.
//!
//! `Instr` is the one-shot node the interpreter consumes. Typed `Effect`
//! descriptions produce fresh `Instr` trees each time they run, so nothing in
//! here is ever shared or mutated after construction. Values cross the
//! untyped boundary as `Erased` and are downcast back by the typed layer.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::effect::Data;
use crate::exit::Exit;
use crate::fiber::{Descriptor, FiberId, ForkScope, InterruptStatus};
use crate::interpreter::{FiberContext, Resumer};

// ============================================================================
// Erased values
// ============================================================================

trait AnyData: Any + Send + Sync {
    fn clone_boxed(&self) -> Box<dyn AnyData>;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Data> AnyData for T {
    fn clone_boxed(&self) -> Box<dyn AnyData> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// A type-erased, cloneable value flowing through the interpreter.
pub(crate) struct Erased(Box<dyn AnyData>);

impl Erased {
    pub(crate) fn new<T: Data>(value: T) -> Self {
        Erased(Box::new(value))
    }

    pub(crate) fn unit() -> Self {
        Erased::new(())
    }

    /// Recover the concrete value, handing the erased value back on mismatch.
    pub(crate) fn downcast<T: Data>(self) -> Result<T, Erased> {
        if !self.0.as_any().is::<T>() {
            return Err(self);
        }
        self.0
            .into_any()
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| Erased::unit())
    }

    pub(crate) fn downcast_ref<T: Data>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.0.type_name()
    }
}

impl Clone for Erased {
    fn clone(&self) -> Self {
        Erased(self.0.clone_boxed())
    }
}

impl fmt::Debug for Erased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0.type_name())
    }
}

/// The environment a fiber reads from.
pub(crate) type Env = Arc<dyn Any + Send + Sync>;

pub(crate) type ErasedExit = Exit<Erased, Erased>;

pub(crate) type Cont = Box<dyn FnOnce(Erased) -> Instr + Send>;
pub(crate) type FailCont = Box<dyn FnOnce(Cause<Erased>) -> Instr + Send>;
/// Handles a decided race: the winner's exit, the still-running loser and the
/// interruptibility of the racing region.
pub(crate) type RaceCont =
    Box<dyn FnOnce(ErasedExit, Arc<FiberContext>, InterruptStatus) -> Instr + Send>;
pub(crate) type Build = Arc<dyn Fn() -> Instr + Send + Sync>;
pub(crate) type Register = Box<dyn FnOnce(Resumer) -> Option<Instr> + Send>;

// ============================================================================
// Instructions
// ============================================================================

/// One node of a suspended computation.
pub(crate) enum Instr {
    /// A pure value.
    Succeed(Erased),
    /// A failure with its full cause.
    Fail(Cause<Erased>),
    /// A side effect that cannot fail (panics become defects).
    EffectTotal(Box<dyn FnOnce() -> Erased + Send>),
    /// A side effect returning a typed error.
    EffectPartial(Box<dyn FnOnce() -> Result<Erased, Erased> + Send>),
    /// Build the next node lazily; keeps construction O(1) per step.
    Suspend(Build),
    /// Run the inner node, then feed its value to the continuation.
    FlatMap(Box<Instr>, Cont),
    /// Run the inner node, then branch on its cause or value.
    Fold(Box<Instr>, FailCont, Cont),
    /// Suspend the fiber until the resumer is invoked.
    Async(Register, Vec<FiberId>),
    /// Start a child fiber, producing its context.
    Fork(Box<Instr>, Option<ForkScope>),
    /// Read the current environment.
    Read(Box<dyn FnOnce(&Env) -> Instr + Send>),
    /// Run the inner node with a different environment.
    Provide(Env, Box<Instr>),
    /// Run the inner node with the given interruptibility.
    InterruptStatus(Box<Instr>, InterruptStatus),
    /// Observe the current interruptibility.
    CheckInterrupt(Box<dyn FnOnce(InterruptStatus) -> Instr + Send>),
    /// Observe the running fiber.
    Descriptor(Box<dyn FnOnce(Descriptor) -> Instr + Send>),
    /// Run two children and let the first to finish decide. The handler
    /// runs uninterruptibly and owns the loser.
    RaceWith {
        left: Box<Instr>,
        right: Box<Instr>,
        on_left: RaceCont,
        on_right: RaceCont,
        scope: Option<ForkScope>,
    },
    /// Give up the worker thread.
    Yield,
    /// Access the running fiber's context (fiber refs, platform, scope).
    WithFiber(Box<dyn FnOnce(&Arc<FiberContext>) -> Instr + Send>),
}

impl Instr {
    pub(crate) fn unit() -> Instr {
        Instr::Succeed(Erased::unit())
    }

    pub(crate) fn succeed<T: Data>(value: T) -> Instr {
        Instr::Succeed(Erased::new(value))
    }

    pub(crate) fn die(defect: Defect) -> Instr {
        Instr::Fail(Cause::die(defect))
    }

    pub(crate) fn done(exit: ErasedExit) -> Instr {
        match exit {
            Exit::Success(value) => Instr::Succeed(value),
            Exit::Failure(cause) => Instr::Fail(cause),
        }
    }

    pub(crate) fn total(f: impl FnOnce() -> Erased + Send + 'static) -> Instr {
        Instr::EffectTotal(Box::new(f))
    }

    pub(crate) fn flat_map(self, k: impl FnOnce(Erased) -> Instr + Send + 'static) -> Instr {
        Instr::FlatMap(Box::new(self), Box::new(k))
    }

    pub(crate) fn with_status(self, status: InterruptStatus) -> Instr {
        Instr::InterruptStatus(Box::new(self), status)
    }
}

/// Continue with access to the running fiber.
pub(crate) fn with_fiber(f: impl FnOnce(&Arc<FiberContext>) -> Instr + Send + 'static) -> Instr {
    Instr::WithFiber(Box::new(f))
}

/// Continue with the current environment.
pub(crate) fn read_env(f: impl FnOnce(&Env) -> Instr + Send + 'static) -> Instr {
    Instr::Read(Box::new(f))
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Instr::Succeed(_) => "Succeed",
            Instr::Fail(_) => "Fail",
            Instr::EffectTotal(_) => "EffectTotal",
            Instr::EffectPartial(_) => "EffectPartial",
            Instr::Suspend(_) => "Suspend",
            Instr::FlatMap(..) => "FlatMap",
            Instr::Fold(..) => "Fold",
            Instr::Async(..) => "Async",
            Instr::Fork(..) => "Fork",
            Instr::Read(_) => "Read",
            Instr::Provide(..) => "Provide",
            Instr::InterruptStatus(..) => "InterruptStatus",
            Instr::CheckInterrupt(_) => "CheckInterrupt",
            Instr::Descriptor(_) => "Descriptor",
            Instr::RaceWith { .. } => "RaceWith",
            Instr::Yield => "Yield",
            Instr::WithFiber(_) => "WithFiber",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Typed boundary
// ============================================================================

pub(crate) fn mismatch<T>(found: &str) -> Defect {
    Defect::new(format!(
        "effect value type mismatch: expected {}, found {}",
        type_name::<T>(),
        found
    ))
}

/// Downcast `value` and continue with `f`; a mismatch becomes a defect.
pub(crate) fn with_value<T: Data>(value: Erased, f: impl FnOnce(T) -> Instr) -> Instr {
    match value.downcast::<T>() {
        Ok(v) => f(v),
        Err(other) => Instr::die(mismatch::<T>(other.type_name())),
    }
}

pub(crate) fn erase_cause<E: Data>(cause: Cause<E>) -> Cause<Erased> {
    cause.map(Erased::new)
}

pub(crate) fn restore_cause<E: Data>(cause: Cause<Erased>) -> Cause<E> {
    cause.flat_map(&mut |e: Erased| match e.downcast::<E>() {
        Ok(e) => Cause::Fail(e),
        Err(other) => Cause::die(mismatch::<E>(other.type_name())),
    })
}

pub(crate) fn erase_exit<E: Data, A: Data>(exit: Exit<E, A>) -> ErasedExit {
    match exit {
        Exit::Success(a) => Exit::Success(Erased::new(a)),
        Exit::Failure(cause) => Exit::Failure(erase_cause(cause)),
    }
}

pub(crate) fn restore_exit<E: Data, A: Data>(exit: ErasedExit) -> Exit<E, A> {
    match exit {
        Exit::Success(value) => match value.downcast::<A>() {
            Ok(a) => Exit::Success(a),
            Err(other) => Exit::Failure(Cause::die(mismatch::<A>(other.type_name()))),
        },
        Exit::Failure(cause) => Exit::Failure(restore_cause(cause)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erased_roundtrip_and_mismatch() {
        let value = Erased::new(42u32);
        let copy = value.clone();
        assert_eq!(value.downcast::<u32>().ok(), Some(42));
        let back = copy.downcast::<String>().unwrap_err();
        assert!(back.type_name().contains("u32"));
    }

    #[test]
    fn test_with_value_mismatch_is_defect() {
        let instr = with_value(Erased::new("text"), |n: i64| Instr::succeed(n));
        match instr {
            Instr::Fail(cause) => {
                assert!(cause.died());
                assert!(cause.defects()[0].message().contains("i64"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_restore_cause_keeps_shape() {
        let cause = Cause::then(Cause::fail(Erased::new(7i32)), Cause::die_message("x"));
        let typed: Cause<i32> = restore_cause(cause);
        assert_eq!(typed.failures(), vec![7]);
        assert!(typed.died());
    }
}
