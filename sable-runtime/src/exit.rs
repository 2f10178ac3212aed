//! Terminal results of effects and fibers.
//!
//! An `Exit<E, A>` is either the value an effect produced or the full
//! `Cause` of its failure. `ScopeExit` is the payload-free form handed to
//! finalizers, which only need the shape of how their scope ended.

use std::fmt;

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// How an effect ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed.
    Failure(Cause<E>),
}

/// The exit handed to finalizers: the scope's outcome without its payloads.
pub type ScopeExit = Exit<(), ()>;

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// A failure with the given cause.
    pub fn halt(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// An interruption by `id`.
    pub fn interrupt(id: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(id))
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for `Failure`.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// True when the failure cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.interrupted(),
        }
    }

    /// The value, if successful.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The cause, if failed.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Chain another exit off the value.
    pub fn flat_map<B>(self, f: impl FnOnce(A) -> Exit<E, B>) -> Exit<E, B> {
        match self {
            Exit::Success(a) => f(a),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Fold both cases into one value.
    pub fn fold<Z>(self, on_failure: impl FnOnce(Cause<E>) -> Z, on_success: impl FnOnce(A) -> Z) -> Z {
        match self {
            Exit::Success(a) => on_success(a),
            Exit::Failure(cause) => on_failure(cause),
        }
    }

    /// Combine two exits, merging failure causes with `combine`.
    pub fn zip_with<B, C>(
        self,
        that: Exit<E, B>,
        f: impl FnOnce(A, B) -> C,
        combine: impl FnOnce(Cause<E>, Cause<E>) -> Cause<E>,
    ) -> Exit<E, C> {
        match (self, that) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success(f(a, b)),
            (Exit::Failure(l), Exit::Failure(r)) => Exit::Failure(combine(l, r)),
            (Exit::Failure(l), Exit::Success(_)) => Exit::Failure(l),
            (Exit::Success(_), Exit::Failure(r)) => Exit::Failure(r),
        }
    }

    /// Sequential zip: failures combine with `Then`.
    pub fn zip<B>(self, that: Exit<E, B>) -> Exit<E, (A, B)> {
        self.zip_with(that, |a, b| (a, b), Cause::then)
    }

    /// Parallel zip: failures combine with `Both`.
    pub fn zip_par<B>(self, that: Exit<E, B>) -> Exit<E, (A, B)> {
        self.zip_with(that, |a, b| (a, b), Cause::both)
    }

    /// Collect exits in order, combining failures with `Then`.
    pub fn collect_all(exits: impl IntoIterator<Item = Exit<E, A>>) -> Exit<E, Vec<A>> {
        collect(exits, Cause::then)
    }

    /// Collect exits in order, combining failures with `Both`.
    pub fn collect_all_par(exits: impl IntoIterator<Item = Exit<E, A>>) -> Exit<E, Vec<A>> {
        collect(exits, Cause::both)
    }

    /// Convert to a `Result` keeping the whole cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }

    /// The payload-free form handed to finalizers.
    pub fn as_scope_exit(&self) -> ScopeExit {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(cause) => Exit::Failure(cause.as_unit()),
        }
    }
}

impl<E: Clone, A> Exit<E, A> {
    /// Transform the typed failures.
    pub fn map_err<E2>(self, f: impl FnMut(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }
}

fn collect<E, A>(
    exits: impl IntoIterator<Item = Exit<E, A>>,
    combine: fn(Cause<E>, Cause<E>) -> Cause<E>,
) -> Exit<E, Vec<A>> {
    let mut values = Vec::new();
    let mut failure: Option<Cause<E>> = None;
    for exit in exits {
        match exit {
            Exit::Success(a) if failure.is_none() => values.push(a),
            Exit::Success(_) => {}
            Exit::Failure(cause) => {
                failure = Some(match failure.take() {
                    Some(acc) => combine(acc, cause),
                    None => cause,
                });
            }
        }
    }
    match failure {
        Some(cause) => Exit::Failure(cause),
        None => Exit::Success(values),
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

// ============================================================================
// FiberFailure
// ============================================================================

/// A failed effect surfaced to non-effect code.
#[derive(Clone, PartialEq)]
pub struct FiberFailure<E> {
    cause: Cause<E>,
}

impl<E> FiberFailure<E> {
    /// Wrap a cause.
    pub fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }

    /// The cause of the failure.
    pub fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Take the cause out.
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }
}

impl<E: fmt::Debug> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberFailure").field("cause", &self.cause).finish()
    }
}

impl<E: fmt::Debug> fmt::Display for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber failed:\n{}", self.cause.pretty())
    }
}

impl<E: fmt::Debug> std::error::Error for FiberFailure<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_merges_causes() {
        let a: Exit<&str, i32> = Exit::fail("a");
        let b: Exit<&str, i32> = Exit::fail("b");
        let seq = a.clone().zip(b.clone());
        let par = a.zip_par(b);
        assert_eq!(seq, Exit::Failure(Cause::then(Cause::fail("a"), Cause::fail("b"))));
        assert_eq!(par, Exit::Failure(Cause::both(Cause::fail("b"), Cause::fail("a"))));
    }

    #[test]
    fn test_collect_all_keeps_order() {
        let exits: Vec<Exit<(), i32>> = vec![Exit::succeed(1), Exit::succeed(2), Exit::succeed(3)];
        assert_eq!(Exit::collect_all(exits), Exit::Success(vec![1, 2, 3]));
    }

    #[test]
    fn test_collect_all_par_merges_every_failure() {
        let exits: Vec<Exit<i32, ()>> = vec![Exit::fail(1), Exit::succeed(()), Exit::fail(2)];
        let exit = Exit::collect_all_par(exits);
        assert_eq!(exit.cause().unwrap().failures().len(), 2);
    }

    #[test]
    fn test_scope_exit_keeps_shape() {
        let exit: Exit<String, i32> = Exit::halt(Cause::both(
            Cause::fail("x".to_string()),
            Cause::interrupt(FiberId::from_parts(3, 0)),
        ));
        let scope = exit.as_scope_exit();
        assert!(scope.is_interrupted());
        assert_eq!(scope.cause().unwrap().failures(), vec![()]);
    }

    #[test]
    fn test_fiber_failure_display() {
        let failure = FiberFailure::new(Cause::fail("bad input"));
        let text = failure.to_string();
        assert!(text.contains("fiber failed"));
        assert!(text.contains("bad input"));
    }
}
