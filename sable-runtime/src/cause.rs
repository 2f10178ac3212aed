//! # Failure Causes
//!
//! A `Cause<E>` records every reason a fiber ended abnormally, without ever
//! throwing information away.
//!
//! ## Design
//!
//! - `Fail` carries a typed, recoverable error
//! - `Die` carries a defect (a panic or an explicit `die`)
//! - `Interrupt` names the fiber that requested cancellation
//! - `Then` composes causes that happened one after the other
//! - `Both` composes causes raised by concurrent branches
//!
//! `Empty` is the identity of `Then` and `Both`; both are associative and
//! `Both` is commutative. Equality honours those laws: two causes are equal
//! when they flatten to the same sequence of parallel steps, each step
//! compared as a multiset of leaves.
//!
//! Cloning, dropping, comparing and rendering walk the tree with an explicit
//! stack, so arbitrarily deep chains are safe.
//!
//! ## Technical References
//!
//! - [ZIO Cause](https://zio.dev/reference/core/cause/)

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

// ============================================================================
// Defect
// ============================================================================

/// An unexpected failure, such as a panic in user code.
///
/// Defects are cheap to clone; the message and backtrace are shared.
#[derive(Clone)]
pub struct Defect {
    inner: Arc<DefectInner>,
}

struct DefectInner {
    message: String,
    location: Option<String>,
    backtrace: Option<String>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_details(message, None, None)
    }

    /// Create a defect with an optional source location and backtrace.
    pub fn with_details(
        message: impl Into<String>,
        location: Option<String>,
        backtrace: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DefectInner {
                message: message.into(),
                location,
                backtrace,
            }),
        }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Where the defect was raised, as `file:line:column`, if known.
    pub fn location(&self) -> Option<&str> {
        self.inner.location.as_deref()
    }

    /// The captured backtrace, if backtraces were enabled.
    pub fn backtrace(&self) -> Option<&str> {
        self.inner.backtrace.as_deref()
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defect")
            .field("message", &self.inner.message)
            .field("location", &self.inner.location)
            .finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.location {
            Some(loc) => write!(f, "{} (at {})", self.inner.message, loc),
            None => write!(f, "{}", self.inner.message),
        }
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.message == other.inner.message
    }
}

impl Eq for Defect {}

// ============================================================================
// Cause
// ============================================================================

/// The full reason an effect failed.
pub enum Cause<E> {
    /// No failure at all.
    Empty,
    /// A typed, recoverable failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E: Clone> Clone for Cause<E> {
    fn clone(&self) -> Self {
        self.fold(
            Cause::empty,
            |e| Cause::Fail(e.clone()),
            |d| Cause::Die(d.clone()),
            Cause::Interrupt,
            |l, r| Cause::Then(Box::new(l), Box::new(r)),
            |l, r| Cause::Both(Box::new(l), Box::new(r)),
        )
    }
}

impl<E> Drop for Cause<E> {
    fn drop(&mut self) {
        fn detach<E>(cause: &mut Cause<E>, pending: &mut Vec<Cause<E>>) {
            if let Cause::Then(left, right) | Cause::Both(left, right) = cause {
                pending.push(std::mem::take(&mut **left));
                pending.push(std::mem::take(&mut **right));
            }
        }

        let mut pending = Vec::new();
        detach(self, &mut pending);
        // Each popped node has its children detached before it is dropped.
        while let Some(mut cause) = pending.pop() {
            detach(&mut cause, &mut pending);
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        enum Part<'a, E> {
            Node(&'a Cause<E>),
            Text(&'static str),
        }

        let mut parts = vec![Part::Node(self)];
        while let Some(part) = parts.pop() {
            let cause = match part {
                Part::Text(text) => {
                    f.write_str(text)?;
                    continue;
                }
                Part::Node(cause) => cause,
            };
            match cause {
                Cause::Empty => f.write_str("Empty")?,
                Cause::Fail(e) => write!(f, "Fail({:?})", e)?,
                Cause::Die(d) => write!(f, "Die({:?})", d)?,
                Cause::Interrupt(id) => write!(f, "Interrupt({:?})", id)?,
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    let name = if matches!(cause, Cause::Then(..)) { "Then(" } else { "Both(" };
                    f.write_str(name)?;
                    parts.push(Part::Text(")"));
                    parts.push(Part::Node(right));
                    parts.push(Part::Text(", "));
                    parts.push(Part::Node(left));
                }
            }
        }
        Ok(())
    }
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// A defect built from a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// An interruption by `id`.
    pub fn interrupt(id: FiberId) -> Self {
        Cause::Interrupt(id)
    }

    /// Sequential composition. `Empty` on either side is dropped.
    pub fn then(left: Cause<E>, right: Cause<E>) -> Self {
        match (left, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition. `Empty` on either side is dropped.
    pub fn both(left: Cause<E>, right: Cause<E>) -> Self {
        match (left, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Both(Box::new(left), Box::new(right)),
        }
    }

    /// Preorder walk over every node until `visit` returns `false`.
    fn walk<'a>(&'a self, mut visit: impl FnMut(&'a Cause<E>) -> bool) {
        let mut stack = vec![self];
        while let Some(cause) = stack.pop() {
            if !visit(cause) {
                return;
            }
            if let Cause::Then(left, right) | Cause::Both(left, right) = cause {
                stack.push(right);
                stack.push(left);
            }
        }
    }

    /// Find the first node (preorder) for which `f` returns `Some`.
    pub fn find<Z>(&self, mut f: impl FnMut(&Cause<E>) -> Option<Z>) -> Option<Z> {
        let mut found = None;
        self.walk(|cause| {
            found = f(cause);
            found.is_none()
        });
        found
    }

    /// Fold the cause tree bottom-up without recursion.
    pub fn fold<'a, Z>(
        &'a self,
        mut on_empty: impl FnMut() -> Z,
        mut on_fail: impl FnMut(&'a E) -> Z,
        mut on_die: impl FnMut(&'a Defect) -> Z,
        mut on_interrupt: impl FnMut(FiberId) -> Z,
        mut on_then: impl FnMut(Z, Z) -> Z,
        mut on_both: impl FnMut(Z, Z) -> Z,
    ) -> Z {
        enum Task<'c, E> {
            Visit(&'c Cause<E>),
            Then,
            Both,
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut out: Vec<Z> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(cause) => match cause {
                    Cause::Empty => out.push(on_empty()),
                    Cause::Fail(e) => out.push(on_fail(e)),
                    Cause::Die(d) => out.push(on_die(d)),
                    Cause::Interrupt(id) => out.push(on_interrupt(*id)),
                    Cause::Then(left, right) => {
                        tasks.push(Task::Then);
                        tasks.push(Task::Visit(right));
                        tasks.push(Task::Visit(left));
                    }
                    Cause::Both(left, right) => {
                        tasks.push(Task::Both);
                        tasks.push(Task::Visit(right));
                        tasks.push(Task::Visit(left));
                    }
                },
                Task::Then => {
                    if let (Some(r), Some(l)) = (out.pop(), out.pop()) {
                        out.push(on_then(l, r));
                    }
                }
                Task::Both => {
                    if let (Some(r), Some(l)) = (out.pop(), out.pop()) {
                        out.push(on_both(l, r));
                    }
                }
            }
        }
        match out.pop() {
            Some(z) => z,
            None => on_empty(),
        }
    }

    /// True when the cause holds no failure, defect or interruption.
    pub fn is_empty(&self) -> bool {
        self.find(|c| match c {
            Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => Some(()),
            _ => None,
        })
        .is_none()
    }

    /// True when the cause contains a typed failure.
    pub fn failed(&self) -> bool {
        self.find(|c| matches!(c, Cause::Fail(_)).then_some(())).is_some()
    }

    /// True when the cause contains a defect.
    pub fn died(&self) -> bool {
        self.find(|c| matches!(c, Cause::Die(_)).then_some(())).is_some()
    }

    /// True when the cause contains an interruption.
    pub fn interrupted(&self) -> bool {
        self.find(|c| matches!(c, Cause::Interrupt(_)).then_some(())).is_some()
    }

    /// True when the cause holds neither failures nor defects.
    pub fn interrupted_only(&self) -> bool {
        self.find(|c| matches!(c, Cause::Fail(_) | Cause::Die(_)).then_some(()))
            .is_none()
    }

    /// The first typed failure, if any.
    pub fn failure_option(&self) -> Option<&E> {
        let mut found = None;
        self.walk(|c| match c {
            Cause::Fail(e) => {
                found = Some(e);
                false
            }
            _ => true,
        });
        found
    }

    /// Every defect, in preorder.
    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.walk(|c| {
            if let Cause::Die(d) = c {
                out.push(d.clone());
            }
            true
        });
        out
    }

    /// Every fiber that requested interruption.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.walk(|c| {
            if let Cause::Interrupt(id) = c {
                out.insert(*id);
            }
            true
        });
        out
    }

    /// Drop every typed failure, keeping defects and interruptions.
    pub fn strip_failures(&self) -> Cause<E> {
        self.fold(
            Cause::empty,
            |_| Cause::Empty,
            |d| Cause::Die(d.clone()),
            Cause::Interrupt,
            Cause::then,
            Cause::both,
        )
    }

    /// Keep only the defects, or `None` if there are none.
    pub fn keep_defects<E2>(&self) -> Option<Cause<E2>> {
        let kept = self.fold(
            Cause::empty,
            |_| Cause::Empty,
            |d| Cause::Die(d.clone()),
            |_| Cause::Empty,
            Cause::then,
            Cause::both,
        );
        if kept.is_empty() {
            None
        } else {
            Some(kept)
        }
    }

    /// Forget the failure payloads, keeping the shape of the cause.
    pub fn as_unit(&self) -> Cause<()> {
        self.fold(
            Cause::empty,
            |_| Cause::Fail(()),
            |d| Cause::Die(d.clone()),
            Cause::Interrupt,
            Cause::then,
            Cause::both,
        )
    }
}

impl<E: Clone> Cause<E> {
    /// Transform every typed failure.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.flat_map(&mut |e| Cause::Fail(f(e)))
    }

    /// Replace every typed failure with a whole cause. Each failure is
    /// cloned out of the tree, which is dropped afterwards.
    pub fn flat_map<E2>(self, f: &mut impl FnMut(E) -> Cause<E2>) -> Cause<E2> {
        self.fold(
            Cause::empty,
            |e| f(e.clone()),
            |d| Cause::Die(d.clone()),
            Cause::Interrupt,
            Cause::then,
            Cause::both,
        )
    }

    /// The first typed failure, or the rest of the cause when there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        let mut first = None;
        let rest = self.flat_map(&mut |e| {
            if first.is_none() {
                first = Some(e);
            }
            Cause::Empty
        });
        first.ok_or(rest)
    }

    /// Every typed failure, in preorder.
    pub fn failures(&self) -> Vec<E> {
        let mut out = Vec::new();
        self.walk(|c| {
            if let Cause::Fail(e) = c {
                out.push(e.clone());
            }
            true
        });
        out
    }

    /// Remove the interruptions requested by `id`.
    pub fn without_interruptor(&self, id: FiberId) -> Cause<E> {
        self.fold(
            Cause::empty,
            |e| Cause::Fail(e.clone()),
            |d| Cause::Die(d.clone()),
            |by| {
                if by == id {
                    Cause::Empty
                } else {
                    Cause::Interrupt(by)
                }
            },
            Cause::then,
            Cause::both,
        )
    }
}

impl<E: PartialEq> Cause<E> {
    /// True when `that` equals this cause or any of its subtrees.
    pub fn contains(&self, that: &Cause<E>) -> bool {
        if that.is_empty() {
            return true;
        }
        let mut found = false;
        self.walk(|c| {
            found = c == that;
            !found
        });
        found
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Render the cause as an indented tree.
    pub fn pretty(&self) -> String {
        use fmt::Write;

        let mut out = String::new();
        let mut stack = vec![(self, String::new(), String::new())];
        while let Some((cause, first, rest)) = stack.pop() {
            let label = match cause {
                Cause::Empty => "Empty".to_string(),
                Cause::Fail(e) => format!("Fail({:?})", e),
                Cause::Die(d) => format!("Die: {}", d),
                Cause::Interrupt(id) => format!("Interrupted by {}", id),
                Cause::Then(..) => "Then".to_string(),
                Cause::Both(..) => "Both".to_string(),
            };
            let _ = writeln!(out, "{}{}", first, label);
            if let Cause::Die(d) = cause {
                if let Some(bt) = d.backtrace() {
                    for line in bt.lines() {
                        let _ = writeln!(out, "{}  {}", rest, line);
                    }
                }
            }
            if let Cause::Then(left, right) | Cause::Both(left, right) = cause {
                stack.push((&**right, format!("{}└─ ", rest), format!("{}   ", rest)));
                stack.push((&**left, format!("{}├─ ", rest), format!("{}│  ", rest)));
            }
        }
        out
    }
}

// ============================================================================
// Semantic equality
// ============================================================================

#[derive(PartialEq)]
enum Leaf<'a, E> {
    Fail(&'a E),
    Die(&'a Defect),
    Interrupt(FiberId),
}

/// A cause flattened into sequential steps of concurrent leaves.
type Steps<'a, E> = Vec<Vec<Leaf<'a, E>>>;

fn steps<E>(cause: &Cause<E>) -> Steps<'_, E> {
    cause.fold(
        Vec::new,
        |e| vec![vec![Leaf::Fail(e)]],
        |d| vec![vec![Leaf::Die(d)]],
        |id| vec![vec![Leaf::Interrupt(id)]],
        |mut first, next| {
            first.extend(next);
            first
        },
        merge,
    )
}

/// Line up two step sequences and join the leaves of matching steps.
fn merge<'a, E>(left: Steps<'a, E>, right: Steps<'a, E>) -> Steps<'a, E> {
    let mut out = Vec::with_capacity(left.len().max(right.len()));
    let mut left = left.into_iter();
    let mut right = right.into_iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return out,
            (Some(step), None) | (None, Some(step)) => out.push(step),
            (Some(mut step), Some(other)) => {
                step.extend(other);
                out.push(step);
            }
        }
    }
}

/// Multiset equality: every leaf of `a` pairs with a distinct equal leaf of `b`.
fn same_step<E: PartialEq>(a: &[Leaf<'_, E>], b: &[Leaf<'_, E>]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    a.iter().all(|x| match (0..b.len()).find(|&i| !used[i] && *x == b[i]) {
        Some(i) => {
            used[i] = true;
            true
        }
        None => false,
    })
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        let left = steps(self);
        let right = steps(other);
        left.len() == right.len() && left.iter().zip(&right).all(|(a, b)| same_step(a, b))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u64) -> FiberId {
        FiberId::from_parts(n, 0)
    }

    #[test]
    fn test_empty_is_identity() {
        let c: Cause<i32> = Cause::fail(1);
        assert_eq!(Cause::then(Cause::Empty, c.clone()), c);
        assert_eq!(Cause::both(c.clone(), Cause::Empty), c);
        assert_eq!(Cause::Then(Box::new(Cause::Empty), Box::new(c.clone())), c);
    }

    #[test]
    fn test_then_associative() {
        let (a, b, c) = (Cause::fail(1), Cause::fail(2), Cause::<i32>::interrupt(fid(3)));
        let left = Cause::then(Cause::then(a.clone(), b.clone()), c.clone());
        let right = Cause::then(a, Cause::then(b, c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_both_commutative_and_associative() {
        let (a, b, c) = (Cause::fail(1), Cause::die_message("boom"), Cause::<i32>::fail(3));
        assert_eq!(Cause::both(a.clone(), b.clone()), Cause::both(b.clone(), a.clone()));
        assert_eq!(
            Cause::both(Cause::both(a.clone(), b.clone()), c.clone()),
            Cause::both(a, Cause::both(b, c))
        );
    }

    #[test]
    fn test_then_is_ordered() {
        let (a, b) = (Cause::<i32>::fail(1), Cause::fail(2));
        assert_ne!(Cause::then(a.clone(), b.clone()), Cause::then(b, a));
    }

    #[test]
    fn test_queries() {
        let cause: Cause<&str> = Cause::then(
            Cause::both(Cause::fail("a"), Cause::interrupt(fid(7))),
            Cause::die_message("late"),
        );
        assert!(cause.failed());
        assert!(cause.died());
        assert!(cause.interrupted());
        assert!(!cause.interrupted_only());
        assert_eq!(cause.failures(), vec!["a"]);
        assert_eq!(cause.defects().len(), 1);
        assert_eq!(cause.interruptors().into_iter().collect::<Vec<_>>(), vec![fid(7)]);
        assert_eq!(cause.failure_option(), Some(&"a"));
    }

    #[test]
    fn test_strip_failures_keeps_interrupts() {
        let cause: Cause<i32> = Cause::both(Cause::fail(1), Cause::interrupt(fid(2)));
        let stripped = cause.strip_failures();
        assert!(!stripped.failed());
        assert!(stripped.interrupted_only());
        assert_eq!(stripped, Cause::interrupt(fid(2)));
    }

    #[test]
    fn test_keep_defects() {
        let cause: Cause<i32> = Cause::then(Cause::fail(1), Cause::die_message("x"));
        let kept: Cause<()> = cause.keep_defects().unwrap();
        assert!(kept.died());
        assert!(!kept.failed());
        assert!(Cause::<i32>::fail(1).keep_defects::<()>().is_none());
    }

    #[test]
    fn test_fold_counts_leaves_deep() {
        let mut cause: Cause<u32> = Cause::Empty;
        for i in 0..5_000 {
            cause = Cause::then(cause, Cause::fail(i));
        }
        let count = cause.fold(|| 0usize, |_| 1, |_| 1, |_| 1, |a, b| a + b, |a, b| a + b);
        assert_eq!(count, 5_000);
    }

    #[test]
    fn test_repeated_failures_keep_multiplicity() {
        let twice: Cause<i32> = Cause::both(Cause::fail(1), Cause::fail(1));
        assert_ne!(twice, Cause::fail(1));
        assert_ne!(
            Cause::both(twice.clone(), Cause::fail(2)),
            Cause::both(Cause::fail(1), Cause::fail(2))
        );
        assert_eq!(
            Cause::both(Cause::fail(2), twice.clone()),
            Cause::both(Cause::fail(1), Cause::both(Cause::fail(2), Cause::fail(1)))
        );
        assert_eq!(twice.failures(), vec![1, 1]);
    }

    #[test]
    fn test_deep_chain_clone_compare_and_drop() {
        let mut cause: Cause<u32> = Cause::Empty;
        for i in 0..200_000 {
            cause = Cause::then(cause, Cause::fail(i));
        }
        let copy = cause.clone();
        assert!(copy == cause);
        let mapped = copy.map(|e| e + 1);
        assert_eq!(mapped.failure_option(), Some(&1));
        assert!(format!("{:?}", mapped).starts_with("Then(Then("));
        drop(mapped);
        drop(cause);
    }

    #[test]
    fn test_debug_output() {
        let cause: Cause<i32> = Cause::then(Cause::fail(1), Cause::both(Cause::Empty, Cause::fail(2)));
        assert_eq!(format!("{:?}", cause), "Then(Fail(1), Fail(2))");
        let raw: Cause<i32> = Cause::Both(Box::new(Cause::Empty), Box::new(Cause::fail(3)));
        assert_eq!(format!("{:?}", raw), "Both(Empty, Fail(3))");
    }

    #[test]
    fn test_contains() {
        let inner = Cause::<i32>::interrupt(fid(1));
        let cause = Cause::then(Cause::fail(3), inner.clone());
        assert!(cause.contains(&inner));
        assert!(!cause.contains(&Cause::fail(4)));
    }

    #[test]
    fn test_failure_or_cause() {
        let cause: Cause<i32> = Cause::both(Cause::fail(9), Cause::interrupt(fid(1)));
        assert_eq!(cause.failure_or_cause(), Ok(9));
        let only: Cause<i32> = Cause::interrupt(fid(1));
        assert_eq!(only.clone().failure_or_cause(), Err(only));
    }

    #[test]
    fn test_without_interruptor() {
        let cause: Cause<i32> = Cause::both(
            Cause::fail(1),
            Cause::then(Cause::interrupt(fid(1)), Cause::interrupt(fid(2))),
        );
        let rest = cause.without_interruptor(fid(1));
        assert_eq!(rest, Cause::both(Cause::fail(1), Cause::interrupt(fid(2))));
        assert!(Cause::<i32>::interrupt(fid(1))
            .without_interruptor(fid(1))
            .is_empty());
    }

    #[test]
    fn test_map_preserves_shape() {
        let cause: Cause<i32> = Cause::then(Cause::fail(1), Cause::fail(2));
        let mapped = cause.map(|e| e * 10);
        assert_eq!(mapped.failures(), vec![10, 20]);
    }

    #[test]
    fn test_pretty_renders_tree() {
        let cause: Cause<&str> = Cause::both(Cause::fail("bad"), Cause::die_message("worse"));
        let text = cause.pretty();
        assert!(text.starts_with("Both"));
        assert!(text.contains("├─ Fail(\"bad\")"));
        assert!(text.contains("└─ Die: worse"));
    }
}
