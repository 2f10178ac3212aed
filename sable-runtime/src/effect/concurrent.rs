//! Forking, racing and parallel composition.
//!
//! Parallel combinators fork one child per branch and wait on a shared
//! signal. The first failure (or the last success) fires the signal; the
//! remaining children are then interrupted and awaited, so every branch has
//! ended before the combinator returns. All failure causes are kept, merged
//! with `Cause::both`; interruptions caused by the combinator itself are
//! dropped from the result.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::instr::{erase_cause, restore_exit, with_value, Instr, RaceCont};
use super::ops::bind;
use super::{Data, Effect, Never, UIO};
use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberId, ForkScope};
use crate::interpreter::FiberContext;
use crate::promise::Promise;
use crate::semaphore::Semaphore;

/// One of two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
    /// The left value.
    Left(L),
    /// The right value.
    Right(R),
}

type Branch<R, E, T, B> = Arc<dyn Fn(T) -> Effect<R, E, B> + Send + Sync>;

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    // ------------------------------------------------------------------
    // Forking
    // ------------------------------------------------------------------

    fn fork_with(self, scope: Option<ForkScope>) -> Effect<R, Never, Fiber<E, A>> {
        Effect::from_build(move || {
            bind(
                Instr::Fork(Box::new(self.instr()), scope.clone()),
                |ctx: Arc<FiberContext>| Instr::succeed(Fiber::<E, A>::new(ctx)),
            )
        })
    }

    /// Run this effect on a child fiber supervised by the current one.
    pub fn fork(self) -> Effect<R, Never, Fiber<E, A>> {
        self.fork_with(None)
    }

    /// Run this effect on a fiber in the global scope; it outlives its
    /// creator.
    pub fn fork_daemon(self) -> Effect<R, Never, Fiber<E, A>> {
        self.fork_with(Some(ForkScope::Global))
    }

    /// Run this effect on a fiber supervised by `scope`.
    pub fn fork_in(self, scope: ForkScope) -> Effect<R, Never, Fiber<E, A>> {
        self.fork_with(Some(scope))
    }

    // ------------------------------------------------------------------
    // Racing
    // ------------------------------------------------------------------

    /// Run both effects on child fibers. When the first finishes, the other
    /// is interrupted and awaited, then the handler for the winning side
    /// runs with the winner's and the loser's exits.
    pub fn race_with<E2: Data, B: Data, E3: Data, C: Data>(
        self,
        that: Effect<R, E2, B>,
        on_left: impl Fn(Exit<E, A>, Exit<E2, B>) -> Effect<R, E3, C> + Send + Sync + 'static,
        on_right: impl Fn(Exit<E2, B>, Exit<E, A>) -> Effect<R, E3, C> + Send + Sync + 'static,
    ) -> Effect<R, E3, C> {
        let on_left: Arc<dyn Fn(Exit<E, A>, Exit<E2, B>) -> Effect<R, E3, C> + Send + Sync> =
            Arc::new(on_left);
        let on_right: Arc<dyn Fn(Exit<E2, B>, Exit<E, A>) -> Effect<R, E3, C> + Send + Sync> =
            Arc::new(on_right);
        Effect::from_build(move || Instr::RaceWith {
            left: Box::new(self.instr()),
            right: Box::new(that.instr()),
            on_left: after_loser(on_left.clone()),
            on_right: after_loser(on_right.clone()),
            scope: None,
        })
    }

    /// The first effect to succeed wins and the other is interrupted. If
    /// the first to finish failed, the race waits for the other one; when
    /// both fail, both causes are kept.
    pub fn race(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        Effect::from_build(move || Instr::RaceWith {
            left: Box::new(self.instr()),
            right: Box::new(that.instr()),
            on_left: first_success::<E, A>(),
            on_right: first_success::<E, A>(),
            scope: None,
        })
    }

    /// The first effect to finish wins, whether it succeeded or failed.
    pub fn race_first(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        self.to_exit()
            .race(that.to_exit())
            .widen_err::<E>()
            .flat_map(Effect::done)
    }

    /// Race against an effect of another type.
    pub fn race_either<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, Either<A, B>> {
        self.map(Either::Left).race(that.map(Either::Right))
    }

    /// `None` if the effect does not finish within `duration`; it is then
    /// interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<R, E, Option<A>> {
        self.map(Some)
            .race_first(Effect::<R, E, ()>::sleep(duration).map(|_| None))
    }

    /// Fail with `error` if the effect does not finish within `duration`.
    pub fn timeout_fail(self, error: E, duration: Duration) -> Effect<R, E, A> {
        self.timeout(duration).flat_map(move |result| match result {
            Some(a) => Effect::succeed(a),
            None => Effect::fail(error.clone()),
        })
    }

    // ------------------------------------------------------------------
    // Parallel zips
    // ------------------------------------------------------------------

    /// Run both in parallel and combine their values. The first failure
    /// interrupts the other side.
    pub fn zip_with_par<B: Data, C: Data>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C> {
        let branches = Arc::new(vec![self.map(Either::Left), that.map(Either::Right)]);
        let f = Arc::new(f);
        foreach_par_all(branches, Arc::new(|branch: Effect<R, E, Either<A, B>>| branch)).flat_map(move |mut values| {
            match (values.pop(), values.pop()) {
                (Some(Either::Right(b)), Some(Either::Left(a))) => Effect::succeed(f(a, b)),
                _ => Effect::die_message("parallel zip lost a branch"),
            }
        })
    }

    /// Run both in parallel and pair their values.
    pub fn zip_par<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with_par(that, |a, b| (a, b))
    }
}

/// Interrupt the loser, then hand both exits to `handler` with the caller's
/// interruptibility.
fn after_loser<R: Data, E: Data, A: Data, E2: Data, B: Data, E3: Data, C: Data>(
    handler: Arc<dyn Fn(Exit<E, A>, Exit<E2, B>) -> Effect<R, E3, C> + Send + Sync>,
) -> RaceCont {
    Box::new(move |winner, loser, status| {
        let winner = restore_exit::<E, A>(winner);
        bind(
            Fiber::<E2, B>::new(loser).interrupt().instr(),
            move |loser: Exit<E2, B>| handler(winner, loser).instr().with_status(status),
        )
    })
}

/// A won race: a success interrupts the loser, a failure waits for it with
/// the caller's interruptibility.
fn first_success<E: Data, A: Data>() -> RaceCont {
    Box::new(|winner, loser, status| {
        let loser = Fiber::<E, A>::new(loser);
        match restore_exit::<E, A>(winner) {
            Exit::Success(a) => bind(loser.interrupt().instr(), move |_: Exit<E, A>| {
                Instr::succeed(a)
            }),
            Exit::Failure(first) => {
                let abandon = loser.clone();
                Instr::Fold(
                    Box::new(loser.await_exit().instr().with_status(status)),
                    Box::new(move |cause| {
                        bind(abandon.interrupt().instr(), move |_: Exit<E, A>| {
                            Instr::Fail(cause)
                        })
                    }),
                    Box::new(move |exit| {
                        with_value(exit, move |exit: Exit<E, A>| match exit {
                            Exit::Success(a) => Instr::succeed(a),
                            Exit::Failure(second) => {
                                Instr::Fail(erase_cause(Cause::both(first, second)))
                            }
                        })
                    }),
                )
            }
        }
    })
}

// ============================================================================
// Parallel traversal
// ============================================================================

impl<R: Data, E: Data, B: Data> Effect<R, E, Vec<B>> {
    /// Run `f` on every item in parallel, collecting the values in input
    /// order. The first failure interrupts the other branches.
    pub fn foreach_par<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        foreach_par_all(Arc::new(items.into_iter().collect()), Arc::new(f))
    }

    /// Like `foreach_par`, with at most `n` branches running at once.
    pub fn foreach_par_n<T: Data>(
        n: usize,
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        let items: Arc<Vec<T>> = Arc::new(items.into_iter().collect());
        let f: Branch<R, E, T, B> = Arc::new(f);
        Effect::suspend(move || {
            let semaphore = Semaphore::new(n.max(1));
            let f = f.clone();
            foreach_par_all(
                items.clone(),
                Arc::new(move |t| semaphore.with_permit(f(t))),
            )
        })
    }

    /// Run every effect in parallel, collecting the values.
    pub fn collect_all_par(effects: impl IntoIterator<Item = Effect<R, E, B>>) -> Self {
        Self::foreach_par(effects, |effect| effect)
    }
}

impl<R: Data, E: Data> Effect<R, E, ()> {
    /// Run `f` on every item in parallel, discarding the values.
    pub fn foreach_par_<T: Data, B: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        Effect::<R, E, Vec<()>>::foreach_par(items, move |t| f(t).as_unit()).as_unit()
    }

    /// Like `foreach_par_`, with at most `n` branches running at once.
    pub fn foreach_par_n_<T: Data, B: Data>(
        n: usize,
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        Effect::<R, E, Vec<()>>::foreach_par_n(n, items, move |t| f(t).as_unit()).as_unit()
    }
}

fn foreach_par_all<R: Data, E: Data, T: Data, B: Data>(
    items: Arc<Vec<T>>,
    f: Branch<R, E, T, B>,
) -> Effect<R, E, Vec<B>> {
    Effect::suspend(move || {
        if items.is_empty() {
            return Effect::succeed(Vec::new());
        }
        let signal = Promise::<Never, ()>::new();
        let remaining = Arc::new(AtomicUsize::new(items.len()));
        let items = items.clone();
        let f = f.clone();

        Effect::<R, E, FiberId>::fiber_id().flat_map(move |me| {
            let signal = signal.clone();
            let remaining = remaining.clone();
            let items = items.clone();
            let f = f.clone();
            Effect::uninterruptible_mask(move |restore| {
                let done = signal.clone();
                let remaining = remaining.clone();
                let f = f.clone();
                let spawn = Effect::<R, E, Vec<Fiber<E, B>>>::foreach((*items).clone(), move |t| {
                    let done = done.clone();
                    let remaining = remaining.clone();
                    restore
                        .restore(f(t))
                        .on_exit(move |exit: Exit<E, B>| {
                            let done = done.clone();
                            let remaining = remaining.clone();
                            let failed = exit.is_failure();
                            Effect::succeed_with(move || {
                                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 || failed {
                                    done.try_complete(Exit::succeed(()));
                                }
                            })
                        })
                        .fork()
                        .widen_err::<E>()
                });

                let signal = signal.clone();
                spawn.flat_map(move |fibers: Vec<Fiber<E, B>>| {
                    let on_interrupt = fibers.clone();
                    restore
                        .restore(signal.await_().lift::<R, E>())
                        .fold_cause_m(
                            move |cause| {
                                interrupt_all(on_interrupt.clone())
                                    .lift::<R, E>()
                                    .zip_right(Effect::halt(cause))
                            },
                            move |_| {
                                interrupt_all(fibers.clone())
                                    .lift::<R, E>()
                                    .flat_map(move |exits| Effect::done(collect_par(exits, me)))
                            },
                        )
                })
            })
        })
    })
}

/// Interrupt every fiber as the caller, then await them all.
fn interrupt_all<E: Data, B: Data>(fibers: Vec<Fiber<E, B>>) -> UIO<Vec<Exit<E, B>>> {
    let awaited = fibers.clone();
    Effect::<(), Never, ()>::foreach_(fibers, |fiber: Fiber<E, B>| fiber.interrupt_fork())
        .zip_right(Effect::foreach(awaited, |fiber: Fiber<E, B>| fiber.await_exit()))
}

fn collect_par<E: Data, B: Data>(exits: Vec<Exit<E, B>>, me: FiberId) -> Exit<E, Vec<B>> {
    let mut values = Vec::with_capacity(exits.len());
    let mut cause = Cause::Empty;
    let mut raw = Cause::Empty;
    for exit in exits {
        match exit {
            Exit::Success(b) => values.push(b),
            Exit::Failure(c) => {
                cause = Cause::both(cause, c.without_interruptor(me));
                raw = Cause::both(raw, c);
            }
        }
    }
    if raw.is_empty() {
        Exit::Success(values)
    } else if cause.is_empty() {
        Exit::Failure(raw)
    } else {
        Exit::Failure(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::IO;
    use std::sync::atomic::AtomicBool;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked()).unwrap()
    }

    #[test]
    fn test_fork_join() {
        let rt = runtime();
        let effect: UIO<i32> = UIO::succeed(21)
            .map(|n| n * 2)
            .fork()
            .flat_map(|fiber| fiber.join());
        assert_eq!(rt.run_sync(effect).unwrap(), 42);
    }

    #[test]
    fn test_join_reraises_failure() {
        let rt = runtime();
        let effect: IO<&str, ()> = IO::<&str, ()>::fail("child")
            .fork()
            .widen_err()
            .flat_map(|fiber| fiber.join());
        assert_eq!(rt.run_sync_exit(effect), Exit::fail("child"));
    }

    #[test]
    fn test_race_with_never_resolves_right() {
        let rt = runtime();
        let left_exit = Arc::new(parking_lot::Mutex::new(None));
        let slot = left_exit.clone();
        let effect: UIO<i32> = UIO::<i32>::never().race_with(
            UIO::succeed(1),
            |_, _| Effect::succeed(-1),
            move |winner, loser| {
                *slot.lock() = Some(loser.is_interrupted());
                Effect::done(winner)
            },
        );
        assert_eq!(rt.run_sync(effect).unwrap(), 1);
        assert_eq!(*left_exit.lock(), Some(true));
    }

    #[test]
    fn test_race_failure_keeps_both_causes() {
        let rt = runtime();
        let fast = IO::<&str, i32>::fail("fast");
        let slow = IO::<&str, i32>::fail("slow").delay(Duration::from_millis(20));
        let cause = rt.run_sync_exit(fast.race(slow)).cause().cloned().unwrap();
        let mut failures = cause.failures();
        failures.sort();
        assert_eq!(failures, vec!["fast", "slow"]);
        assert!(!cause.interrupted());
    }

    #[test]
    fn test_race_waits_for_success_after_early_failure() {
        let rt = runtime();
        let fast = IO::<&str, i32>::fail("fast");
        let slow = IO::<&str, i32>::succeed(7).delay(Duration::from_millis(50));
        assert_eq!(rt.run_sync_exit(fast.race(slow.clone())), Exit::succeed(7));
        assert_eq!(rt.run_sync_exit(slow.race(IO::<&str, i32>::fail("fast"))), Exit::succeed(7));
    }

    #[test]
    fn test_race_first_takes_early_failure() {
        let rt = runtime();
        let fast = IO::<&str, i32>::fail("fast");
        let slow = IO::<&str, i32>::succeed(7).delay(Duration::from_millis(50));
        assert_eq!(rt.run_sync_exit(fast.race_first(slow)), Exit::fail("fast"));
    }

    #[test]
    fn test_interrupting_race_after_early_failure_interrupts_loser() {
        let rt = runtime();
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let slow = UIO::<i32>::never().on_interrupt(UIO::succeed_with(move || {
            flag.store(true, Ordering::SeqCst)
        }));
        let race = IO::<&str, i32>::fail("fast").race(slow.widen_err());
        let effect = race
            .fork()
            .flat_map(|fiber| UIO::<()>::sleep(Duration::from_millis(20)).zip_right(fiber.interrupt()));
        assert!(rt.run_sync(effect).unwrap().is_interrupted());
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_race_either_and_timeout() {
        let rt = runtime();
        let slow: UIO<&str> = UIO::succeed("slow").delay(Duration::from_secs(5));
        let effect = UIO::succeed(3).race_either(slow.clone());
        assert_eq!(rt.run_sync(effect).unwrap(), Either::Left(3));
        assert_eq!(rt.run_sync(slow.timeout(Duration::from_millis(10))).unwrap(), None);
        let failing = IO::<&str, ()>::never().timeout_fail("late", Duration::from_millis(10));
        assert_eq!(rt.run_sync_exit(failing), Exit::fail("late"));
    }

    #[test]
    fn test_zip_par_runs_concurrently() {
        let rt = runtime();
        let latch = Promise::<Never, ()>::new();
        let left: UIO<u8> = latch.await_().as_(1);
        let right: UIO<u8> = latch.succeed(()).as_(2);
        assert_eq!(rt.run_sync(left.zip_par(right)).unwrap(), (1, 2));
    }

    #[test]
    fn test_foreach_par_keeps_order() {
        let rt = runtime();
        let effect: UIO<Vec<u64>> = Effect::foreach_par(0..50u64, |n| {
            UIO::succeed(n * n).delay(Duration::from_millis(50 - n))
        });
        let squares = rt.run_sync(effect).unwrap();
        assert_eq!(squares, (0..50u64).map(|n| n * n).collect::<Vec<_>>());
    }

    #[test]
    fn test_foreach_par_failure_interrupts_siblings() {
        let rt = runtime();
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let effect: IO<&str, Vec<()>> = Effect::foreach_par(vec![0, 1], move |n: i32| {
            if n == 0 {
                IO::<&str, ()>::fail("boom").delay(Duration::from_millis(10))
            } else {
                let flag = flag.clone();
                IO::<&str, ()>::never().on_interrupt(Effect::succeed_with(move || {
                    flag.store(true, Ordering::SeqCst)
                }))
            }
        });
        let cause = rt.run_sync_exit(effect).cause().cloned().unwrap();
        assert_eq!(cause.failures(), vec!["boom"]);
        assert!(!cause.interrupted());
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_foreach_par_keeps_every_failure() {
        let rt = runtime();
        let latch = Promise::<Never, ()>::new();
        let effect: IO<i32, Vec<()>> = Effect::foreach_par(vec![1, 2], move |n: i32| {
            let latch = latch.clone();
            if n == 1 {
                latch.await_().widen_err().zip_right(Effect::fail(1)).uninterruptible()
            } else {
                latch.succeed(()).widen_err().zip_right(Effect::fail(2))
            }
        });
        let mut failures = rt.run_sync_exit(effect).cause().unwrap().failures();
        failures.sort();
        assert_eq!(failures, vec![1, 2]);
    }

    #[test]
    fn test_foreach_par_n_bounds_concurrency() {
        let rt = runtime();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (i, p) = (inside.clone(), peak.clone());
        let effect: UIO<()> = Effect::foreach_par_n_(3, 0..12, move |_: i32| {
            let (enter, leave) = (i.clone(), i.clone());
            let p = p.clone();
            UIO::succeed_with(move || {
                let now = enter.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
            })
            .zip_right(UIO::<()>::sleep(Duration::from_millis(10)))
            .zip_right(UIO::succeed_with(move || {
                leave.fetch_sub(1, Ordering::SeqCst);
            }))
        });
        rt.run_sync(effect).unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(inside.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interrupting_foreach_par_interrupts_children() {
        let rt = runtime();
        let finalized = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));
        let all_started = Promise::<Never, ()>::new();
        let (counter, latch) = (finalized.clone(), all_started.clone());
        let body: UIO<Vec<()>> = Effect::foreach_par(0..4, move |_: i32| {
            let counter = counter.clone();
            let entered = entered.clone();
            let latch = latch.clone();
            UIO::succeed_with(move || {
                if entered.fetch_add(1, Ordering::SeqCst) == 3 {
                    latch.try_complete(Exit::succeed(()));
                }
            })
            .zip_right(UIO::<()>::never())
            .ensuring(UIO::succeed_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        });
        let effect = body
            .fork()
            .zip_left(all_started.await_())
            .flat_map(|fiber| fiber.interrupt());
        assert!(rt.run_sync(effect).unwrap().is_interrupted());
        assert_eq!(finalized.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_daemon_outlives_parent() {
        let rt = runtime();
        let release = Promise::<Never, u8>::new();
        let daemon_body = release.await_();
        let effect: UIO<Fiber<Never, u8>> = daemon_body.fork_daemon();
        let daemon = rt.run_sync(effect).unwrap();
        assert!(daemon.poll_now().is_none());
        release.try_complete(Exit::succeed(7));
        assert_eq!(rt.run_sync(daemon.join()).unwrap(), 7);
    }

    #[test]
    fn test_parent_exit_interrupts_children() {
        let rt = runtime();
        let effect: UIO<Fiber<Never, ()>> = UIO::<()>::never().fork();
        let child = rt.run_sync(effect).unwrap();
        let exit = rt.run_sync(child.await_exit()).unwrap();
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_fork_in_closed_scope_interrupts_child() {
        let rt = runtime();
        let scope = rt.run_sync(UIO::<ForkScope>::fork_scope()).unwrap();
        let effect: UIO<Fiber<Never, u8>> = UIO::succeed(1).fork_in(scope);
        let fiber = rt.run_sync(effect).unwrap();
        assert!(rt.run_sync(fiber.await_exit()).unwrap().is_interrupted());
    }
}
