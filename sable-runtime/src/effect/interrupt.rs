//! Interruptibility regions, resource brackets and async registration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::instr::{with_fiber, Instr};
use super::{Data, Effect, Never, UIO};
use crate::cause::Cause;
use crate::clock::Clock;
use crate::exit::Exit;
use crate::fiber::InterruptStatus;
use crate::interpreter::Resumer;

/// Reinstates the interruptibility that was in effect when an
/// `uninterruptible_mask` region began.
#[derive(Debug, Clone, Copy)]
pub struct InterruptStatusRestore(InterruptStatus);

impl InterruptStatusRestore {
    /// Run `effect` with the saved interruptibility.
    pub fn restore<R: Data, E: Data, A: Data>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        effect.with_interrupt_status(self.0)
    }

    /// The saved interruptibility.
    pub fn status(&self) -> InterruptStatus {
        self.0
    }
}

/// Completes a suspended `effect_async*` call. Only the first completion
/// counts.
pub struct AsyncCallback<R, E, A> {
    resumer: Resumer,
    _marker: std::marker::PhantomData<fn() -> Effect<R, E, A>>,
}

impl<R, E, A> Clone for AsyncCallback<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            resumer: self.resumer.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for AsyncCallback<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncCallback")
    }
}

impl<R: Data, E: Data, A: Data> AsyncCallback<R, E, A> {
    fn new(resumer: Resumer) -> Self {
        Self {
            resumer,
            _marker: std::marker::PhantomData,
        }
    }

    /// Resume the fiber with `effect`.
    pub fn resume(&self, effect: Effect<R, E, A>) {
        self.resumer.resume(effect.instr());
    }

    /// Resume the fiber with a value.
    pub fn succeed(&self, value: A) {
        self.resume(Effect::succeed(value));
    }

    /// Resume the fiber with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume(Effect::fail(error));
    }

    /// Resume the fiber with `exit`.
    pub fn done(&self, exit: Exit<E, A>) {
        self.resume(Effect::done(exit));
    }
}

/// What an `effect_async_interrupt` registration produced.
pub enum Registered<R, E, A> {
    /// The callback will fire later; the effect cancels the registration if
    /// the fiber is interrupted first.
    Pending(UIO<()>),
    /// The result was available right away.
    Ready(Effect<R, E, A>),
}

fn merge_release<E, A>(exit: Exit<E, A>, released: Exit<Never, ()>) -> Exit<E, A> {
    match released {
        Exit::Success(()) => exit,
        Exit::Failure(cause) => {
            let cause: Cause<E> = cause.map(|never| match never {});
            match exit {
                Exit::Success(_) => Exit::Failure(cause),
                Exit::Failure(first) => Exit::Failure(Cause::then(first, cause)),
            }
        }
    }
}

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    // ------------------------------------------------------------------
    // Interruptibility
    // ------------------------------------------------------------------

    pub(crate) fn with_interrupt_status(self, status: InterruptStatus) -> Self {
        Effect::from_build(move || self.instr().with_status(status))
    }

    /// Run this effect in an uninterruptible region.
    pub fn uninterruptible(self) -> Self {
        self.with_interrupt_status(InterruptStatus::Uninterruptible)
    }

    /// Run this effect in an interruptible region.
    pub fn interruptible(self) -> Self {
        self.with_interrupt_status(InterruptStatus::Interruptible)
    }

    /// Run the effect `f` builds in an uninterruptible region; `f` receives
    /// the capability to restore the caller's interruptibility for parts of
    /// it.
    pub fn uninterruptible_mask(
        f: impl Fn(InterruptStatusRestore) -> Effect<R, E, A> + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            Instr::CheckInterrupt(Box::new(move |status| {
                f(InterruptStatusRestore(status))
                    .instr()
                    .with_status(InterruptStatus::Uninterruptible)
            }))
        })
    }

    // ------------------------------------------------------------------
    // Brackets
    // ------------------------------------------------------------------

    /// Acquire with this effect, use, then release with the use's exit.
    ///
    /// Acquisition and release are uninterruptible; `use_` runs with the
    /// caller's interruptibility. A failing release is sequenced after the
    /// use's cause.
    pub fn bracket_exit<B: Data>(
        self,
        release: impl Fn(A, Exit<E, B>) -> Effect<R, Never, ()> + Send + Sync + 'static,
        use_: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        let release = Arc::new(release);
        let use_ = Arc::new(use_);
        Effect::uninterruptible_mask(move |restore| {
            let release = release.clone();
            let use_ = use_.clone();
            self.clone().flat_map(move |a: A| {
                let release = release.clone();
                restore
                    .restore(use_(a.clone()))
                    .to_exit()
                    .widen_err::<E>()
                    .flat_map(move |exit: Exit<E, B>| {
                        let exit_for_merge = exit.clone();
                        release(a.clone(), exit)
                            .to_exit()
                            .widen_err::<E>()
                            .flat_map(move |released| {
                                Effect::done(merge_release(exit_for_merge.clone(), released))
                            })
                    })
            })
        })
    }

    /// Acquire with this effect, use, then release.
    pub fn bracket<B: Data>(
        self,
        release: impl Fn(A) -> Effect<R, Never, ()> + Send + Sync + 'static,
        use_: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        self.bracket_exit(move |a, _| release(a), use_)
    }

    /// Run `cleanup` with this effect's exit, whatever it is.
    pub fn on_exit(
        self,
        cleanup: impl Fn(Exit<E, A>) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        Effect::<R, E, ()>::unit().bracket_exit(move |_, exit| cleanup(exit), move |_| self.clone())
    }

    /// Run `finalizer` after this effect, whatever its exit.
    pub fn ensuring(self, finalizer: Effect<R, Never, ()>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` if this effect is interrupted.
    pub fn on_interrupt(self, cleanup: Effect<R, Never, ()>) -> Self {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                cleanup.clone()
            } else {
                Effect::unit()
            }
        })
    }

    /// Run `cleanup` with the cause if this effect fails.
    pub fn on_error(
        self,
        cleanup: impl Fn(Cause<E>) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        self.on_exit(move |exit| match exit {
            Exit::Success(_) => Effect::unit(),
            Exit::Failure(cause) => cleanup(cause),
        })
    }

    // ------------------------------------------------------------------
    // Async
    // ------------------------------------------------------------------

    /// Suspend the fiber until `register`'s callback fires.
    pub fn effect_async(
        register: impl Fn(AsyncCallback<R, E, A>) + Send + Sync + 'static,
    ) -> Self {
        Self::effect_async_maybe(move |cb| {
            register(cb);
            None
        })
    }

    /// Like `effect_async`, but `register` may return the result right away,
    /// in which case the fiber continues without suspending.
    ///
    /// If the fiber is interrupted while `register` runs, the interruption
    /// wins and a returned effect is dropped without running. Results that
    /// own resources need an uninterruptible region around the call.
    pub fn effect_async_maybe(
        register: impl Fn(AsyncCallback<R, E, A>) -> Option<Effect<R, E, A>> + Send + Sync + 'static,
    ) -> Self {
        let register = Arc::new(register);
        Effect::from_build(move || {
            let register = register.clone();
            Instr::Async(
                Box::new(move |resumer: Resumer| {
                    register(AsyncCallback::new(resumer)).map(|effect| effect.instr())
                }),
                Vec::new(),
            )
        })
    }

    /// Like `effect_async`, but the registration can be cancelled: if the
    /// fiber is interrupted while suspended, the canceler from
    /// `Registered::Pending` runs.
    pub fn effect_async_interrupt(
        register: impl Fn(AsyncCallback<R, E, A>) -> Registered<R, E, A> + Send + Sync + 'static,
    ) -> Self {
        let register = Arc::new(register);
        Effect::suspend(move || {
            let canceler: Arc<Mutex<Option<UIO<()>>>> = Arc::new(Mutex::new(None));
            let slot = canceler.clone();
            let register = register.clone();
            let cancel: UIO<()> = Effect::suspend(move || {
                canceler.lock().take().unwrap_or_else(Effect::unit)
            });
            Effect::effect_async_maybe(move |cb| match register(cb) {
                Registered::Pending(on_cancel) => {
                    *slot.lock() = Some(on_cancel);
                    None
                }
                Registered::Ready(effect) => Some(effect),
            })
            .on_interrupt(cancel.widen_env())
        })
    }
}

impl<R: Data, E: Data> Effect<R, E, Clock> {
    pub(crate) fn clock() -> Self {
        Effect::from_build(|| with_fiber(|ctx| Instr::succeed(ctx.platform().clock().clone())))
    }
}

impl<R: Data, E: Data> Effect<R, E, ()> {
    /// Suspend the fiber for `duration` on the runtime's clock. Interrupting
    /// the sleep cancels its timer.
    pub fn sleep(duration: Duration) -> Self {
        Effect::<R, E, Clock>::clock().flat_map(move |clock: Clock| {
            Effect::effect_async_interrupt(move |cb: AsyncCallback<R, E, ()>| {
                let key = clock.schedule(duration, Box::new(move || cb.succeed(())));
                let clock = clock.clone();
                Registered::Pending(Effect::succeed_with(move || {
                    clock.cancel(key);
                }))
            })
        })
    }
}

impl<R: Data, E: Data> Effect<R, E, Duration> {
    /// The runtime clock's current time.
    pub fn current_time() -> Self {
        Effect::from_build(|| {
            with_fiber(|ctx| Instr::succeed(ctx.platform().clock().current_time()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClockMode, RuntimeConfig};
    use crate::fiber::FiberId;
    use crate::promise::Promise;
    use crate::runtime::Runtime;
    use crate::IO;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    #[test]
    fn test_bracket_releases_on_failure() {
        let rt = runtime();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let effect: IO<&str, i32> = Effect::succeed(1).bracket(
            move |_| {
                let flag = flag.clone();
                Effect::succeed_with(move || flag.store(true, Ordering::SeqCst))
            },
            |_| Effect::fail("use failed"),
        );
        assert_eq!(rt.run_sync_exit(effect), Exit::fail("use failed"));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_release_defect_is_sequenced_after_use_failure() {
        let rt = runtime();
        let effect: IO<&str, i32> = Effect::succeed(1).bracket(
            |_| Effect::die_message("release broke"),
            |_| Effect::fail("use failed"),
        );
        let cause = rt.run_sync_exit(effect).cause().cloned().unwrap();
        assert_eq!(
            cause,
            Cause::then(Cause::fail("use failed"), Cause::die_message("release broke"))
        );
    }

    #[test]
    fn test_ensuring_runs_on_interrupt() {
        let rt = runtime();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let started = Promise::<Never, ()>::new();
        let body: UIO<()> = started
            .succeed(())
            .zip_right(Effect::never())
            .ensuring(Effect::succeed_with(move || flag.store(true, Ordering::SeqCst)));
        let effect: UIO<bool> = body
            .fork()
            .zip_left(started.await_())
            .flat_map(|fiber| fiber.interrupt())
            .map(|exit| exit.is_interrupted());
        assert!(rt.run_sync(effect).unwrap());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_uninterruptible_region_finishes() {
        let rt = runtime();
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let started = Promise::<Never, ()>::new();
        let body: UIO<()> = started
            .succeed(())
            .zip_right(Effect::<(), Never, ()>::sleep(Duration::from_millis(50)))
            .zip_right(Effect::succeed_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .uninterruptible();
        let effect: UIO<Exit<Never, ()>> = body
            .fork()
            .zip_left(started.await_())
            .flat_map(|fiber| fiber.interrupt());
        let exit = rt.run_sync(effect).unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_mask_restore_allows_interruption() {
        let rt = runtime();
        let body: UIO<InterruptStatus> = Effect::uninterruptible_mask(|restore| {
            Effect::check_interruptible().zip_right(restore.restore(Effect::check_interruptible()))
        });
        assert!(rt.run_sync(body).unwrap().is_interruptible());

        let inside: UIO<InterruptStatus> =
            Effect::uninterruptible_mask(|_| Effect::check_interruptible());
        assert!(!rt.run_sync(inside).unwrap().is_interruptible());
    }

    #[test]
    fn test_effect_async_resumes_from_another_thread() {
        let rt = runtime();
        let effect: IO<String, u32> = Effect::effect_async(|cb: AsyncCallback<(), String, u32>| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                cb.succeed(9);
                cb.succeed(10);
            });
        });
        assert_eq!(rt.run_sync(effect).unwrap(), 9);
    }

    #[test]
    fn test_effect_async_maybe_ready() {
        let rt = runtime();
        let effect: UIO<u8> = Effect::effect_async_maybe(|_| Some(Effect::succeed(4)));
        assert_eq!(rt.run_sync(effect).unwrap(), 4);
    }

    #[test]
    fn test_effect_async_maybe_result_dropped_when_interrupted_during_register() {
        let rt = runtime();
        let registered = Arc::new(AtomicUsize::new(0));
        let continued = Arc::new(AtomicBool::new(false));
        let count = registered.clone();
        let flag = continued.clone();
        let effect: UIO<i32> = Effect::from_build(move || {
            let count = count.clone();
            with_fiber(move |ctx| {
                let ctx = ctx.clone();
                Instr::Async(
                    Box::new(move |_resumer| {
                        count.fetch_add(1, Ordering::SeqCst);
                        ctx.kill(FiberId::none());
                        Some(Instr::succeed(7i32))
                    }),
                    Vec::new(),
                )
            })
        })
        .map(move |n| {
            flag.store(true, Ordering::SeqCst);
            n
        });
        assert!(rt.run_sync_exit(effect).is_interrupted());
        assert_eq!(registered.load(Ordering::SeqCst), 1);
        assert!(!continued.load(Ordering::SeqCst));
    }

    #[test]
    fn test_effect_async_interrupt_runs_canceler() {
        let rt = runtime();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let registered = Promise::<Never, ()>::new();
        let latch = registered.clone();
        let waiting: UIO<()> = Effect::effect_async_interrupt(move |_cb| {
            latch.try_complete(Exit::succeed(()));
            let flag = flag.clone();
            Registered::Pending(Effect::succeed_with(move || flag.store(true, Ordering::SeqCst)))
        });
        let effect = waiting
            .fork()
            .zip_left(registered.await_())
            .flat_map(|fiber| fiber.interrupt());
        assert!(rt.run_sync(effect).unwrap().is_interrupted());
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sleep_on_test_clock() {
        let rt = Runtime::new(
            RuntimeConfig::builder()
                .num_workers(1)
                .clock(ClockMode::Test)
                .build_unchecked(),
        )
        .unwrap();
        let clock = rt.test_clock().unwrap();
        let fiber = rt.fork_detached(
            Effect::<(), Never, ()>::sleep(Duration::from_secs(3600))
                .zip_right(Effect::<(), Never, Duration>::current_time()),
        );
        while clock.pending_sleeps() == 0 {
            std::thread::yield_now();
        }
        clock.adjust(Duration::from_secs(3600));
        let exit = rt.run_sync(fiber.join()).unwrap();
        assert_eq!(exit, Duration::from_secs(3600));
    }
}
