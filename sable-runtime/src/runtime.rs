//! # Runtime
//!
//! Owns the worker pool, the clock and the registry of live fibers, and
//! drives effects from ordinary Rust code.
//!
//! ## Drivers
//!
//! - `run_sync` / `run_sync_exit`: block the calling thread
//! - `run_async` / `run_async_cancel`: callback on completion
//! - `run_promise` / `run_promise_exit`: a `std::future::Future`
//! - `run_main`: a whole program, with signal handling and exit codes
//! - `fork_detached`: a `Fiber` handle
//!
//! Every fiber carries an `Arc<Platform>`; there is no global runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{Runtime, RuntimeConfig, UIO};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! assert_eq!(runtime.run_sync(UIO::succeed(1).map(|n| n + 1))?, 2);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::cause::Defect;
use crate::clock::{Clock, LiveClock, TestClock};
use crate::config::{ClockMode, ConfigError, RuntimeConfig};
use crate::effect::instr::{restore_exit, ErasedExit};
use crate::effect::{Data, IO};
use crate::exit::{Exit, FiberFailure};
use crate::fiber::{Fiber, FiberId};
use crate::fiber_ref::FiberRefs;
use crate::interpreter::{FiberContext, Observer};
use crate::scheduler::{Scheduler, Task};
use crate::{log, panic, signal};

/// How often `run_main` checks for a shutdown signal.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reported when a driven fiber is dropped without an exit, either because
/// the runtime shut down or because nothing can ever resume it.
const ABANDONED: &str = "fiber was abandoned before it finished";

/// Errors raised while building or running the runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A runtime thread could not be started.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Thread name.
        name: String,
        /// The underlying OS error.
        source: io::Error,
    },
}

// ============================================================================
// Platform
// ============================================================================

/// Shared services every fiber of a runtime reaches through its context.
pub(crate) struct Platform {
    config: RuntimeConfig,
    scheduler: Scheduler,
    clock: Clock,
    fibers: Mutex<HashMap<FiberId, Weak<FiberContext>>>,
}

impl Platform {
    pub(crate) fn submit(&self, task: Task) {
        self.scheduler.submit(task);
    }

    pub(crate) fn yield_op_count(&self) -> usize {
        self.config.scheduler.yield_op_count
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn report_unhandled(&self) -> bool {
        self.config.log.report_unhandled
    }

    pub(crate) fn register(&self, fiber: &Arc<FiberContext>) {
        self.fibers.lock().insert(fiber.id(), Arc::downgrade(fiber));
    }

    pub(crate) fn unregister(&self, id: FiberId) {
        self.fibers.lock().remove(&id);
    }

    fn live_fibers(&self) -> Vec<FiberId> {
        let mut ids: Vec<FiberId> = self
            .fibers
            .lock()
            .iter()
            .filter(|(_, fiber)| fiber.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// An effect runtime: a worker pool, a clock and the fibers running on them.
///
/// Dropping the runtime stops its threads. Fibers still running at that
/// point never finish; blocked `run_sync` callers observe a defect.
pub struct Runtime {
    platform: Arc<Platform>,
}

impl Runtime {
    /// Start a runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        panic::install_panic_hook();

        let scheduler = Scheduler::new(&config.scheduler)?;
        let clock = match config.clock {
            ClockMode::Live => Clock::Live(LiveClock::start()?),
            ClockMode::Test => Clock::Test(TestClock::new()),
        };

        tracing::debug!(
            workers = config.scheduler.num_workers,
            clock = ?config.clock,
            "runtime started"
        );
        Ok(Self {
            platform: Arc::new(Platform {
                config,
                scheduler,
                clock,
                fibers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start a runtime configured from `SABLE_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.platform.config
    }

    /// The manual clock, when the runtime was built with `ClockMode::Test`.
    pub fn test_clock(&self) -> Option<TestClock> {
        match &self.platform.clock {
            Clock::Test(clock) => Some(clock.clone()),
            Clock::Live(_) => None,
        }
    }

    /// Ids of the fibers currently running, sorted.
    pub fn live_fibers(&self) -> Vec<FiberId> {
        self.platform.live_fibers()
    }

    /// Stop the worker pool and the timer thread. Idempotent.
    pub fn shutdown(&self) {
        self.platform.scheduler.shutdown();
        self.platform.clock.shutdown();
    }

    fn spawn_root<E: Data, A: Data>(
        &self,
        effect: IO<E, A>,
        observer: Option<Observer>,
    ) -> Arc<FiberContext> {
        let ctx = FiberContext::new(
            self.platform.clone(),
            FiberRefs::default(),
            Arc::new(()),
            true,
        );
        self.platform.register(&ctx);
        if let Some(observer) = observer {
            ctx.observe(observer);
        }
        ctx.evaluate_later(effect.instr());
        ctx
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    /// Start `effect` on a new root fiber and return its handle.
    pub fn fork_detached<E: Data, A: Data>(&self, effect: IO<E, A>) -> Fiber<E, A> {
        Fiber::new(self.spawn_root(effect, None))
    }

    /// Start `effect` and call `callback` with its exit.
    pub fn run_async<E: Data, A: Data>(
        &self,
        effect: IO<E, A>,
        callback: impl FnOnce(Exit<E, A>) + Send + 'static,
    ) {
        self.run_async_cancel(effect, callback);
    }

    /// Like `run_async`, returning a handle that can interrupt the fiber.
    pub fn run_async_cancel<E: Data, A: Data>(
        &self,
        effect: IO<E, A>,
        callback: impl FnOnce(Exit<E, A>) + Send + 'static,
    ) -> CancelHandle {
        let observer: Observer =
            Box::new(move |exit: &ErasedExit| callback(restore_exit(exit.clone())));
        CancelHandle {
            ctx: self.spawn_root(effect, Some(observer)),
        }
    }

    /// Run `effect`, blocking the calling thread until it exits.
    ///
    /// Must not be called from a fiber of this runtime. A fiber that can
    /// never be resumed (nothing holds its callback) exits with a defect
    /// instead of blocking forever.
    pub fn run_sync_exit<E: Data, A: Data>(&self, effect: IO<E, A>) -> Exit<E, A> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.run_async(effect, move |exit| {
            let _ = tx.send(exit);
        });
        match rx.recv() {
            Ok(exit) => exit,
            Err(_) => Exit::die(Defect::new(ABANDONED)),
        }
    }

    /// Run `effect`, blocking until it exits, and surface a failure as a
    /// `FiberFailure`.
    pub fn run_sync<E: Data, A: Data>(&self, effect: IO<E, A>) -> Result<A, FiberFailure<E>> {
        self.run_sync_exit(effect).into_result().map_err(FiberFailure::new)
    }

    /// Run `effect` as a future resolving to its exit.
    pub fn run_promise_exit<E: Data, A: Data>(&self, effect: IO<E, A>) -> ExitFuture<E, A> {
        let slot = Arc::new(Mutex::new(ExitSlot {
            exit: None,
            waker: None,
        }));
        let completer = Completer {
            slot: Some(slot.clone()),
        };
        self.run_async(effect, move |exit| completer.complete(exit));
        ExitFuture { slot }
    }

    /// Run `effect` as a future of its result.
    pub fn run_promise<E: Data, A: Data>(
        &self,
        effect: IO<E, A>,
    ) -> impl Future<Output = Result<A, FiberFailure<E>>> + Send + 'static {
        let exit = self.run_promise_exit(effect);
        async move { exit.await.into_result().map_err(FiberFailure::new) }
    }

    /// Run `effect` as the program's main fiber.
    ///
    /// Installs the log subscriber and the SIGINT/SIGTERM handlers from the
    /// configuration. A shutdown signal interrupts the main fiber. Success
    /// maps to exit code 0, interruption alone to 130, anything else is
    /// logged and maps to 1.
    pub fn run_main<E: Data + fmt::Debug, A: Data>(&self, effect: IO<E, A>) -> ExitCode {
        log::init(&self.platform.config.log);
        signal::install(&self.platform.config.signals);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let main = self.run_async_cancel(effect, move |exit| {
            let _ = tx.send(exit);
        });

        let exit = loop {
            match rx.recv_timeout(SIGNAL_POLL_INTERVAL) {
                Ok(exit) => break exit,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if let Some(sig) = signal::take_shutdown_request() {
                        tracing::debug!(signal = ?sig, fiber = %main.id(), "interrupting main fiber");
                        main.cancel();
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    break Exit::die(Defect::new(ABANDONED))
                }
            }
        };

        match exit {
            Exit::Success(_) => ExitCode::SUCCESS,
            Exit::Failure(cause) if cause.interrupted_only() => ExitCode::from(130),
            Exit::Failure(cause) => {
                tracing::error!("main fiber failed:\n{}", cause.pretty());
                ExitCode::FAILURE
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheduler = &self.platform.scheduler;
        f.debug_struct("Runtime")
            .field("workers", &scheduler.num_workers())
            .field("active_workers", &scheduler.active_workers())
            .field("shut_down", &scheduler.is_shutting_down())
            .field("clock", &self.platform.clock)
            .field("live_fibers", &self.platform.fibers.lock().len())
            .finish()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Interrupts a fiber started with `run_async_cancel`.
pub struct CancelHandle {
    ctx: Arc<FiberContext>,
}

impl CancelHandle {
    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.ctx.id()
    }

    /// Request interruption. The callback still runs, with the
    /// interrupted exit.
    pub fn cancel(&self) {
        self.ctx.kill(FiberId::none());
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").field("fiber", &self.id()).finish()
    }
}

struct ExitSlot<E, A> {
    exit: Option<Exit<E, A>>,
    waker: Option<Waker>,
}

/// Fills the slot once. Dropped unused, it fills the slot with a defect so
/// the future still resolves.
struct Completer<E, A> {
    slot: Option<Arc<Mutex<ExitSlot<E, A>>>>,
}

impl<E, A> Completer<E, A> {
    fn complete(mut self, exit: Exit<E, A>) {
        self.fill(exit);
    }

    fn fill(&mut self, exit: Exit<E, A>) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let waker = {
            let mut slot = slot.lock();
            slot.exit = Some(exit);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<E, A> Drop for Completer<E, A> {
    fn drop(&mut self) {
        self.fill(Exit::die(Defect::new(ABANDONED)));
    }
}

/// Future returned by `Runtime::run_promise_exit`.
pub struct ExitFuture<E, A> {
    slot: Arc<Mutex<ExitSlot<E, A>>>,
}

impl<E, A> Future for ExitFuture<E, A> {
    type Output = Exit<E, A>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match slot.exit.take() {
            Some(exit) => Poll::Ready(exit),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<E, A> fmt::Debug for ExitFuture<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = self.slot.lock().exit.is_some();
        f.debug_struct("ExitFuture").field("ready", &ready).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Cause;
    use crate::effect::{Effect, Never, UIO};
    use crate::promise::Promise;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert!(matches!(Runtime::new(config), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_run_sync_success_and_failure() {
        let rt = runtime();
        assert_eq!(rt.run_sync(UIO::succeed(5)).unwrap(), 5);
        let failure = rt.run_sync(IO::<&str, ()>::fail("bad")).unwrap_err();
        assert_eq!(failure.cause(), &Cause::fail("bad"));
    }

    #[test]
    fn test_run_async_delivers_exit() {
        let rt = runtime();
        let (tx, rx) = crossbeam_channel::bounded(1);
        rt.run_async(UIO::succeed("done"), move |exit| {
            tx.send(exit).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), Exit::succeed("done"));
    }

    #[test]
    fn test_cancel_handle_interrupts() {
        let rt = runtime();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = rt.run_async_cancel(UIO::<()>::never(), move |exit| {
            tx.send(exit).unwrap();
        });
        handle.cancel();
        let exit = rx.recv().unwrap();
        assert_eq!(exit, Exit::interrupt(FiberId::none()));
    }

    #[test]
    fn test_run_promise() {
        let rt = runtime();
        let value = futures::executor::block_on(rt.run_promise(UIO::succeed(3).map(|n| n * 3)));
        assert_eq!(value.unwrap(), 9);
        let exit = futures::executor::block_on(rt.run_promise_exit(IO::<u8, ()>::fail(1)));
        assert_eq!(exit, Exit::fail(1));
    }

    #[test]
    fn test_live_fibers_tracks_running() {
        let rt = runtime();
        let gate = Promise::<Never, ()>::new();
        let fiber = rt.fork_detached(gate.await_());
        assert!(rt.live_fibers().contains(&fiber.id()));
        gate.try_complete(Exit::succeed(()));
        rt.run_sync(fiber.join()).unwrap();
        assert!(!rt.live_fibers().contains(&fiber.id()));
    }

    #[test]
    fn test_test_clock_drives_sleep() {
        let rt = Runtime::new(
            RuntimeConfig::builder()
                .num_workers(1)
                .clock(ClockMode::Test)
                .build_unchecked(),
        )
        .unwrap();
        let clock = rt.test_clock().unwrap();
        let sleeper: UIO<Duration> =
            UIO::<()>::sleep(Duration::from_secs(60)).zip_right(Effect::current_time());
        let fiber = rt.fork_detached(sleeper);
        while clock.pending_sleeps() == 0 {
            std::thread::yield_now();
        }
        clock.adjust(Duration::from_secs(60));
        assert_eq!(rt.run_sync(fiber.join()).unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_debug_reports_scheduler_state() {
        let rt = runtime();
        let running = format!("{:?}", rt);
        assert!(running.contains("workers: 2"));
        assert!(running.contains("shut_down: false"));
        rt.shutdown();
        let stopped = format!("{:?}", rt);
        assert!(stopped.contains("active_workers: 0"));
        assert!(stopped.contains("shut_down: true"));
    }

    #[test]
    fn test_shutdown_resolves_pending_run() {
        let rt = runtime();
        let exit = rt.run_promise_exit(UIO::<()>::never());
        rt.shutdown();
        drop(rt);
        let exit = futures::executor::block_on(exit);
        assert!(exit.cause().is_some_and(|cause| cause.died()));
    }
}
