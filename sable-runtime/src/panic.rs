//! Panic Capture
//!
//! User closures run inside the interpreter loop. A panic in one of them must
//! never unwind through a worker thread; it becomes a `Die` defect in the
//! fiber's cause instead.
//!
//! # Features
//!
//! - **catch_panic**: run a closure, turning a panic into a `Defect`
//! - **Panic hook**: while a fiber closure runs, the hook records the panic
//!   location and backtrace for the defect and logs through `tracing`
//!   instead of printing to stderr. Panics elsewhere go to the previous hook.
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::panic::catch_panic;
//!
//! let result = catch_panic(|| panic!("oops"));
//! assert_eq!(result.unwrap_err().message(), "oops");
//! ```

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::cause::Defect;

/// Counter for panics caught inside fibers.
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Whether the fiber-aware hook is installed.
static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Depth of nested `catch_panic` calls on this thread.
    static CATCH_DEPTH: Cell<usize> = const { Cell::new(0) };

    /// Location and backtrace recorded by the hook for the pending panic.
    static LAST_PANIC: RefCell<Option<(Option<String>, Option<String>)>> = const { RefCell::new(None) };
}

/// Install the fiber-aware panic hook.
///
/// Returns `false` if it was already installed.
pub fn install_panic_hook() -> bool {
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if CATCH_DEPTH.with(|d| d.get()) > 0 {
            record_panic(info);
        } else {
            previous(info);
        }
    }));
    true
}

fn record_panic(info: &PanicHookInfo<'_>) {
    let location = info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
    let backtrace = capture_backtrace();

    tracing::debug!(
        location = location.as_deref().unwrap_or("<unknown>"),
        "panic inside fiber: {}",
        payload_message(info.payload())
    );

    LAST_PANIC.with(|slot| *slot.borrow_mut() = Some((location, backtrace)));
}

/// Capture a backtrace if `RUST_BACKTRACE` enables it.
pub fn capture_backtrace() -> Option<String> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(bt.to_string()),
        _ => None,
    }
}

/// Number of panics turned into defects so far.
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::SeqCst)
}

/// Extract the message from a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        CATCH_DEPTH.with(|d| d.set(d.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CATCH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Run `f`, turning a panic into a `Defect`.
///
/// The closure is treated as unwind-safe: a fiber that panicked is finished
/// with the defect and its state is never observed again.
pub fn catch_panic<F, R>(f: F) -> Result<R, Defect>
where
    F: FnOnce() -> R,
{
    let result = {
        let _depth = DepthGuard::enter();
        panic::catch_unwind(AssertUnwindSafe(f))
    };

    result.map_err(|payload| {
        PANIC_COUNT.fetch_add(1, Ordering::SeqCst);
        let message = payload_message(payload.as_ref());
        let (location, backtrace) = LAST_PANIC
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or((None, None));
        Defect::with_details(message, location, backtrace)
    })
}
