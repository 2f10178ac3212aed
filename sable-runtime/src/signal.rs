//! Signal Handling
//!
//! SIGINT/SIGTERM handling for `Runtime::run_main`: a received signal is
//! recorded in atomics and the driver thread polls for it, interrupting the
//! main fiber.
//!
//! # Platform Support
//!
//! - **Unix**: SIGTERM and SIGINT through `nix`
//! - **Other**: no handlers are installed; `request_shutdown` still works
//!
//! # Usage
//!
//! ```rust,ignore
//! use sable_runtime::signal;
//!
//! signal::install(&config.signals);
//! if let Some(sig) = signal::take_shutdown_request() {
//!     // interrupt the main fiber
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::SignalConfig;

/// Signal types that can be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// No signal received.
    None = 0,
    /// SIGTERM - termination request.
    Term = 1,
    /// SIGINT - interrupt (Ctrl+C).
    Int = 2,
}

impl Signal {
    /// Convert from u8.
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Signal::Term,
            2 => Signal::Int,
            _ => Signal::None,
        }
    }

    /// Check if this is a shutdown signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Signal::Term | Signal::Int)
    }
}

/// Set by the handler, cleared by `take_shutdown_request`.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last received signal.
static LAST_SIGNAL: AtomicU8 = AtomicU8::new(0);

/// Signal count (for detecting repeated signals).
static SIGNAL_COUNT: AtomicU8 = AtomicU8::new(0);

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install handlers for the signals enabled in `config`.
///
/// Returns true if handlers were installed, false if already installed or
/// nothing was enabled.
pub fn install(config: &SignalConfig) -> bool {
    if !config.handle_sigint && !config.handle_sigterm {
        return false;
    }
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    #[cfg(unix)]
    install_unix_handlers(config);

    tracing::debug!(
        sigint = config.handle_sigint,
        sigterm = config.handle_sigterm,
        "signal handlers installed"
    );
    true
}

#[cfg(unix)]
fn install_unix_handlers(config: &SignalConfig) {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal as NixSignal};

    let action = SigAction::new(
        SigHandler::Handler(signal_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // SAFETY: the handler only touches atomics, which is async-signal-safe.
    unsafe {
        if config.handle_sigterm {
            if let Err(err) = signal::sigaction(NixSignal::SIGTERM, &action) {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
            }
        }
        if config.handle_sigint {
            if let Err(err) = signal::sigaction(NixSignal::SIGINT, &action) {
                tracing::warn!(error = %err, "failed to install SIGINT handler");
            }
        }
    }
}

/// Record a received signal.
fn handle_signal(signal: Signal) {
    LAST_SIGNAL.store(signal as u8, Ordering::SeqCst);
    SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
    if signal.is_shutdown() {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }
}

/// Unix signal handler function.
///
/// This must be async-signal-safe, so we only set atomic flags.
#[cfg(unix)]
extern "C" fn signal_handler(sig: i32) {
    let signal = match sig {
        15 => Signal::Term,
        2 => Signal::Int,
        _ => Signal::None,
    };
    handle_signal(signal);
}

/// Check if shutdown has been requested.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Consume a pending shutdown request, returning the signal behind it.
pub fn take_shutdown_request() -> Option<Signal> {
    if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
        Some(last_signal())
    } else {
        None
    }
}

/// Get the last received signal.
pub fn last_signal() -> Signal {
    Signal::from_u8(LAST_SIGNAL.load(Ordering::SeqCst))
}

/// Get the number of signals received.
pub fn signal_count() -> u8 {
    SIGNAL_COUNT.load(Ordering::SeqCst)
}

/// Request shutdown programmatically, as if SIGTERM had arrived.
pub fn request_shutdown() {
    handle_signal(Signal::Term);
}

/// Reset the recorded state.
pub fn reset() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    LAST_SIGNAL.store(0, Ordering::SeqCst);
    SIGNAL_COUNT.store(0, Ordering::SeqCst);
}
