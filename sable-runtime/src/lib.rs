//! # Sable Runtime
//!
//! A fiber-based runtime for typed, composable effects:
//!
//! - **Effects**: immutable descriptions of computations with an
//!   environment `R`, a typed error `E` and a value `A`
//! - **Fibers**: cooperatively scheduled on a work-stealing pool, with
//!   structured supervision and asynchronous interruption
//! - **Causes**: every way a fiber can end abnormally, kept whole across
//!   sequential and parallel composition
//! - **Resources**: `bracket`, `Managed` and `ReleaseMap` guarantee paired
//!   acquire/release on every exit path
//! - **Coordination**: `Promise`, `Ref`, `RefM`, `Semaphore`, `Queue`,
//!   `FiberRef` and `ProcessMap`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SABLE RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │   Managed    │  │  Primitives  │          │
//! │  │  (effect/)   │  │  (managed/)  │  │ (queue/, ..) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Interpreter  │  │  Scheduler   │  │    Clock     │          │
//! │  │(interpreter) │  │ (scheduler)  │  │  (clock.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{Runtime, RuntimeConfig, IO};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let answer = runtime.run_sync(IO::<String, u32>::succeed(21).map(|n| n * 2))?;
//! assert_eq!(answer, 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod clock;
pub mod config;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub(crate) mod interpreter;
pub mod log;
pub mod managed;
pub mod panic;
pub mod process_map;
pub mod promise;
pub mod queue;
pub mod ref_m;
pub mod reference;
pub mod runtime;
pub(crate) mod scheduler;
pub mod semaphore;
pub mod signal;

// Re-exports
pub use cause::{Cause, Defect};
pub use clock::{Clock, TestClock};
pub use config::{ClockMode, ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use effect::{
    AsyncCallback, Data, Effect, Either, InterruptStatusRestore, Never, Registered, IO, UIO, URIO,
};
pub use exit::{Exit, FiberFailure, ScopeExit};
pub use fiber::{Descriptor, Fiber, FiberId, FiberStatus, ForkScope, InterruptStatus};
pub use fiber_ref::FiberRef;
pub use managed::{ExecutionStrategy, Finalizer, Managed, ReleaseMap, Reservation};
pub use process_map::ProcessMap;
pub use promise::Promise;
pub use queue::Queue;
pub use ref_m::RefM;
pub use reference::Ref;
pub use runtime::{CancelHandle, ExitFuture, Runtime, RuntimeError};
pub use semaphore::Semaphore;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_reexports_compose() {
        let runtime = Runtime::new(RuntimeConfig::builder().num_workers(1).build_unchecked())
            .unwrap();
        let effect = IO::<String, u32>::succeed(21).map(|n| n * 2);
        assert_eq!(runtime.run_sync(effect).unwrap(), 42);
    }
}
