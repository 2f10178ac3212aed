//! Finalizer registry backing `Managed` scopes.
//!
//! A map is `Open` until `release_all` starts, `Closing` while its
//! finalizers run, then `Closed` with the exit it was closed with.
//! Finalizers added once the map left `Open` run immediately with that exit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Effect, Never, UIO};
use crate::exit::{Exit, ScopeExit};
use crate::promise::Promise;

/// Release action run with the exit of the scope that owns it.
#[derive(Clone)]
pub struct Finalizer(Arc<dyn Fn(ScopeExit) -> UIO<()> + Send + Sync>);

impl Finalizer {
    /// Wrap a release action.
    pub fn new(f: impl Fn(ScopeExit) -> UIO<()> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A finalizer that does nothing.
    pub fn noop() -> Self {
        Self::new(|_| Effect::unit())
    }

    /// The release effect for `exit`.
    pub fn run(&self, exit: ScopeExit) -> UIO<()> {
        (self.0)(exit)
    }

    /// Run `self`, then `next`, whatever the first one's exit. Failures of
    /// both are kept.
    pub fn and_then(self, next: Finalizer) -> Finalizer {
        Finalizer::new(move |exit: ScopeExit| {
            let next = next.clone();
            let second_exit = exit.clone();
            self.run(exit).to_exit().flat_map(move |first| {
                next.run(second_exit.clone())
                    .to_exit()
                    .flat_map(move |second| Effect::done(merge(first.clone(), second, Cause::then)))
            })
        })
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Finalizer")
    }
}

/// How `release_all` runs the finalizers it collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One at a time, most recently added first.
    Sequential,
    /// All at once.
    Parallel,
    /// At most `n` at once.
    ParallelN(usize),
}

enum State {
    Open {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Closing {
        exit: ScopeExit,
        released: Promise<Never, ()>,
    },
    Closed(ScopeExit),
}

/// A registry of finalizers keyed by insertion order.
#[derive(Clone)]
pub struct ReleaseMap {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for ReleaseMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            State::Open { finalizers, .. } => f
                .debug_struct("ReleaseMap")
                .field("open", &true)
                .field("finalizers", &finalizers.len())
                .finish(),
            State::Closing { exit, .. } => f
                .debug_struct("ReleaseMap")
                .field("open", &false)
                .field("closing", &true)
                .field("exit", exit)
                .finish(),
            State::Closed(exit) => f
                .debug_struct("ReleaseMap")
                .field("open", &false)
                .field("exit", exit)
                .finish(),
        }
    }
}

impl Default for ReleaseMap {
    fn default() -> Self {
        Self::new()
    }
}

enum Added {
    Key(u64),
    RunNow(Finalizer, ScopeExit),
}

impl ReleaseMap {
    /// An empty, open map.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Open {
                next_key: 0,
                finalizers: BTreeMap::new(),
            })),
        }
    }

    /// Create a map inside an effect.
    pub fn make() -> UIO<ReleaseMap> {
        Effect::succeed_with(ReleaseMap::new)
    }

    /// Register `finalizer`, returning its key. On a closing or closed map
    /// the finalizer runs right away with the closing exit and `None` is
    /// returned.
    pub fn add_if_open(&self, finalizer: Finalizer) -> UIO<Option<u64>> {
        let this = self.clone();
        Effect::suspend(move || {
            let added = {
                let mut state = this.state.lock();
                match &mut *state {
                    State::Open {
                        next_key,
                        finalizers,
                    } => {
                        let key = *next_key;
                        *next_key += 1;
                        finalizers.insert(key, finalizer.clone());
                        Added::Key(key)
                    }
                    State::Closing { exit, .. } | State::Closed(exit) => {
                        Added::RunNow(finalizer.clone(), exit.clone())
                    }
                }
            };
            match added {
                Added::Key(key) => Effect::succeed(Some(key)),
                Added::RunNow(finalizer, exit) => finalizer.run(exit).as_(None),
            }
        })
    }

    /// Register `finalizer`, returning a finalizer that releases it early.
    /// On a closed map the finalizer runs right away and a no-op is
    /// returned.
    pub fn add(&self, finalizer: Finalizer) -> UIO<Finalizer> {
        let this = self.clone();
        self.add_if_open(finalizer).map(move |key| match key {
            Some(key) => {
                let this = this.clone();
                Finalizer::new(move |exit| this.release(key, exit))
            }
            None => Finalizer::noop(),
        })
    }

    /// Remove the finalizer under `key` and run it with `exit`. Does
    /// nothing if it is gone.
    pub fn release(&self, key: u64, exit: ScopeExit) -> UIO<()> {
        let this = self.clone();
        Effect::suspend(move || match this.take(key) {
            Some(finalizer) => finalizer.run(exit.clone()),
            None => Effect::unit(),
        })
    }

    fn take(&self, key: u64) -> Option<Finalizer> {
        match &mut *self.state.lock() {
            State::Open { finalizers, .. } => finalizers.remove(&key),
            State::Closing { .. } | State::Closed(_) => None,
        }
    }

    /// Close the map and run every finalizer with `exit`. Finalizer
    /// failures are merged with `Both` into the result. While another
    /// `release_all` is still running its finalizers this waits for it; on a
    /// closed map it does nothing.
    pub fn release_all(&self, exit: ScopeExit, strategy: ExecutionStrategy) -> UIO<()> {
        let this = self.clone();
        Effect::suspend(move || {
            let released = Promise::<Never, ()>::new();
            let finalizers = {
                let mut state = this.state.lock();
                let closing = State::Closing {
                    exit: exit.clone(),
                    released: released.clone(),
                };
                match std::mem::replace(&mut *state, closing) {
                    State::Open { finalizers, .. } => finalizers,
                    State::Closing { exit, released } => {
                        let pending = released.await_();
                        *state = State::Closing { exit, released };
                        return pending;
                    }
                    closed @ State::Closed(_) => {
                        *state = closed;
                        return Effect::unit();
                    }
                }
            };
            tracing::trace!(count = finalizers.len(), ?strategy, "releasing scope");

            let finish = {
                let (this, exit) = (this.clone(), exit.clone());
                Effect::succeed_with(move || {
                    *this.state.lock() = State::Closed(exit.clone());
                    released.try_complete(Exit::succeed(()));
                })
            };

            // Newest first.
            let ordered: Vec<Finalizer> = finalizers.into_values().rev().collect();
            let exit = exit.clone();
            let run = move |finalizer: Finalizer| finalizer.run(exit.clone()).to_exit();
            let exits = match strategy {
                ExecutionStrategy::Sequential => Effect::foreach(ordered, run),
                ExecutionStrategy::Parallel => Effect::foreach_par(ordered, run),
                ExecutionStrategy::ParallelN(n) => Effect::foreach_par_n(n, ordered, run),
            };
            exits
                .flat_map(|exits: Vec<Exit<Never, ()>>| {
                    Effect::done(
                        exits
                            .into_iter()
                            .fold(Exit::succeed(()), |acc, exit| merge(acc, exit, Cause::both)),
                    )
                })
                .ensuring(finish)
        })
    }

    /// Swap the finalizer under `key` for `finalizer`, returning the old
    /// one. On a closing or closed map `finalizer` runs right away.
    pub fn replace(&self, key: u64, finalizer: Finalizer) -> UIO<Option<Finalizer>> {
        let this = self.clone();
        Effect::suspend(move || {
            let mut state = this.state.lock();
            match &mut *state {
                State::Open { finalizers, .. } => {
                    Effect::succeed(finalizers.insert(key, finalizer.clone()))
                }
                State::Closing { exit, .. } | State::Closed(exit) => {
                    let exit = exit.clone();
                    drop(state);
                    finalizer.run(exit).as_(None)
                }
            }
        })
    }

    /// Unregister the finalizer under `key` without running it.
    pub fn remove(&self, key: u64) -> UIO<Option<Finalizer>> {
        let this = self.clone();
        Effect::succeed_with(move || this.take(key))
    }

    /// Number of registered finalizers.
    pub fn size(&self) -> UIO<usize> {
        let this = self.clone();
        Effect::succeed_with(move || match &*this.state.lock() {
            State::Open { finalizers, .. } => finalizers.len(),
            State::Closing { .. } | State::Closed(_) => 0,
        })
    }

    /// Whether `release_all` has started and its finalizers are still
    /// running.
    pub fn is_closing(&self) -> bool {
        matches!(&*self.state.lock(), State::Closing { .. })
    }

    /// Whether `release_all` has run to completion.
    pub fn is_closed(&self) -> bool {
        matches!(&*self.state.lock(), State::Closed(_))
    }
}

fn merge(
    first: Exit<Never, ()>,
    second: Exit<Never, ()>,
    combine: fn(Cause<Never>, Cause<Never>) -> Cause<Never>,
) -> Exit<Never, ()> {
    match (first, second) {
        (Exit::Success(()), Exit::Success(())) => Exit::succeed(()),
        (Exit::Failure(cause), Exit::Success(())) | (Exit::Success(()), Exit::Failure(cause)) => {
            Exit::Failure(cause)
        }
        (Exit::Failure(left), Exit::Failure(right)) => Exit::Failure(combine(left, right)),
    }
}
