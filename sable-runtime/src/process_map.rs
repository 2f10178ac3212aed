//! # ProcessMap
//!
//! A registry of daemon fibers keyed by identity: at most one live fiber per
//! key.
//!
//! A fiber forked under a key owns the entry until it finishes, whatever
//! its exit. The entry is removed by the fiber's own completion callback,
//! and only while it still names that fiber, so a finished fiber never
//! evicts its successor.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::instr::{with_fiber, Instr};
use crate::effect::{Data, Effect, Never, IO, UIO};
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberId};
use crate::interpreter::FiberContext;
use crate::promise::Promise;

/// Daemon fibers, one per key.
pub struct ProcessMap<K> {
    entries: Arc<Mutex<HashMap<K, Arc<FiberContext>>>>,
}

impl<K> Clone for ProcessMap<K> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for ProcessMap<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_map()
            .entries(entries.iter().map(|(key, ctx)| (key, ctx.id())))
            .finish()
    }
}

impl<K: Data + Eq + Hash + fmt::Debug> Default for ProcessMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Data + Eq + Hash + fmt::Debug> ProcessMap<K> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a registry inside an effect.
    pub fn make() -> UIO<ProcessMap<K>> {
        Effect::succeed_with(ProcessMap::new)
    }

    /// Fork `effect` as a daemon registered under `key`. Dies if a fiber
    /// registered under `key` is still running.
    ///
    /// The fiber is held at a gate until it is registered, so its
    /// completion callback always finds its own entry.
    pub fn fork<E: Data, A: Data>(&self, key: K, effect: IO<E, A>) -> UIO<Fiber<E, A>> {
        let this = self.clone();
        Effect::suspend(move || {
            let gate = Promise::<Never, ()>::new();
            let this = this.clone();
            let key = key.clone();
            gate.await_()
                .widen_err::<E>()
                .zip_right(effect.clone())
                .fork_daemon()
                .flat_map(move |fiber| this.register(key.clone(), fiber, gate.clone()))
        })
        .uninterruptible()
    }

    fn register<E: Data, A: Data>(
        &self,
        key: K,
        fiber: Fiber<E, A>,
        gate: Promise<Never, ()>,
    ) -> UIO<Fiber<E, A>> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            if existing.poll_exit().is_none() {
                let running = existing.id();
                drop(entries);
                fiber.context().kill(FiberId::none());
                tracing::debug!(key = ?key, %running, "process already running");
                return Effect::die_message(format!(
                    "a process is already running under {key:?} (fiber {running})"
                ));
            }
        }
        entries.insert(key.clone(), fiber.context().clone());
        drop(entries);

        let id = fiber.id();
        let registry = self.entries.clone();
        fiber.context().observe(Box::new(move |_| {
            let mut entries = registry.lock();
            if entries.get(&key).is_some_and(|ctx| ctx.id() == id) {
                entries.remove(&key);
            }
        }));
        gate.try_complete(Exit::succeed(()));
        Effect::succeed(fiber)
    }

    /// The fiber running under `key`, if any.
    pub fn get(&self, key: K) -> UIO<Option<FiberId>> {
        let this = self.clone();
        Effect::succeed_with(move || this.running(&key).map(|ctx| ctx.id()))
    }

    /// Interrupt the fiber running under `key` and wait for it to finish.
    /// Returns false if no fiber was running.
    pub fn interrupt(&self, key: K) -> UIO<bool> {
        let this = self.clone();
        Effect::from_build(move || match this.running(&key) {
            None => Instr::succeed(false),
            Some(target) => with_fiber(move |me| {
                target.kill(me.id());
                target.await_instr()
            })
            .flat_map(|_| Instr::succeed(true)),
        })
    }

    /// Number of running fibers.
    pub fn len(&self) -> UIO<usize> {
        let this = self.clone();
        Effect::succeed_with(move || {
            this.entries
                .lock()
                .values()
                .filter(|ctx| ctx.poll_exit().is_none())
                .count()
        })
    }

    fn running(&self, key: &K) -> Option<Arc<FiberContext>> {
        self.entries
            .lock()
            .get(key)
            .filter(|ctx| ctx.poll_exit().is_none())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked()).unwrap()
    }

    #[test]
    fn test_second_fork_under_live_key_dies() {
        let rt = runtime();
        let map = ProcessMap::<&str>::new();
        let first = rt.run_sync(map.fork("worker", IO::<(), ()>::never())).unwrap();
        let exit = rt.run_sync_exit(map.fork("worker", IO::<(), u8>::succeed(1)));
        let defects = exit.cause().map(|cause| cause.defects()).unwrap_or_default();
        assert_eq!(defects.len(), 1);
        assert!(defects[0].message().contains("worker"));
        assert_eq!(rt.run_sync(map.get("worker")).unwrap(), Some(first.id()));
        assert_eq!(rt.run_sync(map.len()).unwrap(), 1);
    }

    #[test]
    fn test_finished_fiber_frees_its_key() {
        let rt = runtime();
        let map = ProcessMap::<u32>::new();
        let fiber = rt.run_sync(map.fork(1, IO::<&str, u8>::fail("boom"))).unwrap();
        assert_eq!(rt.run_sync_exit(fiber.join()), Exit::fail("boom"));
        let again = rt.run_sync(map.fork(1, IO::<&str, u8>::succeed(2))).unwrap();
        assert_eq!(rt.run_sync(again.join()).unwrap(), 2);
    }

    #[test]
    fn test_interrupt_by_key() {
        let rt = runtime();
        let map = ProcessMap::<&str>::new();
        let fiber = rt.run_sync(map.fork("idle", IO::<(), ()>::never())).unwrap();
        assert!(rt.run_sync(map.interrupt("idle")).unwrap());
        assert!(rt.run_sync(fiber.await_exit()).unwrap().is_interrupted());
        assert!(!rt.run_sync(map.interrupt("idle")).unwrap());
        assert_eq!(rt.run_sync(map.get("idle")).unwrap(), None);
        // An interrupted process can be restarted.
        let restarted = rt.run_sync(map.fork("idle", IO::<(), u8>::succeed(3))).unwrap();
        assert_eq!(rt.run_sync(restarted.join()).unwrap(), 3);
    }

    #[test]
    fn test_daemon_outlives_forking_fiber() {
        let rt = runtime();
        let map = ProcessMap::<&str>::new();
        let release = Promise::<Never, u8>::new();
        let forked = map.fork("daemon", release.await_().widen_err::<()>());
        // The forking fiber finishes right away; the daemon keeps running.
        let fiber = rt.run_sync(forked).unwrap();
        assert!(rt.run_sync(map.get("daemon")).unwrap().is_some());
        release.try_complete(Exit::succeed(9));
        assert_eq!(rt.run_sync(fiber.join()).unwrap(), 9);
    }
}
