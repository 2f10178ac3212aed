//! # Managed Resources
//!
//! `Managed<R, E, A>` describes a resource: how to acquire it and how to
//! release it. Composing managed values composes their lifetimes; `use_`
//! acquires everything, runs the body and then releases in reverse order,
//! whatever the body's exit.
//!
//! ## Design
//!
//! - A managed value is an effect over `(R, ReleaseMap)` yielding the
//!   resource and a finalizer that releases it early
//! - Acquisition and finalizer registration happen in one uninterruptible
//!   region, so an acquired resource is always released
//! - `use_` owns a fresh `ReleaseMap` and closes it with the body's exit
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{Managed, UIO};
//!
//! let file = Managed::make(open_file(), |f| close_file(f));
//! let program = file.use_(|f| read_all(f));
//! ```

mod release_map;

use std::fmt;
use std::sync::Arc;

pub use release_map::{ExecutionStrategy, Finalizer, ReleaseMap};

use crate::effect::{Data, Effect, Never, UIO};
use crate::exit::{Exit, ScopeExit};

type ReleaseFn<R> = Arc<dyn Fn(ScopeExit) -> Effect<R, Never, ()> + Send + Sync>;

/// An acquisition step and the release for it, kept separate so the
/// release can be registered before acquisition starts.
pub struct Reservation<R, E, A> {
    acquire: Effect<R, E, A>,
    release: ReleaseFn<R>,
}

impl<R, E, A> Clone for Reservation<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            acquire: self.acquire.clone(),
            release: self.release.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Reservation<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").finish_non_exhaustive()
    }
}

impl<R: Data, E: Data, A: Data> Reservation<R, E, A> {
    /// Pair an acquisition with its release.
    pub fn new(
        acquire: Effect<R, E, A>,
        release: impl Fn(ScopeExit) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            acquire,
            release: Arc::new(release),
        }
    }

    /// The acquisition step.
    pub fn acquire(&self) -> Effect<R, E, A> {
        self.acquire.clone()
    }

    /// The release step for `exit`.
    pub fn release(&self, exit: ScopeExit) -> Effect<R, Never, ()> {
        (self.release)(exit)
    }
}

/// A resource with a scoped lifetime.
pub struct Managed<R, E, A> {
    zio: Effect<(R, ReleaseMap), E, (Finalizer, A)>,
}

impl<R, E, A> Clone for Managed<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            zio: self.zio.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Managed<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed").finish_non_exhaustive()
    }
}

/// Environment a managed effect runs in.
type Scope<R> = (R, ReleaseMap);

impl<R: Data, E: Data, A: Data> Managed<R, E, A> {
    fn from_zio(zio: Effect<Scope<R>, E, (Finalizer, A)>) -> Self {
        Self { zio }
    }

    fn scope() -> Effect<Scope<R>, E, Scope<R>> {
        Effect::environment()
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Acquire with `acquire`; `release` runs with the scope's exit.
    /// Acquisition and registration of the release are uninterruptible.
    pub fn make_exit(
        acquire: Effect<R, E, A>,
        release: impl Fn(A, ScopeExit) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        let release = Arc::new(release);
        let zio = Self::scope()
            .flat_map(move |(r, map): Scope<R>| {
                let release = release.clone();
                let env = r.clone();
                acquire
                    .clone()
                    .provide_all::<Scope<R>>(r)
                    .flat_map(move |a: A| {
                        let release = release.clone();
                        let (env, held) = (env.clone(), a.clone());
                        map.add(Finalizer::new(move |exit| {
                            release(held.clone(), exit).provide_all(env.clone())
                        }))
                        .lift()
                        .map(move |finalizer| (finalizer, a.clone()))
                    })
            })
            .uninterruptible();
        Self::from_zio(zio)
    }

    /// Acquire with `acquire`, release with `release`.
    pub fn make(
        acquire: Effect<R, E, A>,
        release: impl Fn(A) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        Self::make_exit(acquire, move |a, _| release(a))
    }

    /// A resource with nothing to release.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        let zio = Self::scope().flat_map(move |(r, _): Scope<R>| {
            effect
                .clone()
                .provide_all::<Scope<R>>(r)
                .map(|a| (Finalizer::noop(), a))
        });
        Self::from_zio(zio)
    }

    /// A resource that is just `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_effect(Effect::succeed(value))
    }

    /// A resource that fails to acquire.
    pub fn fail(error: E) -> Self {
        Self::from_effect(Effect::fail(error))
    }

    /// Build from an effect producing a reservation. The reservation and
    /// the registration of its release are uninterruptible; `acquire` runs
    /// with the caller's interruptibility. Reserving into a closed scope
    /// is an interruption.
    pub fn reserve(reservation: Effect<R, E, Reservation<R, E, A>>) -> Self {
        let zio = Effect::uninterruptible_mask(move |restore| {
            let reservation = reservation.clone();
            Self::scope().flat_map(move |(r, map): Scope<R>| {
                let map = map.clone();
                let env = r.clone();
                reservation
                    .clone()
                    .provide_all::<Scope<R>>(r)
                    .flat_map(move |reserved: Reservation<R, E, A>| {
                        let env = env.clone();
                        let map = map.clone();
                        let on_release = reserved.clone();
                        let release_env = env.clone();
                        map.add_if_open(Finalizer::new(move |exit| {
                            on_release.release(exit).provide_all(release_env.clone())
                        }))
                        .lift()
                        .flat_map(move |key: Option<u64>| match key {
                            Some(key) => {
                                let map = map.clone();
                                restore
                                    .restore(reserved.acquire().provide_all::<Scope<R>>(env.clone()))
                                    .map(move |a| {
                                        let map = map.clone();
                                        let finalizer =
                                            Finalizer::new(move |exit| map.release(key, exit));
                                        (finalizer, a)
                                    })
                            }
                            None => Effect::interrupt(),
                        })
                    })
            })
        });
        Self::from_zio(zio)
    }

    // ------------------------------------------------------------------
    // Use
    // ------------------------------------------------------------------

    /// Acquire, run `f`, then release everything acquired, whatever the
    /// exit of `f`, including interruption.
    pub fn use_<B: Data>(
        &self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        let zio = self.zio.clone();
        let f = Arc::new(f);
        ReleaseMap::make().lift::<R, E>().bracket_exit(
            |map: ReleaseMap, exit: Exit<E, B>| {
                map.release_all(exit.as_scope_exit(), ExecutionStrategy::Sequential)
                    .widen_env()
            },
            move |map: ReleaseMap| {
                let f = f.clone();
                zio.clone()
                    .provide_some(move |r: &R| (r.clone(), map.clone()))
                    .flat_map(move |(_, a)| f(a))
            },
        )
    }

    /// Acquire and release right away, returning the resource.
    pub fn use_now(&self) -> Effect<R, E, A> {
        self.use_(Effect::succeed)
    }

    /// Turn the managed value into a reservation over a fresh scope.
    pub fn to_reservation(&self) -> UIO<Reservation<R, E, A>> {
        let zio = self.zio.clone();
        ReleaseMap::make().map(move |map: ReleaseMap| {
            let scope = map.clone();
            let acquire = zio
                .clone()
                .provide_some(move |r: &R| (r.clone(), scope.clone()))
                .map(|(_, a)| a);
            Reservation::new(acquire, move |exit| {
                map.release_all(exit, ExecutionStrategy::Sequential).widen_env()
            })
        })
    }

    // ------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------

    /// Transform the resource.
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Managed<R, E, B> {
        Managed::from_zio(self.zio.map(move |(finalizer, a)| (finalizer, f(a))))
    }

    /// Transform the resource with an effect.
    pub fn map_m<B: Data>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, B> {
        let f = Arc::new(f);
        Managed::from_zio(self.zio.flat_map(move |(finalizer, a)| {
            f(a).provide_some(|(r, _): &Scope<R>| r.clone())
                .map(move |b| (finalizer.clone(), b))
        }))
    }

    /// Acquire a second resource that depends on this one. The second is
    /// released first.
    pub fn flat_map<B: Data>(
        self,
        f: impl Fn(A) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, B> {
        let f = Arc::new(f);
        Managed::from_zio(self.zio.flat_map(move |(outer, a)| {
            f(a).zio
                .map(move |(inner, b)| (inner.and_then(outer.clone()), b))
        }))
    }

    /// Acquire both in sequence and combine them.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Managed<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Managed<R, E, C> {
        let f = Arc::new(f);
        self.flat_map(move |a| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Acquire both in sequence.
    pub fn zip<B: Data>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Acquire both in parallel. Each side gets its own scope, registered
    /// in the enclosing one and released in parallel.
    pub fn zip_with_par<B: Data, C: Data>(
        self,
        that: Managed<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Managed<R, E, C> {
        let f = Arc::new(f);
        let left = self.zio;
        let right = that.zio;
        ReleaseMap::make_managed::<R, E>(ExecutionStrategy::Parallel).map_m(move |parallel| {
            let inner = inner_scope::<R, E>(parallel);
            let (left, right, f) = (left.clone(), right.clone(), f.clone());
            inner.clone().zip(inner).flat_map(move |(l, r)| {
                let f = f.clone();
                let left = left.clone().provide_some(move |env: &R| (env.clone(), l.clone()));
                let right = right.clone().provide_some(move |env: &R| (env.clone(), r.clone()));
                left.zip_with_par(right, move |(_, a), (_, b)| f(a, b))
            })
        })
    }

    /// Acquire both in parallel.
    pub fn zip_par<B: Data>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.zip_with_par(that, |a, b| (a, b))
    }

    /// Derive this resource's environment from an outer one.
    pub fn provide_some<R0: Data>(
        self,
        f: impl Fn(&R0) -> R + Send + Sync + 'static,
    ) -> Managed<R0, E, A> {
        Managed::from_zio(
            self.zio
                .provide_some(move |(r0, map): &Scope<R0>| (f(r0), map.clone())),
        )
    }

    /// Give this resource its whole environment.
    pub fn provide_all<R0: Data>(self, env: R) -> Managed<R0, E, A> {
        self.provide_some(move |_: &R0| env.clone())
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Run `cleanup` with the acquisition's exit when the scope closes,
    /// after the resource's own finalizers.
    pub fn on_exit(
        self,
        cleanup: impl Fn(Exit<E, A>) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        let cleanup = Arc::new(cleanup);
        let zio = self.zio;
        Managed::from_zio(Effect::uninterruptible_mask(move |restore| {
            let (zio, cleanup) = (zio.clone(), cleanup.clone());
            Self::scope().flat_map(move |(r, outer): Scope<R>| {
                let (zio, cleanup) = (zio.clone(), cleanup.clone());
                let inner = ReleaseMap::new();
                let env = r.clone();
                restore
                    .restore(
                        zio.provide_all::<Scope<R>>((r, inner.clone()))
                            .map(|(_, a)| a),
                    )
                    .to_exit()
                    .widen_err::<E>()
                    .flat_map(move |exit: Exit<E, A>| {
                        let (inner, env, cleanup) = (inner.clone(), env.clone(), cleanup.clone());
                        let acquired = exit.clone();
                        let finalizer = Finalizer::new(move |scope_exit| {
                            let inner = inner.clone();
                            let after = cleanup(acquired.clone()).provide_all::<()>(env.clone());
                            Finalizer::new(move |e| {
                                inner.release_all(e, ExecutionStrategy::Sequential)
                            })
                            .and_then(Finalizer::new(move |_| after.clone()))
                            .run(scope_exit)
                        });
                        outer
                            .add(finalizer)
                            .lift()
                            .flat_map(move |finalizer| match exit.clone() {
                                Exit::Success(a) => Effect::succeed((finalizer, a)),
                                Exit::Failure(cause) => Effect::halt(cause),
                            })
                    })
            })
        }))
    }

    /// Run `finalizer` when the scope closes, after the resource's own
    /// finalizers.
    pub fn ensuring(self, finalizer: Effect<R, Never, ()>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }
}

impl<R: Data, E: Data> Managed<R, E, ()> {
    /// A release-only resource: `finalizer` runs when the scope closes.
    pub fn finalizer(finalizer: Effect<R, Never, ()>) -> Self {
        Self::finalizer_exit(move |_| finalizer.clone())
    }

    /// Like `finalizer`, with access to the scope's exit.
    pub fn finalizer_exit(
        finalizer: impl Fn(ScopeExit) -> Effect<R, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        Self::make_exit(Effect::unit(), move |_, exit| finalizer(exit))
    }
}

impl<R: Data, E: Data, B: Data> Managed<R, E, Vec<B>> {
    /// Acquire one resource per item, in order. They are released in
    /// reverse order.
    pub fn foreach<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        let zio = Effect::foreach(items, move |t| f(t).zio).map(|acquired: Vec<(Finalizer, B)>| {
            let (finalizers, values): (Vec<Finalizer>, Vec<B>) = acquired.into_iter().unzip();
            let combined = finalizers
                .into_iter()
                .rev()
                .reduce(Finalizer::and_then)
                .unwrap_or_else(Finalizer::noop);
            (combined, values)
        });
        Managed::from_zio(zio)
    }

    /// Acquire one resource per item in parallel. Each gets its own scope;
    /// the scopes are released in parallel.
    pub fn foreach_par<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        let items: Arc<Vec<T>> = Arc::new(items.into_iter().collect());
        let f = Arc::new(f);
        ReleaseMap::make_managed::<R, E>(ExecutionStrategy::Parallel).map_m(move |parallel| {
            let inner = inner_scope::<R, E>(parallel);
            let f = f.clone();
            Effect::foreach_par((*items).clone(), move |t| {
                let resource = f(t).zio;
                inner.clone().flat_map(move |map: ReleaseMap| {
                    resource
                        .clone()
                        .provide_some(move |r: &R| (r.clone(), map.clone()))
                        .map(|(_, b)| b)
                })
            })
        })
    }
}

impl ReleaseMap {
    /// A release map as a managed resource: when the enclosing scope
    /// closes, every finalizer in it is released with `strategy`.
    pub fn make_managed<R: Data, E: Data>(strategy: ExecutionStrategy) -> Managed<R, E, ReleaseMap> {
        Managed::make_exit(ReleaseMap::make().lift(), move |map: ReleaseMap, exit| {
            map.release_all(exit, strategy).widen_env()
        })
    }
}

/// A sequential child scope registered in `parent`.
fn inner_scope<R: Data, E: Data>(parent: ReleaseMap) -> Effect<R, E, ReleaseMap> {
    ReleaseMap::make_managed::<R, E>(ExecutionStrategy::Sequential)
        .zio
        .provide_some(move |r: &R| (r.clone(), parent.clone()))
        .map(|(_, map)| map)
}
