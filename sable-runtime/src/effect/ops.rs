//! Sequential composition, error handling and environment combinators.

use std::sync::Arc;
use std::time::Duration;

use super::instr::{restore_cause, with_value, Env, Instr};
use super::{Data, Effect, Never};
use crate::cause::Cause;
use crate::exit::Exit;

/// Continue with the downcast value of `instr`.
pub(crate) fn bind<A: Data>(instr: Instr, k: impl FnOnce(A) -> Instr + Send + 'static) -> Instr {
    instr.flat_map(move |v| with_value(v, k))
}

/// Retype a cause that holds no typed failures.
pub(crate) fn retype_cause<E, E2>(cause: Cause<E>) -> Cause<E2> {
    cause.fold(
        Cause::empty,
        |_| Cause::Empty,
        |d| Cause::Die(d.clone()),
        Cause::Interrupt,
        Cause::then,
        Cause::both,
    )
}

impl<R: Data, E: Data, A: Data> Effect<R, E, A> {
    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Continue with the effect `f` builds from this effect's value.
    pub fn flat_map<B: Data>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            bind(self.instr(), move |a: A| f(a).instr())
        })
    }

    /// Transform the value.
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<R, E, B> {
        let f = Arc::new(f);
        Effect::from_build(move || {
            let f = f.clone();
            bind(self.instr(), move |a: A| Instr::succeed(f(a)))
        })
    }

    /// Replace the value.
    pub fn as_<B: Data>(self, value: B) -> Effect<R, E, B> {
        self.map(move |_| value.clone())
    }

    /// Discard the value.
    pub fn as_unit(self) -> Effect<R, E, ()> {
        self.map(|_| ())
    }

    /// Run `that` after this effect, keeping its value.
    pub fn zip_right<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, B> {
        self.flat_map(move |_| that.clone())
    }

    /// Run `that` after this effect, keeping this effect's value.
    pub fn zip_left<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, A> {
        self.flat_map(move |a| that.clone().as_(a))
    }

    /// Run both in sequence and combine their values.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C> {
        let f = Arc::new(f);
        self.flat_map(move |a| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Run both in sequence and pair their values.
    pub fn zip<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run an effect on the value, keeping the value.
    pub fn tap<B: Data>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        self.flat_map(move |a| f(a.clone()).as_(a))
    }

    /// Run this effect only when `condition` holds.
    pub fn when(self, condition: bool) -> Effect<R, E, ()> {
        if condition {
            self.as_unit()
        } else {
            Effect::unit()
        }
    }

    /// Repeat this effect until it fails.
    pub fn forever<B: Data>(self) -> Effect<R, E, B> {
        let again = self.clone();
        self.flat_map(move |_| again.clone().forever())
    }

    /// Run this effect after sleeping for `duration`.
    pub fn delay(self, duration: Duration) -> Effect<R, E, A> {
        Effect::<R, E, ()>::sleep(duration).zip_right(self)
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Branch on the full cause or the value.
    pub fn fold_cause_m<E2: Data, B: Data>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        let on_failure = Arc::new(on_failure);
        let on_success = Arc::new(on_success);
        Effect::from_build(move || {
            let on_failure = on_failure.clone();
            let on_success = on_success.clone();
            Instr::Fold(
                Box::new(self.instr()),
                Box::new(move |cause| on_failure(restore_cause::<E>(cause)).instr()),
                Box::new(move |v| with_value(v, move |a: A| on_success(a).instr())),
            )
        })
    }

    /// Branch on a typed failure or the value. Defects and interruptions
    /// pass through.
    pub fn fold_m<E2: Data, B: Data>(
        self,
        on_failure: impl Fn(E) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        self.fold_cause_m(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => on_failure(error),
                Err(cause) => Effect::halt(retype_cause(cause)),
            },
            on_success,
        )
    }

    /// Fold a typed failure or the value into a plain value.
    pub fn fold<B: Data>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<R, Never, B> {
        self.fold_m(
            move |e| Effect::succeed(on_failure(e)),
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Recover from a typed failure.
    pub fn catch_all<E2: Data>(
        self,
        f: impl Fn(E) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        self.fold_m(f, Effect::succeed)
    }

    /// Recover from any cause. Interruptions of the running fiber still
    /// propagate: the interpreter skips this handler while interrupting.
    pub fn catch_all_cause<E2: Data>(
        self,
        f: impl Fn(Cause<E>) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        self.fold_cause_m(f, Effect::succeed)
    }

    /// Run `that` if this effect fails with a typed error.
    pub fn or_else<E2: Data>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that.clone())
    }

    /// Transform the typed error.
    pub fn map_err<E2: Data>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<R, E2, A> {
        let f = Arc::new(f);
        self.fold_cause_m(
            move |cause| {
                let f = f.clone();
                Effect::halt(cause.map(move |e| f(e)))
            },
            Effect::succeed,
        )
    }

    /// Surface the typed error as a `Result`.
    pub fn either(self) -> Effect<R, Never, Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// The exit of this effect, as a value.
    pub fn to_exit(self) -> Effect<R, Never, Exit<E, A>> {
        Effect::from_build(move || {
            Instr::Fold(
                Box::new(self.instr()),
                Box::new(|cause| Instr::succeed(Exit::<E, A>::Failure(restore_cause(cause)))),
                Box::new(|v| with_value(v, |a: A| Instr::succeed(Exit::<E, A>::Success(a)))),
            )
        })
    }

    /// Expose the full cause as the typed error.
    pub fn sandbox(self) -> Effect<R, Cause<E>, A> {
        self.fold_cause_m(Effect::fail, Effect::succeed)
    }

    /// Turn typed failures into defects.
    pub fn or_die(self) -> Effect<R, Never, A>
    where
        E: std::fmt::Debug,
    {
        self.catch_all(|e| Effect::die_message(format!("{:?}", e)))
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    /// Run with `env` as the whole environment.
    pub fn provide_all<R0: Data>(self, env: R) -> Effect<R0, E, A> {
        let env: Env = Arc::new(env);
        Effect::from_build(move || Instr::Provide(env.clone(), Box::new(self.instr())))
    }

    /// Run with an environment derived from the outer one.
    pub fn provide_some<R0: Data>(
        self,
        f: impl Fn(&R0) -> R + Send + Sync + 'static,
    ) -> Effect<R0, E, A> {
        let f = Arc::new(f);
        Effect::access_m(move |outer: &R0| self.clone().provide_all(f(outer)))
    }
}

impl<R: Data, E: Data, A: Data> Effect<R, Cause<E>, A> {
    /// Undo `sandbox`.
    pub fn unsandbox(self) -> Effect<R, E, A> {
        self.catch_all(Effect::halt)
    }
}

impl<R: Data, E: Data, B: Data> Effect<R, E, Vec<B>> {
    /// Run `f` on every item in order, collecting the values. Stops at the
    /// first failure.
    pub fn foreach<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        let items: Arc<Vec<T>> = Arc::new(items.into_iter().collect());
        let f: Arc<dyn Fn(T) -> Effect<R, E, B> + Send + Sync> = Arc::new(f);
        Effect::from_build(move || {
            foreach_step(items.clone(), f.clone(), 0, Vec::with_capacity(items.len()))
        })
    }

    /// Run every effect in order, collecting the values.
    pub fn collect_all(effects: impl IntoIterator<Item = Effect<R, E, B>>) -> Self {
        Self::foreach(effects, |effect| effect)
    }
}

impl<R: Data, E: Data> Effect<R, E, ()> {
    /// Run `f` on every item in order, discarding the values.
    pub fn foreach_<T: Data, B: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        Effect::<R, E, Vec<()>>::foreach(items, move |t| f(t).as_unit()).as_unit()
    }
}

fn foreach_step<R: Data, E: Data, T: Data, B: Data>(
    items: Arc<Vec<T>>,
    f: Arc<dyn Fn(T) -> Effect<R, E, B> + Send + Sync>,
    index: usize,
    mut acc: Vec<B>,
) -> Instr {
    let Some(item) = items.get(index).cloned() else {
        return Instr::succeed(acc);
    };
    bind(f(item).instr(), move |b: B| {
        acc.push(b);
        foreach_step(items, f, index + 1, acc)
    })
}
