//! # Fiber Interpreter
//!
//! The trampolined evaluator that runs effect IR as a fiber.
//!
//! ## Design
//!
//! - One loop, one explicit frame stack: continuations never recurse on the
//!   native stack, so million-deep `flat_map` chains run in constant space
//! - Every user closure runs under `catch_panic`; a panic becomes a `Die`
//! - Suspension is epoch guarded: a fiber suspends at most once per `Async`
//!   node and a `Resumer` for an older epoch is ignored
//! - Interruption is a request recorded in the fiber state and observed at
//!   the top of the loop, in interruptible regions only
//! - A fiber that reaches its exit first interrupts and awaits its children
//!
//! ## Locking
//!
//! `state` guards status, observers, interruptors and children; it is only
//! held for short critical sections and never while user code runs. `run`
//! guards the frame stacks and is held by whichever worker is currently
//! evaluating the fiber. Nothing in here ever runs a fiber inline: resuming
//! always goes through the scheduler.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::cause::Cause;
use crate::effect::instr::{
    with_value, Cont, Env, Erased, ErasedExit, FailCont, Instr, RaceCont, Register,
};
use crate::exit::Exit;
use crate::fiber::{Descriptor, FiberId, FiberScope, FiberStatus, ForkScope, InterruptStatus};
use crate::fiber_ref::FiberRefs;
use crate::log;
use crate::panic::catch_panic;
use crate::runtime::Platform;

/// Called once with the fiber's exit.
pub(crate) type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

enum Status {
    Running,
    Suspended {
        interruptible: bool,
        epoch: u64,
        blocking_on: Vec<FiberId>,
    },
}

enum State {
    Executing {
        status: Status,
        observers: Vec<Observer>,
        interruptors: BTreeSet<FiberId>,
        children: HashMap<FiberId, Arc<FiberContext>>,
    },
    Done(ErasedExit),
}

enum Frame {
    Apply(Cont),
    Fold(FailCont, Cont),
    PopEnv,
    PopInterruptStatus,
}

struct RunState {
    stack: Vec<Frame>,
    environments: Vec<Env>,
    interrupt_status: Vec<bool>,
    async_epoch: u64,
}

impl RunState {
    fn interruptible(&self) -> bool {
        self.interrupt_status.last().copied().unwrap_or(true)
    }

    fn environment(&self) -> Env {
        match self.environments.last() {
            Some(env) => env.clone(),
            None => Arc::new(()),
        }
    }
}

/// The runtime state of one fiber.
pub(crate) struct FiberContext {
    id: FiberId,
    platform: Arc<Platform>,
    parent: Mutex<Option<Weak<FiberContext>>>,
    state: Mutex<State>,
    run: Mutex<RunState>,
    fiber_refs: Mutex<FiberRefs>,
    interrupt_requested: AtomicBool,
    interrupting: AtomicBool,
}

/// One-shot handle that resumes a suspended fiber.
///
/// Cloning is allowed; only the first resume for a given suspension wins.
#[derive(Clone)]
pub(crate) struct Resumer {
    ctx: Arc<FiberContext>,
    epoch: u64,
}

impl Resumer {
    /// Resume the fiber with `instr`. A no-op if the suspension is over.
    pub(crate) fn resume(&self, instr: Instr) {
        if self.ctx.exit_async(self.epoch) {
            self.ctx.evaluate_later(instr);
        }
    }
}

fn guarded(f: impl FnOnce() -> Instr) -> Instr {
    match catch_panic(f) {
        Ok(instr) => instr,
        Err(defect) => Instr::die(defect),
    }
}

fn interruptors_cause(ids: &BTreeSet<FiberId>) -> Cause<Erased> {
    ids.iter()
        .fold(Cause::empty(), |acc, id| Cause::both(acc, Cause::interrupt(*id)))
}

impl FiberContext {
    pub(crate) fn new(
        platform: Arc<Platform>,
        fiber_refs: FiberRefs,
        environment: Env,
        interruptible: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            platform,
            parent: Mutex::new(None),
            state: Mutex::new(State::Executing {
                status: Status::Running,
                observers: Vec::new(),
                interruptors: BTreeSet::new(),
                children: HashMap::new(),
            }),
            run: Mutex::new(RunState {
                stack: Vec::new(),
                environments: vec![environment],
                interrupt_status: vec![interruptible],
                async_epoch: 0,
            }),
            fiber_refs: Mutex::new(fiber_refs),
            interrupt_requested: AtomicBool::new(false),
            interrupting: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub(crate) fn fiber_refs(&self) -> MutexGuard<'_, FiberRefs> {
        self.fiber_refs.lock()
    }

    pub(crate) fn scope(self: &Arc<Self>) -> FiberScope {
        FiberScope {
            owner: Arc::downgrade(self),
            id: self.id,
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// The exit, if the fiber is done.
    pub(crate) fn poll_exit(&self) -> Option<ErasedExit> {
        match &*self.state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Executing { .. } => None,
        }
    }

    /// Register `observer`, or call it right away if the fiber is done.
    pub(crate) fn observe(&self, observer: Observer) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Executing { observers, .. } => observers.push(observer),
            State::Done(exit) => {
                let exit = exit.clone();
                drop(state);
                observer(&exit);
            }
        }
    }

    /// An instruction that suspends until this fiber is done and yields its
    /// `ErasedExit`.
    pub(crate) fn await_instr(self: &Arc<Self>) -> Instr {
        let target = self.clone();
        Instr::Async(
            Box::new(move |resumer: Resumer| {
                if let Some(exit) = target.poll_exit() {
                    return Some(Instr::succeed(exit));
                }
                target.observe(Box::new(move |exit: &ErasedExit| {
                    resumer.resume(Instr::succeed(exit.clone()))
                }));
                None
            }),
            vec![self.id],
        )
    }

    /// The instantaneous status, for descriptors and diagnostics.
    pub(crate) fn status(&self) -> FiberStatus {
        match &*self.state.lock() {
            State::Done(_) => FiberStatus::Done,
            State::Executing { status, .. } => match status {
                Status::Running => FiberStatus::Running {
                    interrupting: self.interrupting.load(Ordering::Acquire),
                },
                Status::Suspended {
                    interruptible,
                    epoch,
                    blocking_on,
                } => FiberStatus::Suspended {
                    interruptible: *interruptible,
                    epoch: *epoch,
                    blocking_on: blocking_on.clone(),
                },
            },
        }
    }

    fn interruptors(&self) -> BTreeSet<FiberId> {
        match &*self.state.lock() {
            State::Executing { interruptors, .. } => interruptors.clone(),
            State::Done(_) => BTreeSet::new(),
        }
    }

    pub(crate) fn inherit_refs(&self, child: &FiberContext) {
        let refs = child.fiber_refs.lock().clone();
        self.fiber_refs.lock().join(&refs);
    }

    // ------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------

    /// Request interruption on behalf of `by`.
    ///
    /// A fiber suspended in an interruptible region is woken right away;
    /// otherwise the request is observed at the next interruption point.
    pub(crate) fn kill(self: &Arc<Self>, by: FiberId) {
        let mut state = self.state.lock();
        let State::Executing {
            status,
            interruptors,
            ..
        } = &mut *state
        else {
            return;
        };

        interruptors.insert(by);
        self.interrupt_requested.store(true, Ordering::Release);

        if let Status::Suspended {
            interruptible: true,
            ..
        } = status
        {
            *status = Status::Running;
            self.interrupting.store(true, Ordering::Release);
            let cause = interruptors_cause(interruptors);
            drop(state);
            tracing::trace!(fiber = %self.id, by = %by, "interrupting suspended fiber");
            self.evaluate_later(Instr::Fail(cause));
        }
    }

    fn should_interrupt(&self, run: &RunState) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
            && run.interruptible()
            && !self.interrupting.load(Ordering::Acquire)
    }

    /// Append interruptors the cause does not mention yet.
    fn with_interruptors(&self, cause: Cause<Erased>) -> Cause<Erased> {
        if !self.interrupt_requested.load(Ordering::Acquire) {
            return cause;
        }
        let present = cause.interruptors();
        let missing: BTreeSet<FiberId> = self
            .interruptors()
            .into_iter()
            .filter(|id| !present.contains(id))
            .collect();
        if missing.is_empty() {
            cause
        } else {
            Cause::then(cause, interruptors_cause(&missing))
        }
    }

    // ------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------

    /// Enter `Suspended`; refused when an interruption is already pending
    /// and the region is interruptible.
    fn enter_async(&self, epoch: u64, interruptible: bool, blocking_on: Vec<FiberId>) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            State::Executing { status, .. } => {
                if interruptible && self.interrupt_requested.load(Ordering::Acquire) {
                    return false;
                }
                *status = Status::Suspended {
                    interruptible,
                    epoch,
                    blocking_on,
                };
                true
            }
            State::Done(_) => false,
        }
    }

    /// Leave the suspension identified by `epoch`; false if it already ended.
    fn exit_async(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if let State::Executing { status, .. } = &mut *state {
            if let Status::Suspended { epoch: current, .. } = status {
                if *current == epoch {
                    *status = Status::Running;
                    return true;
                }
            }
        }
        false
    }

    /// Suspend on `register`. A result returned synchronously by `register`
    /// only counts if the suspension is still current: an interruption that
    /// resumed the fiber while `register` ran wins and the result is dropped,
    /// the same as a value handed to `Resumer::resume` after the fiber was
    /// interrupted. Registrations that hand over resources must do so in an
    /// uninterruptible region.
    fn run_async(
        self: &Arc<Self>,
        run: &mut RunState,
        register: Register,
        blocking_on: Vec<FiberId>,
    ) -> Option<Instr> {
        run.async_epoch += 1;
        let epoch = run.async_epoch;
        let interruptible = run.interruptible() && !self.interrupting.load(Ordering::Acquire);

        if !self.enter_async(epoch, interruptible, blocking_on.clone()) {
            // The interruption is picked up at the top of the loop.
            return Some(Instr::Async(register, blocking_on));
        }

        let resumer = Resumer {
            ctx: self.clone(),
            epoch,
        };
        match catch_panic(move || register(resumer)) {
            Ok(Some(next)) => {
                if self.exit_async(epoch) {
                    Some(next)
                } else {
                    tracing::trace!(fiber = %self.id, "synchronous async result dropped by interruption");
                    None
                }
            }
            Ok(None) => None,
            Err(defect) => self.exit_async(epoch).then(|| Instr::die(defect)),
        }
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Submit the fiber to the scheduler, continuing with `instr`.
    pub(crate) fn evaluate_later(self: &Arc<Self>, instr: Instr) {
        let ctx = self.clone();
        self.platform
            .submit(Box::new(move || ctx.evaluate_now(instr)));
    }

    /// Run the fiber on the current thread until it suspends, finishes or
    /// exhausts its operation budget.
    pub(crate) fn evaluate_now(self: &Arc<Self>, instr: Instr) {
        let mut run = self.run.lock();
        let budget = self.platform.yield_op_count();
        let mut ops = 0usize;
        let mut current = Some(instr);

        while let Some(mut instr) = current.take() {
            if self.should_interrupt(&run) {
                self.interrupting.store(true, Ordering::Release);
                instr = Instr::Fail(interruptors_cause(&self.interruptors()));
            } else if ops >= budget {
                drop(run);
                self.evaluate_later(instr);
                return;
            }
            ops += 1;

            current = match instr {
                Instr::Succeed(value) => self.next_instr(&mut run, value),
                Instr::Fail(cause) => self.unwind(&mut run, cause),
                Instr::EffectTotal(f) => match catch_panic(f) {
                    Ok(value) => self.next_instr(&mut run, value),
                    Err(defect) => Some(Instr::die(defect)),
                },
                Instr::EffectPartial(f) => match catch_panic(f) {
                    Ok(Ok(value)) => self.next_instr(&mut run, value),
                    Ok(Err(error)) => Some(Instr::Fail(Cause::fail(error))),
                    Err(defect) => Some(Instr::die(defect)),
                },
                Instr::Suspend(build) => Some(guarded(|| build())),
                Instr::FlatMap(inner, k) => {
                    run.stack.push(Frame::Apply(k));
                    Some(*inner)
                }
                Instr::Fold(inner, on_failure, on_success) => {
                    run.stack.push(Frame::Fold(on_failure, on_success));
                    Some(*inner)
                }
                Instr::Async(register, blocking_on) => {
                    self.run_async(&mut run, register, blocking_on)
                }
                Instr::Fork(inner, scope) => {
                    let child = self.fork(&run, *inner, scope);
                    self.next_instr(&mut run, Erased::new(child))
                }
                Instr::Read(f) => {
                    let env = run.environment();
                    Some(guarded(move || f(&env)))
                }
                Instr::Provide(env, inner) => {
                    run.environments.push(env);
                    run.stack.push(Frame::PopEnv);
                    Some(*inner)
                }
                Instr::InterruptStatus(inner, status) => {
                    run.interrupt_status.push(status.is_interruptible());
                    run.stack.push(Frame::PopInterruptStatus);
                    Some(*inner)
                }
                Instr::CheckInterrupt(f) => {
                    let status = InterruptStatus::from_bool(run.interruptible());
                    Some(guarded(move || f(status)))
                }
                Instr::Descriptor(f) => {
                    let descriptor = self.descriptor(&run);
                    Some(guarded(move || f(descriptor)))
                }
                Instr::RaceWith {
                    left,
                    right,
                    on_left,
                    on_right,
                    scope,
                } => Some(self.race_with(&run, *left, *right, on_left, on_right, scope)),
                Instr::Yield => {
                    drop(run);
                    self.evaluate_later(Instr::unit());
                    return;
                }
                Instr::WithFiber(f) => Some(guarded(|| f(self))),
            };
        }
    }

    /// Feed a value to the next continuation frame.
    fn next_instr(self: &Arc<Self>, run: &mut RunState, value: Erased) -> Option<Instr> {
        loop {
            match run.stack.pop() {
                Some(Frame::Apply(k)) | Some(Frame::Fold(_, k)) => {
                    return Some(guarded(move || k(value)));
                }
                Some(Frame::PopEnv) => {
                    run.environments.pop();
                }
                Some(Frame::PopInterruptStatus) => {
                    run.interrupt_status.pop();
                }
                None => return self.done(Exit::Success(value)),
            }
        }
    }

    /// Unwind to the nearest failure handler that may run.
    ///
    /// While an interruption is pending, handlers in interruptible regions are
    /// skipped; handlers installed in uninterruptible regions (finalizers)
    /// still run, with typed failures stripped if anything was skipped.
    fn unwind(self: &Arc<Self>, run: &mut RunState, cause: Cause<Erased>) -> Option<Instr> {
        let mut discarded = false;
        loop {
            match run.stack.pop() {
                Some(Frame::Apply(_)) => {}
                Some(Frame::PopEnv) => {
                    run.environments.pop();
                }
                Some(Frame::PopInterruptStatus) => {
                    run.interrupt_status.pop();
                }
                Some(Frame::Fold(on_failure, _)) => {
                    if self.interrupt_requested.load(Ordering::Acquire) && run.interruptible() {
                        discarded = true;
                        continue;
                    }
                    self.interrupting.store(false, Ordering::Release);
                    let cause = if discarded {
                        cause.strip_failures()
                    } else {
                        cause
                    };
                    return Some(guarded(move || on_failure(cause)));
                }
                None => {
                    let cause = if discarded {
                        cause.strip_failures()
                    } else {
                        cause
                    };
                    let cause = self.with_interruptors(cause);
                    self.interrupting.store(true, Ordering::Release);
                    return self.done(Exit::Failure(cause));
                }
            }
        }
    }

    fn descriptor(self: &Arc<Self>, run: &RunState) -> Descriptor {
        Descriptor {
            id: self.id,
            status: self.status(),
            interruptors: self.interruptors(),
            interrupt_status: InterruptStatus::from_bool(run.interruptible()),
            scope: self.scope(),
        }
    }

    // ------------------------------------------------------------------
    // Children
    // ------------------------------------------------------------------

    /// Attach `child` to this fiber's scope; false once this fiber is done.
    fn adopt(self: &Arc<Self>, child: &Arc<FiberContext>) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            State::Executing { children, .. } => {
                children.insert(child.id, child.clone());
                *child.parent.lock() = Some(Arc::downgrade(self));
                true
            }
            State::Done(_) => false,
        }
    }

    fn remove_child(&self, id: FiberId) {
        if let State::Executing { children, .. } = &mut *self.state.lock() {
            children.remove(&id);
        }
    }

    fn fork(
        self: &Arc<Self>,
        run: &RunState,
        instr: Instr,
        scope: Option<ForkScope>,
    ) -> Arc<FiberContext> {
        let child = FiberContext::new(
            self.platform.clone(),
            self.fiber_refs.lock().fork(),
            run.environment(),
            run.interruptible(),
        );

        let attached = match scope {
            None => self.adopt(&child),
            Some(ForkScope::Global) => true,
            Some(ForkScope::Fiber(scope)) => match scope.owner.upgrade() {
                Some(owner) => owner.adopt(&child),
                None => false,
            },
        };

        self.platform.register(&child);
        tracing::trace!(parent = %self.id, child = %child.id, "fork");

        if !attached {
            child.kill(self.id);
        }
        child.evaluate_later(instr);
        child
    }

    fn race_with(
        self: &Arc<Self>,
        run: &RunState,
        left: Instr,
        right: Instr,
        on_left: RaceCont,
        on_right: RaceCont,
        scope: Option<ForkScope>,
    ) -> Instr {
        let interruptible = InterruptStatus::from_bool(run.interruptible());
        let l = self.fork(run, left.with_status(InterruptStatus::Interruptible), scope.clone());
        let r = self.fork(run, right.with_status(InterruptStatus::Interruptible), scope);
        let me = self.id;

        let (wl, wr) = (l.clone(), r.clone());
        let wait = Instr::Async(
            Box::new(move |resumer: Resumer| {
                let decided = Arc::new(AtomicBool::new(false));
                for (left_won, fiber) in [(true, &wl), (false, &wr)] {
                    let decided = decided.clone();
                    let resumer = resumer.clone();
                    fiber.observe(Box::new(move |_: &ErasedExit| {
                        if !decided.swap(true, Ordering::AcqRel) {
                            resumer.resume(Instr::succeed(left_won));
                        }
                    }));
                }
                None
            }),
            vec![l.id, r.id],
        );

        let (il, ir) = (l.clone(), r.clone());
        let on_interrupted: FailCont = Box::new(move |cause| {
            il.kill(me);
            ir.kill(me);
            await_all(vec![il, ir]).flat_map(move |_| Instr::Fail(cause))
        });

        let on_decided: Cont = Box::new(move |won| {
            with_value(won, move |left_won: bool| {
                let (winner, loser, handler) = if left_won {
                    (l, r, on_left)
                } else {
                    (r, l, on_right)
                };
                match winner.poll_exit() {
                    Some(exit) => handler(exit, loser, interruptible),
                    None => Instr::Fail(Cause::die_message("race winner has no exit")),
                }
            })
        });

        Instr::Fold(Box::new(wait.with_status(interruptible)), on_interrupted, on_decided)
            .with_status(InterruptStatus::Uninterruptible)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Finish the fiber. Live children are interrupted and awaited first, in
    /// an uninterruptible region, before the exit is replayed.
    fn done(self: &Arc<Self>, exit: ErasedExit) -> Option<Instr> {
        let observers = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return None,
                State::Executing {
                    children,
                    observers,
                    ..
                } => {
                    if !children.is_empty() {
                        let live: Vec<Arc<FiberContext>> =
                            children.drain().map(|(_, child)| child).collect();
                        drop(state);
                        return Some(self.shutdown_children(live, exit));
                    }
                    let observers = std::mem::take(observers);
                    *state = State::Done(exit.clone());
                    observers
                }
            }
        };

        let parent = self.parent.lock().take().and_then(|weak| weak.upgrade());
        if let Some(parent) = parent {
            parent.remove_child(self.id);
        }
        self.platform.unregister(self.id);

        tracing::trace!(fiber = %self.id, success = exit.is_success(), "fiber done");

        if observers.is_empty() && self.platform.report_unhandled() {
            if let Exit::Failure(cause) = &exit {
                if cause.died() {
                    log::unhandled_failure(self.id, cause);
                }
            }
        }

        for observer in observers {
            observer(&exit);
        }
        None
    }

    fn shutdown_children(self: &Arc<Self>, children: Vec<Arc<FiberContext>>, exit: ErasedExit) -> Instr {
        tracing::trace!(fiber = %self.id, children = children.len(), "interrupting children");
        let me = self.id;
        let targets = children.clone();
        Instr::total(move || {
            for child in &targets {
                child.kill(me);
            }
            Erased::unit()
        })
        .flat_map(move |_| await_all(children))
        .flat_map(move |_| Instr::done(exit))
        .with_status(InterruptStatus::Uninterruptible)
    }
}

/// Suspend until every fiber is done; yields their exits in order as a
/// `Vec<ErasedExit>`.
pub(crate) fn await_all(fibers: Vec<Arc<FiberContext>>) -> Instr {
    if fibers.is_empty() {
        return Instr::succeed(Vec::<ErasedExit>::new());
    }
    let blocking_on = fibers.iter().map(|f| f.id).collect();
    Instr::Async(
        Box::new(move |resumer: Resumer| {
            let total = fibers.len();
            let slots: Arc<Mutex<(Vec<Option<ErasedExit>>, usize)>> =
                Arc::new(Mutex::new((vec![None; total], total)));
            for (index, fiber) in fibers.iter().enumerate() {
                let slots = slots.clone();
                let resumer = resumer.clone();
                fiber.observe(Box::new(move |exit: &ErasedExit| {
                    let mut guard = slots.lock();
                    guard.0[index] = Some(exit.clone());
                    guard.1 -= 1;
                    if guard.1 == 0 {
                        let exits: Vec<ErasedExit> = guard.0.drain(..).flatten().collect();
                        drop(guard);
                        resumer.resume(Instr::succeed(exits));
                    }
                }));
            }
            None
        }),
        blocking_on,
    )
}
