//! # Queue
//!
//! An asynchronous FIFO queue shared by fibers.
//!
//! ## Design
//!
//! - One lock guards the buffer, the parked takers and the overflow
//!   strategy; takers and putters are completed while it is held
//! - An offer first feeds parked takers, then fills the buffer, then hands
//!   what is left to the strategy
//! - A taker interrupted after being handed an item gives the item back
//! - After `shutdown` every operation except `is_shutdown`, `shutdown` and
//!   `await_shutdown` is interrupted
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::Queue;
//!
//! let program = Queue::bounded(16).flat_map(|queue| {
//!     queue.offer(1).zip_right(queue.take())
//! });
//! ```

mod strategy;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Data, Effect, Never, UIO};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::promise::Promise;

use strategy::{BackPressure, Dropping, Sliding, Strategy, Surplus};

struct State<A> {
    buffer: VecDeque<A>,
    /// `None` for an unbounded queue.
    capacity: Option<usize>,
    takers: VecDeque<(u64, Promise<Never, A>)>,
    strategy: Box<dyn Strategy<A>>,
    next_id: u64,
    shut_down: bool,
}

impl<A> State<A> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn unpark(&mut self) {
        if let Some(capacity) = self.capacity {
            self.strategy.unpark(&mut self.buffer, capacity);
        }
    }
}

/// A FIFO queue of `A` values.
pub struct Queue<A> {
    state: Arc<Mutex<State<A>>>,
    shutdown_hook: Promise<Never, ()>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            shutdown_hook: self.shutdown_hook.clone(),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("len", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("takers", &state.takers.len())
            .field("pending", &state.strategy.pending())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl<A: Data> Queue<A> {
    fn with_strategy(capacity: Option<usize>, strategy: Box<dyn Strategy<A>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                buffer: VecDeque::new(),
                capacity,
                takers: VecDeque::new(),
                strategy,
                next_id: 0,
                shut_down: false,
            })),
            shutdown_hook: Promise::new(),
        }
    }

    /// A queue holding at most `capacity` items. Offers to a full queue
    /// wait for space. A capacity of zero is treated as one.
    pub fn bounded(capacity: usize) -> UIO<Queue<A>> {
        Effect::succeed_with(move || {
            Queue::with_strategy(Some(capacity.max(1)), Box::new(BackPressure::new()))
        })
    }

    /// A bounded queue that discards offers that do not fit.
    pub fn dropping(capacity: usize) -> UIO<Queue<A>> {
        Effect::succeed_with(move || Queue::with_strategy(Some(capacity.max(1)), Box::new(Dropping)))
    }

    /// A bounded queue where new offers evict the oldest items.
    pub fn sliding(capacity: usize) -> UIO<Queue<A>> {
        Effect::succeed_with(move || Queue::with_strategy(Some(capacity.max(1)), Box::new(Sliding)))
    }

    /// A queue without a capacity limit.
    pub fn unbounded() -> UIO<Queue<A>> {
        Effect::succeed_with(|| Queue::with_strategy(None, Box::new(BackPressure::new())))
    }

    /// The capacity, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.state.lock().capacity
    }

    /// Offer one item. Returns whether it was accepted; a bounded queue
    /// waits for space instead of refusing.
    pub fn offer(&self, item: A) -> UIO<bool> {
        self.offer_all(vec![item])
    }

    /// Offer several items at once, in order.
    pub fn offer_all(&self, items: Vec<A>) -> UIO<bool> {
        let this = self.clone();
        Effect::suspend(move || {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            if state.shut_down {
                return Effect::interrupt();
            }
            let mut items: VecDeque<A> = items.clone().into();

            while !items.is_empty() {
                let Some((_, taker)) = state.takers.pop_front() else {
                    break;
                };
                if let Some(item) = items.pop_front() {
                    taker.try_complete(Exit::succeed(item));
                }
            }

            let free = match state.capacity {
                Some(capacity) => capacity.saturating_sub(state.buffer.len()),
                None => usize::MAX,
            };
            let fits = free.min(items.len());
            state.buffer.extend(items.drain(..fits));
            if items.is_empty() {
                return Effect::succeed(true);
            }

            let capacity = state.capacity.unwrap_or(usize::MAX);
            let id = state.next_id();
            match state
                .strategy
                .handle_surplus(items, &mut state.buffer, capacity, id)
            {
                Surplus::Done(accepted) => Effect::succeed(accepted),
                Surplus::Park(promise) => {
                    drop(guard);
                    tracing::trace!(putter = id, "queue full, offer waiting");
                    promise.await_().on_interrupt(this.remove_putter(id))
                }
            }
        })
    }

    fn remove_putter(&self, id: u64) -> UIO<()> {
        let this = self.clone();
        Effect::succeed_with(move || this.state.lock().strategy.remove(id))
    }

    /// Take the oldest item, waiting for one if the queue is empty.
    pub fn take(&self) -> UIO<A> {
        let this = self.clone();
        Effect::suspend(move || {
            let mut state = this.state.lock();
            if state.shut_down {
                return Effect::interrupt();
            }
            if let Some(item) = state.buffer.pop_front() {
                state.unpark();
                return Effect::succeed(item);
            }
            let id = state.next_id();
            let promise = Promise::new();
            state.takers.push_back((id, promise.clone()));
            drop(state);
            promise
                .await_()
                .on_interrupt(this.remove_taker(id, promise))
        })
    }

    /// Withdraw taker `id`. If an item already reached it, the item goes to
    /// the next taker or back to the head of the buffer.
    fn remove_taker(&self, id: u64, promise: Promise<Never, A>) -> UIO<()> {
        let this = self.clone();
        Effect::succeed_with(move || {
            let mut state = this.state.lock();
            if let Some(index) = state.takers.iter().position(|(taker, _)| *taker == id) {
                state.takers.remove(index);
                return;
            }
            if state.shut_down {
                return;
            }
            if let Some(Exit::Success(item)) = promise.poll_now() {
                match state.takers.pop_front() {
                    Some((_, next)) => {
                        next.try_complete(Exit::succeed(item));
                    }
                    None => state.buffer.push_front(item),
                }
            }
        })
    }

    /// Take every buffered item without waiting.
    pub fn take_all(&self) -> UIO<Vec<A>> {
        self.take_up_to(usize::MAX)
    }

    /// Take at most `max` buffered items without waiting.
    pub fn take_up_to(&self, max: usize) -> UIO<Vec<A>> {
        let this = self.clone();
        Effect::suspend(move || {
            let mut state = this.state.lock();
            if state.shut_down {
                return Effect::interrupt();
            }
            let count = max.min(state.buffer.len());
            let taken: Vec<A> = state.buffer.drain(..count).collect();
            state.unpark();
            Effect::succeed(taken)
        })
    }

    /// Take the oldest item if there is one, without waiting.
    pub fn poll(&self) -> UIO<Option<A>> {
        self.take_up_to(1).map(|mut taken: Vec<A>| taken.pop())
    }

    /// Buffered items plus waiting offers, minus waiting takers. Negative
    /// when fibers are waiting to take.
    pub fn size(&self) -> UIO<isize> {
        let this = self.clone();
        Effect::suspend(move || {
            let state = this.state.lock();
            if state.shut_down {
                return Effect::interrupt();
            }
            let queued = state.buffer.len() + state.strategy.pending();
            Effect::succeed(queued as isize - state.takers.len() as isize)
        })
    }

    /// Whether `shutdown` has run.
    pub fn is_shutdown(&self) -> UIO<bool> {
        let this = self.clone();
        Effect::succeed_with(move || this.state.lock().shut_down)
    }

    /// Shut the queue down: waiting takers and offers are interrupted as the
    /// calling fiber and the buffer is dropped. Idempotent.
    pub fn shutdown(&self) -> UIO<()> {
        let this = self.clone();
        UIO::<FiberId>::fiber_id()
            .flat_map(move |me| {
                let this = this.clone();
                Effect::succeed_with(move || this.shutdown_now(me))
            })
            .uninterruptible()
    }

    fn shutdown_now(&self, by: FiberId) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for (_, taker) in state.takers.drain(..) {
            taker.try_complete(Exit::interrupt(by));
        }
        state.strategy.shutdown(by);
        state.buffer.clear();
        drop(state);
        tracing::debug!(by = %by, "queue shut down");
        self.shutdown_hook.try_complete(Exit::succeed(()));
    }

    /// Wait until the queue is shut down.
    pub fn await_shutdown(&self) -> UIO<()> {
        self.shutdown_hook.await_()
    }
}
