//! What a full queue does with items that do not fit.

use std::collections::VecDeque;

use crate::effect::Never;
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::promise::Promise;

/// Outcome of an offer that did not fit in the buffer.
pub(crate) enum Surplus {
    /// Handled; the offer returns this value.
    Done(bool),
    /// The offering fiber must wait on this promise.
    Park(Promise<Never, bool>),
}

/// Overflow policy of a bounded queue. Every method runs under the queue
/// lock.
pub(crate) trait Strategy<A>: Send {
    /// Deal with `surplus`, which did not fit in `buffer`. `id` identifies
    /// the offer so it can be withdrawn later.
    fn handle_surplus(
        &mut self,
        surplus: VecDeque<A>,
        buffer: &mut VecDeque<A>,
        capacity: usize,
        id: u64,
    ) -> Surplus;

    /// Move waiting items into space freed in `buffer`.
    fn unpark(&mut self, buffer: &mut VecDeque<A>, capacity: usize);

    /// Items waiting for space.
    fn pending(&self) -> usize;

    /// Withdraw the waiting items of offer `id`.
    fn remove(&mut self, id: u64);

    /// Drop every waiting item, interrupting their offers as `by`.
    fn shutdown(&mut self, by: FiberId);
}

// ============================================================================
// BackPressure
// ============================================================================

struct Putter<A> {
    id: u64,
    item: A,
    promise: Promise<Never, bool>,
    /// Completing this item completes the offer.
    last: bool,
}

/// Offers wait until every item is in the buffer. Waiting offers are served
/// in arrival order.
pub(crate) struct BackPressure<A> {
    putters: VecDeque<Putter<A>>,
}

impl<A> BackPressure<A> {
    pub(crate) fn new() -> Self {
        Self {
            putters: VecDeque::new(),
        }
    }
}

impl<A: Send> Strategy<A> for BackPressure<A> {
    fn handle_surplus(
        &mut self,
        surplus: VecDeque<A>,
        _buffer: &mut VecDeque<A>,
        _capacity: usize,
        id: u64,
    ) -> Surplus {
        let promise = Promise::new();
        let count = surplus.len();
        for (index, item) in surplus.into_iter().enumerate() {
            self.putters.push_back(Putter {
                id,
                item,
                promise: promise.clone(),
                last: index + 1 == count,
            });
        }
        Surplus::Park(promise)
    }

    fn unpark(&mut self, buffer: &mut VecDeque<A>, capacity: usize) {
        while buffer.len() < capacity {
            let Some(putter) = self.putters.pop_front() else {
                break;
            };
            buffer.push_back(putter.item);
            if putter.last {
                putter.promise.try_complete(Exit::succeed(true));
            }
        }
    }

    fn pending(&self) -> usize {
        self.putters.len()
    }

    fn remove(&mut self, id: u64) {
        self.putters.retain(|putter| putter.id != id);
    }

    fn shutdown(&mut self, by: FiberId) {
        for putter in self.putters.drain(..) {
            putter.promise.try_complete(Exit::interrupt(by));
        }
    }
}

// ============================================================================
// Dropping / Sliding
// ============================================================================

/// Surplus items are discarded and the offer reports `false`.
pub(crate) struct Dropping;

impl<A> Strategy<A> for Dropping {
    fn handle_surplus(
        &mut self,
        surplus: VecDeque<A>,
        _buffer: &mut VecDeque<A>,
        _capacity: usize,
        _id: u64,
    ) -> Surplus {
        tracing::trace!(dropped = surplus.len(), "queue full, dropping");
        Surplus::Done(false)
    }

    fn unpark(&mut self, _buffer: &mut VecDeque<A>, _capacity: usize) {}

    fn pending(&self) -> usize {
        0
    }

    fn remove(&mut self, _id: u64) {}

    fn shutdown(&mut self, _by: FiberId) {}
}

/// Surplus items evict the oldest buffered ones; the offer reports `true`.
pub(crate) struct Sliding;

impl<A> Strategy<A> for Sliding {
    fn handle_surplus(
        &mut self,
        surplus: VecDeque<A>,
        buffer: &mut VecDeque<A>,
        capacity: usize,
        _id: u64,
    ) -> Surplus {
        for item in surplus {
            if buffer.len() >= capacity {
                buffer.pop_front();
            }
            buffer.push_back(item);
        }
        Surplus::Done(true)
    }

    fn unpark(&mut self, _buffer: &mut VecDeque<A>, _capacity: usize) {}

    fn pending(&self) -> usize {
        0
    }

    fn remove(&mut self, _id: u64) {}

    fn shutdown(&mut self, _by: FiberId) {}
}
