//! Wait queues and queue disciplines.

use std::collections::VecDeque;
use std::fmt;

/// The order in which queued waiters are promoted when a slot frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum QueueOrder {
    /// The wait queue is processed in a first-in first-out order.
    #[default]
    Fifo,
    /// The wait queue is processed in a last-in first-out order. Only
    /// waiters that actually queued are affected; a request that is
    /// admitted immediately never enters the queue.
    Lifo,
}

impl fmt::Display for QueueOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
        })
    }
}

/// An ordered sequence of waiters pending on a waitable object.
///
/// Waiters are appended as requests arrive; removal for promotion follows
/// the [`QueueOrder`] chosen at construction. The queue is non-empty only
/// while the owning object is at capacity.
#[derive(Debug)]
pub(crate) struct WaitQueue<T> {
    waits: VecDeque<T>,
    order: QueueOrder,
}

impl<T> WaitQueue<T> {
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: VecDeque::new(),
            order,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waits.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Append a waiter. Arrival order is preserved regardless of the
    /// promotion order.
    pub(crate) fn push(&mut self, wait: T) {
        self.waits.push_back(wait);
    }

    /// Remove and return the next waiter to promote, per the discipline.
    pub(crate) fn pop_next(&mut self) -> Option<T> {
        match self.order {
            QueueOrder::Fifo => self.waits.pop_front(),
            QueueOrder::Lifo => self.waits.pop_back(),
        }
    }

    /// Remove the first waiter matching `pred`, preserving the relative
    /// order of the rest. Used by waiting-timeout expiry, which must pull
    /// an entry out of the middle of the queue.
    pub(crate) fn remove_by(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let index = self.waits.iter().position(pred)?;
        self.waits.remove(index)
    }

    /// Remove every queued waiter, in arrival order.
    pub(crate) fn drain_all(&mut self) -> Vec<T> {
        self.waits.drain(..).collect()
    }
}
