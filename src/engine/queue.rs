//! FIFO of discovered records shared by the discovery worker and the poller.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    sealed: bool,
}

/// Result of [`ResultQueue::pop_if`].
#[derive(Debug, PartialEq, Eq)]
pub enum PopIf<T> {
    Empty,
    Rejected,
    Popped(T),
}

/// Thread-safe ordered queue.
///
/// Once sealed, `push` drops records until the next `reset`. The engine seals a
/// queue when its operation is canceled so nothing lands after the cancel.
#[derive(Debug)]
pub struct ResultQueue<T> {
    inner: Mutex<QueueInner<T>>,
}

impl<T> ResultQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                sealed: false,
            }),
        }
    }

    // A panic while holding the lock cannot leave the deque half-updated
    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append at the tail. Returns false if the queue is sealed.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.sealed {
            return false;
        }
        inner.items.push_back(item);
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Pop the head only if `pred` accepts it; both happen under one lock.
    pub fn pop_if<F>(&self, pred: F) -> PopIf<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.lock();
        let accepted = match inner.items.front() {
            None => return PopIf::Empty,
            Some(head) => pred(head),
        };
        if !accepted {
            return PopIf::Rejected;
        }
        inner.items.pop_front().map_or(PopIf::Empty, PopIf::Popped)
    }

    pub fn peek_with<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        self.lock().items.front().map(f)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    /// Drop stale records and accept pushes again
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.sealed = false;
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }
}

impl<T> Default for ResultQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
