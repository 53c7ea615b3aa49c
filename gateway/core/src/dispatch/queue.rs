//! Bounded Priority Queue
//!
//! Inbound requests wait here until a worker slot frees up. Higher priority
//! first; FIFO within a priority. Closing the queue rejects new pushes while
//! letting consumers drain what is already queued.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::request::Priority;

/// Push refused
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// At capacity
    #[error("queue full ({0} pending)")]
    Full(usize),
    /// Closed for shutdown
    #[error("queue closed")]
    Closed,
}

struct Queued<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority, then lower sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Queued<T>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded multi-producer priority queue
pub struct RequestQueue<T> {
    state: Mutex<State<T>>,
    available: Notify,
    capacity: usize,
}

impl<T> RequestQueue<T> {
    /// Create a queue holding at most `capacity` items
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Notify::new(),
            capacity,
        }
    }

    /// Enqueue without waiting
    pub fn push(&self, item: T, priority: Priority) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.heap.len() >= self.capacity {
                return Err(QueueError::Full(state.heap.len()));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Queued {
                priority,
                seq,
                item,
            });
        }
        self.available.notify_one();
        Ok(())
    }

    /// Dequeue, waiting for an item; `None` once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if let Some(queued) = state.heap.pop() {
                    return Some(queued.item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().heap.pop().map(|q| q.item)
    }

    /// Take out the first waiting item matching `pred`, if any
    ///
    /// Runs under the queue lock, so an item is either removed here or
    /// handed to exactly one consumer.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut state = self.state.lock();
        let mut entries = std::mem::take(&mut state.heap).into_vec();
        let removed = entries
            .iter()
            .position(|q| pred(&q.item))
            .map(|idx| entries.swap_remove(idx).item);
        state.heap = BinaryHeap::from(entries);
        removed
    }

    /// Stop accepting pushes and wake every waiting consumer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Whether [`Self::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Items waiting
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
