//! Append-only work queues with cursor-based draining.
//!
//! A [`WorkQueue`] is an append-only log: producers push, consumers claim
//! positions through an external [`AtomicUsize`] cursor. Several phases can
//! drain the same queue independently (each with its own cursor), and a phase
//! can stop at a frozen end position recorded earlier. Nothing is removed
//! until the queue is re-initialized for the next round.
//!
//! Entries live in a lock-free [`boxcar::Vec`]: `push` claims a slot without
//! blocking other producers or readers. The outer lock is only taken
//! exclusively by [`WorkQueue::initialize`], between rounds.

use std::alloc::Layout;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::QueueError;

/// Append-only multi-producer, multi-consumer work queue.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    items: RwLock<boxcar::Vec<T>>,
}

impl<T: Copy> WorkQueue<T> {
    /// Create an empty queue. `name` only appears in diagnostics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: RwLock::new(boxcar::Vec::new()),
        }
    }

    /// Drop all entries and reserve room for `capacity` new ones.
    ///
    /// Fails when `capacity` entries cannot be laid out in memory; the queue
    /// is left empty in that case.
    pub fn initialize(&self, capacity: usize) -> Result<(), QueueError> {
        let mut items = self.items.write().expect("work queue lock poisoned");
        if Layout::array::<T>(capacity).is_err() {
            *items = boxcar::Vec::new();
            return Err(QueueError::Allocation {
                queue: self.name,
                capacity,
            });
        }
        *items = boxcar::Vec::with_capacity(capacity);
        Ok(())
    }

    /// Append an item; returns its position.
    pub fn enqueue(&self, item: T) -> usize {
        self.items
            .read()
            .expect("work queue lock poisoned")
            .push(item)
    }

    /// Current write position: the number of items ever enqueued this round.
    pub fn end_position(&self) -> usize {
        self.items.read().expect("work queue lock poisoned").count()
    }

    pub fn len(&self) -> usize {
        self.end_position()
    }

    pub fn is_empty(&self) -> bool {
        self.end_position() == 0
    }

    /// Item at `position`, if it has been enqueued.
    pub fn get(&self, position: usize) -> Option<T> {
        let items = self.items.read().expect("work queue lock poisoned");
        if position >= items.count() {
            return None;
        }
        Some(settled(&items, position))
    }

    /// Claim the next item after `cursor`.
    ///
    /// With `multithreaded` the claim is a compare-exchange so concurrent
    /// consumers sharing the cursor never receive the same position; a
    /// single-threaded consumer uses a plain load/store.
    pub fn dequeue_from(&self, cursor: &AtomicUsize, multithreaded: bool) -> Option<T> {
        self.dequeue_bounded(cursor, usize::MAX, multithreaded)
    }

    /// Like [`dequeue_from`](Self::dequeue_from) but never claims a position
    /// at or past `end`.
    pub fn dequeue_bounded(
        &self,
        cursor: &AtomicUsize,
        end: usize,
        multithreaded: bool,
    ) -> Option<T> {
        let items = self.items.read().expect("work queue lock poisoned");
        let limit = end.min(items.count());
        if multithreaded {
            let mut position = cursor.load(Ordering::Acquire);
            loop {
                if position >= limit {
                    return None;
                }
                match cursor.compare_exchange_weak(
                    position,
                    position + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(settled(&items, position)),
                    Err(actual) => position = actual,
                }
            }
        } else {
            let position = cursor.load(Ordering::Relaxed);
            if position >= limit {
                return None;
            }
            cursor.store(position + 1, Ordering::Relaxed);
            Some(settled(&items, position))
        }
    }

    /// Copy of the entries in `[start, end)`.
    pub fn snapshot(&self, start: usize, end: usize) -> Vec<T> {
        let items = self.items.read().expect("work queue lock poisoned");
        let end = end.min(items.count());
        (start..end).map(|position| settled(&items, position)).collect()
    }
}

/// Read a position below `count()`. Slots are claimed in order but written
/// concurrently, so a claimed slot may still be in flight for a moment.
fn settled<T: Copy>(items: &boxcar::Vec<T>, position: usize) -> T {
    loop {
        if let Some(item) = items.get(position) {
            return *item;
        }
        std::hint::spin_loop();
    }
}
