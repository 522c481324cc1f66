//! Blocking Priority Queue
//!
//! A thread-safe max-heap with a blocking `dequeue`. All mutations go through
//! the write side of one `RwLock`; `peek`/`len`/`is_empty` share the read
//! side. The number of enqueued-but-undequeued items is mirrored by a
//! counting semaphore so consumers can sleep without holding the lock.
//!
//! `parking_lot::RwLock` is task-fair: a waiting writer blocks new readers,
//! so a steady stream of `len()` callers cannot starve producers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use super::semaphore::Semaphore;

/// Heap slot carrying an insertion sequence so equal priorities pop FIFO
#[derive(Debug)]
struct Entry<T> {
    item: T,
    seq: u64,
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .cmp(&other.item)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for Entry<T> {}

#[derive(Debug)]
struct Heap<T> {
    entries: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// Blocking concurrent priority queue (greatest item first)
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: RwLock<Heap<T>>,
    available: Semaphore,
}

impl<T: Ord> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> PriorityQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: RwLock::new(Heap {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
            available: Semaphore::new(0),
        }
    }

    /// Insert an item. Only ever waits for the write lock.
    pub fn enqueue(&self, item: T) {
        let mut heap = self.heap.write();
        let seq = heap.next_seq;
        heap.next_seq = heap.next_seq.wrapping_add(1);
        heap.entries.push(Entry { item, seq });
        self.available.release(1);
    }

    /// Remove and return the greatest item, blocking while the queue is empty
    pub fn dequeue(&self) -> T {
        loop {
            self.available.acquire();
            // The permit may belong to an item a concurrent `remove` already
            // took out; go back to sleep in that case.
            if let Some(entry) = self.heap.write().entries.pop() {
                return entry.item;
            }
        }
    }

    /// Remove and return the greatest item if one is queued
    pub fn try_dequeue(&self) -> Option<T> {
        if !self.available.try_acquire() {
            return None;
        }
        self.heap.write().entries.pop().map(|entry| entry.item)
    }

    /// Remove the first queued item equal to `key`.
    ///
    /// Returns whether an item was removed. A successful removal also takes
    /// back its availability permit.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        T: PartialEq<Q>,
    {
        let mut heap = self.heap.write();
        let mut removed = false;
        heap.entries.retain(|entry| {
            if !removed && entry.item == *key {
                removed = true;
                false
            } else {
                true
            }
        });
        if removed {
            self.available.try_acquire();
        }
        removed
    }

    /// Borrow the greatest item without removing it
    pub fn peek(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.heap.read(), |heap| {
            heap.entries.peek().map(|entry| &entry.item)
        })
        .ok()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.heap.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.read().entries.is_empty()
    }
}
