//! Work queue ordered by wake time, FIFO among ties.

use crate::event::Event;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Queued {
    wake_at: i64,
    seq: u64,
    event: Event,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed: BinaryHeap is a max-heap, we want the earliest wake (and the
    // lowest insertion seq among equal wakes) on top.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.wake_at, other.seq).cmp(&(self.wake_at, self.seq))
    }
}

/// Min-heap of pending events keyed by (wake_at, insertion order).
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            wake_at: event.wake_at,
            seq,
            event,
        });
    }

    /// Pop the next event whose wake time has arrived, if any.
    pub fn pop_due(&mut self, now: i64) -> Option<Event> {
        if self.heap.peek().is_some_and(|q| q.wake_at <= now) {
            self.heap.pop().map(|q| q.event)
        } else {
            None
        }
    }

    /// Wake time of the earliest pending event.
    pub fn next_wake(&self) -> Option<i64> {
        self.heap.peek().map(|q| q.wake_at)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
