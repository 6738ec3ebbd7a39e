// Time-ordered event queue

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::sr_interface::Event;

/// Heap entry ordered by (time, insertion sequence)
struct QueuedEvent {
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event
            .time
            .total_cmp(&other.event.time)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of simulation events.
///
/// Events with equal timestamps pop in insertion order, so a run is fully
/// reproducible even when two events land on the same instant.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(QueuedEvent { seq, event }));
    }

    /// Remove and return the earliest event
    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(queued)| queued.event)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sr_interface::{EventKind, SimTime};

    fn purchase(time: SimTime, tx: u64) -> Event {
        Event {
            time,
            user: 0,
            tx,
            amount: 1.0,
            kind: EventKind::Purchase,
        }
    }

    #[test]
    fn test_pops_in_time_order() {
        let mut queue = EventQueue::new();
        for (i, t) in [5.0, 1.0, 3.5, 0.25, 9.0, 2.0].iter().enumerate() {
            queue.push(purchase(*t, i as u64));
        }
        assert_eq!(queue.len(), 6);

        let mut last = f64::NEG_INFINITY;
        while let Some(event) = queue.pop() {
            assert!(event.time >= last);
            last = event.time;
        }
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_ties_pop_in_insertion_order() {
        let mut queue = EventQueue::new();
        queue.push(purchase(2.0, 10));
        queue.push(purchase(1.0, 11));
        queue.push(purchase(2.0, 12));
        queue.push(purchase(2.0, 13));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| e.tx).collect();
        assert_eq!(order, vec![11, 10, 12, 13]);
    }

    #[test]
    fn test_interleaved_push_pop() {
        let mut queue = EventQueue::new();
        queue.push(purchase(10.0, 0));
        queue.push(purchase(4.0, 1));
        assert_eq!(queue.pop().map(|e| e.tx), Some(1));
        queue.push(purchase(6.0, 2));
        queue.push(purchase(12.0, 3));
        assert_eq!(queue.pop().map(|e| e.tx), Some(2));
        assert_eq!(queue.pop().map(|e| e.tx), Some(0));
        assert_eq!(queue.pop().map(|e| e.tx), Some(3));
    }
}
