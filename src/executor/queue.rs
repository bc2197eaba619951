use std::cmp::Ordering;
use std::collections::BinaryHeap;

use uuid::Uuid;

/// One waiting job. Ordered so the heap pops the highest priority first
/// and breaks ties by earliest submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    priority: i32,
    seq: u64,
    job_id: Uuid,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of jobs waiting to run.
#[derive(Debug, Default)]
pub struct PendingQueue {
    heap: BinaryHeap<PendingEntry>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job_id: Uuid, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(PendingEntry {
            priority,
            seq,
            job_id,
        });
    }

    /// Takes the highest-priority, earliest-submitted job id.
    pub fn pop(&mut self) -> Option<Uuid> {
        self.heap.pop().map(|entry| entry.job_id)
    }

    /// Drops `job_id` from the queue. Returns whether it was present.
    pub fn remove(&mut self, job_id: &Uuid) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.job_id != *job_id);
        self.heap.len() < before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
