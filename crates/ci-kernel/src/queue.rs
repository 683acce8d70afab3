//! Priority job queue: `(priority desc, sequence asc)` ordering.
//!
//! The queue is owned exclusively by the scheduler (a plain
//! `std::sync::Mutex` around a `BinaryHeap`, never shared further).
//! `std::collections::BinaryHeap` is a max-heap, so the `Ord` impl below
//! only needs to put "should dequeue first" on top.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::domain::{Job, JobId};

struct QueueEntry {
    job: Job,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.job.sequence == other.job.sequence
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; on a tie, the earlier sequence (FIFO) wins,
        // which means *smaller* sequence must compare as *greater* here
        // since `BinaryHeap` is a max-heap.
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.sequence.cmp(&self.job.sequence))
    }
}

/// A priority-ordered FIFO-tiebreak pending-job queue.
pub struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Assign the next sequence number without inserting -- used when a job
    /// needs a stable sequence before any other queue interaction (e.g. the
    /// orchestrator submitting jobs in configuration order).
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Insert a job that already carries a `sequence` (assigned either by
    /// [`Self::next_sequence`] or preserved from before a re-enqueue).
    pub fn enqueue(&mut self, job: Job) {
        self.heap.push(QueueEntry { job });
    }

    pub fn dequeue(&mut self) -> Option<Job> {
        self.heap.pop().map(|e| e.job)
    }

    pub fn peek(&self) -> Option<&Job> {
        self.heap.peek().map(|e| &e.job)
    }

    /// Remove a queued job by id, used by pre-dispatch cancellation.
    /// O(n): the queue is not expected to hold more than a few hundred
    /// pending jobs at once.
    pub fn remove(&mut self, job_id: JobId) -> Option<Job> {
        let items: Vec<QueueEntry> = std::mem::take(&mut self.heap).into_vec();
        let mut removed = None;
        for entry in items {
            if removed.is_none() && entry.job.id == job_id {
                removed = Some(entry.job);
            } else {
                self.heap.push(entry);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;

    fn job(id: JobId, priority: i64, sequence: u64) -> Job {
        Job {
            id,
            build_id: 1,
            commands: vec![],
            image: "alpine".into(),
            env: vec![],
            repo_url: String::new(),
            provider_name: String::new(),
            provider_url: String::new(),
            provider_token: String::new(),
            commit_sha: String::new(),
            repo_full_name: String::new(),
            priority,
            status: JobStatus::Queued,
            start_time: None,
            end_time: None,
            worker_id: None,
            sequence,
        }
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let mut q = JobQueue::new();
        q.enqueue(job(1, 500, 0));
        q.enqueue(job(2, 2000, 1));
        assert_eq!(q.dequeue().unwrap().id, 2);
        assert_eq!(q.dequeue().unwrap().id, 1);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut q = JobQueue::new();
        q.enqueue(job(1, 1000, 0));
        q.enqueue(job(2, 1000, 1));
        q.enqueue(job(3, 1000, 2));
        assert_eq!(q.dequeue().unwrap().id, 1);
        assert_eq!(q.dequeue().unwrap().id, 2);
        assert_eq!(q.dequeue().unwrap().id, 3);
    }

    #[test]
    fn remove_drops_only_the_matching_job_and_preserves_order() {
        let mut q = JobQueue::new();
        q.enqueue(job(1, 1000, 0));
        q.enqueue(job(2, 1000, 1));
        q.enqueue(job(3, 1000, 2));

        let removed = q.remove(2);
        assert_eq!(removed.unwrap().id, 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue().unwrap().id, 1);
        assert_eq!(q.dequeue().unwrap().id, 3);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = JobQueue::new();
        q.enqueue(job(1, 1000, 0));
        assert_eq!(q.peek().unwrap().id, 1);
        assert_eq!(q.len(), 1);
    }
}
