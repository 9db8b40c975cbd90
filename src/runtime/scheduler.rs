//! The ready queue.
//!
//! A single FIFO queue of jobs drives the whole runtime: step executions and
//! promise deliveries interleave in the order they were made ready. One tick
//! drains the queue to empty, including jobs enqueued while draining, which
//! is what gives promise delivery its "next tick, never synchronous"
//! guarantee without a second queue.

use crate::promise::{Settlement, Waiter};
use crate::types::StepId;
use std::collections::VecDeque;

/// A unit of scheduler work.
pub(crate) enum Job {
    /// Execute a step; its record names the owning task.
    Step { step: StepId },
    /// Deliver a settlement to a promise waiter.
    Deliver {
        waiter: Waiter,
        settlement: Settlement,
    },
}

/// FIFO queue of pending jobs.
pub(crate) struct ReadyQueue {
    jobs: VecDeque<Job>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    pub(crate) fn push_step(&mut self, step: StepId) {
        self.jobs.push_back(Job::Step { step });
    }

    pub(crate) fn push_delivery(&mut self, waiter: Waiter, settlement: Settlement) {
        self.jobs.push_back(Job::Deliver { waiter, settlement });
    }

    pub(crate) fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
