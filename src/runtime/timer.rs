//! Timers and the clock.
//!
//! Timers are (deadline, promise) pairs in a min-heap; firing a timer just
//! resolves its promise with the stored payload, so an early resolution (a
//! `Timeout` signalled by hand, a cancelled sleep) turns the eventual firing
//! into a no-op. Ties on the deadline break by creation order.

use crate::types::{PromiseId, Time};
use crate::value::Value;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

pub(crate) struct TimerEntry {
    pub(crate) deadline: Time,
    pub(crate) seq: u64,
    pub(crate) promise: PromiseId,
    pub(crate) payload: Value,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Pending timers, ordered by deadline then creation.
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub(crate) fn schedule(&mut self, deadline: Time, promise: PromiseId, payload: Value) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            promise,
            payload,
        }));
    }

    pub(crate) fn next_deadline(&self) -> Option<Time> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Removes and returns every timer due at or before `now`, in order.
    pub(crate) fn take_due(&mut self, now: Time) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// The runtime's clock.
pub(crate) enum Clock {
    Wall { epoch: std::time::Instant },
    Virtual { now: Time },
}

impl Clock {
    pub(crate) fn now(&self) -> Time {
        match self {
            Self::Wall { epoch } => {
                Time::from_nanos(u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
            }
            Self::Virtual { now } => *now,
        }
    }

    /// Moves the clock to `deadline`: a virtual clock jumps, a wall clock
    /// sleeps out the remaining real time.
    pub(crate) fn advance_to(&mut self, deadline: Time) {
        match self {
            Self::Wall { .. } => {
                let remaining = deadline.saturating_sub(self.now());
                if remaining > Time::ZERO {
                    std::thread::sleep(std::time::Duration::from_nanos(remaining.as_nanos()));
                }
            }
            Self::Virtual { now } => {
                *now = (*now).max(deadline);
            }
        }
    }
}
