//! Bounded message queue with backpressure.

use crate::error::Error;
use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::PromiseId;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct QueueState {
    buf: VecDeque<Value>,
    capacity: usize,
    gets: VecDeque<PromiseId>,
    puts: VecDeque<(Value, PromiseId)>,
    closed: bool,
}

/// A FIFO queue holding at most `capacity` values.
///
/// `put` resolves `true` once the value is accepted; with the buffer full it
/// waits until a `get` frees a slot, which is the backpressure. `get`
/// resolves with the oldest value, waiting on an empty queue. Close drops
/// buffered values and fails both waiting sides.
#[derive(Clone)]
pub struct MessageQueue {
    state: Rc<RefCell<QueueState>>,
}

impl MessageQueue {
    /// A queue holding at most `capacity` values (raised to 1 when 0).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                buf: VecDeque::new(),
                capacity: capacity.max(1),
                gets: VecDeque::new(),
                puts: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// A queue sized by the runtime's `default_queue_capacity`.
    #[must_use]
    pub fn with_default(cx: &mut TaskCx<'_>) -> Self {
        Self::new(cx.runtime().config().default_queue_capacity)
    }

    /// Enqueues a value, waiting for room when the buffer is full.
    pub fn put(&self, cx: &mut TaskCx<'_>, value: impl Into<Value>) -> PromiseId {
        let value = value.into();
        enum Hit {
            Closed,
            Handoff(PromiseId, Value),
            Buffered,
            Waiting(Value),
        }
        let hit = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                Hit::Closed
            } else if let Some(get) = s.gets.pop_front() {
                // A getter waits, so the buffer is empty; hand over directly.
                Hit::Handoff(get, value)
            } else if s.buf.len() < s.capacity {
                s.buf.push_back(value);
                Hit::Buffered
            } else {
                Hit::Waiting(value)
            }
        };
        match hit {
            Hit::Closed => cx.rejected(Error::closed("message queue")),
            Hit::Handoff(get, value) => {
                cx.runtime().resolve(get, value);
                cx.resolved(true)
            }
            Hit::Buffered => cx.resolved(true),
            Hit::Waiting(value) => {
                let promise = cx.promise();
                self.state.borrow_mut().puts.push_back((value, promise));
                promise
            }
        }
    }

    /// Enqueues only if there is room right now.
    pub fn try_put(&self, value: impl Into<Value>) -> bool {
        let mut s = self.state.borrow_mut();
        if s.closed || !s.gets.is_empty() || s.buf.len() >= s.capacity {
            // With a getter waiting the handoff needs the runtime; callers
            // wanting that path use `put`.
            false
        } else {
            s.buf.push_back(value.into());
            true
        }
    }

    /// Dequeues the oldest value, waiting when the queue is empty.
    pub fn get(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        enum Hit {
            Closed,
            Value(Value, Option<(Value, PromiseId)>),
            Waiting,
        }
        let hit = {
            let mut s = self.state.borrow_mut();
            if let Some(value) = s.buf.pop_front() {
                // Admit the longest-blocked putter into the freed slot.
                let admitted = s.puts.pop_front();
                if let Some((pv, _)) = &admitted {
                    s.buf.push_back(pv.clone());
                }
                Hit::Value(value, admitted)
            } else if s.closed {
                Hit::Closed
            } else {
                Hit::Waiting
            }
        };
        match hit {
            Hit::Closed => cx.rejected(Error::closed("message queue")),
            Hit::Value(value, admitted) => {
                if let Some((_, put)) = admitted {
                    cx.runtime().resolve(put, true);
                }
                cx.resolved(value)
            }
            Hit::Waiting => {
                let promise = cx.promise();
                self.state.borrow_mut().gets.push_back(promise);
                promise
            }
        }
    }

    /// Dequeues only if a value is buffered right now.
    pub fn try_get(&self) -> Option<Value> {
        let mut s = self.state.borrow_mut();
        // No putter admission here; the next `get` picks them up.
        s.buf.pop_front()
    }

    /// Closes the queue: buffered values are dropped and waiting getters and
    /// putters fail with `Closed`. Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let (gets, puts) = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            s.buf.clear();
            (std::mem::take(&mut s.gets), std::mem::take(&mut s.puts))
        };
        for promise in gets {
            cx.runtime().reject(promise, Error::closed("message queue"));
        }
        for (_, promise) in puts {
            cx.runtime().reject(promise, Error::closed("message queue"));
        }
    }

    /// Buffered values right now.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().buf.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.borrow().buf.is_empty()
    }

    /// The buffer bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }
}

impl Waitable for MessageQueue {
    /// Waiting on a queue receives from it.
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        self.get(cx)
    }
}
