//! Counting semaphore.

use crate::error::Error;
use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::PromiseId;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct SemaphoreState {
    permits: usize,
    waiters: VecDeque<PromiseId>,
    closed: bool,
}

/// A counting semaphore with FIFO grants.
///
/// `acquire` resolves `true` once a permit is taken; `release` returns one,
/// granting it to the longest waiter if any. As a [`Waitable`],
/// `cx.wait(&sem)` acquires.
#[derive(Clone)]
pub struct Semaphore {
    state: Rc<RefCell<SemaphoreState>>,
}

impl Semaphore {
    /// A semaphore holding `permits` free permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(SemaphoreState {
                permits,
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Takes a permit, waiting for one when none is free.
    pub fn acquire(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        enum Outcome {
            Granted,
            Closed,
            Queued,
        }
        let outcome = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                Outcome::Closed
            } else if s.permits > 0 {
                s.permits -= 1;
                Outcome::Granted
            } else {
                Outcome::Queued
            }
        };
        match outcome {
            Outcome::Granted => cx.resolved(true),
            Outcome::Closed => cx.rejected(Error::closed("semaphore")),
            Outcome::Queued => {
                let promise = cx.promise();
                self.state.borrow_mut().waiters.push_back(promise);
                promise
            }
        }
    }

    /// Takes a permit only if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut s = self.state.borrow_mut();
        if s.closed || s.permits == 0 {
            false
        } else {
            s.permits -= 1;
            true
        }
    }

    /// Returns a permit, granting it directly to the longest waiter.
    pub fn release(&self, cx: &mut TaskCx<'_>) {
        let grant = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                return;
            }
            match s.waiters.pop_front() {
                Some(promise) => Some(promise),
                None => {
                    s.permits += 1;
                    None
                }
            }
        };
        if let Some(promise) = grant {
            cx.runtime().resolve(promise, true);
        }
    }

    /// Closes the semaphore: pending and future acquires fail with `Closed`.
    /// Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let waiters = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            std::mem::take(&mut s.waiters)
        };
        for promise in waiters {
            cx.runtime().reject(promise, Error::closed("semaphore"));
        }
    }

    /// Free permits right now.
    #[must_use]
    pub fn permits(&self) -> usize {
        self.state.borrow().permits
    }
}

impl Waitable for Semaphore {
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        self.acquire(cx)
    }
}
