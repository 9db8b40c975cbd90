//! Reentrant lock.

use crate::error::{Error, ErrorKind, Result};
use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::{PromiseId, TaskId};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct LockState {
    owner: Option<TaskId>,
    depth: usize,
    waiters: VecDeque<(TaskId, PromiseId)>,
    closed: bool,
}

/// A cooperative reentrant lock with FIFO handoff.
///
/// Like [`Mutex`](crate::sync::Mutex), except the holding task may acquire
/// again; each acquire must be matched by a release, and the lock hands off
/// only when the depth drops to zero. The acquire promise resolves with the
/// resulting depth.
#[derive(Clone)]
pub struct Lock {
    state: Rc<RefCell<LockState>>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// A fresh, unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(LockState {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Requests the lock for the calling task; reentry succeeds immediately.
    /// The promise resolves with the hold depth after this acquire.
    pub fn acquire(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        let task = cx.task_id();
        let depth = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                None
            } else if s.owner == Some(task) {
                s.depth += 1;
                Some(s.depth)
            } else if s.owner.is_none() {
                s.owner = Some(task);
                s.depth = 1;
                Some(1)
            } else {
                let promise = cx.promise();
                s.waiters.push_back((task, promise));
                return promise;
            }
        };
        match depth {
            Some(d) => cx.resolved(i64::try_from(d).unwrap_or(i64::MAX)),
            None => cx.rejected(Error::closed("lock")),
        }
    }

    /// Releases one level of the lock; at depth zero the longest-waiting
    /// task takes over (at depth one).
    ///
    /// # Errors
    ///
    /// `NotOwner` when the calling task does not hold it.
    pub fn release(&self, cx: &mut TaskCx<'_>) -> Result<()> {
        let task = cx.task_id();
        let next = {
            let mut s = self.state.borrow_mut();
            if s.owner != Some(task) {
                return Err(Error::new(ErrorKind::NotOwner)
                    .with_message(format!("lock released by non-owner {task}")));
            }
            s.depth -= 1;
            if s.depth > 0 {
                return Ok(());
            }
            let next = s.waiters.pop_front();
            match next {
                Some((t, _)) => {
                    s.owner = Some(t);
                    s.depth = 1;
                }
                None => s.owner = None,
            }
            next
        };
        if let Some((_, promise)) = next {
            cx.runtime().resolve(promise, 1);
        }
        Ok(())
    }

    /// Closes the lock: pending and future acquires fail with `Closed`.
    /// Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let waiters = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            std::mem::take(&mut s.waiters)
        };
        for (_, promise) in waiters {
            cx.runtime().reject(promise, Error::closed("lock"));
        }
    }

    /// Current hold depth (zero when free).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.borrow().depth
    }
}

impl Waitable for Lock {
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        self.acquire(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::test_utils::init_test_logging;
    use crate::types::StepOutcome;
    use crate::value::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn reentry_deepens_and_release_unwinds() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let lock = Lock::new();
        let depths: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));

        let sink = depths.clone();
        let l = lock.clone();
        rt.task(move |cx| {
            let lock = l.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(lock.acquire(cx))));
            let (lock, sink2) = (l.clone(), sink.clone());
            cx.step(move |cx, input| {
                sink2.borrow_mut().push(input);
                StepOutcome::Ok(Value::Promise(lock.acquire(cx)))
            });
            let (lock, sink2) = (l.clone(), sink.clone());
            cx.step(move |cx, input| {
                sink2.borrow_mut().push(input);
                lock.release(cx).unwrap();
                lock.release(cx).unwrap();
                StepOutcome::done()
            });
        });

        rt.run();
        assert_eq!(*depths.borrow(), vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn handoff_waits_for_full_unwind() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let lock = Lock::new();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let (l, o) = (lock.clone(), order.clone());
        rt.task(move |cx| {
            let lock = l.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(lock.acquire(cx))));
            let lock = l.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(lock.acquire(cx))));
            let (lock, order) = (l.clone(), o.clone());
            cx.step(move |cx, _| {
                order.borrow_mut().push("first releases once");
                lock.release(cx).unwrap();
                StepOutcome::done()
            });
            let (lock, order) = (l.clone(), o.clone());
            cx.step(move |cx, _| {
                order.borrow_mut().push("first releases twice");
                lock.release(cx).unwrap();
                StepOutcome::done()
            });
        });

        let (l, o) = (lock, order.clone());
        rt.task(move |cx| {
            let lock = l.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(lock.acquire(cx))));
            let order = o.clone();
            cx.step(move |_, _| {
                order.borrow_mut().push("second holds");
                StepOutcome::done()
            });
        });

        rt.run();
        assert_eq!(
            *order.borrow(),
            vec!["first releases once", "first releases twice", "second holds"]
        );
    }

    #[test]
    fn close_rejects_waiters() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let lock = Lock::new();
        let failures: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

        let l = lock.clone();
        rt.task(move |cx| {
            let lock = l.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(lock.acquire(cx))));
            cx.step(move |cx, _| {
                l.close(cx);
                l.close(cx);
                StepOutcome::done()
            });
        });

        let sink = failures.clone();
        rt.task(move |cx| {
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(lock.acquire(cx))));
            cx.on_failure(move |_, e| {
                if e.is_closed() {
                    *sink.borrow_mut() += 1;
                }
            });
        });

        rt.run();
        assert_eq!(*failures.borrow(), 1);
    }
}
