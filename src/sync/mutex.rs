//! Non-reentrant mutex.

use crate::error::{Error, ErrorKind, Result};
use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::{PromiseId, TaskId};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct MutexState {
    owner: Option<TaskId>,
    waiters: VecDeque<(TaskId, PromiseId)>,
    closed: bool,
}

/// A cooperative mutex with FIFO handoff.
///
/// `acquire` resolves immediately when free, otherwise once the holder
/// releases; waiters are served strictly in arrival order. Acquiring a mutex
/// the task already holds is an error (see [`Lock`](crate::sync::Lock) for
/// the reentrant variant). The handle is a cheap clone over shared state.
#[derive(Clone)]
pub struct Mutex {
    state: Rc<RefCell<MutexState>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// A fresh, unheld mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MutexState {
                owner: None,
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Requests the mutex for the calling task. The promise resolves `true`
    /// once the mutex is held.
    ///
    /// # Errors
    ///
    /// `MutexHeld` when the calling task already holds it.
    pub fn acquire(&self, cx: &mut TaskCx<'_>) -> Result<PromiseId> {
        let task = cx.task_id();
        let grabbed = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                None
            } else if s.owner == Some(task) {
                return Err(Error::new(ErrorKind::MutexHeld)
                    .with_message(format!("mutex already held by {task}")));
            } else if s.owner.is_none() {
                s.owner = Some(task);
                Some(true)
            } else {
                Some(false)
            }
        };
        match grabbed {
            None => Ok(cx.rejected(Error::closed("mutex"))),
            Some(true) => Ok(cx.resolved(true)),
            Some(false) => {
                let promise = cx.promise();
                self.state.borrow_mut().waiters.push_back((task, promise));
                Ok(promise)
            }
        }
    }

    /// Releases the mutex, handing it to the longest-waiting task if any.
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
                    .with_message(format!("mutex released by non-owner {task}")));
            }
            let next = s.waiters.pop_front();
            s.owner = next.map(|(t, _)| t);
            next
        };
        if let Some((_, promise)) = next {
            cx.runtime().resolve(promise, true);
        }
        Ok(())
    }

    /// Closes the mutex: pending and future acquires fail with `Closed`.
    /// Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let waiters = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            std::mem::take(&mut s.waiters)
        };
        for (_, promise) in waiters {
            cx.runtime().reject(promise, Error::closed("mutex"));
        }
    }

    /// True while some task holds the mutex.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state.borrow().owner.is_some()
    }
}

impl Waitable for Mutex {
    /// Waiting on a mutex acquires it; a reentrant acquire surfaces as a
    /// rejected promise instead of an immediate error.
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        match self.acquire(cx) {
            Ok(p) => p,
            Err(e) => cx.rejected(e),
        }
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
    fn reentrant_acquire_is_an_error() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let mutex = Mutex::new();
        let saw: Rc<RefCell<Option<ErrorKind>>> = Rc::new(RefCell::new(None));
        let sink = saw.clone();
        rt.task(move |cx| {
            let m = mutex.clone();
            cx.step(move |cx, _| match m.acquire(cx) {
                Ok(p) => StepOutcome::Ok(Value::Promise(p)),
                Err(e) => e.into(),
            });
            let m = mutex.clone();
            cx.step(move |cx, _| {
                *sink.borrow_mut() = m.acquire(cx).err().map(|e| e.kind());
                StepOutcome::done()
            });
        });
        rt.run();
        assert_eq!(*saw.borrow(), Some(ErrorKind::MutexHeld));
    }

    #[test]
    fn release_by_non_owner_is_an_error() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let mutex = Mutex::new();
        let saw: Rc<RefCell<Option<ErrorKind>>> = Rc::new(RefCell::new(None));
        let sink = saw.clone();
        rt.task(move |cx| {
            cx.step(move |cx, _| {
                *sink.borrow_mut() = mutex.release(cx).err().map(|e| e.kind());
                StepOutcome::done()
            });
        });
        rt.run();
        assert_eq!(*saw.borrow(), Some(ErrorKind::NotOwner));
    }

    #[test]
    fn close_rejects_waiters() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let mutex = Mutex::new();
        let failures: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

        let holder = mutex.clone();
        rt.task(move |cx| {
            let m = holder.clone();
            cx.step(move |cx, _| match m.acquire(cx) {
                Ok(p) => StepOutcome::Ok(Value::Promise(p)),
                Err(e) => e.into(),
            });
            let m = holder;
            cx.step(move |cx, _| {
                m.close(cx);
                StepOutcome::done()
            });
        });

        let blocked = mutex.clone();
        let sink = failures.clone();
        rt.task(move |cx| {
            let m = blocked;
            cx.step(move |cx, _| match m.acquire(cx) {
                Ok(p) => StepOutcome::Ok(Value::Promise(p)),
                Err(e) => e.into(),
            });
            cx.on_failure(move |_, e| {
                if e.is_closed() {
                    *sink.borrow_mut() += 1;
                }
            });
        });

        rt.run();
        assert_eq!(*failures.borrow(), 1);
    }

    #[test]
    fn the_holder_may_still_release_after_close() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let mutex = Mutex::new();
        let released: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let sink = released.clone();
        rt.task(move |cx| {
            let m = mutex.clone();
            cx.step(move |cx, _| match m.acquire(cx) {
                Ok(p) => StepOutcome::Ok(Value::Promise(p)),
                Err(e) => e.into(),
            });
            cx.step(move |cx, _| {
                mutex.close(cx);
                mutex.close(cx);
                *sink.borrow_mut() = mutex.release(cx).is_ok();
                assert!(!mutex.is_held());
                StepOutcome::done()
            });
        });
        rt.run();
        assert!(*released.borrow());
    }
}
