//! One-shot-at-a-time signal.

use crate::error::Error;
use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::PromiseId;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

struct SignalState {
    pending: Option<PromiseId>,
    closed: bool,
}

/// A level-style notification: waiters share one pending promise that the
/// next `signal` resolves.
///
/// `wait` returns the current pending promise, creating it on demand, so
/// every waiter present at signal time is released together. Signalling with
/// nobody waiting is a no-op; signals are not queued.
#[derive(Clone)]
pub struct Signal {
    state: Rc<RefCell<SignalState>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// A fresh signal with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SignalState {
                pending: None,
                closed: false,
            })),
        }
    }

    /// The promise the next `signal` resolves; shared by all current
    /// waiters.
    pub fn wait(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        if self.state.borrow().closed {
            return cx.rejected(Error::closed("signal"));
        }
        if let Some(p) = self.state.borrow().pending {
            return p;
        }
        let promise = cx.promise();
        self.state.borrow_mut().pending = Some(promise);
        promise
    }

    /// Releases every current waiter with `value`; a no-op when nobody
    /// waits.
    pub fn signal(&self, cx: &mut TaskCx<'_>, value: impl Into<Value>) {
        let pending = self.state.borrow_mut().pending.take();
        if let Some(promise) = pending {
            cx.runtime().resolve(promise, value);
        }
    }

    /// Closes the signal: current and future waiters fail with `Closed`.
    /// Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let pending = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            s.pending.take()
        };
        if let Some(promise) = pending {
            cx.runtime().reject(promise, Error::closed("signal"));
        }
    }

    /// True while at least one task waits.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.state.borrow().pending.is_some()
    }
}

impl Waitable for Signal {
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        self.wait(cx)
    }
}
