//! Single-resolution promises.
//!
//! A promise settles at most once; the first resolution or rejection wins and
//! later attempts are silently ignored. Waiters are recorded in subscription
//! order and delivery is always routed through the scheduler queue, so a
//! handler never runs inside the call that settled the promise. Subscribing
//! to an already-settled promise replays the settlement, again deferred.
//!
//! Promises are addressed by [`PromiseId`]; the records live in the runtime's
//! promise arena and survive the task that created them, which is what makes
//! late subscription and join-style keep-alive work.

use crate::error::Error;
use crate::runtime::{Runtime, TaskCx};
use crate::types::{CombineId, PromiseId, StepOutcome, TaskId};
use crate::value::Value;

/// How a promise finished.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Resolved with a value.
    Ok(Value),
    /// Rejected with an error.
    Err(Error),
}

impl Settlement {
    /// Converts into a standard result.
    #[must_use]
    pub fn into_result(self) -> Result<Value, Error> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(e) => Err(e),
        }
    }

    /// Returns true if this settlement is a resolution.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Handler invoked when a chained promise resolves.
pub type OkHandler = Box<dyn FnOnce(&mut TaskCx<'_>, Value) -> StepOutcome>;
/// Handler invoked when a chained promise rejects.
pub type ErrHandler = Box<dyn FnOnce(&mut TaskCx<'_>, Error) -> StepOutcome>;

/// A party waiting on a promise.
pub(crate) enum Waiter {
    /// Resume a suspended task with the settlement.
    Task(TaskId),
    /// Run a then-style handler and settle `next` with its outcome.
    Handler {
        on_ok: Option<OkHandler>,
        on_err: Option<ErrHandler>,
        next: PromiseId,
    },
    /// Forward the settlement to another promise unchanged.
    Chain(PromiseId),
    /// Feed the settlement into input `index` of a combinator.
    Combine { combine: CombineId, index: usize },
}

pub(crate) enum PromiseState {
    Pending,
    Settled(Settlement),
}

pub(crate) struct PromiseRecord {
    pub(crate) state: PromiseState,
    pub(crate) waiters: Vec<Waiter>,
}

impl PromiseRecord {
    pub(crate) fn new() -> Self {
        Self {
            state: PromiseState::Pending,
            waiters: Vec::new(),
        }
    }
}

/// Anything a task can suspend on.
///
/// The single method hands back the promise that represents the next
/// completion of the waitable: a task's done promise, a semaphore permit, a
/// signal's next firing. Creating that promise may register state on the
/// primitive, which is why the method takes the execution context.
pub trait Waitable {
    /// Returns the promise to suspend on.
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId;
}

impl Waitable for PromiseId {
    fn promise(&self, _cx: &mut TaskCx<'_>) -> PromiseId {
        *self
    }
}

impl Runtime {
    /// Creates a fresh pending promise.
    pub fn new_promise(&mut self) -> PromiseId {
        let idx = self.promises.insert(PromiseRecord::new());
        PromiseId::from_arena(idx)
    }

    /// Creates a promise already resolved with `value`.
    pub fn resolved(&mut self, value: impl Into<Value>) -> PromiseId {
        let p = self.new_promise();
        self.resolve(p, value.into());
        p
    }

    /// Creates a promise already rejected with `error`.
    pub fn rejected(&mut self, error: Error) -> PromiseId {
        let p = self.new_promise();
        self.reject(p, error);
        p
    }

    /// Resolves a promise. No-op if it already settled.
    pub fn resolve(&mut self, promise: PromiseId, value: impl Into<Value>) {
        self.settle(promise, Settlement::Ok(value.into()));
    }

    /// Rejects a promise. No-op if it already settled.
    pub fn reject(&mut self, promise: PromiseId, error: Error) {
        self.settle(promise, Settlement::Err(error));
    }

    pub(crate) fn settle(&mut self, promise: PromiseId, settlement: Settlement) {
        let Some(record) = self.promises.get_mut(promise.0) else {
            return;
        };
        if matches!(record.state, PromiseState::Settled(_)) {
            return;
        }
        tracing::trace!(promise = %promise, ok = settlement.is_ok(), "promise settled");
        record.state = PromiseState::Settled(settlement.clone());
        let waiters = std::mem::take(&mut record.waiters);
        for waiter in waiters {
            self.queue.push_delivery(waiter, settlement.clone());
        }
    }

    /// Registers a waiter. Delivery is deferred through the scheduler even
    /// when the promise has already settled.
    pub(crate) fn subscribe(&mut self, promise: PromiseId, waiter: Waiter) {
        let Some(record) = self.promises.get_mut(promise.0) else {
            // The promise arena never forgets settled promises, so a miss is
            // a stale handle from a different runtime.
            self.queue.push_delivery(
                waiter,
                Settlement::Err(Error::internal("unknown promise")),
            );
            return;
        };
        match &record.state {
            PromiseState::Pending => record.waiters.push(waiter),
            PromiseState::Settled(settlement) => {
                let settlement = settlement.clone();
                self.queue.push_delivery(waiter, settlement);
            }
        }
    }

    /// Chains handlers onto a promise, returning the promise for the
    /// handler's own outcome.
    ///
    /// A missing handler passes the corresponding settlement through
    /// unchanged. A handler returning [`Value::Promise`] re-chains: the
    /// returned promise settles when that inner promise does.
    pub fn then(
        &mut self,
        promise: PromiseId,
        on_ok: Option<OkHandler>,
        on_err: Option<ErrHandler>,
    ) -> PromiseId {
        let next = self.new_promise();
        self.subscribe(
            promise,
            Waiter::Handler {
                on_ok,
                on_err,
                next,
            },
        );
        next
    }

    /// Returns the settlement of a promise, or `None` while pending.
    #[must_use]
    pub fn settlement(&self, promise: PromiseId) -> Option<Result<Value, Error>> {
        match &self.promises.get(promise.0)?.state {
            PromiseState::Pending => None,
            PromiseState::Settled(s) => Some(s.clone().into_result()),
        }
    }

    /// Returns true while the promise has not settled.
    #[must_use]
    pub fn is_pending(&self, promise: PromiseId) -> bool {
        self.promises
            .get(promise.0)
            .is_some_and(|r| matches!(r.state, PromiseState::Pending))
    }
}
