//! External handle to a task.

use crate::error::{Error, Result};
use crate::promise::Waitable;
use crate::runtime::{Runtime, TaskCx};
use crate::types::{PromiseId, TaskId};
use crate::value::Value;

/// A copyable handle to a task and its done promise.
///
/// Returned by task creation; outliving the task is fine, since the id is
/// generational every operation on a finished task reports `TaskGone` (or is
/// a no-op) instead of touching a recycled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    task: TaskId,
    done: PromiseId,
}

impl TaskHandle {
    pub(crate) const fn new(task: TaskId, done: PromiseId) -> Self {
        Self { task, done }
    }

    /// The task's id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.task
    }

    /// The promise that settles with the task's outcome.
    #[must_use]
    pub const fn done(&self) -> PromiseId {
        self.done
    }

    /// The task's outcome, once it has finished.
    #[must_use]
    pub fn outcome(&self, rt: &Runtime) -> Option<Result<Value>> {
        rt.settlement(self.done)
    }

    /// True once the task has finished (either way).
    #[must_use]
    pub fn is_done(&self, rt: &Runtime) -> bool {
        rt.settlement(self.done).is_some()
    }

    /// True while the task record still exists.
    #[must_use]
    pub fn is_alive(&self, rt: &Runtime) -> bool {
        rt.task_alive(self.task)
    }

    /// Cancels the task and its subtree.
    pub fn cancel(&self, rt: &mut Runtime) {
        rt.cancel_task(self.task);
    }

    /// Requests a cooperative stop.
    pub fn stop(&self, rt: &mut Runtime) -> Result<()> {
        rt.stop_task(self.task)
    }

    /// Injects an error into the task.
    pub fn raise(&self, rt: &mut Runtime, error: Error) -> Result<()> {
        rt.raise(self.task, error)
    }

    /// Resumes the task if paused, with `value` as the next step's input.
    pub fn resume(&self, rt: &mut Runtime, value: impl Into<Value>) -> Result<()> {
        rt.resume_task(self.task, value)
    }
}

impl Waitable for TaskHandle {
    fn promise(&self, _cx: &mut TaskCx<'_>) -> PromiseId {
        self.done
    }
}
