//! Task and step records.
//!
//! A task is a linked list of steps plus the bookkeeping the scheduler needs
//! to drive it: the current position, suspension state, fork accounting,
//! termination hooks and task-local bindings. Records live in arenas and are
//! removed when the task is finalized, so stale `TaskId`s miss instead of
//! aliasing a recycled slot.

use crate::error::Error;
use crate::promise::Settlement;
use crate::runtime::TaskCx;
use crate::types::{PromiseId, StepId, StepOutcome, TaskId};
use crate::value::Value;
use std::collections::HashMap;

/// A step body. Re-runnable because repeat loops re-execute their first step.
pub type StepBlock = Box<dyn FnMut(&mut TaskCx<'_>, Value) -> StepOutcome>;
/// Hook invoked when a task completes successfully.
pub type SuccessHook = Box<dyn FnOnce(&mut TaskCx<'_>, Value)>;
/// Hook invoked when a task fails (including cancellation).
pub type FailureHook = Box<dyn FnOnce(&mut TaskCx<'_>, Error)>;
/// Hook invoked after success/failure hooks, regardless of outcome.
pub type FinalHook = Box<dyn FnOnce(&mut TaskCx<'_>, &Settlement)>;
/// Cleanup block; deferred blocks run LIFO during finalization.
pub type DeferBlock = Box<dyn FnOnce(&mut TaskCx<'_>)>;

/// What executing a step does.
pub(crate) enum StepKind {
    /// Run the stored block.
    Plain,
    /// Start a forked child; the parent joins it at the next non-fork step.
    Fork { child: TaskId },
    /// Start a detached child.
    Spawn { child: TaskId },
    /// Start a repeat-loop child; joined like a fork.
    Repeat { child: TaskId },
}

pub(crate) struct StepRecord {
    pub(crate) task: TaskId,
    pub(crate) kind: StepKind,
    /// Present for `Plain` steps; taken during execution and put back.
    pub(crate) block: Option<StepBlock>,
    pub(crate) next: Option<StepId>,
    /// Guards against double-enqueue.
    pub(crate) queued: bool,
}

/// Loop control signalled by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Break,
    Continue,
}

pub(crate) struct TaskRecord {
    pub(crate) name: Option<String>,
    pub(crate) parent: Option<TaskId>,
    pub(crate) children: Vec<TaskId>,

    // Step list and position.
    pub(crate) first_step: Option<StepId>,
    pub(crate) last_step: Option<StepId>,
    /// Splice point for steps created while a step is executing.
    pub(crate) insert_after: Option<StepId>,
    pub(crate) current_step: Option<StepId>,

    // Suspension.
    /// Set while suspended (pause, wait, sleep, fork boundary).
    pub(crate) paused_step: Option<StepId>,
    /// Suspension is specifically the join at a fork boundary.
    pub(crate) blocked_on_forks: bool,
    /// Not yet started; the activating step (or a resume) clears this.
    pub(crate) pending_start: bool,
    /// Declared paused; the activating step leaves it for a resume to start.
    pub(crate) start_paused: bool,

    // Data flowing between steps.
    pub(crate) step_result: Value,
    pub(crate) step_error: Option<Error>,
    pub(crate) control: Option<Control>,
    pub(crate) pending_return: Option<Value>,

    // Fork accounting (on the parent).
    pub(crate) fork_pending: usize,
    pub(crate) fork_results: Vec<Option<Value>>,
    /// On a forked/repeat child: its slot in the parent's results.
    pub(crate) fork_slot: Option<usize>,

    // Termination.
    pub(crate) on_success: Option<SuccessHook>,
    pub(crate) on_failure: Option<FailureHook>,
    pub(crate) on_final: Option<FinalHook>,
    pub(crate) deferred: Vec<DeferBlock>,
    pub(crate) done: PromiseId,
    pub(crate) defer_override: Option<Settlement>,

    // Task-local bindings.
    pub(crate) bindings: HashMap<String, Value>,
    /// Cache of binding name -> owning task, filled by ancestor walks.
    pub(crate) binding_cache: HashMap<String, TaskId>,

    // Flags.
    pub(crate) is_fork: bool,
    pub(crate) is_repeat: bool,
    pub(crate) was_spawned: bool,
    pub(crate) cancelled: bool,
    pub(crate) stopping: bool,
    pub(crate) terminating: bool,
}

impl TaskRecord {
    pub(crate) fn new(parent: Option<TaskId>, done: PromiseId) -> Self {
        Self {
            name: None,
            parent,
            children: Vec::new(),
            first_step: None,
            last_step: None,
            insert_after: None,
            current_step: None,
            paused_step: None,
            blocked_on_forks: false,
            pending_start: false,
            start_paused: false,
            step_result: Value::Null,
            step_error: None,
            control: None,
            pending_return: None,
            fork_pending: 0,
            fork_results: Vec::new(),
            fork_slot: None,
            on_success: None,
            on_failure: None,
            on_final: None,
            deferred: Vec::new(),
            done,
            defer_override: None,
            bindings: HashMap::new(),
            binding_cache: HashMap::new(),
            is_fork: false,
            is_repeat: false,
            was_spawned: false,
            cancelled: false,
            stopping: false,
            terminating: false,
        }
    }

    /// True once the task is suspended waiting for anything.
    pub(crate) fn is_suspended(&self) -> bool {
        self.paused_step.is_some() || self.pending_start
    }
}
