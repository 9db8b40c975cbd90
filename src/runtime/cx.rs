//! The per-task context handed to step blocks and hooks.
//!
//! A `TaskCx` is a mutable view of the runtime scoped to one task. Step
//! blocks receive one for the duration of a call and use it to splice in more
//! steps, fork and spawn subtasks, suspend, touch bindings, and reach the
//! promise layer. It borrows the runtime, so nothing escapes the
//! single-threaded discipline.

use crate::error::{Error, ErrorKind, Result};
use crate::promise::{Settlement, Waitable, Waiter};
use crate::runtime::task::{DeferBlock, FailureHook, FinalHook, StepKind, SuccessHook};
use crate::runtime::{Runtime, TaskHandle};
use crate::types::{PromiseId, StepOutcome, TaskId, Time};
use crate::value::Value;

/// Mutable view of the runtime scoped to one task.
pub struct TaskCx<'rt> {
    rt: &'rt mut Runtime,
    task: TaskId,
}

impl<'rt> TaskCx<'rt> {
    pub(crate) fn new(rt: &'rt mut Runtime, task: TaskId) -> Self {
        Self { rt, task }
    }

    /// The task this context belongs to.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task
    }

    /// Current time on the runtime clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.rt.now()
    }

    /// Escape hatch to the whole runtime.
    pub fn runtime(&mut self) -> &mut Runtime {
        self.rt
    }

    // === Structure ===

    /// Appends a step to this task.
    ///
    /// Called while one of the task's steps is executing, the new step is
    /// spliced right after it (consecutive calls chain in call order);
    /// otherwise it goes to the end of the list.
    pub fn step(
        &mut self,
        block: impl FnMut(&mut TaskCx<'_>, Value) -> StepOutcome + 'static,
    ) -> &mut Self {
        self.rt
            .add_step(self.task, StepKind::Plain, Some(Box::new(block)));
        self
    }

    /// Declares a forked subtask.
    ///
    /// The builder runs now to lay out the child's steps; the child starts
    /// when this task reaches the activation point just spliced in. The
    /// parent joins all outstanding forks at its next non-fork step, whose
    /// input becomes the fork results in declaration order (a single fork's
    /// value directly, several as a list).
    pub fn fork(&mut self, body: impl FnOnce(&mut TaskCx<'_>)) -> TaskHandle {
        self.fork_inner(body, false)
    }

    /// Like [`fork`](Self::fork), but the child waits for a `resume` before
    /// its first step runs. It still occupies a join slot.
    pub fn fork_paused(&mut self, body: impl FnOnce(&mut TaskCx<'_>)) -> TaskHandle {
        self.fork_inner(body, true)
    }

    fn fork_inner(&mut self, body: impl FnOnce(&mut TaskCx<'_>), paused: bool) -> TaskHandle {
        let child = self.new_child(true, paused);
        if let Some(c) = self.rt.tasks.get_mut(child.0) {
            c.is_fork = true;
        }
        {
            let mut cx = TaskCx::new(self.rt, child);
            body(&mut cx);
        }
        self.rt.add_step(self.task, StepKind::Fork { child }, None);
        TaskHandle::new(child, self.rt.done_promise(child))
    }

    /// Declares a detached subtask.
    ///
    /// Starts like a fork but is never joined: the parent does not wait for
    /// it, its failure does not propagate, and if the parent finishes first
    /// the child is reparented to the grandparent.
    pub fn spawn(&mut self, body: impl FnOnce(&mut TaskCx<'_>)) -> TaskHandle {
        self.spawn_inner(body, false)
    }

    /// Like [`spawn`](Self::spawn), but the child waits for a `resume`.
    pub fn spawn_paused(&mut self, body: impl FnOnce(&mut TaskCx<'_>)) -> TaskHandle {
        self.spawn_inner(body, true)
    }

    fn spawn_inner(&mut self, body: impl FnOnce(&mut TaskCx<'_>), paused: bool) -> TaskHandle {
        let child = self.new_child(false, paused);
        if let Some(c) = self.rt.tasks.get_mut(child.0) {
            c.was_spawned = true;
        }
        {
            let mut cx = TaskCx::new(self.rt, child);
            body(&mut cx);
        }
        self.rt.add_step(self.task, StepKind::Spawn { child }, None);
        TaskHandle::new(child, self.rt.done_promise(child))
    }

    /// Declares a repeat-loop subtask.
    ///
    /// The block is the loop's sole static step and re-runs each iteration;
    /// steps it splices in during an iteration are discarded when the loop
    /// rewinds. The loop ends when the block (or a spliced step) signals
    /// `Break`, returns, or fails; `Continue` rewinds early. Joined like a
    /// fork.
    pub fn repeat(
        &mut self,
        block: impl FnMut(&mut TaskCx<'_>, Value) -> StepOutcome + 'static,
    ) -> TaskHandle {
        let child = self.new_child(true, false);
        if let Some(c) = self.rt.tasks.get_mut(child.0) {
            c.is_repeat = true;
        }
        self.rt
            .add_step(child, StepKind::Plain, Some(Box::new(block)));
        self.rt.add_step(self.task, StepKind::Repeat { child }, None);
        TaskHandle::new(child, self.rt.done_promise(child))
    }

    fn new_child(&mut self, joined: bool, paused: bool) -> TaskId {
        let child = self.rt.create_task(Some(self.task), None);
        if joined {
            let slot = self.rt.tasks.get_mut(self.task.0).map(|t| {
                t.fork_results.push(None);
                t.fork_pending += 1;
                t.fork_results.len() - 1
            });
            if let Some(c) = self.rt.tasks.get_mut(child.0) {
                c.fork_slot = slot;
            }
        }
        if paused {
            if let Some(c) = self.rt.tasks.get_mut(child.0) {
                c.start_paused = true;
            }
        }
        child
    }

    // === Suspension ===

    /// Suspends this task until something calls `resume` on it. The resume
    /// value becomes the next step's input. Only meaningful from a running
    /// step block.
    pub fn pause(&mut self) {
        self.suspend();
    }

    /// Suspends this task until the waitable settles. A resolution value
    /// becomes the next step's input; a rejection fails the task.
    pub fn wait(&mut self, target: &impl Waitable) {
        let promise = target.promise(self);
        self.wait_promise(promise);
    }

    /// [`wait`](Self::wait) on a bare promise id.
    pub fn wait_promise(&mut self, promise: PromiseId) {
        self.suspend();
        self.rt.subscribe(promise, Waiter::Task(self.task));
    }

    /// Suspends this task for `millis` of runtime-clock time. The resumed
    /// step's input is `Null`.
    pub fn sleep(&mut self, millis: u64) {
        let promise = self.rt.timer(Time::from_millis(millis), Value::Null);
        self.wait_promise(promise);
    }

    fn suspend(&mut self) {
        if self.rt.running != Some(self.task) {
            return;
        }
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            if t.paused_step.is_none() {
                t.paused_step = t.current_step;
            }
        }
    }

    // === Completion control ===

    /// Finishes this task early with `value` once the current step returns,
    /// skipping its remaining steps (outstanding forks are still joined).
    /// From a deferred block, overrides the settlement instead.
    pub fn task_return(&mut self, value: impl Into<Value>) {
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            if t.terminating {
                t.defer_override = Some(Settlement::Ok(value.into()));
            } else {
                t.pending_return = Some(value.into());
            }
        }
    }

    /// Fails this task with `error` once the current step returns. From a
    /// deferred block, overrides the settlement instead.
    pub fn raise(&mut self, error: Error) {
        let terminating = self
            .rt
            .tasks
            .get(self.task.0)
            .is_some_and(|t| t.terminating);
        if terminating {
            if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
                t.defer_override = Some(Settlement::Err(error));
            }
        } else {
            let _ = self.rt.raise(self.task, error);
        }
    }

    /// Injects an error into another task. See [`Runtime::raise`].
    pub fn raise_on(&mut self, target: TaskId, error: Error) -> Result<()> {
        self.rt.raise(target, error)
    }

    /// Cancels another task and its subtree. See [`Runtime::cancel_task`].
    pub fn cancel(&mut self, target: TaskId) {
        self.rt.cancel_task(target);
    }

    /// Resumes a paused task with `value`. See [`Runtime::resume_task`].
    ///
    /// # Errors
    ///
    /// `NotPaused` when the target is running or blocked on something else.
    pub fn resume(&mut self, target: TaskId, value: impl Into<Value>) -> Result<()> {
        self.rt.resume_task(target, value)
    }

    /// Requests a cooperative stop of another task. See [`Runtime::stop_task`].
    ///
    /// # Errors
    ///
    /// `TaskGone` when the target no longer exists.
    pub fn stop(&mut self, target: TaskId) -> Result<()> {
        self.rt.stop_task(target)
    }

    /// Waits for another task to finish, resuming with its result.
    ///
    /// Joining the owner of a binding keeps it alive for as long as this
    /// task needs the binding.
    pub fn join(&mut self, handle: TaskHandle) {
        self.wait_promise(handle.done());
    }

    /// True once someone requested a cooperative stop of this task.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.rt
            .tasks
            .get(self.task.0)
            .is_some_and(|t| t.stopping)
    }

    /// True once this task has been cancelled.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.rt
            .tasks
            .get(self.task.0)
            .is_some_and(|t| t.cancelled)
    }

    // === Termination hooks ===

    /// Runs when the task finishes successfully, with its result.
    pub fn on_success(&mut self, hook: impl FnOnce(&mut TaskCx<'_>, Value) + 'static) -> &mut Self {
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            t.on_success = Some(Box::new(hook) as SuccessHook);
        }
        self
    }

    /// Runs when the task fails (including cancellation), with the error.
    pub fn on_failure(&mut self, hook: impl FnOnce(&mut TaskCx<'_>, Error) + 'static) -> &mut Self {
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            t.on_failure = Some(Box::new(hook) as FailureHook);
        }
        self
    }

    /// Runs after the success/failure hook, whatever the outcome.
    pub fn on_final(
        &mut self,
        hook: impl FnOnce(&mut TaskCx<'_>, &Settlement) + 'static,
    ) -> &mut Self {
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            t.on_final = Some(Box::new(hook) as FinalHook);
        }
        self
    }

    /// Registers cleanup that runs during finalization. Deferred blocks run
    /// in reverse registration order, before the hooks.
    pub fn defer(&mut self, block: impl FnOnce(&mut TaskCx<'_>) + 'static) -> &mut Self {
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            t.deferred.push(Box::new(block) as DeferBlock);
        }
        self
    }

    // === Bindings ===

    /// Defines (or overwrites) a binding on this task. Visible to this task
    /// and its descendants.
    pub fn var(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        if let Some(t) = self.rt.tasks.get_mut(self.task.0) {
            t.bindings.insert(name.into(), value.into());
        }
        self
    }

    /// Assigns to the nearest binding of `name` up the ancestor chain,
    /// defining it on this task when no ancestor has it.
    ///
    /// # Errors
    ///
    /// `StaleBinding` when a cached owner has since been finalized.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        match self.binding_owner(name)? {
            Some(owner) => {
                if let Some(t) = self.rt.tasks.get_mut(owner.0) {
                    t.bindings.insert(name.to_owned(), value.into());
                }
                Ok(())
            }
            None => {
                self.var(name.to_owned(), value);
                Ok(())
            }
        }
    }

    /// Reads the nearest binding of `name` up the ancestor chain.
    ///
    /// # Errors
    ///
    /// `StaleBinding` when a cached owner has since been finalized.
    pub fn get(&mut self, name: &str) -> Result<Option<Value>> {
        match self.binding_owner(name)? {
            Some(owner) => Ok(self
                .rt
                .tasks
                .get(owner.0)
                .and_then(|t| t.bindings.get(name).cloned())),
            None => Ok(None),
        }
    }

    /// Resolves `name` to the task that owns it, caching the answer so later
    /// reads and writes go straight to the owner.
    ///
    /// The owner dying while cached is the hazard [`join`](Self::join)
    /// exists to prevent.
    ///
    /// # Errors
    ///
    /// `StaleBinding` when a cached owner has since been finalized.
    pub fn binding(&mut self, name: &str) -> Result<Option<TaskId>> {
        self.binding_owner(name)
    }

    /// Finds which task owns `name`, walking parents and caching the answer.
    fn binding_owner(&mut self, name: &str) -> Result<Option<TaskId>> {
        let cached = self
            .rt
            .tasks
            .get(self.task.0)
            .and_then(|t| t.binding_cache.get(name).copied());
        if let Some(owner) = cached {
            if self.rt.tasks.contains(owner.0) {
                return Ok(Some(owner));
            }
            return Err(Error::new(ErrorKind::StaleBinding)
                .with_message(format!("binding '{name}' outlived its owning task {owner}")));
        }
        let mut cursor = Some(self.task);
        while let Some(tid) = cursor {
            let Some(t) = self.rt.tasks.get(tid.0) else {
                break;
            };
            if t.bindings.contains_key(name) {
                if tid != self.task {
                    if let Some(me) = self.rt.tasks.get_mut(self.task.0) {
                        me.binding_cache.insert(name.to_owned(), tid);
                    }
                }
                return Ok(Some(tid));
            }
            cursor = t.parent;
        }
        Ok(None)
    }

    // === Promises ===

    /// A fresh pending promise.
    pub fn promise(&mut self) -> PromiseId {
        self.rt.new_promise()
    }

    /// A promise already resolved with `value`.
    pub fn resolved(&mut self, value: impl Into<Value>) -> PromiseId {
        self.rt.resolved(value)
    }

    /// A promise already rejected with `error`.
    pub fn rejected(&mut self, error: Error) -> PromiseId {
        self.rt.rejected(error)
    }
}
