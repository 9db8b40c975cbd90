//! The runtime engine.
//!
//! A single-threaded cooperative scheduler: tasks are linked lists of steps,
//! one FIFO ready queue drives both step execution and promise delivery, and
//! timers advance either real or virtual time. Nothing here is `Send`; all
//! concurrency is interleaving at step boundaries.
//!
//! # Scheduling discipline
//!
//! After a step finishes, the scheduler decides what happens next, in order:
//!
//! 1. a suspended task (pause, wait, sleep, fork boundary) stays suspended;
//! 2. loop control (`Break`/`Continue`) resolves against the enclosing
//!    repeat task, and is an error outside one;
//! 3. an error cancels the task's remaining subtasks, waits out any
//!    outstanding forks, and finalizes the task;
//! 4. an early return behaves like 3 without the cancellation;
//! 5. otherwise the next step is enqueued, except that a non-fork step
//!    blocks until every forked sibling created before it has finished,
//!    and their results (in creation order) become its input.
//!
//! # Finalization order
//!
//! Deferred blocks run LIFO, then exactly one of the success/failure hooks,
//! then the final hook, then the done promise settles, then the parent is
//! notified and surviving spawned children are reparented to the
//! grandparent. Finalizing a task twice is a bug and panics.

use crate::combinator::CombineRecord;
use crate::error::{Error, ErrorKind, Result};
use crate::promise::{PromiseRecord, Settlement, Waiter};
use crate::runtime::config::{ClockMode, RuntimeConfig};
use crate::runtime::scheduler::{Job, ReadyQueue};
use crate::runtime::task::{Control, StepBlock, StepKind, StepRecord, TaskRecord};
use crate::runtime::timer::{Clock, Timers};
use crate::runtime::{TaskCx, TaskHandle};
use crate::types::{PromiseId, StepId, StepOutcome, TaskId, Time};
use crate::util::Arena;
use crate::value::Value;

/// The cooperative runtime.
///
/// Owns every task, step, promise and timer. All mutation goes through
/// methods taking `&mut self` or through the [`TaskCx`] handed to step
/// blocks; there is no ambient global state.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) tasks: Arena<TaskRecord>,
    pub(crate) steps: Arena<StepRecord>,
    pub(crate) promises: Arena<PromiseRecord>,
    pub(crate) combines: Arena<CombineRecord>,
    pub(crate) queue: ReadyQueue,
    pub(crate) timers: Timers,
    pub(crate) running: Option<TaskId>,
    clock: Clock,
    root: TaskId,
    ticks: u64,
    steps_run: u64,
    jobs_run: u64,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Creates a runtime with default configuration (wall clock).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a runtime on a virtual clock.
    ///
    /// `run()` jumps straight to each next timer deadline, so sleeps cost
    /// nothing and schedules replay identically. The constructor for tests.
    #[must_use]
    pub fn deterministic() -> Self {
        Self::with_config(RuntimeConfig::default().with_clock(ClockMode::Virtual))
    }

    /// Creates a runtime with the given configuration.
    #[must_use]
    pub fn with_config(mut config: RuntimeConfig) -> Self {
        config.normalize();
        let clock = match config.clock {
            ClockMode::Wall => Clock::Wall {
                epoch: std::time::Instant::now(),
            },
            ClockMode::Virtual => Clock::Virtual { now: Time::ZERO },
        };
        let mut promises = Arena::new();
        let done = PromiseId::from_arena(promises.insert(PromiseRecord::new()));
        let mut tasks = Arena::new();
        let root = TaskId::from_arena(tasks.insert(TaskRecord::new(None, done)));
        Self {
            config,
            tasks,
            steps: Arena::new(),
            promises,
            combines: Arena::new(),
            queue: ReadyQueue::new(),
            timers: Timers::new(),
            running: None,
            clock,
            root,
            ticks: 0,
            steps_run: 0,
            jobs_run: 0,
        }
    }

    /// The root task. It owns every top-level task and never finishes.
    #[must_use]
    pub const fn root(&self) -> TaskId {
        self.root
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current time on the runtime's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Number of completed queue drains.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of steps executed so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps_run
    }

    /// Returns true while the task record exists (not yet finalized).
    #[must_use]
    pub fn task_alive(&self, task: TaskId) -> bool {
        self.tasks.contains(task.0)
    }

    // === Task creation ===

    /// Creates and starts a top-level task.
    ///
    /// The builder runs immediately to register the task's steps and hooks;
    /// the first step executes on the next tick.
    pub fn task(&mut self, body: impl FnOnce(&mut TaskCx<'_>)) -> TaskHandle {
        self.top_level(None, body)
    }

    /// Creates and starts a named top-level task. The name only shows up in
    /// logs.
    pub fn task_named(
        &mut self,
        name: impl Into<String>,
        body: impl FnOnce(&mut TaskCx<'_>),
    ) -> TaskHandle {
        self.top_level(Some(name.into()), body)
    }

    fn top_level(&mut self, name: Option<String>, body: impl FnOnce(&mut TaskCx<'_>)) -> TaskHandle {
        let root = self.root;
        let task = self.create_task(Some(root), name);
        if let Some(t) = self.tasks.get_mut(task.0) {
            t.was_spawned = true;
        }
        let done = self.done_promise(task);
        {
            let mut cx = TaskCx::new(self, task);
            body(&mut cx);
        }
        self.start_task(task);
        TaskHandle::new(task, done)
    }

    pub(crate) fn create_task(&mut self, parent: Option<TaskId>, name: Option<String>) -> TaskId {
        let done = self.new_promise();
        let idx = self.tasks.insert(TaskRecord::new(parent, done));
        let task = TaskId::from_arena(idx);
        if let Some(t) = self.tasks.get_mut(idx) {
            t.name = name;
            t.pending_start = true;
        }
        if let Some(p) = parent {
            if let Some(pr) = self.tasks.get_mut(p.0) {
                pr.children.push(task);
            }
        }
        tracing::debug!(task = %task, parent = ?parent.map(|p| p.to_string()), "task created");
        task
    }

    pub(crate) fn done_promise(&self, task: TaskId) -> PromiseId {
        self.tasks.get(task.0).map_or_else(
            || PromiseId::from_arena(crate::util::ArenaIndex::new(u32::MAX, u32::MAX)),
            |t| t.done,
        )
    }

    /// Enqueues the task's first step, or finalizes it immediately when it
    /// has none.
    pub(crate) fn start_task(&mut self, task: TaskId) {
        let first = match self.tasks.get_mut(task.0) {
            Some(t) => {
                t.pending_start = false;
                t.first_step
            }
            None => return,
        };
        match first {
            Some(step) => {
                if let Some(t) = self.tasks.get_mut(task.0) {
                    t.current_step = Some(step);
                }
                self.enqueue_step(step);
            }
            None => self.finalize(task),
        }
    }

    // === Step list management ===

    /// Appends a step, or splices it after the insertion point while a step
    /// of the same task is executing. Consecutive insertions chain in call
    /// order.
    pub(crate) fn add_step(
        &mut self,
        task: TaskId,
        kind: StepKind,
        block: Option<StepBlock>,
    ) -> Option<StepId> {
        let (insert_after, last_step) = match self.tasks.get(task.0) {
            Some(t) => (t.insert_after, t.last_step),
            None => return None,
        };
        let sid = StepId::from_arena(self.steps.insert(StepRecord {
            task,
            kind,
            block,
            next: None,
            queued: false,
        }));
        if let Some(at) = insert_after {
            let at_next = self.steps.get(at.0).and_then(|s| s.next);
            if let Some(s) = self.steps.get_mut(sid.0) {
                s.next = at_next;
            }
            if let Some(s) = self.steps.get_mut(at.0) {
                s.next = Some(sid);
            }
            if let Some(t) = self.tasks.get_mut(task.0) {
                if t.last_step == Some(at) {
                    t.last_step = Some(sid);
                }
                t.insert_after = Some(sid);
            }
        } else {
            if let Some(last) = last_step {
                if let Some(s) = self.steps.get_mut(last.0) {
                    s.next = Some(sid);
                }
            } else if let Some(t) = self.tasks.get_mut(task.0) {
                t.first_step = Some(sid);
            }
            if let Some(t) = self.tasks.get_mut(task.0) {
                t.last_step = Some(sid);
            }
        }
        Some(sid)
    }

    fn enqueue_step(&mut self, step: StepId) {
        if let Some(s) = self.steps.get_mut(step.0) {
            debug_assert!(!s.queued, "step {step} double-enqueued");
            s.queued = true;
            self.queue.push_step(step);
        }
    }

    // === Driving ===

    /// Drains the ready queue, including jobs enqueued while draining.
    pub fn tick(&mut self) {
        while let Some(job) = self.queue.pop() {
            self.jobs_run += 1;
            if self.valve_tripped() {
                tracing::warn!(
                    max_steps = self.config.max_steps,
                    pending = self.queue.len(),
                    "scheduler valve tripped; aborting tick"
                );
                return;
            }
            self.dispatch(job);
        }
        self.ticks += 1;
    }

    fn valve_tripped(&self) -> bool {
        self.config.max_steps > 0 && self.jobs_run > self.config.max_steps
    }

    /// Runs to completion: drains the queue, advances the clock to each next
    /// timer deadline, and returns when no work remains.
    pub fn run(&mut self) {
        loop {
            self.tick();
            if self.valve_tripped() {
                return;
            }
            if self.queue.is_empty() {
                match self.timers.next_deadline() {
                    Some(deadline) => {
                        self.clock.advance_to(deadline);
                        self.fire_due_timers();
                    }
                    None => return,
                }
            }
            if self.queue.is_empty() && self.timers.is_empty() {
                return;
            }
        }
    }

    /// Drains ready jobs and already-due timers without advancing the clock.
    pub fn run_until_idle(&mut self) {
        loop {
            self.tick();
            self.fire_due_timers();
            if self.queue.is_empty() || self.valve_tripped() {
                return;
            }
        }
    }

    /// Schedules a promise to resolve with `payload` after `delay`.
    pub fn timer(&mut self, delay: Time, payload: Value) -> PromiseId {
        let promise = self.new_promise();
        let deadline = self.clock.now() + delay;
        self.timers.schedule(deadline, promise, payload);
        promise
    }

    fn fire_due_timers(&mut self) {
        let now = self.clock.now();
        for entry in self.timers.take_due(now) {
            tracing::trace!(promise = %entry.promise, deadline = %entry.deadline, "timer fired");
            self.resolve(entry.promise, entry.payload);
        }
    }

    fn dispatch(&mut self, job: Job) {
        match job {
            Job::Step { step } => self.run_step(step),
            Job::Deliver { waiter, settlement } => self.deliver(waiter, settlement),
        }
    }

    // === Step execution ===

    fn run_step(&mut self, step: StepId) {
        let task = match self.steps.get_mut(step.0) {
            Some(s) => {
                s.queued = false;
                s.task
            }
            None => return,
        };
        {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return;
            };
            if t.terminating {
                return;
            }
            t.current_step = Some(step);
            // An error raised before the step ran skips the body.
            if t.step_error.is_some() {
                self.schedule_next(task);
                return;
            }
        }
        self.steps_run += 1;

        enum Exec {
            Block(StepBlock, Value),
            Start(TaskId),
        }

        let exec = {
            let kind_child = match self.steps.get(step.0).map(|s| &s.kind) {
                Some(StepKind::Plain) => None,
                Some(
                    StepKind::Fork { child } | StepKind::Spawn { child } | StepKind::Repeat { child },
                ) => Some(*child),
                None => return,
            };
            match kind_child {
                Some(child) => Exec::Start(child),
                None => {
                    let block = self.steps.get_mut(step.0).and_then(|s| s.block.take());
                    let Some(block) = block else {
                        self.schedule_next(task);
                        return;
                    };
                    let input = self
                        .tasks
                        .get_mut(task.0)
                        .map(|t| std::mem::take(&mut t.step_result))
                        .unwrap_or_default();
                    Exec::Block(block, input)
                }
            }
        };

        match exec {
            Exec::Start(child) => {
                let start_now = self.tasks.get(child.0).is_some_and(|c| !c.start_paused);
                if start_now {
                    self.start_task(child);
                }
            }
            Exec::Block(mut block, input) => {
                if let Some(t) = self.tasks.get_mut(task.0) {
                    t.insert_after = Some(step);
                }
                self.running = Some(task);
                let outcome = {
                    let mut cx = TaskCx::new(self, task);
                    block(&mut cx, input)
                };
                self.running = None;
                if let Some(s) = self.steps.get_mut(step.0) {
                    s.block = Some(block);
                }
                if let Some(t) = self.tasks.get_mut(task.0) {
                    t.insert_after = None;
                }
                self.apply_outcome(task, outcome);
            }
        }
        self.schedule_next(task);
    }

    fn apply_outcome(&mut self, task: TaskId, outcome: StepOutcome) {
        let wait_on = {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return;
            };
            match outcome {
                StepOutcome::Ok(Value::Promise(p)) => {
                    if t.paused_step.is_none() {
                        t.paused_step = t.current_step;
                        Some(p)
                    } else {
                        None
                    }
                }
                StepOutcome::Ok(v) => {
                    if t.paused_step.is_none() {
                        t.step_result = v;
                    }
                    None
                }
                StepOutcome::Err(e) => {
                    if t.step_error.is_none() {
                        t.step_error = Some(e);
                    }
                    None
                }
                StepOutcome::Break => {
                    t.control = Some(Control::Break);
                    None
                }
                StepOutcome::Continue => {
                    t.control = Some(Control::Continue);
                    None
                }
                StepOutcome::Return(v) => {
                    t.pending_return = Some(v);
                    None
                }
            }
        };
        if let Some(p) = wait_on {
            self.subscribe(p, Waiter::Task(task));
        }
    }

    /// Decides what a task does after the current step settled. See the
    /// module docs for the precedence.
    fn schedule_next(&mut self, task: TaskId) {
        let (failing, returning, breaking, continuing, is_repeat, fork_pending, current) = {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return;
            };
            if t.terminating || t.is_suspended() {
                return;
            }
            let control = t.control.take();
            if control.is_some() && !t.is_repeat && t.step_error.is_none() {
                t.step_error = Some(
                    Error::new(ErrorKind::OutsideLoop)
                        .with_message("break/continue outside a repeat loop"),
                );
            }
            let failing = t.step_error.is_some();
            (
                failing,
                t.pending_return.is_some(),
                t.is_repeat && matches!(control, Some(Control::Break)) && !failing,
                t.is_repeat && matches!(control, Some(Control::Continue)) && !failing,
                t.is_repeat,
                t.fork_pending,
                t.current_step,
            )
        };

        if failing {
            self.cancel_children(task);
            // Cancelling children can finalize them synchronously, which
            // drains fork accounting through subtask_done; re-read.
            let pending = self.tasks.get(task.0).map_or(0, |t| t.fork_pending);
            if self.tasks.get(task.0).map_or(true, |t| t.terminating) {
                return;
            }
            if pending > 0 {
                self.block_on_forks(task);
            } else {
                self.finalize(task);
            }
            return;
        }

        if returning || breaking {
            if fork_pending > 0 {
                self.block_on_forks(task);
            } else {
                self.finalize(task);
            }
            return;
        }

        if continuing {
            if fork_pending > 0 {
                // Restore the signal; it re-applies once the forks join.
                if let Some(t) = self.tasks.get_mut(task.0) {
                    t.control = Some(Control::Continue);
                }
                self.block_on_forks(task);
            } else {
                self.consume_fork_results(task);
                self.reset_loop(task);
            }
            return;
        }

        let next = current.and_then(|c| self.steps.get(c.0).and_then(|s| s.next));
        match next {
            Some(n) => {
                let starts_child = matches!(
                    self.steps.get(n.0).map(|s| &s.kind),
                    Some(StepKind::Fork { .. } | StepKind::Spawn { .. } | StepKind::Repeat { .. })
                );
                if starts_child {
                    if let Some(t) = self.tasks.get_mut(task.0) {
                        t.current_step = Some(n);
                    }
                    self.enqueue_step(n);
                } else if fork_pending > 0 {
                    self.block_on_forks(task);
                } else {
                    self.consume_fork_results(task);
                    if let Some(t) = self.tasks.get_mut(task.0) {
                        t.current_step = Some(n);
                    }
                    self.enqueue_step(n);
                }
            }
            None => {
                if fork_pending > 0 {
                    self.block_on_forks(task);
                } else if is_repeat {
                    self.consume_fork_results(task);
                    self.reset_loop(task);
                } else {
                    self.consume_fork_results(task);
                    self.finalize(task);
                }
            }
        }
    }

    fn block_on_forks(&mut self, task: TaskId) {
        if let Some(t) = self.tasks.get_mut(task.0) {
            t.paused_step = t.current_step;
            t.blocked_on_forks = true;
        }
    }

    /// Moves joined fork results into the task's step result: a single fork's
    /// value directly, two or more as a list in creation order.
    fn consume_fork_results(&mut self, task: TaskId) {
        let Some(t) = self.tasks.get_mut(task.0) else {
            return;
        };
        if t.fork_results.is_empty() {
            return;
        }
        let mut results: Vec<Value> = t
            .fork_results
            .drain(..)
            .map(Option::unwrap_or_default)
            .collect();
        t.step_result = if results.len() == 1 {
            results.swap_remove(0)
        } else {
            Value::List(results)
        };
    }

    /// Rewinds a repeat task to its first step, discarding steps that were
    /// spliced in during the finished iteration.
    fn reset_loop(&mut self, task: TaskId) {
        let first = self.tasks.get(task.0).and_then(|t| t.first_step);
        let Some(first) = first else {
            self.finalize(task);
            return;
        };
        let mut cur = self.steps.get(first.0).and_then(|s| s.next);
        while let Some(s) = cur {
            cur = self.steps.get(s.0).and_then(|x| x.next);
            self.steps.remove(s.0);
        }
        if let Some(s) = self.steps.get_mut(first.0) {
            s.next = None;
        }
        if let Some(t) = self.tasks.get_mut(task.0) {
            t.last_step = Some(first);
            t.current_step = Some(first);
        }
        self.enqueue_step(first);
    }

    // === Finalization ===

    /// Runs the termination sequence and removes the task.
    ///
    /// Panics if the task is already finalizing; reaching this twice for one
    /// task is a scheduler bug.
    fn finalize(&mut self, task: TaskId) {
        {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return;
            };
            assert!(!t.terminating, "task {task} finalized twice");
            t.terminating = true;
        }

        let base = match self.tasks.get_mut(task.0) {
            Some(t) => {
                if let Some(e) = t.step_error.take() {
                    Settlement::Err(e)
                } else if let Some(v) = t.pending_return.take() {
                    Settlement::Ok(v)
                } else {
                    Settlement::Ok(std::mem::take(&mut t.step_result))
                }
            }
            None => return,
        };

        // Deferred cleanup, most recent first. A defer may override the
        // settlement through the context.
        loop {
            let deferred = self.tasks.get_mut(task.0).and_then(|t| t.deferred.pop());
            let Some(block) = deferred else { break };
            let mut cx = TaskCx::new(self, task);
            block(&mut cx);
        }
        let settlement = self
            .tasks
            .get_mut(task.0)
            .and_then(|t| t.defer_override.take())
            .unwrap_or(base);

        let had_failure_hook = self
            .tasks
            .get(task.0)
            .is_some_and(|t| t.on_failure.is_some());
        match &settlement {
            Settlement::Ok(v) => {
                let hook = self.tasks.get_mut(task.0).and_then(|t| t.on_success.take());
                if let Some(hook) = hook {
                    let v = v.clone();
                    let mut cx = TaskCx::new(self, task);
                    hook(&mut cx, v);
                }
            }
            Settlement::Err(e) => {
                let hook = self.tasks.get_mut(task.0).and_then(|t| t.on_failure.take());
                if let Some(hook) = hook {
                    let e = e.clone();
                    let mut cx = TaskCx::new(self, task);
                    hook(&mut cx, e);
                }
            }
        }
        let final_hook = self.tasks.get_mut(task.0).and_then(|t| t.on_final.take());
        if let Some(hook) = final_hook {
            let mut cx = TaskCx::new(self, task);
            hook(&mut cx, &settlement);
        }

        let Some(t) = self.tasks.get_mut(task.0) else {
            return;
        };
        let parent = t.parent;
        let fork_slot = t.fork_slot;
        let is_joined = t.is_fork || t.is_repeat;
        let done = t.done;
        let children = std::mem::take(&mut t.children);
        let first_step = t.first_step.take();
        let name = t.name.take();
        let stopping = t.stopping;

        tracing::debug!(
            task = %task,
            name = name.as_deref().unwrap_or_default(),
            ok = settlement.is_ok(),
            stopped = stopping,
            "task finalized"
        );

        if let Settlement::Err(e) = &settlement {
            if !is_joined && !had_failure_hook && !e.is_cancelled() {
                let observed = self
                    .promises
                    .get(done.0)
                    .is_some_and(|p| !p.waiters.is_empty());
                if !observed {
                    tracing::error!(task = %task, error = %e, "unhandled task failure");
                }
            }
        }

        // Surviving children (spawned subtasks) move to the grandparent so
        // their bindings chain stays rooted.
        for child in children {
            if let Some(c) = self.tasks.get_mut(child.0) {
                c.parent = parent;
            }
            if let Some(p) = parent {
                if let Some(pr) = self.tasks.get_mut(p.0) {
                    pr.children.push(child);
                }
            }
        }

        let mut cur = first_step;
        while let Some(s) = cur {
            cur = self.steps.get(s.0).and_then(|x| x.next);
            self.steps.remove(s.0);
        }

        self.tasks.remove(task.0);
        self.settle(done, settlement.clone());
        if let Some(p) = parent {
            self.subtask_done(p, task, fork_slot, settlement);
        }
    }

    /// Parent-side bookkeeping when a child finishes.
    fn subtask_done(
        &mut self,
        parent: TaskId,
        child: TaskId,
        slot: Option<usize>,
        settlement: Settlement,
    ) {
        let propagated = {
            let Some(p) = self.tasks.get_mut(parent.0) else {
                return;
            };
            p.children.retain(|c| *c != child);
            let Some(i) = slot else { return };
            if p.fork_pending > 0 {
                p.fork_pending -= 1;
            }
            match settlement {
                Settlement::Ok(v) => {
                    if let Some(s) = p.fork_results.get_mut(i) {
                        *s = Some(v);
                    }
                    false
                }
                Settlement::Err(e) => {
                    if let Some(s) = p.fork_results.get_mut(i) {
                        *s = Some(Value::Null);
                    }
                    if p.step_error.is_none() {
                        p.step_error = Some(e);
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if propagated {
            // A failed fork takes its pending siblings down before the
            // parent's own failure path runs.
            self.cancel_children(parent);
        }

        let ready = {
            let Some(p) = self.tasks.get_mut(parent.0) else {
                return;
            };
            if p.fork_pending == 0 && p.blocked_on_forks && p.paused_step.is_some() {
                p.blocked_on_forks = false;
                p.paused_step = None;
                true
            } else {
                false
            }
        };
        if ready {
            self.schedule_next(parent);
        }
    }

    // === Cancellation and external control ===

    /// Cancels a task and, depth-first, its whole subtree.
    ///
    /// A suspended task fails immediately with `Cancelled`; the task
    /// currently executing observes the cancellation when its running step
    /// returns. Finalized tasks ignore the request.
    pub fn cancel_task(&mut self, task: TaskId) {
        {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return;
            };
            if t.terminating || t.cancelled {
                return;
            }
            t.cancelled = true;
            if t.step_error.is_none() {
                t.step_error = Some(Error::cancelled());
            }
        }
        tracing::debug!(task = %task, "cancel requested");
        self.cancel_children(task);

        let running_self = self.running == Some(task);
        let action = {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return;
            };
            if t.terminating || running_self {
                None
            } else if t.pending_start {
                t.pending_start = false;
                Some(())
            } else if t.paused_step.is_some() {
                t.paused_step = None;
                t.blocked_on_forks = false;
                Some(())
            } else {
                // Its step is queued; run_step sees the error and skips.
                None
            }
        };
        if action.is_some() {
            self.schedule_next(task);
        }
    }

    fn cancel_children(&mut self, task: TaskId) {
        let children = self
            .tasks
            .get(task.0)
            .map(|t| t.children.clone())
            .unwrap_or_default();
        for child in children {
            self.cancel_task(child);
        }
    }

    /// Requests a cooperative stop: sets the flag the task can poll via
    /// [`TaskCx::stopping`]; nothing is interrupted.
    pub fn stop_task(&mut self, task: TaskId) -> Result<()> {
        match self.tasks.get_mut(task.0) {
            Some(t) => {
                t.stopping = true;
                Ok(())
            }
            None => Err(Error::new(ErrorKind::TaskGone)),
        }
    }

    /// Injects an error into a task.
    ///
    /// Outstanding forked children unwind first; a suspended task fails at
    /// once; the currently-executing task observes the error when its
    /// running step returns.
    pub fn raise(&mut self, task: TaskId, error: Error) -> Result<()> {
        let children = {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return Err(Error::new(ErrorKind::TaskGone));
            };
            if t.terminating {
                return Err(Error::new(ErrorKind::TaskGone));
            }
            if t.step_error.is_none() {
                t.step_error = Some(error.clone());
            }
            if t.fork_pending > 0 {
                t.children.clone()
            } else {
                Vec::new()
            }
        };
        if !children.is_empty() {
            for child in children {
                let joined = self
                    .tasks
                    .get(child.0)
                    .is_some_and(|c| c.fork_slot.is_some());
                if joined {
                    let _ = self.raise(child, error.clone());
                }
            }
            return Ok(());
        }
        if self.running == Some(task) {
            return Ok(());
        }
        let wake = {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return Ok(());
            };
            if t.pending_start {
                t.pending_start = false;
                true
            } else if t.paused_step.is_some() {
                t.paused_step = None;
                t.blocked_on_forks = false;
                true
            } else {
                false
            }
        };
        if wake {
            self.schedule_next(task);
        }
        Ok(())
    }

    /// Resumes a paused task, delivering `value` as the next step's input.
    ///
    /// Fails with `NotPaused` if the task is not suspended by `pause` (or
    /// paused at creation) — resuming twice is a caller bug, reported not
    /// panicked.
    pub fn resume_task(&mut self, task: TaskId, value: impl Into<Value>) -> Result<()> {
        let state = {
            let Some(t) = self.tasks.get_mut(task.0) else {
                return Err(Error::new(ErrorKind::TaskGone));
            };
            if t.pending_start {
                t.step_result = value.into();
                0u8
            } else if t.paused_step.is_some() && !t.blocked_on_forks {
                t.step_result = value.into();
                t.paused_step = None;
                1
            } else {
                return Err(Error::new(ErrorKind::NotPaused)
                    .with_message("resume of a task that is not paused"));
            }
        };
        if state == 0 {
            self.start_task(task);
        } else {
            self.schedule_next(task);
        }
        Ok(())
    }

    // === Promise delivery ===

    fn deliver(&mut self, waiter: Waiter, settlement: Settlement) {
        match waiter {
            Waiter::Task(task) => {
                let wake = {
                    let Some(t) = self.tasks.get_mut(task.0) else {
                        return;
                    };
                    if t.terminating {
                        return;
                    }
                    match settlement {
                        Settlement::Ok(v) => t.step_result = v,
                        Settlement::Err(e) => {
                            if t.step_error.is_none() {
                                t.step_error = Some(e);
                            }
                        }
                    }
                    if t.paused_step.is_some() && !t.blocked_on_forks {
                        t.paused_step = None;
                        true
                    } else {
                        // The task moved on (cancelled or raised past the
                        // wait); the delivery is stale.
                        false
                    }
                };
                if wake {
                    self.schedule_next(task);
                }
            }
            Waiter::Chain(next) => self.settle(next, settlement),
            Waiter::Handler { on_ok, on_err, next } => match settlement {
                Settlement::Ok(v) => {
                    if let Some(handler) = on_ok {
                        let root = self.root;
                        let outcome = {
                            let mut cx = TaskCx::new(self, root);
                            handler(&mut cx, v)
                        };
                        self.apply_handler_outcome(next, outcome);
                    } else {
                        self.resolve(next, v);
                    }
                }
                Settlement::Err(e) => {
                    if let Some(handler) = on_err {
                        let root = self.root;
                        let outcome = {
                            let mut cx = TaskCx::new(self, root);
                            handler(&mut cx, e)
                        };
                        self.apply_handler_outcome(next, outcome);
                    } else {
                        self.reject(next, e);
                    }
                }
            },
            Waiter::Combine { combine, index } => self.combine_settle(combine, index, settlement),
        }
    }

    fn apply_handler_outcome(&mut self, next: PromiseId, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Ok(Value::Promise(p)) => self.subscribe(p, Waiter::Chain(next)),
            StepOutcome::Ok(v) | StepOutcome::Return(v) => self.resolve(next, v),
            StepOutcome::Err(e) => self.reject(next, e),
            StepOutcome::Break | StepOutcome::Continue => self.reject(
                next,
                Error::internal("loop control escaped a promise handler"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn log() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn push(log: &Rc<RefCell<Vec<String>>>, s: impl Into<String>) {
        log.borrow_mut().push(s.into());
    }

    #[test]
    fn steps_run_in_declaration_order_and_pass_results() {
        init_test_logging();
        crate::test_phase!("step chaining");
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let handle = rt.task(move |cx| {
            cx.step(|_, _| StepOutcome::ok(1));
            let sink2 = sink.clone();
            cx.step(move |_, input| {
                push(&sink2, format!("got {input}"));
                StepOutcome::ok(2)
            });
            cx.step(move |_, input| {
                push(&sink, format!("got {input}"));
                StepOutcome::ok("end")
            });
        });
        rt.run();
        assert_eq!(*seen.borrow(), vec!["got 1", "got 2"]);
        crate::assert_settled_ok!(handle.outcome(&rt), "end");
        // The root task absorbs finished top-level tasks and stays alive.
        assert!(rt.task_alive(rt.root()));
    }

    #[test]
    fn steps_from_different_tasks_interleave_in_ready_order() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        for name in ["a", "b"] {
            let sink = seen.clone();
            rt.task(move |cx| {
                let first = sink.clone();
                cx.step(move |_, _| {
                    push(&first, format!("{name} 1"));
                    StepOutcome::done()
                });
                cx.step(move |_, _| {
                    push(&sink, format!("{name} 2"));
                    StepOutcome::done()
                });
            });
        }
        rt.run();
        // Each ready step goes to the back of the one queue, so the two
        // tasks alternate instead of running to completion one at a time.
        assert_eq!(*seen.borrow(), vec!["a 1", "b 1", "a 2", "b 2"]);
    }

    #[test]
    fn spliced_steps_run_before_the_declared_successor() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        rt.task(move |cx| {
            let a = sink.clone();
            cx.step(move |cx, _| {
                let (x, y) = (a.clone(), a.clone());
                cx.step(move |_, _| {
                    push(&x, "spliced 1");
                    StepOutcome::done()
                });
                cx.step(move |_, _| {
                    push(&y, "spliced 2");
                    StepOutcome::done()
                });
                StepOutcome::done()
            });
            cx.step(move |_, _| {
                push(&sink, "declared tail");
                StepOutcome::done()
            });
        });
        rt.run();
        assert_eq!(
            *seen.borrow(),
            vec!["spliced 1", "spliced 2", "declared tail"]
        );
    }

    #[test]
    fn returning_a_promise_suspends_until_it_settles() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let handle = rt.task(|cx| {
            cx.step(|cx, _| {
                let p = cx.runtime().timer(Time::from_millis(7), "late".into());
                StepOutcome::Ok(Value::Promise(p))
            });
            cx.step(|_, input| StepOutcome::Ok(input));
        });
        rt.run();
        crate::assert_settled_ok!(handle.outcome(&rt), "late");
        assert_eq!(rt.now(), Time::from_millis(7));
    }

    #[test]
    fn task_return_skips_remaining_steps() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let handle = rt.task(|cx| {
            cx.step(|cx, _| {
                cx.task_return(42);
                StepOutcome::done()
            });
            cx.step(|_, _| unreachable!("skipped by early return"));
        });
        rt.run();
        crate::assert_settled_ok!(handle.outcome(&rt), 42);
    }

    #[test]
    fn fork_results_arrive_in_declaration_order() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let joined = log();
        let sink = joined.clone();
        rt.task(move |cx| {
            cx.fork(|cx| {
                // Finishes second on the clock, still lands in slot 0.
                cx.step(|cx, _| {
                    cx.sleep(10);
                    StepOutcome::done()
                });
                cx.step(|_, _| StepOutcome::ok("a"));
            });
            cx.fork(|cx| {
                cx.step(|cx, _| {
                    cx.sleep(5);
                    StepOutcome::done()
                });
                cx.step(|_, _| StepOutcome::ok("b"));
            });
            cx.step(move |_, input| {
                push(&sink, format!("{input}"));
                StepOutcome::done()
            });
        });
        rt.run();
        assert_eq!(*joined.borrow(), vec!["[a, b]"]);
    }

    #[test]
    fn failed_fork_cancels_siblings_and_fails_the_parent() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let handle = rt.task(move |cx| {
            cx.fork(|cx| {
                cx.step(|_, _| Error::user("fork blew up").into());
            });
            let slow = sink.clone();
            cx.fork(move |cx| {
                cx.step(|cx, _| {
                    cx.sleep(1_000);
                    StepOutcome::done()
                });
                cx.step(move |_, _| {
                    push(&slow, "slow fork survived");
                    StepOutcome::done()
                });
            });
            cx.step(|_, _| unreachable!("parent body after failed join"));
            cx.on_failure(move |_, e| {
                push(&sink, format!("parent failed: {}", e.message().unwrap_or("")));
            });
        });
        rt.run();
        assert_eq!(*seen.borrow(), vec!["parent failed: fork blew up"]);
        crate::assert_settled_err!(handle.outcome(&rt), ErrorKind::User);
    }

    #[test]
    fn spawned_children_outlive_the_parent() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let mut child_handle = None;
        let parent = rt.task(|cx| {
            let h = cx.spawn(move |cx| {
                cx.step(|cx, _| {
                    cx.sleep(50);
                    StepOutcome::done()
                });
                cx.step(move |_, _| {
                    push(&sink, "spawned child finished");
                    StepOutcome::ok("late")
                });
            });
            child_handle = Some(h);
        });
        rt.run_until_idle();
        assert!(parent.is_done(&rt));
        let child = child_handle.unwrap();
        assert!(child.is_alive(&rt));
        // Reparented to the root once the parent finalized.
        rt.run();
        assert_eq!(*seen.borrow(), vec!["spawned child finished"]);
        crate::assert_settled_ok!(child.outcome(&rt), "late");
    }

    #[test]
    fn repeat_loops_until_break_and_continue_rewinds() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let handle = rt.task(move |cx| {
            let mut round = 0;
            cx.repeat(move |cx, _| {
                round += 1;
                if round == 2 {
                    return StepOutcome::Continue;
                }
                if round > 3 {
                    return StepOutcome::Break;
                }
                let (n, s) = (round, sink.clone());
                cx.step(move |_, _| {
                    push(&s, format!("iteration {n}"));
                    StepOutcome::done()
                });
                StepOutcome::done()
            });
            cx.step(|_, _| StepOutcome::ok("after loop"));
        });
        rt.run();
        assert_eq!(*seen.borrow(), vec!["iteration 1", "iteration 3"]);
        crate::assert_settled_ok!(handle.outcome(&rt), "after loop");
    }

    #[test]
    fn break_outside_a_loop_is_an_error() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let handle = rt.task(|cx| {
            cx.step(|_, _| StepOutcome::Break);
        });
        rt.run();
        crate::assert_settled_err!(handle.outcome(&rt), ErrorKind::OutsideLoop);
    }

    #[test]
    fn cancel_takes_down_the_subtree() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let mut inner = None;
        let handle = rt.task(|cx| {
            let h = cx.spawn(move |cx| {
                cx.step(|cx, _| {
                    cx.sleep(1_000_000);
                    StepOutcome::done()
                });
                cx.defer(move |_| push(&sink, "inner cleanup ran"));
            });
            inner = Some(h);
            cx.step(|cx, _| {
                cx.pause();
                StepOutcome::done()
            });
        });
        rt.run_until_idle();
        handle.cancel(&mut rt);
        rt.run_until_idle();
        assert_eq!(*seen.borrow(), vec!["inner cleanup ran"]);
        crate::assert_settled_err!(handle.outcome(&rt), ErrorKind::Cancelled);
        crate::assert_settled_err!(inner.unwrap().outcome(&rt), ErrorKind::Cancelled);
    }

    #[test]
    fn cancelling_the_running_task_defers_to_the_step_boundary() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let handle = rt.task(move |cx| {
            cx.step(move |cx, _| {
                let me = cx.task_id();
                cx.cancel(me);
                push(&sink, "still running after self-cancel");
                StepOutcome::done()
            });
            cx.step(|_, _| unreachable!("cancelled at the boundary"));
        });
        rt.run();
        assert_eq!(*seen.borrow(), vec!["still running after self-cancel"]);
        crate::assert_settled_err!(handle.outcome(&rt), ErrorKind::Cancelled);
    }

    #[test]
    fn pause_and_resume_deliver_the_resume_value() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let handle = rt.task(|cx| {
            cx.step(|cx, _| {
                cx.pause();
                StepOutcome::done()
            });
            cx.step(|_, input| StepOutcome::Ok(input));
        });
        rt.run_until_idle();
        assert!(!handle.is_done(&rt));
        handle.resume(&mut rt, "woken").unwrap();
        // Resuming again before the task pauses again must fail, not panic.
        assert_eq!(
            handle.resume(&mut rt, 0).unwrap_err().kind(),
            ErrorKind::NotPaused
        );
        rt.run();
        crate::assert_settled_ok!(handle.outcome(&rt), "woken");
    }

    #[test]
    fn another_task_may_resume_a_paused_one() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let paused = rt.task(|cx| {
            cx.step(|cx, _| {
                cx.pause();
                StepOutcome::done()
            });
            cx.step(|_, input| StepOutcome::Ok(input));
        });
        rt.task(move |cx| {
            cx.step(|cx, _| {
                cx.sleep(5);
                StepOutcome::done()
            });
            cx.step(move |cx, _| {
                cx.resume(paused.id(), "poked").unwrap();
                StepOutcome::done()
            });
        });
        rt.run();
        crate::assert_settled_ok!(paused.outcome(&rt), "poked");
    }

    #[test]
    fn stop_is_cooperative() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let handle = rt.task(move |cx| {
            let mut polls = 0;
            cx.repeat(move |cx, _| {
                polls += 1;
                if cx.stopping() {
                    push(&sink, format!("stopped after {polls} polls"));
                    return StepOutcome::Break;
                }
                if polls == 3 {
                    let me = cx.task_id();
                    let _ = cx.stop(me);
                }
                StepOutcome::done()
            });
        });
        rt.run();
        assert_eq!(*seen.borrow(), vec!["stopped after 4 polls"]);
        assert!(handle.outcome(&rt).is_some());
    }

    #[test]
    fn defers_run_lifo_and_may_override_the_settlement() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let (a, b) = (seen.clone(), seen.clone());
        let handle = rt.task(move |cx| {
            cx.defer(move |_| push(&a, "registered first"));
            cx.defer(move |cx| {
                push(&b, "registered second");
                cx.task_return("overridden");
            });
            cx.step(|_, _| StepOutcome::ok("original"));
        });
        rt.run();
        assert_eq!(
            *seen.borrow(),
            vec!["registered second", "registered first"]
        );
        crate::assert_settled_ok!(handle.outcome(&rt), "overridden");
    }

    #[test]
    fn raise_interrupts_a_sleeping_task() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let handle = rt.task(|cx| {
            cx.step(|cx, _| {
                cx.sleep(1_000_000);
                StepOutcome::done()
            });
            cx.step(|_, _| unreachable!("raised past the sleep"));
        });
        rt.run_until_idle();
        handle.raise(&mut rt, Error::user("injected")).unwrap();
        rt.run_until_idle();
        crate::assert_settled_err!(handle.outcome(&rt), ErrorKind::User);
        assert_eq!(
            handle.raise(&mut rt, Error::user("again")).unwrap_err().kind(),
            ErrorKind::TaskGone
        );
    }

    #[test]
    fn the_step_valve_stops_runaway_loops() {
        init_test_logging();
        let mut rt =
            Runtime::with_config(RuntimeConfig::default().with_clock(ClockMode::Virtual).with_max_steps(100));
        rt.task(|cx| {
            cx.repeat(|_, _| StepOutcome::done());
        });
        rt.run();
        assert!(rt.steps() <= 101);
    }

    #[test]
    fn then_handlers_run_through_the_scheduler() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let seen = log();
        let sink = seen.clone();
        let p = rt.new_promise();
        let chained = rt.then(
            p,
            Some(Box::new(|_cx: &mut TaskCx<'_>, v: Value| {
                StepOutcome::ok(format!("handled {v}"))
            })),
            None,
        );
        rt.task(move |cx| {
            cx.step(move |_, _| StepOutcome::Ok(Value::Promise(chained)));
            cx.step(move |_, input| {
                push(&sink, format!("{input}"));
                StepOutcome::done()
            });
        });
        rt.resolve(p, 5);
        rt.run();
        assert_eq!(*seen.borrow(), vec!["handled 5"]);
    }
}
