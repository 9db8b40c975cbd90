//! Identifier types for runtime entities.
//!
//! These types provide type-safe identifiers for the core runtime entities:
//! tasks, steps and promises. They wrap arena indices with type safety, so a
//! `TaskId` cannot be fed where a `PromiseId` is expected and a stale handle
//! misses its (recycled) slot instead of aliasing it.

use crate::util::ArenaIndex;
use core::fmt;

/// A unique identifier for a task in the runtime.
///
/// Tasks form a tree; each task is owned by its parent until it terminates or
/// is reparented.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) ArenaIndex);

impl TaskId {
    /// Creates a new task ID from an arena index (internal use).
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    /// Returns the underlying arena index (internal use).
    #[must_use]
    #[allow(dead_code)]
    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Creates a task ID for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(index: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(index, generation))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0.index())
    }
}

/// A unique identifier for a step within a task's step list.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(pub(crate) ArenaIndex);

impl StepId {
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }
}

impl fmt::Debug for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0.index())
    }
}

/// A unique identifier for a promise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromiseId(pub(crate) ArenaIndex);

impl PromiseId {
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    /// Creates a promise ID for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(index: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(index, generation))
    }
}

impl fmt::Debug for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromiseId({}:{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0.index())
    }
}

/// A unique identifier for an in-flight combinator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CombineId(pub(crate) ArenaIndex);

impl CombineId {
    #[must_use]
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }
}

impl fmt::Debug for CombineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CombineId({}:{})", self.0.index(), self.0.generation())
    }
}
