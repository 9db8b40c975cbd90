//! Error types and error handling strategy for Stepline.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation and primitive shutdown travel as ordinary errors, so a task
//!   observes them exactly like any other failure at its next step boundary
//! - Handles into the runtime (tasks, bindings) fail with a dedicated kind
//!   when their target has already been finalized, rather than reading a
//!   recycled record
//!
//! # Error Categories
//!
//! - **Cancellation**: the task was cancelled before it finished
//! - **Sync**: a synchronization primitive refused or aborted an operation
//! - **Task**: a task handle or binding outlived its target
//! - **Config**: configuration could not be loaded or parsed
//! - **Internal**: runtime bugs and invalid states
//! - **User**: errors raised by application steps

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Cancellation ===
    /// Operation or task was cancelled.
    Cancelled,

    // === Sync primitives ===
    /// Primitive was closed while the operation was pending (or before it).
    Closed,
    /// Mutex acquired again by the task that already holds it.
    MutexHeld,
    /// Release attempted by a task that does not hold the primitive.
    NotOwner,

    // === Task lifecycle ===
    /// The referenced task has already been finalized.
    TaskGone,
    /// A cached binding points at a finalized owner task.
    StaleBinding,
    /// Resume requested for a task that is not suspended.
    NotPaused,
    /// Break or continue signalled outside any repeat loop.
    OutsideLoop,

    // === Configuration ===
    /// Configuration value could not be read or parsed.
    Config,

    // === Internal / state machine ===
    /// Internal runtime error (bug).
    Internal,

    // === User ===
    /// User-provided error raised from a step.
    User,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Closed | Self::MutexHeld | Self::NotOwner => ErrorCategory::Sync,
            Self::TaskGone | Self::StaleBinding | Self::NotPaused | Self::OutsideLoop => {
                ErrorCategory::Task
            }
            Self::Config => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
            Self::User => ErrorCategory::User,
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Cancellation-related failures.
    Cancellation,
    /// Synchronization primitive failures.
    Sync,
    /// Task handle and binding lifecycle failures.
    Task,
    /// Configuration failures.
    Config,
    /// Internal runtime errors.
    Internal,
    /// User-originated errors.
    User,
}

/// The main error type for Stepline operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error represents a closed primitive.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates a cancellation error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates a closed-primitive error naming the primitive.
    #[must_use]
    pub fn closed(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed).with_message(what)
    }

    /// Creates an internal error (runtime bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(detail)
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach a context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for Stepline operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_message() {
        let err = Error::closed("queue");
        assert_eq!(err.to_string(), "Closed: queue");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::User)
            .with_message("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::cancelled().is_cancelled());
        assert!(!Error::cancelled().is_closed());
        assert!(Error::closed("port").is_closed());
    }

    #[test]
    fn categories_group_kinds() {
        assert_eq!(ErrorKind::MutexHeld.category(), ErrorCategory::Sync);
        assert_eq!(ErrorKind::StaleBinding.category(), ErrorCategory::Task);
        assert_eq!(ErrorKind::Cancelled.category(), ErrorCategory::Cancellation);
    }

    #[test]
    fn result_ext_adds_message() {
        let res: Result<()> = Err(Error::new(ErrorKind::Closed));
        let err = res.context("get failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(err.to_string(), "Closed: get failed");
    }
}
