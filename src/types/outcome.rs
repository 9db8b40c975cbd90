//! Step outcomes.
//!
//! Every step block reports how it ended through [`StepOutcome`]. Control
//! transfers that classic sentinel-object designs smuggle through the value
//! channel (loop break/continue, early return) are explicit variants here, so
//! the scheduler pattern-matches instead of probing for magic values.

use crate::error::Error;
use crate::value::Value;

/// The result of executing a single step block.
#[derive(Debug)]
#[must_use]
pub enum StepOutcome {
    /// The step completed; the value becomes the next step's input.
    ///
    /// Returning [`Value::Promise`] suspends the task until the promise
    /// settles; the settled value (or error) then flows to the next step.
    Ok(Value),
    /// The step failed; the error propagates through the task.
    Err(Error),
    /// Terminate the enclosing repeat loop.
    Break,
    /// Restart the enclosing repeat loop from its first step.
    Continue,
    /// Terminate the whole task early with the given result.
    Return(Value),
}

impl StepOutcome {
    /// Shorthand for `Ok` wrapping any value convertible to [`Value`].
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Ok(value.into())
    }

    /// `Ok(Value::Null)`, for steps executed purely for effect.
    pub const fn done() -> Self {
        Self::Ok(Value::Null)
    }

    /// Returns true for the `Ok` variant.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns true for the `Err` variant.
    #[must_use]
    pub const fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }
}

impl From<Value> for StepOutcome {
    fn from(value: Value) -> Self {
        Self::Ok(value)
    }
}

impl From<Error> for StepOutcome {
    fn from(error: Error) -> Self {
        Self::Err(error)
    }
}

impl From<crate::types::PromiseId> for StepOutcome {
    fn from(promise: crate::types::PromiseId) -> Self {
        Self::Ok(Value::Promise(promise))
    }
}

impl From<crate::error::Result<Value>> for StepOutcome {
    fn from(result: crate::error::Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Err(error),
        }
    }
}
