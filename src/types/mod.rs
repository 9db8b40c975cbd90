//! Core identifier, time and outcome types.

mod id;
mod outcome;
mod time;

pub(crate) use id::CombineId;
pub use id::{PromiseId, StepId, TaskId};
pub use outcome::StepOutcome;
pub use time::Time;
