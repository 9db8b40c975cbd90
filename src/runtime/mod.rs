//! The runtime: scheduler, tasks, steps, timers and configuration.

mod config;
mod cx;
mod handle;
#[allow(clippy::module_inception)]
mod runtime;
mod scheduler;
pub(crate) mod task;
mod timer;

pub use config::{ClockMode, RuntimeConfig, ENV_CLOCK, ENV_MAX_STEPS, ENV_QUEUE_CAPACITY};
pub use cx::TaskCx;
pub use handle::TaskHandle;
pub use runtime::Runtime;
pub use task::{DeferBlock, FailureHook, FinalHook, StepBlock, SuccessHook};
