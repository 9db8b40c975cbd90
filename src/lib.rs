//! Stepline: a single-threaded cooperative multitasking runtime.
//!
//! Tasks are explicit lists of steps. A step is a closure that receives the
//! previous step's result and returns a [`StepOutcome`]; returning a promise
//! suspends the task until the promise settles. One FIFO scheduler drives
//! everything, so execution order is a function of declaration order plus
//! settlement order, and with the virtual clock it is fully deterministic.
//!
//! - Structure: subtasks via `fork` (joined, results in declaration order),
//!   `spawn` (detached) and `repeat` (looping), with `defer` blocks and
//!   success/failure/final hooks at termination.
//! - Promises: single sticky settlement, handlers always delivered through
//!   the scheduler, late subscribers replayed.
//! - Sync: [`sync::Mutex`], reentrant [`sync::Lock`], [`sync::Semaphore`],
//!   [`sync::Signal`], [`sync::Timeout`], rendezvous [`sync::Port`], bounded
//!   [`sync::MessageQueue`] and [`sync::Generator`].
//! - Combinators: [`combinator::all`], [`combinator::and`],
//!   [`combinator::any`], [`combinator::or`].
//!
//! # Example
//!
//! ```
//! use stepline::{Runtime, StepOutcome, Value};
//!
//! let mut rt = Runtime::deterministic();
//! let handle = rt.task(|cx| {
//!     cx.step(|cx, _| {
//!         cx.sleep(10);
//!         StepOutcome::done()
//!     });
//!     cx.step(|_, _| StepOutcome::ok("done"));
//! });
//! rt.run();
//! assert!(matches!(handle.outcome(&rt), Some(Ok(Value::Str(s))) if s == "done"));
//! ```

pub mod combinator;
pub mod error;
pub mod promise;
pub mod runtime;
pub mod sync;
pub mod test_utils;
pub mod types;
pub mod util;
pub mod value;

pub use error::{Error, ErrorCategory, ErrorKind, Result, ResultExt};
pub use promise::{ErrHandler, OkHandler, Settlement, Waitable};
pub use runtime::{ClockMode, Runtime, RuntimeConfig, TaskCx, TaskHandle};
pub use types::{PromiseId, StepId, StepOutcome, TaskId, Time};
pub use value::Value;
