//! Synchronization primitives for cooperative tasks.
//!
//! Every primitive is a cheap clonable handle over shared state; operations
//! take the calling task's [`TaskCx`](crate::TaskCx) and return promises, so
//! waiting is the ordinary step suspension. All waiting is FIFO, and every
//! primitive closes the same way: waiters and later callers fail with a
//! `Closed` error, and closing twice is harmless.

mod generator;
mod lock;
mod mutex;
mod port;
mod queue;
mod semaphore;
mod signal;
mod timeout;

pub use generator::Generator;
pub use lock::Lock;
pub use mutex::Mutex;
pub use port::Port;
pub use queue::MessageQueue;
pub use semaphore::Semaphore;
pub use signal::Signal;
pub use timeout::Timeout;
