//! Unbuffered rendezvous port.

use crate::error::Error;
use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::PromiseId;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct PortState {
    gets: VecDeque<PromiseId>,
    puts: VecDeque<(Value, PromiseId)>,
    closed: bool,
}

/// A meeting point with no buffer: each `put` pairs with exactly one `get`.
///
/// Whichever side arrives first waits for the other; both sides queue FIFO,
/// so values cross in put order. The get promise resolves with the value,
/// the put promise resolves `true` once its value was taken.
#[derive(Clone)]
pub struct Port {
    state: Rc<RefCell<PortState>>,
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}

impl Port {
    /// A fresh port with nobody waiting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(PortState {
                gets: VecDeque::new(),
                puts: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Receives the next value, waiting for a `put` when none is pending.
    pub fn get(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        enum Hit {
            Closed,
            Paired(Value, PromiseId),
            Waiting,
        }
        let hit = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                Hit::Closed
            } else {
                match s.puts.pop_front() {
                    Some((value, put)) => Hit::Paired(value, put),
                    None => Hit::Waiting,
                }
            }
        };
        match hit {
            Hit::Closed => cx.rejected(Error::closed("port")),
            Hit::Paired(value, put) => {
                cx.runtime().resolve(put, true);
                cx.resolved(value)
            }
            Hit::Waiting => {
                let promise = cx.promise();
                self.state.borrow_mut().gets.push_back(promise);
                promise
            }
        }
    }

    /// Hands over a value, waiting for a `get` when none is pending.
    pub fn put(&self, cx: &mut TaskCx<'_>, value: impl Into<Value>) -> PromiseId {
        let value = value.into();
        enum Hit {
            Closed,
            Paired(PromiseId),
            Waiting,
        }
        let hit = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                Hit::Closed
            } else {
                match s.gets.pop_front() {
                    Some(get) => Hit::Paired(get),
                    None => Hit::Waiting,
                }
            }
        };
        match hit {
            Hit::Closed => cx.rejected(Error::closed("port")),
            Hit::Paired(get) => {
                cx.runtime().resolve(get, value);
                cx.resolved(true)
            }
            Hit::Waiting => {
                let promise = cx.promise();
                self.state.borrow_mut().puts.push_back((value, promise));
                promise
            }
        }
    }

    /// Closes the port: both waiting sides and all future calls fail with
    /// `Closed`. Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let (gets, puts) = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            (std::mem::take(&mut s.gets), std::mem::take(&mut s.puts))
        };
        for promise in gets {
            cx.runtime().reject(promise, Error::closed("port"));
        }
        for (_, promise) in puts {
            cx.runtime().reject(promise, Error::closed("port"));
        }
    }
}

impl Waitable for Port {
    /// Waiting on a port receives from it.
    fn promise(&self, cx: &mut TaskCx<'_>) -> PromiseId {
        self.get(cx)
    }
}
