//! Producer/consumer rendezvous in generator shape.

use crate::error::Error;
use crate::runtime::TaskCx;
use crate::types::PromiseId;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

struct GeneratorState {
    /// Producer arrived first: the yielded value and its continue promise.
    pending_yield: Option<(Value, PromiseId)>,
    /// Consumer arrived first: the sent value and its result promise.
    pending_next: Option<(Value, PromiseId)>,
    closed: bool,
}

/// A two-party rendezvous shaped like a generator.
///
/// The producer calls [`yield_value`](Self::yield_value) and suspends on the
/// returned promise until a consumer takes the value; the consumer calls
/// [`next`](Self::next) and suspends until a value is yielded. Each side's
/// promise resolves with the value the other side passed, so data flows both
/// ways. One pending call per side; the runtime's task model supplies the
/// "frame" a coroutine would keep.
#[derive(Clone)]
pub struct Generator {
    state: Rc<RefCell<GeneratorState>>,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator {
    /// A fresh generator with neither side waiting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(GeneratorState {
                pending_yield: None,
                pending_next: None,
                closed: false,
            })),
        }
    }

    /// Consumer side: requests the next yielded value, handing `sent` to the
    /// producer as the result of its pending yield.
    pub fn next(&self, cx: &mut TaskCx<'_>, sent: impl Into<Value>) -> PromiseId {
        let sent = sent.into();
        enum Hit {
            Closed,
            Ready {
                yielded: Value,
                producer: PromiseId,
                sent: Value,
            },
            Busy,
            Waiting(Value),
        }
        let hit = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                Hit::Closed
            } else if let Some((yielded, producer)) = s.pending_yield.take() {
                Hit::Ready {
                    yielded,
                    producer,
                    sent,
                }
            } else if s.pending_next.is_some() {
                Hit::Busy
            } else {
                Hit::Waiting(sent)
            }
        };
        match hit {
            Hit::Closed => cx.rejected(Error::closed("generator")),
            Hit::Ready {
                yielded,
                producer,
                sent,
            } => {
                cx.runtime().resolve(producer, sent);
                cx.resolved(yielded)
            }
            Hit::Busy => cx.rejected(Error::user("generator already has a pending next")),
            Hit::Waiting(sent) => {
                let promise = cx.promise();
                self.state.borrow_mut().pending_next = Some((sent, promise));
                promise
            }
        }
    }

    /// Producer side: offers `value`, suspending until a consumer takes it.
    /// The returned promise resolves with that consumer's sent value.
    pub fn yield_value(&self, cx: &mut TaskCx<'_>, value: impl Into<Value>) -> PromiseId {
        let value = value.into();
        enum Hit {
            Closed,
            Ready {
                sent: Value,
                consumer: PromiseId,
                value: Value,
            },
            Busy,
            Waiting(Value),
        }
        let hit = {
            let mut s = self.state.borrow_mut();
            if s.closed {
                Hit::Closed
            } else if let Some((sent, consumer)) = s.pending_next.take() {
                Hit::Ready {
                    sent,
                    consumer,
                    value,
                }
            } else if s.pending_yield.is_some() {
                Hit::Busy
            } else {
                Hit::Waiting(value)
            }
        };
        match hit {
            Hit::Closed => cx.rejected(Error::closed("generator")),
            Hit::Ready {
                sent,
                consumer,
                value,
            } => {
                cx.runtime().resolve(consumer, value);
                cx.resolved(sent)
            }
            Hit::Busy => cx.rejected(Error::user("generator already has a pending yield")),
            Hit::Waiting(value) => {
                let promise = cx.promise();
                self.state.borrow_mut().pending_yield = Some((value, promise));
                promise
            }
        }
    }

    /// Closes the generator: whichever side is waiting fails with `Closed`,
    /// as do all later calls. Idempotent.
    pub fn close(&self, cx: &mut TaskCx<'_>) {
        let (py, pn) = {
            let mut s = self.state.borrow_mut();
            s.closed = true;
            (s.pending_yield.take(), s.pending_next.take())
        };
        if let Some((_, promise)) = py {
            cx.runtime().reject(promise, Error::closed("generator"));
        }
        if let Some((_, promise)) = pn {
            cx.runtime().reject(promise, Error::closed("generator"));
        }
    }

    /// True once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::test_utils::init_test_logging;
    use crate::types::StepOutcome;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn values_flow_both_ways() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let generator = Generator::new();
        let consumer_saw: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let producer_saw: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));

        let (g, sink) = (generator.clone(), producer_saw.clone());
        rt.task(move |cx| {
            let g2 = g.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(g2.yield_value(cx, "out"))));
            cx.step(move |_, input| {
                *sink.borrow_mut() = Some(input);
                StepOutcome::done()
            });
        });

        let (g, sink) = (generator, consumer_saw.clone());
        rt.task(move |cx| {
            let g2 = g.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(g2.next(cx, "in"))));
            cx.step(move |_, input| {
                *sink.borrow_mut() = Some(input);
                StepOutcome::done()
            });
        });

        rt.run();
        assert_eq!(*consumer_saw.borrow(), Some(Value::Str("out".into())));
        assert_eq!(*producer_saw.borrow(), Some(Value::Str("in".into())));
    }

    #[test]
    fn close_releases_a_waiting_consumer() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let generator = Generator::new();
        let failed: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let (g, sink) = (generator.clone(), failed.clone());
        rt.task(move |cx| {
            let g2 = g.clone();
            cx.step(move |cx, _| StepOutcome::Ok(Value::Promise(g2.next(cx, Value::Null))));
            cx.on_failure(move |_, e| {
                *sink.borrow_mut() = e.is_closed();
            });
        });
        rt.task(move |cx| {
            cx.step(move |cx, _| {
                generator.close(cx);
                generator.close(cx);
                StepOutcome::done()
            });
        });

        rt.run();
        assert!(*failed.borrow());
    }
}
