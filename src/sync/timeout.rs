//! Timer-backed waitable that can be released early.

use crate::promise::Waitable;
use crate::runtime::TaskCx;
use crate::types::{PromiseId, Time};
use crate::value::Value;

/// A deadline on the runtime clock.
///
/// Resolves `Null` when the deadline passes, unless [`signal`](Self::signal)
/// resolves it early with a value; settlement is sticky, so the late timer
/// firing is then ignored. Copyable, one promise behind it.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    promise: PromiseId,
}

impl Timeout {
    /// Arms a timeout `millis` from now.
    pub fn new(cx: &mut TaskCx<'_>, millis: u64) -> Self {
        let promise = cx
            .runtime()
            .timer(Time::from_millis(millis), Value::Null);
        Self { promise }
    }

    /// Releases the timeout now with `value` instead of waiting for the
    /// deadline. A no-op once settled.
    pub fn signal(&self, cx: &mut TaskCx<'_>, value: impl Into<Value>) {
        cx.runtime().resolve(self.promise, value);
    }

    /// True once the deadline passed or the timeout was signalled.
    #[must_use]
    pub fn is_elapsed(&self, rt: &crate::runtime::Runtime) -> bool {
        !rt.is_pending(self.promise)
    }
}

impl Waitable for Timeout {
    fn promise(&self, _cx: &mut TaskCx<'_>) -> PromiseId {
        self.promise
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
    fn elapses_on_the_virtual_clock() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let woke: Rc<RefCell<Option<(Value, u64)>>> = Rc::new(RefCell::new(None));
        let sink = woke.clone();
        rt.task(move |cx| {
            cx.step(move |cx, _| {
                let t = Timeout::new(cx, 25);
                cx.wait(&t);
                StepOutcome::done()
            });
            cx.step(move |cx, input| {
                *sink.borrow_mut() = Some((input, cx.now().as_millis()));
                StepOutcome::done()
            });
        });
        rt.run();
        assert_eq!(*woke.borrow(), Some((Value::Null, 25)));
    }

    #[test]
    fn signal_beats_the_deadline() {
        init_test_logging();
        let mut rt = Runtime::deterministic();
        let woke: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let shared: Rc<RefCell<Option<Timeout>>> = Rc::new(RefCell::new(None));

        let (sink, slot) = (woke.clone(), shared.clone());
        rt.task(move |cx| {
            let slot2 = slot.clone();
            cx.step(move |cx, _| {
                let t = Timeout::new(cx, 1_000);
                *slot2.borrow_mut() = Some(t);
                cx.wait(&t);
                StepOutcome::done()
            });
            cx.step(move |_, input| {
                *sink.borrow_mut() = Some(input);
                StepOutcome::done()
            });
        });
        let armed = shared.clone();
        rt.task(move |cx| {
            cx.step(move |cx, _| {
                if let Some(t) = *armed.borrow() {
                    t.signal(cx, "early");
                }
                StepOutcome::done()
            });
        });

        rt.run_until_idle();
        assert_eq!(*woke.borrow(), Some(Value::Str("early".into())));
        assert_eq!(rt.now(), crate::types::Time::ZERO);
        let t = shared.borrow().unwrap();
        assert!(t.is_elapsed(&rt));
    }
}
