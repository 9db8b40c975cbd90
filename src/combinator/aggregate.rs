//! Aggregating combinators: wait for every input.

use super::{combine, CombineInput, CombineKind};
use crate::runtime::TaskCx;
use crate::types::PromiseId;

/// Resolves once every input has settled, with one `[error, value]` pair per
/// input in declaration order (`Null` in the unused position). Never
/// rejects; failures are reported in place, as the error's display string.
pub fn all(cx: &mut TaskCx<'_>, inputs: Vec<CombineInput>) -> PromiseId {
    combine(cx, CombineKind::All, inputs)
}

/// Resolves `false` as soon as any input settles falsy or fails, otherwise
/// with the last input's value once all have settled. Empty input resolves
/// `true`.
pub fn and(cx: &mut TaskCx<'_>, inputs: Vec<CombineInput>) -> PromiseId {
    combine(cx, CombineKind::And, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::Runtime;
    use crate::test_utils::init_test_logging;
    use crate::types::StepOutcome;
    use crate::value::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_collecting(body: impl FnOnce(&mut TaskCx<'_>) -> PromiseId + 'static) -> Value {
        let got: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let sink = got.clone();
        let mut body = Some(body);
        let mut rt = Runtime::deterministic();
        rt.task(move |cx| {
            cx.step(move |cx, _| match body.take() {
                Some(b) => StepOutcome::Ok(Value::Promise(b(cx))),
                None => StepOutcome::done(),
            });
            cx.step(move |_, input| {
                *sink.borrow_mut() = Some(input);
                StepOutcome::done()
            });
        });
        rt.run();
        let value = got.borrow_mut().take();
        value.unwrap_or(Value::Null)
    }

    #[test]
    fn all_reports_each_outcome_in_order() {
        init_test_logging();
        crate::test_phase!("all with mixed outcomes");

        let value = run_collecting(|cx| {
            let ok = cx.resolved(7);
            let bad = cx.rejected(Error::user("boom"));
            all(cx, vec![ok.into(), bad.into(), 3.into()])
        });

        let pairs = value.as_list().unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].as_list().unwrap()[1], Value::Int(7));
        assert!(matches!(&pairs[1].as_list().unwrap()[0], Value::Str(s) if s.contains("boom")));
        assert_eq!(pairs[1].as_list().unwrap()[1], Value::Null);
        assert_eq!(pairs[2].as_list().unwrap()[1], Value::Int(3));
        crate::test_complete!("all with mixed outcomes");
    }

    #[test]
    fn all_waits_for_timers() {
        init_test_logging();
        let value = run_collecting(|cx| {
            let slow = cx.runtime().timer(crate::types::Time::from_millis(20), 9.into());
            all(cx, vec![slow.into(), 1.into()])
        });
        let pairs = value.as_list().unwrap();
        assert_eq!(pairs[0].as_list().unwrap()[1], Value::Int(9));
        assert_eq!(pairs[1].as_list().unwrap()[1], Value::Int(1));
    }

    #[test]
    fn and_yields_last_value_when_all_truthy() {
        init_test_logging();
        let value = run_collecting(|cx| {
            let p = cx.resolved(true);
            and(cx, vec![1.into(), p.into(), "last".into()])
        });
        assert_eq!(value, Value::Str("last".into()));
    }

    #[test]
    fn and_short_circuits_on_falsy() {
        init_test_logging();
        let value = run_collecting(|cx| {
            // Never settles; the falsy input decides without it.
            let never = cx.promise();
            and(cx, vec![never.into(), 0.into()])
        });
        assert_eq!(value, Value::Bool(false));
    }

    #[test]
    fn and_treats_failure_as_false() {
        init_test_logging();
        let value = run_collecting(|cx| {
            let bad = cx.rejected(Error::user("nope"));
            and(cx, vec![1.into(), bad.into()])
        });
        assert_eq!(value, Value::Bool(false));
    }

    #[test]
    fn empty_inputs_have_identity_results() {
        init_test_logging();
        let value = run_collecting(|cx| all(cx, Vec::new()));
        assert_eq!(value, Value::List(Vec::new()));
        let value = run_collecting(|cx| and(cx, Vec::new()));
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn func_inputs_evaluate_in_declaration_order() {
        init_test_logging();
        let order: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let value = run_collecting(move |cx| {
            all(
                cx,
                vec![
                    CombineInput::func(move |_| {
                        a.borrow_mut().push(1);
                        Value::Int(1)
                    }),
                    CombineInput::func(move |_| {
                        b.borrow_mut().push(2);
                        Value::Int(2)
                    }),
                ],
            )
        });
        assert_eq!(value.as_list().unwrap().len(), 2);
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
