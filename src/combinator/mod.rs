//! Promise combinators.
//!
//! Aggregation (`all`, `and`) and selection (`any`, `or`) over a mixed list
//! of inputs. Inputs are evaluated in declaration order; plain values settle
//! their slot immediately, promises settle it whenever they do. Each
//! combinator returns a single promise for the combined outcome.

mod aggregate;
mod select;

pub use aggregate::{all, and};
pub use select::{any, or};

use crate::promise::{Settlement, Waiter};
use crate::runtime::{Runtime, TaskCx};
use crate::types::{CombineId, PromiseId};
use crate::value::Value;

/// One input to a combinator: a plain value (promises settle their slot when
/// they do) or a closure evaluated at declaration time.
pub enum CombineInput {
    /// A value; `Value::Promise` contributes its settlement.
    Value(Value),
    /// Evaluated once, in declaration order, when the combinator is built.
    Func(Box<dyn FnOnce(&mut TaskCx<'_>) -> Value>),
}

impl CombineInput {
    /// An input evaluated lazily at declaration time.
    pub fn func(f: impl FnOnce(&mut TaskCx<'_>) -> Value + 'static) -> Self {
        Self::Func(Box::new(f))
    }
}

impl<T: Into<Value>> From<T> for CombineInput {
    fn from(value: T) -> Self {
        Self::Value(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CombineKind {
    All,
    And,
    Any,
    Or,
}

/// Pending state of one combinator.
pub(crate) struct CombineRecord {
    kind: CombineKind,
    target: PromiseId,
    slots: Vec<Option<Settlement>>,
    remaining: usize,
}

fn combine(cx: &mut TaskCx<'_>, kind: CombineKind, inputs: Vec<CombineInput>) -> PromiseId {
    let values: Vec<Value> = inputs
        .into_iter()
        .map(|input| match input {
            CombineInput::Value(v) => v,
            CombineInput::Func(f) => f(cx),
        })
        .collect();
    let n = values.len();
    let rt = cx.runtime();
    let target = rt.new_promise();
    if n == 0 {
        let empty = match kind {
            CombineKind::All => Value::List(Vec::new()),
            CombineKind::And => Value::Bool(true),
            CombineKind::Any => Value::Null,
            CombineKind::Or => Value::Bool(false),
        };
        rt.resolve(target, empty);
        return target;
    }
    let combine = CombineId::from_arena(rt.combines.insert(CombineRecord {
        kind,
        target,
        slots: vec![None; n],
        remaining: n,
    }));
    for (index, value) in values.into_iter().enumerate() {
        match value {
            Value::Promise(p) => rt.subscribe(p, Waiter::Combine { combine, index }),
            v => rt.combine_settle(combine, index, Settlement::Ok(v)),
        }
    }
    target
}

impl Runtime {
    /// Feeds one slot's settlement into a pending combinator. Commits
    /// (settling the target and dropping the record) when the kind's rule
    /// says so; late deliveries to a committed combinator vanish here.
    pub(crate) fn combine_settle(
        &mut self,
        combine: CombineId,
        index: usize,
        settlement: Settlement,
    ) {
        let commit: Option<Settlement> = {
            let Some(c) = self.combines.get_mut(combine.0) else {
                return;
            };
            match c.kind {
                // Resolves once every slot settled, with a [error, value]
                // pair per slot; never rejects.
                CombineKind::All => {
                    if let Some(slot) = c.slots.get_mut(index) {
                        if slot.is_none() {
                            *slot = Some(settlement);
                            c.remaining -= 1;
                        }
                    }
                    if c.remaining == 0 {
                        let report = c
                            .slots
                            .drain(..)
                            .map(|slot| match slot {
                                Some(Settlement::Ok(v)) => Value::List(vec![Value::Null, v]),
                                Some(Settlement::Err(e)) => {
                                    Value::List(vec![Value::Str(e.to_string()), Value::Null])
                                }
                                None => Value::List(vec![Value::Null, Value::Null]),
                            })
                            .collect();
                        Some(Settlement::Ok(Value::List(report)))
                    } else {
                        None
                    }
                }
                // False as soon as any input is falsy or fails, otherwise
                // the last input's value once all settled.
                CombineKind::And => {
                    let falsy = match &settlement {
                        Settlement::Err(_) => true,
                        Settlement::Ok(v) => !v.truthy(),
                    };
                    if falsy {
                        Some(Settlement::Ok(Value::Bool(false)))
                    } else {
                        if let Some(slot) = c.slots.get_mut(index) {
                            if slot.is_none() {
                                *slot = Some(settlement);
                                c.remaining -= 1;
                            }
                        }
                        if c.remaining == 0 {
                            let last = match c.slots.pop().flatten() {
                                Some(Settlement::Ok(v)) => v,
                                _ => Value::Null,
                            };
                            Some(Settlement::Ok(last))
                        } else {
                            None
                        }
                    }
                }
                // The first settlement wins, success or failure.
                CombineKind::Any => Some(settlement),
                // The first truthy value wins; errors and falsy values are
                // consumed, and exhaustion yields false.
                CombineKind::Or => match &settlement {
                    Settlement::Ok(v) if v.truthy() => Some(settlement),
                    _ => {
                        c.remaining -= 1;
                        if c.remaining == 0 {
                            Some(Settlement::Ok(Value::Bool(false)))
                        } else {
                            None
                        }
                    }
                },
            }
        };
        if let Some(outcome) = commit {
            if let Some(record) = self.combines.remove(combine.0) {
                tracing::trace!(kind = ?record.kind, promise = %record.target, "combinator committed");
                self.settle(record.target, outcome);
            }
        }
    }
}
