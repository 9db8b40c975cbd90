//! Selecting combinators: the first qualifying input wins.

use super::{combine, CombineInput, CombineKind};
use crate::runtime::TaskCx;
use crate::types::PromiseId;

/// Settles like whichever input settles first: its value on success, its
/// error on failure. Empty input resolves `Null`.
pub fn any(cx: &mut TaskCx<'_>, inputs: Vec<CombineInput>) -> PromiseId {
    combine(cx, CombineKind::Any, inputs)
}

/// Resolves with the first truthy value among the inputs; falsy values and
/// failures are skipped. Resolves `false` when every input is exhausted.
pub fn or(cx: &mut TaskCx<'_>, inputs: Vec<CombineInput>) -> PromiseId {
    combine(cx, CombineKind::Or, inputs)
}
