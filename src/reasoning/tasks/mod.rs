//! Phase tasks of an incremental round.
//!
//! Every phase is a [`PhaseBody`](super::task::PhaseBody) over the shared
//! [`ReasoningContext`](super::context::ReasoningContext). Workers of one
//! phase share its queue cursors and stop at the next dequeue once the
//! execution is cancelled.

pub mod dred;
pub mod equality;
pub mod evaluate_queues;
pub mod fbf;
pub mod initialize;
pub mod insertion;
pub mod propagate;

use std::ops::ControlFlow;

use crate::error::ReasonerResult;
use crate::rules::{BodyLiteral, Matcher, RuleInfo, RuleSet, Seed};
use crate::table::{Triple, TupleIndex, TupleStatus};

pub use dred::{Overdelete, Rederive};
pub use equality::{EqualityUpdateMode, UpdateEqualityManager};
pub use evaluate_queues::{EvaluateDeletedRules, EvaluateRuleQueue, RuleQueue};
pub use fbf::BackwardForward;
pub use initialize::{InitializeDeleted, InitializeExplicit, InitializeInserted};
pub use insertion::Insertion;
pub use propagate::PropagateChanges;

/// Evaluate `info` from `seed` and hand every head instance at `level` to
/// `on_head`. Returns the number of rule instances found.
pub(crate) fn fire<V, H>(
    matcher: &Matcher<'_>,
    info: &RuleInfo,
    level: Option<usize>,
    seed: Seed,
    visible: &V,
    on_head: &mut H,
) -> ReasonerResult<u64>
where
    V: Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool,
    H: FnMut(Triple) -> ReasonerResult<()>,
{
    let mut fired = 0;
    let mut failure = None;
    let _ = matcher.evaluate(info, seed, visible, |bindings, _| {
        fired += 1;
        for head in info.heads_at(level) {
            if let Err(e) = on_head(matcher.instantiate(&head.atom, bindings)) {
                failure = Some(e);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(fired),
    }
}

/// Fire the rules at `level` whose positive body atoms `triple` matches.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fire_positive<const EQ: bool, V, H>(
    matcher: &Matcher<'_>,
    rules: &RuleSet,
    level: Option<usize>,
    tuple: TupleIndex,
    triple: Triple,
    visible: &V,
    on_head: &mut H,
) -> ReasonerResult<u64>
where
    V: Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool,
    H: FnMut(Triple) -> ReasonerResult<()>,
{
    let mut fired = 0;
    for info in rules.rules_for_level(level) {
        for (literal, body) in info.positive.iter().enumerate() {
            // Constants only compare directly when they are not normalized.
            if !EQ && !body.atom.may_match(&triple) {
                continue;
            }
            let seed = Seed::Positive {
                literal,
                tuple,
                triple,
            };
            fired += fire(matcher, info, level, seed, visible, on_head)?;
        }
    }
    Ok(fired)
}

/// Fire the rules at `level` whose negated body atoms `triple` matches.
pub(crate) fn fire_negative<const EQ: bool, V, H>(
    matcher: &Matcher<'_>,
    rules: &RuleSet,
    level: Option<usize>,
    triple: Triple,
    visible: &V,
    on_head: &mut H,
) -> ReasonerResult<u64>
where
    V: Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool,
    H: FnMut(Triple) -> ReasonerResult<()>,
{
    let mut fired = 0;
    for info in rules.rules_for_level(level) {
        for (literal, body) in info.negative.iter().enumerate() {
            if !EQ && !body.atom.may_match(&triple) {
                continue;
            }
            let seed = Seed::Negative { literal, triple };
            fired += fire(matcher, info, level, seed, visible, on_head)?;
        }
    }
    Ok(fired)
}

/// Level a phase restricts itself to under `LVL`.
pub(crate) fn effective_level<const LVL: bool>(level: Option<usize>) -> Option<usize> {
    if LVL { level } else { None }
}
