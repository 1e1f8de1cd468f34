//! Backward/Forward maintenance.
//!
//! A deletion candidate is only deleted once a backward search fails to find
//! a derivation for it. The search explores rule instances over tuples that
//! survive so far and forward-chains from every tuple it proves, so tuples
//! sitting on a cycle are proved as soon as any of them is.
//!
//! The phase runs on one worker; the set of checked tuples is private to it.
//!
//! With equality, a tuple naming a non-trivial class is never proved. Such
//! classes are broken in the proving snapshot and every tuple naming them is
//! deleted; the classes are rebuilt by copying and reseeding afterwards.

use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::equality::EqualityManager;
use crate::error::ReasonerResult;
use crate::reasoning::context::ReasoningContext;
use crate::reasoning::state::{
    GF_ADDED, GF_DELETED, GF_DELETED_NEW, LF_PROVED, became_false, became_true, present_after,
    present_before,
};
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::resource::ResourceId;
use crate::rules::{BodyLiteral, Matcher, RuleInfo, RuleSet, Seed};
use crate::table::{Triple, TupleIndex, TupleStatus};

use super::{effective_level, fire_negative, fire_positive};

pub struct BackwardForward {
    ctx: Arc<ReasoningContext>,
    rules: Arc<RuleSet>,
    level: Option<usize>,
    /// Snapshot of the equivalence classes being checked against.
    proving: Option<Arc<EqualityManager>>,
}

impl BackwardForward {
    pub fn new(
        ctx: Arc<ReasoningContext>,
        rules: Arc<RuleSet>,
        level: Option<usize>,
        proving: Option<Arc<EqualityManager>>,
    ) -> Self {
        Self {
            ctx,
            rules,
            level,
            proving,
        }
    }
}

impl PhaseBody for BackwardForward {
    const NAME: &'static str = "backward/forward";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        self.ctx.rules.ensure_thread_ready(worker.index);
        let mut search = Search::<EQ> {
            ctx: &self.ctx,
            rules: &self.rules,
            matcher: self.ctx.matcher::<EQ>(),
            level: effective_level::<LVL>(self.level),
            proving: if EQ { self.proving.as_deref() } else { None },
            checked: HashSet::new(),
            broken: BTreeSet::new(),
            proved_cursor: self.ctx.state.proved_list.end_position(),
            fired: 0,
        };
        let result = search.run(worker);
        self.ctx.rules.record_firing(worker.index, search.fired);
        result
    }
}

struct Search<'a, const EQ: bool> {
    ctx: &'a ReasoningContext,
    rules: &'a RuleSet,
    matcher: Matcher<'a>,
    level: Option<usize>,
    proving: Option<&'a EqualityManager>,
    checked: HashSet<TupleIndex>,
    /// Representatives of classes found in the way of a proof.
    broken: BTreeSet<ResourceId>,
    proved_cursor: usize,
    fired: u64,
}

fn same_level(level: Option<usize>, literal: &BodyLiteral) -> bool {
    !literal.negated && level.is_none_or(|l| literal.level == l)
}

/// Visibility for one-step proofs: same-level body tuples must already be
/// proved, everything else is read from the state being computed.
fn proved_state(
    ctx: &ReasoningContext,
    level: Option<usize>,
) -> impl Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool + '_ {
    move |literal, index, status| {
        if same_level(level, literal) {
            ctx.state.level_flags.get(index) & LF_PROVED != 0
        } else {
            present_after(status, ctx.flags(index))
        }
    }
}

/// Visibility for the backward search: same-level body tuples that are not
/// deleted yet.
fn surviving_state(
    ctx: &ReasoningContext,
    level: Option<usize>,
) -> impl Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool + '_ {
    move |literal, index, status| {
        let flags = ctx.flags(index);
        if same_level(level, literal) {
            present_before(status) && flags & GF_DELETED == 0
        } else {
            present_after(status, flags)
        }
    }
}

impl<'a, const EQ: bool> Search<'a, EQ> {
    fn run(&mut self, worker: &WorkerHandle) -> ReasonerResult<()> {
        let ctx = self.ctx;
        let state = &ctx.state;

        if self.rules.has_rules_with_negation(self.level) {
            for position in 0..state.add_list.end_position() {
                if worker.is_cancelled() {
                    return Ok(());
                }
                let Some(index) = state.add_list.get(position) else {
                    continue;
                };
                let Some((triple, _, flags)) = self.ctx.load(index) else {
                    continue;
                };
                if became_true(flags) {
                    let heads = self.fire_from(None, triple)?;
                    self.consider_all(heads)?;
                }
            }
        }

        let mut position = 0;
        loop {
            while let Some(index) = state.delete_list.get(position) {
                position += 1;
                if worker.is_cancelled() {
                    return Ok(());
                }
                let Some((triple, _, flags)) = self.ctx.load(index) else {
                    continue;
                };
                if flags & GF_DELETED_NEW != 0
                    && flags & (GF_DELETED | GF_ADDED) == 0
                    && self.in_level(&triple)
                {
                    self.candidate(index)?;
                }
                if became_false(self.ctx.flags(index)) {
                    let heads = self.fire_from(Some(index), triple)?;
                    self.consider_all(heads)?;
                }
            }
            if self.broken.is_empty() {
                return Ok(());
            }
            self.break_classes();
        }
    }

    fn in_level(&self, triple: &Triple) -> bool {
        self.level
            .is_none_or(|l| self.rules.tuple_level(triple) == l)
    }

    fn proved(&self, index: TupleIndex) -> bool {
        self.ctx.state.level_flags.get(index) & LF_PROVED != 0
    }

    /// Heads of the instances a changed tuple took part in before the round:
    /// positively when `tuple` is given, through a negation otherwise.
    fn fire_from(&mut self, tuple: Option<TupleIndex>, triple: Triple) -> ReasonerResult<Vec<Triple>> {
        let mut heads = Vec::new();
        let mut collect = |head: Triple| -> ReasonerResult<()> {
            heads.push(head);
            Ok(())
        };
        let visible = ReasoningContext::old_state;
        let fired = match tuple {
            Some(index) => fire_positive::<EQ, _, _>(
                &self.matcher,
                self.rules,
                self.level,
                index,
                triple,
                &visible,
                &mut collect,
            )?,
            None => fire_negative::<EQ, _, _>(
                &self.matcher,
                self.rules,
                self.level,
                triple,
                &visible,
                &mut collect,
            )?,
        };
        self.fired += fired;
        Ok(heads)
    }

    fn consider_all(&mut self, heads: Vec<Triple>) -> ReasonerResult<()> {
        for head in heads {
            let Some(index) = self.ctx.table.tuple_index(&head) else {
                continue;
            };
            let status = self.ctx.table.status(index);
            if present_before(status) && self.ctx.flags(index) & GF_DELETED == 0 {
                self.candidate(index)?;
            }
        }
        Ok(())
    }

    /// Delete `index` unless a derivation for it can be found.
    fn candidate(&mut self, index: TupleIndex) -> ReasonerResult<()> {
        if self.ctx.flags(index) & GF_DELETED != 0 || self.proved(index) {
            return Ok(());
        }
        if !self.checked.contains(&index) {
            self.check(index)?;
        }
        if !self.proved(index) {
            self.ctx.mark_deleted(index);
        }
        Ok(())
    }

    /// Backward search for a derivation of `index`.
    fn check(&mut self, index: TupleIndex) -> ReasonerResult<()> {
        self.checked.insert(index);
        let Some((triple, _, _)) = self.ctx.load(index) else {
            return Ok(());
        };
        if let Some(proving) = self.proving {
            let classes = proving.nontrivial_classes(&triple);
            if !classes.is_empty() {
                self.broken.extend(classes);
                return Ok(());
            }
        }
        if self.saturate(index, triple) {
            return self.prove(index);
        }
        for body in self.instances(triple) {
            for tuple in body {
                if self.proved(index) {
                    return Ok(());
                }
                if !self.checked.contains(&tuple) {
                    self.check(tuple)?;
                }
            }
        }
        Ok(())
    }

    /// Visit the rule instances at this level with `triple` as a head.
    fn head_instances<V, F>(&self, triple: Triple, visible: &V, mut visit: F) -> bool
    where
        V: Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool,
        F: FnMut(&RuleInfo, &[TupleIndex]) -> ControlFlow<()>,
    {
        for info in self.rules.rules_for_level(self.level) {
            let info: &RuleInfo = info;
            for (head, atom) in info.heads.iter().enumerate() {
                if self.level.is_some_and(|l| atom.component_level != l) {
                    continue;
                }
                if !EQ && !atom.atom.may_match(&triple) {
                    continue;
                }
                let seed = Seed::Head { head, triple };
                let flow = self
                    .matcher
                    .evaluate(info, seed, visible, |_, body| visit(info, body));
                if flow.is_break() {
                    return true;
                }
            }
        }
        false
    }

    fn saturate(&self, index: TupleIndex, triple: Triple) -> bool {
        if self.ctx.explicitly_supported::<EQ>(index, &triple) {
            return true;
        }
        let visible = proved_state(self.ctx, self.level);
        self.head_instances(triple, &visible, |_, _| ControlFlow::Break(()))
    }

    /// Same-level body tuples of every surviving instance deriving `triple`.
    fn instances(&self, triple: Triple) -> Vec<Vec<TupleIndex>> {
        let level = self.level;
        let visible = surviving_state(self.ctx, level);
        let mut found = Vec::new();
        self.head_instances(triple, &visible, |info, body| {
            found.push(
                info.positive
                    .iter()
                    .zip(body)
                    .filter(|(literal, _)| same_level(level, literal))
                    .map(|(_, &tuple)| tuple)
                    .collect(),
            );
            ControlFlow::Continue(())
        });
        found
    }

    /// Mark `index` proved and forward-chain over checked tuples.
    fn prove(&mut self, index: TupleIndex) -> ReasonerResult<()> {
        let ctx = self.ctx;
        let state = &ctx.state;
        if !state.level_flags.set(index, LF_PROVED) {
            return Ok(());
        }
        state.proved_list.enqueue(index);
        while let Some(proved) = state.proved_list.get(self.proved_cursor) {
            self.proved_cursor += 1;
            let Some((triple, _, _)) = self.ctx.load(proved) else {
                continue;
            };
            let visible = proved_state(self.ctx, self.level);
            let mut heads = Vec::new();
            let fired = fire_positive::<EQ, _, _>(
                &self.matcher,
                self.rules,
                self.level,
                proved,
                triple,
                &visible,
                &mut |head: Triple| -> ReasonerResult<()> {
                    heads.push(head);
                    Ok(())
                },
            )?;
            self.fired += fired;
            for head in heads {
                let Some(tuple) = self.ctx.table.tuple_index(&head) else {
                    continue;
                };
                if !self.checked.contains(&tuple) || self.ctx.flags(tuple) & GF_DELETED != 0 {
                    continue;
                }
                if self
                    .proving
                    .is_some_and(|p| !p.nontrivial_classes(&head).is_empty())
                {
                    continue;
                }
                if state.level_flags.set(tuple, LF_PROVED) {
                    state.proved_list.enqueue(tuple);
                }
            }
        }
        Ok(())
    }

    /// Split the classes met during the search and delete their tuples.
    fn break_classes(&mut self) {
        let Some(proving) = self.proving else {
            self.broken.clear();
            return;
        };
        for representative in std::mem::take(&mut self.broken) {
            if proving.class_size(representative) <= 1 {
                continue;
            }
            let members = proving.break_equals(representative);
            tracing::debug!(
                representative,
                members = members.len(),
                "breaking class during backward search"
            );
            for row in self.ctx.rows_mentioning(representative) {
                self.ctx.mark_deleted(row);
            }
        }
    }
}
