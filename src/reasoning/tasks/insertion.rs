//! Forward chaining of additions.
//!
//! Every tuple on the add list fires the rules at the current level over the
//! state being computed. Under equality the phase runs serially: a new
//! `owl:sameAs` tuple merges two classes, rewrites every visible tuple naming
//! the merged resource and schedules the rules whose constants moved.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::error::ReasonerResult;
use crate::reasoning::context::{ReasoningContext, is_same_as};
use crate::reasoning::state::{GF_ADDED, GF_ADDED_MERGED, became_false, present_after};
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::resource::ResourceId;
use crate::rules::{Matcher, RuleSet};
use crate::table::Triple;

use super::evaluate_queues::evaluate_rule;
use super::{effective_level, fire_negative, fire_positive};

pub struct Insertion {
    ctx: Arc<ReasoningContext>,
    rules: Arc<RuleSet>,
    level: Option<usize>,
    add_cursor: AtomicUsize,
    delete_cursor: AtomicUsize,
    reevaluate_cursor: AtomicUsize,
}

impl Insertion {
    pub fn new(ctx: Arc<ReasoningContext>, rules: Arc<RuleSet>, level: Option<usize>) -> Self {
        Self {
            ctx,
            rules,
            level,
            add_cursor: AtomicUsize::new(0),
            delete_cursor: AtomicUsize::new(0),
            reevaluate_cursor: AtomicUsize::new(0),
        }
    }

    /// Merge the classes of a new `owl:sameAs` tuple's subject and object.
    fn merge<const MON: bool>(
        &self,
        worker: usize,
        subject: ResourceId,
        object: ResourceId,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let Some((kept, merged)) = ctx.equality.merge(subject, object) else {
            return Ok(());
        };
        tracing::trace!(kept, merged, "merged equivalence classes");
        for index in ctx.rows_mentioning(merged) {
            let Some((triple, status, flags)) = ctx.load(index) else {
                continue;
            };
            if !present_after(status, flags) {
                continue;
            }
            if ctx.state.global_flags.set(index, GF_ADDED_MERGED) {
                ctx.state.add_list.enqueue(index);
            }
            ctx.derive::<MON, true>(worker, triple)?;
        }
        for info in self.rules.rules() {
            if info
                .constants
                .iter()
                .any(|&c| ctx.equality.representative(c) == kept)
            {
                ctx.state.schedule_reevaluation(info.id);
            }
        }
        Ok(())
    }

    fn fire_added<const MON: bool, const EQ: bool>(
        &self,
        matcher: &Matcher<'_>,
        level: Option<usize>,
        worker: usize,
        index: usize,
        triple: Triple,
    ) -> ReasonerResult<u64> {
        let ctx = &self.ctx;
        let visible = ctx.new_state();
        let mut derive = |head: Triple| ctx.derive::<MON, EQ>(worker, head).map(|_| ());
        fire_positive::<EQ, _, _>(matcher, &self.rules, level, index, triple, &visible, &mut derive)
    }
}

impl PhaseBody for Insertion {
    const NAME: &'static str = "insertion";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let state = &ctx.state;
        ctx.rules.ensure_thread_ready(worker.index);
        let level = effective_level::<LVL>(self.level);
        let matcher = ctx.matcher::<EQ>();
        let mut fired = 0;

        // A negated atom turning false allows new instances.
        if self.rules.has_rules_with_negation(level) {
            let visible = ctx.new_state();
            let mut derive =
                |head: Triple| ctx.derive::<MON, EQ>(worker.index, head).map(|_| ());
            while !worker.is_cancelled() {
                let Some(index) = state.delete_list.dequeue_from(&self.delete_cursor, MT) else {
                    break;
                };
                let Some((triple, _, flags)) = ctx.load(index) else {
                    continue;
                };
                if became_false(flags) {
                    fired += fire_negative::<EQ, _, _>(
                        &matcher,
                        &self.rules,
                        level,
                        triple,
                        &visible,
                        &mut derive,
                    )?;
                }
            }
        }

        loop {
            let mut progressed = false;
            while let Some(index) = state.add_list.dequeue_from(&self.add_cursor, MT) {
                progressed = true;
                if worker.is_cancelled() {
                    ctx.rules.record_firing(worker.index, fired);
                    return Ok(());
                }
                let Some((triple, _, flags)) = ctx.load(index) else {
                    continue;
                };
                if flags & GF_ADDED == 0 || flags & GF_ADDED_MERGED != 0 {
                    continue;
                }
                if EQ {
                    if !ctx.is_canonical(&triple) {
                        state.global_flags.set(index, GF_ADDED_MERGED);
                        ctx.derive::<MON, EQ>(worker.index, triple)?;
                        continue;
                    }
                    if is_same_as(&triple) && triple.subject != triple.object {
                        self.merge::<MON>(worker.index, triple.subject, triple.object)?;
                        continue;
                    }
                }
                fired += self.fire_added::<MON, EQ>(&matcher, level, worker.index, index, triple)?;
            }
            if EQ {
                while let Some(rule) = state
                    .reevaluate_rules
                    .dequeue_from(&self.reevaluate_cursor, MT)
                {
                    progressed = true;
                    if let Some(info) = self.rules.rule(rule) {
                        fired += evaluate_rule::<MON, EQ>(ctx, &matcher, info, level, worker.index)?;
                    }
                }
            }
            if !progressed || worker.is_cancelled() {
                break;
            }
        }
        ctx.rules.record_firing(worker.index, fired);
        Ok(())
    }
}
