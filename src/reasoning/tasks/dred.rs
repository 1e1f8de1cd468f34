//! Delete/Rederive maintenance.
//!
//! Overdeletion propagates every lost derivation over the state before the
//! round, deleting whatever any rule instance through a deleted tuple
//! produced. Rederivation then puts back the overdeleted tuples that still
//! have explicit support or a rule instance over the state being computed.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::error::ReasonerResult;
use crate::reasoning::context::ReasoningContext;
use crate::reasoning::state::{GF_ADDED, GF_DELETED, became_false, became_true, present_before};
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::rules::{Matcher, RuleSet, Seed};
use crate::table::Triple;

use super::{effective_level, fire_negative, fire_positive};

pub struct Overdelete {
    ctx: Arc<ReasoningContext>,
    rules: Arc<RuleSet>,
    level: Option<usize>,
    delete_cursor: AtomicUsize,
    add_cursor: AtomicUsize,
}

impl Overdelete {
    /// Overdelete from delete-list position `start` onwards.
    pub fn new(
        ctx: Arc<ReasoningContext>,
        rules: Arc<RuleSet>,
        level: Option<usize>,
        start: usize,
    ) -> Self {
        Self {
            ctx,
            rules,
            level,
            delete_cursor: AtomicUsize::new(start),
            add_cursor: AtomicUsize::new(0),
        }
    }
}

impl PhaseBody for Overdelete {
    const NAME: &'static str = "overdelete";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        ctx.rules.ensure_thread_ready(worker.index);
        let level = effective_level::<LVL>(self.level);
        let matcher = ctx.matcher::<EQ>();
        let visible = ReasoningContext::old_state;
        let mut delete_head = |head: Triple| -> ReasonerResult<()> {
            if let Some(index) = ctx.table.tuple_index(&head) {
                ctx.mark_deleted(index);
            }
            Ok(())
        };
        let mut fired = 0;

        // A negated atom turning true kills the instances it used to allow.
        if self.rules.has_rules_with_negation(level) {
            while !worker.is_cancelled() {
                let Some(index) = ctx.state.add_list.dequeue_from(&self.add_cursor, MT) else {
                    break;
                };
                let Some((triple, _, flags)) = ctx.load(index) else {
                    continue;
                };
                if became_true(flags) {
                    fired += fire_negative::<EQ, _, _>(
                        &matcher,
                        &self.rules,
                        level,
                        triple,
                        &visible,
                        &mut delete_head,
                    )?;
                }
            }
        }

        while !worker.is_cancelled() {
            let Some(index) = ctx.state.delete_list.dequeue_from(&self.delete_cursor, MT) else {
                break;
            };
            let Some((triple, status, flags)) = ctx.load(index) else {
                continue;
            };
            if !became_false(flags) || !present_before(status) {
                continue;
            }
            fired += fire_positive::<EQ, _, _>(
                &matcher,
                &self.rules,
                level,
                index,
                triple,
                &visible,
                &mut delete_head,
            )?;
        }
        ctx.rules.record_firing(worker.index, fired);
        Ok(())
    }
}

pub struct Rederive {
    ctx: Arc<ReasoningContext>,
    rules: Arc<RuleSet>,
    level: Option<usize>,
    cursor: AtomicUsize,
}

impl Rederive {
    pub fn new(ctx: Arc<ReasoningContext>, rules: Arc<RuleSet>, level: Option<usize>) -> Self {
        Self {
            ctx,
            rules,
            level,
            cursor: AtomicUsize::new(0),
        }
    }

    /// True if some rule instance with `triple` as head holds in the new state.
    fn derivable<const EQ: bool>(
        &self,
        matcher: &Matcher<'_>,
        level: Option<usize>,
        triple: Triple,
    ) -> bool {
        let visible = self.ctx.new_state();
        self.rules.rules_for_level(level).any(|info| {
            info.heads.iter().enumerate().any(|(head, atom)| {
                if level.is_some_and(|l| atom.component_level != l) {
                    return false;
                }
                if !EQ && !atom.atom.may_match(&triple) {
                    return false;
                }
                matcher
                    .evaluate(info, Seed::Head { head, triple }, &visible, |_, _| {
                        ControlFlow::Break(())
                    })
                    .is_break()
            })
        })
    }
}

impl PhaseBody for Rederive {
    const NAME: &'static str = "rederive";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        ctx.rules.ensure_thread_ready(worker.index);
        let level = effective_level::<LVL>(self.level);
        let matcher = ctx.matcher::<EQ>();
        while !worker.is_cancelled() {
            let Some(index) = ctx.state.delete_list.dequeue_from(&self.cursor, MT) else {
                break;
            };
            let Some((triple, _, flags)) = ctx.load(index) else {
                continue;
            };
            if flags & GF_DELETED == 0 || flags & GF_ADDED != 0 {
                continue;
            }
            if level.is_some_and(|l| self.rules.tuple_level(&triple) != l) {
                continue;
            }
            // Rows of broken classes come back through reseeding.
            if EQ && (!ctx.is_canonical(&triple) || ctx.mentions_unrepresented(&triple)) {
                continue;
            }
            if ctx.explicitly_supported::<EQ>(index, &triple)
                || self.derivable::<EQ>(&matcher, level, triple)
            {
                ctx.readd::<MON>(worker.index, index, &triple);
            }
        }
        Ok(())
    }
}
