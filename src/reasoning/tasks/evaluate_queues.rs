//! Whole-rule evaluation of queued rules.
//!
//! Rules being removed are evaluated over the state before the round and
//! their head instances seeded as deletion candidates. Rules just added, and
//! rules whose constants changed equivalence class, are evaluated over the
//! state the round computes and their heads derived.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::error::ReasonerResult;
use crate::reasoning::context::ReasoningContext;
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::rules::{Matcher, RuleInfo, RuleSet, Seed};
use crate::table::Triple;

use super::{effective_level, fire};

pub struct EvaluateDeletedRules {
    ctx: Arc<ReasoningContext>,
    /// Rule set still holding the rules being removed.
    rules: Arc<RuleSet>,
    dred: bool,
    cursor: AtomicUsize,
}

impl EvaluateDeletedRules {
    pub fn new(ctx: Arc<ReasoningContext>, rules: Arc<RuleSet>, dred: bool) -> Self {
        Self {
            ctx,
            rules,
            dred,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl PhaseBody for EvaluateDeletedRules {
    const NAME: &'static str = "evaluate deleted rules";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        ctx.rules.ensure_thread_ready(worker.index);
        let matcher = ctx.matcher::<EQ>();
        let mut fired = 0;
        let mut seed_head = |head: Triple| -> ReasonerResult<()> {
            if let Some(index) = ctx.table.tuple_index(&head) {
                ctx.seed_deletion(index, self.dred);
            }
            Ok(())
        };
        while !worker.is_cancelled() {
            let Some(rule) = ctx.state.deleted_rules.dequeue_from(&self.cursor, MT) else {
                break;
            };
            let Some(info) = self.rules.rule(rule) else {
                continue;
            };
            fired += fire(
                &matcher,
                info,
                None,
                Seed::None,
                &ReasoningContext::old_state,
                &mut seed_head,
            )?;
        }
        ctx.rules.record_firing(worker.index, fired);
        Ok(())
    }
}

/// Which rule queue of the round state to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleQueue {
    /// Rules made active by the last `propagate_insertions`.
    Inserted,
    /// Rules whose constants changed equivalence class.
    Reevaluate,
}

pub struct EvaluateRuleQueue {
    ctx: Arc<ReasoningContext>,
    rules: Arc<RuleSet>,
    queue: RuleQueue,
    level: Option<usize>,
    cursor: AtomicUsize,
}

impl EvaluateRuleQueue {
    pub fn new(
        ctx: Arc<ReasoningContext>,
        rules: Arc<RuleSet>,
        queue: RuleQueue,
        level: Option<usize>,
    ) -> Self {
        Self {
            ctx,
            rules,
            queue,
            level,
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Derive every head instance of `info` at `level` over the new state.
pub(crate) fn evaluate_rule<const MON: bool, const EQ: bool>(
    ctx: &ReasoningContext,
    matcher: &Matcher<'_>,
    info: &RuleInfo,
    level: Option<usize>,
    worker: usize,
) -> ReasonerResult<u64> {
    if !info.has_head_at(level) {
        return Ok(0);
    }
    let visible = ctx.new_state();
    let mut derive = |head: Triple| ctx.derive::<MON, EQ>(worker, head).map(|_| ());
    fire(matcher, info, level, Seed::None, &visible, &mut derive)
}

impl PhaseBody for EvaluateRuleQueue {
    const NAME: &'static str = "evaluate rule queue";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        ctx.rules.ensure_thread_ready(worker.index);
        let queue = match self.queue {
            RuleQueue::Inserted => &ctx.state.inserted_rules,
            RuleQueue::Reevaluate => &ctx.state.reevaluate_rules,
        };
        let level = effective_level::<LVL>(self.level);
        let matcher = ctx.matcher::<EQ>();
        let mut fired = 0;
        while !worker.is_cancelled() {
            let Some(rule) = queue.dequeue_from(&self.cursor, MT) else {
                break;
            };
            if let Some(info) = self.rules.rule(rule) {
                fired += evaluate_rule::<MON, EQ>(ctx, &matcher, info, level, worker.index)?;
            }
        }
        ctx.rules.record_firing(worker.index, fired);
        Ok(())
    }
}
