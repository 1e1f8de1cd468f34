//! Sequencing of phases into incremental rounds.
//!
//! A round evaluates the rules being removed, removes them, seeds the
//! scheduled explicit changes and then either walks the stratification
//! levels in ascending order (deletion, then insertion, per level) or
//! processes everything as one level when equality reasoning is on. Results
//! are committed level by level. Rules added since the last round get a
//! second pass over the committed state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::equality::EqualityManager;
use crate::error::{ConfigError, ReasonerResult, TaskError};
use crate::resource::Dictionary;
use crate::rules::{AtomKey, RuleSet, UnstratifiedComponent};
use crate::table::{Pattern, TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED, TupleIndex};

use super::context::ReasoningContext;
use super::pool::WorkerPool;
use super::state::{LevelMarker, became_false, became_true};
use super::task::{PhaseBody, PhaseTask, TaskConfig};
use super::tasks::{
    BackwardForward, EqualityUpdateMode, EvaluateDeletedRules, EvaluateRuleQueue, InitializeDeleted,
    InitializeExplicit, InitializeInserted, Insertion, Overdelete, PropagateChanges, Rederive,
    RuleQueue, UpdateEqualityManager,
};
use super::{DeletionStrategy, EqualityMode};

/// Which sequencing a round used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Maintenance {
    ByLevels,
    NoLevels,
    SingleStratum,
}

/// What one round did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    pub maintenance: Maintenance,
    /// `None` for rematerialization.
    pub strategy: Option<DeletionStrategy>,
    /// 2 when rules added since the last round needed a second pass.
    pub passes: usize,
    /// Derived tuples that disappeared.
    pub deleted: usize,
    /// Derived tuples that appeared.
    pub added: usize,
    /// Level markers of the last pass.
    pub level_markers: Vec<LevelMarker>,
}

impl RoundSummary {
    fn new(maintenance: Maintenance, strategy: Option<DeletionStrategy>) -> Self {
        Self {
            maintenance,
            strategy,
            passes: 1,
            deleted: 0,
            added: 0,
            level_markers: Vec::new(),
        }
    }
}

/// Runs rounds of incremental maintenance on a worker pool.
pub struct IncrementalReasoner {
    ctx: Arc<ReasoningContext>,
    pool: WorkerPool,
    equality: EqualityMode,
    queue_capacity: usize,
    abort_requested: AtomicBool,
    round: Mutex<()>,
}

impl IncrementalReasoner {
    pub fn new(
        ctx: Arc<ReasoningContext>,
        pool: WorkerPool,
        equality: EqualityMode,
        queue_capacity: usize,
    ) -> Self {
        ctx.rules.set_thread_capacity(pool.thread_count());
        Self {
            ctx,
            pool,
            equality,
            queue_capacity,
            abort_requested: AtomicBool::new(false),
            round: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<ReasoningContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn equality_mode(&self) -> EqualityMode {
        self.equality
    }

    /// Stop the running round at the next dequeue of its current phase.
    /// The round returns [`TaskError::Aborted`].
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.pool.stop_current_task();
    }

    // -- rounds -------------------------------------------------------------

    /// Maintain the materialization level by level.
    pub fn apply_by_levels(&self, strategy: DeletionStrategy) -> ReasonerResult<RoundSummary> {
        let _round = self.round.lock().expect("round lock poisoned");
        self.abort_requested.store(false, Ordering::SeqCst);
        if self.equality != EqualityMode::Off {
            return Err(ConfigError::InvalidConfig {
                message: "level-by-level maintenance requires equality reasoning to be off".into(),
            }
            .into());
        }
        let preview = self.ctx.rules.preview();
        self.reject_aggregation(&preview)?;
        if !preview.is_stratified() {
            return Err(ConfigError::NotStratified {
                components: describe_components(
                    &self.ctx.dictionary,
                    preview.unstratified_components(),
                ),
            }
            .into());
        }

        let span = tracing::info_span!("round", maintenance = "by-levels", %strategy);
        let _enter = span.enter();
        let mut summary = RoundSummary::new(Maintenance::ByLevels, Some(strategy));
        let rules_added = self.begin_round(strategy, true)?;
        let rules = self.ctx.rules.snapshot();
        self.process_levels(&rules, strategy, false)?;
        self.commit(&mut summary)?;
        if rules_added {
            let rules = self.begin_second_pass(&mut summary)?;
            self.process_levels(&rules, strategy, true)?;
            self.finish_second_pass(&mut summary)?;
        }
        self.finish(summary)
    }

    /// Maintain the materialization as a single level.
    pub fn apply_no_levels(&self, strategy: DeletionStrategy) -> ReasonerResult<RoundSummary> {
        let _round = self.round.lock().expect("round lock poisoned");
        self.abort_requested.store(false, Ordering::SeqCst);
        let preview = self.ctx.rules.preview();
        self.reject_aggregation(&preview)?;
        if preview.has_rules_with_negation(None) {
            return Err(ConfigError::NegationWithoutLevels.into());
        }

        let span = tracing::info_span!("round", maintenance = "no-levels", %strategy);
        let _enter = span.enter();
        let mut summary = RoundSummary::new(Maintenance::NoLevels, Some(strategy));
        // With equality, inserted tuples are normalized only once the
        // deletion phase has settled the classes.
        let equality = self.equality != EqualityMode::Off;
        let rules_added = self.begin_round(strategy, !equality)?;
        let rules = self.ctx.rules.snapshot();
        self.process_single_level(&rules, strategy, false)?;
        self.commit(&mut summary)?;
        if rules_added {
            let rules = self.begin_second_pass(&mut summary)?;
            self.process_single_level(&rules, strategy, true)?;
            self.finish_second_pass(&mut summary)?;
        }
        self.finish(summary)
    }

    /// Recompute every derived tuple from the explicit ones, ignoring what
    /// was derived before. Only for rules without negation or aggregation.
    pub fn materialize_single_stratum(&self) -> ReasonerResult<RoundSummary> {
        let _round = self.round.lock().expect("round lock poisoned");
        self.abort_requested.store(false, Ordering::SeqCst);
        let ctx = &self.ctx;
        let preview = ctx.rules.preview();
        if preview.has_rules_with_negation(None) || preview.has_rules_with_aggregation(None) {
            return Err(ConfigError::SingleStratumUnsupported.into());
        }
        ctx.rules.propagate_deletions();
        ctx.rules.propagate_insertions();
        let rules = ctx.rules.snapshot();

        let span = tracing::info_span!("round", maintenance = "single-stratum");
        let _enter = span.enter();
        let mut summary = RoundSummary::new(Maintenance::SingleStratum, None);
        ctx.state.reset(self.queue_capacity)?;
        let before = self.visible_rows();
        for index in ctx.table.matching(&Pattern::default()) {
            ctx.table
                .delete_tuple_status(index, TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED);
        }
        ctx.equality.clear();
        ctx.table.apply_scheduled_changes()?;
        tracing::debug!(cleared = before.len(), "cleared derived tuples");

        ctx.state.begin_level();
        self.level_started(None);
        self.run(InitializeExplicit::new(Arc::clone(ctx)), self.config(false))?;
        self.run_insertion(&rules, None)?;
        ctx.state.record_level_marker(None);
        self.level_finished(None);
        self.commit(&mut summary)?;

        let after = self.visible_rows();
        summary.deleted = before.difference(&after).count();
        summary.added = after.difference(&before).count();
        Ok(summary)
    }

    // -- round structure ----------------------------------------------------

    /// Reset the round state, evaluate and remove the rules being deleted
    /// and seed the scheduled explicit deletions, and insertions when
    /// `seed_insertions` is set. Returns whether rules were added since the
    /// last round.
    fn begin_round(&self, strategy: DeletionStrategy, seed_insertions: bool) -> ReasonerResult<bool> {
        let ctx = &self.ctx;
        let dred = strategy == DeletionStrategy::DRed;
        ctx.state.reset(self.queue_capacity)?;

        if ctx.rules.has_just_deleted_rules() {
            let before = ctx.rules.snapshot();
            let count = ctx.rules.enqueue_deleted_rules(&ctx.state.deleted_rules);
            if let Some(monitor) = &ctx.monitor {
                monitor.deleted_rule_evaluation_started(count);
            }
            self.run(
                EvaluateDeletedRules::new(Arc::clone(ctx), before, dred),
                self.config(false),
            )?;
            if let Some(monitor) = &ctx.monitor {
                monitor.deleted_rule_evaluation_finished();
            }
        }
        ctx.rules.propagate_deletions();
        let rules_added = ctx.rules.has_just_added_rules();

        self.run(InitializeDeleted::new(Arc::clone(ctx), dred), self.config(false))?;
        if seed_insertions {
            self.run(InitializeInserted::new(Arc::clone(ctx)), self.config(false))?;
        }
        tracing::debug!(
            seeded_deletions = ctx.state.delete_list.len(),
            seeded_insertions = ctx.state.add_list.len(),
            "round seeded"
        );
        Ok(rules_added)
    }

    fn begin_second_pass(&self, summary: &mut RoundSummary) -> ReasonerResult<Arc<RuleSet>> {
        let ctx = &self.ctx;
        ctx.rules.propagate_insertions();
        ctx.state.reset(self.queue_capacity)?;
        let count = ctx.rules.enqueue_inserted_rules(&ctx.state.inserted_rules);
        tracing::debug!(rules = count, "evaluating added rules");
        if let Some(monitor) = &ctx.monitor {
            monitor.added_rule_evaluation_started(count);
        }
        summary.passes = 2;
        Ok(ctx.rules.snapshot())
    }

    fn finish_second_pass(&self, summary: &mut RoundSummary) -> ReasonerResult<()> {
        if let Some(monitor) = &self.ctx.monitor {
            monitor.added_rule_evaluation_finished();
        }
        self.commit(summary)
    }

    fn finish(&self, summary: RoundSummary) -> ReasonerResult<RoundSummary> {
        self.ctx.table.apply_scheduled_changes()?;
        tracing::info!(
            deleted = summary.deleted,
            added = summary.added,
            passes = summary.passes,
            "round finished"
        );
        Ok(summary)
    }

    fn process_levels(
        &self,
        rules: &Arc<RuleSet>,
        strategy: DeletionStrategy,
        second_pass: bool,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        for level in 0..=rules.max_component_level() {
            let _span = tracing::debug_span!("level", level).entered();
            ctx.state.begin_level();
            self.level_started(Some(level));
            if second_pass {
                self.run(
                    EvaluateRuleQueue::new(
                        Arc::clone(ctx),
                        Arc::clone(rules),
                        RuleQueue::Inserted,
                        Some(level),
                    ),
                    self.config(true),
                )?;
            }
            match strategy {
                DeletionStrategy::DRed => {
                    self.run(
                        Overdelete::new(Arc::clone(ctx), Arc::clone(rules), Some(level), 0),
                        self.config(true),
                    )?;
                    self.run(
                        Rederive::new(Arc::clone(ctx), Arc::clone(rules), Some(level)),
                        self.config(true),
                    )?;
                }
                DeletionStrategy::Fbf => {
                    self.run(
                        BackwardForward::new(Arc::clone(ctx), Arc::clone(rules), Some(level), None),
                        self.config(true).serial(),
                    )?;
                }
            }
            if rules.has_rules_at(level) {
                self.run_insertion(rules, Some(level))?;
            }
            ctx.state.record_level_marker(Some(level));
            self.level_finished(Some(level));
        }
        Ok(())
    }

    fn process_single_level(
        &self,
        rules: &Arc<RuleSet>,
        strategy: DeletionStrategy,
        second_pass: bool,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let equality = self.equality != EqualityMode::Off;
        ctx.state.begin_level();
        self.level_started(None);
        if second_pass {
            self.run(
                EvaluateRuleQueue::new(Arc::clone(ctx), Arc::clone(rules), RuleQueue::Inserted, None),
                self.config(false),
            )?;
        }
        match strategy {
            DeletionStrategy::DRed => {
                self.run(
                    Overdelete::new(Arc::clone(ctx), Arc::clone(rules), None, 0),
                    self.config(false),
                )?;
                if equality {
                    let mut processed = ctx.state.delete_list.end_position();
                    loop {
                        let task = self.update_equality(rules, EqualityUpdateMode::Unrepresent, None)?;
                        if !task.body().changed() {
                            break;
                        }
                        self.run(
                            Overdelete::new(Arc::clone(ctx), Arc::clone(rules), None, processed),
                            self.config(false),
                        )?;
                        processed = ctx.state.delete_list.end_position();
                    }
                }
                self.run(
                    Rederive::new(Arc::clone(ctx), Arc::clone(rules), None),
                    self.config(false),
                )?;
                if equality {
                    self.update_equality(rules, EqualityUpdateMode::BreakEquals, None)?;
                }
            }
            DeletionStrategy::Fbf => {
                let proving = equality.then(|| Arc::new(ctx.equality.snapshot()));
                self.run(
                    BackwardForward::new(Arc::clone(ctx), Arc::clone(rules), None, proving.clone()),
                    self.config(false).serial(),
                )?;
                if equality {
                    self.update_equality(rules, EqualityUpdateMode::CopyClasses, proving)?;
                }
            }
        }
        if equality && !second_pass {
            self.run(InitializeInserted::new(Arc::clone(ctx)), self.config(false))?;
        }
        self.run_insertion(rules, None)?;
        ctx.state.record_level_marker(None);
        self.level_finished(None);
        Ok(())
    }

    fn run_insertion(&self, rules: &Arc<RuleSet>, level: Option<usize>) -> ReasonerResult<()> {
        let mut config = self.config(level.is_some());
        // Merging classes rewrites tuples other workers would be matching.
        if config.optimize_equality {
            config = config.serial();
        }
        self.run(
            Insertion::new(Arc::clone(&self.ctx), Arc::clone(rules), level),
            config,
        )?;
        Ok(())
    }

    fn update_equality(
        &self,
        rules: &Arc<RuleSet>,
        mode: EqualityUpdateMode,
        proving: Option<Arc<EqualityManager>>,
    ) -> ReasonerResult<PhaseTask<UpdateEqualityManager>> {
        self.run(
            UpdateEqualityManager::new(Arc::clone(&self.ctx), Arc::clone(rules), mode, proving),
            self.config(false).serial(),
        )
    }

    /// Apply every level recorded since the last commit, in level order.
    fn commit(&self, summary: &mut RoundSummary) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let ranges = ctx.state.take_commit_ranges();
        for range in &ranges {
            summary.deleted += ctx
                .state
                .delete_list
                .snapshot(range.delete.0, range.delete.1)
                .into_iter()
                .filter(|&index| became_false(ctx.flags(index)))
                .count();
            summary.added += ctx
                .state
                .add_list
                .snapshot(range.add.0, range.add.1)
                .into_iter()
                .filter(|&index| became_true(ctx.flags(index)))
                .count();
        }
        for range in ranges {
            self.run(
                PropagateChanges::new(Arc::clone(ctx), range),
                self.config(range.level.is_some()),
            )?;
        }
        summary.level_markers = ctx.state.level_markers();
        Ok(())
    }

    // -- plumbing -----------------------------------------------------------

    fn config(&self, check_component_level: bool) -> TaskConfig {
        TaskConfig {
            has_monitor: self.ctx.monitor.is_some(),
            multithreaded: self.pool.thread_count() > 1,
            optimize_equality: self.equality != EqualityMode::Off,
            check_component_level,
        }
    }

    fn run<B: PhaseBody>(&self, body: B, config: TaskConfig) -> ReasonerResult<PhaseTask<B>> {
        if self.abort_requested.load(Ordering::SeqCst) {
            return Err(TaskError::Aborted.into());
        }
        let task = PhaseTask::new(body, config);
        if let Some(monitor) = &self.ctx.monitor {
            monitor.task_started(B::NAME);
        }
        let executed = if config.multithreaded {
            self.pool.execute(&task)?
        } else {
            self.pool.execute_serially(&task)?
        };
        if !executed {
            return Err(TaskError::PoolBusy {
                task: B::NAME.to_string(),
            }
            .into());
        }
        if let Some(monitor) = &self.ctx.monitor {
            monitor.task_finished(B::NAME);
        }
        Ok(task)
    }

    fn level_started(&self, level: Option<usize>) {
        if let Some(monitor) = &self.ctx.monitor {
            monitor.component_level_started(level);
        }
    }

    fn level_finished(&self, level: Option<usize>) {
        if let Some(monitor) = &self.ctx.monitor {
            monitor.component_level_finished(level);
        }
    }

    fn visible_rows(&self) -> HashSet<TupleIndex> {
        let table = &self.ctx.table;
        table
            .matching(&Pattern::default())
            .into_iter()
            .filter(|&index| table.status(index) & TUPLE_STATUS_IDB_MERGED != 0)
            .collect()
    }

    fn reject_aggregation(&self, rules: &RuleSet) -> ReasonerResult<()> {
        if rules.has_rules_with_aggregation(None) {
            return Err(ConfigError::IncrementalWithAggregation.into());
        }
        Ok(())
    }
}

/// One line per unstratified component: its atoms and rules.
pub fn describe_components(dictionary: &Dictionary, components: &[UnstratifiedComponent]) -> String {
    components
        .iter()
        .map(|component| {
            let keys: Vec<String> = component
                .keys
                .iter()
                .map(|key| match *key {
                    AtomKey::Predicate(p) => dictionary.display(p),
                    AtomKey::Class(c) => format!("rdf:type {}", dictionary.display(c)),
                    AtomKey::Any => "?".to_string(),
                })
                .collect();
            format!(
                "  {{{}}} via rules: {}",
                keys.join(", "),
                component.rules.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
