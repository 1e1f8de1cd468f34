//! Engine facade: top-level API for incremat.
//!
//! The `Engine` owns the dictionary, tuple table, rule index, equality
//! manager and worker pool, and provides the public interface for changing
//! facts and rules, running maintenance rounds and querying the
//! materialization.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::equality::EqualityManager;
use crate::error::{PersistError, ReasonerResult};
use crate::reasoning::incremental::describe_components;
use crate::reasoning::{
    DeletionStrategy, EqualityMode, IncrementalReasoner, IncrementalReasoningState, LevelMarker,
    ReasoningContext, ReasoningMonitor, RoundSummary, TracingMonitor, WorkerPool,
};
use crate::resource::{Dictionary, ResourceId};
use crate::rules::{Rule, RuleId, RuleIndex, RuleSpec};
use crate::table::{
    MemoryTripleTable, TUPLE_STATUS_EDB, TUPLE_STATUS_IDB_MERGED, Triple, TupleTable,
};

/// Component levels of one rule's head atoms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLevels {
    pub id: RuleId,
    pub name: String,
    pub levels: Vec<usize>,
}

/// The incremat materialization engine.
pub struct Engine {
    config: EngineConfig,
    dictionary: Arc<Dictionary>,
    table: Arc<MemoryTripleTable>,
    rules: Arc<RuleIndex>,
    equality: Arc<EqualityManager>,
    reasoner: IncrementalReasoner,
}

impl Engine {
    /// Create a new engine with the given configuration.
    pub fn new(config: EngineConfig) -> ReasonerResult<Self> {
        let monitor = config
            .trace_reasoning
            .then(|| Arc::new(TracingMonitor) as Arc<dyn ReasoningMonitor>);
        Self::build(config, monitor)
    }

    /// Create an engine reporting every round to `monitor`.
    pub fn with_monitor(
        config: EngineConfig,
        monitor: Arc<dyn ReasoningMonitor>,
    ) -> ReasonerResult<Self> {
        Self::build(config, Some(monitor))
    }

    fn build(
        config: EngineConfig,
        monitor: Option<Arc<dyn ReasoningMonitor>>,
    ) -> ReasonerResult<Self> {
        config.validate()?;
        tracing::info!(
            threads = config.worker_threads,
            equality = ?config.equality,
            strategy = %config.deletion_strategy,
            "initializing incremat engine"
        );

        let dictionary = Arc::new(Dictionary::new());
        let table = Arc::new(MemoryTripleTable::new());
        let rules = Arc::new(RuleIndex::new());
        let equality = Arc::new(EqualityManager::new());
        let ctx = Arc::new(ReasoningContext {
            table: Arc::clone(&table) as Arc<dyn TupleTable>,
            state: Arc::new(IncrementalReasoningState::new()),
            rules: Arc::clone(&rules),
            equality: Arc::clone(&equality),
            dictionary: Arc::clone(&dictionary),
            monitor,
        });
        let pool = WorkerPool::new(config.worker_threads)?;
        let reasoner =
            IncrementalReasoner::new(ctx, pool, config.equality, config.queue_capacity);

        Ok(Self {
            config,
            dictionary,
            table,
            rules,
            equality,
            reasoner,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn table(&self) -> &MemoryTripleTable {
        &self.table
    }

    pub fn rule_index(&self) -> &RuleIndex {
        &self.rules
    }

    pub fn equality(&self) -> &EqualityManager {
        &self.equality
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        self.reasoner.pool()
    }

    // -- facts ----------------------------------------------------------------

    /// Intern `label` and return its id.
    pub fn resource(&self, label: &str) -> ResourceId {
        self.dictionary.intern(label)
    }

    /// Intern the three labels of a triple.
    pub fn triple(&self, subject: &str, predicate: &str, object: &str) -> Triple {
        Triple::new(
            self.resource(subject),
            self.resource(predicate),
            self.resource(object),
        )
    }

    fn known_triple(&self, subject: &str, predicate: &str, object: &str) -> Option<Triple> {
        Some(Triple::new(
            self.dictionary.lookup(subject)?,
            self.dictionary.lookup(predicate)?,
            self.dictionary.lookup(object)?,
        ))
    }

    /// Schedule an explicit fact for insertion in the next round. Returns
    /// false if the fact was already explicit.
    pub fn add_fact(&self, subject: &str, predicate: &str, object: &str) -> ReasonerResult<bool> {
        self.add_triple(&self.triple(subject, predicate, object))
    }

    /// Schedule an explicit fact for deletion in the next round. Returns
    /// false if the fact was not explicit.
    pub fn delete_fact(&self, subject: &str, predicate: &str, object: &str) -> bool {
        self.known_triple(subject, predicate, object)
            .is_some_and(|t| self.delete_triple(&t))
    }

    pub fn add_triple(&self, triple: &Triple) -> ReasonerResult<bool> {
        Ok(self.table.schedule_addition(triple)?)
    }

    pub fn delete_triple(&self, triple: &Triple) -> bool {
        self.table.schedule_deletion(triple)
    }

    // -- rules ----------------------------------------------------------------

    /// Stage a rule for insertion in the next round.
    pub fn add_rule(&self, spec: &RuleSpec) -> ReasonerResult<RuleId> {
        let rule = Rule::from_spec(spec, &self.dictionary)?;
        let id = self.rules.add_rule(rule);
        tracing::debug!(rule = %spec.name, id, "rule staged for insertion");
        Ok(id)
    }

    /// Stage a rule for removal in the next round.
    pub fn remove_rule(&self, id: RuleId) -> ReasonerResult<()> {
        self.rules.remove_rule(id)?;
        tracing::debug!(id, "rule staged for removal");
        Ok(())
    }

    /// Staged and active rules with their specs.
    pub fn rules(&self) -> Vec<(RuleId, RuleSpec)> {
        self.rules
            .rules()
            .into_iter()
            .map(|(id, rule)| (id, rule.to_spec(&self.dictionary)))
            .collect()
    }

    /// Head levels of every rule as they will be after the next round.
    /// Fails with the offending components if the rules are not stratified.
    pub fn rule_levels(&self) -> ReasonerResult<Vec<RuleLevels>> {
        let preview = self.rules.preview();
        if !preview.is_stratified() {
            return Err(crate::error::ConfigError::NotStratified {
                components: describe_components(
                    &self.dictionary,
                    preview.unstratified_components(),
                ),
            }
            .into());
        }
        Ok(preview
            .rules()
            .iter()
            .map(|info| RuleLevels {
                id: info.id,
                name: info.name().to_string(),
                levels: info.heads.iter().map(|h| h.component_level).collect(),
            })
            .collect())
    }

    pub fn save_rules(&self, path: &Path) -> ReasonerResult<()> {
        let file = std::fs::File::create(path).map_err(PersistError::from)?;
        let mut writer = std::io::BufWriter::new(file);
        self.rules.save(&mut writer, &self.dictionary)?;
        Ok(())
    }

    /// Stage the rules saved at `path` for insertion.
    pub fn load_rules(&self, path: &Path) -> ReasonerResult<Vec<RuleId>> {
        let file = std::fs::File::open(path).map_err(PersistError::from)?;
        let mut reader = std::io::BufReader::new(file);
        Ok(self.rules.load(&mut reader, &self.dictionary)?)
    }

    // -- rounds ---------------------------------------------------------------

    /// Apply every staged change with the configured deletion strategy.
    /// Stratification levels are used unless equality reasoning is on.
    pub fn apply_rules_incrementally(&self) -> ReasonerResult<RoundSummary> {
        let strategy = self.config.deletion_strategy;
        match self.config.equality {
            EqualityMode::Off => self.reasoner.apply_by_levels(strategy),
            EqualityMode::NoUna => self.reasoner.apply_no_levels(strategy),
        }
    }

    pub fn apply_rules_incrementally_by_levels(
        &self,
        strategy: DeletionStrategy,
    ) -> ReasonerResult<RoundSummary> {
        self.reasoner.apply_by_levels(strategy)
    }

    pub fn apply_rules_incrementally_no_levels(
        &self,
        strategy: DeletionStrategy,
    ) -> ReasonerResult<RoundSummary> {
        self.reasoner.apply_no_levels(strategy)
    }

    /// Rebuild the materialization from the explicit facts.
    pub fn materialize_single_stratum(&self) -> ReasonerResult<RoundSummary> {
        self.reasoner.materialize_single_stratum()
    }

    /// Stop the running round; it returns an abort error.
    pub fn abort(&self) {
        tracing::warn!("abort requested");
        self.reasoner.abort();
    }

    // -- queries --------------------------------------------------------------

    /// Whether the fact holds in the materialization.
    pub fn contains(&self, subject: &str, predicate: &str, object: &str) -> bool {
        self.known_triple(subject, predicate, object)
            .is_some_and(|t| self.contains_triple(&t))
    }

    pub fn contains_triple(&self, triple: &Triple) -> bool {
        let (canonical, _) = self.equality.normalize(triple);
        self.table
            .tuple_index(&canonical)
            .is_some_and(|index| self.table.status(index) & TUPLE_STATUS_IDB_MERGED != 0)
    }

    /// Every fact of the materialization, expanded over equivalence classes.
    pub fn derived_facts(&self) -> BTreeSet<Triple> {
        self.table
            .rows_with_status(TUPLE_STATUS_IDB_MERGED)
            .into_iter()
            .flat_map(|(_, triple)| self.equality.expand(&triple))
            .collect()
    }

    /// The explicit facts.
    pub fn explicit_facts(&self) -> BTreeSet<Triple> {
        self.table
            .rows_with_status(TUPLE_STATUS_EDB)
            .into_iter()
            .map(|(_, triple)| triple)
            .collect()
    }

    /// Facts of the materialization as labels, sorted.
    pub fn derived_labels(&self) -> Vec<[String; 3]> {
        let mut facts: Vec<[String; 3]> = self
            .derived_facts()
            .iter()
            .map(|t| t.as_array().map(|r| self.dictionary.display(r)))
            .collect();
        facts.sort();
        facts
    }

    /// Level markers of the last round's last pass.
    pub fn last_level_markers(&self) -> Vec<LevelMarker> {
        self.reasoner.context().state.level_markers()
    }

    /// Whether two resources are in the same equivalence class.
    pub fn are_equal(&self, a: &str, b: &str) -> bool {
        match (self.dictionary.lookup(a), self.dictionary.lookup(b)) {
            (Some(a), Some(b)) => {
                a == b || self.equality.representative(a) == self.equality.representative(b)
            }
            _ => false,
        }
    }

    /// Non-trivial equivalence classes as labels.
    pub fn equivalence_classes(&self) -> Vec<Vec<String>> {
        self.equality
            .classes()
            .into_iter()
            .map(|(_, members)| {
                members
                    .into_iter()
                    .map(|m| self.dictionary.display(m))
                    .collect()
            })
            .collect()
    }

    pub fn format_triple(&self, triple: &Triple) -> String {
        format!(
            "{} {} {}",
            self.dictionary.display(triple.subject),
            self.dictionary.display(triple.predicate),
            self.dictionary.display(triple.object)
        )
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("resources", &self.dictionary.len())
            .field("tuples", &self.table.len())
            .finish()
    }
}
