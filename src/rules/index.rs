//! Rule index: active rules, staged changes and compiled snapshots.
//!
//! Rule changes are staged. `add_rule`/`remove_rule` only record intent; a
//! reasoning round first evaluates the rules being removed over the old
//! state, then calls [`RuleIndex::propagate_deletions`], and folds staged
//! additions in with [`RuleIndex::propagate_insertions`] before its second
//! pass. Readers work on an immutable [`RuleSet`] snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, RuleError};
use crate::reasoning::queue::WorkQueue;
use crate::resource::Dictionary;
use crate::table::Triple;

use super::stratify::{Stratification, UnstratifiedComponent};
use super::{BodyLiteral, HeadAtomInfo, Literal, Rule, RuleId, RuleInfo, RuleSpec};

/// Format version written by [`RuleIndex::save`].
const RULES_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RuleSet
// ---------------------------------------------------------------------------

/// Immutable, stratified view of a set of rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<RuleInfo>>,
    by_id: HashMap<RuleId, Arc<RuleInfo>>,
    stratification: Stratification,
    negation_levels: BTreeSet<usize>,
    aggregation_levels: BTreeSet<usize>,
    head_levels: BTreeSet<usize>,
}

impl RuleSet {
    /// Stratify and compile `rules`.
    pub fn compile(rules: &BTreeMap<RuleId, Arc<Rule>>) -> Self {
        let stratification =
            Stratification::compute(rules.iter().map(|(id, rule)| (*id, rule.as_ref())));
        let mut set = RuleSet {
            stratification,
            ..Default::default()
        };
        for (id, rule) in rules {
            let tag = |atom, negated| BodyLiteral {
                atom,
                level: set.stratification.atom_level(&atom),
                negated,
            };
            let mut info = RuleInfo {
                id: *id,
                rule: Arc::clone(rule),
                positive: Vec::new(),
                negative: Vec::new(),
                aggregates: Vec::new(),
                heads: rule
                    .head
                    .iter()
                    .map(|atom| HeadAtomInfo {
                        atom: *atom,
                        component_level: set.stratification.atom_level(atom),
                    })
                    .collect(),
                constants: rule.constants(),
            };
            for literal in &rule.body {
                match literal {
                    Literal::Positive(a) => info.positive.push(tag(*a, false)),
                    Literal::Negative(a) => info.negative.push(tag(*a, true)),
                    Literal::Aggregate(a) => info.aggregates.push(tag(*a, false)),
                }
            }
            for head in &info.heads {
                set.head_levels.insert(head.component_level);
                if !info.negative.is_empty() {
                    set.negation_levels.insert(head.component_level);
                }
                if !info.aggregates.is_empty() {
                    set.aggregation_levels.insert(head.component_level);
                }
            }
            let info = Arc::new(info);
            set.by_id.insert(*id, Arc::clone(&info));
            set.rules.push(info);
        }
        set
    }

    pub fn rules(&self) -> &[Arc<RuleInfo>] {
        &self.rules
    }

    pub fn rule(&self, id: RuleId) -> Option<&Arc<RuleInfo>> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules with a head at `level`; every rule when `level` is `None`.
    pub fn rules_for_level(&self, level: Option<usize>) -> impl Iterator<Item = &Arc<RuleInfo>> {
        self.rules.iter().filter(move |r| r.has_head_at(level))
    }

    pub fn tuple_level(&self, triple: &Triple) -> usize {
        self.stratification.tuple_level(triple)
    }

    pub fn max_component_level(&self) -> usize {
        self.stratification.max_level()
    }

    /// Lowest level holding a rule head.
    pub fn first_rule_component_level(&self) -> Option<usize> {
        self.head_levels.first().copied()
    }

    pub fn has_rules_at(&self, level: usize) -> bool {
        self.head_levels.contains(&level)
    }

    pub fn has_rules_with_negation(&self, level: Option<usize>) -> bool {
        match level {
            Some(l) => self.negation_levels.contains(&l),
            None => !self.negation_levels.is_empty(),
        }
    }

    pub fn has_rules_with_aggregation(&self, level: Option<usize>) -> bool {
        match level {
            Some(l) => self.aggregation_levels.contains(&l),
            None => !self.aggregation_levels.is_empty(),
        }
    }

    pub fn is_stratified(&self) -> bool {
        self.stratification.is_stratified()
    }

    pub fn unstratified_components(&self) -> &[UnstratifiedComponent] {
        self.stratification.unstratified_components()
    }
}

// ---------------------------------------------------------------------------
// RuleIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct IndexInner {
    rules: BTreeMap<RuleId, Arc<Rule>>,
    pending_add: BTreeMap<RuleId, Arc<Rule>>,
    pending_delete: BTreeSet<RuleId>,
    last_inserted: Vec<RuleId>,
    active: Arc<RuleSet>,
    next_id: RuleId,
}

impl IndexInner {
    fn rebuild(&mut self) {
        self.active = Arc::new(RuleSet::compile(&self.rules));
    }

    fn future_rules(&self) -> BTreeMap<RuleId, Arc<Rule>> {
        let mut rules: BTreeMap<RuleId, Arc<Rule>> = self
            .rules
            .iter()
            .filter(|(id, _)| !self.pending_delete.contains(id))
            .map(|(id, r)| (*id, Arc::clone(r)))
            .collect();
        rules.extend(self.pending_add.iter().map(|(id, r)| (*id, Arc::clone(r))));
        rules
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedRules {
    version: u32,
    rules: Vec<RuleSpec>,
}

/// Thread-safe rule store with staged changes.
#[derive(Debug, Default)]
pub struct RuleIndex {
    inner: RwLock<IndexInner>,
    /// Rule firings per worker thread.
    firings: RwLock<Vec<AtomicU64>>,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexInner> {
        self.inner.read().expect("rule index lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().expect("rule index lock poisoned")
    }

    /// Stage `rule` for insertion.
    pub fn add_rule(&self, rule: Rule) -> RuleId {
        let mut inner = self.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending_add.insert(id, Arc::new(rule));
        id
    }

    /// Stage the removal of `id`. A rule that was staged for insertion and
    /// never applied is simply dropped.
    pub fn remove_rule(&self, id: RuleId) -> Result<(), RuleError> {
        let mut inner = self.write();
        if inner.pending_add.remove(&id).is_some() {
            return Ok(());
        }
        if inner.rules.contains_key(&id) && inner.pending_delete.insert(id) {
            return Ok(());
        }
        Err(RuleError::UnknownRule { rule_id: id })
    }

    pub fn has_just_added_rules(&self) -> bool {
        !self.read().pending_add.is_empty()
    }

    pub fn has_just_deleted_rules(&self) -> bool {
        !self.read().pending_delete.is_empty()
    }

    /// Push the rules staged for removal onto `queue`; returns how many.
    pub fn enqueue_deleted_rules(&self, queue: &WorkQueue<RuleId>) -> usize {
        let inner = self.read();
        for id in &inner.pending_delete {
            queue.enqueue(*id);
        }
        inner.pending_delete.len()
    }

    /// Push the rules folded in by the last [`propagate_insertions`](Self::propagate_insertions).
    pub fn enqueue_inserted_rules(&self, queue: &WorkQueue<RuleId>) -> usize {
        let inner = self.read();
        for id in &inner.last_inserted {
            queue.enqueue(*id);
        }
        inner.last_inserted.len()
    }

    /// Physically remove the rules staged for removal.
    pub fn propagate_deletions(&self) -> bool {
        let mut inner = self.write();
        if inner.pending_delete.is_empty() {
            return false;
        }
        let pending = std::mem::take(&mut inner.pending_delete);
        inner.rules.retain(|id, _| !pending.contains(id));
        inner.rebuild();
        tracing::debug!(removed = pending.len(), "propagated rule deletions");
        true
    }

    /// Make the rules staged for insertion active.
    pub fn propagate_insertions(&self) -> bool {
        let mut inner = self.write();
        let pending = std::mem::take(&mut inner.pending_add);
        inner.last_inserted = pending.keys().copied().collect();
        if pending.is_empty() {
            return false;
        }
        inner.rules.extend(pending);
        inner.rebuild();
        tracing::debug!(added = inner.last_inserted.len(), "propagated rule insertions");
        true
    }

    /// The active rules.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.read().active)
    }

    /// The rule set as it will be once every staged change is applied.
    pub fn preview(&self) -> RuleSet {
        RuleSet::compile(&self.read().future_rules())
    }

    /// Active and staged rules by id, for listing.
    pub fn rules(&self) -> Vec<(RuleId, Arc<Rule>)> {
        self.read().future_rules().into_iter().collect()
    }

    // -- per-thread matching state ------------------------------------------

    /// Size the per-thread state for `threads` workers.
    pub fn set_thread_capacity(&self, threads: usize) {
        let mut firings = self.firings.write().expect("rule index lock poisoned");
        firings.resize_with(threads, || AtomicU64::new(0));
    }

    /// Make sure worker `index` has per-thread state; grows the table if needed.
    pub fn ensure_thread_ready(&self, index: usize) {
        if index < self.firings.read().expect("rule index lock poisoned").len() {
            return;
        }
        self.set_thread_capacity(index + 1);
    }

    pub fn record_firing(&self, worker: usize, count: u64) {
        if let Some(counter) = self
            .firings
            .read()
            .expect("rule index lock poisoned")
            .get(worker)
        {
            counter.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Rule instances fired by each worker since the engine started.
    pub fn firing_counts(&self) -> Vec<u64> {
        self.firings
            .read()
            .expect("rule index lock poisoned")
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    // -- persistence ----------------------------------------------------------

    /// Write the rules, as they will be once staged changes apply, to `writer`.
    pub fn save(&self, writer: &mut impl Write, dictionary: &Dictionary) -> Result<(), PersistError> {
        let saved = SavedRules {
            version: RULES_FORMAT_VERSION,
            rules: self
                .read()
                .future_rules()
                .values()
                .map(|r| r.to_spec(dictionary))
                .collect(),
        };
        let bytes = bincode::serialize(&saved)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Read rules written by [`save`](Self::save) and stage them for insertion.
    pub fn load(
        &self,
        reader: &mut impl Read,
        dictionary: &Dictionary,
    ) -> Result<Vec<RuleId>, PersistError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let saved: SavedRules = bincode::deserialize(&bytes)?;
        if saved.version != RULES_FORMAT_VERSION {
            return Err(PersistError::Serialization {
                message: format!("unsupported rule format version {}", saved.version),
            });
        }
        let mut rules = Vec::with_capacity(saved.rules.len());
        for spec in &saved.rules {
            let rule = Rule::from_spec(spec, dictionary).map_err(|e| PersistError::Serialization {
                message: e.to_string(),
            })?;
            rules.push(rule);
        }
        Ok(rules.into_iter().map(|r| self.add_rule(r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(dict: &Dictionary, name: &str, head: &str, body: &str) -> Rule {
        Rule::from_spec(
            &RuleSpec::new(name, &[["?X", "rdf:type", head]], &[["?X", "rdf:type", body]], &[]),
            dict,
        )
        .unwrap()
    }

    #[test]
    fn staged_changes_apply_on_propagation() {
        let dict = Dictionary::new();
        let index = RuleIndex::new();
        let b = index.add_rule(rule(&dict, "b", "B", "A"));
        assert!(index.has_just_added_rules());
        assert!(index.snapshot().is_empty());
        assert_eq!(index.preview().len(), 1);

        assert!(index.propagate_insertions());
        let queue = WorkQueue::new("inserted");
        assert_eq!(index.enqueue_inserted_rules(&queue), 1);
        assert_eq!(queue.get(0), Some(b));
        assert!(index.snapshot().rule(b).is_some());

        index.remove_rule(b).unwrap();
        assert!(index.has_just_deleted_rules());
        assert!(index.snapshot().rule(b).is_some());
        assert!(index.propagate_deletions());
        assert!(index.snapshot().rule(b).is_none());
        assert!(matches!(
            index.remove_rule(b),
            Err(RuleError::UnknownRule { rule_id }) if rule_id == b
        ));
    }

    #[test]
    fn removing_a_staged_rule_cancels_it() {
        let dict = Dictionary::new();
        let index = RuleIndex::new();
        let id = index.add_rule(rule(&dict, "b", "B", "A"));
        index.remove_rule(id).unwrap();
        assert!(!index.has_just_added_rules());
        assert!(!index.has_just_deleted_rules());
    }

    #[test]
    fn levels_and_negation_are_tracked() {
        let dict = Dictionary::new();
        let index = RuleIndex::new();
        index.add_rule(rule(&dict, "b", "B", "A"));
        index.add_rule(
            Rule::from_spec(
                &RuleSpec::new(
                    "c",
                    &[["?X", "rdf:type", "C"]],
                    &[["?X", "rdf:type", "B"]],
                    &[["?X", "rdf:type", "D"]],
                ),
                &dict,
            )
            .unwrap(),
        );
        index.propagate_insertions();
        let set = index.snapshot();
        assert_eq!(set.first_rule_component_level(), Some(1));
        assert_eq!(set.max_component_level(), 2);
        assert!(set.has_rules_with_negation(Some(2)));
        assert!(!set.has_rules_with_negation(Some(1)));
        assert!(!set.has_rules_with_aggregation(None));
        assert_eq!(set.rules_for_level(Some(1)).count(), 1);
        assert_eq!(set.rules_for_level(None).count(), 2);
    }

    #[test]
    fn thread_state_grows_on_demand() {
        let index = RuleIndex::new();
        index.set_thread_capacity(2);
        index.ensure_thread_ready(4);
        index.record_firing(4, 3);
        index.record_firing(9, 1);
        assert_eq!(index.firing_counts(), vec![0, 0, 0, 0, 3]);
    }

    #[test]
    fn save_and_load_through_labels() {
        let dict = Dictionary::new();
        let index = RuleIndex::new();
        index.add_rule(rule(&dict, "b", "B", "A"));
        index.propagate_insertions();
        let mut bytes = Vec::new();
        index.save(&mut bytes, &dict).unwrap();

        let other_dict = Dictionary::new();
        other_dict.intern("unrelated");
        let restored = RuleIndex::new();
        let ids = restored.load(&mut bytes.as_slice(), &other_dict).unwrap();
        assert_eq!(ids.len(), 1);
        restored.propagate_insertions();
        let info = Arc::clone(restored.snapshot().rule(ids[0]).unwrap());
        assert_eq!(info.rule.to_spec(&other_dict).head[0][2], "B");
        assert!(matches!(
            restored.load(&mut [1u8, 2, 3].as_slice(), &other_dict),
            Err(PersistError::Serialization { .. })
        ));
    }
}
