//! Shared context of the phase tasks of one engine.

use std::sync::Arc;

use crate::equality::EqualityManager;
use crate::error::ReasonerResult;
use crate::resource::{Dictionary, OWL_SAME_AS, ResourceId};
use crate::rules::{BodyLiteral, Matcher, RuleIndex};
use crate::table::{Pattern, Triple, TupleIndex, TupleStatus, TupleTable};

use super::monitor::ReasoningMonitor;
use super::state::{
    GF_ADDED, GF_ADDED_NEW, GF_DELETED, GF_DELETED_NEW, IncrementalReasoningState, edb_after,
    present_after, present_before,
};

/// Everything a phase needs besides its own cursors.
pub struct ReasoningContext {
    pub table: Arc<dyn TupleTable>,
    pub state: Arc<IncrementalReasoningState>,
    pub rules: Arc<RuleIndex>,
    pub equality: Arc<EqualityManager>,
    pub dictionary: Arc<Dictionary>,
    pub monitor: Option<Arc<dyn ReasoningMonitor>>,
}

impl ReasoningContext {
    /// The monitor, only in monitored specializations.
    pub fn monitor<const MON: bool>(&self) -> Option<&dyn ReasoningMonitor> {
        if MON { self.monitor.as_deref() } else { None }
    }

    pub fn matcher<const EQ: bool>(&self) -> Matcher<'_> {
        Matcher::new(self.table.as_ref(), EQ.then_some(self.equality.as_ref()))
    }

    pub fn flags(&self, index: TupleIndex) -> u8 {
        self.state.global_flags.get(index)
    }

    /// Triple and status of `index` plus its round flags.
    pub fn load(&self, index: TupleIndex) -> Option<(Triple, TupleStatus, u8)> {
        self.table
            .status_and_tuple(index)
            .map(|(triple, status)| (triple, status, self.flags(index)))
    }

    /// Rule visibility over the state before the round.
    pub fn old_state(_: &BodyLiteral, _: TupleIndex, status: TupleStatus) -> bool {
        present_before(status)
    }

    /// Rule visibility over the state the round is computing.
    pub fn new_state(&self) -> impl Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool + '_ {
        move |_, index, status| present_after(status, self.flags(index))
    }

    /// Add `triple` to the round unless it is already visible. Returns true
    /// if this call put it on the add list.
    pub fn derive<const MON: bool, const EQ: bool>(
        &self,
        worker: usize,
        triple: Triple,
    ) -> ReasonerResult<bool> {
        let triple = if EQ {
            self.equality.normalize(&triple).0
        } else {
            triple
        };
        if let Some(index) = self.table.tuple_index(&triple) {
            if present_after(self.table.status(index), self.flags(index)) {
                return Ok(false);
            }
        }
        let (_, index) = self.table.add_tuple(&triple, 0, 0)?;
        if !self.state.global_flags.set(index, GF_ADDED) {
            return Ok(false);
        }
        if !present_before(self.table.status(index)) {
            self.state.global_flags.set(index, GF_ADDED_NEW);
        }
        self.state.add_list.enqueue(index);
        if let Some(monitor) = self.monitor::<MON>() {
            monitor.tuple_derived(worker, &triple);
        }
        Ok(true)
    }

    /// Re-add a tuple that was deleted earlier in the round.
    pub fn readd<const MON: bool>(&self, worker: usize, index: TupleIndex, triple: &Triple) -> bool {
        if !self.state.global_flags.set(index, GF_ADDED) {
            return false;
        }
        self.state.add_list.enqueue(index);
        if let Some(monitor) = self.monitor::<MON>() {
            monitor.tuple_derived(worker, triple);
        }
        true
    }

    /// Seed `index` as a deletion candidate. Under DRed the candidate is
    /// deleted right away; under FBF it awaits confirmation.
    pub fn seed_deletion(&self, index: TupleIndex, dred: bool) -> bool {
        if !present_before(self.table.status(index)) {
            return false;
        }
        let flags = &self.state.global_flags;
        let fresh = if dred {
            flags.set(index, GF_DELETED_NEW);
            flags.set(index, GF_DELETED)
        } else {
            flags.get(index) & GF_DELETED == 0 && flags.set(index, GF_DELETED_NEW)
        };
        if fresh {
            self.state.delete_list.enqueue(index);
        }
        fresh
    }

    /// Delete `index` outright. Candidates already on the delete list are
    /// not enqueued twice.
    pub fn mark_deleted(&self, index: TupleIndex) -> bool {
        if !present_before(self.table.status(index)) {
            return false;
        }
        let before = self.flags(index);
        if !self.state.global_flags.set(index, GF_DELETED) {
            return false;
        }
        if before & GF_DELETED_NEW == 0 {
            self.state.delete_list.enqueue(index);
        }
        true
    }

    /// Explicit support once scheduled changes apply. With equality, any
    /// explicit variant of the row's class product counts.
    pub fn explicitly_supported<const EQ: bool>(&self, index: TupleIndex, triple: &Triple) -> bool {
        if edb_after(self.table.status(index)) {
            return true;
        }
        EQ && self
            .equality
            .expand(triple)
            .iter()
            .filter_map(|variant| self.table.tuple_index(variant))
            .any(|variant| edb_after(self.table.status(variant)))
    }

    /// Stored rows mentioning `resource`, each listed once.
    pub fn rows_mentioning(&self, resource: ResourceId) -> Vec<TupleIndex> {
        let mut rows: Vec<TupleIndex> = (0..3)
            .flat_map(|position| self.table.matching(&Pattern::at(position, resource)))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    /// False when the row names a class member other than its representative.
    pub fn is_canonical(&self, triple: &Triple) -> bool {
        !self.equality.normalize(triple).1
    }

    pub fn mentions_unrepresented(&self, triple: &Triple) -> bool {
        triple
            .as_array()
            .iter()
            .any(|&r| !self.equality.is_represented(r))
    }
}

/// True for an `owl:sameAs` row.
pub fn is_same_as(triple: &Triple) -> bool {
    triple.predicate == OWL_SAME_AS
}
