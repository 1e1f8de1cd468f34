//! Equivalence-class maintenance after `owl:sameAs` tuples are deleted.
//!
//! Under DRed a class whose defining tuple is deleted first loses its
//! representative ([`EqualityUpdateMode::Unrepresent`]), which deletes every
//! tuple naming it, and is split into singletons once rederivation is done
//! ([`EqualityUpdateMode::BreakEquals`]). Under FBF the classes were already
//! rebuilt in a proving snapshot and are copied back
//! ([`EqualityUpdateMode::CopyClasses`]). Either way the members are reseeded
//! from their explicit tuples and insertion merges them again where the
//! remaining tuples say so.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::equality::EqualityManager;
use crate::error::ReasonerResult;
use crate::reasoning::context::{ReasoningContext, is_same_as};
use crate::reasoning::state::{became_false, edb_after, present_before};
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::resource::{INVALID_RESOURCE_ID, ResourceId};
use crate::rules::RuleSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualityUpdateMode {
    Unrepresent,
    BreakEquals,
    CopyClasses,
}

impl EqualityUpdateMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unrepresent => "unrepresent",
            Self::BreakEquals => "break equals",
            Self::CopyClasses => "copy classes",
        }
    }
}

pub struct UpdateEqualityManager {
    ctx: Arc<ReasoningContext>,
    rules: Arc<RuleSet>,
    mode: EqualityUpdateMode,
    /// Classes to copy from under [`EqualityUpdateMode::CopyClasses`].
    proving: Option<Arc<EqualityManager>>,
    changed: AtomicBool,
}

impl UpdateEqualityManager {
    pub fn new(
        ctx: Arc<ReasoningContext>,
        rules: Arc<RuleSet>,
        mode: EqualityUpdateMode,
        proving: Option<Arc<EqualityManager>>,
    ) -> Self {
        Self {
            ctx,
            rules,
            mode,
            proving,
            changed: AtomicBool::new(false),
        }
    }

    /// Whether the run changed any equivalence class.
    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Subject and object of every deleted `owl:sameAs` tuple in the delete
    /// list from `start`; returns the position scanned up to.
    fn deleted_same_as(&self, start: usize) -> (Vec<(ResourceId, ResourceId)>, usize) {
        let list = &self.ctx.state.delete_list;
        let end = list.end_position();
        let pairs = list
            .snapshot(start, end)
            .into_iter()
            .filter_map(|index| self.ctx.load(index))
            .filter(|(triple, status, flags)| {
                is_same_as(triple) && present_before(*status) && became_false(*flags)
            })
            .map(|(triple, _, _)| (triple.subject, triple.object))
            .collect();
        (pairs, end)
    }

    fn unrepresent(&self) {
        let ctx = &self.ctx;
        let start = ctx.state.equality_cursor.load(Ordering::Acquire);
        let (pairs, end) = self.deleted_same_as(start);
        ctx.state.equality_cursor.store(end, Ordering::Release);
        for (subject, object) in pairs {
            for resource in [subject, object] {
                let representative = ctx.equality.representative(resource);
                if ctx.equality.class_size(representative) <= 1
                    || !ctx.equality.unrepresent(representative)
                {
                    continue;
                }
                self.changed.store(true, Ordering::Release);
                for row in ctx.rows_mentioning(representative) {
                    ctx.mark_deleted(row);
                }
            }
        }
    }

    fn break_equals<const MON: bool>(&self, worker: usize) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let (pairs, _) = self.deleted_same_as(0);
        for (subject, object) in pairs {
            for resource in [subject, object] {
                if ctx.equality.is_represented(resource) {
                    continue;
                }
                let members = ctx.equality.break_equals(resource);
                if members.is_empty() {
                    continue;
                }
                self.changed.store(true, Ordering::Release);
                self.reseed::<MON>(worker, &members)?;
            }
        }
        Ok(())
    }

    fn copy_classes<const MON: bool>(&self, worker: usize) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let Some(proving) = self.proving.as_deref() else {
            return Ok(());
        };
        let (pairs, _) = self.deleted_same_as(0);
        let mut visited = BTreeSet::new();
        for (subject, object) in pairs {
            for resource in [subject, object] {
                let representative = ctx.equality.representative(resource);
                if !visited.insert(representative) {
                    continue;
                }
                let members = walk_class(&ctx.equality, representative);
                if members.len() <= 1 || proving.class_members(representative) == members {
                    continue;
                }
                for &member in &members {
                    if let Some(monitor) = ctx.monitor::<MON>() {
                        monitor.equivalence_class_copied(member, proving.class_size(member));
                    }
                    ctx.equality.copy_equivalence_class(member, proving);
                }
                self.changed.store(true, Ordering::Release);
                self.reseed::<MON>(worker, &members)?;
            }
        }
        Ok(())
    }

    /// Derive again the explicit tuples naming `members` and schedule the
    /// rules mentioning them.
    fn reseed<const MON: bool>(&self, worker: usize, members: &[ResourceId]) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        for &member in members {
            for row in ctx.rows_mentioning(member) {
                let Some((triple, status, _)) = ctx.load(row) else {
                    continue;
                };
                if edb_after(status) {
                    ctx.derive::<MON, true>(worker, triple)?;
                }
            }
        }
        for info in self.rules.rules() {
            if members.iter().any(|m| info.constants.contains(m)) {
                ctx.state.schedule_reevaluation(info.id);
            }
        }
        Ok(())
    }
}

/// Members of `representative`'s class, following the member chain.
fn walk_class(equality: &EqualityManager, representative: ResourceId) -> Vec<ResourceId> {
    let mut members = vec![representative];
    let mut next = equality.next_equal(representative);
    while next != INVALID_RESOURCE_ID && next != representative {
        members.push(next);
        next = equality.next_equal(next);
    }
    members.sort_unstable();
    members
}

impl PhaseBody for UpdateEqualityManager {
    const NAME: &'static str = "update equality manager";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        if let Some(monitor) = self.ctx.monitor::<MON>() {
            monitor.update_equality_manager_started(self.mode.name());
        }
        match self.mode {
            EqualityUpdateMode::Unrepresent => self.unrepresent(),
            EqualityUpdateMode::BreakEquals => self.break_equals::<MON>(worker.index)?,
            EqualityUpdateMode::CopyClasses => self.copy_classes::<MON>(worker.index)?,
        }
        if let Some(monitor) = self.ctx.monitor::<MON>() {
            monitor.update_equality_manager_finished(self.mode.name());
        }
        Ok(())
    }
}
