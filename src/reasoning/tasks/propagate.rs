//! Commit of a round's results into the table's status bits.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::error::ReasonerResult;
use crate::reasoning::context::ReasoningContext;
use crate::reasoning::state::{
    CommitRange, GF_ADDED, GF_ADDED_MERGED, LF_PROVED, LF_PROVED_MERGED, became_false,
};
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::table::{TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED};

/// Applies one [`CommitRange`]: deletions first, then proved tuples whose
/// key moved to another class member, then additions.
pub struct PropagateChanges {
    ctx: Arc<ReasoningContext>,
    range: CommitRange,
    delete_cursor: AtomicUsize,
    proved_cursor: AtomicUsize,
    add_cursor: AtomicUsize,
}

impl PropagateChanges {
    pub fn new(ctx: Arc<ReasoningContext>, range: CommitRange) -> Self {
        Self {
            ctx,
            delete_cursor: AtomicUsize::new(range.delete.0),
            proved_cursor: AtomicUsize::new(range.proved.0),
            add_cursor: AtomicUsize::new(range.add.0),
            range,
        }
    }
}

impl PhaseBody for PropagateChanges {
    const NAME: &'static str = "propagate changes";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let state = &ctx.state;
        let both = TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED;

        while let Some(index) =
            state
                .delete_list
                .dequeue_bounded(&self.delete_cursor, self.range.delete.1, MT)
        {
            if worker.is_cancelled() {
                return Ok(());
            }
            let Some((triple, _, flags)) = ctx.load(index) else {
                continue;
            };
            if !became_false(flags) {
                continue;
            }
            let changed = ctx.table.delete_tuple_status(index, both);
            if let Some(monitor) = ctx.monitor::<MON>() {
                monitor.tuple_deleted(worker.index, &triple, changed);
            }
        }

        if EQ {
            while let Some(index) =
                state
                    .proved_list
                    .dequeue_bounded(&self.proved_cursor, self.range.proved.1, MT)
            {
                if worker.is_cancelled() {
                    return Ok(());
                }
                let level_flags = state.level_flags.get(index);
                if level_flags & LF_PROVED == 0 || level_flags & LF_PROVED_MERGED != 0 {
                    continue;
                }
                let Some((triple, _)) = ctx.table.status_and_tuple(index) else {
                    continue;
                };
                let (normalized, changed) = ctx.equality.normalize(&triple);
                if changed && state.level_flags.set(index, LF_PROVED_MERGED) {
                    ctx.table.add_tuple(&normalized, 0, both)?;
                    ctx.table.delete_tuple_status(index, TUPLE_STATUS_IDB_MERGED);
                }
            }
        }

        while let Some(index) =
            state
                .add_list
                .dequeue_bounded(&self.add_cursor, self.range.add.1, MT)
        {
            if worker.is_cancelled() {
                return Ok(());
            }
            let Some((triple, _, flags)) = ctx.load(index) else {
                continue;
            };
            if flags & GF_ADDED_MERGED != 0 {
                let changed = ctx.table.delete_add_tuple_status(
                    index,
                    TUPLE_STATUS_IDB_MERGED,
                    TUPLE_STATUS_IDB,
                );
                if let Some(monitor) = ctx.monitor::<MON>() {
                    monitor.tuple_deleted(worker.index, &triple, changed);
                }
            } else if flags & GF_ADDED != 0 {
                let changed = ctx.table.add_tuple_status(index, both);
                if let Some(monitor) = ctx.monitor::<MON>() {
                    monitor.tuple_added(worker.index, &triple, changed);
                }
            }
        }
        Ok(())
    }
}
