//! Seeding a round from the table's scheduled explicit changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ReasonerResult;
use crate::reasoning::context::ReasoningContext;
use crate::reasoning::task::{PhaseBody, WorkerHandle};
use crate::table::{TUPLE_STATUS_EDB, TUPLE_STATUS_EDB_DEL, TUPLE_STATUS_EDB_INS};

/// Seeds every row scheduled for explicit deletion as a deletion candidate.
pub struct InitializeDeleted {
    ctx: Arc<ReasoningContext>,
    dred: bool,
    cursor: AtomicUsize,
}

impl InitializeDeleted {
    pub fn new(ctx: Arc<ReasoningContext>, dred: bool) -> Self {
        Self {
            ctx,
            dred,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl PhaseBody for InitializeDeleted {
    const NAME: &'static str = "initialize deleted";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let scheduled = ctx.table.scheduled_for_deletion();
        while !worker.is_cancelled() {
            let Some(index) = scheduled.dequeue_from(&self.cursor, MT) else {
                break;
            };
            let Some((triple, status)) = ctx.table.status_and_tuple(index) else {
                continue;
            };
            // Re-added after the deletion was scheduled.
            if status & TUPLE_STATUS_EDB_DEL == 0 {
                continue;
            }
            let target = if EQ {
                ctx.table.tuple_index(&ctx.equality.normalize(&triple).0)
            } else {
                Some(index)
            };
            if let Some(target) = target {
                ctx.seed_deletion(target, self.dred);
            }
        }
        Ok(())
    }
}

/// Derives every row scheduled for explicit insertion.
pub struct InitializeInserted {
    ctx: Arc<ReasoningContext>,
    cursor: AtomicUsize,
}

impl InitializeInserted {
    pub fn new(ctx: Arc<ReasoningContext>) -> Self {
        Self {
            ctx,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl PhaseBody for InitializeInserted {
    const NAME: &'static str = "initialize inserted";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let scheduled = ctx.table.scheduled_for_addition();
        while !worker.is_cancelled() {
            let Some(index) = scheduled.dequeue_from(&self.cursor, MT) else {
                break;
            };
            let Some((triple, status)) = ctx.table.status_and_tuple(index) else {
                continue;
            };
            if status & TUPLE_STATUS_EDB_INS != 0 {
                ctx.derive::<MON, EQ>(worker.index, triple)?;
            }
        }
        Ok(())
    }
}

/// Derives every explicit row; the starting point of a full rematerialization.
pub struct InitializeExplicit {
    ctx: Arc<ReasoningContext>,
    next: AtomicUsize,
}

impl InitializeExplicit {
    pub fn new(ctx: Arc<ReasoningContext>) -> Self {
        Self {
            ctx,
            next: AtomicUsize::new(1),
        }
    }
}

impl PhaseBody for InitializeExplicit {
    const NAME: &'static str = "initialize explicit";

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()> {
        let ctx = &self.ctx;
        let end = ctx.table.end_index();
        while !worker.is_cancelled() {
            let index = self.next.fetch_add(1, Ordering::AcqRel);
            if index >= end {
                break;
            }
            let Some((triple, status)) = ctx.table.status_and_tuple(index) else {
                continue;
            };
            if status & TUPLE_STATUS_EDB != 0 {
                ctx.derive::<MON, EQ>(worker.index, triple)?;
            }
        }
        Ok(())
    }
}
