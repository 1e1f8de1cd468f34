//! In-memory triple table with `DashMap` position indexes.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{QueueError, TableError};
use crate::reasoning::queue::WorkQueue;
use crate::reasoning::state::FLAG_ARRAY_CAPACITY;
use crate::resource::ResourceId;

use super::{
    Pattern, TUPLE_STATUS_EDB, TUPLE_STATUS_EDB_DEL, TUPLE_STATUS_EDB_INS, TableResult, Triple,
    TupleIndex, TupleStatus, TupleTable,
};

struct Row {
    triple: Triple,
    status: AtomicU8,
}

/// Triple table kept entirely in memory.
///
/// Rows are append-only; a row is never physically removed, only its status
/// bits change. Lookups go through an exact-match index plus one index per
/// triple position.
pub struct MemoryTripleTable {
    rows: RwLock<Vec<Row>>,
    exact: DashMap<Triple, TupleIndex>,
    by_subject: DashMap<ResourceId, Vec<TupleIndex>>,
    by_predicate: DashMap<ResourceId, Vec<TupleIndex>>,
    by_object: DashMap<ResourceId, Vec<TupleIndex>>,
    capacity: usize,
    scheduled_deletions: WorkQueue<TupleIndex>,
    scheduled_additions: WorkQueue<TupleIndex>,
}

impl MemoryTripleTable {
    /// Create an empty table addressing up to the flag-array capacity.
    pub fn new() -> Self {
        Self::with_capacity_limit(FLAG_ARRAY_CAPACITY)
    }

    /// Create an empty table that refuses to grow past `capacity` rows.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        // Index 0 is the invalid tuple index; occupy it with a dead row.
        let sentinel = Row {
            triple: Triple::new(0, 0, 0),
            status: AtomicU8::new(0),
        };
        Self {
            rows: RwLock::new(vec![sentinel]),
            exact: DashMap::new(),
            by_subject: DashMap::new(),
            by_predicate: DashMap::new(),
            by_object: DashMap::new(),
            capacity: capacity.min(FLAG_ARRAY_CAPACITY),
            scheduled_deletions: WorkQueue::new("scheduled deletions"),
            scheduled_additions: WorkQueue::new("scheduled additions"),
        }
    }

    /// Number of stored rows, whatever their status.
    pub fn len(&self) -> usize {
        self.rows.read().expect("tuple table lock poisoned").len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows whose status contains every bit of `mask`.
    pub fn rows_with_status(&self, mask: TupleStatus) -> Vec<(TupleIndex, Triple)> {
        let rows = self.rows.read().expect("tuple table lock poisoned");
        rows.iter()
            .enumerate()
            .skip(1)
            .filter(|(_, row)| row.status.load(Ordering::Acquire) & mask == mask)
            .map(|(index, row)| (index, row.triple))
            .collect()
    }

    /// Atomically rewrite the status of `index`; returns the previous status.
    fn update(&self, index: TupleIndex, f: impl Fn(TupleStatus) -> TupleStatus) -> Option<TupleStatus> {
        let rows = self.rows.read().expect("tuple table lock poisoned");
        let row = rows.get(index).filter(|_| index != 0)?;
        let previous = match row
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(f(s)))
        {
            Ok(p) | Err(p) => p,
        };
        Some(previous)
    }

    fn position_index(&self, position: usize) -> &DashMap<ResourceId, Vec<TupleIndex>> {
        match position {
            0 => &self.by_subject,
            1 => &self.by_predicate,
            _ => &self.by_object,
        }
    }
}

impl Default for MemoryTripleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TupleTable for MemoryTripleTable {
    fn add_tuple(
        &self,
        triple: &Triple,
        clear: TupleStatus,
        set: TupleStatus,
    ) -> TableResult<(bool, TupleIndex)> {
        if let Some(index) = self.exact.get(triple).map(|r| *r.value()) {
            self.update(index, |s| (s & !clear) | set);
            return Ok((false, index));
        }
        match self.exact.entry(*triple) {
            Entry::Occupied(entry) => {
                let index = *entry.get();
                drop(entry);
                self.update(index, |s| (s & !clear) | set);
                Ok((false, index))
            }
            Entry::Vacant(entry) => {
                let index = {
                    let mut rows = self.rows.write().expect("tuple table lock poisoned");
                    if rows.len() >= self.capacity {
                        return Err(TableError::CapacityExceeded {
                            capacity: self.capacity,
                        });
                    }
                    rows.push(Row {
                        triple: *triple,
                        status: AtomicU8::new(set & !clear),
                    });
                    rows.len() - 1
                };
                entry.insert(index);
                for position in 0..3 {
                    self.position_index(position)
                        .entry(triple.get(position))
                        .or_default()
                        .push(index);
                }
                Ok((true, index))
            }
        }
    }

    fn tuple_index(&self, triple: &Triple) -> Option<TupleIndex> {
        self.exact.get(triple).map(|r| *r.value())
    }

    fn status_and_tuple(&self, index: TupleIndex) -> Option<(Triple, TupleStatus)> {
        if index == 0 {
            return None;
        }
        let rows = self.rows.read().expect("tuple table lock poisoned");
        rows.get(index)
            .map(|row| (row.triple, row.status.load(Ordering::Acquire)))
    }

    fn delete_tuple_status(&self, index: TupleIndex, mask: TupleStatus) -> bool {
        self.update(index, |s| s & !mask)
            .is_some_and(|previous| previous & mask != 0)
    }

    fn add_tuple_status(&self, index: TupleIndex, mask: TupleStatus) -> bool {
        self.update(index, |s| s | mask)
            .is_some_and(|previous| previous & mask != mask)
    }

    fn delete_add_tuple_status(
        &self,
        index: TupleIndex,
        delete: TupleStatus,
        add: TupleStatus,
    ) -> bool {
        self.update(index, |s| (s & !delete) | add)
            .is_some_and(|previous| previous != (previous & !delete) | add)
    }

    fn matching(&self, pattern: &Pattern) -> Vec<TupleIndex> {
        if pattern.is_ground() {
            let triple = Triple::new(
                pattern.0[0].unwrap_or_default(),
                pattern.0[1].unwrap_or_default(),
                pattern.0[2].unwrap_or_default(),
            );
            return self.tuple_index(&triple).into_iter().collect();
        }

        // Pick the shortest posting list among the bound positions.
        let mut candidates: Option<Vec<TupleIndex>> = None;
        for (position, term) in pattern.0.iter().enumerate() {
            let Some(resource) = term else { continue };
            let list = self
                .position_index(position)
                .get(resource)
                .map(|l| l.value().clone())
                .unwrap_or_default();
            if candidates.as_ref().is_none_or(|c| list.len() < c.len()) {
                candidates = Some(list);
            }
        }

        let rows = self.rows.read().expect("tuple table lock poisoned");
        match candidates {
            Some(list) => list
                .into_iter()
                .filter(|&index| rows.get(index).is_some_and(|r| pattern.matches(&r.triple)))
                .collect(),
            None => (1..rows.len()).collect(),
        }
    }

    fn end_index(&self) -> TupleIndex {
        self.rows.read().expect("tuple table lock poisoned").len()
    }

    fn scheduled_for_deletion(&self) -> &WorkQueue<TupleIndex> {
        &self.scheduled_deletions
    }

    fn scheduled_for_addition(&self) -> &WorkQueue<TupleIndex> {
        &self.scheduled_additions
    }

    fn schedule_addition(&self, triple: &Triple) -> TableResult<bool> {
        let (_, index) = self.add_tuple(triple, 0, 0)?;
        let previous = self
            .update(index, |s| {
                if s & TUPLE_STATUS_EDB_DEL != 0 {
                    s & !TUPLE_STATUS_EDB_DEL
                } else if s & (TUPLE_STATUS_EDB | TUPLE_STATUS_EDB_INS) != 0 {
                    s
                } else {
                    s | TUPLE_STATUS_EDB_INS
                }
            })
            .unwrap_or(0);
        if previous & TUPLE_STATUS_EDB_DEL != 0 {
            // Cancels a pending deletion; the row simply stays explicit.
            return Ok(true);
        }
        if previous & (TUPLE_STATUS_EDB | TUPLE_STATUS_EDB_INS) != 0 {
            return Ok(false);
        }
        self.scheduled_additions.enqueue(index);
        Ok(true)
    }

    fn schedule_deletion(&self, triple: &Triple) -> bool {
        let Some(index) = self.tuple_index(triple) else {
            return false;
        };
        let previous = self
            .update(index, |s| {
                if s & TUPLE_STATUS_EDB_INS != 0 {
                    s & !TUPLE_STATUS_EDB_INS
                } else if s & TUPLE_STATUS_EDB != 0 {
                    s | TUPLE_STATUS_EDB_DEL
                } else {
                    s
                }
            })
            .unwrap_or(0);
        if previous & TUPLE_STATUS_EDB_INS != 0 {
            return true;
        }
        if previous & TUPLE_STATUS_EDB != 0 && previous & TUPLE_STATUS_EDB_DEL == 0 {
            self.scheduled_deletions.enqueue(index);
            return true;
        }
        false
    }

    fn apply_scheduled_changes(&self) -> Result<(), QueueError> {
        let deletions = self
            .scheduled_deletions
            .snapshot(0, self.scheduled_deletions.end_position());
        for index in deletions {
            self.update(index, |s| {
                if s & TUPLE_STATUS_EDB_DEL != 0 {
                    s & !(TUPLE_STATUS_EDB_DEL | TUPLE_STATUS_EDB)
                } else {
                    s
                }
            });
        }
        let additions = self
            .scheduled_additions
            .snapshot(0, self.scheduled_additions.end_position());
        for index in additions {
            self.update(index, |s| {
                if s & TUPLE_STATUS_EDB_INS != 0 {
                    (s & !TUPLE_STATUS_EDB_INS) | TUPLE_STATUS_EDB
                } else {
                    s
                }
            });
        }
        self.scheduled_deletions.initialize(0)?;
        self.scheduled_additions.initialize(0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{TUPLE_STATUS_IDB, TUPLE_STATUS_IDB_MERGED};

    #[test]
    fn add_tuple_reports_insertion_once() {
        let table = MemoryTripleTable::new();
        let t = Triple::new(10, 11, 12);
        let (inserted, index) = table.add_tuple(&t, 0, TUPLE_STATUS_IDB).unwrap();
        assert!(inserted);
        assert_eq!(index, 1);
        let (again, same) = table.add_tuple(&t, 0, TUPLE_STATUS_IDB_MERGED).unwrap();
        assert!(!again);
        assert_eq!(same, index);
        assert_eq!(
            table.status(index),
            TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED
        );
    }

    #[test]
    fn status_updates_report_change() {
        let table = MemoryTripleTable::new();
        let (_, index) = table.add_tuple(&Triple::new(1, 2, 3), 0, 0).unwrap();
        assert!(table.add_tuple_status(index, TUPLE_STATUS_IDB));
        assert!(!table.add_tuple_status(index, TUPLE_STATUS_IDB));
        assert!(table.delete_add_tuple_status(
            index,
            TUPLE_STATUS_IDB,
            TUPLE_STATUS_IDB_MERGED
        ));
        assert!(!table.delete_add_tuple_status(
            index,
            TUPLE_STATUS_IDB,
            TUPLE_STATUS_IDB_MERGED
        ));
        assert!(table.delete_tuple_status(index, TUPLE_STATUS_IDB_MERGED));
        assert!(!table.delete_tuple_status(index, TUPLE_STATUS_IDB_MERGED));
    }

    #[test]
    fn matching_uses_bound_positions() {
        let table = MemoryTripleTable::new();
        for (s, p, o) in [(5, 1, 7), (5, 1, 8), (6, 1, 7), (5, 9, 7)] {
            table.add_tuple(&Triple::new(s, p, o), 0, 0).unwrap();
        }
        let mut hits = table.matching(&Pattern([Some(5), Some(1), None]));
        hits.sort();
        assert_eq!(hits, vec![1, 2]);
        assert_eq!(table.matching(&Pattern([None, None, Some(7)])).len(), 3);
        assert_eq!(table.matching(&Pattern::default()).len(), 4);
        assert_eq!(table.matching(&Pattern([Some(5), Some(9), Some(7)])), vec![4]);
    }

    #[test]
    fn scheduled_deletion_then_addition_cancels() {
        let table = MemoryTripleTable::new();
        let t = Triple::new(3, 4, 5);
        assert!(table.schedule_addition(&t).unwrap());
        table.apply_scheduled_changes().unwrap();
        let index = table.tuple_index(&t).unwrap();
        assert_eq!(table.status(index), TUPLE_STATUS_EDB);

        assert!(table.schedule_deletion(&t));
        assert!(table.schedule_addition(&t).unwrap());
        assert_eq!(table.status(index), TUPLE_STATUS_EDB);
        table.apply_scheduled_changes().unwrap();
        assert_eq!(table.status(index), TUPLE_STATUS_EDB);
    }

    #[test]
    fn scheduled_addition_then_deletion_cancels() {
        let table = MemoryTripleTable::new();
        let t = Triple::new(3, 4, 5);
        table.schedule_addition(&t).unwrap();
        assert!(table.schedule_deletion(&t));
        table.apply_scheduled_changes().unwrap();
        assert_eq!(table.status(table.tuple_index(&t).unwrap()), 0);
        assert!(!table.schedule_deletion(&Triple::new(9, 9, 9)));
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let table = MemoryTripleTable::with_capacity_limit(3);
        table.add_tuple(&Triple::new(1, 1, 1), 0, 0).unwrap();
        table.add_tuple(&Triple::new(1, 1, 2), 0, 0).unwrap();
        assert!(matches!(
            table.add_tuple(&Triple::new(1, 1, 3), 0, 0),
            Err(TableError::CapacityExceeded { capacity: 3 })
        ));
    }
}
