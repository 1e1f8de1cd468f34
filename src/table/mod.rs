//! Tuple table: triples with per-tuple status bits.
//!
//! The reasoning core only talks to storage through the [`TupleTable`] trait.
//! [`MemoryTripleTable`] is the in-memory implementation the engine ships with.

pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::TableError;
use crate::reasoning::queue::WorkQueue;
use crate::resource::{INVALID_RESOURCE_ID, ResourceId};

pub use memory::MemoryTripleTable;

/// Dense handle of a stored tuple. Handles are never reused.
pub type TupleIndex = usize;

/// Reserved sentinel; the first stored tuple gets index 1.
pub const INVALID_TUPLE_INDEX: TupleIndex = 0;

/// Status bits attached to every stored tuple.
pub type TupleStatus = u8;

/// Explicit (base) fact.
pub const TUPLE_STATUS_EDB: TupleStatus = 0x01;
/// Derived fact.
pub const TUPLE_STATUS_IDB: TupleStatus = 0x02;
/// Derived fact under its equality-normalized key; the row rules see.
pub const TUPLE_STATUS_IDB_MERGED: TupleStatus = 0x04;
/// Explicit fact scheduled for insertion in the next round.
pub const TUPLE_STATUS_EDB_INS: TupleStatus = 0x08;
/// Explicit fact scheduled for deletion in the next round.
pub const TUPLE_STATUS_EDB_DEL: TupleStatus = 0x10;

/// Result type for tuple table operations.
pub type TableResult<T> = std::result::Result<T, TableError>;

// ---------------------------------------------------------------------------
// Triple
// ---------------------------------------------------------------------------

/// A subject-predicate-object triple of resource ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: ResourceId,
    pub predicate: ResourceId,
    pub object: ResourceId,
}

impl Triple {
    pub fn new(subject: ResourceId, predicate: ResourceId, object: ResourceId) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// Position `0`, `1` or `2` (subject, predicate, object).
    pub fn get(&self, position: usize) -> ResourceId {
        match position {
            0 => self.subject,
            1 => self.predicate,
            _ => self.object,
        }
    }

    pub fn as_array(&self) -> [ResourceId; 3] {
        [self.subject, self.predicate, self.object]
    }

    pub fn from_array(values: [ResourceId; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    /// True if `resource` occurs in any position.
    pub fn mentions(&self, resource: ResourceId) -> bool {
        self.subject == resource || self.predicate == resource || self.object == resource
    }

    /// Apply `f` to every position.
    pub fn map(&self, mut f: impl FnMut(ResourceId) -> ResourceId) -> Self {
        Self::new(f(self.subject), f(self.predicate), f(self.object))
    }
}

impl std::fmt::Display for Triple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(#{} #{} #{})", self.subject, self.predicate, self.object)
    }
}

/// Lookup pattern: `None` positions are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pattern(pub [Option<ResourceId>; 3]);

impl Pattern {
    /// Pattern with a single bound position.
    pub fn at(position: usize, resource: ResourceId) -> Self {
        let mut terms = [None; 3];
        terms[position] = Some(resource);
        Self(terms)
    }

    pub fn matches(&self, triple: &Triple) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(i, term)| term.is_none_or(|r| r == triple.get(i)))
    }

    pub fn is_ground(&self) -> bool {
        self.0.iter().all(|t| t.is_some_and(|r| r != INVALID_RESOURCE_ID))
    }
}

// ---------------------------------------------------------------------------
// Tuple table trait
// ---------------------------------------------------------------------------

/// Storage seam consumed by the reasoning core.
///
/// All methods take `&self`; implementations synchronize internally so that
/// worker threads can read and update status bits concurrently.
pub trait TupleTable: Send + Sync {
    /// Insert `triple` if absent, then clear `clear` and set `set` on its
    /// status. Returns whether a new row was created and the row's index.
    fn add_tuple(
        &self,
        triple: &Triple,
        clear: TupleStatus,
        set: TupleStatus,
    ) -> TableResult<(bool, TupleIndex)>;

    /// Index of `triple`, if stored.
    fn tuple_index(&self, triple: &Triple) -> Option<TupleIndex>;

    /// The triple and status stored at `index`.
    fn status_and_tuple(&self, index: TupleIndex) -> Option<(Triple, TupleStatus)>;

    /// Current status bits of `index` (0 for unknown indexes).
    fn status(&self, index: TupleIndex) -> TupleStatus {
        self.status_and_tuple(index).map_or(0, |(_, s)| s)
    }

    /// Clear `mask`; true if any bit changed.
    fn delete_tuple_status(&self, index: TupleIndex, mask: TupleStatus) -> bool;

    /// Set `mask`; true if any bit changed.
    fn add_tuple_status(&self, index: TupleIndex, mask: TupleStatus) -> bool;

    /// Clear `delete` then set `add` in one atomic step; true if the status changed.
    fn delete_add_tuple_status(
        &self,
        index: TupleIndex,
        delete: TupleStatus,
        add: TupleStatus,
    ) -> bool;

    /// Indexes of rows matching `pattern`.
    fn matching(&self, pattern: &Pattern) -> Vec<TupleIndex>;

    /// One past the highest assigned index.
    fn end_index(&self) -> TupleIndex;

    /// Rows whose `EDB_DEL` bit was set since the last round.
    fn scheduled_for_deletion(&self) -> &WorkQueue<TupleIndex>;

    /// Rows whose `EDB_INS` bit was set since the last round.
    fn scheduled_for_addition(&self) -> &WorkQueue<TupleIndex>;

    /// Schedule an explicit insertion. Returns true if the base facts change.
    fn schedule_addition(&self, triple: &Triple) -> TableResult<bool>;

    /// Schedule an explicit deletion. Returns true if the base facts change.
    fn schedule_deletion(&self, triple: &Triple) -> bool;

    /// Fold `EDB_INS`/`EDB_DEL` into `EDB` and reinitialize the delta queues.
    fn apply_scheduled_changes(&self) -> Result<(), crate::error::QueueError>;
}
