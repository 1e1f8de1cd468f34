//! Per-round incremental reasoning state.
//!
//! The state of one `apply_rules_incrementally*` call: the delete, add and
//! proved lists, two flag arrays indexed by tuple index, the rule queues and
//! the end markers recorded after every stratification level. Everything here
//! is transient and rebuilt by [`IncrementalReasoningState::reset`].

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use dashmap::DashSet;
use serde::Serialize;

use crate::error::QueueError;
use crate::rules::RuleId;
use crate::table::{
    TUPLE_STATUS_EDB, TUPLE_STATUS_EDB_DEL, TUPLE_STATUS_EDB_INS, TUPLE_STATUS_IDB_MERGED,
    TupleIndex, TupleStatus,
};

use super::queue::WorkQueue;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Deleted this round (DRed: overdeleted; FBF: confirmed).
pub const GF_DELETED: u8 = 0x01;
/// Seeded as a deletion candidate and already on the delete list.
pub const GF_DELETED_NEW: u8 = 0x02;
/// (Re)added this round and enqueued on the add list.
pub const GF_ADDED: u8 = 0x04;
/// Added this round without having been present before the round.
pub const GF_ADDED_NEW: u8 = 0x08;
/// Superseded by its equality-normalized form this round.
pub const GF_ADDED_MERGED: u8 = 0x10;

/// Proved during the current level's backward/forward check.
pub const LF_PROVED: u8 = 0x01;
/// Proved tuple already folded into its normalized row at commit.
pub const LF_PROVED_MERGED: u8 = 0x02;

const SEGMENT_BITS: usize = 16;
const SEGMENT_LEN: usize = 1 << SEGMENT_BITS;
const SEGMENT_COUNT: usize = 1 << 14;

/// Number of tuple indexes a [`FlagArray`] can address.
pub const FLAG_ARRAY_CAPACITY: usize = SEGMENT_LEN * SEGMENT_COUNT;

/// Growable array of atomic flag bytes indexed by tuple index.
///
/// Storage is a fixed directory of lazily allocated segments, so growing never
/// moves existing flags and concurrent readers need no lock. Segments are only
/// freed when the array is dropped.
pub struct FlagArray {
    segments: Box<[OnceLock<Box<[AtomicU8]>>]>,
}

impl FlagArray {
    pub fn new() -> Self {
        Self {
            segments: (0..SEGMENT_COUNT).map(|_| OnceLock::new()).collect(),
        }
    }

    fn segment(&self, index: TupleIndex) -> Option<&[AtomicU8]> {
        self.segments
            .get(index >> SEGMENT_BITS)
            .map(|cell| &**cell.get_or_init(|| (0..SEGMENT_LEN).map(|_| AtomicU8::new(0)).collect()))
    }

    fn existing_segment(&self, index: TupleIndex) -> Option<&[AtomicU8]> {
        self.segments
            .get(index >> SEGMENT_BITS)
            .and_then(|cell| cell.get())
            .map(|s| &**s)
    }

    /// Flags of `index`; unallocated entries read as 0.
    pub fn get(&self, index: TupleIndex) -> u8 {
        self.existing_segment(index)
            .map_or(0, |s| s[index & (SEGMENT_LEN - 1)].load(Ordering::Acquire))
    }

    /// Set `mask` on `index`. True iff this call set at least one new bit of
    /// `mask`, so exactly one of several racing callers wins.
    pub fn set(&self, index: TupleIndex, mask: u8) -> bool {
        debug_assert!(
            index < FLAG_ARRAY_CAPACITY,
            "tuple index {index} past flag array capacity"
        );
        match self.segment(index) {
            Some(s) => s[index & (SEGMENT_LEN - 1)].fetch_or(mask, Ordering::SeqCst) & mask != mask,
            None => false,
        }
    }

    /// Clear `mask` on `index`; true if any bit was set.
    pub fn clear(&self, index: TupleIndex, mask: u8) -> bool {
        self.existing_segment(index).is_some_and(|s| {
            s[index & (SEGMENT_LEN - 1)].fetch_and(!mask, Ordering::SeqCst) & mask != 0
        })
    }

    /// Reset every allocated entry to zero.
    pub fn clear_all(&self) {
        for cell in self.segments.iter() {
            if let Some(segment) = cell.get() {
                for flag in segment.iter() {
                    flag.store(0, Ordering::Relaxed);
                }
            }
        }
        std::sync::atomic::fence(Ordering::SeqCst);
    }
}

impl Default for FlagArray {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlagArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let allocated = self.segments.iter().filter(|s| s.get().is_some()).count();
        f.debug_struct("FlagArray")
            .field("allocated_segments", &allocated)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// The tuple was visible to rules when the round started.
pub fn present_before(status: TupleStatus) -> bool {
    status & TUPLE_STATUS_IDB_MERGED != 0
}

/// The tuple is visible in the state the round is computing.
pub fn present_after(status: TupleStatus, flags: u8) -> bool {
    if flags & GF_ADDED_MERGED != 0 {
        return false;
    }
    (present_before(status) && flags & GF_DELETED == 0) || flags & GF_ADDED != 0
}

/// The tuple is an explicit fact once scheduled changes are applied.
pub fn edb_after(status: TupleStatus) -> bool {
    (status & TUPLE_STATUS_EDB != 0 && status & TUPLE_STATUS_EDB_DEL == 0)
        || status & TUPLE_STATUS_EDB_INS != 0
}

/// Deleted this round and not re-added.
pub fn became_false(flags: u8) -> bool {
    flags & GF_DELETED != 0 && flags & GF_ADDED == 0
}

/// Added this round without having been present before.
pub fn became_true(flags: u8) -> bool {
    flags & GF_ADDED_NEW != 0 && flags & GF_ADDED_MERGED == 0
}

// ---------------------------------------------------------------------------
// Round state
// ---------------------------------------------------------------------------

/// Queue positions recorded when a level finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelMarker {
    /// `None` for the single level of level-free maintenance.
    pub level: Option<usize>,
    pub delete_end: usize,
    pub add_end: usize,
    pub proved_end: usize,
}

/// Queue positions one commit walk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRange {
    pub level: Option<usize>,
    pub delete: (usize, usize),
    pub add: (usize, usize),
    pub proved: (usize, usize),
}

/// Shared mutable state of one incremental round.
#[derive(Debug)]
pub struct IncrementalReasoningState {
    pub delete_list: WorkQueue<TupleIndex>,
    pub add_list: WorkQueue<TupleIndex>,
    pub proved_list: WorkQueue<TupleIndex>,
    /// Rules removed by the caller, evaluated before they disappear.
    pub deleted_rules: WorkQueue<RuleId>,
    /// Rules folded in by the last `propagate_insertions`.
    pub inserted_rules: WorkQueue<RuleId>,
    /// Rules whose constants changed equivalence class.
    pub reevaluate_rules: WorkQueue<RuleId>,
    pub global_flags: FlagArray,
    pub level_flags: FlagArray,
    /// Delete-list position up to which equality updates have been applied.
    pub equality_cursor: AtomicUsize,
    reevaluation_marks: DashSet<RuleId>,
    markers: Mutex<Vec<LevelMarker>>,
    committed: Mutex<usize>,
}

impl IncrementalReasoningState {
    pub fn new() -> Self {
        Self {
            delete_list: WorkQueue::new("delete list"),
            add_list: WorkQueue::new("add list"),
            proved_list: WorkQueue::new("proved list"),
            deleted_rules: WorkQueue::new("deleted rules"),
            inserted_rules: WorkQueue::new("inserted rules"),
            reevaluate_rules: WorkQueue::new("reevaluated rules"),
            global_flags: FlagArray::new(),
            level_flags: FlagArray::new(),
            equality_cursor: AtomicUsize::new(0),
            reevaluation_marks: DashSet::new(),
            markers: Mutex::new(Vec::new()),
            committed: Mutex::new(0),
        }
    }

    /// Clear everything for a new pass, reserving `capacity` list entries.
    pub fn reset(&self, capacity: usize) -> Result<(), QueueError> {
        self.delete_list.initialize(capacity)?;
        self.add_list.initialize(capacity)?;
        self.proved_list.initialize(capacity)?;
        self.deleted_rules.initialize(0)?;
        self.inserted_rules.initialize(0)?;
        self.reevaluate_rules.initialize(0)?;
        self.global_flags.clear_all();
        self.level_flags.clear_all();
        self.equality_cursor.store(0, Ordering::SeqCst);
        self.reevaluation_marks.clear();
        self.markers.lock().expect("marker lock poisoned").clear();
        *self.committed.lock().expect("marker lock poisoned") = 0;
        Ok(())
    }

    /// Start a level: current-level flags are only meaningful inside it.
    pub fn begin_level(&self) {
        self.level_flags.clear_all();
    }

    /// Snapshot the list write positions as the end marker of `level`.
    pub fn record_level_marker(&self, level: Option<usize>) -> LevelMarker {
        let marker = LevelMarker {
            level,
            delete_end: self.delete_list.end_position(),
            add_end: self.add_list.end_position(),
            proved_end: self.proved_list.end_position(),
        };
        self.markers
            .lock()
            .expect("marker lock poisoned")
            .push(marker);
        marker
    }

    /// Markers recorded since the last reset, in level order.
    pub fn level_markers(&self) -> Vec<LevelMarker> {
        self.markers.lock().expect("marker lock poisoned").clone()
    }

    /// Ranges of the levels recorded since the last commit; advances the
    /// commit position past them.
    pub fn take_commit_ranges(&self) -> Vec<CommitRange> {
        let markers = self.level_markers();
        let mut committed = self.committed.lock().expect("marker lock poisoned");
        let mut previous = match *committed {
            0 => LevelMarker {
                level: None,
                delete_end: 0,
                add_end: 0,
                proved_end: 0,
            },
            n => markers[n - 1],
        };
        let mut ranges = Vec::new();
        for marker in markers.iter().skip(*committed) {
            ranges.push(CommitRange {
                level: marker.level,
                delete: (previous.delete_end, marker.delete_end),
                add: (previous.add_end, marker.add_end),
                proved: (previous.proved_end, marker.proved_end),
            });
            previous = *marker;
        }
        *committed = markers.len();
        ranges
    }

    /// Queue `rule` for full re-evaluation once per round.
    pub fn schedule_reevaluation(&self, rule: RuleId) -> bool {
        let fresh = self.reevaluation_marks.insert(rule);
        if fresh {
            self.reevaluate_rules.enqueue(rule);
        }
        fresh
    }
}

impl Default for IncrementalReasoningState {
    fn default() -> Self {
        Self::new()
    }
}
