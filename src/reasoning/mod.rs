//! Incremental maintenance of a materialization.
//!
//! - [`queue`]: append-only work queues with shared cursors
//! - [`state`]: per-round lists, flags and level markers
//! - [`task`] / [`pool`]: specialized phase workers and the engine threads running them
//! - [`tasks`]: the phases of a round
//! - [`incremental`]: the sequencing of phases into rounds

pub mod context;
pub mod incremental;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod state;
pub mod task;
pub mod tasks;

use serde::{Deserialize, Serialize};

pub use context::ReasoningContext;
pub use incremental::{IncrementalReasoner, Maintenance, RoundSummary};
pub use monitor::{CountingMonitor, ReasoningMonitor, TracingMonitor};
pub use pool::{WorkerPool, WorkerState};
pub use queue::WorkQueue;
pub use state::{IncrementalReasoningState, LevelMarker};
pub use task::{CancellationToken, ReasoningTask, ReasoningTaskWorker, TaskConfig};

/// How `owl:sameAs` is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EqualityMode {
    /// `owl:sameAs` is an ordinary predicate.
    #[default]
    Off,
    /// Equality without the unique name assumption: resources related by
    /// `owl:sameAs` are merged into one class.
    NoUna,
}

/// How derived tuples that lost a derivation are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionStrategy {
    /// Delete everything that used a deleted tuple, then rederive.
    #[default]
    DRed,
    /// Delete a tuple only once no derivation for it can be found.
    Fbf,
}

impl DeletionStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::DRed => "dred",
            Self::Fbf => "fbf",
        }
    }
}

impl std::fmt::Display for DeletionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
