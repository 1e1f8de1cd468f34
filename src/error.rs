//! Rich diagnostic error types for the incremat engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so callers know exactly what
//! went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the incremat engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, related causes) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum ReasonerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persist(#[from] PersistError),
}

/// Result type used throughout the crate.
pub type ReasonerResult<T> = std::result::Result<T, ReasonerError>;

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("incremental reasoning is not supported for rules with aggregation")]
    #[diagnostic(
        code(incremat::config::incremental_aggregation),
        help(
            "Remove the aggregate rules before applying changes incrementally, \
             or rematerialize from scratch with a fresh engine."
        )
    )]
    IncrementalWithAggregation,

    #[error("single-stratum rule application does not support negation or aggregation")]
    #[diagnostic(
        code(incremat::config::single_stratum),
        help(
            "Negation and aggregation need stratification levels. \
             Use `apply_rules_incrementally_by_levels` instead."
        )
    )]
    SingleStratumUnsupported,

    #[error("the program is not stratified:\n{components}")]
    #[diagnostic(
        code(incremat::config::not_stratified),
        help(
            "Every cycle in the predicate dependency graph must consist of positive \
             dependencies only. Break the listed cycles through negation or aggregation."
        )
    )]
    NotStratified {
        /// Offending components, one per line with their rules.
        components: String,
    },

    #[error("rules with negation cannot be maintained without stratification levels")]
    #[diagnostic(
        code(incremat::config::negation_without_levels),
        help(
            "Level-free maintenance is used when equality reasoning is enabled. \
             Disable equality (`EqualityMode::Off`) or remove negated body atoms."
        )
    )]
    NegationWithoutLevels,

    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(incremat::config::invalid),
        help("Check the engine configuration values.")
    )]
    InvalidConfig { message: String },

    #[error("failed to read {path}: {source}")]
    #[diagnostic(
        code(incremat::config::read),
        help("Check that the file exists and is readable.")
    )]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    #[diagnostic(
        code(incremat::config::parse),
        help("The file must be valid TOML matching the documented layout.")
    )]
    ConfigParse { path: String, message: String },

    #[error("failed to write {path}: {source}")]
    #[diagnostic(
        code(incremat::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Task execution errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TaskError {
    #[error("reasoning task '{task}' failed on {} worker(s)", causes.len())]
    #[diagnostic(
        code(incremat::task::workers_failed),
        help(
            "The store may be partially updated. Inspect the related errors, fix the cause \
             and rebuild the materialization from the explicit facts."
        )
    )]
    WorkersFailed {
        task: String,
        #[related]
        causes: Vec<WorkerFailure>,
    },

    #[error("worker {worker_index} is in state {actual}, expected {expected}")]
    #[diagnostic(
        code(incremat::task::invalid_state),
        help("Workers must be loaded while idle and started only after loading.")
    )]
    InvalidWorkerState {
        worker_index: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to spawn engine worker thread {worker_index}: {source}")]
    #[diagnostic(
        code(incremat::task::spawn),
        help("The operating system refused to create a thread. Reduce `worker_threads`.")
    )]
    ThreadSpawn {
        worker_index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("engine worker thread {worker_index} is no longer running")]
    #[diagnostic(
        code(incremat::task::disconnected),
        help("A worker thread exited unexpectedly. Recreate the engine.")
    )]
    Disconnected { worker_index: usize },

    #[error("reasoning task '{task}' was not executed: another task is running")]
    #[diagnostic(
        code(incremat::task::busy),
        help("Only one reasoning task runs at a time. Serialize calls into the worker pool.")
    )]
    PoolBusy { task: String },

    #[error("reasoning was aborted")]
    #[diagnostic(
        code(incremat::task::aborted),
        help("An abort was requested while the round was running. The store may be partially updated.")
    )]
    Aborted,
}

/// One worker's failure inside an aggregate [`TaskError::WorkersFailed`].
#[derive(Debug, Error, Diagnostic)]
#[error("worker {worker_index}: {message}")]
#[diagnostic(code(incremat::task::worker))]
pub struct WorkerFailure {
    pub worker_index: usize,
    pub message: String,
    #[source]
    pub source: Option<Box<ReasonerError>>,
}

// ---------------------------------------------------------------------------
// Queue errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("failed to reserve space for {capacity} entries in work queue '{queue}'")]
    #[diagnostic(
        code(incremat::queue::allocation),
        help("The process ran out of memory while (re)initializing a work queue.")
    )]
    Allocation { queue: &'static str, capacity: usize },
}

// ---------------------------------------------------------------------------
// Tuple table errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TableError {
    #[error("tuple table is full: capacity of {capacity} tuples reached")]
    #[diagnostic(
        code(incremat::table::capacity),
        help("The per-round flag arrays cannot address more tuples.")
    )]
    CapacityExceeded { capacity: usize },

    #[error("tuple index {index} is not in the table")]
    #[diagnostic(
        code(incremat::table::invalid_index),
        help("This indicates a bug: a tuple index outlived its table.")
    )]
    InvalidIndex { index: usize },
}

// ---------------------------------------------------------------------------
// Rule errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RuleError {
    #[error("variable ?{variable} in the head of rule '{rule}' is not bound by a positive body atom")]
    #[diagnostic(
        code(incremat::rule::unsafe_head),
        help("Every head variable must occur in a positive body atom.")
    )]
    UnsafeHeadVariable { rule: String, variable: String },

    #[error("variable ?{variable} in a negated atom of rule '{rule}' is not bound by a positive body atom")]
    #[diagnostic(
        code(incremat::rule::unsafe_negation),
        help("Variables of negated atoms must also occur in a positive body atom.")
    )]
    UnsafeNegatedVariable { rule: String, variable: String },

    #[error("rule '{rule}' has no head atoms")]
    #[diagnostic(
        code(incremat::rule::empty_head),
        help("A rule must derive at least one atom.")
    )]
    EmptyHead { rule: String },

    #[error("rule {rule_id} is not in the rule index")]
    #[diagnostic(
        code(incremat::rule::unknown),
        help("The rule was never added or has already been removed.")
    )]
    UnknownRule { rule_id: u32 },

    #[error("malformed term '{term}' in rule '{rule}'")]
    #[diagnostic(
        code(incremat::rule::malformed_term),
        help("Variables start with '?', every other term is a resource label.")
    )]
    MalformedTerm { rule: String, term: String },
}

// ---------------------------------------------------------------------------
// Persistence errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PersistError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(incremat::persist::io),
        help("Check that the target is writable and the disk is not full.")
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(incremat::persist::serde),
        help(
            "Failed to serialize or deserialize the rule index. \
             The stream may come from an incompatible version."
        )
    )]
    Serialization { message: String },
}

impl From<std::io::Error> for PersistError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

impl From<bincode::Error> for PersistError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
