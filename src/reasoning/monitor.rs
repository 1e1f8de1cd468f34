//! Reasoning monitors: observation hooks called by the tasks.
//!
//! Every hook has an empty default so implementations override only what they
//! care about. Tasks compiled without a monitor never call into this trait.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::resource::ResourceId;
use crate::table::Triple;

/// Observer of a reasoning round. Called concurrently from worker threads.
#[allow(unused_variables)]
pub trait ReasoningMonitor: Send + Sync {
    fn task_started(&self, task: &str) {}
    fn task_finished(&self, task: &str) {}

    /// `None` is the single pass of level-free maintenance.
    fn component_level_started(&self, level: Option<usize>) {}
    fn component_level_finished(&self, level: Option<usize>) {}

    fn tuple_derived(&self, worker: usize, triple: &Triple) {}
    /// A derived tuple was removed at commit; `changed` is false when the
    /// table already lacked the derived bits.
    fn tuple_deleted(&self, worker: usize, triple: &Triple, changed: bool) {}
    fn tuple_added(&self, worker: usize, triple: &Triple, changed: bool) {}

    fn deleted_rule_evaluation_started(&self, rules: usize) {}
    fn deleted_rule_evaluation_finished(&self) {}
    fn added_rule_evaluation_started(&self, rules: usize) {}
    fn added_rule_evaluation_finished(&self) {}

    fn update_equality_manager_started(&self, mode: &str) {}
    fn update_equality_manager_finished(&self, mode: &str) {}
    fn equivalence_class_copied(&self, resource: ResourceId, members: usize) {}
}

// ---------------------------------------------------------------------------
// Tracing monitor
// ---------------------------------------------------------------------------

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl ReasoningMonitor for TracingMonitor {
    fn task_started(&self, task: &str) {
        tracing::debug!(task, "task started");
    }

    fn task_finished(&self, task: &str) {
        tracing::debug!(task, "task finished");
    }

    fn component_level_started(&self, level: Option<usize>) {
        tracing::debug!(?level, "component level started");
    }

    fn component_level_finished(&self, level: Option<usize>) {
        tracing::debug!(?level, "component level finished");
    }

    fn tuple_derived(&self, worker: usize, triple: &Triple) {
        tracing::trace!(worker, %triple, "derived");
    }

    fn tuple_deleted(&self, worker: usize, triple: &Triple, changed: bool) {
        tracing::trace!(worker, %triple, changed, "deleted");
    }

    fn tuple_added(&self, worker: usize, triple: &Triple, changed: bool) {
        tracing::trace!(worker, %triple, changed, "added");
    }

    fn deleted_rule_evaluation_started(&self, rules: usize) {
        tracing::debug!(rules, "evaluating deleted rules");
    }

    fn added_rule_evaluation_started(&self, rules: usize) {
        tracing::debug!(rules, "evaluating added rules");
    }

    fn update_equality_manager_started(&self, mode: &str) {
        tracing::debug!(mode, "updating equality manager");
    }

    fn equivalence_class_copied(&self, resource: ResourceId, members: usize) {
        tracing::trace!(resource, members, "equivalence class copied");
    }
}

// ---------------------------------------------------------------------------
// Counting monitor
// ---------------------------------------------------------------------------

/// Counts events, including how often each tuple was reported derived.
#[derive(Debug, Default)]
pub struct CountingMonitor {
    pub tasks: AtomicU64,
    pub levels: AtomicU64,
    pub derived: AtomicU64,
    pub deleted: AtomicU64,
    pub added: AtomicU64,
    pub deleted_rule_evaluations: AtomicU64,
    pub added_rule_evaluations: AtomicU64,
    pub equality_updates: AtomicU64,
    pub classes_copied: AtomicU64,
    per_tuple: DashMap<Triple, AtomicU64>,
    level_order: Mutex<Vec<Option<usize>>>,
}

impl CountingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    /// Highest number of times a single tuple was reported derived.
    pub fn max_derivations_per_tuple(&self) -> u64 {
        self.per_tuple
            .iter()
            .map(|entry| entry.value().load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    /// Levels in the order they were started.
    pub fn started_levels(&self) -> Vec<Option<usize>> {
        self.level_order.lock().expect("monitor lock poisoned").clone()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.tasks,
            &self.levels,
            &self.derived,
            &self.deleted,
            &self.added,
            &self.deleted_rule_evaluations,
            &self.added_rule_evaluations,
            &self.equality_updates,
            &self.classes_copied,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.per_tuple.clear();
        self.level_order.lock().expect("monitor lock poisoned").clear();
    }
}

impl ReasoningMonitor for CountingMonitor {
    fn task_started(&self, _task: &str) {
        self.tasks.fetch_add(1, Ordering::SeqCst);
    }

    fn component_level_started(&self, level: Option<usize>) {
        self.levels.fetch_add(1, Ordering::SeqCst);
        self.level_order
            .lock()
            .expect("monitor lock poisoned")
            .push(level);
    }

    fn tuple_derived(&self, _worker: usize, triple: &Triple) {
        self.derived.fetch_add(1, Ordering::SeqCst);
        self.per_tuple
            .entry(*triple)
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
    }

    fn tuple_deleted(&self, _worker: usize, _triple: &Triple, changed: bool) {
        if changed {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tuple_added(&self, _worker: usize, _triple: &Triple, changed: bool) {
        if changed {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn deleted_rule_evaluation_started(&self, _rules: usize) {
        self.deleted_rule_evaluations.fetch_add(1, Ordering::SeqCst);
    }

    fn added_rule_evaluation_started(&self, _rules: usize) {
        self.added_rule_evaluations.fetch_add(1, Ordering::SeqCst);
    }

    fn update_equality_manager_started(&self, _mode: &str) {
        self.equality_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn equivalence_class_copied(&self, _resource: ResourceId, _members: usize) {
        self.classes_copied.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_monitor_tracks_duplicates() {
        let monitor = CountingMonitor::new();
        let t = Triple::new(3, 4, 5);
        monitor.tuple_derived(0, &t);
        monitor.tuple_derived(1, &Triple::new(3, 4, 6));
        assert_eq!(monitor.max_derivations_per_tuple(), 1);
        monitor.tuple_derived(2, &t);
        assert_eq!(monitor.max_derivations_per_tuple(), 2);
        monitor.tuple_added(0, &t, false);
        monitor.tuple_added(0, &t, true);
        assert_eq!(CountingMonitor::get(&monitor.added), 1);
        monitor.component_level_started(Some(1));
        monitor.component_level_started(Some(2));
        assert_eq!(monitor.started_levels(), vec![Some(1), Some(2)]);
        monitor.reset();
        assert_eq!(CountingMonitor::get(&monitor.derived), 0);
        assert!(monitor.started_levels().is_empty());
    }

    #[test]
    fn concurrent_derivations_are_counted_per_tuple() {
        let monitor = std::sync::Arc::new(CountingMonitor::new());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let monitor = std::sync::Arc::clone(&monitor);
                std::thread::spawn(move || {
                    for object in 0..500 {
                        monitor.tuple_derived(worker, &Triple::new(1, 2, object));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(CountingMonitor::get(&monitor.derived), 2_000);
        assert_eq!(monitor.max_derivations_per_tuple(), 4);
    }
}
