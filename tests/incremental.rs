//! End-to-end incremental maintenance without equality reasoning.
//!
//! These tests drive the engine through rounds of fact and rule changes and
//! check the materialization against a from-scratch computation, across
//! deletion strategies and thread counts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use incremat::config::EngineConfig;
use incremat::engine::Engine;
use incremat::error::{ConfigError, ReasonerError, TaskError};
use incremat::reasoning::{
    CountingMonitor, DeletionStrategy, EqualityMode, Maintenance, ReasoningMonitor,
};
use incremat::rules::RuleSpec;

type Fact = [&'static str; 3];

fn config(threads: usize, strategy: DeletionStrategy) -> EngineConfig {
    EngineConfig {
        worker_threads: threads,
        deletion_strategy: strategy,
        ..Default::default()
    }
}

fn test_engine(threads: usize, strategy: DeletionStrategy) -> Engine {
    Engine::new(config(threads, strategy)).unwrap()
}

fn labels(facts: &[Fact]) -> Vec<[String; 3]> {
    let mut out: Vec<[String; 3]> = facts.iter().map(|f| f.map(str::to_string)).collect();
    out.sort();
    out
}

fn b_from_a() -> RuleSpec {
    RuleSpec::new("b-from-a", &[["?X", "rdf:type", "B"]], &[["?X", "rdf:type", "A"]], &[])
}

fn path_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec::new("path-base", &[["?X", "path", "?Y"]], &[["?X", "edge", "?Y"]], &[]),
        RuleSpec::new(
            "path-step",
            &[["?X", "path", "?Z"]],
            &[["?X", "path", "?Y"], ["?Y", "edge", "?Z"]],
            &[],
        ),
    ]
}

fn acyclic_rule() -> RuleSpec {
    RuleSpec::new(
        "acyclic",
        &[["?X", "rdf:type", "Acyclic"]],
        &[["?X", "rdf:type", "Node"]],
        &[["?X", "path", "?X"]],
    )
}

/// One round of explicit changes.
struct Round {
    add: &'static [Fact],
    delete: &'static [Fact],
}

const GRAPH: &[Fact] = &[
    ["a", "edge", "b"],
    ["b", "edge", "c"],
    ["c", "edge", "a"],
    ["c", "edge", "d"],
    ["d", "edge", "e"],
    ["a", "rdf:type", "Node"],
    ["b", "rdf:type", "Node"],
    ["c", "rdf:type", "Node"],
    ["d", "rdf:type", "Node"],
    ["e", "rdf:type", "Node"],
];

const UPDATES: &[Round] = &[
    Round {
        add: &[],
        delete: &[["b", "edge", "c"]],
    },
    Round {
        add: &[["b", "edge", "c"]],
        delete: &[["c", "edge", "a"]],
    },
    Round {
        add: &[["e", "edge", "a"], ["c", "edge", "a"]],
        delete: &[["d", "edge", "e"]],
    },
    Round {
        add: &[["d", "edge", "e"], ["a", "edge", "b"]],
        delete: &[["a", "edge", "b"], ["c", "edge", "d"]],
    },
];

fn load(engine: &Engine, facts: &[Fact], rules: &[RuleSpec]) {
    for [s, p, o] in facts {
        engine.add_fact(s, p, o).unwrap();
    }
    for rule in rules {
        engine.add_rule(rule).unwrap();
    }
}

/// Materialization of `facts` under `rules` computed in a single round.
fn from_scratch(facts: &BTreeSet<Fact>, rules: &[RuleSpec]) -> Vec<[String; 3]> {
    let engine = test_engine(1, DeletionStrategy::DRed);
    let facts: Vec<Fact> = facts.iter().copied().collect();
    load(&engine, &facts, rules);
    engine.apply_rules_incrementally().unwrap();
    engine.derived_labels()
}

/// Run the graph workload, checking every round against a fresh engine.
fn check_workload(threads: usize, strategy: DeletionStrategy, rules: &[RuleSpec]) {
    let engine = test_engine(threads, strategy);
    load(&engine, GRAPH, rules);
    engine.apply_rules_incrementally().unwrap();

    let mut explicit: BTreeSet<Fact> = GRAPH.iter().copied().collect();
    assert_eq!(engine.derived_labels(), from_scratch(&explicit, rules));

    for (i, round) in UPDATES.iter().enumerate() {
        // A deletion followed by an addition of the same fact cancels out.
        for fact in round.delete {
            engine.delete_fact(fact[0], fact[1], fact[2]);
            explicit.remove(fact);
        }
        for fact in round.add {
            engine.add_fact(fact[0], fact[1], fact[2]).unwrap();
            explicit.insert(*fact);
        }
        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.strategy, Some(strategy));
        assert_eq!(
            engine.derived_labels(),
            from_scratch(&explicit, rules),
            "round {} with {strategy} on {threads} thread(s)",
            i + 1
        );
    }
}

// ---------------------------------------------------------------------------
// Basic scenario
// ---------------------------------------------------------------------------

#[test]
fn derived_fact_follows_its_premise() {
    for (strategy, threads) in [DeletionStrategy::DRed, DeletionStrategy::Fbf]
        .into_iter()
        .flat_map(|strategy| [1, 4].map(|threads| (strategy, threads)))
    {
        let engine = test_engine(threads, strategy);
        load(&engine, &[["a", "rdf:type", "A"], ["b", "rdf:type", "A"]], &[b_from_a()]);

        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.maintenance, Maintenance::ByLevels);
        assert_eq!(summary.passes, 2);
        assert_eq!(summary.added, 4);
        assert!(engine.contains("a", "rdf:type", "B"));
        assert!(engine.contains("b", "rdf:type", "B"));

        assert!(engine.delete_fact("a", "rdf:type", "A"));
        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.deleted, 2, "{strategy} on {threads} threads");
        assert_eq!(summary.added, 0);
        assert!(!engine.contains("a", "rdf:type", "A"));
        assert!(!engine.contains("a", "rdf:type", "B"));
        assert!(engine.contains("b", "rdf:type", "B"));

        engine.add_fact("a", "rdf:type", "A").unwrap();
        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.added, 2);
        assert!(engine.contains("a", "rdf:type", "B"));
    }
}

#[test]
fn explicit_fact_with_a_derivation_survives_its_deletion() {
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        let engine = test_engine(2, strategy);
        load(&engine, &[["a", "rdf:type", "A"], ["a", "rdf:type", "B"]], &[b_from_a()]);
        engine.apply_rules_incrementally().unwrap();

        engine.delete_fact("a", "rdf:type", "B");
        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.deleted, 0, "{strategy}");
        assert!(engine.contains("a", "rdf:type", "B"));
        assert_eq!(engine.explicit_facts().len(), 1);
    }
}

#[test]
fn no_op_round_changes_nothing() {
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        let engine = test_engine(3, strategy);
        load(&engine, GRAPH, &path_rules());
        engine.apply_rules_incrementally().unwrap();
        let before = engine.derived_labels();

        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.added, 0);
        assert_eq!(summary.passes, 1);
        assert_eq!(engine.derived_labels(), before);
    }
}

#[test]
fn delete_then_add_in_one_round_cancels() {
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        let engine = test_engine(2, strategy);
        load(&engine, GRAPH, &path_rules());
        engine.apply_rules_incrementally().unwrap();
        let before = engine.derived_labels();

        assert!(engine.delete_fact("a", "edge", "b"));
        engine.add_fact("a", "edge", "b").unwrap();
        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.added, 0);
        assert_eq!(engine.derived_labels(), before);
    }
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[test]
fn dred_matches_recomputation_on_one_thread() {
    check_workload(1, DeletionStrategy::DRed, &path_rules());
}

#[test]
fn dred_matches_recomputation_on_many_threads() {
    check_workload(4, DeletionStrategy::DRed, &path_rules());
}

#[test]
fn fbf_matches_recomputation_on_one_thread() {
    check_workload(1, DeletionStrategy::Fbf, &path_rules());
}

#[test]
fn fbf_matches_recomputation_on_many_threads() {
    check_workload(4, DeletionStrategy::Fbf, &path_rules());
}

#[test]
fn stratified_negation_matches_recomputation() {
    let mut rules = path_rules();
    rules.push(acyclic_rule());
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        for threads in [1, 3] {
            check_workload(threads, strategy, &rules);
        }
    }
}

#[test]
fn rematerialization_agrees_with_incremental_state() {
    let engine = test_engine(2, DeletionStrategy::DRed);
    load(&engine, GRAPH, &path_rules());
    engine.apply_rules_incrementally().unwrap();
    engine.delete_fact("c", "edge", "a");
    engine.apply_rules_incrementally().unwrap();
    let incremental = engine.derived_labels();

    let summary = engine.materialize_single_stratum().unwrap();
    assert_eq!(summary.maintenance, Maintenance::SingleStratum);
    assert_eq!(summary.strategy, None);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.added, 0);
    assert_eq!(engine.derived_labels(), incremental);
}

#[test]
fn rematerialization_applies_scheduled_changes() {
    let engine = test_engine(2, DeletionStrategy::DRed);
    load(&engine, &[["a", "rdf:type", "A"]], &[b_from_a()]);
    engine.apply_rules_incrementally().unwrap();

    engine.delete_fact("a", "rdf:type", "A");
    engine.add_fact("c", "rdf:type", "A").unwrap();
    let summary = engine.materialize_single_stratum().unwrap();
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.added, 2);
    assert_eq!(
        engine.derived_labels(),
        labels(&[["c", "rdf:type", "A"], ["c", "rdf:type", "B"]])
    );
}

// ---------------------------------------------------------------------------
// Negation
// ---------------------------------------------------------------------------

#[test]
fn negated_premise_toggles_the_conclusion() {
    let rules = [
        RuleSpec::new("b-from-d", &[["?X", "rdf:type", "B"]], &[["?X", "rdf:type", "D"]], &[]),
        RuleSpec::new(
            "c-unless-b",
            &[["?X", "rdf:type", "C"]],
            &[["?X", "rdf:type", "A"]],
            &[["?X", "rdf:type", "B"]],
        ),
    ];
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        let engine = test_engine(2, strategy);
        load(
            &engine,
            &[["a", "rdf:type", "A"], ["b", "rdf:type", "A"], ["b", "rdf:type", "D"]],
            &rules,
        );
        engine.apply_rules_incrementally().unwrap();
        assert!(engine.contains("a", "rdf:type", "C"));
        assert!(!engine.contains("b", "rdf:type", "C"));

        engine.add_fact("a", "rdf:type", "D").unwrap();
        engine.delete_fact("b", "rdf:type", "D");
        engine.apply_rules_incrementally().unwrap();
        assert!(!engine.contains("a", "rdf:type", "C"), "{strategy}");
        assert!(engine.contains("b", "rdf:type", "C"), "{strategy}");
        assert!(!engine.contains("b", "rdf:type", "B"));
    }
}

// ---------------------------------------------------------------------------
// Rule changes
// ---------------------------------------------------------------------------

#[test]
fn added_rule_is_evaluated_in_a_second_pass() {
    let monitor = Arc::new(CountingMonitor::new());
    let engine = Engine::with_monitor(
        config(2, DeletionStrategy::DRed),
        Arc::clone(&monitor) as Arc<dyn ReasoningMonitor>,
    )
    .unwrap();
    load(&engine, GRAPH, &[]);
    engine.apply_rules_incrementally().unwrap();
    assert_eq!(CountingMonitor::get(&monitor.added_rule_evaluations), 0);

    for rule in path_rules() {
        engine.add_rule(&rule).unwrap();
    }
    let summary = engine.apply_rules_incrementally().unwrap();
    assert_eq!(summary.passes, 2);
    assert!(summary.added > 0);
    assert_eq!(CountingMonitor::get(&monitor.added_rule_evaluations), 1);
    assert!(engine.contains("a", "path", "a"));
    assert!(engine.contains("a", "path", "e"));
}

#[test]
fn removed_rule_takes_its_conclusions_along() {
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        let monitor = Arc::new(CountingMonitor::new());
        let engine = Engine::with_monitor(
            config(2, strategy),
            Arc::clone(&monitor) as Arc<dyn ReasoningMonitor>,
        )
        .unwrap();
        let rules = path_rules();
        load(&engine, GRAPH, &rules);
        engine.apply_rules_incrementally().unwrap();

        let (step_id, _) = engine
            .rules()
            .into_iter()
            .find(|(_, spec)| spec.name == "path-step")
            .unwrap();
        engine.remove_rule(step_id).unwrap();
        engine.apply_rules_incrementally().unwrap();
        assert_eq!(CountingMonitor::get(&monitor.deleted_rule_evaluations), 1);

        let explicit: BTreeSet<Fact> = GRAPH.iter().copied().collect();
        assert_eq!(
            engine.derived_labels(),
            from_scratch(&explicit, &rules[..1]),
            "{strategy}"
        );
        assert!(engine.contains("a", "path", "b"));
        assert!(!engine.contains("a", "path", "c"));
    }
}

#[test]
fn rules_survive_a_save_load_cycle() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("rules.bin");

    let original = test_engine(1, DeletionStrategy::DRed);
    let mut rules = path_rules();
    rules.push(acyclic_rule());
    load(&original, GRAPH, &rules);
    original.apply_rules_incrementally().unwrap();
    original.save_rules(&path).unwrap();

    let restored = test_engine(2, DeletionStrategy::Fbf);
    load(&restored, GRAPH, &[]);
    let ids = restored.load_rules(&path).unwrap();
    assert_eq!(ids.len(), 3);
    restored.apply_rules_incrementally().unwrap();
    assert_eq!(restored.derived_labels(), original.derived_labels());
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[test]
fn every_tuple_is_derived_at_most_once_per_round() {
    for strategy in [DeletionStrategy::DRed, DeletionStrategy::Fbf] {
        let monitor = Arc::new(CountingMonitor::new());
        let engine = Engine::with_monitor(
            config(4, strategy),
            Arc::clone(&monitor) as Arc<dyn ReasoningMonitor>,
        )
        .unwrap();
        let mut rules = path_rules();
        rules.push(acyclic_rule());
        load(&engine, GRAPH, &[]);
        for rule in &rules {
            engine.add_rule(rule).unwrap();
        }
        engine.apply_rules_incrementally().unwrap();

        for round in UPDATES {
            monitor.reset();
            for fact in round.add {
                engine.add_fact(fact[0], fact[1], fact[2]).unwrap();
            }
            for fact in round.delete {
                engine.delete_fact(fact[0], fact[1], fact[2]);
            }
            engine.apply_rules_incrementally().unwrap();
            assert!(monitor.max_derivations_per_tuple() <= 1, "{strategy}");
        }
    }
}

#[test]
fn levels_are_processed_in_ascending_order() {
    let monitor = Arc::new(CountingMonitor::new());
    let engine = Engine::with_monitor(
        config(2, DeletionStrategy::DRed),
        Arc::clone(&monitor) as Arc<dyn ReasoningMonitor>,
    )
    .unwrap();
    let mut rules = path_rules();
    rules.push(acyclic_rule());
    load(&engine, GRAPH, &rules);
    engine.apply_rules_incrementally().unwrap();

    monitor.reset();
    engine.delete_fact("c", "edge", "a");
    let summary = engine.apply_rules_incrementally().unwrap();

    let started = monitor.started_levels();
    assert!(started.len() >= 2);
    assert!(started.windows(2).all(|w| w[0] < w[1]));

    let markers = &summary.level_markers;
    assert_eq!(markers.len(), started.len());
    assert_eq!(engine.last_level_markers(), *markers);
    for pair in markers.windows(2) {
        assert!(pair[0].level < pair[1].level);
        assert!(pair[0].delete_end <= pair[1].delete_end);
        assert!(pair[0].add_end <= pair[1].add_end);
        assert!(pair[0].proved_end <= pair[1].proved_end);
    }
    assert!(engine.contains("a", "rdf:type", "Acyclic"));
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn unstratified_program_is_rejected_with_its_rules() {
    let engine = test_engine(1, DeletionStrategy::DRed);
    engine
        .add_rule(&RuleSpec::new(
            "self-defeating",
            &[["?X", "rdf:type", "C"]],
            &[["?X", "rdf:type", "A"]],
            &[["?X", "rdf:type", "C"]],
        ))
        .unwrap();
    let err = engine.apply_rules_incrementally().unwrap_err();
    match err {
        ReasonerError::Config(ConfigError::NotStratified { components }) => {
            assert!(components.contains("self-defeating"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(engine.rule_levels().is_err());
}

#[test]
fn aggregation_is_not_maintained_incrementally() {
    let engine = test_engine(1, DeletionStrategy::DRed);
    engine
        .add_rule(&RuleSpec {
            name: "scored".into(),
            head: vec![["?X", "rdf:type", "Scored"].map(str::to_string)],
            body: vec![["?X", "rdf:type", "A"].map(str::to_string)],
            aggregate: vec![["?X", "score", "high"].map(str::to_string)],
            ..Default::default()
        })
        .unwrap();
    assert!(matches!(
        engine.apply_rules_incrementally(),
        Err(ReasonerError::Config(ConfigError::IncrementalWithAggregation))
    ));
    assert!(matches!(
        engine.materialize_single_stratum(),
        Err(ReasonerError::Config(ConfigError::SingleStratumUnsupported))
    ));
}

#[test]
fn negation_cannot_be_rematerialized_in_one_stratum() {
    let engine = test_engine(1, DeletionStrategy::DRed);
    engine.add_rule(&acyclic_rule()).unwrap();
    assert!(matches!(
        engine.materialize_single_stratum(),
        Err(ReasonerError::Config(ConfigError::SingleStratumUnsupported))
    ));
    assert!(matches!(
        engine.apply_rules_incrementally_no_levels(DeletionStrategy::DRed),
        Err(ReasonerError::Config(ConfigError::NegationWithoutLevels))
    ));
}

#[test]
fn aborted_round_can_be_recovered_by_rematerializing() {
    const NODES: usize = 300;
    let monitor = Arc::new(CountingMonitor::new());
    let engine = Engine::with_monitor(
        config(4, DeletionStrategy::DRed),
        Arc::clone(&monitor) as Arc<dyn ReasoningMonitor>,
    )
    .unwrap();
    for i in 0..NODES {
        engine
            .add_fact(&format!("n{i}"), "edge", &format!("n{}", i + 1))
            .unwrap();
    }
    for rule in path_rules() {
        engine.add_rule(&rule).unwrap();
    }

    let finished = AtomicBool::new(false);
    let result = std::thread::scope(|scope| {
        scope.spawn(|| {
            while CountingMonitor::get(&monitor.tasks) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            while !finished.load(Ordering::SeqCst) {
                engine.abort();
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let result = engine.apply_rules_incrementally();
        finished.store(true, Ordering::SeqCst);
        result
    });
    assert!(
        matches!(result, Err(ReasonerError::Task(TaskError::Aborted))),
        "round was not aborted: {result:?}"
    );

    engine.materialize_single_stratum().unwrap();
    let paths = NODES * (NODES + 1) / 2;
    assert_eq!(engine.derived_facts().len(), NODES + paths);
    assert!(engine.contains("n0", "path", &format!("n{NODES}")));
}

#[test]
fn level_maintenance_requires_equality_off() {
    let engine = Engine::new(EngineConfig {
        worker_threads: 1,
        equality: EqualityMode::NoUna,
        ..Default::default()
    })
    .unwrap();
    assert!(matches!(
        engine.apply_rules_incrementally_by_levels(DeletionStrategy::DRed),
        Err(ReasonerError::Config(ConfigError::InvalidConfig { .. }))
    ));
}
