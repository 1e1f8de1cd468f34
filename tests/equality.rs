//! `owl:sameAs` reasoning: classes merge on insertion and are rebuilt from
//! the remaining tuples after deletion, under both deletion strategies.

use std::sync::Arc;

use incremat::config::EngineConfig;
use incremat::engine::Engine;
use incremat::reasoning::{
    CountingMonitor, DeletionStrategy, EqualityMode, Maintenance, ReasoningMonitor,
};
use incremat::rules::RuleSpec;

const STRATEGIES: [DeletionStrategy; 2] = [DeletionStrategy::DRed, DeletionStrategy::Fbf];

fn config(strategy: DeletionStrategy, threads: usize) -> EngineConfig {
    EngineConfig {
        worker_threads: threads,
        equality: EqualityMode::NoUna,
        deletion_strategy: strategy,
        ..Default::default()
    }
}

fn test_engine(strategy: DeletionStrategy) -> Engine {
    Engine::new(config(strategy, 2)).unwrap()
}

fn d_from_a_and_c() -> RuleSpec {
    RuleSpec::new(
        "d-from-a-and-c",
        &[["?X", "rdf:type", "D"]],
        &[["?X", "rdf:type", "A"], ["?X", "rdf:type", "C"]],
        &[],
    )
}

fn load(engine: &Engine, facts: &[[&str; 3]], rules: &[RuleSpec]) {
    for [s, p, o] in facts {
        engine.add_fact(s, p, o).unwrap();
    }
    for rule in rules {
        engine.add_rule(rule).unwrap();
    }
}

#[test]
fn same_as_merges_and_unmerges() {
    for strategy in STRATEGIES {
        let engine = test_engine(strategy);
        load(
            &engine,
            &[
                ["a", "owl:sameAs", "b"],
                ["a", "rdf:type", "A"],
                ["b", "rdf:type", "C"],
            ],
            &[d_from_a_and_c()],
        );

        let summary = engine.apply_rules_incrementally().unwrap();
        assert_eq!(summary.maintenance, Maintenance::NoLevels);
        assert!(engine.are_equal("a", "b"));
        assert!(engine.contains("a", "rdf:type", "D"));
        assert!(engine.contains("b", "rdf:type", "D"));
        assert!(engine.contains("b", "rdf:type", "A"));
        assert_eq!(engine.equivalence_classes().len(), 1);

        assert!(engine.delete_fact("a", "owl:sameAs", "b"));
        engine.apply_rules_incrementally().unwrap();
        assert!(!engine.are_equal("a", "b"), "{strategy}");
        assert!(engine.equivalence_classes().is_empty());
        assert!(!engine.contains("a", "rdf:type", "D"), "{strategy}");
        assert!(!engine.contains("b", "rdf:type", "D"), "{strategy}");
        assert!(engine.contains("a", "rdf:type", "A"));
        assert!(engine.contains("b", "rdf:type", "C"));
        assert!(!engine.contains("b", "rdf:type", "A"));

        engine.add_fact("a", "owl:sameAs", "b").unwrap();
        engine.apply_rules_incrementally().unwrap();
        assert!(engine.are_equal("a", "b"));
        assert!(engine.contains("b", "rdf:type", "D"), "{strategy}");
    }
}

#[test]
fn derived_facts_expand_over_classes() {
    let engine = test_engine(DeletionStrategy::DRed);
    load(
        &engine,
        &[["a", "owl:sameAs", "b"], ["a", "rdf:type", "A"]],
        &[],
    );
    engine.apply_rules_incrementally().unwrap();

    let facts = engine.derived_labels();
    let has = |s: &str, p: &str, o: &str| {
        facts.contains(&[s.to_string(), p.to_string(), o.to_string()])
    };
    assert!(has("a", "rdf:type", "A"));
    assert!(has("b", "rdf:type", "A"));
    assert!(has("a", "owl:sameAs", "b"));
    assert!(has("b", "owl:sameAs", "a"));
}

#[test]
fn class_survives_while_another_same_as_path_remains() {
    for strategy in STRATEGIES {
        let engine = test_engine(strategy);
        load(
            &engine,
            &[
                ["a", "owl:sameAs", "b"],
                ["b", "owl:sameAs", "c"],
                ["a", "owl:sameAs", "c"],
                ["c", "rdf:type", "A"],
            ],
            &[],
        );
        engine.apply_rules_incrementally().unwrap();
        assert!(engine.are_equal("a", "c"));

        engine.delete_fact("a", "owl:sameAs", "b");
        engine.apply_rules_incrementally().unwrap();
        assert!(engine.are_equal("a", "b"), "{strategy}");
        assert!(engine.are_equal("b", "c"), "{strategy}");
        assert!(engine.contains("a", "rdf:type", "A"), "{strategy}");

        engine.delete_fact("b", "owl:sameAs", "c");
        engine.apply_rules_incrementally().unwrap();
        assert!(!engine.are_equal("a", "b"), "{strategy}");
        assert!(engine.are_equal("a", "c"), "{strategy}");
        assert!(engine.contains("a", "rdf:type", "A"));
        assert!(!engine.contains("b", "rdf:type", "A"), "{strategy}");
    }
}

#[test]
fn rules_can_derive_equalities() {
    for strategy in STRATEGIES {
        let engine = test_engine(strategy);
        load(
            &engine,
            &[
                ["alice", "hasMother", "carol"],
                ["alice", "hasMother", "caroline"],
                ["carol", "rdf:type", "Doctor"],
            ],
            &[RuleSpec::new(
                "single-mother",
                &[["?M", "owl:sameAs", "?N"]],
                &[["?X", "hasMother", "?M"], ["?X", "hasMother", "?N"]],
                &[],
            )],
        );
        engine.apply_rules_incrementally().unwrap();
        assert!(engine.are_equal("carol", "caroline"));
        assert!(engine.contains("caroline", "rdf:type", "Doctor"));

        engine.delete_fact("alice", "hasMother", "caroline");
        engine.apply_rules_incrementally().unwrap();
        assert!(!engine.are_equal("carol", "caroline"), "{strategy}");
        assert!(!engine.contains("caroline", "rdf:type", "Doctor"), "{strategy}");
        assert!(engine.contains("carol", "rdf:type", "Doctor"));
    }
}

#[test]
fn strategies_agree_with_recomputation() {
    let facts: &[[&str; 3]] = &[
        ["a", "owl:sameAs", "b"],
        ["b", "owl:sameAs", "c"],
        ["a", "rdf:type", "A"],
        ["c", "rdf:type", "C"],
        ["d", "rdf:type", "C"],
    ];
    let rules = [d_from_a_and_c()];
    let updates: &[(&[[&str; 3]], &[[&str; 3]])] = &[
        (&[["c", "owl:sameAs", "d"]], &[["b", "owl:sameAs", "c"]]),
        (&[["b", "owl:sameAs", "c"]], &[["a", "owl:sameAs", "b"]]),
        (&[], &[["c", "owl:sameAs", "d"], ["a", "rdf:type", "A"]]),
    ];

    let mut results = Vec::new();
    for strategy in STRATEGIES {
        for threads in [1, 3] {
            let engine = Engine::new(config(strategy, threads)).unwrap();
            load(&engine, facts, &rules);
            engine.apply_rules_incrementally().unwrap();
            let mut rounds = vec![engine.derived_labels()];
            for (add, delete) in updates {
                for [s, p, o] in *delete {
                    engine.delete_fact(s, p, o);
                }
                for [s, p, o] in *add {
                    engine.add_fact(s, p, o).unwrap();
                }
                engine.apply_rules_incrementally().unwrap();
                rounds.push(engine.derived_labels());
            }
            results.push(rounds);
        }
    }
    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }

    // The final round against a fresh engine.
    let fresh = test_engine(DeletionStrategy::DRed);
    load(
        &fresh,
        &[
            ["b", "owl:sameAs", "c"],
            ["c", "rdf:type", "C"],
            ["d", "rdf:type", "C"],
        ],
        &rules,
    );
    fresh.apply_rules_incrementally().unwrap();
    assert_eq!(results[0].last(), Some(&fresh.derived_labels()));
}

#[test]
fn equality_updates_are_reported() {
    for strategy in STRATEGIES {
        let monitor = Arc::new(CountingMonitor::new());
        let engine = Engine::with_monitor(
            config(strategy, 2),
            Arc::clone(&monitor) as Arc<dyn ReasoningMonitor>,
        )
        .unwrap();
        load(&engine, &[["a", "owl:sameAs", "b"], ["a", "rdf:type", "A"]], &[]);
        engine.apply_rules_incrementally().unwrap();
        monitor.reset();

        engine.delete_fact("a", "owl:sameAs", "b");
        engine.apply_rules_incrementally().unwrap();
        assert!(CountingMonitor::get(&monitor.equality_updates) >= 1, "{strategy}");
        if strategy == DeletionStrategy::Fbf {
            assert_eq!(CountingMonitor::get(&monitor.classes_copied), 2);
        }
        assert_eq!(monitor.started_levels(), vec![None]);
    }
}

#[test]
fn rematerialization_rebuilds_classes() {
    let engine = test_engine(DeletionStrategy::DRed);
    load(
        &engine,
        &[["a", "owl:sameAs", "b"], ["a", "rdf:type", "A"], ["b", "rdf:type", "C"]],
        &[d_from_a_and_c()],
    );
    engine.apply_rules_incrementally().unwrap();
    let incremental = engine.derived_labels();

    engine.materialize_single_stratum().unwrap();
    assert!(engine.are_equal("a", "b"));
    assert_eq!(engine.derived_labels(), incremental);
}
