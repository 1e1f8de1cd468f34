// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # incremat
//!
//! Incremental maintenance of a Datalog materialization over an RDF triple
//! table.
//!
//! ## Architecture
//!
//! - **Reasoning** (`reasoning`): worker pool, per-round state and the DRed /
//!   FBF phases that move the materialization from one set of explicit facts
//!   and rules to the next
//! - **Tuple table** (`table`): triples with EDB/IDB status bits
//! - **Rules** (`rules`): rule index, stratification and body matching
//! - **Equality** (`equality`): `owl:sameAs` equivalence classes
//! - **Programs** (`program`): TOML files driving the CLI
//!
//! ## Library usage
//!
//! ```no_run
//! use incremat::config::EngineConfig;
//! use incremat::engine::Engine;
//! use incremat::rules::RuleSpec;
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! engine.add_fact("alice", "rdf:type", "A").unwrap();
//! engine
//!     .add_rule(&RuleSpec::new(
//!         "b-from-a",
//!         &[["?X", "rdf:type", "B"]],
//!         &[["?X", "rdf:type", "A"]],
//!         &[],
//!     ))
//!     .unwrap();
//! engine.apply_rules_incrementally().unwrap();
//! assert!(engine.contains("alice", "rdf:type", "B"));
//! ```

pub mod config;
pub mod engine;
pub mod equality;
pub mod error;
pub mod program;
pub mod reasoning;
pub mod resource;
pub mod rules;
pub mod table;
