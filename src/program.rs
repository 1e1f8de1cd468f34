//! Program files: facts, rules and a sequence of update steps in TOML.
//!
//! ```toml
//! facts = [["alice", "rdf:type", "A"]]
//!
//! [engine]
//! worker_threads = 4
//! deletion_strategy = "fbf"
//!
//! [[rules]]
//! name = "b-from-a"
//! head = [["?X", "rdf:type", "B"]]
//! body = [["?X", "rdf:type", "A"]]
//!
//! [[steps]]
//! delete = [["alice", "rdf:type", "A"]]
//! ```
//!
//! Running a program applies the initial facts and rules in one round, then
//! each step in its own round.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigFile;
use crate::engine::Engine;
use crate::error::{ConfigError, ReasonerResult};
use crate::reasoning::{DeletionStrategy, RoundSummary};
use crate::rules::RuleSpec;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub engine: ConfigFile,
    #[serde(default)]
    pub facts: Vec<[String; 3]>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One batch of changes applied in a single round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub add: Vec<[String; 3]>,
    #[serde(default)]
    pub delete: Vec<[String; 3]>,
    #[serde(default)]
    pub add_rules: Vec<RuleSpec>,
    /// Names of rules to remove.
    #[serde(default)]
    pub remove_rules: Vec<String>,
    /// Overrides the engine's deletion strategy for this round.
    #[serde(default)]
    pub strategy: Option<DeletionStrategy>,
    /// Rebuild from the explicit facts instead of maintaining incrementally.
    #[serde(default)]
    pub rematerialize: bool,
}

/// Outcome of one round of a program run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub summary: RoundSummary,
    pub facts: Vec<[String; 3]>,
}

impl Program {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ConfigRead {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse program text; `origin` names the source in errors.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ConfigParse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Build an engine from the `[engine]` table, optionally forcing a
    /// deletion strategy.
    pub fn engine(&self, strategy: Option<DeletionStrategy>) -> ReasonerResult<Engine> {
        let mut config = self.engine.to_engine_config()?;
        if let Some(strategy) = strategy {
            config.deletion_strategy = strategy;
        }
        Engine::new(config)
    }

    /// Run the program on `engine`, returning one report per round.
    pub fn run(&self, engine: &Engine) -> ReasonerResult<Vec<StepReport>> {
        let initial = Step {
            name: Some("initial".into()),
            add: self.facts.clone(),
            add_rules: self.rules.clone(),
            ..Step::default()
        };
        let mut reports = Vec::with_capacity(self.steps.len() + 1);
        reports.push(initial.apply(engine, "initial")?);
        for (i, step) in self.steps.iter().enumerate() {
            let fallback = format!("step {}", i + 1);
            reports.push(step.apply(engine, &fallback)?);
        }
        Ok(reports)
    }
}

impl Step {
    fn apply(&self, engine: &Engine, fallback: &str) -> ReasonerResult<StepReport> {
        let name = self.name.clone().unwrap_or_else(|| fallback.to_string());
        let _span = tracing::info_span!("step", name = %name).entered();

        for [s, p, o] in &self.delete {
            if !engine.delete_fact(s, p, o) {
                tracing::warn!(fact = %format!("{s} {p} {o}"), "deleted fact was not explicit");
            }
        }
        for [s, p, o] in &self.add {
            engine.add_fact(s, p, o)?;
        }
        for rule_name in &self.remove_rules {
            let id = engine
                .rules()
                .into_iter()
                .find(|(_, spec)| &spec.name == rule_name)
                .map(|(id, _)| id)
                .ok_or_else(|| ConfigError::InvalidConfig {
                    message: format!("step '{name}' removes unknown rule '{rule_name}'"),
                })?;
            engine.remove_rule(id)?;
        }
        for spec in &self.add_rules {
            engine.add_rule(spec)?;
        }

        let summary = if self.rematerialize {
            engine.materialize_single_stratum()?
        } else {
            match (self.strategy, engine.config().equality) {
                (None, _) => engine.apply_rules_incrementally()?,
                (Some(strategy), crate::reasoning::EqualityMode::Off) => {
                    engine.apply_rules_incrementally_by_levels(strategy)?
                }
                (Some(strategy), crate::reasoning::EqualityMode::NoUna) => {
                    engine.apply_rules_incrementally_no_levels(strategy)?
                }
            }
        };
        Ok(StepReport {
            name,
            summary,
            facts: engine.derived_labels(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"
facts = [["a", "rdf:type", "A"], ["b", "rdf:type", "A"]]

[engine]
worker_threads = 2

[[rules]]
name = "b-from-a"
head = [["?X", "rdf:type", "B"]]
body = [["?X", "rdf:type", "A"]]

[[steps]]
name = "drop a"
delete = [["a", "rdf:type", "A"]]

[[steps]]
strategy = "fbf"
remove_rules = ["b-from-a"]
"#;

    fn fact(s: &str, p: &str, o: &str) -> [String; 3] {
        [s.to_string(), p.to_string(), o.to_string()]
    }

    #[test]
    fn parses_steps_and_defaults() {
        let program = Program::parse(PROGRAM, "inline").unwrap();
        assert_eq!(program.facts.len(), 2);
        assert_eq!(program.rules[0].name, "b-from-a");
        assert_eq!(program.steps.len(), 2);
        assert_eq!(program.steps[1].strategy, Some(DeletionStrategy::Fbf));
        assert_eq!(program.engine.worker_threads, 2);
    }

    #[test]
    fn runs_every_step() {
        let program = Program::parse(PROGRAM, "inline").unwrap();
        let engine = program.engine(None).unwrap();
        let reports = program.run(&engine).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].name, "initial");
        assert!(reports[0].facts.contains(&fact("a", "rdf:type", "B")));
        assert_eq!(reports[1].name, "drop a");
        assert!(!reports[1].facts.contains(&fact("a", "rdf:type", "B")));
        assert!(reports[1].facts.contains(&fact("b", "rdf:type", "B")));
        assert_eq!(reports[2].name, "step 2");
        assert_eq!(reports[2].facts, vec![fact("b", "rdf:type", "A")]);
    }

    #[test]
    fn removing_unknown_rule_is_reported() {
        let program = Program::parse(
            "[[steps]]\nremove_rules = [\"missing\"]\n",
            "inline",
        )
        .unwrap();
        let engine = Engine::new(crate::config::EngineConfig {
            worker_threads: 1,
            ..Default::default()
        })
        .unwrap();
        let err = program.run(&engine).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn malformed_program_is_a_parse_error() {
        assert!(matches!(
            Program::parse("facts = 3", "inline"),
            Err(ConfigError::ConfigParse { .. })
        ));
    }
}
