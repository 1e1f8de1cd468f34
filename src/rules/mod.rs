//! Rules: atoms over triples, compiled rule handles, and the rule index.
//!
//! A [`Rule`] is the validated, dictionary-encoded form of a [`RuleSpec`].
//! The [`RuleIndex`](index::RuleIndex) stratifies the active rules and hands
//! out [`RuleInfo`] handles tagged with component levels.

pub mod index;
pub mod matcher;
pub mod stratify;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::resource::{Dictionary, ResourceId};
use crate::table::Triple;

pub use index::{RuleIndex, RuleSet};
pub use matcher::{Bindings, Matcher, Seed};
pub use stratify::{AtomKey, Stratification, UnstratifiedComponent};

/// Stable identifier of a rule inside a [`RuleIndex`].
pub type RuleId = u32;

// ---------------------------------------------------------------------------
// Terms and atoms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    /// Variable, numbered within its rule.
    Var(u16),
    Const(ResourceId),
}

/// Triple pattern `(subject, predicate, object)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Atom {
    pub terms: [Term; 3],
}

impl Atom {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            terms: [subject, predicate, object],
        }
    }

    pub fn variables(&self) -> impl Iterator<Item = u16> + '_ {
        self.terms.iter().filter_map(|t| match t {
            Term::Var(v) => Some(*v),
            Term::Const(_) => None,
        })
    }

    pub fn constants(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.terms.iter().filter_map(|t| match t {
            Term::Const(c) => Some(*c),
            Term::Var(_) => None,
        })
    }

    /// True if some triple could match both atoms' constant positions.
    pub fn may_match(&self, triple: &Triple) -> bool {
        self.terms.iter().enumerate().all(|(i, t)| match t {
            Term::Const(c) => *c == triple.get(i),
            Term::Var(_) => true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    Positive(Atom),
    Negative(Atom),
    /// Aggregate over an atom; evaluated by an external component.
    Aggregate(Atom),
}

impl Literal {
    pub fn atom(&self) -> &Atom {
        match self {
            Literal::Positive(a) | Literal::Negative(a) | Literal::Aggregate(a) => a,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// A validated rule `head₁, …, headₙ :- body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub head: Vec<Atom>,
    pub body: Vec<Literal>,
    /// Variable names, indexed by [`Term::Var`].
    pub variables: Vec<String>,
}

impl Rule {
    /// Build a rule, checking that it is safe: every head variable and every
    /// variable of a negated or aggregate atom occurs in a positive body atom.
    pub fn new(
        name: impl Into<String>,
        head: Vec<Atom>,
        body: Vec<Literal>,
        variables: Vec<String>,
    ) -> Result<Self, RuleError> {
        let rule = Self {
            name: name.into(),
            head,
            body,
            variables,
        };
        if rule.head.is_empty() {
            return Err(RuleError::EmptyHead { rule: rule.name });
        }
        let bound: BTreeSet<u16> = rule
            .body
            .iter()
            .filter_map(|l| match l {
                Literal::Positive(a) => Some(a),
                _ => None,
            })
            .flat_map(|a| a.variables())
            .collect();
        for atom in &rule.head {
            if let Some(v) = atom.variables().find(|v| !bound.contains(v)) {
                return Err(RuleError::UnsafeHeadVariable {
                    variable: rule.variable_name(v),
                    rule: rule.name,
                });
            }
        }
        for literal in &rule.body {
            if matches!(literal, Literal::Positive(_)) {
                continue;
            }
            if let Some(v) = literal.atom().variables().find(|v| !bound.contains(v)) {
                return Err(RuleError::UnsafeNegatedVariable {
                    variable: rule.variable_name(v),
                    rule: rule.name,
                });
            }
        }
        Ok(rule)
    }

    /// Encode a [`RuleSpec`], interning its constants in `dictionary`.
    pub fn from_spec(spec: &RuleSpec, dictionary: &Dictionary) -> Result<Self, RuleError> {
        let mut variables: Vec<String> = Vec::new();
        let mut encode = |atom: &[String; 3]| -> Result<Atom, RuleError> {
            let mut terms = [Term::Const(0); 3];
            for (slot, text) in terms.iter_mut().zip(atom.iter()) {
                let text = text.trim();
                *slot = match text.strip_prefix('?') {
                    Some("") => {
                        return Err(RuleError::MalformedTerm {
                            rule: spec.name.clone(),
                            term: text.to_string(),
                        });
                    }
                    Some(name) => {
                        let index = match variables.iter().position(|v| v == name) {
                            Some(i) => i,
                            None => {
                                variables.push(name.to_string());
                                variables.len() - 1
                            }
                        };
                        Term::Var(index as u16)
                    }
                    None if text.is_empty() => {
                        return Err(RuleError::MalformedTerm {
                            rule: spec.name.clone(),
                            term: text.to_string(),
                        });
                    }
                    None => Term::Const(dictionary.intern(text)),
                };
            }
            Ok(Atom { terms })
        };

        let mut body = Vec::new();
        for atom in &spec.body {
            body.push(Literal::Positive(encode(atom)?));
        }
        for atom in &spec.negated {
            body.push(Literal::Negative(encode(atom)?));
        }
        for atom in &spec.aggregate {
            body.push(Literal::Aggregate(encode(atom)?));
        }
        let head = spec.head.iter().map(&mut encode).collect::<Result<Vec<_>, _>>()?;
        Rule::new(spec.name.clone(), head, body, variables)
    }

    /// Decode back into labels.
    pub fn to_spec(&self, dictionary: &Dictionary) -> RuleSpec {
        let decode = |atom: &Atom| -> [String; 3] {
            atom.terms.map(|t| match t {
                Term::Var(v) => format!("?{}", self.variable_name(v)),
                Term::Const(c) => dictionary.display(c),
            })
        };
        let mut spec = RuleSpec {
            name: self.name.clone(),
            head: self.head.iter().map(decode).collect(),
            ..Default::default()
        };
        for literal in &self.body {
            match literal {
                Literal::Positive(a) => spec.body.push(decode(a)),
                Literal::Negative(a) => spec.negated.push(decode(a)),
                Literal::Aggregate(a) => spec.aggregate.push(decode(a)),
            }
        }
        spec
    }

    pub fn variable_name(&self, variable: u16) -> String {
        self.variables
            .get(variable as usize)
            .cloned()
            .unwrap_or_else(|| format!("v{variable}"))
    }

    pub fn has_negation(&self) -> bool {
        self.body.iter().any(|l| matches!(l, Literal::Negative(_)))
    }

    pub fn has_aggregation(&self) -> bool {
        self.body.iter().any(|l| matches!(l, Literal::Aggregate(_)))
    }

    /// Every constant mentioned anywhere in the rule.
    pub fn constants(&self) -> BTreeSet<ResourceId> {
        self.head
            .iter()
            .chain(self.body.iter().map(Literal::atom))
            .flat_map(|a| a.constants())
            .collect()
    }
}

/// Label-level rule description, as found in program files.
///
/// Terms starting with `?` are variables; every other term is a resource
/// label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub head: Vec<[String; 3]>,
    #[serde(default)]
    pub body: Vec<[String; 3]>,
    #[serde(default)]
    pub negated: Vec<[String; 3]>,
    #[serde(default)]
    pub aggregate: Vec<[String; 3]>,
}

impl RuleSpec {
    /// Convenience constructor for positive and negated bodies.
    pub fn new(
        name: &str,
        head: &[[&str; 3]],
        body: &[[&str; 3]],
        negated: &[[&str; 3]],
    ) -> Self {
        let own = |atoms: &[[&str; 3]]| atoms.iter().map(|a| a.map(str::to_string)).collect();
        Self {
            name: name.to_string(),
            head: own(head),
            body: own(body),
            negated: own(negated),
            aggregate: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled handles
// ---------------------------------------------------------------------------

/// A body atom tagged with the component level of the atoms it can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLiteral {
    pub atom: Atom,
    pub level: usize,
    pub negated: bool,
}

/// A head atom tagged with its component level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadAtomInfo {
    pub atom: Atom,
    pub component_level: usize,
}

/// A rule compiled against one stratification.
#[derive(Debug, Clone)]
pub struct RuleInfo {
    pub id: RuleId,
    pub rule: std::sync::Arc<Rule>,
    pub positive: Vec<BodyLiteral>,
    pub negative: Vec<BodyLiteral>,
    pub aggregates: Vec<BodyLiteral>,
    pub heads: Vec<HeadAtomInfo>,
    pub constants: BTreeSet<ResourceId>,
}

impl RuleInfo {
    pub fn name(&self) -> &str {
        &self.rule.name
    }

    pub fn variable_count(&self) -> usize {
        self.rule.variables.len()
    }

    /// Head atoms to fire at `level`; all of them when `level` is `None`.
    pub fn heads_at(&self, level: Option<usize>) -> impl Iterator<Item = &HeadAtomInfo> {
        self.heads
            .iter()
            .filter(move |h| level.is_none_or(|l| h.component_level == l))
    }

    pub fn has_head_at(&self, level: Option<usize>) -> bool {
        self.heads_at(level).next().is_some()
    }
}
