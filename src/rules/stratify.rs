//! Predicate dependency graph and component levels.
//!
//! Atoms are grouped by the tuples they can match: one group per predicate,
//! one per `rdf:type` class, with a variable predicate collapsing everything
//! into a single group. Rules add edges from body groups to head groups;
//! strongly connected components of that graph are the stratification
//! components, ordered into levels.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::resource::{RDF_TYPE, ResourceId};
use crate::table::Triple;

use super::{Atom, Literal, Rule, RuleId, Term};

/// Which tuples an atom can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AtomKey {
    /// Fixed predicate other than a class membership.
    Predicate(ResourceId),
    /// `rdf:type` with a constant class.
    Class(ResourceId),
    /// Variable predicate.
    Any,
}

impl AtomKey {
    pub fn of(atom: &Atom) -> Self {
        match (atom.terms[1], atom.terms[2]) {
            (Term::Const(RDF_TYPE), Term::Const(class)) => AtomKey::Class(class),
            (Term::Const(p), _) => AtomKey::Predicate(p),
            (Term::Var(_), _) => AtomKey::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dependency {
    Positive,
    Negative,
    Aggregate,
}

/// A component whose cycle goes through negation or aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstratifiedComponent {
    pub keys: Vec<AtomKey>,
    pub rules: Vec<String>,
}

/// Component levels computed for one rule set.
#[derive(Debug, Clone, Default)]
pub struct Stratification {
    group_of: HashMap<AtomKey, usize>,
    level_of_group: Vec<usize>,
    max_level: usize,
    unstratified: Vec<UnstratifiedComponent>,
}

/// Minimal union-find over key slots.
struct Groups {
    parent: Vec<usize>,
}

impl Groups {
    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

impl Stratification {
    pub fn compute<'a>(rules: impl IntoIterator<Item = (RuleId, &'a Rule)>) -> Self {
        let rules: Vec<(RuleId, &Rule)> = rules.into_iter().collect();

        // Every key mentioned by some atom, in a stable order.
        let keys: Vec<AtomKey> = rules
            .iter()
            .flat_map(|(_, r)| r.head.iter().chain(r.body.iter().map(Literal::atom)))
            .map(AtomKey::of)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let slot: HashMap<AtomKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        let mut groups = Groups {
            parent: (0..keys.len()).collect(),
        };
        if let Some(&any) = slot.get(&AtomKey::Any) {
            for i in 0..keys.len() {
                groups.union(any, i);
            }
        }
        if let Some(&typed) = slot.get(&AtomKey::Predicate(RDF_TYPE)) {
            for (i, key) in keys.iter().enumerate() {
                if matches!(key, AtomKey::Class(_)) {
                    groups.union(typed, i);
                }
            }
        }

        // Dense group numbering doubles as node index.
        let mut root_to_group: BTreeMap<usize, usize> = BTreeMap::new();
        let mut group_of = HashMap::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let root = groups.find(i);
            let next = root_to_group.len();
            let group = *root_to_group.entry(root).or_insert(next);
            group_of.insert(*key, group);
        }
        let group_count = root_to_group.len();

        let mut graph: DiGraph<usize, (Dependency, usize)> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..group_count).map(|g| graph.add_node(g)).collect();
        for (position, (_, rule)) in rules.iter().enumerate() {
            for head in &rule.head {
                let to = nodes[group_of[&AtomKey::of(head)]];
                for literal in &rule.body {
                    let from = nodes[group_of[&AtomKey::of(literal.atom())]];
                    let kind = match literal {
                        Literal::Positive(_) => Dependency::Positive,
                        Literal::Negative(_) => Dependency::Negative,
                        Literal::Aggregate(_) => Dependency::Aggregate,
                    };
                    graph.add_edge(from, to, (kind, position));
                }
            }
        }

        // tarjan_scc yields components in reverse topological order.
        let components = tarjan_scc(&graph);
        let mut component_of = vec![0usize; group_count];
        for (c, members) in components.iter().enumerate() {
            for node in members {
                component_of[graph[*node]] = c;
            }
        }

        let mut component_level = vec![0usize; components.len()];
        let mut unstratified = Vec::new();
        for c in (0..components.len()).rev() {
            let mut level = 0;
            let mut offending: BTreeSet<usize> = BTreeSet::new();
            for node in &components[c] {
                for edge in graph.edges_directed(*node, petgraph::Direction::Incoming) {
                    let source = component_of[graph[edge.source()]];
                    let (kind, rule) = *edge.weight();
                    if source == c {
                        if kind != Dependency::Positive {
                            offending.insert(rule);
                        }
                    } else {
                        level = level.max(component_level[source] + 1);
                    }
                }
            }
            component_level[c] = level;
            if !offending.is_empty() {
                let mut member_keys: Vec<AtomKey> = keys
                    .iter()
                    .filter(|k| {
                        components[c]
                            .iter()
                            .any(|n| graph[*n] == group_of[*k])
                    })
                    .copied()
                    .collect();
                member_keys.sort();
                unstratified.push(UnstratifiedComponent {
                    keys: member_keys,
                    rules: offending.iter().map(|&r| rules[r].1.name.clone()).collect(),
                });
            }
        }

        let level_of_group: Vec<usize> = (0..group_count)
            .map(|g| component_level[component_of[g]])
            .collect();
        let max_level = level_of_group.iter().copied().max().unwrap_or(0);
        Self {
            group_of,
            level_of_group,
            max_level,
            unstratified,
        }
    }

    /// Component level of the tuples `atom` can match.
    pub fn atom_level(&self, atom: &Atom) -> usize {
        self.key_level(AtomKey::of(atom)).unwrap_or(0)
    }

    fn key_level(&self, key: AtomKey) -> Option<usize> {
        self.group_of.get(&key).map(|&g| self.level_of_group[g])
    }

    /// Component level of a stored tuple; 0 for tuples no rule mentions.
    pub fn tuple_level(&self, triple: &Triple) -> usize {
        let class = (triple.predicate == RDF_TYPE).then_some(AtomKey::Class(triple.object));
        class
            .into_iter()
            .chain([AtomKey::Predicate(triple.predicate), AtomKey::Any])
            .find_map(|k| self.key_level(k))
            .unwrap_or(0)
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn is_stratified(&self) -> bool {
        self.unstratified.is_empty()
    }

    pub fn unstratified_components(&self) -> &[UnstratifiedComponent] {
        &self.unstratified
    }
}
