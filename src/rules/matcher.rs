//! Nested-loop rule body matcher.
//!
//! The matcher knows nothing about rounds or flags. Callers pass a
//! visibility predicate deciding which stored rows count as true for each
//! body literal, and a visitor receiving every satisfying instance.

use std::ops::ControlFlow;

use crate::equality::EqualityManager;
use crate::resource::{INVALID_RESOURCE_ID, ResourceId};
use crate::table::{Pattern, Triple, TupleIndex, TupleStatus, TupleTable};

use super::{Atom, BodyLiteral, RuleInfo, Term};

/// Variable bindings of one rule instance; unbound variables hold
/// [`INVALID_RESOURCE_ID`].
pub type Bindings = Vec<ResourceId>;

/// Where evaluation starts.
#[derive(Debug, Clone, Copy)]
pub enum Seed {
    /// Enumerate every instance.
    None,
    /// Positive body literal `literal` is matched by `tuple`.
    Positive {
        literal: usize,
        tuple: TupleIndex,
        triple: Triple,
    },
    /// Negated body literal `literal` is instantiated to `triple`.
    Negative { literal: usize, triple: Triple },
    /// Head atom `head` is instantiated to `triple`.
    Head { head: usize, triple: Triple },
}

pub struct Matcher<'a> {
    table: &'a dyn TupleTable,
    equality: Option<&'a EqualityManager>,
}

impl<'a> Matcher<'a> {
    /// With `equality`, rule constants are replaced by their class
    /// representatives before matching.
    pub fn new(table: &'a dyn TupleTable, equality: Option<&'a EqualityManager>) -> Self {
        Self { table, equality }
    }

    fn constant(&self, resource: ResourceId) -> ResourceId {
        self.equality
            .map_or(resource, |eq| eq.representative(resource))
    }

    /// Ground `atom` under `bindings`. Unbound variables stay invalid.
    pub fn instantiate(&self, atom: &Atom, bindings: &[ResourceId]) -> Triple {
        Triple::from_array(atom.terms.map(|t| match t {
            Term::Var(v) => bindings
                .get(v as usize)
                .copied()
                .unwrap_or(INVALID_RESOURCE_ID),
            Term::Const(c) => self.constant(c),
        }))
    }

    /// Bind the variables of `atom` against `triple`; false on conflict.
    fn unify(&self, atom: &Atom, triple: &Triple, bindings: &mut Bindings) -> bool {
        for (position, term) in atom.terms.iter().enumerate() {
            let value = triple.get(position);
            match *term {
                Term::Const(c) => {
                    if self.constant(c) != value {
                        return false;
                    }
                }
                Term::Var(v) => {
                    let slot = &mut bindings[v as usize];
                    if *slot == INVALID_RESOURCE_ID {
                        *slot = value;
                    } else if *slot != value {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn pattern(&self, atom: &Atom, bindings: &[ResourceId]) -> Pattern {
        let triple = self.instantiate(atom, bindings);
        Pattern(triple.as_array().map(|r| (r != INVALID_RESOURCE_ID).then_some(r)))
    }

    /// Enumerate the instances of `info`'s body consistent with `seed`.
    ///
    /// `visible` decides whether a stored row counts as true for a literal;
    /// a negated literal holds when its instance is absent or not visible.
    /// `visit` receives the bindings and the tuple index of every positive
    /// literal, in body order.
    pub fn evaluate<V, F>(&self, info: &RuleInfo, seed: Seed, visible: V, mut visit: F) -> ControlFlow<()>
    where
        V: Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool,
        F: FnMut(&[ResourceId], &[TupleIndex]) -> ControlFlow<()>,
    {
        let mut bindings = vec![INVALID_RESOURCE_ID; info.variable_count()];
        let mut body = vec![crate::table::INVALID_TUPLE_INDEX; info.positive.len()];
        let mut skip = None;
        let bound = match seed {
            Seed::None => true,
            Seed::Positive {
                literal,
                tuple,
                triple,
            } => match info.positive.get(literal) {
                Some(lit) => {
                    skip = Some(literal);
                    body[literal] = tuple;
                    self.unify(&lit.atom, &triple, &mut bindings)
                }
                None => false,
            },
            Seed::Negative { literal, triple } => info
                .negative
                .get(literal)
                .is_some_and(|lit| self.unify(&lit.atom, &triple, &mut bindings)),
            Seed::Head { head, triple } => info
                .heads
                .get(head)
                .is_some_and(|h| self.unify(&h.atom, &triple, &mut bindings)),
        };
        if !bound {
            return ControlFlow::Continue(());
        }
        self.extend(info, 0, skip, &mut bindings, &mut body, &visible, &mut visit)
    }

    #[allow(clippy::too_many_arguments)]
    fn extend<V, F>(
        &self,
        info: &RuleInfo,
        position: usize,
        skip: Option<usize>,
        bindings: &mut Bindings,
        body: &mut [TupleIndex],
        visible: &V,
        visit: &mut F,
    ) -> ControlFlow<()>
    where
        V: Fn(&BodyLiteral, TupleIndex, TupleStatus) -> bool,
        F: FnMut(&[ResourceId], &[TupleIndex]) -> ControlFlow<()>,
    {
        if position == info.positive.len() {
            let negations_hold = info.negative.iter().all(|lit| {
                let instance = self.instantiate(&lit.atom, bindings);
                match self.table.tuple_index(&instance) {
                    Some(index) => !visible(lit, index, self.table.status(index)),
                    None => true,
                }
            });
            if negations_hold {
                return visit(bindings.as_slice(), body);
            }
            return ControlFlow::Continue(());
        }
        if skip == Some(position) {
            return self.extend(info, position + 1, skip, bindings, body, visible, visit);
        }

        let literal = &info.positive[position];
        let saved = bindings.clone();
        for index in self.table.matching(&self.pattern(&literal.atom, bindings)) {
            let Some((triple, status)) = self.table.status_and_tuple(index) else {
                continue;
            };
            if !visible(literal, index, status) {
                continue;
            }
            if self.unify(&literal.atom, &triple, bindings) {
                body[position] = index;
                self.extend(info, position + 1, skip, bindings, body, visible, visit)?;
            }
            bindings.copy_from_slice(&saved);
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::resource::Dictionary;
    use crate::rules::{Rule, RuleSet, RuleSpec};
    use crate::table::{MemoryTripleTable, TUPLE_STATUS_EDB};

    fn compile(dict: &Dictionary, spec: RuleSpec) -> Arc<RuleInfo> {
        let mut rules = BTreeMap::new();
        rules.insert(0, Arc::new(Rule::from_spec(&spec, dict).unwrap()));
        Arc::clone(RuleSet::compile(&rules).rule(0).unwrap())
    }

    fn explicit(_: &BodyLiteral, _: TupleIndex, status: TupleStatus) -> bool {
        status & TUPLE_STATUS_EDB != 0
    }

    fn heads(matcher: &Matcher<'_>, info: &RuleInfo, seed: Seed) -> Vec<Triple> {
        let mut out = Vec::new();
        let _ = matcher.evaluate(info, seed, explicit, |bindings, _| {
            out.push(matcher.instantiate(&info.heads[0].atom, bindings));
            ControlFlow::Continue(())
        });
        out.sort();
        out
    }

    #[test]
    fn joins_and_negation() {
        let dict = Dictionary::new();
        let table = MemoryTripleTable::new();
        let [a, b, c, edge, blocked] = ["a", "b", "c", "edge", "blocked"].map(|l| dict.intern(l));
        for t in [
            Triple::new(a, edge, b),
            Triple::new(b, edge, c),
            Triple::new(b, blocked, b),
        ] {
            table.add_tuple(&t, 0, TUPLE_STATUS_EDB).unwrap();
        }
        let info = compile(
            &dict,
            RuleSpec::new(
                "two-hop",
                &[["?X", "reach2", "?Z"]],
                &[["?X", "edge", "?Y"], ["?Y", "edge", "?Z"]],
                &[["?X", "blocked", "?X"]],
            ),
        );
        let matcher = Matcher::new(&table, None);
        let reach2 = dict.lookup("reach2").unwrap();
        assert_eq!(heads(&matcher, &info, Seed::None), vec![Triple::new(a, reach2, c)]);

        // Block `a` by adding a row that is not yet visible: still derivable.
        table.add_tuple(&Triple::new(a, blocked, a), 0, 0).unwrap();
        assert_eq!(heads(&matcher, &info, Seed::None).len(), 1);
        table.add_tuple(&Triple::new(a, blocked, a), 0, TUPLE_STATUS_EDB).unwrap();
        assert!(heads(&matcher, &info, Seed::None).is_empty());
    }

    #[test]
    fn seeds_restrict_the_search() {
        let dict = Dictionary::new();
        let table = MemoryTripleTable::new();
        let [a, b, c, edge] = ["a", "b", "c", "edge"].map(|l| dict.intern(l));
        let (_, ab) = table.add_tuple(&Triple::new(a, edge, b), 0, TUPLE_STATUS_EDB).unwrap();
        table.add_tuple(&Triple::new(b, edge, c), 0, TUPLE_STATUS_EDB).unwrap();
        table.add_tuple(&Triple::new(c, edge, a), 0, TUPLE_STATUS_EDB).unwrap();
        let info = compile(
            &dict,
            RuleSpec::new(
                "two-hop",
                &[["?X", "reach2", "?Z"]],
                &[["?X", "edge", "?Y"], ["?Y", "edge", "?Z"]],
                &[],
            ),
        );
        let matcher = Matcher::new(&table, None);
        let reach2 = dict.lookup("reach2").unwrap();
        assert_eq!(heads(&matcher, &info, Seed::None).len(), 3);

        let seeded = heads(
            &matcher,
            &info,
            Seed::Positive {
                literal: 0,
                tuple: ab,
                triple: Triple::new(a, edge, b),
            },
        );
        assert_eq!(seeded, vec![Triple::new(a, reach2, c)]);

        let by_head = heads(
            &matcher,
            &info,
            Seed::Head {
                head: 0,
                triple: Triple::new(b, reach2, a),
            },
        );
        assert_eq!(by_head, vec![Triple::new(b, reach2, a)]);
        assert!(heads(
            &matcher,
            &info,
            Seed::Head {
                head: 0,
                triple: Triple::new(a, reach2, a),
            },
        )
        .is_empty());
    }

    #[test]
    fn repeated_variables_must_agree() {
        let dict = Dictionary::new();
        let table = MemoryTripleTable::new();
        let [a, b, knows] = ["a", "b", "knows"].map(|l| dict.intern(l));
        table.add_tuple(&Triple::new(a, knows, a), 0, TUPLE_STATUS_EDB).unwrap();
        table.add_tuple(&Triple::new(a, knows, b), 0, TUPLE_STATUS_EDB).unwrap();
        let info = compile(
            &dict,
            RuleSpec::new("self", &[["?X", "rdf:type", "Narcissist"]], &[["?X", "knows", "?X"]], &[]),
        );
        let matcher = Matcher::new(&table, None);
        let found = heads(&matcher, &info, Seed::None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].subject, a);
    }

    #[test]
    fn constants_are_normalized_under_equality() {
        let dict = Dictionary::new();
        let table = MemoryTripleTable::new();
        let [alias, canonical, likes, x] = ["alias", "canonical", "likes", "x"].map(|l| dict.intern(l));
        let equality = EqualityManager::new();
        equality.merge(alias, canonical);
        assert_eq!(equality.representative(canonical), alias);
        table.add_tuple(&Triple::new(x, likes, alias), 0, TUPLE_STATUS_EDB).unwrap();
        let spec = RuleSpec::new(
            "fan",
            &[["?X", "rdf:type", "Fan"]],
            &[["?X", "likes", "canonical"]],
            &[],
        );
        let info = compile(&dict, spec);
        assert!(heads(&Matcher::new(&table, None), &info, Seed::None).is_empty());
        assert_eq!(heads(&Matcher::new(&table, Some(&equality)), &info, Seed::None).len(), 1);
    }
}
