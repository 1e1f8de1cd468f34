//! Equivalence classes of resources induced by `owl:sameAs`.
//!
//! Every class has a representative, its smallest member. Rows stored under
//! the normalized key mention representatives only. Singleton classes are not
//! stored at all.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::resource::{INVALID_RESOURCE_ID, ResourceId};
use crate::table::Triple;

#[derive(Debug, Clone, Default)]
struct Classes {
    /// Member → representative, only for members of non-trivial classes.
    representative: HashMap<ResourceId, ResourceId>,
    /// Representative → sorted members, only for non-trivial classes.
    members: HashMap<ResourceId, Vec<ResourceId>>,
    /// Representatives withdrawn ahead of a class split.
    unrepresented: HashSet<ResourceId>,
}

impl Classes {
    fn representative(&self, resource: ResourceId) -> ResourceId {
        self.representative.get(&resource).copied().unwrap_or(resource)
    }

    fn members(&self, resource: ResourceId) -> Vec<ResourceId> {
        let rep = self.representative(resource);
        self.members.get(&rep).cloned().unwrap_or_else(|| vec![resource])
    }

    /// Remove `resource` from its class, leaving it a singleton.
    fn detach(&mut self, resource: ResourceId) {
        let rep = self.representative(resource);
        let Some(mut members) = self.members.remove(&rep) else {
            return;
        };
        members.retain(|&m| m != resource);
        self.representative.remove(&resource);
        self.unrepresented.remove(&resource);
        match members.len() {
            0 => {}
            1 => {
                self.representative.remove(&members[0]);
            }
            _ => {
                let new_rep = members[0];
                for &m in &members {
                    self.representative.insert(m, new_rep);
                }
                self.members.insert(new_rep, members);
            }
        }
    }
}

/// Representative-tracking equality manager.
#[derive(Debug, Default)]
pub struct EqualityManager {
    classes: RwLock<Classes>,
}

impl EqualityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent copy of the current classes.
    pub fn snapshot(&self) -> Self {
        Self {
            classes: RwLock::new(self.read().clone()),
        }
    }

    /// Forget every class.
    pub fn clear(&self) {
        *self.write() = Classes::default();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Classes> {
        self.classes.read().expect("equality lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Classes> {
        self.classes.write().expect("equality lock poisoned")
    }

    pub fn representative(&self, resource: ResourceId) -> ResourceId {
        self.read().representative(resource)
    }

    /// Replace every resource of `triple` by its representative. The flag
    /// reports whether anything changed.
    pub fn normalize(&self, triple: &Triple) -> (Triple, bool) {
        let classes = self.read();
        let normalized = triple.map(|r| classes.representative(r));
        (normalized, normalized != *triple)
    }

    /// Merge the classes of `a` and `b`. Returns `(kept, merged)`
    /// representatives, or `None` if they were already equal.
    pub fn merge(&self, a: ResourceId, b: ResourceId) -> Option<(ResourceId, ResourceId)> {
        let mut classes = self.write();
        let ra = classes.representative(a);
        let rb = classes.representative(b);
        if ra == rb {
            return None;
        }
        let (kept, merged) = if ra < rb { (ra, rb) } else { (rb, ra) };
        let mut members = classes.members.remove(&kept).unwrap_or_else(|| vec![kept]);
        let absorbed = classes.members.remove(&merged).unwrap_or_else(|| vec![merged]);
        members.extend(absorbed);
        members.sort_unstable();
        for &m in &members {
            classes.representative.insert(m, kept);
        }
        classes.members.insert(kept, members);
        classes.unrepresented.remove(&merged);
        Some((kept, merged))
    }

    /// Withdraw `resource`'s representative without changing membership.
    /// True if it was represented.
    pub fn unrepresent(&self, resource: ResourceId) -> bool {
        let mut classes = self.write();
        let rep = classes.representative(resource);
        classes.unrepresented.insert(rep)
    }

    /// False once the representative of `resource`'s class was withdrawn.
    pub fn is_represented(&self, resource: ResourceId) -> bool {
        let classes = self.read();
        !classes.unrepresented.contains(&classes.representative(resource))
    }

    /// Split `resource`'s class into singletons; returns the former members.
    pub fn break_equals(&self, resource: ResourceId) -> Vec<ResourceId> {
        let mut classes = self.write();
        let rep = classes.representative(resource);
        classes.unrepresented.remove(&rep);
        match classes.members.remove(&rep) {
            Some(members) => {
                for m in &members {
                    classes.representative.remove(m);
                }
                members
            }
            None => vec![resource],
        }
    }

    /// Make `resource`'s class equal to its class in `from`.
    pub fn copy_equivalence_class(&self, resource: ResourceId, from: &EqualityManager) {
        let (target, target_rep) = {
            let source = from.read();
            (source.members(resource), source.representative(resource))
        };
        let mut classes = self.write();
        for &m in &target {
            classes.detach(m);
        }
        if target.len() > 1 {
            for &m in &target {
                classes.representative.insert(m, target_rep);
            }
            classes.members.insert(target_rep, target);
        }
    }

    /// Next member of `resource`'s class in ascending order, or
    /// [`INVALID_RESOURCE_ID`] after the last one.
    pub fn next_equal(&self, resource: ResourceId) -> ResourceId {
        let classes = self.read();
        let rep = classes.representative(resource);
        classes
            .members
            .get(&rep)
            .and_then(|members| members.iter().find(|&&m| m > resource).copied())
            .unwrap_or(INVALID_RESOURCE_ID)
    }

    /// Members of `resource`'s class, ascending.
    pub fn class_members(&self, resource: ResourceId) -> Vec<ResourceId> {
        self.read().members(resource)
    }

    pub fn class_size(&self, resource: ResourceId) -> usize {
        let classes = self.read();
        let rep = classes.representative(resource);
        classes.members.get(&rep).map_or(1, Vec::len)
    }

    /// Every triple that normalizes to the same row as `triple`.
    pub fn expand(&self, triple: &Triple) -> Vec<Triple> {
        let classes = self.read();
        let positions: Vec<Vec<ResourceId>> =
            triple.as_array().iter().map(|&r| classes.members(r)).collect();
        let mut out = Vec::with_capacity(positions.iter().map(Vec::len).product());
        for &s in &positions[0] {
            for &p in &positions[1] {
                for &o in &positions[2] {
                    out.push(Triple::new(s, p, o));
                }
            }
        }
        out
    }

    /// Representatives of the non-trivial classes `triple` mentions.
    pub fn nontrivial_classes(&self, triple: &Triple) -> Vec<ResourceId> {
        let classes = self.read();
        let mut reps: Vec<ResourceId> = triple
            .as_array()
            .iter()
            .map(|&r| classes.representative(r))
            .filter(|rep| classes.members.contains_key(rep))
            .collect();
        reps.sort_unstable();
        reps.dedup();
        reps
    }

    /// Non-trivial classes as `(representative, members)`, ascending.
    pub fn classes(&self) -> Vec<(ResourceId, Vec<ResourceId>)> {
        let classes = self.read();
        let mut out: Vec<_> = classes
            .members
            .iter()
            .map(|(rep, members)| (*rep, members.clone()))
            .collect();
        out.sort_unstable();
        out
    }
}
