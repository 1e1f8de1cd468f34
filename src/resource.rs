//! Resource identifiers and the label dictionary.
//!
//! Every RDF term the engine sees is interned into a [`ResourceId`]. The
//! [`Dictionary`] is the only place that knows labels; everything below it
//! (tuple table, equality manager, rules) works on raw ids.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Dense identifier of an interned resource.
pub type ResourceId = u64;

/// Reserved sentinel: never assigned to a resource.
pub const INVALID_RESOURCE_ID: ResourceId = 0;

/// `rdf:type`, pre-interned so rule stratification can recognise class atoms.
pub const RDF_TYPE: ResourceId = 1;

/// `owl:sameAs`, pre-interned so equality reasoning can recognise merges.
pub const OWL_SAME_AS: ResourceId = 2;

const FIRST_USER_RESOURCE: ResourceId = 3;

/// Labels of the pre-interned resources, with accepted aliases.
const WELL_KNOWN: &[(&str, ResourceId)] = &[
    ("rdf:type", RDF_TYPE),
    ("http://www.w3.org/1999/02/22-rdf-syntax-ns#type", RDF_TYPE),
    ("owl:sameAs", OWL_SAME_AS),
    ("http://www.w3.org/2002/07/owl#sameAs", OWL_SAME_AS),
];

/// Thread-safe bidirectional label ↔ id map.
///
/// Ids are allocated monotonically and never reused.
#[derive(Debug)]
pub struct Dictionary {
    by_label: DashMap<String, ResourceId>,
    by_id: DashMap<ResourceId, String>,
    next: AtomicU64,
}

impl Dictionary {
    /// Create a dictionary holding only the well-known resources.
    pub fn new() -> Self {
        let dict = Self {
            by_label: DashMap::new(),
            by_id: DashMap::new(),
            next: AtomicU64::new(FIRST_USER_RESOURCE),
        };
        for (label, id) in WELL_KNOWN {
            dict.by_label.insert((*label).to_string(), *id);
            dict.by_id.entry(*id).or_insert_with(|| (*label).to_string());
        }
        dict
    }

    /// Return the id for `label`, allocating one if the label is new.
    pub fn intern(&self, label: &str) -> ResourceId {
        if let Some(id) = self.by_label.get(label) {
            return *id.value();
        }
        let entry = self.by_label.entry(label.to_string()).or_insert_with(|| {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            self.by_id.insert(id, label.to_string());
            id
        });
        *entry.value()
    }

    /// Look up an existing label without allocating.
    pub fn lookup(&self, label: &str) -> Option<ResourceId> {
        self.by_label.get(label).map(|id| *id.value())
    }

    /// The canonical label of `id`.
    pub fn label(&self, id: ResourceId) -> Option<String> {
        self.by_id.get(&id).map(|l| l.value().clone())
    }

    /// Label of `id`, or `#<id>` when the id was never interned here.
    pub fn display(&self, id: ResourceId) -> String {
        self.label(id).unwrap_or_else(|| format!("#{id}"))
    }

    /// Number of distinct resources (aliases count once).
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}
