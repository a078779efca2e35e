use crate::model::InstanceId;
use std::collections::{BTreeMap, BTreeSet};

/// Directed dependency: `dependent` must reach a terminal state before `owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OwnershipEdge {
    pub dependent: InstanceId,
    pub owner: InstanceId,
}

/// Ownership edges between the instances of one sequence.
///
/// Edges are only added from a brand-new dependent to an already existing
/// owner, so the graph is acyclic by construction order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Owner -> dependents.
    dependents: BTreeMap<InstanceId, BTreeSet<InstanceId>>,
    owners: BTreeMap<InstanceId, InstanceId>,
    freed: BTreeSet<InstanceId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly produced instance and, when its producer borrowed an
    /// owner, the edge bounding its lifetime.
    pub fn record_construction(&mut self, new_instance: InstanceId, borrowed_from: Option<InstanceId>) {
        if let Some(owner) = borrowed_from {
            self.dependents.entry(owner).or_default().insert(new_instance);
            self.owners.insert(new_instance, owner);
        }
    }

    pub fn mark_freed(&mut self, instance: InstanceId) {
        self.freed.insert(instance);
    }

    pub fn is_freed(&self, instance: InstanceId) -> bool {
        self.freed.contains(&instance)
    }

    /// False while any dependent of `instance` has not been freed.
    pub fn can_free(&self, instance: InstanceId) -> bool {
        self.live_dependents(instance).next().is_none()
    }

    pub fn dependents_of(&self, instance: InstanceId) -> BTreeSet<InstanceId> {
        self.dependents.get(&instance).cloned().unwrap_or_default()
    }

    pub fn live_dependents(&self, instance: InstanceId) -> impl Iterator<Item = InstanceId> + '_ {
        self.dependents
            .get(&instance)
            .into_iter()
            .flatten()
            .copied()
            .filter(|dependent| !self.freed.contains(dependent))
    }

    pub fn owner_of(&self, instance: InstanceId) -> Option<InstanceId> {
        self.owners.get(&instance).copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = OwnershipEdge> + '_ {
        self.owners.iter().map(|(dependent, owner)| OwnershipEdge {
            dependent: *dependent,
            owner: *owner,
        })
    }
}
