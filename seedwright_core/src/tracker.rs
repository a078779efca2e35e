use crate::catalog::{ParamSpec, ResultSpec};
use crate::descriptor::Model;
use crate::graph::DependencyGraph;
use crate::model::{BorrowKind, InstanceId, LifecycleState, ResourceInstance, ResourceTypeId};
use crate::sequence::{Argument, CallInvocation, ExternalInstance};
use crate::validator::{Violation, ViolationKind};
use std::collections::BTreeMap;

/// Cleanup distance assumed for states with no path to a terminal state.
pub const UNREACHABLE_CLEANUP: usize = 1_000;

/// State changes one invocation would cause, computed by
/// [`LifecycleTracker::check`] and applied by [`LifecycleTracker::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    pub transitions: Vec<(InstanceId, LifecycleState)>,
    pub produced: Option<ResourceInstance>,
    pub owner: Option<InstanceId>,
}

/// Instance states, ownership edges and the rules linking them.
///
/// This is the single predicate engine behind both validation (check every
/// invocation in order) and generation (check candidates, commit one).
#[derive(Debug, Clone)]
pub struct LifecycleTracker<'m> {
    model: &'m Model,
    instances: BTreeMap<InstanceId, ResourceInstance>,
    graph: DependencyGraph,
}

impl<'m> LifecycleTracker<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self {
            model,
            instances: BTreeMap::new(),
            graph: DependencyGraph::new(),
        }
    }

    /// Seeds the tracker with instances owned outside the sequence.
    pub fn with_external(model: &'m Model, external: &[ExternalInstance]) -> Result<Self, Violation> {
        let mut tracker = Self::new(model);
        for instance in external {
            let resource = model.registry().lookup(&instance.resource_type).map_err(|e| {
                Violation::new(ViolationKind::ArgumentMismatch, 0, format!("external instance: {e}"))
                    .on(instance.id)
            })?;
            if !resource.has_state(instance.state) {
                return Err(Violation::new(
                    ViolationKind::ArgumentMismatch,
                    0,
                    format!(
                        "external instance {} declares state '{}' unknown to '{}'",
                        instance.id, instance.state, instance.resource_type
                    ),
                )
                .on(instance.id));
            }
            if tracker.instances.contains_key(&instance.id) {
                return Err(Violation::new(
                    ViolationKind::DuplicateInstance,
                    0,
                    format!("external instance {} is declared twice", instance.id),
                )
                .on(instance.id));
            }
            tracker.instances.insert(
                instance.id,
                ResourceInstance {
                    id: instance.id,
                    resource_type: instance.resource_type.clone(),
                    state: instance.state,
                    created_at: None,
                },
            );
            if resource.is_terminal(instance.state) {
                tracker.graph.mark_freed(instance.id);
            }
        }
        Ok(tracker)
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn instance(&self, id: InstanceId) -> Option<&ResourceInstance> {
        self.instances.get(&id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ResourceInstance> {
        self.instances.values()
    }

    pub fn is_terminal(&self, instance: &ResourceInstance) -> bool {
        self.model
            .registry()
            .lookup(&instance.resource_type)
            .is_ok_and(|resource| resource.is_terminal(instance.state))
    }

    /// Instances not yet in a terminal state, external ones included.
    pub fn live_instances(&self) -> impl Iterator<Item = &ResourceInstance> {
        self.instances.values().filter(|instance| !self.is_terminal(instance))
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Smallest id not used by any instance so far.
    pub fn next_instance_id(&self) -> InstanceId {
        self.instances
            .keys()
            .next_back()
            .map_or(InstanceId(0), |last| InstanceId(last.0 + 1))
    }

    /// Computes the effect of `invocation` at position `index` without
    /// changing any state.
    pub fn check(&self, index: usize, invocation: &CallInvocation) -> Result<Effect, Violation> {
        let registry = self.model.registry();
        let Some(spec) = self.model.catalog().get(&invocation.call) else {
            return Err(Violation::new(
                ViolationKind::UnknownCall,
                index,
                format!("call '{}' is not catalogued", invocation.call),
            ));
        };
        if invocation.args.len() != spec.params.len() {
            return Err(Violation::new(
                ViolationKind::ArgumentMismatch,
                index,
                format!(
                    "'{}' takes {} arguments, got {}",
                    spec.id,
                    spec.params.len(),
                    invocation.args.len()
                ),
            ));
        }

        let owner_param = match &spec.result {
            ResultSpec::Instance { owner, .. } => *owner,
            _ => None,
        };
        let mut effect = Effect {
            transitions: Vec::new(),
            produced: None,
            owner: None,
        };
        let mut seen: BTreeMap<InstanceId, BorrowKind> = BTreeMap::new();

        for (position, (param, arg)) in spec.params.iter().zip(&invocation.args).enumerate() {
            let (resource_type, accepts, borrow, id) = match (param, arg) {
                (ParamSpec::Scalar { .. }, Argument::Scalar(_)) => continue,
                (
                    ParamSpec::Resource {
                        resource_type,
                        accepts,
                        borrow,
                    },
                    Argument::Instance(id),
                ) => (resource_type, accepts, *borrow, *id),
                (ParamSpec::Scalar { .. }, Argument::Instance(id)) => {
                    return Err(Violation::new(
                        ViolationKind::ArgumentMismatch,
                        index,
                        format!("argument {position} of '{}' is scalar, got instance {id}", spec.id),
                    )
                    .on(*id));
                }
                (ParamSpec::Resource { .. }, Argument::Scalar(_)) => {
                    return Err(Violation::new(
                        ViolationKind::ArgumentMismatch,
                        index,
                        format!("argument {position} of '{}' must be an instance", spec.id),
                    ));
                }
            };

            let Some(instance) = self.instances.get(&id) else {
                return Err(Violation::new(
                    ViolationKind::UnreachableCall,
                    index,
                    format!("'{}' uses instance {id}, which was never constructed", spec.id),
                )
                .on(id));
            };
            if instance.resource_type != *resource_type {
                return Err(Violation::new(
                    ViolationKind::ArgumentMismatch,
                    index,
                    format!(
                        "argument {position} of '{}' expects '{}', instance {id} is '{}'",
                        spec.id, resource_type, instance.resource_type
                    ),
                )
                .on(id));
            }
            if let Some(previous) = seen.insert(id, borrow) {
                if previous != BorrowKind::Borrows || borrow != BorrowKind::Borrows {
                    return Err(Violation::new(
                        ViolationKind::ArgumentMismatch,
                        index,
                        format!("instance {id} is passed to '{}' more than once", spec.id),
                    )
                    .on(id));
                }
            }

            let resource = registry.lookup(resource_type).map_err(|e| {
                Violation::new(ViolationKind::ArgumentMismatch, index, e.to_string()).on(id)
            })?;
            let state = instance.state;
            let accepted = param.admits(instance);

            // A terminal instance may only take a declared release edge:
            // a self-loop is an idempotent release, any other edge applies.
            let release_edge = (accepted && borrow == BorrowKind::Consumes)
                .then(|| registry.is_legal_transition(resource_type, state, &spec.id))
                .flatten();
            if resource.is_terminal(state) && release_edge == Some(state) {
                continue;
            }
            if resource.is_terminal(state) && release_edge.is_none() {
                let kind = if borrow == BorrowKind::Consumes {
                    ViolationKind::DoubleFree
                } else {
                    ViolationKind::UseAfterFree
                };
                return Err(Violation::new(
                    kind,
                    index,
                    format!("'{}' on instance {id}, which is already {state}", spec.id),
                )
                .on(id));
            }

            if !accepted {
                let current = resource.rank(state);
                let earliest = accepts.iter().filter_map(|s| resource.rank(*s)).min();
                let kind = match (current, earliest) {
                    (Some(current), Some(earliest)) if current < earliest => {
                        ViolationKind::UseBeforeInit
                    }
                    _ => ViolationKind::IllegalTransition,
                };
                return Err(Violation::new(
                    kind,
                    index,
                    format!(
                        "'{}' requires instance {id} in {:?}, but it is {state}",
                        spec.id, accepts
                    ),
                )
                .on(id));
            }

            let next = match borrow {
                BorrowKind::Borrows => state,
                BorrowKind::Mutates | BorrowKind::Consumes => registry
                    .is_legal_transition(resource_type, state, &spec.id)
                    .ok_or_else(|| {
                        Violation::new(
                            ViolationKind::IllegalTransition,
                            index,
                            format!("no transition for '{}' from {state}", spec.id),
                        )
                        .on(id)
                    })?,
            };

            if resource.is_terminal(next) && !self.graph.can_free(id) {
                let live: Vec<String> = self
                    .graph
                    .live_dependents(id)
                    .map(|dependent| dependent.to_string())
                    .collect();
                return Err(Violation::new(
                    ViolationKind::DanglingOwnerFree,
                    index,
                    format!(
                        "'{}' frees instance {id} while dependents {} are live",
                        spec.id,
                        live.join(", ")
                    ),
                )
                .on(id));
            }

            if next != state {
                effect.transitions.push((id, next));
            }
            if owner_param == Some(position) {
                effect.owner = Some(id);
            }
        }

        match (&spec.result, invocation.produces) {
            (ResultSpec::Instance { resource_type, state, .. }, Some(id)) => {
                if self.instances.contains_key(&id) {
                    return Err(Violation::new(
                        ViolationKind::DuplicateInstance,
                        index,
                        format!("'{}' produces instance {id}, which already exists", spec.id),
                    )
                    .on(id));
                }
                effect.produced = Some(ResourceInstance {
                    id,
                    resource_type: resource_type.clone(),
                    state: *state,
                    created_at: Some(index),
                });
            }
            (ResultSpec::Instance { .. }, None) => {
                return Err(Violation::new(
                    ViolationKind::ArgumentMismatch,
                    index,
                    format!("'{}' produces an instance but names no id for it", spec.id),
                ));
            }
            (_, Some(id)) => {
                return Err(Violation::new(
                    ViolationKind::ArgumentMismatch,
                    index,
                    format!("'{}' does not produce an instance", spec.id),
                )
                .on(id));
            }
            (_, None) => {}
        }

        Ok(effect)
    }

    pub fn commit(&mut self, effect: Effect) {
        for (id, state) in effect.transitions {
            let terminal = match self.instances.get_mut(&id) {
                Some(instance) => {
                    instance.state = state;
                    self.model
                        .registry()
                        .lookup(&instance.resource_type)
                        .is_ok_and(|resource| resource.is_terminal(state))
                }
                None => false,
            };
            if terminal {
                self.graph.mark_freed(id);
            }
        }
        if let Some(produced) = effect.produced {
            self.graph.record_construction(produced.id, effect.owner);
            self.instances.insert(produced.id, produced);
        }
    }

    pub fn apply(&mut self, index: usize, invocation: &CallInvocation) -> Result<(), Violation> {
        let effect = self.check(index, invocation)?;
        self.commit(effect);
        Ok(())
    }

    /// Leak check: every instance produced by the sequence must be terminal.
    pub fn finish(&self) -> Result<(), Violation> {
        let leaked = self
            .instances
            .values()
            .filter(|instance| !instance.is_external() && !self.is_terminal(instance))
            .min_by_key(|instance| (instance.created_at, instance.id));
        match leaked {
            Some(instance) => Err(Violation::new(
                ViolationKind::ResourceLeak,
                instance.created_at.unwrap_or_default(),
                format!(
                    "instance {} of '{}' ends in state {}",
                    instance.id, instance.resource_type, instance.state
                ),
            )
            .on(instance.id)),
            None => Ok(()),
        }
    }

    /// Cleanup distance of one state; states that cannot reach a terminal
    /// state count as [`UNREACHABLE_CLEANUP`].
    pub fn cleanup_distance(&self, resource_type: &ResourceTypeId, state: LifecycleState) -> usize {
        self.model
            .registry()
            .cleanup_distance(resource_type, state)
            .unwrap_or(UNREACHABLE_CLEANUP)
    }

    /// Sum of cleanup distances over live, sequence-owned instances.
    pub fn outstanding_cleanup(&self) -> usize {
        self.instances
            .values()
            .filter(|instance| !instance.is_external())
            .map(|instance| self.cleanup_distance(&instance.resource_type, instance.state))
            .fold(0, usize::saturating_add)
    }

    /// Live instances of `resource_type` in one of `states`.
    pub fn live_in<'a>(
        &'a self,
        resource_type: &'a ResourceTypeId,
        states: &'a [LifecycleState],
    ) -> impl Iterator<Item = InstanceId> + 'a {
        self.live_instances()
            .filter(move |instance| {
                instance.resource_type == *resource_type && states.contains(&instance.state)
            })
            .map(|instance| instance.id)
    }

    /// True once the sequence itself has produced an instance of `resource_type`.
    pub fn has_produced(&self, resource_type: &ResourceTypeId) -> bool {
        self.instances
            .values()
            .any(|instance| !instance.is_external() && instance.resource_type == *resource_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LibraryDescriptor;
    use crate::sequence::CallInvocation;

    const DESCRIPTOR: &str = r#"
library = "capture"

[[resource]]
id = "handle"
states = ["created", "activated", "closed"]
terminal = ["closed"]
transitions = [
  { from = "created", call = "activate", to = "activated" },
  { from = "created", call = "close", to = "closed" },
  { from = "activated", call = "close", to = "closed" },
]

[[resource]]
id = "dumper"
states = ["created", "closed"]
terminal = ["closed"]
transitions = [{ from = "created", call = "dump_close", to = "closed" }]

[[call]]
id = "create"
result = { kind = "instance", type = "handle", state = "created" }

[[call]]
id = "activate"
params = [{ kind = "resource", type = "handle", accepts = ["created"], borrow = "mutates" }]

[[call]]
id = "dump_open"
params = [{ kind = "resource", type = "handle", accepts = ["activated"], borrow = "borrows" }]
result = { kind = "instance", type = "dumper", state = "created", owner = 0 }

[[call]]
id = "dump_close"
params = [{ kind = "resource", type = "dumper", accepts = ["created"], borrow = "consumes" }]

[[call]]
id = "close"
params = [{ kind = "resource", type = "handle", accepts = ["created", "activated"], borrow = "consumes" }]
"#;

    fn model() -> Model {
        LibraryDescriptor::from_toml_str(DESCRIPTOR).unwrap().into_model().unwrap()
    }

    #[test]
    fn check_is_pure_and_commit_applies_the_effect() {
        let model = model();
        let mut tracker = LifecycleTracker::new(&model);
        let create = CallInvocation::new("create").producing(0);

        let effect = tracker.check(0, &create).expect("create is legal");
        assert!(tracker.instance(InstanceId(0)).is_none(), "check must not mutate");
        tracker.commit(effect);
        assert_eq!(
            tracker.instance(InstanceId(0)).map(|i| i.state),
            Some(LifecycleState::Created)
        );
        assert_eq!(tracker.next_instance_id(), InstanceId(1));
    }

    #[test]
    fn dumper_borrowing_a_handle_records_an_ownership_edge() {
        let model = model();
        let mut tracker = LifecycleTracker::new(&model);
        tracker.apply(0, &CallInvocation::new("create").producing(0)).unwrap();
        tracker.apply(1, &CallInvocation::new("activate").with_instance(0)).unwrap();
        tracker
            .apply(2, &CallInvocation::new("dump_open").with_instance(0).producing(1))
            .unwrap();

        assert_eq!(tracker.graph().owner_of(InstanceId(1)), Some(InstanceId(0)));
        let premature = tracker.check(3, &CallInvocation::new("close").with_instance(0));
        assert_eq!(
            premature.map_err(|v| v.kind),
            Err(ViolationKind::DanglingOwnerFree)
        );

        tracker.apply(3, &CallInvocation::new("dump_close").with_instance(1)).unwrap();
        tracker.apply(4, &CallInvocation::new("close").with_instance(0)).unwrap();
        assert_eq!(tracker.finish(), Ok(()));
        assert_eq!(tracker.outstanding_cleanup(), 0);
    }

    #[test]
    fn state_gate_agrees_with_catalog_applicability() {
        let model = model();
        let mut tracker = LifecycleTracker::new(&model);
        tracker.apply(0, &CallInvocation::new("create").producing(0)).unwrap();
        for state_changer in [None, Some("activate")] {
            if let Some(call) = state_changer {
                tracker.apply(1, &CallInvocation::new(call).with_instance(0)).unwrap();
            }
            let handle = tracker.instance(InstanceId(0)).unwrap().clone();
            for call in ["activate", "dump_open", "close"] {
                let mut invocation = CallInvocation::new(call).with_instance(0);
                if call == "dump_open" {
                    invocation = invocation.producing(1);
                }
                assert_eq!(
                    tracker.check(2, &invocation).is_ok(),
                    model.catalog().applicable(&crate::model::CallId::new(call), &[&handle]),
                    "{call} on a {} handle",
                    handle.state
                );
            }
        }
    }

    #[test]
    fn outstanding_cleanup_sums_distances_of_live_instances() {
        let model = model();
        let mut tracker = LifecycleTracker::new(&model);
        tracker.apply(0, &CallInvocation::new("create").producing(0)).unwrap();
        tracker.apply(1, &CallInvocation::new("create").producing(1)).unwrap();
        assert_eq!(tracker.outstanding_cleanup(), 2);
        assert_eq!(tracker.live_instances().count(), 2);
    }

    #[test]
    fn external_instances_are_seeded_with_their_declared_state() {
        let model = model();
        let external = [ExternalInstance {
            id: InstanceId(5),
            resource_type: ResourceTypeId::new("handle"),
            state: LifecycleState::Activated,
            host_type: None,
        }];
        let tracker = LifecycleTracker::with_external(&model, &external).unwrap();
        assert!(tracker.instance(InstanceId(5)).is_some_and(|i| i.is_external()));
        assert_eq!(tracker.outstanding_cleanup(), 0);
        assert_eq!(tracker.finish(), Ok(()));
    }
}
