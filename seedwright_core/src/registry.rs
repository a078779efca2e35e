use crate::model::{CallId, LifecycleState, ResourceFamily, ResourceTypeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;

/// Errors raised while building the resource registry. All of them are
/// fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Resource type '{0}' is already registered")]
    DuplicateType(ResourceTypeId),

    #[error("Resource type '{0}' is not registered")]
    UnknownType(ResourceTypeId),

    /// A call or transition references a (type, state) combination the
    /// transition table does not cover, or annotates it inconsistently.
    #[error("Incomplete spec for call '{call}' on '{resource_type}' in state '{state}': {reason}")]
    IncompleteSpec {
        call: CallId,
        resource_type: ResourceTypeId,
        state: LifecycleState,
        reason: String,
    },
}

/// One labelled edge of a resource state machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Transition {
    pub from: LifecycleState,
    pub call: CallId,
    pub to: LifecycleState,
}

/// Static definition of a resource type and its state machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    #[serde(default)]
    pub family: ResourceFamily,
    /// Host-language type used when declaring a handle, e.g. `z_stream *`.
    #[serde(default = "default_host_type")]
    pub host_type: String,
    /// States in lifecycle order.
    pub states: Vec<LifecycleState>,
    pub terminal: Vec<LifecycleState>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

fn default_host_type() -> String {
    "void *".to_string()
}

impl ResourceType {
    pub fn is_terminal(&self, state: LifecycleState) -> bool {
        self.terminal.contains(&state)
    }

    pub fn has_state(&self, state: LifecycleState) -> bool {
        self.states.contains(&state)
    }

    /// Position of `state` in this type's lifecycle, if the type uses it.
    pub fn rank(&self, state: LifecycleState) -> Option<usize> {
        self.states.iter().position(|s| *s == state)
    }

    /// Short lowercase stem used for emitted variable names.
    pub fn variable_stem(&self) -> String {
        variable_stem(&self.id)
    }
}

pub fn variable_stem(id: &ResourceTypeId) -> String {
    id.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

struct RegisteredType {
    spec: ResourceType,
    table: HashMap<(LifecycleState, CallId), LifecycleState>,
    cleanup_distance: HashMap<LifecycleState, usize>,
}

/// Authoritative source of resource type definitions.
///
/// Read-only once the model is assembled; shared by reference between
/// generators and validators on any number of threads.
#[derive(Default)]
pub struct ResourceRegistry {
    types: BTreeMap<ResourceTypeId, RegisteredType>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource type. Transitions must stay within the declared
    /// states and terminal states must be declared states.
    pub fn register(&mut self, spec: ResourceType) -> Result<(), RegistryError> {
        if self.types.contains_key(&spec.id) {
            return Err(RegistryError::DuplicateType(spec.id));
        }

        for terminal in &spec.terminal {
            if !spec.has_state(*terminal) {
                return Err(RegistryError::IncompleteSpec {
                    call: CallId::new("<terminal>"),
                    resource_type: spec.id.clone(),
                    state: *terminal,
                    reason: "terminal state is not a declared state".to_string(),
                });
            }
        }

        let mut table = HashMap::new();
        for transition in &spec.transitions {
            for state in [transition.from, transition.to] {
                if !spec.has_state(state) {
                    return Err(RegistryError::IncompleteSpec {
                        call: transition.call.clone(),
                        resource_type: spec.id.clone(),
                        state,
                        reason: "transition uses an undeclared state".to_string(),
                    });
                }
            }
            if spec.is_terminal(transition.from) && !spec.is_terminal(transition.to) {
                return Err(RegistryError::IncompleteSpec {
                    call: transition.call.clone(),
                    resource_type: spec.id.clone(),
                    state: transition.from,
                    reason: "terminal states may only loop back into a terminal state".to_string(),
                });
            }
            table.insert((transition.from, transition.call.clone()), transition.to);
        }

        let cleanup_distance = compute_cleanup_distance(&spec);
        tracing::trace!(
            resource_type = %spec.id,
            transitions = table.len(),
            "registered resource type"
        );
        self.types.insert(
            spec.id.clone(),
            RegisteredType {
                spec,
                table,
                cleanup_distance,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, id: &ResourceTypeId) -> Result<&ResourceType, RegistryError> {
        self.types
            .get(id)
            .map(|registered| &registered.spec)
            .ok_or_else(|| RegistryError::UnknownType(id.clone()))
    }

    /// Post-state of `call` applied to an instance of `resource_type` in
    /// `from`, or `None` when the table does not declare that edge.
    pub fn is_legal_transition(
        &self,
        resource_type: &ResourceTypeId,
        from: LifecycleState,
        call: &CallId,
    ) -> Option<LifecycleState> {
        self.types
            .get(resource_type)
            .and_then(|registered| registered.table.get(&(from, call.clone())).copied())
    }

    /// Number of transitions from `state` to the nearest terminal state.
    /// `None` when no terminal state is reachable.
    pub fn cleanup_distance(
        &self,
        resource_type: &ResourceTypeId,
        state: LifecycleState,
    ) -> Option<usize> {
        self.types
            .get(resource_type)
            .and_then(|registered| registered.cleanup_distance.get(&state).copied())
    }

    pub fn types(&self) -> impl Iterator<Item = &ResourceType> {
        self.types.values().map(|registered| &registered.spec)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Every call id mentioned by any transition table, with its type.
    pub(crate) fn transition_calls(&self) -> BTreeSet<(ResourceTypeId, CallId)> {
        self.types
            .values()
            .flat_map(|registered| {
                registered
                    .spec
                    .transitions
                    .iter()
                    .map(|t| (registered.spec.id.clone(), t.call.clone()))
            })
            .collect()
    }
}

/// Reverse breadth-first search from every terminal state.
fn compute_cleanup_distance(spec: &ResourceType) -> HashMap<LifecycleState, usize> {
    let mut distance: HashMap<LifecycleState, usize> = HashMap::new();
    let mut queue = VecDeque::new();
    for terminal in &spec.terminal {
        distance.insert(*terminal, 0);
        queue.push_back(*terminal);
    }
    while let Some(state) = queue.pop_front() {
        let next = distance[&state] + 1;
        for transition in spec.transitions.iter().filter(|t| t.to == state) {
            if !distance.contains_key(&transition.from) {
                distance.insert(transition.from, next);
                queue.push_back(transition.from);
            }
        }
    }
    distance
}
