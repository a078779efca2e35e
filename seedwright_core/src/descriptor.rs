use crate::catalog::{CallCatalog, CallKind, CallSpec, CatalogError, ResultSpec};
use crate::model::{BorrowKind, CallId, LifecycleState, Phase, ResourceTypeId};
use crate::registry::{ResourceRegistry, ResourceType, RegistryError};
use crate::sequence::{RenderHints, ResultHint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Failed to read descriptor at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No bundled descriptor named '{0}'")]
    UnknownLibrary(String),
    #[error("Failed to parse descriptor TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Declarative call table supplied per target library.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LibraryDescriptor {
    pub library: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceType>,
    #[serde(default, rename = "call")]
    pub calls: Vec<CallSpec>,
}

impl LibraryDescriptor {
    pub fn from_toml_str(text: &str) -> Result<Self, DescriptorError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Registers every row and cross-checks the two tables.
    pub fn into_model(self) -> Result<Model, DescriptorError> {
        let mut registry = ResourceRegistry::new();
        for resource in self.resources {
            registry.register(resource)?;
        }
        let mut catalog = CallCatalog::new();
        for call in self.calls {
            catalog.register(call)?;
        }
        Model::new(self.library, self.includes, registry, catalog)
    }
}

/// The immutable, assembled registry and catalog of one library.
///
/// Built once, then shared by reference (or `Arc`) across any number of
/// generator and validator runs.
#[derive(Debug)]
pub struct Model {
    library: String,
    includes: Vec<String>,
    registry: ResourceRegistry,
    catalog: CallCatalog,
}

impl Model {
    pub fn new(
        library: impl Into<String>,
        includes: Vec<String>,
        registry: ResourceRegistry,
        catalog: CallCatalog,
    ) -> Result<Self, DescriptorError> {
        cross_check(&registry, &catalog)?;
        let model = Self {
            library: library.into(),
            includes,
            registry,
            catalog,
        };
        tracing::debug!(
            library = %model.library,
            resource_types = model.registry.len(),
            calls = model.catalog.len(),
            "assembled lifecycle model"
        );
        Ok(model)
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &CallCatalog {
        &self.catalog
    }

    /// Rendering phase of a call: the explicit override, else derived from
    /// the call's shape and the states its mutations land in.
    pub fn phase_of(&self, spec: &CallSpec) -> Phase {
        if let Some(phase) = spec.phase {
            return phase;
        }
        match spec.kind() {
            CallKind::Constructor | CallKind::DerivedConstructor => Phase::Initialize,
            CallKind::Destructor => Phase::Cleanup,
            CallKind::Operation => {
                let configures = spec.resource_params().any(|(_, resource_type, accepts, borrow)| {
                    borrow == BorrowKind::Mutates
                        && accepts.iter().any(|from| {
                            matches!(
                                self.registry.is_legal_transition(resource_type, *from, &spec.id),
                                Some(LifecycleState::Created | LifecycleState::Configured)
                            )
                        })
                });
                if configures {
                    Phase::Configure
                } else {
                    Phase::Operate
                }
            }
        }
    }

    /// Emitter metadata for `spec`, attached to every invocation of it.
    pub fn hints_for(&self, spec: &CallSpec) -> RenderHints {
        let result = match &spec.result {
            ResultSpec::None => ResultHint::None,
            ResultSpec::Scalar { host_type } => ResultHint::Scalar {
                host_type: host_type.clone(),
            },
            ResultSpec::Instance {
                resource_type,
                binding,
                returns,
                ..
            } => match self.registry.lookup(resource_type) {
                Ok(resource) => ResultHint::Instance {
                    host_type: resource.host_type.clone(),
                    stem: resource.variable_stem(),
                    binding: *binding,
                    returns: returns.clone(),
                },
                Err(_) => ResultHint::None,
            },
        };
        RenderHints {
            symbol: spec.symbol().to_string(),
            phase: self.phase_of(spec),
            result,
            fixed_args: spec.fixed_args.clone(),
        }
    }
}

fn incomplete(
    call: &CallId,
    resource_type: &ResourceTypeId,
    state: LifecycleState,
    reason: &str,
) -> RegistryError {
    RegistryError::IncompleteSpec {
        call: call.clone(),
        resource_type: resource_type.clone(),
        state,
        reason: reason.to_string(),
    }
}

/// Fails fast on any (type, state, call) combination the transition tables
/// leave undefined or annotate inconsistently.
fn cross_check(registry: &ResourceRegistry, catalog: &CallCatalog) -> Result<(), RegistryError> {
    for spec in catalog.calls() {
        for (_, resource_type, accepts, borrow) in spec.resource_params() {
            let resource = registry.lookup(resource_type)?;
            for from in accepts {
                if !resource.has_state(*from) {
                    return Err(incomplete(&spec.id, resource_type, *from, "accepted state is not declared"));
                }
                let target = registry.is_legal_transition(resource_type, *from, &spec.id);
                match borrow {
                    BorrowKind::Borrows => {
                        if resource.is_terminal(*from) {
                            return Err(incomplete(&spec.id, resource_type, *from, "only consuming calls may accept a terminal state"));
                        }
                        if target.is_some_and(|to| to != *from) {
                            return Err(incomplete(&spec.id, resource_type, *from, "borrowing call declares a state change"));
                        }
                    }
                    BorrowKind::Mutates => {
                        if resource.is_terminal(*from) {
                            return Err(incomplete(&spec.id, resource_type, *from, "only consuming calls may accept a terminal state"));
                        }
                        match target {
                            None => {
                                return Err(incomplete(&spec.id, resource_type, *from, "no transition declared for mutating call"));
                            }
                            Some(to) if resource.is_terminal(to) => {
                                return Err(incomplete(&spec.id, resource_type, *from, "mutating call reaches a terminal state; annotate it as consumes"));
                            }
                            Some(_) => {}
                        }
                    }
                    BorrowKind::Consumes => match target {
                        None => {
                            return Err(incomplete(&spec.id, resource_type, *from, "no transition declared for consuming call"));
                        }
                        Some(to) if !resource.is_terminal(to) => {
                            return Err(incomplete(&spec.id, resource_type, *from, "consuming call must reach a terminal state"));
                        }
                        Some(_) => {}
                    },
                }
            }
        }

        if let ResultSpec::Instance {
            resource_type,
            state,
            ..
        } = &spec.result
        {
            let resource = registry.lookup(resource_type)?;
            if !resource.has_state(*state) || resource.is_terminal(*state) {
                return Err(incomplete(&spec.id, resource_type, *state, "instances must be produced in a declared, non-terminal state"));
            }
        }
    }

    for (resource_type, call) in registry.transition_calls() {
        let declared = catalog.get(&call).is_some_and(|spec| {
            spec.resource_params()
                .any(|(_, param_type, _, _)| *param_type == resource_type)
        });
        if !declared {
            let state = registry
                .lookup(&resource_type)?
                .states
                .first()
                .copied()
                .unwrap_or(LifecycleState::Uninitialized);
            return Err(incomplete(&call, &resource_type, state, "transition names a call that never takes this type"));
        }
    }
    Ok(())
}
