use crate::model::{
    BorrowKind, Binding, CallId, LifecycleState, Phase, ResourceInstance, ResourceTypeId,
    ScalarValue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while building the call catalog. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The id is already registered with a different signature. Overloads
    /// of one host symbol must be registered under distinct ids.
    #[error("Call '{0}' is already registered with a different signature")]
    AmbiguousSignature(CallId),

    /// The result's `owner` index does not name a `borrows` resource parameter.
    #[error("Call '{call}' declares owner parameter {index}, which is not a borrowed resource")]
    InvalidOwner { call: CallId, index: usize },

    /// An out-parameter or storage slot lies past the rendered argument list.
    #[error("Call '{call}' binds its handle at argument {position}, past its {arity} arguments")]
    InvalidBinding {
        call: CallId,
        position: usize,
        arity: usize,
    },
}

/// One parameter of a call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ParamSpec {
    Resource {
        #[serde(rename = "type")]
        resource_type: ResourceTypeId,
        /// Pre-states in which the call may be applied.
        accepts: Vec<LifecycleState>,
        borrow: BorrowKind,
    },
    Scalar {
        host_type: String,
        /// Literal values the generator may pass.
        #[serde(default)]
        samples: Vec<ScalarValue>,
    },
}

impl ParamSpec {
    pub fn is_resource(&self) -> bool {
        matches!(self, ParamSpec::Resource { .. })
    }

    /// True for a resource parameter whose type matches `instance` and
    /// whose accepted pre-states contain its current state.
    pub fn admits(&self, instance: &ResourceInstance) -> bool {
        match self {
            ParamSpec::Resource {
                resource_type,
                accepts,
                ..
            } => instance.resource_type == *resource_type && accepts.contains(&instance.state),
            ParamSpec::Scalar { .. } => false,
        }
    }
}

/// What a call yields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ResultSpec {
    #[default]
    None,
    Scalar { host_type: String },
    Instance {
        #[serde(rename = "type")]
        resource_type: ResourceTypeId,
        state: LifecycleState,
        /// Index into the parameter list of the instance that bounds the
        /// new instance's lifetime.
        #[serde(default)]
        owner: Option<usize>,
        #[serde(default)]
        binding: Binding,
        /// Host type of the status the call returns when the handle is not
        /// its return value.
        #[serde(default)]
        returns: Option<String>,
    },
}

/// Library function contract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    pub id: CallId,
    /// Host function name; defaults to the id.
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub result: ResultSpec,
    /// Overrides the phase derived from the call's shape.
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Constant arguments rendered after the bound ones, e.g. the
    /// callback, context and error slots of `sqlite3_exec`.
    #[serde(default)]
    pub fixed_args: Vec<ScalarValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// No resource parameters, produces an instance.
    Constructor,
    /// Produces an instance from existing ones, e.g. `prepare` on a connection.
    DerivedConstructor,
    /// Consumes at least one resource parameter.
    Destructor,
    Operation,
}

impl CallSpec {
    pub fn symbol(&self) -> &str {
        self.symbol.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn kind(&self) -> CallKind {
        let has_resources = self.params.iter().any(ParamSpec::is_resource);
        match (&self.result, has_resources) {
            (ResultSpec::Instance { .. }, false) => CallKind::Constructor,
            (ResultSpec::Instance { .. }, true) => CallKind::DerivedConstructor,
            _ if self.consumes_any() => CallKind::Destructor,
            _ => CallKind::Operation,
        }
    }

    pub fn consumes_any(&self) -> bool {
        self.resource_params()
            .any(|(_, _, _, borrow)| borrow == BorrowKind::Consumes)
    }

    /// Resource parameters as `(param index, type, accepted states, borrow)`.
    pub fn resource_params(
        &self,
    ) -> impl Iterator<Item = (usize, &ResourceTypeId, &[LifecycleState], BorrowKind)> {
        self.params
            .iter()
            .enumerate()
            .filter_map(|(index, param)| match param {
                ParamSpec::Resource {
                    resource_type,
                    accepts,
                    borrow,
                } => Some((index, resource_type, accepts.as_slice(), *borrow)),
                ParamSpec::Scalar { .. } => None,
            })
    }

    pub fn produced_type(&self) -> Option<&ResourceTypeId> {
        match &self.result {
            ResultSpec::Instance { resource_type, .. } => Some(resource_type),
            _ => None,
        }
    }

    /// Every resource type the call touches, produced type included.
    pub fn touches(&self, resource_type: &ResourceTypeId) -> bool {
        self.produced_type() == Some(resource_type)
            || self
                .resource_params()
                .any(|(_, param_type, _, _)| param_type == resource_type)
    }

    /// Handle binding of the produced instance; `Return` for other calls.
    pub fn binding(&self) -> Binding {
        match &self.result {
            ResultSpec::Instance { binding, .. } => *binding,
            _ => Binding::Return,
        }
    }

    fn check_binding(&self) -> Result<(), CatalogError> {
        let arity = self.params.len() + self.fixed_args.len();
        match self.binding().position() {
            Some(position) if position > arity => Err(CatalogError::InvalidBinding {
                call: self.id.clone(),
                position,
                arity,
            }),
            _ => Ok(()),
        }
    }

    fn check_owner(&self) -> Result<(), CatalogError> {
        if let ResultSpec::Instance {
            owner: Some(index), ..
        } = &self.result
        {
            match self.params.get(*index) {
                Some(ParamSpec::Resource {
                    borrow: BorrowKind::Borrows,
                    ..
                }) => {}
                _ => {
                    return Err(CatalogError::InvalidOwner {
                        call: self.id.clone(),
                        index: *index,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Authoritative source of call contracts. A pure lookup structure.
#[derive(Debug, Default, Clone)]
pub struct CallCatalog {
    calls: BTreeMap<CallId, CallSpec>,
}

impl CallCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an identical spec twice is a no-op.
    pub fn register(&mut self, spec: CallSpec) -> Result<(), CatalogError> {
        if let Some(existing) = self.calls.get(&spec.id) {
            if *existing == spec {
                return Ok(());
            }
            return Err(CatalogError::AmbiguousSignature(spec.id));
        }
        spec.check_owner()?;
        spec.check_binding()?;
        self.calls.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn get(&self, id: &CallId) -> Option<&CallSpec> {
        self.calls.get(id)
    }

    pub fn calls(&self) -> impl Iterator<Item = &CallSpec> {
        self.calls.values()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Calls with zero resource parameters producing an instance of `resource_type`.
    pub fn constructors_for<'a>(
        &'a self,
        resource_type: &'a ResourceTypeId,
    ) -> impl Iterator<Item = &'a CallSpec> + 'a {
        self.calls.values().filter(move |spec| {
            spec.kind() == CallKind::Constructor && spec.produced_type() == Some(resource_type)
        })
    }

    /// Constructors plus derived constructors of `resource_type`.
    pub fn producers_for<'a>(
        &'a self,
        resource_type: &'a ResourceTypeId,
    ) -> impl Iterator<Item = &'a CallSpec> + 'a {
        self.calls
            .values()
            .filter(move |spec| spec.produced_type() == Some(resource_type))
    }

    /// Calls consuming an instance of `resource_type`.
    pub fn destructors_for<'a>(
        &'a self,
        resource_type: &'a ResourceTypeId,
    ) -> impl Iterator<Item = &'a CallSpec> + 'a {
        self.calls.values().filter(move |spec| {
            spec.resource_params().any(|(_, param_type, _, borrow)| {
                borrow == BorrowKind::Consumes && param_type == resource_type
            })
        })
    }

    /// Every call that takes or produces an instance of `resource_type`.
    pub fn calls_on<'a>(
        &'a self,
        resource_type: &'a ResourceTypeId,
    ) -> impl Iterator<Item = &'a CallSpec> + 'a {
        self.calls.values().filter(move |spec| spec.touches(resource_type))
    }

    /// True if `instances`, matched positionally against the call's resource
    /// parameters, all have the required type and an accepted state.
    pub fn applicable(&self, call: &CallId, instances: &[&ResourceInstance]) -> bool {
        let Some(spec) = self.calls.get(call) else {
            return false;
        };
        let params: Vec<&ParamSpec> = spec.params.iter().filter(|p| p.is_resource()).collect();
        params.len() == instances.len()
            && params
                .iter()
                .zip(instances)
                .all(|(param, instance)| param.admits(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceId;

    fn resource(name: &str, accepts: &[LifecycleState], borrow: BorrowKind) -> ParamSpec {
        ParamSpec::Resource {
            resource_type: ResourceTypeId::new(name),
            accepts: accepts.to_vec(),
            borrow,
        }
    }

    fn open_call() -> CallSpec {
        CallSpec {
            id: CallId::new("open"),
            symbol: Some("sqlite3_open".to_string()),
            params: vec![ParamSpec::Scalar {
                host_type: "const char *".to_string(),
                samples: vec![ScalarValue::Str(":memory:".to_string())],
            }],
            result: ResultSpec::Instance {
                resource_type: ResourceTypeId::new("connection"),
                state: LifecycleState::Activated,
                owner: None,
                binding: Binding::OutParam { position: 1 },
                returns: Some("int".to_string()),
            },
            phase: None,
            fixed_args: Vec::new(),
        }
    }

    fn prepare_call() -> CallSpec {
        CallSpec {
            id: CallId::new("prepare"),
            symbol: None,
            params: vec![resource(
                "connection",
                &[LifecycleState::Activated],
                BorrowKind::Borrows,
            )],
            result: ResultSpec::Instance {
                resource_type: ResourceTypeId::new("statement"),
                state: LifecycleState::Created,
                owner: Some(0),
                binding: Binding::Return,
                returns: None,
            },
            phase: None,
            fixed_args: Vec::new(),
        }
    }

    fn close_call() -> CallSpec {
        CallSpec {
            id: CallId::new("close"),
            symbol: None,
            params: vec![resource(
                "connection",
                &[LifecycleState::Activated],
                BorrowKind::Consumes,
            )],
            result: ResultSpec::Scalar {
                host_type: "int".to_string(),
            },
            phase: None,
            fixed_args: Vec::new(),
        }
    }

    fn sample_catalog() -> CallCatalog {
        let mut catalog = CallCatalog::new();
        for spec in [open_call(), prepare_call(), close_call()] {
            catalog.register(spec).expect("registration should succeed");
        }
        catalog
    }

    #[test]
    fn re_registering_an_identical_spec_is_a_no_op() {
        let mut catalog = sample_catalog();
        catalog.register(open_call()).expect("identical spec is accepted");
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn same_id_with_different_arity_is_ambiguous() {
        let mut catalog = sample_catalog();
        let mut overload = open_call();
        overload.params.push(ParamSpec::Scalar {
            host_type: "int".to_string(),
            samples: vec![],
        });
        assert_eq!(
            catalog.register(overload),
            Err(CatalogError::AmbiguousSignature(CallId::new("open")))
        );
    }

    #[test]
    fn overloads_of_one_symbol_under_distinct_ids_are_accepted() {
        let mut catalog = sample_catalog();
        let mut overload = open_call();
        overload.id = CallId::new("open_v2");
        catalog.register(overload).expect("distinct id is fine");
        assert_eq!(catalog.len(), 4);
    }

    #[test]
    fn owner_must_point_at_a_borrowed_resource_parameter() {
        let mut catalog = CallCatalog::new();
        let mut bad = prepare_call();
        bad.params[0] = resource("connection", &[LifecycleState::Activated], BorrowKind::Mutates);
        assert_eq!(
            catalog.register(bad),
            Err(CatalogError::InvalidOwner {
                call: CallId::new("prepare"),
                index: 0
            })
        );
    }

    #[test]
    fn constructor_queries_separate_plain_and_derived_producers() {
        let catalog = sample_catalog();
        let connection = ResourceTypeId::new("connection");
        let statement = ResourceTypeId::new("statement");

        let constructors: Vec<_> = catalog.constructors_for(&connection).map(|c| c.id.as_str()).collect();
        assert_eq!(constructors, vec!["open"]);
        assert_eq!(catalog.constructors_for(&statement).count(), 0);

        let producers: Vec<_> = catalog.producers_for(&statement).map(|c| c.id.as_str()).collect();
        assert_eq!(producers, vec!["prepare"]);
        assert_eq!(prepare_call().kind(), CallKind::DerivedConstructor);

        let destructors: Vec<_> = catalog.destructors_for(&connection).map(|c| c.id.as_str()).collect();
        assert_eq!(destructors, vec!["close"]);
        let on_connection: Vec<_> = catalog.calls_on(&connection).map(|c| c.id.as_str()).collect();
        assert_eq!(on_connection, vec!["close", "open", "prepare"]);
        assert_eq!(close_call().kind(), CallKind::Destructor);
    }

    #[test]
    fn applicable_checks_type_and_state_positionally() {
        let catalog = sample_catalog();
        let live = ResourceInstance {
            id: InstanceId(0),
            resource_type: ResourceTypeId::new("connection"),
            state: LifecycleState::Activated,
            created_at: Some(0),
        };
        let closed = ResourceInstance {
            state: LifecycleState::Closed,
            ..live.clone()
        };
        let wrong_type = ResourceInstance {
            resource_type: ResourceTypeId::new("statement"),
            ..live.clone()
        };

        assert!(catalog.applicable(&CallId::new("close"), &[&live]));
        assert!(!catalog.applicable(&CallId::new("close"), &[&closed]));
        assert!(!catalog.applicable(&CallId::new("close"), &[&wrong_type]));
        assert!(!catalog.applicable(&CallId::new("close"), &[]));
        assert!(catalog.applicable(&CallId::new("open"), &[]));
        assert!(!catalog.applicable(&CallId::new("missing"), &[]));
    }

    #[test]
    fn call_specs_parse_from_descriptor_toml() {
        let spec: CallSpec = toml::from_str(
            r#"
            id = "prepare"
            symbol = "sqlite3_prepare_v2"
            params = [
              { kind = "resource", type = "connection", accepts = ["activated"], borrow = "borrows" },
              { kind = "scalar", host-type = "const char *", samples = ["SELECT 1;"] },
            ]
            result = { kind = "instance", type = "statement", state = "created", owner = 0 }
            "#,
        )
        .expect("call spec should parse");
        assert_eq!(spec.symbol(), "sqlite3_prepare_v2");
        assert_eq!(spec.kind(), CallKind::DerivedConstructor);
        assert!(matches!(spec.result, ResultSpec::Instance { owner: Some(0), .. }));
        assert_eq!(spec.binding(), Binding::Return);
        assert!(spec.fixed_args.is_empty());
    }

    #[test]
    fn out_param_bindings_and_fixed_args_parse() {
        let spec: CallSpec = toml::from_str(
            r#"
            id = "prepare"
            symbol = "sqlite3_prepare_v2"
            params = [
              { kind = "resource", type = "connection", accepts = ["activated"], borrow = "borrows" },
              { kind = "scalar", host-type = "const char *", samples = ["SELECT 1;"] },
            ]
            fixed-args = [-1, { null = {} }]
            result = { kind = "instance", type = "statement", state = "created", owner = 0, binding = { via = "out-param", position = 3 }, returns = "int" }
            "#,
        )
        .expect("call spec should parse");
        assert_eq!(spec.binding(), Binding::OutParam { position: 3 });
        assert_eq!(spec.fixed_args, vec![ScalarValue::Int(-1), ScalarValue::null()]);
        assert!(matches!(&spec.result, ResultSpec::Instance { returns: Some(status), .. } if status == "int"));
        let mut catalog = CallCatalog::new();
        catalog.register(spec).expect("position 3 of 4 is in range");
    }

    #[test]
    fn binding_past_the_argument_list_is_rejected() {
        let mut catalog = CallCatalog::new();
        let mut open = open_call();
        if let ResultSpec::Instance { binding, .. } = &mut open.result {
            *binding = Binding::Storage { position: 2 };
        }
        assert_eq!(
            catalog.register(open),
            Err(CatalogError::InvalidBinding {
                call: CallId::new("open"),
                position: 2,
                arity: 1,
            })
        );
    }
}
