use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a resource type, e.g. `"stream"` or `"connection"`.
#[derive(
    Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct ResourceTypeId(pub String);

impl ResourceTypeId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceTypeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceTypeId {
    fn from(value: &str) -> Self {
        ResourceTypeId::new(value)
    }
}

/// Identifier of a catalogued call. Unique within a catalog; several ids may
/// share one host symbol to disambiguate overload sets.
#[derive(
    Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        CallId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        CallId::new(value)
    }
}

/// Identifier of one resource instance inside a single sequence.
#[derive(
    Serialize,
    Deserialize,
    Encode,
    Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle states a resource may pass through. Declaration order is the
/// lifecycle order used to tell "not yet reached" from "already past".
#[derive(
    Serialize,
    Deserialize,
    Encode,
    Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Uninitialized,
    Created,
    Configured,
    Activated,
    Usable,
    Closed,
    Freed,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Created => "created",
            LifecycleState::Configured => "configured",
            LifecycleState::Activated => "activated",
            LifecycleState::Usable => "usable",
            LifecycleState::Closed => "closed",
            LifecycleState::Freed => "freed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed set of handle families found across the target libraries.
///
/// New libraries are added as descriptor rows tagged with one of these,
/// never as new polymorphic types.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceFamily {
    Stream,
    CaptureHandle,
    Dumper,
    Connection,
    Statement,
    JsonNode,
    Regex,
    ColorProfile,
    Transform,
    #[default]
    Other,
}

/// How a call treats one of its resource parameters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BorrowKind {
    /// The instance ends in a terminal state after the call.
    Consumes,
    /// The instance transitions but stays valid.
    Mutates,
    /// Read-only; no state change.
    Borrows,
}

/// Lifecycle phase a call is rendered under.
#[derive(
    Serialize,
    Deserialize,
    Encode,
    Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Initialize,
    Configure,
    Operate,
    Cleanup,
}

impl Phase {
    pub fn banner(&self) -> &'static str {
        match self {
            Phase::Initialize => "Initialize",
            Phase::Configure => "Configure",
            Phase::Operate => "Operate & Validate",
            Phase::Cleanup => "Cleanup",
        }
    }
}

/// Opaque scalar argument data.
///
/// Plain TOML/JSON literals map onto `Bool`, `Int`, `UInt`, `Float` and
/// `Str`; every quoted literal is a `Str`. The remaining forms are written as
/// single-key tables: `{ null = {} }`, `{ symbol = "Z_FINISH" }`,
/// `{ bytes = [1, 2, 3] }` or `{ opaque = "FILE" }`.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`; smaller unsigned literals parse as `Int`.
    UInt(u64),
    Float(f64),
    Special(SpecialScalar),
    Str(String),
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialScalar {
    Null {},
    /// A named host constant, rendered verbatim.
    Symbol(String),
    Bytes(Vec<u8>),
    /// A value whose textual form must be registered with the emitter.
    Opaque(String),
}

impl ScalarValue {
    pub fn null() -> Self {
        ScalarValue::Special(SpecialScalar::Null {})
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        ScalarValue::Special(SpecialScalar::Symbol(name.into()))
    }

    pub fn opaque(tag: impl Into<String>) -> Self {
        ScalarValue::Special(SpecialScalar::Opaque(tag.into()))
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        ScalarValue::Special(SpecialScalar::Bytes(data.into()))
    }
}

/// How a produced handle reaches the caller's variable.
#[derive(
    Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
)]
#[serde(tag = "via", rename_all = "kebab-case")]
pub enum Binding {
    /// The call returns the handle.
    #[default]
    Return,
    /// The call writes the handle through a pointer passed as argument
    /// `position`, e.g. `sqlite3_open(path, &db)`.
    OutParam { position: usize },
    /// The handle is caller-owned storage whose address is argument
    /// `position`; every later use passes that address, e.g. `z_stream`.
    Storage { position: usize },
}

impl Binding {
    /// Argument slot the handle occupies in the producing call.
    pub fn position(&self) -> Option<usize> {
        match self {
            Binding::Return => None,
            Binding::OutParam { position } | Binding::Storage { position } => Some(*position),
        }
    }
}

/// A live handle tracked while walking a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInstance {
    pub id: InstanceId,
    pub resource_type: ResourceTypeId,
    pub state: LifecycleState,
    /// Index of the producing invocation; `None` for externally owned instances.
    pub created_at: Option<usize>,
}

impl ResourceInstance {
    pub fn is_external(&self) -> bool {
        self.created_at.is_none()
    }
}
