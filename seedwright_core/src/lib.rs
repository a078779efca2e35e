pub mod batch;
pub mod builtin;
pub mod catalog;
pub mod config;
pub mod descriptor;
pub mod emitter;
pub mod feedback;
pub mod generator;
pub mod graph;
pub mod model;
pub mod registry;
pub mod sequence;
pub mod tracker;
pub mod validator;

pub use batch::{GenerationResult, generate_batch, scenarios_for};
pub use catalog::{CallCatalog, CallKind, CallSpec, CatalogError, ParamSpec, ResultSpec};
pub use config::{BatchSettings, ModelSource, SeedwrightConfig};
pub use descriptor::{DescriptorError, LibraryDescriptor, Model};
pub use emitter::{Dialect, EmitError, EmitStyle, Emitter};
pub use feedback::{CallPairFeedback, Feedback, TransitionCoverage, UniqueSequenceFeedback};
pub use generator::{GenerationError, GeneratorSettings, Scenario, SequenceGenerator};
pub use graph::{DependencyGraph, OwnershipEdge};
pub use model::{
    BorrowKind, CallId, InstanceId, LifecycleState, Phase, ResourceFamily, ResourceInstance,
    ResourceTypeId, ScalarValue,
};
pub use registry::{RegistryError, ResourceRegistry, ResourceType, Transition};
pub use sequence::{
    Argument, CallInvocation, ExternalInstance, RenderHints, Sequence, SequenceCodecError,
    SequenceFormat,
};
pub use tracker::{Effect, LifecycleTracker};
pub use validator::{SequenceValidator, Violation, ViolationKind};
