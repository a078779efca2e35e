use crate::descriptor::Model;
use crate::model::InstanceId;
use crate::sequence::Sequence;
use crate::tracker::LifecycleTracker;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Named classes of lifecycle-rule breaches.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViolationKind {
    /// The instance has not reached any state the call accepts yet.
    UseBeforeInit,
    /// The instance is already terminal and the call does not consume it.
    UseAfterFree,
    /// A destructor was applied to an instance that is already terminal.
    DoubleFree,
    /// An owner was freed while a dependent is still live.
    DanglingOwnerFree,
    /// The call references an instance that was never produced.
    UnreachableCall,
    /// A non-external instance is not terminal at the end of the sequence.
    ResourceLeak,
    /// A scalar argument has no registered textual form.
    UnrenderableLiteral,
    /// The instance is past every state the call accepts.
    IllegalTransition,
    UnknownCall,
    /// Wrong arity, scalar/instance confusion, wrong type or bad produced id.
    ArgumentMismatch,
    /// A produced id is already in use; instances are never resurrected.
    DuplicateInstance,
}

impl ViolationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ViolationKind::UseBeforeInit => "UseBeforeInit",
            ViolationKind::UseAfterFree => "UseAfterFree",
            ViolationKind::DoubleFree => "DoubleFree",
            ViolationKind::DanglingOwnerFree => "DanglingOwnerFree",
            ViolationKind::UnreachableCall => "UnreachableCall",
            ViolationKind::ResourceLeak => "ResourceLeak",
            ViolationKind::UnrenderableLiteral => "UnrenderableLiteral",
            ViolationKind::IllegalTransition => "IllegalTransition",
            ViolationKind::UnknownCall => "UnknownCall",
            ViolationKind::ArgumentMismatch => "ArgumentMismatch",
            ViolationKind::DuplicateInstance => "DuplicateInstance",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The first lifecycle rule a sequence breaks, with the offending
/// invocation index. For leaks the index is the producing invocation.
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
#[error("{kind} at invocation {index}: {message}")]
pub struct Violation {
    pub kind: ViolationKind,
    pub index: usize,
    pub instance: Option<InstanceId>,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, index: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            index,
            instance: None,
            message: message.into(),
        }
    }

    pub fn on(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }
}

/// Re-checks arbitrary sequences against the lifecycle model.
///
/// Runs the same tracker the generator grows sequences with, in a single
/// linear pass, and never repairs what it finds.
#[derive(Debug, Clone, Copy)]
pub struct SequenceValidator<'m> {
    model: &'m Model,
}

impl<'m> SequenceValidator<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self { model }
    }

    pub fn validate(&self, sequence: &Sequence) -> Result<(), Violation> {
        self.walk(sequence).map(|_| ())
    }

    /// Validates and returns the final tracker state for inspection.
    pub fn walk(&self, sequence: &Sequence) -> Result<LifecycleTracker<'m>, Violation> {
        let mut tracker = LifecycleTracker::with_external(self.model, &sequence.external)?;
        for (index, invocation) in sequence.calls.iter().enumerate() {
            tracker.apply(index, invocation)?;
        }
        tracker.finish()?;
        Ok(tracker)
    }
}
