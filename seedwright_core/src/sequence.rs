use crate::descriptor::Model;
use crate::model::{
    Binding, CallId, InstanceId, LifecycleState, Phase, ResourceTypeId, ScalarValue,
};
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, Limit, LittleEndian},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SequenceCodecError {
    #[error("Sequence JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Sequence bincode encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Sequence bincode decoding error: {0}")]
    Decode(#[from] DecodeError),
}

/// On-disk encodings of a sequence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SequenceFormat {
    #[default]
    Json,
    Bincode,
}

/// A concrete binding for one call parameter.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Argument {
    Instance(InstanceId),
    Scalar(ScalarValue),
}

/// How the emitter renders a call's return value.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ResultHint {
    #[default]
    None,
    Scalar {
        host_type: String,
    },
    Instance {
        host_type: String,
        stem: String,
        #[serde(default)]
        binding: Binding,
        /// Status type returned alongside an out-parameter or storage handle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        returns: Option<String>,
    },
}

/// Emitter metadata copied from the catalog onto each invocation.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RenderHints {
    pub symbol: String,
    pub phase: Phase,
    #[serde(default)]
    pub result: ResultHint,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixed_args: Vec<ScalarValue>,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct CallInvocation {
    pub call: CallId,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Id given to the instance this call produces, if it produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<RenderHints>,
}

impl CallInvocation {
    pub fn new(call: impl Into<String>) -> Self {
        Self {
            call: CallId::new(call),
            args: Vec::new(),
            produces: None,
            hints: None,
        }
    }

    pub fn with_instance(mut self, id: u32) -> Self {
        self.args.push(Argument::Instance(InstanceId(id)));
        self
    }

    pub fn with_scalar(mut self, value: ScalarValue) -> Self {
        self.args.push(Argument::Scalar(value));
        self
    }

    pub fn producing(mut self, id: u32) -> Self {
        self.produces = Some(InstanceId(id));
        self
    }

    pub fn instance_args(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            Argument::Instance(id) => Some(*id),
            Argument::Scalar(_) => None,
        })
    }
}

/// An instance handed to the sequence from outside. Exempt from leak checks.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ExternalInstance {
    pub id: InstanceId,
    #[serde(rename = "type")]
    pub resource_type: ResourceTypeId,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_type: Option<String>,
}

/// Ordered list of call invocations under validation or construction.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Sequence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ResourceTypeId>,
    /// Seed the sequence was generated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub external: Vec<ExternalInstance>,
    pub calls: Vec<CallInvocation>,
}

/// Upper bound on a decoded sequence; length prefixes claiming more are rejected.
const MAX_ENCODED_LEN: usize = 16 * 1024 * 1024;

fn bincode_config() -> Configuration<LittleEndian, Fixint, Limit<MAX_ENCODED_LEN>> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_ENCODED_LEN>()
}

impl Sequence {
    pub fn new(calls: Vec<CallInvocation>) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn with_external(mut self, external: ExternalInstance) -> Self {
        self.external.push(external);
        self
    }

    /// Fills missing render hints and external host types from the model.
    /// Invocations of unknown calls are left untouched for the validator to report.
    pub fn annotate(&mut self, model: &Model) {
        for invocation in &mut self.calls {
            if invocation.hints.is_none() {
                if let Some(spec) = model.catalog().get(&invocation.call) {
                    invocation.hints = Some(model.hints_for(spec));
                }
            }
        }
        for external in &mut self.external {
            if external.host_type.is_none() {
                if let Ok(resource) = model.registry().lookup(&external.resource_type) {
                    external.host_type = Some(resource.host_type.clone());
                }
            }
        }
    }

    pub fn encode(&self, format: SequenceFormat) -> Result<Vec<u8>, SequenceCodecError> {
        match format {
            SequenceFormat::Json => Ok(serde_json::to_vec_pretty(self)?),
            SequenceFormat::Bincode => Ok(bincode::encode_to_vec(self, bincode_config())?),
        }
    }

    pub fn decode(bytes: &[u8], format: SequenceFormat) -> Result<Self, SequenceCodecError> {
        match format {
            SequenceFormat::Json => Ok(serde_json::from_slice(bytes)?),
            SequenceFormat::Bincode => {
                let (sequence, read) = bincode::decode_from_slice(bytes, bincode_config())?;
                if read != bytes.len() {
                    return Err(DecodeError::Other("trailing bytes after the encoded sequence").into());
                }
                Ok(sequence)
            }
        }
    }

    /// MD5 over the call/argument shape; hints and seed are ignored so that
    /// the same program generated twice fingerprints identically.
    pub fn fingerprint(&self) -> [u8; 16] {
        let mut context = md5::Context::new();
        for external in &self.external {
            context.consume(format!("ext:{}:{}:{};", external.id, external.resource_type, external.state));
        }
        for invocation in &self.calls {
            context.consume(invocation.call.as_str());
            for arg in &invocation.args {
                match arg {
                    Argument::Instance(id) => context.consume(format!("({id})")),
                    Argument::Scalar(value) => context.consume(format!("({value:?})")),
                }
            }
            if let Some(id) = invocation.produces {
                context.consume(format!("->{id}"));
            }
            context.consume(";");
        }
        context.compute().0
    }

    /// Adjacent call pairs, in order.
    pub fn call_pairs(&self) -> impl Iterator<Item = (&CallId, &CallId)> + '_ {
        self.calls
            .windows(2)
            .map(|pair| (&pair[0].call, &pair[1].call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sequence {
        let mut sequence = Sequence::new(vec![
            CallInvocation::new("open")
                .with_scalar(ScalarValue::Str(":memory:".to_string()))
                .producing(0),
            CallInvocation::new("prepare")
                .with_instance(0)
                .with_scalar(ScalarValue::Str("SELECT 1;".to_string()))
                .producing(1),
            CallInvocation::new("finalize").with_instance(1),
            CallInvocation::new("close").with_instance(0),
        ]);
        sequence.target = Some(ResourceTypeId::new("statement"));
        sequence
    }

    #[test]
    fn json_and_bincode_encodings_decode_to_the_same_sequence() {
        let sequence = sample();
        for format in [SequenceFormat::Json, SequenceFormat::Bincode] {
            let bytes = sequence.encode(format).expect("encode");
            let decoded = Sequence::decode(&bytes, format).expect("decode");
            assert_eq!(decoded, sequence, "format {:?} lost information", format);
        }
    }

    #[test]
    fn oversized_length_prefixes_are_rejected_before_allocating() {
        // No target, no seed, then an external list claiming 2^40 entries.
        let mut bytes = vec![0u8, 0u8];
        bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
        match Sequence::decode(&bytes, SequenceFormat::Bincode) {
            Err(SequenceCodecError::Decode(DecodeError::LimitExceeded)) => {}
            other => panic!("Expected LimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn truncated_and_padded_bincode_are_decode_errors() {
        let bytes = sample().encode(SequenceFormat::Bincode).expect("encode");
        assert!(matches!(
            Sequence::decode(&bytes[..bytes.len() - 1], SequenceFormat::Bincode),
            Err(SequenceCodecError::Decode(_))
        ));
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            Sequence::decode(&padded, SequenceFormat::Bincode),
            Err(SequenceCodecError::Decode(_))
        ));
    }

    #[test]
    fn hand_written_json_uses_compact_argument_tags() {
        let text = r#"{
            "calls": [
                { "call": "construct", "produces": 0 },
                { "call": "configure", "args": [ { "instance": 0 }, { "scalar": 9 } ] },
                { "call": "close", "args": [ { "instance": 0 } ] }
            ]
        }"#;
        let sequence = Sequence::decode(text.as_bytes(), SequenceFormat::Json).expect("parse");
        assert_eq!(sequence.len(), 3);
        assert_eq!(sequence.calls[0].produces, Some(InstanceId(0)));
        assert_eq!(
            sequence.calls[1].args,
            vec![Argument::Instance(InstanceId(0)), Argument::Scalar(ScalarValue::Int(9))]
        );
        assert!(sequence.external.is_empty());
    }

    #[test]
    fn fingerprint_ignores_seed_and_hints_but_not_order() {
        let base = sample();
        let mut seeded = base.clone();
        seeded.seed = Some(42);
        assert_eq!(base.fingerprint(), seeded.fingerprint());

        let mut reordered = base.clone();
        reordered.calls.swap(2, 3);
        assert_ne!(base.fingerprint(), reordered.fingerprint());
    }

    #[test]
    fn call_pairs_walk_adjacent_invocations() {
        let sequence = sample();
        let pairs: Vec<(&str, &str)> = sequence
            .call_pairs()
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("open", "prepare"), ("prepare", "finalize"), ("finalize", "close")]
        );
    }
}
