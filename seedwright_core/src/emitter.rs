use crate::descriptor::Model;
use crate::model::{Binding, InstanceId, Phase, ScalarValue, SpecialScalar};
use crate::registry::variable_stem;
use crate::sequence::{Argument, ResultHint, Sequence};
use crate::validator::{SequenceValidator, Violation, ViolationKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

const INDENT: &str = "    ";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmitError {
    #[error(transparent)]
    Violation(#[from] Violation),
    #[error("Invocation {index} carries no render hints; annotate the sequence first")]
    MissingHints { index: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    #[default]
    C,
    Cpp,
}

impl Dialect {
    fn null(&self) -> &'static str {
        match self {
            Dialect::C => "NULL",
            Dialect::Cpp => "nullptr",
        }
    }

    fn discard(&self, name: &str) -> String {
        match self {
            Dialect::C => format!("(void){name};"),
            Dialect::Cpp => format!("static_cast<void>({name});"),
        }
    }

    fn boolean(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::C, true) => "1",
            (Dialect::C, false) => "0",
            (Dialect::Cpp, true) => "true",
            (Dialect::Cpp, false) => "false",
        }
    }

    /// Initializer suffix for a zeroed aggregate on the stack.
    fn zeroed(&self) -> &'static str {
        match self {
            Dialect::C => " = {0}",
            Dialect::Cpp => "{}",
        }
    }

    fn empty_params(&self) -> &'static str {
        match self {
            Dialect::C => "void",
            Dialect::Cpp => "",
        }
    }
}

fn default_prefix() -> String {
    "test".to_string()
}

/// Host-language rendering options.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EmitStyle {
    #[serde(default)]
    pub dialect: Dialect,
    /// Entry points are named `<prefix>_<target>_<n>`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Value every entry point returns.
    #[serde(default)]
    pub sentinel: i64,
    /// Headers emitted before the model's own includes.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Textual forms of opaque literal tags.
    #[serde(default)]
    pub literals: BTreeMap<String, String>,
}

impl Default for EmitStyle {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            prefix: default_prefix(),
            sentinel: 0,
            includes: Vec::new(),
            literals: BTreeMap::new(),
        }
    }
}

/// Renders validated sequences as host-language source units.
///
/// Only the render hints on each invocation and the host types of external
/// instances are consulted; the lifecycle model is never needed here.
#[derive(Debug, Clone, Default)]
pub struct Emitter {
    style: EmitStyle,
}

fn declaration(host_type: &str, name: &str) -> String {
    let host_type = host_type.trim_end();
    if host_type.ends_with('*') {
        format!("{host_type}{name}")
    } else {
        format!("{host_type} {name}")
    }
}

/// Binds a call's status to `r<index>` and marks it used.
fn discarded(dialect: Dialect, index: usize, host_type: &str, call: &str) -> [String; 2] {
    let name = format!("r{index}");
    [
        format!("{INDENT}{} = {call};", declaration(host_type, &name)),
        format!("{INDENT}{}", dialect.discard(&name)),
    ]
}

/// The pointee of a pointer host type, used for caller-owned storage.
fn storage_type(host_type: &str) -> &str {
    host_type.trim_end().trim_end_matches('*').trim_end()
}

/// Double-quoted literal; anything outside printable ASCII becomes an octal escape.
fn quoted(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() + 2);
    text.push('"');
    for byte in bytes {
        match byte {
            b'"' => text.push_str("\\\""),
            b'\\' => text.push_str("\\\\"),
            b'\n' => text.push_str("\\n"),
            b'\r' => text.push_str("\\r"),
            b'\t' => text.push_str("\\t"),
            0x20..=0x7e => text.push(*byte as char),
            other => text.push_str(&format!("\\{other:03o}")),
        }
    }
    text.push('"');
    text
}

impl Emitter {
    pub fn new(style: EmitStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &EmitStyle {
        &self.style
    }

    /// Validates `sequence` against `model` first and renders it only if it
    /// passes. The model's includes follow the style's.
    pub fn emit_validated(
        &self,
        model: &Model,
        sequence: &Sequence,
        ordinal: usize,
    ) -> Result<String, EmitError> {
        SequenceValidator::new(model).validate(sequence)?;
        let mut includes = self.style.includes.clone();
        for include in model.includes() {
            if !includes.contains(include) {
                includes.push(include.clone());
            }
        }
        self.render(sequence, ordinal, &includes)
    }

    /// Renders an already validated, annotated sequence as entry point
    /// number `ordinal`.
    pub fn emit(&self, sequence: &Sequence, ordinal: usize) -> Result<String, EmitError> {
        self.render(sequence, ordinal, &self.style.includes)
    }

    fn render(
        &self,
        sequence: &Sequence,
        ordinal: usize,
        includes: &[String],
    ) -> Result<String, EmitError> {
        let dialect = self.style.dialect;
        let mut lines = Vec::new();
        for include in includes {
            if include.starts_with('<') || include.starts_with('"') {
                lines.push(format!("#include {include}"));
            } else {
                lines.push(format!("#include <{include}>"));
            }
        }
        if !includes.is_empty() {
            lines.push(String::new());
        }

        let mut names: HashMap<InstanceId, String> = HashMap::new();
        let mut params = Vec::new();
        for external in &sequence.external {
            let name = format!("{}_{}", variable_stem(&external.resource_type), external.id.0);
            params.push(declaration(
                external.host_type.as_deref().unwrap_or("void *"),
                &name,
            ));
            names.insert(external.id, name);
        }
        let target = sequence
            .target
            .as_ref()
            .map_or_else(|| "sequence".to_string(), variable_stem);
        let params = if params.is_empty() {
            dialect.empty_params().to_string()
        } else {
            params.join(", ")
        };
        lines.push(format!(
            "int {}_{}_{}({}) {{",
            self.style.prefix, target, ordinal, params
        ));

        let mut phase: Option<Phase> = None;
        for (index, invocation) in sequence.calls.iter().enumerate() {
            let hints = invocation
                .hints
                .as_ref()
                .ok_or(EmitError::MissingHints { index })?;
            if phase != Some(hints.phase) {
                lines.push(format!("{INDENT}// {}", hints.phase.banner()));
                phase = Some(hints.phase);
            }

            let mut args = Vec::with_capacity(invocation.args.len());
            for arg in &invocation.args {
                args.push(match arg {
                    Argument::Instance(id) => names.get(id).cloned().ok_or_else(|| {
                        Violation::new(
                            ViolationKind::UnreachableCall,
                            index,
                            format!("instance {id} has no variable in scope"),
                        )
                        .on(*id)
                    })?,
                    Argument::Scalar(value) => self.literal(value).map_err(|reason| {
                        Violation::new(ViolationKind::UnrenderableLiteral, index, reason)
                    })?,
                });
            }
            for value in &hints.fixed_args {
                args.push(self.literal(value).map_err(|reason| {
                    Violation::new(ViolationKind::UnrenderableLiteral, index, reason)
                })?);
            }

            let produced = match (&hints.result, invocation.produces) {
                (ResultHint::Instance { stem, .. }, Some(id)) => Some((id, format!("{stem}_{}", id.0))),
                _ => None,
            };
            if let (ResultHint::Instance { host_type, binding, .. }, Some((id, name))) =
                (&hints.result, &produced)
            {
                match binding {
                    Binding::Return => {}
                    Binding::OutParam { position } => {
                        lines.push(format!(
                            "{INDENT}{} = {};",
                            declaration(host_type, name),
                            dialect.null()
                        ));
                        args.insert((*position).min(args.len()), format!("&{name}"));
                        names.insert(*id, name.clone());
                    }
                    Binding::Storage { position } => {
                        lines.push(format!(
                            "{INDENT}{} {name}{};",
                            storage_type(host_type),
                            dialect.zeroed()
                        ));
                        let reference = format!("&{name}");
                        args.insert((*position).min(args.len()), reference.clone());
                        names.insert(*id, reference);
                    }
                }
            }
            let call = format!("{}({})", hints.symbol, args.join(", "));

            match (&hints.result, produced) {
                (ResultHint::Instance { host_type, binding: Binding::Return, .. }, Some((id, name))) => {
                    lines.push(format!("{INDENT}{} = {call};", declaration(host_type, &name)));
                    names.insert(id, name);
                }
                (ResultHint::Instance { returns: Some(status), .. }, Some(_)) => {
                    lines.extend(discarded(dialect, index, status, &call));
                }
                (ResultHint::Instance { returns: None, .. }, Some(_)) | (ResultHint::None, _) => {
                    lines.push(format!("{INDENT}{call};"));
                }
                (ResultHint::Scalar { host_type }, _) | (ResultHint::Instance { host_type, .. }, None) => {
                    lines.extend(discarded(dialect, index, host_type, &call));
                }
            }
        }

        lines.push(format!("{INDENT}return {};", self.style.sentinel));
        lines.push("}".to_string());
        let mut text = lines.join("\n");
        text.push('\n');
        Ok(text)
    }

    fn literal(&self, value: &ScalarValue) -> Result<String, String> {
        let dialect = self.style.dialect;
        match value {
            ScalarValue::Bool(value) => Ok(dialect.boolean(*value).to_string()),
            ScalarValue::Int(value) => Ok(if *value == i64::MIN {
                "(-9223372036854775807LL - 1)".to_string()
            } else if i32::try_from(*value).is_ok() {
                value.to_string()
            } else {
                format!("{value}LL")
            }),
            ScalarValue::Float(value) if !value.is_finite() => {
                Err(format!("non-finite float {value} has no literal form"))
            }
            ScalarValue::Float(value) => Ok(format!("{value:?}")),
            ScalarValue::Str(text) => Ok(quoted(text.as_bytes())),
            ScalarValue::UInt(value) => Ok(format!("{value}ULL")),
            ScalarValue::Special(SpecialScalar::Null {}) => Ok(dialect.null().to_string()),
            ScalarValue::Special(SpecialScalar::Symbol(name)) => Ok(name.clone()),
            ScalarValue::Special(SpecialScalar::Bytes(bytes)) => Ok(quoted(bytes)),
            ScalarValue::Special(SpecialScalar::Opaque(tag)) => self
                .style
                .literals
                .get(tag)
                .cloned()
                .ok_or_else(|| format!("opaque literal '{tag}' has no registered textual form")),
        }
    }
}
