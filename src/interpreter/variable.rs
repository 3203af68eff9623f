//! Variable model & resolution (C3, §3.2, §3.4, §4.3).

use indexmap::IndexMap;
use std::sync::Arc;

use crate::ast::types::{FieldStep, SourceLocation};
use crate::interpreter::errors::{FieldAccessError, InterpreterError, TypeMismatch};
use crate::interpreter::executable::ExecutableDef;
use crate::interpreter::security::SecurityDescriptor;

/// The closed kind set a `Variable` can hold (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    SimpleText,
    InterpolatedText,
    Primitive,
    Object,
    Array,
    Path,
    Executable,
    PipelineInput,
    Structured,
    Imported,
}

/// The kind of structured-value wrapper (§3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredKind {
    Json,
    Xml,
    Csv,
    Text,
}

/// `StructuredValue{kind, data, text, metadata?, internal?}` — `text` is
/// the canonical stringification; `data` is the parsed form used by field
/// access and `.data`.
#[derive(Debug, Clone)]
pub struct StructuredValue {
    pub kind: StructuredKind,
    pub data: Box<Value>,
    pub text: String,
    pub metadata: Option<IndexMap<String, Value>>,
}

/// A loaded-file wrapper that auto-unwraps to `.content` in shell/JS
/// contexts (§4.3, §4.5).
#[derive(Debug, Clone)]
pub struct LoadContentResult {
    pub path: String,
    pub content: String,
    pub metadata: IndexMap<String, Value>,
}

/// The runtime value produced by evaluation. Distinct from `ast::types::Node`:
/// a `Value` is the *result* of evaluating a node, never the node itself.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Path(String),
    Structured(StructuredValue),
    LoadContent(LoadContentResult),
    LoadContentArray(Vec<LoadContentResult>),
    /// A reference to an executable Variable; `@fn` with no call parens
    /// yields this rather than invoking it (§4.4 edge cases).
    Executable(Arc<ExecutableDef>),
    /// Sentinel written in place of a circular structure during module
    /// scope serialization (§4.6 step 5).
    Circular,
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Circular => true,
            _ => true,
        }
    }

    /// Canonical stringification, used for interpolation and shell/JS
    /// contexts. `LoadContentResult`/arrays-of-it auto-unwrap here (§4.3).
    pub fn as_display_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Text(s) => s.clone(),
            Value::Path(p) => p.clone(),
            Value::Structured(s) => s.text.clone(),
            Value::LoadContent(l) => l.content.clone(),
            Value::LoadContentArray(items) => {
                items.iter().map(|i| i.content.clone()).collect::<Vec<_>>().join("\n")
            }
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| v.as_display_text()).collect();
                format!("[{}]", rendered.join(", "))
            }
            Value::Object(_) => serde_json::to_string(&self.to_json()).unwrap_or_default(),
            Value::Executable(_) => "<executable>".to_string(),
            Value::Circular => "<circular>".to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::json!(n),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Path(p) => serde_json::Value::String(p.clone()),
            Value::Structured(s) => s.data.to_json(),
            Value::LoadContent(l) => serde_json::Value::String(l.content.clone()),
            Value::LoadContentArray(items) => {
                serde_json::Value::Array(items.iter().map(|i| serde_json::Value::String(i.content.clone())).collect())
            }
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(obj)
            }
            Value::Executable(_) => serde_json::Value::String("<executable>".to_string()),
            Value::Circular => serde_json::Value::String("<circular>".to_string()),
        }
    }

    /// Structural equality used by `Equality`/`Condition` resolution
    /// contexts. `LoadContentResult` compares by content, not unwrapped
    /// text, per the resolved Open Question in SPEC_FULL.md §9.
    pub fn structurally_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Path(a), Value::Path(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structurally_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| v.structurally_eq(bv)))
            }
            (Value::LoadContent(a), Value::LoadContent(b)) => {
                a.path == b.path && a.content == b.content
            }
            (Value::Structured(a), Value::Structured(b)) => a.text == b.text,
            _ => false,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Records how a variable was defined (§3.2 `source`).
#[derive(Debug, Clone)]
pub struct VariableSource {
    pub directive: String,
    pub syntax_kind: String,
    pub has_interpolation: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VariableMetadata {
    pub defined_at: SourceLocation,
    pub security: Option<SecurityDescriptor>,
    pub captured_module_env: Option<Arc<crate::interpreter::environment::Environment>>,
    pub is_system: bool,
    pub is_parameter: bool,
    pub is_pipeline_result: bool,
    pub is_retryable: bool,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub value: Value,
    pub source: VariableSource,
    pub metadata: VariableMetadata,
}

impl Variable {
    pub fn new(name: impl Into<String>, kind: VariableKind, value: Value, source: VariableSource) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            source,
            metadata: VariableMetadata::default(),
        }
    }

    pub fn simple_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            name,
            VariableKind::SimpleText,
            Value::Text(text.into()),
            VariableSource { directive: "var".into(), syntax_kind: "text".into(), has_interpolation: false },
        )
    }
}

/// Resolution context for a variable reference (§4.1 rule 4). Controls
/// unwrapping, auto-execution of executables, and null-vs-error semantics
/// for missing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionContext {
    FieldAccess,
    StringInterpolation,
    Equality,
    Condition,
}

impl ResolutionContext {
    /// Whether a bare executable reference auto-executes with no args in
    /// this context. String interpolation and equality never auto-call;
    /// field access and conditions may, per the language's "call-by-display"
    /// convention for zero-arg executables used as values.
    pub fn auto_executes(&self) -> bool {
        matches!(self, ResolutionContext::StringInterpolation)
    }

    /// Whether `LoadContentResult` should auto-unwrap to its `.content` in
    /// this context (resolved Open Question, SPEC_FULL.md §9): only in
    /// string/shell contexts, never in equality/condition.
    pub fn auto_unwraps_load_content(&self) -> bool {
        matches!(self, ResolutionContext::StringInterpolation | ResolutionContext::FieldAccess)
    }
}

/// Walks a field-access path against a `Value` (§4.3): dot, bracket index
/// (`[i]`, `[-i]`), slice (`[a:b]`), and string indexing. `Optional` marks
/// the preceding step so a missing value yields `Value::Null` instead of an
/// error.
pub fn resolve_field_path(
    base: &Value,
    steps: &[FieldStep],
    location: SourceLocation,
) -> Result<Value, InterpreterError> {
    let mut current = base.clone();
    let mut steps_iter = steps.iter().peekable();

    while let Some(step) = steps_iter.next() {
        let optional = matches!(steps_iter.peek(), Some(FieldStep::Optional));
        if optional {
            steps_iter.next();
        }

        let next = match step {
            FieldStep::Name(name) | FieldStep::StringKey(name) => access_named(&current, name),
            FieldStep::Index(i) => access_index(&current, *i),
            FieldStep::Slice(start, end) => access_slice(&current, *start, *end),
            FieldStep::Optional => Ok(Some(current.clone())),
        };

        match next {
            Ok(Some(value)) => current = value,
            Ok(None) if optional => return Ok(Value::Null),
            Ok(None) => {
                return Err(FieldAccessError {
                    message: format!("missing field in {:?}", step),
                    location,
                }
                .into())
            }
            Err(e) => {
                if optional {
                    return Ok(Value::Null);
                }
                return Err(e);
            }
        }
    }

    Ok(current)
}

fn access_named(value: &Value, name: &str) -> Result<Option<Value>, InterpreterError> {
    match value {
        Value::Object(map) => Ok(map.get(name).cloned()),
        Value::Structured(s) => access_named(&s.data, name),
        Value::Null => Ok(None),
        other => Err(TypeMismatch {
            expected: "object".into(),
            actual: format!("{:?}", other),
            location: SourceLocation::SYNTHETIC,
        }
        .into()),
    }
}

fn access_index(value: &Value, index: i64) -> Result<Option<Value>, InterpreterError> {
    match value {
        Value::Array(items) => {
            let len = items.len() as i64;
            let idx = if index < 0 { len + index } else { index };
            if idx < 0 || idx >= len {
                Ok(None)
            } else {
                Ok(Some(items[idx as usize].clone()))
            }
        }
        Value::Structured(s) => access_index(&s.data, index),
        Value::Null => Ok(None),
        other => Err(TypeMismatch {
            expected: "array".into(),
            actual: format!("{:?}", other),
            location: SourceLocation::SYNTHETIC,
        }
        .into()),
    }
}

/// Python-style slicing: negative indices count from the end; out-of-range
/// bounds clamp rather than error (§4.3).
fn access_slice(value: &Value, start: Option<i64>, end: Option<i64>) -> Result<Option<Value>, InterpreterError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Structured(s) => return access_slice(&s.data, start, end),
        Value::Null => return Ok(None),
        other => {
            return Err(TypeMismatch {
                expected: "array".into(),
                actual: format!("{:?}", other),
                location: SourceLocation::SYNTHETIC,
            }
            .into())
        }
    };

    let len = items.len() as i64;
    let normalize = |i: i64| -> i64 {
        let v = if i < 0 { len + i } else { i };
        v.clamp(0, len)
    };
    let start = normalize(start.unwrap_or(0));
    let end = normalize(end.unwrap_or(len));
    if start >= end {
        return Ok(Some(Value::Array(Vec::new())));
    }
    Ok(Some(Value::Array(items[start as usize..end as usize].to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_array() -> Value {
        Value::Array(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0), Value::Number(4.0)])
    }

    #[test]
    fn dot_access_on_object() {
        let mut map = IndexMap::new();
        map.insert("name".to_string(), Value::Text("Alice".into()));
        let obj = Value::Object(map);
        let result = resolve_field_path(&obj, &[FieldStep::Name("name".into())], SourceLocation::SYNTHETIC).unwrap();
        assert_eq!(result.as_display_text(), "Alice");
    }

    #[test]
    fn negative_index_counts_from_end() {
        let result = resolve_field_path(&sample_array(), &[FieldStep::Index(-1)], SourceLocation::SYNTHETIC).unwrap();
        assert_eq!(result.as_display_text(), "4");
    }

    #[test]
    fn slice_is_python_style() {
        let result = resolve_field_path(&sample_array(), &[FieldStep::Slice(Some(1), Some(3))], SourceLocation::SYNTHETIC).unwrap();
        match result {
            Value::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn optional_suffix_yields_null_on_missing_field() {
        let map = IndexMap::new();
        let obj = Value::Object(map);
        let result = resolve_field_path(
            &obj,
            &[FieldStep::Name("missing".into()), FieldStep::Optional],
            SourceLocation::SYNTHETIC,
        )
        .unwrap();
        assert!(matches!(result, Value::Null));
    }

    #[test]
    fn missing_field_without_optional_errors() {
        let map = IndexMap::new();
        let obj = Value::Object(map);
        let result = resolve_field_path(&obj, &[FieldStep::Name("missing".into())], SourceLocation::SYNTHETIC);
        assert!(result.is_err());
    }

    #[test]
    fn load_content_compares_structurally_not_by_unwrap() {
        let a = Value::LoadContent(LoadContentResult { path: "a.txt".into(), content: "hi".into(), metadata: IndexMap::new() });
        let b = Value::LoadContent(LoadContentResult { path: "a.txt".into(), content: "hi".into(), metadata: IndexMap::new() });
        assert!(a.structurally_eq(&b));
    }

    #[test]
    fn resolution_context_controls_auto_unwrap() {
        assert!(ResolutionContext::StringInterpolation.auto_unwraps_load_content());
        assert!(!ResolutionContext::Equality.auto_unwraps_load_content());
        assert!(!ResolutionContext::Condition.auto_unwraps_load_content());
    }
}
