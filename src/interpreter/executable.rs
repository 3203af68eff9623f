//! Executable engine (C4, §3.3, §4.4).
//!
//! Invocation setup/teardown (push child env, bind params, recursion-depth
//! check, pop child env even on error paths) is grounded on the teacher's
//! `setup_function_call`/`cleanup_function_call`/`call_function<F>`
//! orchestration in `interpreter/functions.rs`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::types::{CodeLanguage, InterpolationKind, Node, SourceLocation};
use crate::interpreter::contracts::{CodeOptions, ExecOptions};
use crate::interpreter::environment::Environment;
use crate::interpreter::errors::{CallDepthExceeded, InterpreterError};
use crate::interpreter::variable::{LoadContentResult, Value};

/// `ExecutableDef` is a tagged union over the six invokable forms (§3.3).
#[derive(Clone)]
pub enum ExecutableDef {
    Command {
        template: Vec<Node>,
        params: Vec<String>,
    },
    Code {
        template: Vec<Node>,
        language: CodeLanguage,
        params: Vec<String>,
    },
    Template {
        nodes: Vec<Node>,
        interpolation: InterpolationKind,
        params: Vec<String>,
    },
    Section {
        path_template: Vec<Node>,
        section_template: Vec<Node>,
        rename_template: Option<Vec<Node>>,
        params: Vec<String>,
    },
    CommandRef {
        target: String,
        args: Vec<Node>,
        params: Vec<String>,
    },
    Resolver {
        path: String,
        payload_template: Option<Vec<Node>>,
        params: Vec<String>,
    },
    /// Preregistered built-in transformer (`@json`, `@xml`, `@csv`,
    /// `@upper`, `@lower`, ...), dispatched identically to user `/exe`
    /// definitions (§4.4 edge cases).
    Builtin {
        name: String,
        params: Vec<String>,
        function: Arc<dyn Fn(&[Value]) -> Result<Value, InterpreterError> + Send + Sync>,
    },

    /// A reference used only while retroactively patching mutually
    /// recursive shadow-env peers (§4.4 step 3): never invoked directly.
    #[doc(hidden)]
    ShadowPlaceholder,
}

impl std::fmt::Debug for ExecutableDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutableDef({})", self.param_names().join(", "))
    }
}

impl ExecutableDef {
    pub fn param_names(&self) -> &[String] {
        match self {
            ExecutableDef::Command { params, .. }
            | ExecutableDef::Code { params, .. }
            | ExecutableDef::Template { params, .. }
            | ExecutableDef::Section { params, .. }
            | ExecutableDef::CommandRef { params, .. }
            | ExecutableDef::Resolver { params, .. }
            | ExecutableDef::Builtin { params, .. } => params,
            ExecutableDef::ShadowPlaceholder => &[],
        }
    }
}

/// Bound argument environment for one invocation: positional args bound to
/// `paramNames` in a child environment; missing trailing args become
/// `Value::Null` rather than erroring (§4.4 step 2, §8.1).
pub fn bind_parameters(
    params: &[String],
    args: &[Value],
    child: &Environment,
) -> Result<(), InterpreterError> {
    for (i, name) in params.iter().enumerate() {
        let value = args.get(i).cloned().unwrap_or(Value::Null);
        child.set_parameter_variable(name, value)?;
    }
    Ok(())
}

/// Call-stack bookkeeping shared by every invocation path. Tracks only
/// depth, not name uniqueness: ordinary recursive `/exe` invocations
/// (a named executable calling itself, directly or via code/command
/// execution) are expected and terminate on their own base case (§3.3,
/// §4.5) — `max_call_depth` is the only backstop needed here. Mirrors
/// the teacher's `check_recursion_limit`, generalized from a depth-only
/// guard.
#[derive(Debug, Default)]
pub struct CallStack {
    depth: usize,
}

impl CallStack {
    pub fn push(&mut self, _name: &str, max_depth: usize, location: SourceLocation) -> Result<(), InterpreterError> {
        if self.depth >= max_depth {
            return Err(CallDepthExceeded { limit: max_depth, location }.into());
        }
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Normalizes an invocation result into a `StructuredValue` when the
/// language produces structured output (JSON-looking text) (§4.4 step 4).
pub fn normalize_result(language: Option<CodeLanguage>, raw: Value) -> Value {
    match (&language, &raw) {
        (Some(CodeLanguage::Js) | Some(CodeLanguage::Node), Value::Text(text)) => {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) {
                if parsed.is_object() || parsed.is_array() {
                    return Value::Structured(crate::interpreter::variable::StructuredValue {
                        kind: crate::interpreter::variable::StructuredKind::Json,
                        data: Box::new(json_to_value(&parsed)),
                        text: text.clone(),
                        metadata: None,
                    });
                }
            }
            raw
        }
        _ => raw,
    }
}

pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            let mut out = indexmap::IndexMap::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_value(v));
            }
            Value::Object(out)
        }
    }
}

/// Converts positional args + params into shell environment variables
/// (§4.4 step 3, **command**): "Parameters are additionally exported as
/// environment variables."
pub fn params_as_env(params: &[String], args: &[Value]) -> HashMap<String, String> {
    params
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), args.get(i).map(Value::as_display_text).unwrap_or_default()))
        .collect()
}

/// Converts bound params + object-literal args into `ExecOptions`/`CodeOptions`
/// stdin/env carriers shared across command/code invocation paths.
pub fn base_exec_options(env: HashMap<String, String>, cwd: Option<String>) -> ExecOptions {
    ExecOptions { env, cwd, ..Default::default() }
}

pub fn base_code_options(cwd: Option<String>) -> CodeOptions {
    CodeOptions { cwd, ..Default::default() }
}

/// Payload-size guard on `/run` and command-executable invocation (§8.3):
/// an enabled `max_payload_bytes` limit turns an oversized command into
/// `PayloadTooLarge` rather than handing it to the executor. Splitting an
/// oversized payload across a heredoc/env-var channel is the executor's
/// concern (§6.3), not this crate's.
pub fn check_payload_size(
    command: &str,
    config: &crate::interpreter::config::RuntimeConfig,
    location: SourceLocation,
) -> Result<(), InterpreterError> {
    if let Some(limit) = config.max_payload_bytes {
        if command.len() > limit {
            return Err(crate::interpreter::errors::PayloadTooLarge { size: command.len(), limit, location }.into());
        }
    }
    Ok(())
}

/// Dispatches code-executable arguments into JSON params, the form
/// `executeCode` expects (§6.3).
pub fn args_as_code_params(params: &[String], args: &[Value]) -> HashMap<String, serde_json::Value> {
    params
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), args.get(i).map(Value::to_json).unwrap_or(serde_json::Value::Null)))
        .collect()
}

/// One `LoadContentResult`'s path/metadata, shelved by content string so a
/// JS stage that returns the unwrapped content can be matched back to it
/// (§4.3, §4.5 "metadata shelf"; §9 DESIGN NOTES: "an evaluator-scoped
/// stack whose lifetime is the invocation, pushed/popped around each
/// JS-stage execution" — the teacher has no equivalent to generalize from,
/// since this is purely an mlld concept; `tokio::task_local!` gives the
/// task-scoped push/pop the original thread-local had, without a global).
#[derive(Clone)]
pub struct ShelfEntry {
    content: String,
    path: String,
    metadata: IndexMap<String, Value>,
}

tokio::task_local! {
    static METADATA_SHELF: Arc<Vec<ShelfEntry>>;
}

/// Collects shelf entries for every `LoadContentResult` among a code
/// executable's bound arguments, single or array-wrapped (§4.3).
pub fn collect_shelf_entries(args: &[Value]) -> Vec<ShelfEntry> {
    let mut entries = Vec::new();
    for arg in args {
        match arg {
            Value::LoadContent(l) => {
                entries.push(ShelfEntry { content: l.content.clone(), path: l.path.clone(), metadata: l.metadata.clone() })
            }
            Value::LoadContentArray(items) => {
                for l in items {
                    entries.push(ShelfEntry { content: l.content.clone(), path: l.path.clone(), metadata: l.metadata.clone() })
                }
            }
            _ => {}
        }
    }
    entries
}

/// Runs `fut` with `entries` shelved, cleared deterministically when `fut`
/// completes (task_local's `scope` pops on drop) — the push/pop half of
/// the metadata shelf.
pub async fn with_metadata_shelf<F: Future>(entries: Vec<ShelfEntry>, fut: F) -> F::Output {
    if entries.is_empty() {
        return fut.await;
    }
    METADATA_SHELF.scope(Arc::new(entries), fut).await
}

/// The re-wrap half: if a JS stage's result is exactly the shelved content
/// (single string, or an array where every element matches a shelved
/// entry), restore the `LoadContentResult`/`LoadContentArray` wrapper
/// instead of leaving it as bare text (§8.2 round-trip property).
fn rewrap_with_entries(value: &Value, entries: &[ShelfEntry]) -> Option<Value> {
    match value {
        Value::Text(text) => entries.iter().find(|e| &e.content == text).map(|e| {
            Value::LoadContent(LoadContentResult { path: e.path.clone(), content: e.content.clone(), metadata: e.metadata.clone() })
        }),
        Value::Array(items) => {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                let Value::Text(text) = item else { return None };
                let Some(entry) = entries.iter().find(|e| &e.content == text) else { return None };
                results.push(LoadContentResult { path: entry.path.clone(), content: entry.content.clone(), metadata: entry.metadata.clone() });
            }
            if results.is_empty() { None } else { Some(Value::LoadContentArray(results)) }
        }
        _ => None,
    }
}

/// Applies `rewrap_with_entries` against whatever is currently shelved
/// (no-op outside a `with_metadata_shelf` scope).
pub fn rewrap_from_shelf(value: Value) -> Value {
    let rewrapped = METADATA_SHELF.try_with(|entries| rewrap_with_entries(&value, entries));
    match rewrapped {
        Ok(Some(v)) => v,
        _ => value,
    }
}

/// The standard built-in transformers (§4.4 edge cases): `@json`, `@xml`,
/// `@csv`, `@upper`, `@lower`.
pub fn builtin_transformers() -> Vec<ExecutableDef> {
    vec![
        builtin("json", |args| {
            let value = args.first().cloned().unwrap_or(Value::Null);
            let text = serde_json::to_string(&value.to_json()).unwrap_or_default();
            Ok(Value::Structured(crate::interpreter::variable::StructuredValue {
                kind: crate::interpreter::variable::StructuredKind::Json,
                data: Box::new(value),
                text,
                metadata: None,
            }))
        }),
        builtin("upper", |args| {
            Ok(Value::Text(args.first().map(Value::as_display_text).unwrap_or_default().to_uppercase()))
        }),
        builtin("lower", |args| {
            Ok(Value::Text(args.first().map(Value::as_display_text).unwrap_or_default().to_lowercase()))
        }),
        builtin("csv", |args| {
            let text = args.first().map(Value::as_display_text).unwrap_or_default();
            let data = parse_csv_rows(&text)?;
            Ok(Value::Structured(crate::interpreter::variable::StructuredValue {
                kind: crate::interpreter::variable::StructuredKind::Csv,
                data: Box::new(data),
                text,
                metadata: None,
            }))
        }),
        builtin("xml", |args| {
            let text = args.first().map(Value::as_display_text).unwrap_or_default();
            Ok(Value::Structured(crate::interpreter::variable::StructuredValue {
                kind: crate::interpreter::variable::StructuredKind::Xml,
                data: Box::new(Value::Text(text.clone())),
                text,
                metadata: None,
            }))
        }),
    ]
}

/// Header-keyed row objects, mirroring the teacher's `xan_cmd.rs` flexible,
/// headerless-tolerant reader but promoting the first record to field names
/// since `.data` is meant for direct field access rather than positional rows.
fn parse_csv_rows(text: &str) -> Result<Value, InterpreterError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(text.as_bytes());
    let headers: Vec<String> = reader.headers().map(|h| h.iter().map(str::to_string).collect()).unwrap_or_default();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| crate::interpreter::errors::StructuredParseError {
            kind: "csv".into(),
            message: e.to_string(),
            location: SourceLocation::SYNTHETIC,
        })?;
        let mut row = IndexMap::new();
        for (index, field) in record.iter().enumerate() {
            let key = headers.get(index).cloned().unwrap_or_else(|| index.to_string());
            row.insert(key, Value::Text(field.to_string()));
        }
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

fn builtin(
    name: &'static str,
    function: impl Fn(&[Value]) -> Result<Value, InterpreterError> + Send + Sync + 'static,
) -> ExecutableDef {
    ExecutableDef::Builtin { name: name.to_string(), params: vec!["value".to_string()], function: Arc::new(function) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_shelf_rewraps_single_file_content() {
        let loaded = Value::LoadContent(LoadContentResult {
            path: "notes.md".into(),
            content: "hello".into(),
            metadata: IndexMap::new(),
        });
        let entries = collect_shelf_entries(&[loaded]);
        let rewrapped = with_metadata_shelf(entries, async { rewrap_from_shelf(Value::Text("hello".into())) }).await;
        match rewrapped {
            Value::LoadContent(l) => assert_eq!(l.path, "notes.md"),
            other => panic!("expected LoadContent, got {:?}", other),
        }
    }

    #[test]
    fn rewrap_outside_shelf_scope_is_a_no_op() {
        let rewrapped = rewrap_from_shelf(Value::Text("untracked".into()));
        assert_eq!(rewrapped.as_display_text(), "untracked");
    }

    #[test]
    fn missing_trailing_args_bind_to_null() {
        let env = Environment::root(Default::default());
        bind_parameters(&["a".to_string(), "b".to_string()], &[Value::Text("x".into())], &env).unwrap();
        assert!(matches!(env.get_variable("b").unwrap().value, Value::Null));
    }

    #[test]
    fn payload_size_check_passes_when_limit_disabled() {
        let config = crate::interpreter::config::RuntimeConfig::default();
        assert!(check_payload_size("echo hi", &config, SourceLocation::SYNTHETIC).is_ok());
    }

    #[test]
    fn payload_size_check_rejects_oversized_command() {
        let config = crate::interpreter::config::RuntimeConfig { max_payload_bytes: Some(4), ..Default::default() };
        let result = check_payload_size("echo hello world", &config, SourceLocation::SYNTHETIC);
        assert!(matches!(result, Err(InterpreterError::PayloadTooLarge(_))));
    }

    #[test]
    fn call_stack_allows_self_recursion_within_depth_limit() {
        let mut stack = CallStack::default();
        stack.push("f", 10, SourceLocation::SYNTHETIC).unwrap();
        let result = stack.push("f", 10, SourceLocation::SYNTHETIC);
        assert!(result.is_ok());
    }

    #[test]
    fn call_stack_enforces_depth_limit() {
        let mut stack = CallStack::default();
        for i in 0..3 {
            stack.push(&format!("f{i}"), 3, SourceLocation::SYNTHETIC).unwrap();
        }
        let result = stack.push("f3", 3, SourceLocation::SYNTHETIC);
        assert!(result.is_err());
    }

    #[test]
    fn builtin_upper_transforms_text() {
        let upper = &builtin_transformers()[1];
        if let ExecutableDef::Builtin { function, .. } = upper {
            let result = function(&[Value::Text("hi".into())]).unwrap();
            assert_eq!(result.as_display_text(), "HI");
        } else {
            panic!("expected builtin");
        }
    }

    #[test]
    fn builtin_csv_parses_header_keyed_rows() {
        let csv = &builtin_transformers()[3];
        if let ExecutableDef::Builtin { function, .. } = csv {
            let result = function(&[Value::Text("name,age\nava,3\nben,5".into())]).unwrap();
            match result {
                Value::Structured(structured) => match *structured.data {
                    Value::Array(rows) => {
                        assert_eq!(rows.len(), 2);
                        match &rows[0] {
                            Value::Object(row) => {
                                assert_eq!(row.get("name").unwrap().as_display_text(), "ava");
                                assert_eq!(row.get("age").unwrap().as_display_text(), "3");
                            }
                            other => panic!("expected object row, got {:?}", other),
                        }
                    }
                    other => panic!("expected array data, got {:?}", other),
                },
                other => panic!("expected structured value, got {:?}", other),
            }
        } else {
            panic!("expected builtin");
        }
    }

    #[test]
    fn params_as_env_stringifies_values() {
        let env = params_as_env(&["count".to_string()], &[Value::Number(3.0)]);
        assert_eq!(env.get("count"), Some(&"3".to_string()));
    }
}
