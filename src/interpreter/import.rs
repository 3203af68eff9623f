//! Import & module-scope engine (C6, §4.6).
//!
//! The push-child-state/evaluate/pop-and-selectively-merge shape is grounded
//! on the teacher's `builtins/source_cmd.rs`
//! (`prepare_source_state`/`restore_source_state`), generalized from
//! positional-parameter save/restore around a nested script execution to a
//! whole child `Environment` evaluated under `isImporting` and merged back
//! by export manifest. Import-cycle detection reuses the teacher's
//! `check_recursion_limit` recursion-guard idiom, applied to an explicit
//! stack of in-flight import specifiers rather than call depth.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::types::{Node, SourceLocation};
use crate::interpreter::environment::Environment;
use crate::interpreter::errors::{
    CircularImport, ExportedNameNotFound, ImportChainError, InterpreterError, UnknownNodeKind,
};
use crate::interpreter::evaluator::{self, EvalContext};
use crate::interpreter::variable::{ResolutionContext, Value, Variable, VariableKind};

/// `/import { a, b } from "./x.mld"` / `/import "./x.mld" as ns` (§4.6).
pub async fn evaluate_import(
    values: &BTreeMap<String, Node>,
    location: SourceLocation,
    env: &Arc<Environment>,
) -> Result<Value, InterpreterError> {
    let path_node = values.get("path").ok_or_else(|| UnknownNodeKind { kind: "import:missing-path".into(), location })?;
    let specifier = eval_text(path_node, env, location).await?;

    {
        let stack = env.import_stack.lock().await;
        if stack.iter().any(|s| s == &specifier) {
            return Err(CircularImport { specifier, chain: stack.clone() }.into());
        }
    }
    env.import_stack.lock().await.push(specifier.clone());

    let outcome = run_import(&specifier, values, location, env).await;

    let chain = {
        let mut stack = env.import_stack.lock().await;
        stack.pop();
        stack.clone()
    };

    outcome.map_err(|source| match source {
        InterpreterError::CircularImport(_) => source,
        other => ImportChainError { import_chain: chain, source: Box::new(other) }.into(),
    })
}

#[tracing::instrument(name = "import", skip_all, fields(specifier = %specifier))]
async fn run_import(
    specifier: &str,
    values: &BTreeMap<String, Node>,
    location: SourceLocation,
    env: &Arc<Environment>,
) -> Result<Value, InterpreterError> {
    let resolve_ctx = crate::interpreter::contracts::ResolveContext {
        requesting_path: env.path_context().current_file_path,
        payload: None,
    };
    let resolved = env.resolver_manager.resolve(specifier, &resolve_ctx, location).await?;
    let parsed = env.parser.parse(&resolved.content)?;

    let module_env = env.create_child(None);
    module_env.set_importing(true);
    for node in &parsed.nodes {
        evaluator::evaluate(node, &module_env, EvalContext::document()).await?;
    }
    module_env.set_importing(false);

    let exported = exported_variables(&module_env);

    match (values.get("names"), values.get("namespace")) {
        (Some(Node::ArrayLiteral { elements, .. }), _) => {
            let requested: Vec<String> = elements
                .iter()
                .filter_map(|n| if let Node::Text { value, .. } = n { Some(value.clone()) } else { None })
                .collect();
            for name in &requested {
                let variable = exported
                    .iter()
                    .find(|v| &v.name == name)
                    .cloned()
                    .ok_or_else(|| ExportedNameNotFound { name: name.clone(), location })?;
                bind_import(env, specifier, &module_env, variable, location)?;
            }
        }
        (None, Some(namespace_node)) => {
            let namespace = eval_text(namespace_node, env, location).await?;
            let mut map = indexmap::IndexMap::new();
            for variable in &exported {
                map.insert(variable.name.clone(), variable.value.clone());
            }
            env.track_import_binding(&namespace, specifier, location)?;
            let mut variable = Variable::new(
                &namespace,
                VariableKind::Object,
                Value::Object(map),
                crate::interpreter::variable::VariableSource {
                    directive: "import".into(),
                    syntax_kind: "namespace".into(),
                    has_interpolation: false,
                },
            );
            variable.metadata.defined_at = location;
            env.set_variable(variable)?;
        }
        (None, None) => {
            for variable in exported {
                bind_import(env, specifier, &module_env, variable, location)?;
            }
        }
        (Some(other), _) => {
            return Err(UnknownNodeKind { kind: format!("import:names-not-array:{}", other.kind_name()), location }.into());
        }
    }

    Ok(Value::Null)
}

/// §4.6 step 4: explicit (or wildcard) export manifest wins; otherwise every
/// non-system top-level variable is auto-exported (legacy behavior).
fn exported_variables(module_env: &Arc<Environment>) -> Vec<Variable> {
    let manifest = module_env.export_manifest();
    let own = module_env.own_variables();
    if manifest.is_empty() {
        own.into_iter().filter(|v| !v.metadata.is_system).collect()
    } else {
        own.into_iter().filter(|v| manifest.wildcard || manifest.names.contains(&v.name)).collect()
    }
}

/// §4.6 step 5/6: serializes one exported variable's scope (executables and
/// templates capture the whole module environment so later invocation never
/// consults the importer's scope — the system's key isolation property) and
/// binds it into the importer.
fn bind_import(
    env: &Arc<Environment>,
    specifier: &str,
    module_env: &Arc<Environment>,
    mut variable: Variable,
    location: SourceLocation,
) -> Result<(), InterpreterError> {
    env.track_import_binding(&variable.name, specifier, location)?;
    if matches!(variable.kind, VariableKind::Executable) {
        variable.metadata.captured_module_env = Some(module_env.clone());
    }
    variable.metadata.defined_at = location;
    variable.kind = VariableKind::Imported;
    env.set_variable(variable)
}

async fn eval_text(node: &Node, env: &Arc<Environment>, location: SourceLocation) -> Result<String, InterpreterError> {
    let _ = location;
    let value = evaluator::evaluate(node, env, EvalContext::expression(ResolutionContext::StringInterpolation)).await?;
    Ok(value.as_display_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::DirectiveKind;
    use crate::interpreter::contracts::ParsedDocument;
    use crate::interpreter::environment::RootEnvironmentDeps;
    use crate::testing::MapParser;

    fn greeter_module() -> ParsedDocument {
        let mut var_values = BTreeMap::new();
        var_values.insert("name".to_string(), Node::text("greeting"));
        var_values.insert("value".to_string(), Node::text("hi"));
        let var_node = Node::directive(DirectiveKind::Var, "text", var_values);

        let mut exe_values = BTreeMap::new();
        exe_values.insert("name".to_string(), Node::text("greet"));
        exe_values.insert("body".to_string(), Node::text("echo hi"));
        let exe_node = Node::directive(DirectiveKind::Exe, "command", exe_values);

        ParsedDocument { nodes: vec![var_node, exe_node], frontmatter: None }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn named_import_binds_selected_names_with_captured_env() {
        let parser = MapParser::new().with_document("source text", greeter_module());
        let env = Environment::root(RootEnvironmentDeps {
            parser: Arc::new(parser),
            resolver_manager: Arc::new({
                let mut manager = crate::interpreter::contracts::ResolverManager::new();
                manager.register(Arc::new(crate::testing::StubResolver::new().with_module("./greeter.mld", "source text")));
                manager
            }),
            ..Default::default()
        });

        let mut values = BTreeMap::new();
        values.insert("path".to_string(), Node::text("./greeter.mld"));
        values.insert("names".to_string(), Node::array(vec![Node::text("greet")]));
        evaluate_import(&values, SourceLocation::SYNTHETIC, &env).await.unwrap();

        let bound = env.get_variable("greet").unwrap();
        assert!(matches!(bound.value, Value::Executable(_)));
        assert!(bound.metadata.captured_module_env.is_some());
        assert!(env.get_variable("greeting").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn namespace_import_binds_an_object() {
        let parser = crate::testing::MapParser::new().with_document("source text", greeter_module());
        let env = Environment::root(crate::interpreter::environment::RootEnvironmentDeps {
            parser: Arc::new(parser),
            resolver_manager: Arc::new({
                let mut manager = crate::interpreter::contracts::ResolverManager::new();
                manager.register(Arc::new(crate::testing::StubResolver::new().with_module("./greeter.mld", "source text")));
                manager
            }),
            ..Default::default()
        });
        let mut values = BTreeMap::new();
        values.insert("path".to_string(), Node::text("./greeter.mld"));
        values.insert("namespace".to_string(), Node::text("ns"));
        evaluate_import(&values, SourceLocation::SYNTHETIC, &env).await.unwrap();

        let ns = env.get_variable("ns").unwrap();
        match ns.value {
            Value::Object(map) => assert!(map.contains_key("greeting")),
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn self_importing_module_is_circular() {
        let mut import_values = BTreeMap::new();
        import_values.insert("path".to_string(), Node::text("./self.mld"));
        let import_node = Node::directive(DirectiveKind::Import, "module", import_values);
        let document = ParsedDocument { nodes: vec![import_node], frontmatter: None };

        let parser = crate::testing::MapParser::new().with_document("self content", document);
        let env = Environment::root(crate::interpreter::environment::RootEnvironmentDeps {
            parser: Arc::new(parser),
            resolver_manager: Arc::new({
                let mut manager = crate::interpreter::contracts::ResolverManager::new();
                manager.register(Arc::new(crate::testing::StubResolver::new().with_module("./self.mld", "self content")));
                manager
            }),
            ..Default::default()
        });

        let mut values = BTreeMap::new();
        values.insert("path".to_string(), Node::text("./self.mld"));
        let result = evaluate_import(&values, SourceLocation::SYNTHETIC, &env).await;
        assert!(matches!(result, Err(InterpreterError::CircularImport(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_import_binding_reports_conflict() {
        let parser = crate::testing::MapParser::new().with_document("source text", greeter_module());
        let env = Environment::root(crate::interpreter::environment::RootEnvironmentDeps {
            parser: Arc::new(parser),
            resolver_manager: Arc::new({
                let mut manager = crate::interpreter::contracts::ResolverManager::new();
                manager.register(Arc::new(crate::testing::StubResolver::new().with_module("./greeter.mld", "source text")));
                manager
            }),
            ..Default::default()
        });
        let mut values = BTreeMap::new();
        values.insert("path".to_string(), Node::text("./greeter.mld"));
        values.insert("names".to_string(), Node::array(vec![Node::text("greet")]));
        evaluate_import(&values, SourceLocation::SYNTHETIC, &env).await.unwrap();
        let result = evaluate_import(&values, SourceLocation::new(2, 1, 0), &env).await;
        assert!(result.is_err());
    }
}
