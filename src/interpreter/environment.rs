//! Environment (C2, §3.5, §4.2).
//!
//! Modeled after the teacher's composed `InterpreterState` generalized from
//! a single flat bag to a reference-shared frame: mlld environments are
//! created per import/`/for`/`/exe`-invocation/pipeline-stage and form a
//! parent/child chain, so `Environment` is `Arc`-shared with an internal
//! `RwLock`ed table rather than owned-and-copied like a bash subshell.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::ast::types::SourceLocation;
use crate::interpreter::config::RuntimeConfig;
use crate::interpreter::contracts::{CodeExecutor, CommandExecutor, FileSystem, Parser, ResolverManager};
use crate::interpreter::effects::{Effect, EffectHandler, Stream};
use crate::interpreter::errors::{
    ExecParameterConflict, ImportNameConflict, InterpreterError, ReservedName, UnknownVariable,
};
use crate::interpreter::executable::{CallStack, ExecutableDef};
use crate::interpreter::security::{GuardRegistry, PolicyCapabilities, SecurityDescriptor};
use crate::interpreter::variable::{Value, Variable, VariableKind, VariableSource};

/// Built-in symbols and resolver prefixes that cannot be (re)defined in user
/// scope (§4.2).
pub const RESERVED_NAMES: &[&str] = &["now", "debug", "input", "base", "p", "mx", "ctx"];

#[derive(Debug, Clone, Default)]
pub struct PathContext {
    pub project_root: Option<String>,
    pub file_directory: Option<String>,
    pub execution_directory: Option<String>,
    pub invocation_directory: Option<String>,
    pub current_file_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportBinding {
    pub source: String,
    pub directive_location: SourceLocation,
}

/// Empty until `/export`; wildcard sets auto-export mode (§3.5, §4.6).
#[derive(Debug, Clone, Default)]
pub struct ExportManifest {
    pub names: HashSet<String>,
    pub wildcard: bool,
}

impl ExportManifest {
    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.names.is_empty()
    }
}

struct EnvironmentInner {
    variables: IndexMap<String, Variable>,
    import_bindings: HashMap<String, ImportBinding>,
    export_manifest: ExportManifest,
    shadow_envs: HashMap<String, IndexMap<String, Arc<ExecutableDef>>>,
    path_context: PathContext,
    is_importing: bool,
    operation_context_stack: Vec<crate::interpreter::security::OperationContext>,
    policy_capabilities: PolicyCapabilities,
    guard_registry: GuardRegistry,
    autoverify: bool,
}

/// One environment frame (§3.5). `Environment`s form a parent/child chain;
/// lookups walk the chain, writes only ever touch the owning frame (§5
/// shared-resources rule).
pub struct Environment {
    inner: RwLock<EnvironmentInner>,
    parent: Option<Arc<Environment>>,
    pub effect_handler: Arc<dyn EffectHandler>,
    pub command_executor: Arc<dyn CommandExecutor>,
    pub code_executor: Arc<dyn CodeExecutor>,
    pub resolver_manager: Arc<ResolverManager>,
    pub file_system: Arc<dyn FileSystem>,
    pub parser: Arc<dyn Parser>,
    pub config: Arc<RuntimeConfig>,
    /// Shared across the whole run's frame chain (recursion is a run-wide
    /// property, not a per-frame one): mirrors the teacher's
    /// `check_recursion_limit` operating on one shared call stack.
    pub call_stack: Arc<tokio::sync::Mutex<CallStack>>,
    /// Specifiers currently being imported, shared across the whole run
    /// (§4.6 "Import cycle detection reuses the teacher's recursion-guard
    /// idiom ... applied to an explicit stack of in-flight import
    /// specifiers rather than call depth").
    pub import_stack: Arc<tokio::sync::Mutex<Vec<String>>>,
    /// Target names currently being substituted through a `commandRef`
    /// alias chain, shared across the whole run. Scoped narrowly to that
    /// substitution step (§3.3 "detects circular refs") rather than to
    /// invocation in general, so an ordinary recursive `/exe` is never
    /// mistaken for a circular alias.
    pub command_ref_stack: Arc<tokio::sync::Mutex<Vec<String>>>,
}

pub struct RootEnvironmentDeps {
    pub effect_handler: Arc<dyn EffectHandler>,
    pub command_executor: Arc<dyn CommandExecutor>,
    pub code_executor: Arc<dyn CodeExecutor>,
    pub resolver_manager: Arc<ResolverManager>,
    pub file_system: Arc<dyn FileSystem>,
    pub parser: Arc<dyn Parser>,
    pub config: Arc<RuntimeConfig>,
}

impl Default for RootEnvironmentDeps {
    fn default() -> Self {
        Self {
            effect_handler: Arc::new(crate::interpreter::effects::CollectingEffectHandler::new()),
            command_executor: Arc::new(crate::testing::StubCommandExecutor::default()),
            code_executor: Arc::new(crate::testing::StubCodeExecutor::default()),
            resolver_manager: Arc::new(ResolverManager::new()),
            file_system: Arc::new(crate::testing::InMemoryFileSystem::default()),
            parser: Arc::new(crate::testing::MapParser::default()),
            config: Arc::new(RuntimeConfig::default()),
        }
    }
}

impl Environment {
    /// Root env created at `interpret()` start (§3.5 lifecycle).
    pub fn root(deps: RootEnvironmentDeps) -> Arc<Self> {
        let autoverify = deps.config.autoverify;
        let env = Arc::new(Self {
            inner: RwLock::new(EnvironmentInner {
                variables: IndexMap::new(),
                import_bindings: HashMap::new(),
                export_manifest: ExportManifest::default(),
                shadow_envs: HashMap::new(),
                path_context: PathContext::default(),
                is_importing: false,
                operation_context_stack: Vec::new(),
                policy_capabilities: PolicyCapabilities::new(),
                guard_registry: GuardRegistry::default(),
                autoverify,
            }),
            parent: None,
            effect_handler: deps.effect_handler,
            command_executor: deps.command_executor,
            code_executor: deps.code_executor,
            resolver_manager: deps.resolver_manager,
            file_system: deps.file_system,
            parser: deps.parser,
            config: deps.config,
            call_stack: Arc::new(tokio::sync::Mutex::new(CallStack::default())),
            import_stack: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            command_ref_stack: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        });
        register_builtin_transformers(&env);
        env
    }

    /// `createChild(dir?)` — a new frame with a lexical parent link (§4.2).
    pub fn create_child(self: &Arc<Self>, dir: Option<String>) -> Arc<Self> {
        let mut path_context = self.inner.read().unwrap().path_context.clone();
        if let Some(dir) = dir {
            path_context.execution_directory = Some(dir);
        }
        Arc::new(Self {
            inner: RwLock::new(EnvironmentInner {
                variables: IndexMap::new(),
                import_bindings: HashMap::new(),
                export_manifest: ExportManifest::default(),
                shadow_envs: HashMap::new(),
                path_context,
                is_importing: false,
                operation_context_stack: self.inner.read().unwrap().operation_context_stack.clone(),
                policy_capabilities: self.inner.read().unwrap().policy_capabilities.clone(),
                guard_registry: self.inner.read().unwrap().guard_registry.clone(),
                autoverify: self.inner.read().unwrap().autoverify,
            }),
            parent: Some(self.clone()),
            effect_handler: self.effect_handler.clone(),
            command_executor: self.command_executor.clone(),
            code_executor: self.code_executor.clone(),
            resolver_manager: self.resolver_manager.clone(),
            file_system: self.file_system.clone(),
            parser: self.parser.clone(),
            config: self.config.clone(),
            call_stack: self.call_stack.clone(),
            import_stack: self.import_stack.clone(),
            command_ref_stack: self.command_ref_stack.clone(),
        })
    }

    pub fn set_importing(&self, importing: bool) {
        self.inner.write().unwrap().is_importing = importing;
    }

    pub fn is_importing(&self) -> bool {
        self.inner.read().unwrap().is_importing
    }

    /// `setVariable`: reserved names rejected, same-frame collisions on
    /// executables/parameters rejected (§4.2, §8.3 — parent-frame shadowing
    /// is explicitly allowed).
    pub fn set_variable(&self, variable: Variable) -> Result<(), InterpreterError> {
        if RESERVED_NAMES.contains(&variable.name.as_str()) {
            return Err(ReservedName { name: variable.name.clone(), location: variable.metadata.defined_at }.into());
        }
        let mut inner = self.inner.write().unwrap();
        if !variable.metadata.is_parameter {
            if let Some(existing) = inner.variables.get(&variable.name) {
                if existing.metadata.is_parameter || matches!(existing.kind, VariableKind::Executable) {
                    return Err(ExecParameterConflict {
                        name: variable.name.clone(),
                        location: variable.metadata.defined_at,
                    }
                    .into());
                }
            }
        }
        inner.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    /// `setParameterVariable`: always shadows, even a same-named parent
    /// variable (§4.4 step 2, §8.3 shadowing rule).
    pub fn set_parameter_variable(&self, name: &str, value: Value) -> Result<(), InterpreterError> {
        let mut variable = Variable::new(
            name,
            variable_kind_for(&value),
            value,
            VariableSource { directive: "param".into(), syntax_kind: "parameter".into(), has_interpolation: false },
        );
        variable.metadata.is_parameter = true;
        self.inner.write().unwrap().variables.insert(name.to_string(), variable);
        Ok(())
    }

    /// Binds a reserved name (`p`, `mx`, `now`, ...) directly into this
    /// frame, bypassing `setVariable`'s reserved-name rejection — used only
    /// by the engine itself to inject ambient pipeline-stage context (§4.5).
    pub fn set_system_variable(&self, name: &str, value: Value) {
        let mut variable = Variable::new(
            name,
            variable_kind_for(&value),
            value,
            VariableSource { directive: "system".into(), syntax_kind: "ambient".into(), has_interpolation: false },
        );
        variable.metadata.is_system = true;
        self.inner.write().unwrap().variables.insert(name.to_string(), variable);
    }

    /// `getVariable(name)` — walks the parent chain; does **not** cross
    /// module/import boundaries (captured module envs are resolved
    /// separately, never through this chain — see `interpreter::import`).
    pub fn get_variable(&self, name: &str) -> Option<Variable> {
        if let Some(v) = self.inner.read().unwrap().variables.get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.get_variable(name))
    }

    pub fn require_variable(&self, name: &str, location: SourceLocation) -> Result<Variable, InterpreterError> {
        self.get_variable(name)
            .ok_or_else(|| UnknownVariable { name: name.to_string(), location }.into())
    }

    /// `trackImportedBinding` / `ensureImportBindingAvailable` (§4.2, §4.6
    /// step 6): records cross-scope bindings explicitly and rejects
    /// duplicates.
    pub fn track_import_binding(
        &self,
        name: &str,
        source: &str,
        location: SourceLocation,
    ) -> Result<(), InterpreterError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.import_bindings.get(name) {
            return Err(ImportNameConflict {
                name: name.to_string(),
                first_location: existing.directive_location,
                second_location: location,
            }
            .into());
        }
        inner
            .import_bindings
            .insert(name.to_string(), ImportBinding { source: source.to_string(), directive_location: location });
        Ok(())
    }

    pub fn set_export_manifest(&self, manifest: ExportManifest) {
        self.inner.write().unwrap().export_manifest = manifest;
    }

    pub fn export_manifest(&self) -> ExportManifest {
        self.inner.read().unwrap().export_manifest.clone()
    }

    /// All top-level (non-parent-inherited) variable names in this frame,
    /// in insertion order — used for legacy auto-export (§4.6 step 4) and
    /// `cleanNamespaceForDisplay`.
    pub fn own_variable_names(&self) -> Vec<String> {
        self.inner.read().unwrap().variables.keys().cloned().collect()
    }

    pub fn own_variables(&self) -> Vec<Variable> {
        self.inner.read().unwrap().variables.values().cloned().collect()
    }

    /// `emitEffect(stream, content, loc?)` (§4.2). Streaming-format run
    /// results bypass `both`-stream emission to avoid double output —
    /// callers pass `Stream::Doc`/`Stream::Stdout` directly rather than
    /// `Stream::Both` in that case.
    pub async fn emit_effect(&self, stream: Stream, content: impl Into<String>, location: Option<SourceLocation>) {
        self.effect_handler
            .emit(Effect { stream, content: content.into(), location, meta: Default::default() })
            .await;
    }

    /// `hasShadowEnvs / setShadowEnv` (§4.2).
    pub fn set_shadow_env(&self, language: &str, name: &str, def: Arc<ExecutableDef>) {
        self.inner
            .write()
            .unwrap()
            .shadow_envs
            .entry(language.to_string())
            .or_default()
            .insert(name.to_string(), def);
    }

    pub fn has_shadow_envs(&self, language: &str) -> bool {
        self.inner.read().unwrap().shadow_envs.contains_key(language)
    }

    pub fn shadow_env(&self, language: &str, name: &str) -> Option<Arc<ExecutableDef>> {
        self.inner.read().unwrap().shadow_envs.get(language).and_then(|m| m.get(name).cloned())
    }

    /// `captureAllShadowEnvs` — a deep-serialized snapshot of every
    /// language-keyed function map (§4.2, §4.6 step 5).
    pub fn capture_all_shadow_envs(&self) -> HashMap<String, IndexMap<String, Arc<ExecutableDef>>> {
        self.inner.read().unwrap().shadow_envs.clone()
    }

    pub fn path_context(&self) -> PathContext {
        self.inner.read().unwrap().path_context.clone()
    }

    pub fn push_operation_context(&self, ctx: crate::interpreter::security::OperationContext) {
        self.inner.write().unwrap().operation_context_stack.push(ctx);
    }

    pub fn pop_operation_context(&self) {
        self.inner.write().unwrap().operation_context_stack.pop();
    }

    pub fn current_operation_context(&self) -> Option<crate::interpreter::security::OperationContext> {
        self.inner.read().unwrap().operation_context_stack.last().cloned()
    }

    pub fn set_policy_capabilities(&self, policy: PolicyCapabilities) {
        self.inner.write().unwrap().policy_capabilities = policy;
    }

    pub fn policy_capabilities(&self) -> PolicyCapabilities {
        self.inner.read().unwrap().policy_capabilities.clone()
    }

    /// `/policy { autoverify: true }` sets this on the frame it runs in;
    /// child frames inherit the value in effect at creation time (§4.7).
    pub fn set_autoverify(&self, autoverify: bool) {
        self.inner.write().unwrap().autoverify = autoverify;
    }

    pub fn autoverify(&self) -> bool {
        self.inner.read().unwrap().autoverify
    }

    pub fn guard_registry_mut_register(&self, entry: crate::interpreter::security::GuardEntry) {
        self.inner.write().unwrap().guard_registry.register(entry);
    }

    pub fn guards_for(&self, op_label: &str) -> Vec<crate::interpreter::security::GuardEntry> {
        self.inner.read().unwrap().guard_registry.guards_for(op_label).into_iter().cloned().collect()
    }

    /// Merges label/taint/source sets between two descriptors — thin
    /// forwarder kept on `Environment` because §4.2 lists
    /// `mergeSecurityDescriptors` as an Environment operation.
    pub fn merge_security_descriptors(a: &SecurityDescriptor, b: &SecurityDescriptor) -> SecurityDescriptor {
        a.merge(b)
    }
}

/// Preregisters `@json`, `@xml`, `@csv`, `@upper`, `@lower` as ordinary
/// executable variables so they invoke through the same path as user
/// `/exe` definitions (§4.4 edge cases). Marked `is_system` so they don't
/// count toward a module's auto-export set (§4.6 step 4).
fn register_builtin_transformers(env: &Arc<Environment>) {
    for def in crate::interpreter::executable::builtin_transformers() {
        let name = match &def {
            crate::interpreter::executable::ExecutableDef::Builtin { name, .. } => name.clone(),
            _ => continue,
        };
        let mut variable = Variable::new(
            &name,
            VariableKind::Executable,
            Value::Executable(Arc::new(def)),
            VariableSource { directive: "builtin".into(), syntax_kind: "transformer".into(), has_interpolation: false },
        );
        variable.metadata.is_system = true;
        env.inner.write().unwrap().variables.insert(name, variable);
    }
}

fn variable_kind_for(value: &Value) -> VariableKind {
    match value {
        Value::Text(_) => VariableKind::SimpleText,
        Value::Number(_) | Value::Bool(_) | Value::Null => VariableKind::Primitive,
        Value::Object(_) => VariableKind::Object,
        Value::Array(_) | Value::LoadContentArray(_) => VariableKind::Array,
        Value::Path(_) => VariableKind::Path,
        Value::Executable(_) => VariableKind::Executable,
        Value::Structured(_) => VariableKind::Structured,
        Value::LoadContent(_) => VariableKind::Object,
        Value::Circular => VariableKind::Primitive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::SourceLocation;

    #[test]
    fn reserved_name_rejected() {
        let env = Environment::root(Default::default());
        let result = env.set_variable(Variable::simple_text("ctx", "x"));
        assert!(result.is_err());
    }

    #[test]
    fn child_does_not_leak_variables_upward() {
        let parent = Environment::root(Default::default());
        parent.set_variable(Variable::simple_text("name", "Alice")).unwrap();
        let child = parent.create_child(None);
        child.set_variable(Variable::simple_text("local", "x")).unwrap();

        assert!(parent.get_variable("local").is_none());
        assert_eq!(child.get_variable("name").unwrap().value.as_display_text(), "Alice");
    }

    #[test]
    fn parameter_shadows_parent_variable_of_same_name() {
        let parent = Environment::root(Default::default());
        parent.set_variable(Variable::simple_text("x", "outer")).unwrap();
        let child = parent.create_child(None);
        child.set_parameter_variable("x", Value::Text("inner".into())).unwrap();
        assert_eq!(child.get_variable("x").unwrap().value.as_display_text(), "inner");
        assert_eq!(parent.get_variable("x").unwrap().value.as_display_text(), "outer");
    }

    #[test]
    fn duplicate_import_binding_conflicts() {
        let env = Environment::root(Default::default());
        env.track_import_binding("helper", "./a.mld", SourceLocation::new(1, 1, 0)).unwrap();
        let result = env.track_import_binding("helper", "./b.mld", SourceLocation::new(2, 1, 0));
        assert!(result.is_err());
    }
}
