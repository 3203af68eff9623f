//! External collaborator contracts (§6).
//!
//! These traits are the seam between this crate (the single-pass
//! interpreter runtime) and everything explicitly out of scope: the parser,
//! concrete filesystem/shell/code executors, and the resolver/registry
//! layer. A host implements these against real I/O; this crate only ever
//! calls through them.
//!
//! Mirrors the teacher's `FileSystem`/`CommandExecutor` sync traits in
//! `interpreter/interpreter.rs`, generalized to `async_trait` because this
//! crate's evaluator is async end to end (§5 ADDED note) rather than
//! bridging a synchronous core.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::ast::types::{Node, SourceLocation};
use crate::interpreter::errors::InterpreterError;

/// §6.1 — produces the AST this crate evaluates. Not implemented here.
pub trait Parser: Send + Sync {
    fn parse(&self, source: &str) -> Result<ParsedDocument, InterpreterError>;
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub nodes: Vec<Node>,
    pub frontmatter: Option<HashMap<String, String>>,
}

/// §6.2 — filesystem contract.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &str, fuzzy: bool) -> Result<String, String>;
    async fn write_file(&self, path: &str, content: &str, mode: Option<u32>) -> Result<(), String>;
    async fn exists(&self, path: &str) -> bool;
    async fn is_directory(&self, path: &str) -> bool;
    async fn readdir(&self, path: &str) -> Result<Vec<String>, String>;
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub stdin: Option<String>,
    pub stream: bool,
    pub signal_timeout_ms: Option<u64>,
    pub directive_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// §6.3 — shell executor contract.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute_command(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutcome, String>;
}

#[derive(Debug, Clone, Default)]
pub struct CodeOptions {
    pub shadow_env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// §6.3 — JS/Node/Python code executor contract.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute_code(
        &self,
        code: &str,
        language: &str,
        params: &HashMap<String, serde_json::Value>,
        options: CodeOptions,
    ) -> Result<serde_json::Value, String>;
}

#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub requesting_path: Option<String>,
    /// Interpolated payload for a `resolver` executable invocation (§3.3,
    /// §4.4 step 3 "resolver"); `None` for plain `/import` resolution.
    pub payload: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub content: String,
    pub meta: HashMap<String, String>,
    pub integrity: Option<String>,
}

/// §6.4 — pluggable module/content resolvers.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn can_resolve(&self, spec: &str) -> bool;
    async fn resolve(&self, spec: &str, ctx: &ResolveContext) -> Result<ResolvedModule, String>;
    /// Higher priority resolvers are consulted first when more than one
    /// claims `can_resolve` (§6.4: "orders resolvers by prefix/priority").
    fn priority(&self) -> i32 {
        0
    }
}

/// Orders registered resolvers and routes a specifier to the first one that
/// claims it, mirroring the teacher's `CommandRegistry` lookup-by-name
/// pattern generalized to lookup-by-predicate.
#[derive(Default)]
pub struct ResolverManager {
    resolvers: Vec<std::sync::Arc<dyn Resolver>>,
}

impl ResolverManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resolver: std::sync::Arc<dyn Resolver>) {
        self.resolvers.push(resolver);
        self.resolvers.sort_by_key(|r| std::cmp::Reverse(r.priority()));
    }

    pub async fn resolve(
        &self,
        spec: &str,
        ctx: &ResolveContext,
        location: SourceLocation,
    ) -> Result<ResolvedModule, InterpreterError> {
        for resolver in &self.resolvers {
            if resolver.can_resolve(spec) {
                return resolver
                    .resolve(spec, ctx)
                    .await
                    .map_err(|message| {
                        crate::interpreter::errors::ResolverFailure {
                            specifier: spec.to_string(),
                            message,
                        }
                        .into()
                    });
            }
        }
        Err(crate::interpreter::errors::ModuleNotFound {
            specifier: spec.to_string(),
            location,
        }
        .into())
    }
}
