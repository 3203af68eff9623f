//! In-memory fixtures for exercising the interpreter without real I/O
//! (§8.5). None of this is production code — a host wires its own
//! `FileSystem`/`CommandExecutor`/`CodeExecutor` against real processes;
//! this module exists so the crate's own tests (and the hand-built-AST
//! scenarios in `tests/`) can run deterministically.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ast::types::Node;
use crate::interpreter::contracts::{
    CodeExecutor, CodeOptions, CommandExecutor, ExecOptions, ExecOutcome, FileSystem, Parser, ParsedDocument,
    ResolveContext, Resolver, ResolvedModule,
};
use crate::interpreter::errors::InterpreterError;

/// A flat in-memory filesystem keyed by path. No fuzzy matching beyond an
/// exact or trailing-slash-insensitive lookup.
#[derive(Default)]
pub struct InMemoryFileSystem {
    files: Mutex<HashMap<String, String>>,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.lock().unwrap().insert(path.into(), content.into());
        self
    }
}

#[async_trait]
impl FileSystem for InMemoryFileSystem {
    async fn read_file(&self, path: &str, fuzzy: bool) -> Result<String, String> {
        let files = self.files.lock().unwrap();
        if let Some(content) = files.get(path) {
            return Ok(content.clone());
        }
        if fuzzy {
            let trimmed = path.trim_start_matches("./");
            if let Some(content) = files.get(trimmed) {
                return Ok(content.clone());
            }
        }
        Err(format!("no such file: {path}"))
    }

    async fn write_file(&self, path: &str, content: &str, _mode: Option<u32>) -> Result<(), String> {
        self.files.lock().unwrap().insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    async fn is_directory(&self, _path: &str) -> bool {
        false
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>, String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self.files.lock().unwrap().keys().filter(|p| p.starts_with(&prefix)).cloned().collect())
    }
}

/// Echoes its command string back as stdout with exit code 0, unless a
/// canned response was registered for that exact command — enough to drive
/// `/run` scenarios without a real shell.
#[derive(Default)]
pub struct StubCommandExecutor {
    responses: Mutex<HashMap<String, ExecOutcome>>,
}

impl StubCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, command: impl Into<String>, outcome: ExecOutcome) -> Self {
        self.responses.lock().unwrap().insert(command.into(), outcome);
        self
    }
}

#[async_trait]
impl CommandExecutor for StubCommandExecutor {
    async fn execute_command(&self, command: &str, _options: ExecOptions) -> Result<ExecOutcome, String> {
        if let Some(outcome) = self.responses.lock().unwrap().get(command) {
            return Ok(outcome.clone());
        }
        Ok(ExecOutcome { stdout: command.to_string(), stderr: String::new(), exit_code: 0 })
    }
}

/// Returns its `code` argument back as a JSON string value, unless a canned
/// response was registered — enough to drive `/exe ... = js {...}` scenarios.
#[derive(Default)]
pub struct StubCodeExecutor {
    responses: Mutex<HashMap<String, serde_json::Value>>,
}

impl StubCodeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, code: impl Into<String>, value: serde_json::Value) -> Self {
        self.responses.lock().unwrap().insert(code.into(), value);
        self
    }
}

#[async_trait]
impl CodeExecutor for StubCodeExecutor {
    async fn execute_code(
        &self,
        code: &str,
        _language: &str,
        _params: &HashMap<String, serde_json::Value>,
        _options: CodeOptions,
    ) -> Result<serde_json::Value, String> {
        if let Some(value) = self.responses.lock().unwrap().get(code) {
            return Ok(value.clone());
        }
        Ok(serde_json::Value::String(code.to_string()))
    }
}

/// A parser that returns a canned `ParsedDocument` keyed by exact source
/// text, falling back to a single literal `Text` node — enough to drive
/// `/import` scenarios without a real mlld parser.
#[derive(Default)]
pub struct MapParser {
    documents: Mutex<HashMap<String, ParsedDocument>>,
}

impl MapParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, source: impl Into<String>, document: ParsedDocument) -> Self {
        self.documents.lock().unwrap().insert(source.into(), document);
        self
    }
}

impl Parser for MapParser {
    fn parse(&self, source: &str) -> Result<ParsedDocument, InterpreterError> {
        if let Some(document) = self.documents.lock().unwrap().get(source) {
            return Ok(document.clone());
        }
        Ok(ParsedDocument { nodes: vec![Node::text(source)], frontmatter: None })
    }
}

/// A resolver that serves canned module content keyed by exact specifier,
/// standing in for registry/file/URL resolution (§6.4) in tests.
#[derive(Default)]
pub struct StubResolver {
    modules: Mutex<HashMap<String, ResolvedModule>>,
}

impl StubResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, specifier: impl Into<String>, content: impl Into<String>) -> Self {
        self.modules.lock().unwrap().insert(
            specifier.into(),
            ResolvedModule { content: content.into(), meta: HashMap::new(), integrity: None },
        );
        self
    }
}

#[async_trait]
impl Resolver for StubResolver {
    fn can_resolve(&self, _spec: &str) -> bool {
        true
    }

    async fn resolve(&self, spec: &str, _ctx: &ResolveContext) -> Result<ResolvedModule, String> {
        self.modules.lock().unwrap().get(spec).cloned().ok_or_else(|| format!("no such module: {spec}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn in_memory_fs_round_trips() {
        let fs = InMemoryFileSystem::new().with_file("a.txt", "hello");
        assert_eq!(fs.read_file("a.txt", false).await.unwrap(), "hello");
        assert!(fs.read_file("missing.txt", false).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stub_command_executor_echoes_by_default() {
        let exec = StubCommandExecutor::new();
        let outcome = exec.execute_command("echo hi", ExecOptions::default()).await.unwrap();
        assert_eq!(outcome.stdout, "echo hi");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stub_command_executor_uses_canned_response() {
        let exec = StubCommandExecutor::new()
            .with_response("fail", ExecOutcome { stdout: String::new(), stderr: "boom".into(), exit_code: 1 });
        let outcome = exec.execute_command("fail", ExecOptions::default()).await.unwrap();
        assert_eq!(outcome.exit_code, 1);
    }

    #[test]
    fn map_parser_falls_back_to_literal_text() {
        let parser = MapParser::new();
        let doc = parser.parse("hello").unwrap();
        assert_eq!(doc.nodes.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stub_resolver_serves_canned_module() {
        let resolver = StubResolver::new().with_module("./a.mld", "/var @x = 1");
        let resolved = resolver.resolve("./a.mld", &ResolveContext::default()).await.unwrap();
        assert_eq!(resolved.content, "/var @x = 1");
    }
}
