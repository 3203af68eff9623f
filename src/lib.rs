//! mlld — directive-oriented scripting language interpreter runtime.
//!
//! This crate implements the single-pass interpreter core (§2 of
//! `SPEC_FULL.md`): the evaluator, the environment, the executable
//! invocation + pipeline engine, the import/module scope-capture system,
//! and the security policy/label machinery. The parser, concrete
//! filesystem/shell/code executors, and the network/registry layer are
//! external collaborators, wired in through the traits in
//! `interpreter::contracts`.

pub mod ast;
pub mod interpreter;
pub mod testing;

use std::sync::Arc;

pub use ast::types::*;
pub use interpreter::config::RuntimeConfig;
pub use interpreter::contracts::{
    CodeExecutor, CodeOptions, CommandExecutor, ExecOptions, ExecOutcome, FileSystem, Parser,
    ParsedDocument, ResolveContext, Resolver, ResolvedModule, ResolverManager,
};
pub use interpreter::effects::{CollectingEffectHandler, Effect, EffectHandler, Stream};
pub use interpreter::environment::{Environment, RootEnvironmentDeps};
pub use interpreter::errors::InterpreterError;
pub use interpreter::evaluator::{evaluate, evaluate_document, EvalContext};

/// Parses and evaluates one mlld document end to end (§2 data flow:
/// parser → AST → `evaluate` → directive handler → effect handler). The
/// caller supplies `deps` (cloning its own `Arc` to the effect handler
/// first) so it can read back the rendered output — or any other
/// stream — after the run via its own handle to that handler.
#[tracing::instrument(name = "interpret", skip_all)]
pub async fn interpret(source: &str, deps: RootEnvironmentDeps) -> Result<Arc<Environment>, InterpreterError> {
    let parser = deps.parser.clone();
    let env = Environment::root(deps);
    let parsed = parser.parse(source)?;
    if let Some(frontmatter) = parsed.frontmatter {
        for (name, value) in frontmatter {
            let mut variable = interpreter::variable::Variable::new(
                &name,
                interpreter::variable::VariableKind::SimpleText,
                interpreter::variable::Value::Text(value),
                interpreter::variable::VariableSource {
                    directive: "frontmatter".into(),
                    syntax_kind: "text".into(),
                    has_interpolation: false,
                },
            );
            variable.metadata.is_system = false;
            env.set_variable(variable)?;
        }
    }
    evaluate_document(&parsed.nodes, &env).await?;
    Ok(env)
}
