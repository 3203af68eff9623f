//! Pipeline & retry engine (C5, §4.5).
//!
//! `PipelineState`/stage-index/retry-history tracking is grounded on the
//! teacher's `interpreter/pipeline_execution.rs` (`PipelineState`,
//! `set_pipestatus`, `get_pipestatus`), generalized from shell-exit-code
//! threading to typed-value threading with a retry-attempt history per
//! stage. A stage requests a retry by returning an object result carrying a
//! `retry` field (the typed-value analog of the teacher's exit-code
//! signaling, since there is no dedicated AST node for "retry directive" —
//! see `DESIGN.md`).

use std::sync::Arc;

use indexmap::IndexMap;

use crate::ast::types::{Node, PipeStage, SourceLocation, TrustLevel, WithClause};
use crate::interpreter::effects::Stream;
use crate::interpreter::environment::Environment;
use crate::interpreter::errors::{InterpreterError, NeedsPreconditionFailed, PolicyViolation, RetryLimitExceeded};
use crate::interpreter::evaluator::{self, EvalContext};
use crate::interpreter::variable::{ResolutionContext, Value};

/// One retry attempt's recorded hint, queryable via `@p.retries.all` (§4.5).
#[derive(Debug, Clone)]
struct StageAttempt {
    hint: Option<String>,
}

/// Applies a single condensed-pipe stage (`@value | @json`) (§4.4 tie-break:
/// "condensed pipes ... applied after field access but before the enclosing
/// interpolation is written"). Inline effect stages (`| log`, `| show`, `|
/// output`) run for their side effect and pass the value through unchanged.
/// `stage_index` is the caller's running count of non-effect stages seen so
/// far, matching `run_with_clause`'s `stage_counter` so `@p.stage` agrees
/// between the condensed and with-clause forms of the same pipeline
/// (§8.2 round-trip property).
pub async fn apply_condensed_stage(
    value: Value,
    stage: &PipeStage,
    stage_index: usize,
    env: &Arc<Environment>,
    location: SourceLocation,
) -> Result<Value, InterpreterError> {
    if effect_name(stage).is_some() {
        run_inline_effect(&value, stage, env, location).await?;
        return Ok(value);
    }
    run_stage_with_retry(value, stage, stage_index, env, location).await
}

/// Whether `stage` is a bare inline-effect form (`| log`, `| show`, `|
/// output`) rather than a stage that counts toward `@p.stage`.
pub fn is_inline_effect(stage: &PipeStage) -> bool {
    effect_name(stage).is_some()
}

/// Runs a `with { pipeline: [...], stdin?, stream?, trust?, needs? }` clause
/// attached to an exec invocation (§4.4 step 5, §4.5).
pub async fn run_with_clause(
    result: Value,
    clause: &WithClause,
    env: &Arc<Environment>,
    location: SourceLocation,
) -> Result<Value, InterpreterError> {
    check_trust(clause.trust, &clause.pipeline, location)?;

    if let Some(file) = &clause.needs_file {
        if !env.file_system.exists(file).await {
            return Err(NeedsPreconditionFailed { file: file.clone(), location }.into());
        }
    }

    let mut value = result;
    let mut index = 0usize;
    let mut stage_counter = 0usize;

    while index < clause.pipeline.len() {
        let stage = &clause.pipeline[index];
        if effect_name(stage).is_some() {
            run_inline_effect(&value, stage, env, location).await?;
            index += 1;
            continue;
        }

        value = run_stage_with_retry(value, stage, stage_counter, env, location).await?;
        stage_counter += 1;
        index += 1;

        // Inline effect stages attach to the preceding producer and re-run
        // on every retry attempt of that stage (glossary: "Inline effect
        // stage"); since `run_stage_with_retry` only returns on success,
        // running them here once per successful stage matches "after the
        // stage succeeds" plus the attempt-order guarantee in §5.
        while index < clause.pipeline.len() && effect_name(&clause.pipeline[index]).is_some() {
            run_inline_effect(&value, &clause.pipeline[index], env, location).await?;
            index += 1;
        }
    }

    if clause.stream {
        env.emit_effect(Stream::Stdout, value.as_display_text(), Some(location)).await;
    }

    Ok(value)
}

/// `trust: never` forbids running the pipeline's transform stages; `trust:
/// verify` has no interactive approval channel at this layer and always
/// reduces to deny (resolved Open Question, SPEC_FULL.md §9).
fn check_trust(trust: Option<TrustLevel>, pipeline: &[PipeStage], location: SourceLocation) -> Result<(), InterpreterError> {
    if pipeline.is_empty() {
        return Ok(());
    }
    match trust {
        Some(TrustLevel::Never) => Err(PolicyViolation {
            message: "pipeline execution forbidden by trust: never".into(),
            op_label: "op:pipeline".into(),
            location,
        }
        .into()),
        Some(TrustLevel::Verify) => Err(PolicyViolation {
            message: "trust: verify has no interactive approval channel; treated as deny".into(),
            op_label: "op:pipeline".into(),
            location,
        }
        .into()),
        Some(TrustLevel::Always) | None => Ok(()),
    }
}

/// Recognizes an inline effect stage by its bare target name. These are not
/// user executables; they're built-in stage forms (§4.5, glossary "Inline
/// effect stage").
fn effect_name(stage: &PipeStage) -> Option<&'static str> {
    match stage.target.as_ref() {
        Node::VariableReference { identifier, fields, pipes, tail, .. }
            if fields.is_empty() && pipes.is_empty() && tail.is_none() =>
        {
            match identifier.as_str() {
                "log" => Some("log"),
                "show" => Some("show"),
                "output" => Some("output"),
                _ => None,
            }
        }
        _ => None,
    }
}

async fn run_inline_effect(
    value: &Value,
    stage: &PipeStage,
    env: &Arc<Environment>,
    location: SourceLocation,
) -> Result<(), InterpreterError> {
    match effect_name(stage) {
        Some("log") => {
            let text = value.as_display_text();
            tracing::info!(target: "mlld::pipeline", stage = "log", "{text}");
            env.emit_effect(Stream::Stderr, text, Some(location)).await;
        }
        Some("show") => {
            env.emit_effect(Stream::Doc, format!("{}\n", value.as_display_text()), Some(location)).await;
        }
        Some("output") => {
            let path = match stage.args.first() {
                Some(node) => eval_text(node, env, location).await?,
                None => "stdout".to_string(),
            };
            if path == "stdout" {
                env.emit_effect(Stream::Stdout, value.as_display_text(), Some(location)).await;
            } else {
                env.file_system
                    .write_file(&path, &value.as_display_text(), None)
                    .await
                    .map_err(|message| crate::interpreter::errors::ModuleNotFound { specifier: message, location })?;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn eval_text(node: &Node, env: &Arc<Environment>, location: SourceLocation) -> Result<String, InterpreterError> {
    let _ = location;
    let value = evaluator::evaluate(node, env, EvalContext::expression(ResolutionContext::StringInterpolation)).await?;
    Ok(value.as_display_text())
}

/// Builds the `@p` ambient object: immediate input, stage index, and the
/// retry history queryable as `@p.retries.all` (§4.5).
fn stage_context(stage_index: usize, input: &Value, history: &[StageAttempt]) -> Value {
    let mut retries = IndexMap::new();
    retries.insert(
        "all".to_string(),
        Value::Array(
            history
                .iter()
                .map(|attempt| match &attempt.hint {
                    Some(hint) => Value::Text(hint.clone()),
                    None => Value::Null,
                })
                .collect(),
        ),
    );

    let mut map = IndexMap::new();
    map.insert("stage".to_string(), Value::Number(stage_index as f64));
    map.insert("input".to_string(), input.clone());
    map.insert("tries".to_string(), Value::Number((history.len() + 1) as f64));
    map.insert("retries".to_string(), Value::Object(retries));
    Value::Object(map)
}

/// Builds the `@mx` ambient object: the retry hint, visible only inside the
/// retried stage's body (§4.5 — "`@mx.hint` is non-null only inside the body
/// of a stage whose previous attempt requested retry").
fn mx_context(hint: Option<String>, attempt: u32) -> Value {
    let mut map = IndexMap::new();
    map.insert("hint".to_string(), hint.map(Value::Text).unwrap_or(Value::Null));
    map.insert("attempt".to_string(), Value::Number(attempt as f64));
    Value::Object(map)
}

/// A stage result requests a retry by carrying a `retry` field (string
/// hint) at the top level of an object or structured-value result.
fn retry_hint(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => match map.get("retry") {
            Some(Value::Text(hint)) => Some(hint.clone()),
            _ => None,
        },
        Value::Structured(structured) => retry_hint(&structured.data),
        _ => None,
    }
}

/// Runs one pipeline stage to completion, retrying up to
/// `RuntimeConfig::max_retry_attempts` times when the stage requests it
/// (§4.5 "Retry"). The stage's input is restored (not the retry result)
/// before each re-execution.
#[tracing::instrument(name = "pipeline", skip_all, fields(stage = stage_index))]
async fn run_stage_with_retry(
    input: Value,
    stage: &PipeStage,
    stage_index: usize,
    env: &Arc<Environment>,
    location: SourceLocation,
) -> Result<Value, InterpreterError> {
    let (name, def, captured_env) = evaluator::resolve_command_ref(&stage.target, env, location).await?;
    let max_attempts = env.config.max_retry_attempts.max(1);
    let mut history: Vec<StageAttempt> = Vec::new();
    let mut hint: Option<String> = None;

    loop {
        let attempt = history.len() as u32 + 1;
        let stage_env = env.create_child(None);
        stage_env.set_system_variable("p", stage_context(stage_index, &input, &history));
        stage_env.set_system_variable("mx", mx_context(hint.clone(), attempt));

        let mut args = Vec::with_capacity(stage.args.len() + 1);
        args.push(input.clone());
        for arg in &stage.args {
            args.push(evaluator::evaluate(arg, &stage_env, EvalContext::expression(ResolutionContext::FieldAccess)).await?);
        }

        let result = evaluator::invoke_executable(&name, def.clone(), &args, &stage_env, location, captured_env.as_ref()).await?;

        match retry_hint(&result) {
            Some(next_hint) if attempt < max_attempts => {
                history.push(StageAttempt { hint: Some(next_hint.clone()) });
                hint = Some(next_hint);
                continue;
            }
            Some(_) => {
                return Err(RetryLimitExceeded {
                    stage_index,
                    limit: max_attempts,
                    location,
                    partial: crate::interpreter::errors::PartialEffectLog::empty(),
                }
                .into());
            }
            None => return Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::environment::RootEnvironmentDeps;
    use crate::interpreter::executable::ExecutableDef;
    use crate::interpreter::variable::{Variable, VariableKind, VariableSource};
    use std::collections::BTreeMap;

    fn env() -> Arc<Environment> {
        Environment::root(RootEnvironmentDeps::default())
    }

    fn register_builtin(env: &Arc<Environment>, name: &str, def: ExecutableDef) {
        let mut variable = Variable::new(
            name,
            VariableKind::Executable,
            Value::Executable(Arc::new(def)),
            VariableSource { directive: "exe".into(), syntax_kind: "builtin".into(), has_interpolation: false },
        );
        variable.metadata.defined_at = SourceLocation::SYNTHETIC;
        env.set_variable(variable).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn condensed_stage_invokes_target_with_value_as_first_arg() {
        let env = env();
        register_builtin(
            &env,
            "upper",
            ExecutableDef::Builtin {
                name: "upper".into(),
                params: vec!["value".into()],
                function: Arc::new(|args| Ok(Value::Text(args.first().map(Value::as_display_text).unwrap_or_default().to_uppercase()))),
            },
        );
        let stage = PipeStage { target: Box::new(Node::var_ref("upper")), args: vec![], location: SourceLocation::SYNTHETIC };
        let result = apply_condensed_stage(Value::Text("hi".into()), &stage, 0, &env, SourceLocation::SYNTHETIC).await.unwrap();
        assert_eq!(result.as_display_text(), "HI");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inline_log_stage_passes_value_through() {
        let env = env();
        let stage = PipeStage { target: Box::new(Node::var_ref("log")), args: vec![], location: SourceLocation::SYNTHETIC };
        let result = apply_condensed_stage(Value::Text("hi".into()), &stage, 0, &env, SourceLocation::SYNTHETIC).await.unwrap();
        assert_eq!(result.as_display_text(), "hi");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stage_retries_until_hint_clears() {
        let env = env();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter_clone = counter.clone();
        register_builtin(
            &env,
            "flaky",
            ExecutableDef::Builtin {
                name: "flaky".into(),
                params: vec!["value".into()],
                function: Arc::new(move |_args| {
                    let n = counter_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        let mut map = IndexMap::new();
                        map.insert("retry".to_string(), Value::Text("try again".into()));
                        Ok(Value::Object(map))
                    } else {
                        Ok(Value::Text("done".into()))
                    }
                }),
            },
        );
        let stage = PipeStage { target: Box::new(Node::var_ref("flaky")), args: vec![], location: SourceLocation::SYNTHETIC };
        let result = apply_condensed_stage(Value::Text("in".into()), &stage, 0, &env, SourceLocation::SYNTHETIC).await.unwrap();
        assert_eq!(result.as_display_text(), "done");
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_limit_exceeded_when_hint_never_clears() {
        let env = Environment::root(RootEnvironmentDeps {
            config: Arc::new(crate::interpreter::config::RuntimeConfig { max_retry_attempts: 2, ..Default::default() }),
            ..Default::default()
        });
        register_builtin(
            &env,
            "always_retry",
            ExecutableDef::Builtin {
                name: "always_retry".into(),
                params: vec!["value".into()],
                function: Arc::new(|_args| {
                    let mut map = IndexMap::new();
                    map.insert("retry".to_string(), Value::Text("again".into()));
                    Ok(Value::Object(map))
                }),
            },
        );
        let stage = PipeStage { target: Box::new(Node::var_ref("always_retry")), args: vec![], location: SourceLocation::SYNTHETIC };
        let result = apply_condensed_stage(Value::Text("in".into()), &stage, 0, &env, SourceLocation::SYNTHETIC).await;
        assert!(matches!(result, Err(InterpreterError::RetryLimitExceeded(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trust_never_blocks_pipeline_stages() {
        let env = env();
        register_builtin(
            &env,
            "noop",
            ExecutableDef::Builtin { name: "noop".into(), params: vec!["value".into()], function: Arc::new(|args| Ok(args.first().cloned().unwrap_or(Value::Null))) },
        );
        let clause = WithClause {
            pipeline: vec![PipeStage { target: Box::new(Node::var_ref("noop")), args: vec![], location: SourceLocation::SYNTHETIC }],
            trust: Some(TrustLevel::Never),
            ..Default::default()
        };
        let result = run_with_clause(Value::Text("x".into()), &clause, &env, SourceLocation::SYNTHETIC).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn needs_file_precondition_checked_before_execution() {
        let env = env();
        let clause = WithClause { pipeline: vec![], needs_file: Some("missing.txt".to_string()), ..Default::default() };
        let result = run_with_clause(Value::Text("x".into()), &clause, &env, SourceLocation::SYNTHETIC).await;
        assert!(matches!(result, Err(InterpreterError::NeedsPreconditionFailed(_))));
    }
}
