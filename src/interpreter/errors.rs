//! Error taxonomy for the interpreter (§7).
//!
//! Each conceptual error kind is its own struct, matching the teacher's
//! per-kind control-flow error structs (`BreakError`, `ContinueError`, ...
//! in its `interpreter::errors`), unified into one `InterpreterError` enum
//! via `thiserror`. Every error carries a `SourceLocation`; errors that can
//! occur mid-pipeline or mid-import additionally carry the effects emitted
//! before the failure so a host can still show partial output.

use thiserror::Error;

use crate::ast::types::SourceLocation;
use crate::interpreter::effects::Effect;

/// Effects emitted before an error aborted evaluation. Mirrors the
/// teacher's `prepend_output`/stdout-stderr accumulation on its
/// `ControlFlowError` family, generalized from raw strings to typed
/// effects.
#[derive(Debug, Clone, Default)]
pub struct PartialEffectLog(pub Vec<Effect>);

impl PartialEffectLog {
    pub fn empty() -> Self {
        Self(Vec::new())
    }
}

#[derive(Debug, Error)]
#[error("parse error at {location}: {message}")]
pub struct ParseError {
    pub location: SourceLocation,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("unknown node kind '{kind}' at {location}")]
pub struct UnknownNodeKind {
    pub kind: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("unknown variable '{name}' at {location}")]
pub struct UnknownVariable {
    pub name: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("'{name}' is a reserved name and cannot be (re)defined at {location}")]
pub struct ReservedName {
    pub name: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("parameter/variable name '{name}' already bound in this frame at {location}")]
pub struct ExecParameterConflict {
    pub name: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("import name '{name}' already bound (first at {first_location}, again at {second_location})")]
pub struct ImportNameConflict {
    pub name: String,
    pub first_location: SourceLocation,
    pub second_location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("export manifest names '{name}' but no such variable exists in the module (directive at {location})")]
pub struct ExportedNameNotFound {
    pub name: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("circular command reference through '{name}' at {location}")]
pub struct CircularCommandRef {
    pub name: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("circular import of '{specifier}': {chain:?}")]
pub struct CircularImport {
    pub specifier: String,
    pub chain: Vec<String>,
}

#[derive(Debug, Error)]
#[error("field access error at {location}: {message}")]
pub struct FieldAccessError {
    pub message: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("type mismatch at {location}: expected {expected}, got {actual}")]
pub struct TypeMismatch {
    pub expected: String,
    pub actual: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("failed to parse structured value as {kind} at {location}: {message}")]
pub struct StructuredParseError {
    pub kind: String,
    pub message: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("command execution failed (exit {exit_code}) at {location}: {stderr}")]
pub struct CommandExecutionError {
    pub exit_code: i32,
    pub stderr: String,
    pub location: SourceLocation,
    pub partial: PartialEffectLog,
}

#[derive(Debug, Error)]
#[error("code execution failed ({language}) at {location}: {message}")]
pub struct CodeExecutionError {
    pub language: String,
    pub message: String,
    pub location: SourceLocation,
    pub partial: PartialEffectLog,
}

#[derive(Debug, Error)]
#[error("operation timed out after {timeout_ms}ms at {location}")]
pub struct TimeoutError {
    pub timeout_ms: u64,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("no executor registered for language '{language}' at {location}")]
pub struct UnsupportedLanguage {
    pub language: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("payload of {size} bytes exceeds the configured limit of {limit} bytes at {location}")]
pub struct PayloadTooLarge {
    pub size: usize,
    pub limit: usize,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("module '{specifier}' not found")]
pub struct ModuleNotFound {
    pub specifier: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("integrity mismatch for '{specifier}': expected {expected}, got {actual}")]
pub struct IntegrityMismatch {
    pub specifier: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Error)]
#[error("lock file version conflict for '{specifier}': locked {locked}, resolved {resolved}")]
pub struct LockVersionConflict {
    pub specifier: String,
    pub locked: String,
    pub resolved: String,
}

#[derive(Debug, Error)]
#[error("resolver failed for '{specifier}': {message}")]
pub struct ResolverFailure {
    pub specifier: String,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("policy violation: {message}")]
pub struct PolicyViolation {
    pub message: String,
    pub op_label: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("cannot remove protected label '{label}' without privileged context at {location}")]
pub struct ProtectedLabelRemoval {
    pub label: String,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("verification failed for '{name}': {message}")]
pub struct VerificationFailure {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("privileged operation attempted without privileged context at {location}")]
pub struct Unprivileged {
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("retry limit ({limit}) exceeded for stage {stage_index} at {location}")]
pub struct RetryLimitExceeded {
    pub stage_index: usize,
    pub limit: u32,
    pub location: SourceLocation,
    pub partial: PartialEffectLog,
}

#[derive(Debug, Error)]
#[error("pipeline stage {stage_index} failed at {location}: {message}")]
pub struct PipelineStageFailure {
    pub stage_index: usize,
    pub message: String,
    pub location: SourceLocation,
    pub partial: PartialEffectLog,
}

#[derive(Debug, Error)]
#[error("call depth limit ({limit}) exceeded at {location}")]
pub struct CallDepthExceeded {
    pub limit: usize,
    pub location: SourceLocation,
}

#[derive(Debug, Error)]
#[error("needs.file precondition failed: '{file}' does not exist at {location}")]
pub struct NeedsPreconditionFailed {
    pub file: String,
    pub location: SourceLocation,
}

/// The unified interpreter error, covering every conceptual kind in §7.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    UnknownNodeKind(#[from] UnknownNodeKind),
    #[error(transparent)]
    UnknownVariable(#[from] UnknownVariable),
    #[error(transparent)]
    ReservedName(#[from] ReservedName),
    #[error(transparent)]
    ExecParameterConflict(#[from] ExecParameterConflict),
    #[error(transparent)]
    ImportNameConflict(#[from] ImportNameConflict),
    #[error(transparent)]
    ExportedNameNotFound(#[from] ExportedNameNotFound),
    #[error(transparent)]
    CircularCommandRef(#[from] CircularCommandRef),
    #[error(transparent)]
    CircularImport(#[from] CircularImport),
    #[error(transparent)]
    FieldAccess(#[from] FieldAccessError),
    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),
    #[error(transparent)]
    StructuredParse(#[from] StructuredParseError),
    #[error(transparent)]
    CommandExecution(#[from] CommandExecutionError),
    #[error(transparent)]
    CodeExecution(#[from] CodeExecutionError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error(transparent)]
    PayloadTooLarge(#[from] PayloadTooLarge),
    #[error(transparent)]
    ModuleNotFound(#[from] ModuleNotFound),
    #[error(transparent)]
    IntegrityMismatch(#[from] IntegrityMismatch),
    #[error(transparent)]
    LockVersionConflict(#[from] LockVersionConflict),
    #[error(transparent)]
    ResolverFailure(#[from] ResolverFailure),
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),
    #[error(transparent)]
    ProtectedLabelRemoval(#[from] ProtectedLabelRemoval),
    #[error(transparent)]
    VerificationFailure(#[from] VerificationFailure),
    #[error(transparent)]
    Unprivileged(#[from] Unprivileged),
    #[error(transparent)]
    RetryLimitExceeded(#[from] RetryLimitExceeded),
    #[error(transparent)]
    PipelineStageFailure(#[from] PipelineStageFailure),
    #[error(transparent)]
    CallDepthExceeded(#[from] CallDepthExceeded),
    #[error(transparent)]
    NeedsPreconditionFailed(#[from] NeedsPreconditionFailed),
    #[error(transparent)]
    ImportChain(#[from] ImportChainError),
}

impl InterpreterError {
    /// Errors inside `/when` conditions convert to falsy rather than
    /// propagating (§7 propagation rules). Field-access and unknown-variable
    /// failures are the ones that legitimately arise while probing a
    /// condition; anything else still propagates.
    pub fn is_condition_suppressible(&self) -> bool {
        matches!(
            self,
            InterpreterError::FieldAccess(_) | InterpreterError::UnknownVariable(_)
        )
    }

    /// Extracts the partial effect log carried by errors that can occur
    /// mid-pipeline or mid-import, for surfacing to the caller per §7's
    /// "partial effect log up to the point of failure" rule.
    pub fn partial_effects(&self) -> Option<&PartialEffectLog> {
        match self {
            InterpreterError::CommandExecution(e) => Some(&e.partial),
            InterpreterError::CodeExecution(e) => Some(&e.partial),
            InterpreterError::RetryLimitExceeded(e) => Some(&e.partial),
            InterpreterError::PipelineStageFailure(e) => Some(&e.partial),
            InterpreterError::ImportChain(e) => e.source.partial_effects(),
            _ => None,
        }
    }
}

/// Wraps an import-chain annotation around any inner error, per §7: "Errors
/// inside import evaluation are rethrown with an `importChain` annotation."
#[derive(Debug, Error)]
#[error("import chain {import_chain:?}: {source}")]
pub struct ImportChainError {
    pub import_chain: Vec<String>,
    #[source]
    pub source: Box<InterpreterError>,
}
