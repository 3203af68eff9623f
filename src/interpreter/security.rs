//! Security & policy (C7, §4.7).
//!
//! Capability glob matching is grounded on the teacher's
//! `network/allow_list.rs` prefix-matching (`matches_allow_list_entry`),
//! generalized from URL origin+path matching to colon-segmented `op:*`
//! label globbing via `glob::Pattern`.

use std::collections::{BTreeSet, HashSet};

use glob::Pattern;
use sha2::{Digest, Sha256};

use crate::ast::types::{Node, SourceLocation};
use crate::interpreter::environment::Environment;
use crate::interpreter::errors::{InterpreterError, PolicyViolation, ProtectedLabelRemoval, VerificationFailure};

/// Per-operation metadata constructed for every effectful operation
/// (`/run`, code execution, file I/O, resolver call) (§4.7).
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub op_type: String,
    pub subtype: Option<String>,
    /// Label hierarchy, most general first: `op:cmd`, `op:cmd:echo`,
    /// `op:cmd:echo:interpolated`.
    pub op_labels: Vec<String>,
    pub sources: Vec<String>,
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl OperationContext {
    pub fn most_specific_label(&self) -> Option<&str> {
        self.op_labels.last().map(|s| s.as_str())
    }
}

/// Labels that cannot be removed without a `privileged` evaluation context
/// (§4.7 label model).
const PROTECTED_LABELS: &[&str] = &["signed", "verified", "system"];

/// `SecurityDescriptor{labels[], taint[], sources[], capability?,
/// policyContext?}` attached to a variable's metadata (§3.2, §4.7).
#[derive(Debug, Clone, Default)]
pub struct SecurityDescriptor {
    pub labels: BTreeSet<String>,
    pub taint: BTreeSet<String>,
    pub sources: BTreeSet<String>,
    pub capability: Option<String>,
}

impl SecurityDescriptor {
    pub fn from_source(source: impl Into<String>) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(source.into());
        Self { labels: BTreeSet::new(), taint: BTreeSet::new(), sources, capability: None }
    }

    /// Union-merges labels/taint/sources; capability keeps the strictest
    /// (narrowest-deny) of the two (§4.2 `mergeSecurityDescriptors`).
    pub fn merge(&self, other: &SecurityDescriptor) -> SecurityDescriptor {
        SecurityDescriptor {
            labels: self.labels.union(&other.labels).cloned().collect(),
            taint: self.taint.union(&other.taint).cloned().collect(),
            sources: self.sources.union(&other.sources).cloned().collect(),
            capability: strictest_capability(self.capability.as_deref(), other.capability.as_deref()),
        }
    }

    pub fn apply_label_op(
        &mut self,
        op: &crate::ast::types::LabelOp,
        privileged: bool,
        location: SourceLocation,
    ) -> Result<(), InterpreterError> {
        use crate::ast::types::LabelOp;
        match op {
            LabelOp::Add(label) => {
                self.labels.insert(label.clone());
            }
            LabelOp::Remove(label) => {
                if PROTECTED_LABELS.contains(&label.as_str()) && !privileged {
                    return Err(ProtectedLabelRemoval { label: label.clone(), location }.into());
                }
                self.labels.remove(label);
            }
            LabelOp::Clear => {
                if !privileged && self.labels.iter().any(|l| PROTECTED_LABELS.contains(&l.as_str())) {
                    return Err(ProtectedLabelRemoval { label: "*".into(), location }.into());
                }
                self.labels.clear();
            }
            LabelOp::Trusted => {
                self.labels.insert("trusted".to_string());
                self.labels.remove("untrusted");
            }
            LabelOp::Untrusted => {
                self.labels.insert("untrusted".to_string());
                self.labels.remove("trusted");
            }
            LabelOp::TrustedForce => {
                self.labels.clear();
                self.labels.insert("trusted".to_string());
            }
        }
        Ok(())
    }
}

fn strictest_capability(a: Option<&str>, b: Option<&str>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.len() >= b.len() { a.to_string() } else { b.to_string() }),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    }
}

/// A single allow/deny rule over `op:*` label globs.
#[derive(Debug, Clone)]
struct CapabilityRule {
    pattern: Pattern,
    raw: String,
    allow: bool,
}

/// Capability policy built from `allow`/`deny` glob lists (§4.7). Most
/// specific pattern wins; ties prefer deny.
#[derive(Debug, Clone, Default)]
pub struct PolicyCapabilities {
    rules: Vec<CapabilityRule>,
}

impl PolicyCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn union(allow: &[String], deny: &[String]) -> Self {
        let mut rules = Vec::new();
        for raw in allow {
            if let Ok(pattern) = Pattern::new(&raw.replace(':', "/")) {
                rules.push(CapabilityRule { pattern, raw: raw.clone(), allow: true });
            }
        }
        for raw in deny {
            if let Ok(pattern) = Pattern::new(&raw.replace(':', "/")) {
                rules.push(CapabilityRule { pattern, raw: raw.clone(), allow: false });
            }
        }
        Self { rules }
    }

    /// Evaluates every op label in `ctx.op_labels` (most specific last)
    /// against the policy. Most-specific matching pattern wins; a tie in
    /// specificity prefers deny (§4.7, §8.3).
    #[tracing::instrument(name = "policy", skip_all, fields(label = ctx.most_specific_label().unwrap_or("")))]
    pub fn check(&self, ctx: &OperationContext, location: SourceLocation) -> Result<(), InterpreterError> {
        let mut best: Option<(&CapabilityRule, usize)> = None;
        for label in &ctx.op_labels {
            let slashed = label.replace(':', "/");
            for rule in &self.rules {
                if rule.pattern.matches(&slashed) {
                    let specificity = rule.raw.len();
                    match best {
                        None => best = Some((rule, specificity)),
                        Some((_, best_specificity)) if specificity > best_specificity => {
                            best = Some((rule, specificity))
                        }
                        Some((best_rule, best_specificity))
                            if specificity == best_specificity && best_rule.allow && !rule.allow =>
                        {
                            best = Some((rule, specificity))
                        }
                        _ => {}
                    }
                }
            }
        }

        match best {
            Some((rule, _)) if !rule.allow => Err(PolicyViolation {
                message: format!(
                    "operation '{}' denied by policy rule '{}'",
                    ctx.most_specific_label().unwrap_or(&ctx.op_type),
                    rule.raw
                ),
                op_label: ctx.most_specific_label().unwrap_or(&ctx.op_type).to_string(),
                location,
            }
            .into()),
            Some(_) => Ok(()),
            None => Ok(()),
        }
    }
}

/// One `/guard` block's registration (§4.7). Guard evaluation itself runs
/// through the evaluator's `/when` machinery; this registry just tracks
/// which `op:*` label a guard covers.
#[derive(Debug, Clone)]
pub struct GuardEntry {
    pub name: String,
    pub op_label: String,
}

#[derive(Debug, Clone, Default)]
pub struct GuardRegistry {
    guards: Vec<GuardEntry>,
}

impl GuardRegistry {
    pub fn register(&mut self, entry: GuardEntry) {
        self.guards.push(entry);
    }

    pub fn guards_for(&self, op_label: &str) -> Vec<&GuardEntry> {
        self.guards.iter().filter(|g| op_label.starts_with(&g.op_label)).collect()
    }
}

/// Signing/verification algorithm identifiers (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignAlgorithm {
    Sha256,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub algorithm: SignAlgorithm,
    pub hash: String,
    pub signed_by: String,
    pub content: String,
}

pub fn sign(content: &str, signed_by: &str, algorithm: SignAlgorithm) -> Signature {
    let hash = digest(content, algorithm);
    Signature { algorithm, hash, signed_by: signed_by.to_string(), content: content.to_string() }
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub verified: bool,
    pub hash: String,
    pub error: Option<String>,
}

pub fn verify(content: &str, signature: &Signature) -> Result<VerifyOutcome, InterpreterError> {
    let recomputed = digest(content, signature.algorithm);
    let verified = recomputed == signature.hash;
    if !verified {
        return Ok(VerifyOutcome {
            verified: false,
            hash: recomputed.clone(),
            error: Some("content hash does not match signature".to_string()),
        });
    }
    Ok(VerifyOutcome { verified, hash: recomputed, error: None })
}

fn digest(content: &str, algorithm: SignAlgorithm) -> String {
    match algorithm {
        SignAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

/// Builds the `MLLD_VERIFY_VARS` env entry + whether to prepend the verify
/// instructions block, given the set of signed variable names that a
/// command template interpolates, under an `autoverify: true` policy
/// (§4.7).
pub fn autoverify_env(signed_var_names: &HashSet<String>) -> Option<(String, String)> {
    if signed_var_names.is_empty() {
        return None;
    }
    let mut names: Vec<&String> = signed_var_names.iter().collect();
    names.sort();
    let joined = names.into_iter().cloned().collect::<Vec<_>>().join(",");
    Some(("MLLD_VERIFY_VARS".to_string(), joined))
}

pub fn verification_failure(name: &str, message: impl Into<String>) -> InterpreterError {
    VerificationFailure { name: name.to_string(), message: message.into() }.into()
}

/// Default block prepended to a command when autoverify injects
/// `MLLD_VERIFY_VARS` (§4.7). A host may override this with a custom
/// template; the interpreter only guarantees the env var is set and some
/// instructions precede the command.
pub const DEFAULT_VERIFY_INSTRUCTIONS: &str =
    "Before using any variable named in MLLD_VERIFY_VARS, verify its signature and refuse if verification fails.";

fn collect_identifiers(node: &Node, out: &mut HashSet<String>) {
    match node {
        Node::VariableReference { identifier, tail, .. } => {
            out.insert(identifier.clone());
            if let Some(tail) = tail {
                collect_identifiers(tail, out);
            }
        }
        Node::VariableReferenceWithTail { base, tail, .. } => {
            collect_identifiers(base, out);
            collect_identifiers(tail, out);
        }
        Node::Template { nodes, .. } => {
            for node in nodes {
                collect_identifiers(node, out);
            }
        }
        _ => {}
    }
}

/// Names of every variable referenced by `nodes` that carries a `signed`
/// label in `env` — the set a command template's autoverify check runs
/// against (§4.7, §8.4 scenario 5).
pub fn signed_variables_referenced(nodes: &[Node], env: &Environment) -> HashSet<String> {
    let mut identifiers = HashSet::new();
    for node in nodes {
        collect_identifiers(node, &mut identifiers);
    }
    identifiers
        .into_iter()
        .filter(|name| {
            env.get_variable(name)
                .and_then(|v| v.metadata.security)
                .map(|descriptor| descriptor.labels.contains("signed"))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(labels: &[&str]) -> OperationContext {
        OperationContext {
            op_type: "cmd".into(),
            subtype: Some("echo".into()),
            op_labels: labels.iter().map(|s| s.to_string()).collect(),
            sources: Vec::new(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn most_specific_deny_wins_over_broader_allow() {
        let policy = PolicyCapabilities::union(
            &["op:cmd:echo:*".to_string()],
            &["op:cmd:echo:blocked".to_string()],
        );
        let result = policy.check(&ctx(&["op:cmd", "op:cmd:echo", "op:cmd:echo:blocked"]), SourceLocation::SYNTHETIC);
        assert!(result.is_err());
    }

    #[test]
    fn allowed_when_only_broader_allow_matches() {
        let policy = PolicyCapabilities::union(
            &["op:cmd:echo:*".to_string()],
            &["op:cmd:echo:blocked".to_string()],
        );
        let result = policy.check(&ctx(&["op:cmd", "op:cmd:echo", "op:cmd:echo:interpolated"]), SourceLocation::SYNTHETIC);
        assert!(result.is_ok());
    }

    #[test]
    fn tie_in_specificity_prefers_deny() {
        let policy = PolicyCapabilities::union(
            &["op:cmd:echo".to_string()],
            &["op:cmd:echo".to_string()],
        );
        let result = policy.check(&ctx(&["op:cmd:echo"]), SourceLocation::SYNTHETIC);
        assert!(result.is_err());
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let signature = sign("hello world", "alice", SignAlgorithm::Sha256);
        let outcome = verify("hello world", &signature).unwrap();
        assert!(outcome.verified);
    }

    #[test]
    fn verify_fails_when_content_changes() {
        let signature = sign("hello world", "alice", SignAlgorithm::Sha256);
        let outcome = verify("hello mars", &signature).unwrap();
        assert!(!outcome.verified);
    }

    #[test]
    fn removing_protected_label_without_privilege_fails() {
        let mut descriptor = SecurityDescriptor::default();
        descriptor.labels.insert("signed".to_string());
        let result = descriptor.apply_label_op(
            &crate::ast::types::LabelOp::Remove("signed".to_string()),
            false,
            SourceLocation::SYNTHETIC,
        );
        assert!(result.is_err());
    }

    #[test]
    fn removing_protected_label_with_privilege_succeeds() {
        let mut descriptor = SecurityDescriptor::default();
        descriptor.labels.insert("signed".to_string());
        let result = descriptor.apply_label_op(
            &crate::ast::types::LabelOp::Remove("signed".to_string()),
            true,
            SourceLocation::SYNTHETIC,
        );
        assert!(result.is_ok());
        assert!(!descriptor.labels.contains("signed"));
    }

    #[test]
    fn autoverify_env_empty_when_no_signed_vars() {
        assert!(autoverify_env(&HashSet::new()).is_none());
    }

    #[test]
    fn autoverify_env_joins_sorted_names() {
        let mut set = HashSet::new();
        set.insert("b".to_string());
        set.insert("a".to_string());
        let (key, value) = autoverify_env(&set).unwrap();
        assert_eq!(key, "MLLD_VERIFY_VARS");
        assert_eq!(value, "a,b");
    }

    #[test]
    fn signed_variables_referenced_finds_only_signed_names() {
        let env = Environment::root(crate::interpreter::environment::RootEnvironmentDeps::default());

        let mut signed = crate::interpreter::variable::Variable::new(
            "auditPrompt",
            crate::interpreter::variable::VariableKind::SimpleText,
            crate::interpreter::variable::Value::Text("do the thing".into()),
            crate::interpreter::variable::VariableSource {
                directive: "sign".into(),
                syntax_kind: "text".into(),
                has_interpolation: false,
            },
        );
        let mut descriptor = SecurityDescriptor::default();
        descriptor.labels.insert("signed".to_string());
        signed.metadata.security = Some(descriptor);
        env.set_variable(signed).unwrap();

        let plain = crate::interpreter::variable::Variable::new(
            "other",
            crate::interpreter::variable::VariableKind::SimpleText,
            crate::interpreter::variable::Value::Text("plain".into()),
            crate::interpreter::variable::VariableSource {
                directive: "var".into(),
                syntax_kind: "text".into(),
                has_interpolation: false,
            },
        );
        env.set_variable(plain).unwrap();

        let nodes = vec![Node::var_ref("auditPrompt"), Node::var_ref("other")];
        let names = signed_variables_referenced(&nodes, &env);
        assert_eq!(names.len(), 1);
        assert!(names.contains("auditPrompt"));
    }
}
