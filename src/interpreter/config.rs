//! Runtime configuration (§6.8, added ambient stack).
//!
//! A host builds a `RuntimeConfig` and passes it to `Runtime::new`; the
//! crate never reads a file or environment variable on its own. Loadable
//! from TOML via `toml::from_str`, matching the teacher's existing `toml`
//! dependency.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default cap on a pipeline stage's retry attempts, overridable per
    /// stage via `withClause.pipeline[i].maxAttempts` (§4.5, §9).
    pub max_retry_attempts: u32,
    /// Mirrors the teacher's `ExecutionLimits::max_recursion_depth`.
    pub max_call_depth: usize,
    /// `/run` payload-size guard (§8.3). `None` disables the check.
    pub max_payload_bytes: Option<usize>,
    /// Whether a policy's `autoverify` prepends verify instructions by
    /// default when no `/policy` directive overrides it (§4.7).
    pub autoverify: bool,
    /// Whether `readFile` should request fuzzy matching from the injected
    /// `FileSystem` (§6.2).
    pub fuzzy_file_match: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 10,
            max_call_depth: 1000,
            max_payload_bytes: None,
            autoverify: false,
            fuzzy_file_match: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_retry_attempts, 10);
        assert_eq!(cfg.max_call_depth, 1000);
        assert!(!cfg.autoverify);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let cfg = RuntimeConfig::from_toml("autoverify = true\n").unwrap();
        assert!(cfg.autoverify);
        assert_eq!(cfg.max_retry_attempts, 10);
    }
}
