//! PrunePolicy v1: closure limits, expansion scope and deletion behaviour.
//!
//! The policy is part of a run's identity: its `params_hash` is embedded in
//! every artifact so that two runs can only be compared when their policies
//! hash identically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

use crate::canonical::canonical_hash_hex;
use crate::DEFAULT_POLICY_VERSION;

/// How committed deletions touch the file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMode {
    /// Remove the file.
    Delete,
    /// Rename to `__DELETED_<name>` in place; reversible with `restore`.
    Quarantine,
}

impl Default for DeletionMode {
    fn default() -> Self {
        Self::Quarantine
    }
}

/// Errors loading a policy file.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// I/O failure.
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decode failure.
    #[error("invalid policy JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A field is out of range.
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Hashable projection of the policy.
///
/// Excludes fields that only affect performance (`resolver_cache_size`).
#[derive(Debug, Clone, Serialize)]
struct PolicyParams<'a> {
    version: &'a str,
    max_closure_nodes: usize,
    fanout_warn_threshold: usize,
    expand_scope: Option<&'a BTreeSet<String>>,
    expand_aggregators: bool,
    protected_prefixes: &'a BTreeSet<String>,
    deletion_mode: DeletionMode,
    keep_backups: bool,
    scan_data_literals: bool,
}

/// Prune policy version 1.
///
/// ## Parameters
///
/// - `max_closure_nodes`: node budget; exceeding it aborts the build
/// - `fanout_warn_threshold`: edges per expansion above which a warning is logged
/// - `expand_scope`: top-level packages whose files are prunable; the closure
///   is traced through every package regardless
/// - `expand_aggregators`: whether `__init__.py` files are scanned for imports
/// - `protected_prefixes`: path prefixes never deleted
/// - `deletion_mode`: delete or quarantine
/// - `keep_backups`: write `__INITIAL_<name>` before patching an aggregator
/// - `resolver_cache_size`: LRU capacity for module lookups
/// - `scan_data_literals`: follow string literals naming files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunePolicy {
    /// Policy version identifier.
    pub version: String,
    /// Maximum number of nodes in the closure.
    pub max_closure_nodes: usize,
    /// Fan-out warning threshold.
    pub fanout_warn_threshold: usize,
    /// Restrict pruning to these top-level names.
    pub expand_scope: Option<BTreeSet<String>>,
    /// Expand aggregator files.
    pub expand_aggregators: bool,
    /// Never delete paths starting with any of these.
    pub protected_prefixes: BTreeSet<String>,
    /// How deletions are committed.
    pub deletion_mode: DeletionMode,
    /// Keep a pre-patch copy of each rewritten aggregator.
    pub keep_backups: bool,
    /// Resolver cache capacity.
    pub resolver_cache_size: usize,
    /// Follow file-name string literals.
    pub scan_data_literals: bool,
}

impl PrunePolicy {
    /// Get the policy ID.
    pub fn policy_id(&self) -> &str {
        &self.version
    }

    /// Compute a hash of the policy parameters.
    pub fn params_hash(&self) -> String {
        let params = PolicyParams {
            version: &self.version,
            max_closure_nodes: self.max_closure_nodes,
            fanout_warn_threshold: self.fanout_warn_threshold,
            expand_scope: self.expand_scope.as_ref(),
            expand_aggregators: self.expand_aggregators,
            protected_prefixes: &self.protected_prefixes,
            deletion_mode: self.deletion_mode,
            keep_backups: self.keep_backups,
            scan_data_literals: self.scan_data_literals,
        };
        // Only plain strings, integers and sets: serialization cannot fail.
        canonical_hash_hex(&params).unwrap_or_default()
    }

    /// Whether files under top-level `name` may be pruned.
    pub fn in_scope(&self, top_level: &str) -> bool {
        match &self.expand_scope {
            None => true,
            Some(scope) => {
                let stem = top_level.split('.').next().unwrap_or(top_level);
                scope.contains(top_level) || scope.contains(stem)
            }
        }
    }

    /// Whether `path` matches a configured protected prefix.
    pub fn is_protected_prefix(&self, path: &str) -> bool {
        self.protected_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_closure_nodes == 0 {
            return Err(PolicyError::Invalid("max_closure_nodes must be > 0".into()));
        }
        if self.resolver_cache_size == 0 {
            return Err(PolicyError::Invalid("resolver_cache_size must be > 0".into()));
        }
        Ok(())
    }

    /// Load and validate a JSON policy file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        let policy: Self = serde_json::from_str(&text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Create a small policy for testing.
    #[cfg(test)]
    pub fn minimal() -> Self {
        Self {
            max_closure_nodes: 64,
            fanout_warn_threshold: 8,
            resolver_cache_size: 16,
            ..Self::default()
        }
    }
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            version: DEFAULT_POLICY_VERSION.to_string(),
            max_closure_nodes: 2_000_000,
            fanout_warn_threshold: 512,
            expand_scope: None,
            expand_aggregators: true,
            protected_prefixes: BTreeSet::new(),
            deletion_mode: DeletionMode::Quarantine,
            keep_backups: false,
            resolver_cache_size: 4096,
            scan_data_literals: true,
        }
    }
}
