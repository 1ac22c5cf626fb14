//! Incident records for recoverable and fatal pipeline conditions.
//!
//! ## Purpose
//!
//! Conditions that do not abort a run (a file vanishing between snapshot and
//! expansion, a runtime hint naming a path outside the package root, an
//! aggregator rewrite that fails to re-parse) are recorded as `Incident`
//! values, logged through `tracing`, and collected into the run's reports.
//!
//! ## Incident Kinds
//!
//! | Kind | Severity | Response |
//! |------|----------|----------|
//! | GraphInconsistency | MEDIUM | Edge downgraded to unresolved, closure continues |
//! | HintRejected | LOW | Hint skipped |
//! | PatchFailure | HIGH | Aggregator left untouched, reported |
//! | ResourceExhaustion | CRITICAL | Run aborted, partial graph preserved |
//! | ConcurrentMutation | CRITICAL | Commit refused, nothing deleted |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity levels for incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational, the run is unaffected.
    Low,
    /// Result is still conservative but less precise.
    Medium,
    /// A file was left in a degraded state.
    High,
    /// The run was aborted.
    Critical,
}

impl Severity {
    /// Whether this severity aborts the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncidentKind {
    /// A snapshot path could not be read during expansion.
    GraphInconsistency {
        /// Path that vanished or became unreadable.
        path: String,
        /// Underlying error text.
        detail: String,
    },
    /// A runtime hint was outside the root or absent from the snapshot.
    HintRejected {
        /// Hint path as supplied.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
    /// An aggregator rewrite was abandoned.
    PatchFailure {
        /// Aggregator path.
        path: String,
        /// Why the rewrite was abandoned.
        reason: String,
    },
    /// The closure exceeded its node budget.
    ResourceExhaustion {
        /// Configured limit.
        limit: usize,
        /// Nodes interned when the limit tripped.
        reached: usize,
    },
    /// Another process holds the package root lock.
    ConcurrentMutation {
        /// Lock file path.
        lock_path: String,
    },
}

impl IncidentKind {
    /// Get the severity of this incident kind.
    pub fn severity(&self) -> Severity {
        match self {
            Self::GraphInconsistency { .. } => Severity::Medium,
            Self::HintRejected { .. } => Severity::Low,
            Self::PatchFailure { .. } => Severity::High,
            Self::ResourceExhaustion { .. } => Severity::Critical,
            Self::ConcurrentMutation { .. } => Severity::Critical,
        }
    }

    /// Short stable label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::GraphInconsistency { .. } => "graph_inconsistency",
            Self::HintRejected { .. } => "hint_rejected",
            Self::PatchFailure { .. } => "patch_failure",
            Self::ResourceExhaustion { .. } => "resource_exhaustion",
            Self::ConcurrentMutation { .. } => "concurrent_mutation",
        }
    }
}

/// A recorded incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Unique incident ID.
    pub id: String,
    /// When the incident occurred.
    pub timestamp: DateTime<Utc>,
    /// Kind of incident.
    pub kind: IncidentKind,
    /// Severity level.
    pub severity: Severity,
    /// Component that raised it.
    pub source: String,
    /// Additional context.
    pub context: BTreeMap<String, String>,
}

impl Incident {
    /// Create a new incident.
    pub fn new(kind: IncidentKind, source: impl Into<String>) -> Self {
        let severity = kind.severity();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            severity,
            source: source.into(),
            context: BTreeMap::new(),
        }
    }

    /// Add context to the incident.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Log this incident as a structured event.
    pub fn log(&self) {
        if self.severity >= Severity::High {
            tracing::error!(
                incident_id = %self.id,
                incident = %self.kind.label(),
                severity = %self.severity,
                source = %self.source,
                context = ?self.context,
                "INCIDENT: {}",
                self.kind.label()
            );
        } else {
            tracing::warn!(
                incident_id = %self.id,
                incident = %self.kind.label(),
                severity = %self.severity,
                source = %self.source,
                context = ?self.context,
                "INCIDENT: {}",
                self.kind.label()
            );
        }
    }

    /// Create, log and return an incident in one step.
    pub fn record(kind: IncidentKind, source: impl Into<String>) -> Self {
        let incident = Self::new(kind, source);
        incident.log();
        incident
    }
}
