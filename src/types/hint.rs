//! Runtime hints: files observed being loaded by an instrumented run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use thiserror::Error;

/// One observed file load.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeHint {
    /// When the load was observed.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Path as reported by the tracer (absolute or root-relative).
    pub path: String,
}

impl RuntimeHint {
    /// Hint observed now.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            path: path.into(),
        }
    }

    /// Hint with an explicit timestamp.
    pub fn at(path: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            path: path.into(),
        }
    }
}

/// Errors reading a trace file.
#[derive(Debug, Error)]
pub enum TraceError {
    /// I/O failure.
    #[error("trace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON line could not be decoded.
    #[error("malformed trace line {line}: {source}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Decoder error.
        source: serde_json::Error,
    },
}

/// Read a runtime trace.
///
/// Each non-empty line is either a JSON object `{"path": .., "timestamp": ..}`
/// or a bare path. Lines starting with `#` are ignored.
pub fn read_trace<R: BufRead>(reader: R) -> Result<Vec<RuntimeHint>, TraceError> {
    let mut hints = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('{') {
            let hint: RuntimeHint = serde_json::from_str(trimmed).map_err(|source| {
                TraceError::Malformed {
                    line: idx + 1,
                    source,
                }
            })?;
            hints.push(hint);
        } else {
            hints.push(RuntimeHint::new(trimmed));
        }
    }
    Ok(hints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_trace_mixed_lines() {
        let input = "\
# comment
{\"path\": \"pkg/a.py\", \"timestamp\": \"2024-01-01T00:00:00Z\"}

pkg/b.py
{\"path\": \"pkg/c.py\"}
";
        let hints = read_trace(input.as_bytes()).unwrap();
        assert_eq!(hints.len(), 3);
        assert_eq!(hints[0].path, "pkg/a.py");
        assert_eq!(hints[0].timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(hints[1].path, "pkg/b.py");
        assert_eq!(hints[2].path, "pkg/c.py");
    }

    #[test]
    fn test_read_trace_malformed_line() {
        let input = "pkg/a.py\n{\"path\": }\n";
        let err = read_trace(input.as_bytes()).unwrap_err();
        assert!(matches!(err, TraceError::Malformed { line: 2, .. }));
    }
}
