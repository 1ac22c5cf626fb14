//! Pruned dependency manifest.
//!
//! Maps declared requirements onto the installed distributions in the
//! package root and keeps those that still own at least one kept file.
//! Ownership comes from `*.dist-info/top_level.txt`, falling back to the
//! distribution's `RECORD`, falling back to the PEP 503 normalized name.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::snapshot::PackageSnapshot;
use crate::store::StoreError;
use crate::types::{CanonicalPath, TagSet};

/// Errors building a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading a requirement file failed.
    #[error("failed to read requirements {path}: {source}")]
    Io {
        /// Requirement file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Reading distribution metadata failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// PEP 503 name normalization: lowercase, runs of `-_.` collapsed to `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
            }
            in_sep = true;
        } else {
            out.extend(c.to_lowercase());
            in_sep = false;
        }
    }
    out
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid requirement name pattern"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Requirements
// ─────────────────────────────────────────────────────────────────────────────

/// One declared requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// The line as declared (comments stripped).
    pub raw: String,
    /// Project name.
    pub name: String,
    /// Normalized project name.
    pub normalized: String,
}

impl Requirement {
    /// Parse a single requirement line. Blank lines, comments and pip
    /// options yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let raw = line.split(" #").next().unwrap_or(line).trim();
        if raw.is_empty() || raw.starts_with('#') || raw.starts_with('-') {
            return None;
        }
        let name = name_pattern().captures(raw)?.get(1)?.as_str().to_string();
        Some(Self {
            raw: raw.to_string(),
            normalized: normalize_name(&name),
            name,
        })
    }
}

/// Parse a requirements listing (one requirement per line).
pub fn parse_requirements(text: &str) -> Vec<Requirement> {
    text.lines().filter_map(Requirement::parse).collect()
}

/// Read and parse a requirements file.
pub fn read_requirements_file(path: &Path) -> Result<Vec<Requirement>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_requirements(&text))
}

// ─────────────────────────────────────────────────────────────────────────────
// Installed distributions
// ─────────────────────────────────────────────────────────────────────────────

/// How a distribution's files were identified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "names", rename_all = "snake_case")]
pub enum Ownership {
    /// Module names from `top_level.txt`.
    TopLevel(BTreeSet<String>),
    /// First path components listed in `RECORD`.
    Record(BTreeSet<String>),
    /// Nothing recorded; top-level entries whose normalized stem matches.
    NormalizedName,
}

/// An installed distribution found through its `.dist-info` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    /// Declared name (from `METADATA`, else the directory name).
    pub name: String,
    /// Normalized name.
    pub normalized: String,
    /// Declared version, if any.
    pub version: Option<String>,
    /// The `.dist-info` directory.
    pub dist_info: String,
    /// How owned files are recognised.
    pub ownership: Ownership,
}

impl Distribution {
    /// Whether `path` belongs to this distribution.
    pub fn owns(&self, path: &CanonicalPath) -> bool {
        if path.is_external() || path.top_level() == self.dist_info {
            return false;
        }
        let top = path.top_level();
        let stem = top.split('.').next().unwrap_or(top);
        match &self.ownership {
            Ownership::TopLevel(names) => names.iter().any(|name| {
                if name.contains('/') {
                    path.is_under(name)
                } else {
                    stem == name
                }
            }),
            Ownership::Record(tops) => tops.contains(top),
            Ownership::NormalizedName => normalize_name(stem) == self.normalized,
        }
    }
}

/// Installed distributions keyed by normalized name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributionIndex {
    distributions: BTreeMap<String, Distribution>,
}

impl DistributionIndex {
    /// Scan a snapshot's top-level `.dist-info` directories.
    pub fn from_snapshot(snapshot: &PackageSnapshot) -> Result<Self, ManifestError> {
        let dirs: BTreeSet<String> = snapshot
            .files()
            .map(|(p, _)| p.top_level())
            .filter(|top| top.ends_with(".dist-info"))
            .map(str::to_string)
            .collect();

        let mut distributions = BTreeMap::new();
        for dir in dirs {
            let dist = read_distribution(snapshot, &dir)?;
            tracing::debug!(
                name = %dist.name,
                version = dist.version.as_deref().unwrap_or("-"),
                "Indexed distribution"
            );
            distributions.insert(dist.normalized.clone(), dist);
        }
        tracing::info!(distributions = distributions.len(), "Indexed installed distributions");
        Ok(Self { distributions })
    }

    /// Look up by (any spelling of) a project name.
    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(&normalize_name(name))
    }

    /// All distributions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Distribution> {
        self.distributions.values()
    }

    /// Number of distributions.
    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    /// Whether no distribution was found.
    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }
}

fn read_distribution(snapshot: &PackageSnapshot, dir: &str) -> Result<Distribution, ManifestError> {
    let dir_stem = dir.trim_end_matches(".dist-info");
    let fallback_name = dir_stem.split('-').next().unwrap_or(dir_stem).to_string();

    let mut name = fallback_name;
    let mut version = None;
    if let Some(metadata) = snapshot.read_text(&CanonicalPath::join(dir, "METADATA"))? {
        for line in metadata.lines().take_while(|l| !l.trim().is_empty()) {
            if let Some(value) = line.strip_prefix("Name:") {
                name = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("Version:") {
                version = Some(value.trim().to_string());
            }
        }
    }

    let ownership = if let Some(text) = snapshot.read_text(&CanonicalPath::join(dir, "top_level.txt"))? {
        let names: BTreeSet<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            Ownership::NormalizedName
        } else {
            Ownership::TopLevel(names)
        }
    } else if let Some(text) = snapshot.read_text(&CanonicalPath::join(dir, "RECORD"))? {
        let tops = record_top_levels(&text, dir);
        if tops.is_empty() {
            Ownership::NormalizedName
        } else {
            Ownership::Record(tops)
        }
    } else {
        Ownership::NormalizedName
    };

    Ok(Distribution {
        normalized: normalize_name(&name),
        name,
        version,
        dist_info: dir.to_string(),
        ownership,
    })
}

/// First path components of the files listed in a `RECORD`, skipping the
/// metadata directory and entries outside the root.
fn record_top_levels(record: &str, dist_info: &str) -> BTreeSet<String> {
    record
        .lines()
        .filter_map(|line| {
            let path = line.rsplitn(3, ',').last()?.trim().trim_matches('"');
            let top = path.split('/').next()?;
            let keep = !top.is_empty() && top != ".." && top != dist_info && top != "__pycache__";
            keep.then(|| top.to_string())
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Pruned manifest
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to one requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The distribution still owns kept files.
    Kept {
        /// Matched distribution.
        distribution: String,
        /// Number of kept files it owns.
        kept_files: usize,
    },
    /// Every file of the distribution is unreachable.
    Dropped {
        /// Matched distribution.
        distribution: String,
    },
    /// No installed distribution matches; kept.
    Unmatched,
}

/// A requirement with its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The declared requirement.
    pub requirement: Requirement,
    /// Its verdict.
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Declared requirements partitioned by whether the pruned tree still needs
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedManifest {
    /// One entry per declared requirement, in declaration order.
    pub entries: Vec<ManifestEntry>,
}

impl PrunedManifest {
    /// Evaluate `requirements` against the distributions and the tag set.
    pub fn compute(requirements: &[Requirement], index: &DistributionIndex, tags: &TagSet) -> Self {
        let kept_paths: Vec<&CanonicalPath> = tags
            .iter()
            .filter(|(_, entry)| entry.tag.is_kept())
            .map(|(path, _)| path)
            .collect();

        let entries: Vec<ManifestEntry> = requirements
            .iter()
            .map(|req| {
                let verdict = match index.get(&req.name) {
                    None => Verdict::Unmatched,
                    Some(dist) => {
                        let kept_files = kept_paths.iter().filter(|p| dist.owns(p)).count();
                        if kept_files > 0 {
                            Verdict::Kept {
                                distribution: dist.name.clone(),
                                kept_files,
                            }
                        } else {
                            Verdict::Dropped {
                                distribution: dist.name.clone(),
                            }
                        }
                    }
                };
                ManifestEntry {
                    requirement: req.clone(),
                    verdict,
                }
            })
            .collect();

        let manifest = Self { entries };
        tracing::info!(
            declared = manifest.entries.len(),
            kept = manifest.kept().count(),
            dropped = manifest.dropped().count(),
            "Pruned requirement manifest"
        );
        manifest
    }

    /// Requirements that stay (kept or unmatched).
    pub fn kept(&self) -> impl Iterator<Item = &Requirement> {
        self.entries
            .iter()
            .filter(|e| !matches!(e.verdict, Verdict::Dropped { .. }))
            .map(|e| &e.requirement)
    }

    /// Requirements whose distribution lost every file.
    pub fn dropped(&self) -> impl Iterator<Item = &Requirement> {
        self.entries
            .iter()
            .filter(|e| matches!(e.verdict, Verdict::Dropped { .. }))
            .map(|e| &e.requirement)
    }

    /// Render the surviving requirements as a requirements listing.
    pub fn to_requirements_txt(&self) -> String {
        self.kept().map(|r| format!("{}\n", r.raw)).collect()
    }
}
