//! Per-node reachability tags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::edge::{Confidence, ResolutionKind};
use super::node::CanonicalPath;

/// Reachability state of a file.
///
/// Ordered `Unreachable < Ambiguous < Reachable`; tags only ever move up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Provably not needed; eligible for deletion.
    Unreachable,
    /// Only touched by unknown-confidence edges; always kept.
    Ambiguous,
    /// Needed by the entry set.
    Reachable,
}

impl Tag {
    /// Whether the pruner keeps files with this tag.
    pub fn is_kept(self) -> bool {
        self != Self::Unreachable
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::Ambiguous => write!(f, "ambiguous"),
            Self::Reachable => write!(f, "reachable"),
        }
    }
}

/// Why a node received its tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TagReason {
    /// The node is an entry file.
    Entry,
    /// Reached over an edge from a reachable node.
    Edge {
        /// Importer path.
        from: CanonicalPath,
        /// Edge kind.
        kind: ResolutionKind,
    },
    /// Confirmed by a runtime hint.
    RuntimeHint,
    /// Promoted by the repair loop.
    ManualOverride,
    /// Only unknown-confidence edges from reachable nodes point here.
    UnknownOnly {
        /// One such importer.
        from: CanonicalPath,
    },
    /// Part of the graph but not reachable over propagating edges.
    NotPropagated,
    /// Never touched by the closure.
    NotReached,
}

/// Tag plus provenance for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Current tag.
    pub tag: Tag,
    /// Path confidence for reachable nodes.
    pub confidence: Option<Confidence>,
    /// Why the tag was assigned.
    pub reason: TagReason,
}

/// Tags for every file of a snapshot plus graph nodes outside it.
///
/// Uses a `BTreeMap` for deterministic iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet {
    tags: BTreeMap<CanonicalPath, TagEntry>,
    /// Set while a runtime trace is still being collected.
    pub provisional: bool,
}

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the tag of `path`. Returns whether anything changed.
    ///
    /// A tag is never lowered; an equal tag keeps the stronger confidence.
    pub fn raise(
        &mut self,
        path: CanonicalPath,
        tag: Tag,
        confidence: Option<Confidence>,
        reason: TagReason,
    ) -> bool {
        match self.tags.get_mut(&path) {
            Some(entry) if entry.tag > tag => false,
            Some(entry) if entry.tag == tag => {
                if confidence > entry.confidence {
                    entry.confidence = confidence;
                    entry.reason = reason;
                    true
                } else {
                    false
                }
            }
            Some(entry) => {
                *entry = TagEntry {
                    tag,
                    confidence,
                    reason,
                };
                true
            }
            None => {
                self.tags.insert(
                    path,
                    TagEntry {
                        tag,
                        confidence,
                        reason,
                    },
                );
                true
            }
        }
    }

    /// Tag of `path`, `Unreachable` if unknown.
    pub fn tag(&self, path: &CanonicalPath) -> Tag {
        self.tags.get(path).map(|e| e.tag).unwrap_or(Tag::Unreachable)
    }

    /// Full entry for `path`.
    pub fn get(&self, path: &CanonicalPath) -> Option<&TagEntry> {
        self.tags.get(path)
    }

    /// Iterate in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalPath, &TagEntry)> {
        self.tags.iter()
    }

    /// Paths carrying `tag`, in order.
    pub fn paths_with(&self, tag: Tag) -> Vec<&CanonicalPath> {
        self.tags
            .iter()
            .filter(|(_, e)| e.tag == tag)
            .map(|(p, _)| p)
            .collect()
    }

    /// Count of paths carrying `tag`.
    pub fn count(&self, tag: Tag) -> usize {
        self.tags.values().filter(|e| e.tag == tag).count()
    }

    /// Number of tagged paths.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether nothing is tagged.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Merge another tag set into this one, keeping the higher tag per path.
    ///
    /// Used to combine several independently analysed entries.
    pub fn union_with(&mut self, other: &TagSet) {
        for (path, entry) in &other.tags {
            self.raise(path.clone(), entry.tag, entry.confidence, entry.reason.clone());
        }
        self.provisional |= other.provisional;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachable_is_never_downgraded() {
        let mut tags = TagSet::new();
        let p = CanonicalPath::new("a.py");
        assert!(tags.raise(p.clone(), Tag::Reachable, Some(Confidence::Certain), TagReason::Entry));
        assert!(!tags.raise(p.clone(), Tag::Unreachable, None, TagReason::NotReached));
        assert!(!tags.raise(
            p.clone(),
            Tag::Ambiguous,
            None,
            TagReason::UnknownOnly { from: "b.py".into() }
        ));
        assert_eq!(tags.tag(&p), Tag::Reachable);
    }

    #[test]
    fn test_equal_tag_keeps_stronger_confidence() {
        let mut tags = TagSet::new();
        let p = CanonicalPath::new("a.py");
        tags.raise(p.clone(), Tag::Reachable, Some(Confidence::Probable), TagReason::NotReached);
        assert!(tags.raise(p.clone(), Tag::Reachable, Some(Confidence::Certain), TagReason::Entry));
        assert!(!tags.raise(p.clone(), Tag::Reachable, Some(Confidence::Probable), TagReason::NotReached));
        assert_eq!(tags.get(&p).and_then(|e| e.confidence), Some(Confidence::Certain));
    }

    #[test]
    fn test_union_keeps_higher_tag() {
        let mut left = TagSet::new();
        let mut right = TagSet::new();
        left.raise("x.py".into(), Tag::Unreachable, None, TagReason::NotReached);
        right.raise("x.py".into(), Tag::Ambiguous, None, TagReason::UnknownOnly { from: "e.py".into() });
        right.raise("y.py".into(), Tag::Reachable, Some(Confidence::Certain), TagReason::Entry);

        left.union_with(&right);
        assert_eq!(left.tag(&"x.py".into()), Tag::Ambiguous);
        assert_eq!(left.tag(&"y.py".into()), Tag::Reachable);
        assert_eq!(left.len(), 2);
    }
}
