//! Peer selection by wildcard patterns.
//!
//! Patterns are case-insensitive and `*` matches any run of characters,
//! so `node-*`, `*-relay`, `*uav*` and `a*z` are all valid.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Match `value` against a wildcard `pattern`.
pub fn wildcard_match(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().flat_map(char::to_lowercase).collect();
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();

    let (mut v, mut p) = (0, 0);
    // Position of the last `*` seen and the value index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some((star, tried)) = backtrack {
            p = star + 1;
            v = tried + 1;
            backtrack = Some((star, tried + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Split a `;`-separated pattern list, dropping empty entries.
pub fn parse_pattern_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Include/exclude filter deciding which peers are replication targets.
///
/// A peer is selected when it matches at least one include pattern and no
/// exclude pattern. An empty include list selects nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFilter {
    /// Patterns a target must match.
    pub include: Vec<String>,
    /// Patterns a target must not match.
    pub exclude: Vec<String>,
}

impl TargetFilter {
    /// Build a filter from two `;`-separated pattern lists.
    pub fn from_lists(include: &str, exclude: &str) -> Self {
        Self {
            include: parse_pattern_list(include),
            exclude: parse_pattern_list(exclude),
        }
    }

    /// A filter that selects every peer.
    pub fn everyone() -> Self {
        Self {
            include: vec!["*".into()],
            exclude: Vec::new(),
        }
    }

    /// Whether `peer` should be replicated to.
    pub fn selects(&self, peer: &NodeId) -> bool {
        self.include
            .iter()
            .any(|pattern| wildcard_match(peer.as_str(), pattern))
            && !self
                .exclude
                .iter()
                .any(|pattern| wildcard_match(peer.as_str(), pattern))
    }

    /// Whether `peer` matches any include pattern, ignoring excludes.
    pub fn matches_any(&self, peer: &NodeId) -> bool {
        self.include
            .iter()
            .any(|pattern| wildcard_match(peer.as_str(), pattern))
    }
}
