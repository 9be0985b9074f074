// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Structural equivalence search
//!
//! Finds the largest subgraph of the previously persisted projection that
//! is equivalent to the current one under node renaming. Candidate
//! assignments (matchups) pair each current node with old nodes of the
//! same identity, config, and label shape; per matchup a least-fixed-point
//! grows the cacheable relation from the input pairs upward.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::graph::CheckpointGraph;

/// Matchup products beyond this size fall back to the greedy assignment.
const MAX_MATCHUPS: u128 = 10_000;

/// Compute the checkpoint reuse mapping `current raw id -> old raw id`
pub fn compute_mapping(current: &CheckpointGraph, old: &CheckpointGraph) -> BTreeMap<usize, usize> {
    let candidates = collect_candidates(current, old);
    if candidates.is_empty() {
        return BTreeMap::new();
    }

    let product: u128 = candidates
        .iter()
        .map(|(_, olds)| olds.len() as u128)
        .product();
    debug!(matchups = product, "enumerating checkpoint matchups");

    if product > MAX_MATCHUPS {
        warn!(
            matchups = product,
            limit = MAX_MATCHUPS,
            "matchup space too large, falling back to greedy assignment"
        );
        let matchup: Vec<(usize, usize)> = candidates
            .iter()
            .map(|(new, olds)| (*new, olds[0]))
            .collect();
        return fixed_point(&matchup, current, old);
    }

    let mut best: BTreeMap<usize, usize> = BTreeMap::new();
    for matchup in MatchupProduct::new(&candidates) {
        let mapping = fixed_point(&matchup, current, old);
        if mapping.len() > best.len() {
            best = mapping;
        }
    }
    best
}

/// Per current node, the old nodes with identical identity, config, and
/// label shape. Nodes without candidates are omitted.
fn collect_candidates(
    current: &CheckpointGraph,
    old: &CheckpointGraph,
) -> Vec<(usize, Vec<usize>)> {
    let mut candidates = Vec::new();
    for (&new_id, new_node) in current.nodes() {
        let mut olds = Vec::new();
        for (&old_id, old_node) in old.nodes() {
            if new_node.type_identity == old_node.type_identity
                && new_node.config == old_node.config
                && new_node.input_labels == old_node.input_labels
                && new_node.wildcard == old_node.wildcard
            {
                debug!(new = new_id, old = old_id, "possibly matching nodes");
                olds.push(old_id);
            }
        }
        if !olds.is_empty() {
            candidates.push((new_id, olds));
        }
    }
    candidates
}

/// Grow the cacheable relation for one matchup to its least fixed point
fn fixed_point(
    matchup: &[(usize, usize)],
    current: &CheckpointGraph,
    old: &CheckpointGraph,
) -> BTreeMap<usize, usize> {
    let mut cacheable: HashSet<(usize, usize)> = matchup
        .iter()
        .copied()
        .filter(|&(x, y)| {
            current.node(x).is_some_and(|n| n.is_input) && old.node(y).is_some_and(|n| n.is_input)
        })
        .collect();

    loop {
        let additions: Vec<(usize, usize)> = matchup
            .iter()
            .copied()
            .filter(|pair| !cacheable.contains(pair))
            .filter(|&(x, y)| upstreams_cacheable(x, y, current, old, &cacheable))
            .collect();
        if additions.is_empty() {
            break;
        }
        cacheable.extend(additions);
    }

    cacheable.into_iter().collect()
}

/// Condition 4 of the cacheable definition: both non-inputs whose actual
/// upstream edges pair up inside the relation, label for label.
fn upstreams_cacheable(
    x: usize,
    y: usize,
    current: &CheckpointGraph,
    old: &CheckpointGraph,
    cacheable: &HashSet<(usize, usize)>,
) -> bool {
    let (Some(new_node), Some(old_node)) = (current.node(x), old.node(y)) else {
        return false;
    };
    if new_node.is_input || old_node.is_input {
        return false;
    }
    // Wildcard steps may be fed under undeclared labels, so the actual
    // edge keys must coincide, not just the declared sets.
    if new_node.upstream.len() != old_node.upstream.len() {
        return false;
    }
    for (label, &p) in &new_node.upstream {
        let Some(&q) = old_node.upstream.get(label) else {
            return false;
        };
        if !cacheable.contains(&(p, q)) {
            return false;
        }
    }
    true
}

/// Mixed-radix enumeration of the Cartesian product of candidate lists
struct MatchupProduct<'a> {
    candidates: &'a [(usize, Vec<usize>)],
    indices: Vec<usize>,
    exhausted: bool,
}

impl<'a> MatchupProduct<'a> {
    fn new(candidates: &'a [(usize, Vec<usize>)]) -> Self {
        Self {
            candidates,
            indices: vec![0; candidates.len()],
            exhausted: candidates.is_empty(),
        }
    }
}

impl Iterator for MatchupProduct<'_> {
    type Item = Vec<(usize, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let matchup: Vec<(usize, usize)> = self
            .candidates
            .iter()
            .zip(&self.indices)
            .map(|((new, olds), &i)| (*new, olds[i]))
            .collect();

        // Advance the counter, least significant digit last.
        let mut pos = self.indices.len();
        loop {
            if pos == 0 {
                self.exhausted = true;
                break;
            }
            pos -= 1;
            self.indices[pos] += 1;
            if self.indices[pos] < self.candidates[pos].1.len() {
                break;
            }
            self.indices[pos] = 0;
        }

        Some(matchup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::graph::CheckpointNode;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, BTreeSet};

    fn node(
        identity: &str,
        config: Value,
        upstream: &[(&str, usize)],
        is_input: bool,
    ) -> CheckpointNode {
        CheckpointNode {
            type_identity: identity.to_string(),
            input_labels: upstream.iter().map(|(l, _)| l.to_string()).collect(),
            wildcard: false,
            upstream: upstream
                .iter()
                .map(|(l, id)| (l.to_string(), *id))
                .collect(),
            is_input,
            config,
        }
    }

    /// A -> B -> C chain with configurable ids
    fn chain(ids: [usize; 3]) -> CheckpointGraph {
        CheckpointGraph::new(BTreeMap::from([
            (ids[0], node("read", json!({"path": "x"}), &[], true)),
            (ids[1], node("tokenize", json!({}), &[("documents", ids[0])], false)),
            (ids[2], node("count", json!({}), &[("tokens", ids[1])], false)),
        ]))
    }

    #[test]
    fn test_match_identity() {
        let graph = chain([0, 1, 2]);
        let mapping = compute_mapping(&graph, &graph);
        assert_eq!(
            mapping,
            BTreeMap::from([(0, 0), (1, 1), (2, 2)])
        );
    }

    #[test]
    fn test_match_renumbered() {
        let current = chain([5, 9, 7]);
        let old = chain([0, 1, 2]);
        let mapping = compute_mapping(&current, &old);
        assert_eq!(
            mapping,
            BTreeMap::from([(5, 0), (9, 1), (7, 2)])
        );
    }

    #[test]
    fn test_config_change_cuts_descendants() {
        let current = CheckpointGraph::new(BTreeMap::from([
            (0, node("read", json!({"path": "x"}), &[], true)),
            (1, node("tokenize", json!({"lower": true}), &[("documents", 0)], false)),
            (2, node("count", json!({}), &[("tokens", 1)], false)),
        ]));
        let old = chain([0, 1, 2]);

        let mapping = compute_mapping(&current, &old);
        // Tokenize config changed: it and its descendant drop out.
        assert_eq!(mapping, BTreeMap::from([(0, 0)]));
    }

    #[test]
    fn test_identity_mismatch_no_match() {
        let current = CheckpointGraph::new(BTreeMap::from([(
            0,
            node("read-v2", json!({"path": "x"}), &[], true),
        )]));
        let old = CheckpointGraph::new(BTreeMap::from([(
            0,
            node("read", json!({"path": "x"}), &[], true),
        )]));
        assert!(compute_mapping(&current, &old).is_empty());
    }

    #[test]
    fn test_duplicate_component_reuses_same_old() {
        // Old run: one A -> B chain. Current run: two structurally
        // identical chains; both may reuse the single old pair.
        let old = CheckpointGraph::new(BTreeMap::from([
            (0, node("read", json!({"cfg": 1}), &[], true)),
            (1, node("train", json!({"cfg": 7}), &[("data", 0)], false)),
        ]));
        let current = CheckpointGraph::new(BTreeMap::from([
            (0, node("read", json!({"cfg": 1}), &[], true)),
            (1, node("train", json!({"cfg": 7}), &[("data", 0)], false)),
            (2, node("read", json!({"cfg": 1}), &[], true)),
            (3, node("train", json!({"cfg": 7}), &[("data", 2)], false)),
        ]));

        let mapping = compute_mapping(&current, &old);
        assert_eq!(
            mapping,
            BTreeMap::from([(0, 0), (1, 1), (2, 0), (3, 1)])
        );
    }

    #[test]
    fn test_wildcard_edge_labels_must_agree() {
        let wild = |upstream: &[(&str, usize)]| CheckpointNode {
            type_identity: "merge".to_string(),
            input_labels: BTreeSet::new(),
            wildcard: true,
            upstream: upstream
                .iter()
                .map(|(l, id)| (l.to_string(), *id))
                .collect(),
            is_input: false,
            config: json!({}),
        };

        let old = CheckpointGraph::new(BTreeMap::from([
            (0, node("read", json!({}), &[], true)),
            (1, wild(&[("left", 0)])),
        ]));
        let current = CheckpointGraph::new(BTreeMap::from([
            (0, node("read", json!({}), &[], true)),
            (1, wild(&[("right", 0)])),
        ]));

        let mapping = compute_mapping(&current, &old);
        // The merge node was fed under a different label: no reuse for it.
        assert_eq!(mapping, BTreeMap::from([(0, 0)]));
    }

    #[test]
    fn test_greedy_fallback_still_maps() {
        // 14 interchangeable inputs give 14^14 matchups, far past the
        // enumeration limit; the greedy pass must still return a mapping.
        let mut old_nodes = BTreeMap::new();
        let mut new_nodes = BTreeMap::new();
        for i in 0..14 {
            old_nodes.insert(i, node("read", json!({}), &[], true));
            new_nodes.insert(i, node("read", json!({}), &[], true));
        }
        let mapping = compute_mapping(
            &CheckpointGraph::new(new_nodes),
            &CheckpointGraph::new(old_nodes),
        );
        assert_eq!(mapping.len(), 14);
    }
}
