// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Persisted pipeline projection
//!
//! Records, per raw handle id: the factory identity string, the declared
//! input labels and wildcard flag, the actual upstream edge per label,
//! whether the node is an input, and the config payload. This is exactly
//! the information the matcher needs; executors and codecs never read it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One node of the persisted projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointNode {
    /// Stable identity string of the step class
    pub type_identity: String,
    /// Labels the step class declares
    pub input_labels: BTreeSet<String>,
    /// Whether undeclared labels are accepted
    #[serde(default)]
    pub wildcard: bool,
    /// Actual edge label -> upstream raw id
    pub upstream: BTreeMap<String, usize>,
    /// Whether the node is a pipeline input
    pub is_input: bool,
    /// Per-step config payload, compared by deep equality
    pub config: Value,
}

/// The projection of a whole pipeline, keyed by raw handle id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckpointGraph {
    nodes: BTreeMap<usize, CheckpointNode>,
}

impl CheckpointGraph {
    pub fn new(nodes: BTreeMap<usize, CheckpointNode>) -> Self {
        Self { nodes }
    }

    /// All nodes, keyed by raw id
    pub fn nodes(&self) -> &BTreeMap<usize, CheckpointNode> {
        &self.nodes
    }

    /// Look up one node
    pub fn node(&self, id: usize) -> Option<&CheckpointNode> {
        self.nodes.get(&id)
    }

    /// Upstream raw id feeding `id` under `label`, if any
    pub fn upstream_of(&self, id: usize, label: &str) -> Option<usize> {
        self.nodes.get(&id).and_then(|n| n.upstream.get(label)).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(identity: &str, upstream: &[(&str, usize)], is_input: bool) -> CheckpointNode {
        CheckpointNode {
            type_identity: identity.to_string(),
            input_labels: upstream.iter().map(|(l, _)| l.to_string()).collect(),
            wildcard: false,
            upstream: upstream
                .iter()
                .map(|(l, id)| (l.to_string(), *id))
                .collect(),
            is_input,
            config: json!({}),
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let graph = CheckpointGraph::new(BTreeMap::from([
            (0, node("reader", &[], true)),
            (1, node("tokenize", &[("documents", 0)], false)),
        ]));

        let encoded = serde_json::to_string(&graph).unwrap();
        let decoded: CheckpointGraph = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, graph);
        assert_eq!(decoded.upstream_of(1, "documents"), Some(0));
    }
}
