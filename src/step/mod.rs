// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step contracts
//!
//! A step has two faces: the [`StepFactory`] describes the step class
//! (identity, input labels, data format) and is all the graph machinery
//! ever sees; the [`Step`] instance is built per task with its config and
//! actually runs. The matcher keys on [`StepFactory::type_identity`], which
//! must be a stable string chosen by the step author, never the in-memory
//! type.

mod context;

pub use context::ExecutionContext;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Declared input labels of a step class
///
/// The wildcard flag corresponds to "accepts any additional label": labels
/// beyond the declared set may be connected, but declared labels are still
/// required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLabels {
    labels: BTreeSet<String>,
    wildcard: bool,
}

impl InputLabels {
    /// No inputs at all (typical for source steps)
    pub fn none() -> Self {
        Self {
            labels: BTreeSet::new(),
            wildcard: false,
        }
    }

    /// A fixed set of required labels
    pub fn fixed<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            wildcard: false,
        }
    }

    /// Accept arbitrary additional labels on top of the declared set
    pub fn with_wildcard(mut self) -> Self {
        self.wildcard = true;
        self
    }

    /// The declared (required) labels
    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    /// Whether undeclared labels are accepted
    pub fn wildcard(&self) -> bool {
        self.wildcard
    }

    /// Whether a connection under `label` is admissible
    pub fn admits(&self, label: &str) -> bool {
        self.wildcard || self.labels.contains(label)
    }
}

/// Static descriptor of a step class
pub trait StepFactory: Send + Sync {
    /// Stable identity string used as the matching key across runs
    fn type_identity(&self) -> &str;

    /// Labels this step consumes
    fn input_labels(&self) -> InputLabels;

    /// Type-level check of a candidate upstream step for a label
    fn accepts_upstream(&self, upstream: &dyn StepFactory, label: &str) -> bool;

    /// Registry key of the codec used to persist this step's results
    fn data_format(&self) -> &str;

    /// Build a runnable instance from its per-step config
    fn instantiate(&self, config: &Value) -> anyhow::Result<Box<dyn Step>>;
}

/// Inputs handed to a step instance, keyed by connection label
#[derive(Debug, Clone, Default)]
pub struct StepInputs {
    values: HashMap<String, Value>,
    formats: HashMap<String, String>,
}

impl StepInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one labelled input together with its storage format name
    pub fn insert(&mut self, label: impl Into<String>, value: Value, format: impl Into<String>) {
        let label = label.into();
        self.formats.insert(label.clone(), format.into());
        self.values.insert(label, value);
    }

    /// Fetch an input by label
    pub fn get(&self, label: &str) -> Option<&Value> {
        self.values.get(label)
    }

    /// Fetch an input by label, failing with a descriptive error
    pub fn require(&self, label: &str) -> anyhow::Result<&Value> {
        self.values
            .get(label)
            .ok_or_else(|| anyhow::anyhow!("missing input '{label}'"))
    }

    /// Storage format name of an input, when known
    pub fn format(&self, label: &str) -> Option<&str> {
        self.formats.get(label).map(String::as_str)
    }

    /// Iterate over all labelled values
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A runnable step instance
#[async_trait]
pub trait Step: Send {
    /// Run the step against its labelled inputs
    async fn execute(
        &mut self,
        inputs: StepInputs,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<Value>;

    /// Metadata persisted next to the checkpoint after a successful run
    fn checkpoint_metadata(&self) -> Value {
        Value::Null
    }

    /// Whether a previously stored checkpoint may be reused
    ///
    /// Receives the metadata produced by the prior run. Stateful checks
    /// (hashing source files, probing external resources) belong here.
    fn checkpoint_is_valid(&self, _metadata: &Value) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_labels() {
        let labels = InputLabels::fixed(["documents", "model"]);
        assert!(labels.admits("documents"));
        assert!(!labels.admits("extra"));
        assert!(!labels.wildcard());
    }

    #[test]
    fn test_wildcard_admits_everything() {
        let labels = InputLabels::fixed(["base"]).with_wildcard();
        assert!(labels.admits("base"));
        assert!(labels.admits("anything-else"));
        assert_eq!(labels.labels().len(), 1);
    }

    #[test]
    fn test_inputs_round_trip() {
        let mut inputs = StepInputs::new();
        inputs.insert("docs", serde_json::json!(["a", "b"]), "json");

        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs.format("docs"), Some("json"));
        assert!(inputs.require("docs").is_ok());
        assert!(inputs.require("missing").is_err());
    }
}
