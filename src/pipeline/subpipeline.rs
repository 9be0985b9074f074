// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Scatter/gather sub-pipelines
//!
//! A sub-pipeline step fans one input into groups, runs an inner pipeline
//! per group, and folds the per-group results back. To the outer executor
//! it looks like any other step; its `execute` calls
//! [`run_scatter_gather`], which expands the inner template once per group
//! and executes the combined pipeline against a store nested inside the
//! parent step's checkpoint directory. Inner checkpoints are matched and
//! reused across runs through that nested store, so a sub-pipeline step
//! should report its own checkpoint as invalid and rely on the inner reuse
//! instead.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use crate::errors::StepflowError;
use crate::pipeline::builder::Pipeline;
use crate::pipeline::handle::StepHandle;
use crate::step::{ExecutionContext, StepInputs};

/// Label under which each group's clone of the start step receives the
/// scattered value. Start steps declare no input labels; the value is
/// injected as a preloaded input.
pub const SCATTER_INPUT_LABEL: &str = "scatter-input";

/// An inner pipeline template for one group
pub struct InnerPipeline {
    /// The template graph; cloned once per group key
    pub pipeline: Pipeline,
    /// The template node that receives the group's scattered value
    pub start: StepHandle,
    /// Per-template-handle configs for the concrete clones
    pub configs: HashMap<StepHandle, Value>,
}

/// User contract of a scatter/gather step
#[async_trait]
pub trait ScatterGather: Send + Sync {
    /// Split the step's inputs into keyed groups
    async fn scatter(&self, inputs: &StepInputs) -> anyhow::Result<BTreeMap<String, Value>>;

    /// The inner template to instantiate for a group
    fn inner_pipeline(&self, group: &str) -> anyhow::Result<InnerPipeline>;

    /// Fold the per-group results of one output back into a single value
    async fn gather(
        &self,
        output: &str,
        groups: BTreeMap<String, Value>,
    ) -> anyhow::Result<Value>;
}

/// Drive a scatter/gather step to completion
///
/// Returns an object mapping each template output name to its gathered
/// value; typically the caller's `execute` returns it unchanged.
pub async fn run_scatter_gather(
    sg: &dyn ScatterGather,
    inputs: &StepInputs,
    ctx: &ExecutionContext,
) -> anyhow::Result<Value> {
    let parent = ctx.handle().clone();
    let groups = sg.scatter(inputs).await?;
    info!(%parent, groups = groups.len(), "scattered into groups");

    let mut concrete = Pipeline::new(format!("subpipeline-{}", parent.raw_id()));
    let mut configs: HashMap<StepHandle, Value> = HashMap::new();
    let mut preloaded: HashMap<StepHandle, HashMap<String, Value>> = HashMap::new();
    // output name -> group key -> concrete clone
    let mut output_clones: BTreeMap<String, BTreeMap<String, StepHandle>> = BTreeMap::new();

    for (key, value) in &groups {
        let inner = sg.inner_pipeline(key)?;
        let mut clone_of: HashMap<usize, StepHandle> = HashMap::new();

        for node in inner.pipeline.nodes() {
            let name = node.handle.name().map(|n| format!("{n}-{key}"));
            let filename = node.output_filename.clone().unwrap_or_default();
            let clone = match (node.is_input, node.is_output) {
                (true, true) => concrete.add_source_sink(
                    node.factory.clone(),
                    &format!("{filename}__{key}"),
                    name.as_deref(),
                ),
                (true, false) => concrete.add_source(node.factory.clone(), name.as_deref()),
                (false, true) => concrete.add_sink(
                    node.factory.clone(),
                    &format!("{filename}__{key}"),
                    name.as_deref(),
                ),
                (false, false) => concrete.add_step(node.factory.clone(), name.as_deref()),
            };

            if node.handle == inner.start {
                preloaded.insert(
                    clone.clone(),
                    HashMap::from([(SCATTER_INPUT_LABEL.to_string(), value.clone())]),
                );
            }
            if node.is_output {
                output_clones
                    .entry(filename)
                    .or_default()
                    .insert(key.clone(), clone.clone());
            }
            if let Some(config) = inner.configs.get(&node.handle) {
                configs.insert(clone.clone(), config.clone());
            }
            clone_of.insert(node.handle.raw_id(), clone);
        }

        for edge in inner.pipeline.edges() {
            concrete
                .connect(
                    &clone_of[&edge.source.raw_id()],
                    &clone_of[&edge.target.raw_id()],
                    &edge.label,
                )
                .map_err(|e| sub_error(&parent, e))?;
        }
    }

    let plan = concrete.build(configs).map_err(|e| sub_error(&parent, e))?;
    let sub_store = Arc::new(
        ctx.storage()
            .sub_storage(&parent, plan.graph())
            .map_err(|e| sub_error(&parent, e))?,
    );

    let wanted: HashSet<StepHandle> = output_clones
        .values()
        .flat_map(|clones| clones.values().cloned())
        .collect();
    let results = plan
        .execute_with_store(sub_store, preloaded, &wanted)
        .await
        .map_err(|e| sub_error(&parent, e))?;

    let mut gathered = serde_json::Map::new();
    for (output, clones) in output_clones {
        let group_results: BTreeMap<String, Value> = clones
            .into_iter()
            .map(|(key, clone)| (key, results[&clone].clone()))
            .collect();
        let value = sg.gather(&output, group_results).await?;
        gathered.insert(output, value);
    }
    Ok(Value::Object(gathered))
}

fn sub_error(parent: &StepHandle, cause: StepflowError) -> anyhow::Error {
    StepflowError::SubPipeline {
        parent: parent.clone(),
        cause: Box::new(cause),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::plan::ExecuteOptions;
    use crate::step::{InputLabels, Step, StepFactory};
    use crate::test_util::{ExecutionLog, TestFactory};
    use serde_json::json;
    use tempfile::TempDir;

    /// Splits a corpus object by language, tokenizes each group through an
    /// inner pipeline, and gathers the per-language results.
    struct ByLanguage {
        log: ExecutionLog,
    }

    #[async_trait]
    impl ScatterGather for ByLanguage {
        async fn scatter(
            &self,
            inputs: &StepInputs,
        ) -> anyhow::Result<BTreeMap<String, Value>> {
            let corpus = inputs.require("corpus")?;
            let object = corpus
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("corpus is not an object"))?;
            Ok(object
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect())
        }

        fn inner_pipeline(&self, group: &str) -> anyhow::Result<InnerPipeline> {
            let mut template = Pipeline::new("per-language");
            let start = template.add_source(
                Arc::new(
                    TestFactory::new("start")
                        .recording(&self.log)
                        .with_transform(|inputs| {
                            inputs.get(SCATTER_INPUT_LABEL).cloned().unwrap_or(Value::Null)
                        }),
                ),
                Some("start"),
            );
            let tokenize = template.add_step(
                Arc::new(
                    TestFactory::new("tokenize")
                        .with_labels(&["docs"])
                        .recording(&self.log)
                        .with_transform(|inputs| {
                            let docs = inputs.get("docs").and_then(Value::as_array);
                            let tokens: Vec<Value> = docs
                                .map(|docs| {
                                    docs.iter()
                                        .filter_map(Value::as_str)
                                        .flat_map(str::split_whitespace)
                                        .map(|t| json!(t))
                                        .collect()
                                })
                                .unwrap_or_default();
                            Value::Array(tokens)
                        }),
                ),
                Some("tokenize"),
            );
            let topics = template.add_sink(
                Arc::new(
                    TestFactory::new("collect")
                        .with_labels(&["tokens"])
                        .recording(&self.log)
                        .with_transform(|inputs| {
                            inputs.get("tokens").cloned().unwrap_or(Value::Null)
                        }),
                ),
                "topics",
                Some("topics"),
            );
            template.connect(&start, &tokenize, "docs").unwrap();
            template.connect(&tokenize, &topics, "tokens").unwrap();

            // The group key distinguishes otherwise-identical clones for
            // the structural matcher.
            let configs = HashMap::from([(start.clone(), json!({"group": group}))]);
            Ok(InnerPipeline {
                pipeline: template,
                start,
                configs,
            })
        }

        async fn gather(
            &self,
            _output: &str,
            groups: BTreeMap<String, Value>,
        ) -> anyhow::Result<Value> {
            Ok(Value::Object(groups.into_iter().collect()))
        }
    }

    struct FanOutFactory {
        log: ExecutionLog,
    }

    impl StepFactory for FanOutFactory {
        fn type_identity(&self) -> &str {
            "fanout"
        }

        fn input_labels(&self) -> InputLabels {
            InputLabels::fixed(["corpus"])
        }

        fn accepts_upstream(&self, _upstream: &dyn StepFactory, _label: &str) -> bool {
            true
        }

        fn data_format(&self) -> &str {
            "json"
        }

        fn instantiate(&self, _config: &Value) -> anyhow::Result<Box<dyn Step>> {
            Ok(Box::new(FanOutStep {
                inner: ByLanguage {
                    log: self.log.clone(),
                },
            }))
        }
    }

    struct FanOutStep {
        inner: ByLanguage,
    }

    #[async_trait]
    impl Step for FanOutStep {
        async fn execute(
            &mut self,
            inputs: StepInputs,
            ctx: &ExecutionContext,
        ) -> anyhow::Result<Value> {
            run_scatter_gather(&self.inner, &inputs, ctx).await
        }

        // The sub-pipeline's own checkpoint is dynamic; reuse happens
        // through the nested store instead.
        fn checkpoint_is_valid(&self, _metadata: &Value) -> bool {
            false
        }
    }

    fn corpus() -> Value {
        json!({
            "en": ["the quick fox", "lazy dog"],
            "fr": ["le renard rapide"],
        })
    }

    fn outer(log: &ExecutionLog, inner_log: &ExecutionLog) -> Pipeline {
        let mut pipeline = Pipeline::new("languages");
        let source = pipeline.add_source(
            Arc::new(
                TestFactory::new("load")
                    .recording(log)
                    .with_result(corpus()),
            ),
            Some("load"),
        );
        let fanout = pipeline.add_sink(
            Arc::new(FanOutFactory {
                log: inner_log.clone(),
            }),
            "by-language",
            Some("fanout"),
        );
        pipeline.connect(&source, &fanout, "corpus").unwrap();
        pipeline
    }

    #[tokio::test]
    async fn test_scatter_gather_end_to_end() {
        crate::test_util::init_tracing();
        let dir = TempDir::new().unwrap();
        let outer_log = ExecutionLog::default();
        let inner_log = ExecutionLog::default();

        let pipeline = outer(&outer_log, &inner_log);
        let plan = pipeline.build(HashMap::new()).unwrap();
        plan.execute(ExecuteOptions::new(
            dir.path().join("checkpoints"),
            dir.path().join("outputs"),
        ))
        .await
        .unwrap();

        // Three template nodes, two groups.
        assert_eq!(inner_log.executed().len(), 6);

        // The published outer result folds both groups under the template
        // output name.
        let published = dir
            .path()
            .join("outputs")
            .join("languages")
            .join("by-language")
            .join("value.json");
        let value: Value =
            serde_json::from_str(&std::fs::read_to_string(published).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "topics": {
                    "en": ["the", "quick", "fox", "lazy", "dog"],
                    "fr": ["le", "renard", "rapide"],
                }
            })
        );

        // Inner checkpoints live inside the parent's checkpoint directory.
        let nested = dir
            .path()
            .join("checkpoints")
            .join("languages")
            .join("data")
            .join("1")
            .join("nested");
        assert!(nested.join("metadata").join("graph.json").exists());
        assert!(nested.join("data").join("0").exists());
    }

    #[tokio::test]
    async fn test_inner_checkpoints_reused_across_runs() {
        let dir = TempDir::new().unwrap();
        let outer_log = ExecutionLog::default();
        let inner_log = ExecutionLog::default();
        let options = || {
            ExecuteOptions::new(dir.path().join("checkpoints"), dir.path().join("outputs"))
        };

        outer(&outer_log, &inner_log)
            .build(HashMap::new())
            .unwrap()
            .execute(options())
            .await
            .unwrap();
        assert_eq!(inner_log.executed().len(), 6);

        // The fan-out step itself re-runs (its checkpoint is dynamic), but
        // every inner step is served from the nested store.
        inner_log.clear();
        outer_log.clear();
        outer(&outer_log, &inner_log)
            .build(HashMap::new())
            .unwrap()
            .execute(options())
            .await
            .unwrap();
        assert!(inner_log.executed().is_empty());
    }
}
