// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Pipeline construction and validation
//!
//! A [`Pipeline`] is built incrementally: steps are added (plain, source,
//! or sink), then connected with labelled edges. `build` validates the
//! graph and lowers it into an [`ExecutionPlan`].

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::checkpoint::{CheckpointGraph, CheckpointNode};
use crate::errors::{StepflowError, StepflowResult};
use crate::pipeline::handle::{next_pipeline_tag, StepHandle};
use crate::pipeline::plan::{ExecutionPlan, InputSlot, Instruction, Start, Sync};
use crate::step::StepFactory;

/// A step within a pipeline, as seen from outside the builder
#[derive(Clone)]
pub struct PipelineNode {
    pub handle: StepHandle,
    pub factory: Arc<dyn StepFactory>,
    pub is_input: bool,
    pub is_output: bool,
    pub output_filename: Option<String>,
}

/// A labelled edge between two steps
#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub source: StepHandle,
    pub target: StepHandle,
    pub label: String,
}

/// Incrementally-built DAG of steps
pub struct Pipeline {
    name: String,
    tag: u64,
    steps: Vec<(StepHandle, Arc<dyn StepFactory>)>,
    targets_of: HashMap<usize, Vec<usize>>,
    edge_labels: HashMap<(usize, usize), String>,
    inputs: HashSet<usize>,
    outputs: HashSet<usize>,
    output_files: HashMap<usize, String>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: next_pipeline_tag(),
            steps: Vec::new(),
            targets_of: HashMap::new(),
            edge_labels: HashMap::new(),
            inputs: HashSet::new(),
            outputs: HashSet::new(),
            output_files: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an intermediate step
    pub fn add_step(
        &mut self,
        factory: Arc<dyn StepFactory>,
        name: Option<&str>,
    ) -> StepHandle {
        let handle = StepHandle::new(self.steps.len(), self.tag, name);
        self.steps.push((handle.clone(), factory));
        handle
    }

    /// Add an input step (a source of the pipeline)
    pub fn add_source(
        &mut self,
        factory: Arc<dyn StepFactory>,
        name: Option<&str>,
    ) -> StepHandle {
        let handle = self.add_step(factory, name);
        self.inputs.insert(handle.raw_id());
        handle
    }

    /// Add a step that is both an input and a published output
    pub fn add_source_sink(
        &mut self,
        factory: Arc<dyn StepFactory>,
        filename: &str,
        name: Option<&str>,
    ) -> StepHandle {
        let handle = self.add_source(factory, name);
        self.outputs.insert(handle.raw_id());
        self.output_files.insert(handle.raw_id(), filename.to_string());
        handle
    }

    /// Add an output step whose result is published under `filename`
    pub fn add_sink(
        &mut self,
        factory: Arc<dyn StepFactory>,
        filename: &str,
        name: Option<&str>,
    ) -> StepHandle {
        let handle = self.add_step(factory, name);
        self.outputs.insert(handle.raw_id());
        self.output_files.insert(handle.raw_id(), filename.to_string());
        handle
    }

    /// Connect `source` to `target` under an input label
    pub fn connect(
        &mut self,
        source: &StepHandle,
        target: &StepHandle,
        label: &str,
    ) -> StepflowResult<()> {
        for handle in [source, target] {
            if !self.contains(handle) {
                return Err(StepflowError::UnknownStep {
                    pipeline: self.name.clone(),
                    handle: handle.clone(),
                });
            }
        }
        if self.inputs.contains(&target.raw_id()) {
            return Err(StepflowError::InputAsSink {
                target: target.clone(),
            });
        }
        if source == target {
            return Err(StepflowError::SelfLoop {
                handle: source.clone(),
            });
        }
        if self
            .edge_labels
            .contains_key(&(source.raw_id(), target.raw_id()))
        {
            return Err(StepflowError::DuplicateEdge {
                from_step: source.clone(),
                target: target.clone(),
            });
        }

        let source_factory = &self.steps[source.raw_id()].1;
        let target_factory = &self.steps[target.raw_id()].1;
        if !target_factory.input_labels().admits(label)
            || !target_factory.accepts_upstream(source_factory.as_ref(), label)
        {
            return Err(StepflowError::UnsupportedLabel {
                from_step: source.clone(),
                target: target.clone(),
                label: label.to_string(),
            });
        }

        self.targets_of
            .entry(source.raw_id())
            .or_default()
            .push(target.raw_id());
        self.edge_labels
            .insert((source.raw_id(), target.raw_id()), label.to_string());
        Ok(())
    }

    /// All steps, in insertion order
    pub fn nodes(&self) -> Vec<PipelineNode> {
        self.steps
            .iter()
            .map(|(handle, factory)| PipelineNode {
                handle: handle.clone(),
                factory: factory.clone(),
                is_input: self.inputs.contains(&handle.raw_id()),
                is_output: self.outputs.contains(&handle.raw_id()),
                output_filename: self.output_files.get(&handle.raw_id()).cloned(),
            })
            .collect()
    }

    /// All edges, ordered by (source, target)
    pub fn edges(&self) -> Vec<PipelineEdge> {
        let mut keys: Vec<_> = self.edge_labels.keys().copied().collect();
        keys.sort();
        keys.into_iter()
            .map(|(source, target)| PipelineEdge {
                source: self.handle(source),
                target: self.handle(target),
                label: self.edge_labels[&(source, target)].clone(),
            })
            .collect()
    }

    /// Validate the graph and compile it into an executable plan
    ///
    /// Validation short-circuits on the first failure, in order: input
    /// completeness, boundary constraints, reachability, acyclicity.
    pub fn build(
        &self,
        config_by_step: HashMap<StepHandle, Value>,
    ) -> StepflowResult<ExecutionPlan> {
        self.check_connection_constraints()?;
        self.check_boundary_constraints()?;
        self.check_reachability()?;
        self.check_acyclic()?;

        let configs: HashMap<StepHandle, Value> = self
            .steps
            .iter()
            .map(|(handle, _)| {
                let config = config_by_step.get(handle).cloned().unwrap_or(Value::Null);
                (handle.clone(), config)
            })
            .collect();

        let instructions = self.compile_instructions();
        let graph = self.checkpoint_graph(&configs);
        let factories: HashMap<StepHandle, Arc<dyn StepFactory>> = self
            .steps
            .iter()
            .map(|(handle, factory)| (handle.clone(), factory.clone()))
            .collect();
        let output_steps: HashSet<StepHandle> =
            self.outputs.iter().map(|&id| self.handle(id)).collect();

        Ok(ExecutionPlan::new(
            self.name.clone(),
            instructions,
            factories,
            output_steps,
            self.output_files.clone(),
            configs,
            graph,
        ))
    }

    fn contains(&self, handle: &StepHandle) -> bool {
        handle.pipeline_tag() == self.tag && handle.raw_id() < self.steps.len()
    }

    fn handle(&self, id: usize) -> StepHandle {
        self.steps[id].0.clone()
    }

    /// Incoming dependency set per step
    fn dependencies(&self) -> HashMap<usize, BTreeSet<usize>> {
        let mut deps: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for (&(source, target), _) in &self.edge_labels {
            deps.entry(target).or_default().insert(source);
        }
        deps
    }

    // ─────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────

    /// Every declared non-wildcard label must be filled exactly once
    fn check_connection_constraints(&self) -> StepflowResult<()> {
        let mut missing: Vec<BTreeSet<String>> = self
            .steps
            .iter()
            .map(|(_, factory)| factory.input_labels().labels().clone())
            .collect();

        for (&(source, target), label) in &self.edge_labels {
            if missing[target].remove(label) {
                continue;
            }
            // Label already satisfied, or undeclared: only wildcard steps
            // may take extras, and never the same label twice.
            let labels = self.steps[target].1.input_labels();
            if !labels.wildcard() || self.label_count(target, label) > 1 {
                return Err(StepflowError::UnsupportedLabel {
                    from_step: self.handle(source),
                    target: self.handle(target),
                    label: label.clone(),
                });
            }
        }

        for (id, labels) in missing.iter().enumerate() {
            if !labels.is_empty() {
                return Err(StepflowError::MissingConnection {
                    handle: self.handle(id),
                    labels: labels.iter().cloned().collect(),
                });
            }
        }
        Ok(())
    }

    fn label_count(&self, target: usize, label: &str) -> usize {
        self.edge_labels
            .iter()
            .filter(|(&(_, t), l)| t == target && l.as_str() == label)
            .count()
    }

    /// Inputs and outputs aside, every step needs both sides connected
    fn check_boundary_constraints(&self) -> StepflowResult<()> {
        let deps = self.dependencies();
        for (handle, _) in &self.steps {
            let id = handle.raw_id();
            let is_input = self.inputs.contains(&id);
            let is_output = self.outputs.contains(&id);
            let has_incoming = deps.contains_key(&id);
            let has_outgoing = self.targets_of.get(&id).is_some_and(|t| !t.is_empty());

            if !is_input && !is_output {
                if !has_incoming {
                    return Err(StepflowError::BadBoundary {
                        handle: handle.clone(),
                        side: "incoming",
                    });
                }
                if !has_outgoing {
                    return Err(StepflowError::BadBoundary {
                        handle: handle.clone(),
                        side: "outgoing",
                    });
                }
            }
            if is_input && !is_output && !has_outgoing {
                return Err(StepflowError::BadBoundary {
                    handle: handle.clone(),
                    side: "outgoing",
                });
            }
            if is_output && !is_input && !has_incoming {
                return Err(StepflowError::BadBoundary {
                    handle: handle.clone(),
                    side: "incoming",
                });
            }
        }
        Ok(())
    }

    /// Every step must be reachable from the input set
    fn check_reachability(&self) -> StepflowResult<()> {
        let mut reachable: HashSet<usize> = HashSet::new();
        let mut stack: Vec<usize> = self.inputs.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                if let Some(targets) = self.targets_of.get(&id) {
                    stack.extend(targets.iter().copied());
                }
            }
        }
        let mut stranded: Vec<StepHandle> = self
            .steps
            .iter()
            .filter(|(handle, _)| !reachable.contains(&handle.raw_id()))
            .map(|(handle, _)| handle.clone())
            .collect();
        if !stranded.is_empty() {
            stranded.sort();
            return Err(StepflowError::Unreachable { handles: stranded });
        }
        Ok(())
    }

    /// The edge relation must admit a topological order
    fn check_acyclic(&self) -> StepflowResult<()> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = self
            .steps
            .iter()
            .map(|(handle, _)| graph.add_node(handle.raw_id()))
            .collect();
        for &(source, target) in self.edge_labels.keys() {
            graph.add_edge(indices[source], indices[target], ());
        }
        match toposort(&graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(StepflowError::Cycle {
                handle: self.handle(graph[cycle.node_id()]),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Compilation
    // ─────────────────────────────────────────────────────────────────────

    /// Lower the validated graph into scheduler instructions
    ///
    /// One `Start` per input node; remaining nodes grouped by their exact
    /// dependency set, one `Sync` per group. Sorted by raw id throughout
    /// so the plan is deterministic.
    fn compile_instructions(&self) -> Vec<Instruction> {
        let deps = self.dependencies();
        let mut instructions = Vec::new();

        let mut inputs: Vec<usize> = self.inputs.iter().copied().collect();
        inputs.sort_unstable();
        for id in inputs {
            instructions.push(Instruction::Start(self.make_start(id, &deps)));
        }

        let mut groups: BTreeMap<BTreeSet<usize>, BTreeSet<usize>> = BTreeMap::new();
        for (&target, sources) in &deps {
            groups
                .entry(sources.clone())
                .or_default()
                .insert(target);
        }
        for (requires, members) in groups {
            instructions.push(Instruction::Sync(Sync {
                requires: requires.into_iter().map(|id| self.handle(id)).collect(),
                then: members
                    .into_iter()
                    .map(|id| self.make_start(id, &deps))
                    .collect(),
            }));
        }

        instructions
    }

    fn make_start(&self, id: usize, deps: &HashMap<usize, BTreeSet<usize>>) -> Start {
        let inputs = deps
            .get(&id)
            .map(|sources| {
                sources
                    .iter()
                    .map(|&source| InputSlot {
                        source: self.handle(source),
                        factory: self.steps[source].1.clone(),
                        label: self.edge_labels[&(source, id)].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Start {
            handle: self.handle(id),
            factory: self.steps[id].1.clone(),
            inputs,
        }
    }

    /// Project the pipeline into its persisted matching form
    fn checkpoint_graph(&self, configs: &HashMap<StepHandle, Value>) -> CheckpointGraph {
        let mut nodes = BTreeMap::new();
        for (handle, factory) in &self.steps {
            let id = handle.raw_id();
            let labels = factory.input_labels();
            let upstream: BTreeMap<String, usize> = self
                .edge_labels
                .iter()
                .filter(|(&(_, target), _)| target == id)
                .map(|(&(source, _), label)| (label.clone(), source))
                .collect();
            nodes.insert(
                id,
                CheckpointNode {
                    type_identity: factory.type_identity().to_string(),
                    input_labels: labels.labels().clone(),
                    wildcard: labels.wildcard(),
                    upstream,
                    is_input: self.inputs.contains(&id),
                    config: configs.get(handle).cloned().unwrap_or(Value::Null),
                },
            );
        }
        CheckpointGraph::new(nodes)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("edges", &self.edge_labels.len())
            .finish()
    }
}
