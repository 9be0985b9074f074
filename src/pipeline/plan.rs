// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Execution plans
//!
//! The compiled form of a validated pipeline: a list of scheduler
//! instructions plus everything the executor and the store need to run
//! them (factories, configs, output map, checkpoint projection).

use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::CheckpointGraph;
use crate::errors::StepflowResult;
use crate::formats::FormatRegistry;
use crate::pipeline::executor::TaskExecutor;
use crate::pipeline::handle::StepHandle;
use crate::step::StepFactory;
use crate::store::ResultStore;

/// One declared input of a task: where the value comes from and under
/// which label the step receives it
#[derive(Clone)]
pub struct InputSlot {
    pub source: StepHandle,
    pub factory: Arc<dyn StepFactory>,
    pub label: String,
}

impl std::fmt::Debug for InputSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSlot")
            .field("source", &self.source)
            .field("label", &self.label)
            .finish()
    }
}

/// A ready-to-run task
#[derive(Clone)]
pub struct Start {
    pub handle: StepHandle,
    pub factory: Arc<dyn StepFactory>,
    pub inputs: Vec<InputSlot>,
}

impl std::fmt::Debug for Start {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Start")
            .field("handle", &self.handle)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// A guard: wait for every required handle, then release the tasks
#[derive(Debug, Clone)]
pub struct Sync {
    pub requires: BTreeSet<StepHandle>,
    pub then: Vec<Start>,
}

/// A scheduler directive
#[derive(Debug, Clone)]
pub enum Instruction {
    Start(Start),
    Sync(Sync),
}

/// Where a run reads and writes
pub struct ExecuteOptions {
    /// Root under which `<pipeline_name>/metadata` and `.../data` live
    pub checkpoint_root: PathBuf,
    /// Root under which output steps publish `<pipeline_name>/<filename>`
    pub output_root: PathBuf,
    /// Codec registry; defaults to the built-in formats
    pub formats: FormatRegistry,
}

impl ExecuteOptions {
    pub fn new(checkpoint_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_root: checkpoint_root.into(),
            output_root: output_root.into(),
            formats: FormatRegistry::with_builtins(),
        }
    }

    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }
}

/// Compiled, executable form of a pipeline
pub struct ExecutionPlan {
    name: String,
    instructions: Vec<Instruction>,
    factories: HashMap<StepHandle, Arc<dyn StepFactory>>,
    output_steps: HashSet<StepHandle>,
    output_files: HashMap<usize, String>,
    config_by_step: HashMap<StepHandle, Value>,
    graph: CheckpointGraph,
}

impl ExecutionPlan {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        instructions: Vec<Instruction>,
        factories: HashMap<StepHandle, Arc<dyn StepFactory>>,
        output_steps: HashSet<StepHandle>,
        output_files: HashMap<usize, String>,
        config_by_step: HashMap<StepHandle, Value>,
        graph: CheckpointGraph,
    ) -> Self {
        Self {
            name,
            instructions,
            factories,
            output_steps,
            output_files,
            config_by_step,
            graph,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled instruction list
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The checkpoint projection persisted alongside this run
    pub fn graph(&self) -> &CheckpointGraph {
        &self.graph
    }

    /// Handles of the output-marked steps
    pub fn output_steps(&self) -> &HashSet<StepHandle> {
        &self.output_steps
    }

    /// Run the pipeline against the given storage roots
    ///
    /// Opens (and reconciles) the result store under
    /// `<checkpoint_root>/<name>`, then drives the instruction list to
    /// completion.
    pub async fn execute(&self, options: ExecuteOptions) -> StepflowResult<()> {
        let store = Arc::new(ResultStore::open(
            options.checkpoint_root.join(&self.name),
            Some(options.output_root.join(&self.name)),
            &self.graph,
            self.output_files.clone(),
            options.formats,
        )?);
        self.execute_with_store(store, HashMap::new(), &HashSet::new())
            .await?;
        Ok(())
    }

    /// Run against an already-opened store, optionally with preloaded
    /// per-step inputs, and read back the requested results afterwards.
    /// This is the entry point used by the sub-pipeline engine.
    pub(crate) async fn execute_with_store(
        &self,
        store: Arc<ResultStore>,
        preloaded: HashMap<StepHandle, HashMap<String, Value>>,
        return_values: &HashSet<StepHandle>,
    ) -> StepflowResult<HashMap<StepHandle, Value>> {
        let mut executor = TaskExecutor::new(&self.instructions);
        executor
            .run(store.clone(), &self.config_by_step, preloaded)
            .await?;

        let mut results = HashMap::new();
        for handle in return_values {
            let factory = &self.factories[handle];
            let value = store.retrieve(handle, factory.as_ref()).await?;
            results.insert(handle.clone(), value);
        }
        Ok(results)
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("name", &self.name)
            .field("instructions", &self.instructions.len())
            .field("steps", &self.factories.len())
            .finish()
    }
}
