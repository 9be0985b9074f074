// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Task executor
//!
//! A cooperative scheduler over the compiled instruction list. One loop
//! owns the `pending`/`blocked`/`done` sets; task bodies run concurrently
//! on the runtime and suspend at I/O and at the user `execute` body. A
//! handle enters `done` only after its result is stored, which gives the
//! happens-before edge between a store and any downstream retrieve.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::{StepflowError, StepflowResult};
use crate::pipeline::handle::StepHandle;
use crate::pipeline::plan::{Instruction, Start, Sync};
use crate::step::{ExecutionContext, StepInputs};
use crate::store::ResultStore;

type TaskSet = JoinSet<StepflowResult<StepHandle>>;

/// Cooperative scheduler for one pipeline run
pub struct TaskExecutor {
    pending: Vec<Start>,
    blocked: Vec<Sync>,
    done: HashSet<StepHandle>,
}

impl TaskExecutor {
    /// Partition the instruction list into ready and guarded tasks
    pub fn new(instructions: &[Instruction]) -> Self {
        let mut pending = Vec::new();
        let mut blocked = Vec::new();
        for instruction in instructions {
            match instruction {
                Instruction::Start(start) => pending.push(start.clone()),
                Instruction::Sync(sync) => blocked.push(sync.clone()),
            }
        }
        Self {
            pending,
            blocked,
            done: HashSet::new(),
        }
    }

    /// Drive all tasks to completion, or to the first failure
    ///
    /// On failure no further task is dispatched; active tasks drain and
    /// their own failures are logged as suppressed before the first error
    /// propagates.
    pub async fn run(
        &mut self,
        store: Arc<ResultStore>,
        config_by_step: &HashMap<StepHandle, Value>,
        mut preloaded: HashMap<StepHandle, HashMap<String, Value>>,
    ) -> StepflowResult<()> {
        let mut active: TaskSet = JoinSet::new();

        while !self.pending.is_empty() || !self.blocked.is_empty() || !active.is_empty() {
            self.unblock_tasks();
            self.start_pending_tasks(&mut active, &store, config_by_step, &mut preloaded);

            if active.is_empty() {
                // Validation rules out unsatisfiable guards; reaching this
                // point means the instruction list was corrupted.
                return Err(StepflowError::Execution {
                    message: format!(
                        "scheduler stalled with {} guarded task group(s) and nothing running",
                        self.blocked.len()
                    ),
                });
            }

            let finished = active.join_next().await;
            match finished {
                Some(Ok(Ok(handle))) => {
                    info!(%handle, "task finished");
                    self.done.insert(handle);
                }
                Some(Ok(Err(error))) => return self.abort(active, error).await,
                Some(Err(join_error)) => {
                    let error = StepflowError::Execution {
                        message: format!("task panicked: {join_error}"),
                    };
                    return self.abort(active, error).await;
                }
                None => unreachable!("join_next on a non-empty set"),
            }
        }

        Ok(())
    }

    /// Release guarded groups whose requirements are all done
    fn unblock_tasks(&mut self) {
        let mut still_blocked = Vec::new();
        for sync in self.blocked.drain(..) {
            if sync.requires.iter().all(|h| self.done.contains(h)) {
                info!(count = sync.then.len(), "unblocking tasks");
                self.pending.extend(sync.then);
            } else {
                still_blocked.push(sync);
            }
        }
        self.blocked = still_blocked;
    }

    /// Launch every pending task
    fn start_pending_tasks(
        &mut self,
        active: &mut TaskSet,
        store: &Arc<ResultStore>,
        config_by_step: &HashMap<StepHandle, Value>,
        preloaded: &mut HashMap<StepHandle, HashMap<String, Value>>,
    ) {
        while let Some(start) = self.pending.pop() {
            info!(handle = %start.handle, "starting pending task");
            let config = config_by_step
                .get(&start.handle)
                .cloned()
                .unwrap_or(Value::Null);
            let preloads = preloaded.remove(&start.handle).unwrap_or_default();
            let store = store.clone();
            active.spawn(run_task(store, start, config, preloads));
        }
    }

    /// Drop undispatched work and wait out the active tasks
    async fn abort(&mut self, mut active: TaskSet, first: StepflowError) -> StepflowResult<()> {
        warn!(error = %first, "aborting pipeline run");
        self.pending.clear();
        self.blocked.clear();
        while let Some(result) = active.join_next().await {
            match result {
                Ok(Ok(handle)) => {
                    self.done.insert(handle);
                }
                Ok(Err(error)) => warn!(error = %error, "suppressed failure while draining"),
                Err(join_error) => warn!(error = %join_error, "suppressed panic while draining"),
            }
        }
        Err(first)
    }
}

/// One task: load inputs, reuse a valid checkpoint or execute and store
async fn run_task(
    store: Arc<ResultStore>,
    start: Start,
    config: Value,
    preloads: HashMap<String, Value>,
) -> StepflowResult<StepHandle> {
    let handle = start.handle.clone();

    let mut inputs = StepInputs::new();
    for slot in &start.inputs {
        let format = slot.factory.data_format();
        if let Some(value) = preloads.get(&slot.label) {
            debug!(%handle, label = %slot.label, "using preloaded input");
            inputs.insert(&slot.label, value.clone(), format);
        } else {
            debug!(%handle, label = %slot.label, source = %slot.source, "loading input");
            let value = store.retrieve(&slot.source, slot.factory.as_ref()).await?;
            inputs.insert(&slot.label, value, format);
        }
    }
    // Preloaded values without a matching edge (sub-pipeline start values,
    // precomputed inputs) are injected directly.
    for (label, value) in preloads {
        if inputs.get(&label).is_none() {
            debug!(%handle, %label, "injecting edge-less preloaded input");
            inputs.insert(label, value, start.factory.data_format());
        }
    }

    let mut step = start
        .factory
        .instantiate(&config)
        .map_err(|e| StepflowError::step_failed(handle.clone(), e))?;
    let ctx = ExecutionContext::new(
        handle.clone(),
        store.checkpoint_path(&handle),
        store.clone(),
    );

    if store.have_checkpoint(&handle) {
        let metadata = store.retrieve_metadata(&handle).await?;
        if step.checkpoint_is_valid(&metadata) {
            info!(%handle, "reusing checkpoint");
            return Ok(handle);
        }
    }

    info!(%handle, "executing step");
    let result = step
        .execute(inputs, &ctx)
        .await
        .map_err(|e| StepflowError::step_failed(handle.clone(), e))?;
    info!(%handle, "storing result");
    store
        .store(&handle, start.factory.as_ref(), &result, &step.checkpoint_metadata())
        .await?;

    Ok(handle)
}
