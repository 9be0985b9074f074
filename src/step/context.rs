// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Execution context threaded into running steps
//!
//! Replaces the original hierarchical config bag with a structured value.
//! The system-provided fields (handle, checkpoint directory, storage
//! manager) have typed accessors; everything else lives in a string-keyed
//! side table where the `system.` namespace is reserved.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::errors::{StepflowError, StepflowResult};
use crate::pipeline::StepHandle;
use crate::store::ResultStore;

/// Per-task context handed to [`Step::execute`](crate::step::Step::execute)
pub struct ExecutionContext {
    handle: StepHandle,
    checkpoint_dir: PathBuf,
    storage: Arc<ResultStore>,
    values: RwLock<HashMap<String, Value>>,
}

impl ExecutionContext {
    pub(crate) fn new(
        handle: StepHandle,
        checkpoint_dir: PathBuf,
        storage: Arc<ResultStore>,
    ) -> Self {
        Self {
            handle,
            checkpoint_dir,
            storage,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Handle of the step currently executing
    pub fn handle(&self) -> &StepHandle {
        &self.handle
    }

    /// Directory reserved for this step's checkpoint
    ///
    /// Steps may place auxiliary files next to their checkpoint here.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// The storage manager of the running pipeline
    ///
    /// Sub-pipeline steps use this to obtain a nested store.
    pub fn storage(&self) -> &Arc<ResultStore> {
        &self.storage
    }

    /// Read a user-namespace value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    /// Write a user-namespace value
    ///
    /// Keys under `system.` are reserved and rejected.
    pub fn set(&self, key: impl Into<String>, value: Value) -> StepflowResult<()> {
        let key = key.into();
        if key.starts_with("system.") {
            return Err(StepflowError::Execution {
                message: format!("context key '{key}' is in the reserved system namespace"),
            });
        }
        self.values
            .write()
            .map_err(|_| StepflowError::Execution {
                message: "execution context lock poisoned".to_string(),
            })?
            .insert(key, value);
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("handle", &self.handle)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .finish()
    }
}
