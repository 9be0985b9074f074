// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Result store
//!
//! Owns the on-disk checkpoint layout of one pipeline run:
//!
//! ```text
//! <checkpoint_dir>/
//!   metadata/
//!     graph.json          -- CheckpointGraph of the last run
//!     <raw_id>.json       -- step metadata, one per checkpoint
//!   data/
//!     <raw_id>/           -- codec-written artifact directory
//! ```
//!
//! Opening a store reconciles the on-disk state against the current
//! pipeline: stranded `_temp` entries from an interrupted run are removed,
//! the persisted graph is matched structurally against the current one,
//! reusable checkpoints are renamed to their new ids in two phases, and
//! everything unmatched is deleted. All of that happens before any task
//! runs. Whether a surviving checkpoint is actually reused is decided per
//! task by the executor, which asks the step's own validity check; a stale
//! checkpoint is then overwritten in place, so nested sub-pipeline stores
//! inside the data directory survive.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::checkpoint::{compute_mapping, CheckpointGraph};
use crate::errors::{StepflowError, StepflowResult};
use crate::formats::FormatRegistry;
use crate::pipeline::StepHandle;
use crate::step::StepFactory;

const GRAPH_FILE: &str = "graph.json";
const TEMP_SUFFIX: &str = "_temp";

/// Checkpoint and output storage for one pipeline
pub struct ResultStore {
    checkpoint_dir: PathBuf,
    metadata_dir: PathBuf,
    data_dir: PathBuf,
    output_dir: Option<PathBuf>,
    output_files: HashMap<usize, String>,
    formats: FormatRegistry,
}

impl ResultStore {
    /// Open (and reconcile) the store for a pipeline run
    ///
    /// Runs strictly before any task is dispatched: crash recovery, the
    /// structural match against the previous run, and the atomic remap all
    /// happen here, and the current graph is persisted on the way out.
    pub fn open(
        checkpoint_dir: impl Into<PathBuf>,
        output_dir: Option<PathBuf>,
        graph: &CheckpointGraph,
        output_files: HashMap<usize, String>,
        formats: FormatRegistry,
    ) -> StepflowResult<Self> {
        let checkpoint_dir = checkpoint_dir.into();
        let store = Self {
            metadata_dir: checkpoint_dir.join("metadata"),
            data_dir: checkpoint_dir.join("data"),
            checkpoint_dir,
            output_dir,
            output_files,
            formats,
        };
        store.make_directories()?;
        store.remove_stranded_temps()?;

        let graph_file = store.metadata_dir.join(GRAPH_FILE);
        if graph_file.exists() {
            let content = std::fs::read_to_string(&graph_file)
                .map_err(|e| StepflowError::storage(&graph_file, e.to_string()))?;
            match serde_json::from_str::<CheckpointGraph>(&content) {
                Ok(old) => {
                    let mapping = compute_mapping(graph, &old);
                    info!(reusable = mapping.len(), "reconciled checkpoint store");
                    store.remap(&mapping)?;
                }
                Err(e) => {
                    // Unreadable graph file: nothing can be matched.
                    warn!(error = %e, "discarding unreadable checkpoint graph");
                    store.remap(&BTreeMap::new())?;
                }
            }
        }

        let encoded = serde_json::to_string_pretty(graph)?;
        std::fs::write(&graph_file, encoded)
            .map_err(|e| StepflowError::storage(&graph_file, e.to_string()))?;

        Ok(store)
    }

    /// Open a nested store rooted inside a parent step's checkpoint
    ///
    /// Sub-stores have no output directory: sub-pipeline results are not
    /// publishable as user artifacts.
    pub fn sub_storage(
        &self,
        parent: &StepHandle,
        graph: &CheckpointGraph,
    ) -> StepflowResult<ResultStore> {
        let nested = self.data_path(parent.raw_id()).join("nested");
        Self::open(nested, None, graph, HashMap::new(), self.formats.clone())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ─────────────────────────────────────────────────────────────────────

    fn make_directories(&self) -> StepflowResult<()> {
        for dir in [&self.checkpoint_dir, &self.metadata_dir, &self.data_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| StepflowError::storage(dir, e.to_string()))?;
        }
        if let Some(output_dir) = &self.output_dir {
            std::fs::create_dir_all(output_dir)
                .map_err(|e| StepflowError::storage(output_dir, e.to_string()))?;
        }
        Ok(())
    }

    /// Remove `*_temp` entries stranded by a crash mid-remap
    fn remove_stranded_temps(&self) -> StepflowResult<()> {
        for entry in list_dir(&self.metadata_dir)? {
            let stem = entry.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem.ends_with(TEMP_SUFFIX) {
                warn!(path = %entry.display(), "removing stranded temp metadata");
                std::fs::remove_file(&entry)
                    .map_err(|e| StepflowError::storage(&entry, e.to_string()))?;
            }
        }
        for entry in list_dir(&self.data_dir)? {
            let name = entry.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if name.ends_with(TEMP_SUFFIX) {
                warn!(path = %entry.display(), "removing stranded temp checkpoint");
                std::fs::remove_dir_all(&entry)
                    .map_err(|e| StepflowError::storage(&entry, e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Delete unmatched checkpoints and rename the matched ones to their
    /// new ids. The rename runs in two phases through `_temp` names so a
    /// new id that equals another pair's old id is never clobbered; a
    /// crash between the phases is cleaned up at the next open.
    fn remap(&self, mapping: &BTreeMap<usize, usize>) -> StepflowResult<()> {
        // Only complete checkpoints (data and metadata) can be carried
        // over; half-written ones are swept with the unmatched.
        let referenced: HashSet<usize> = mapping
            .values()
            .copied()
            .filter(|&old| self.have_checkpoint_raw(old))
            .collect();

        for entry in list_dir(&self.metadata_dir)? {
            if entry.file_name().and_then(|s| s.to_str()) == Some(GRAPH_FILE) {
                continue;
            }
            if !entry_id(&entry).is_some_and(|id| referenced.contains(&id)) {
                std::fs::remove_file(&entry)
                    .map_err(|e| StepflowError::storage(&entry, e.to_string()))?;
            }
        }
        for entry in list_dir(&self.data_dir)? {
            if !entry_id(&entry).is_some_and(|id| referenced.contains(&id)) {
                std::fs::remove_dir_all(&entry)
                    .map_err(|e| StepflowError::storage(&entry, e.to_string()))?;
            }
        }

        // The relation need not be injective: several new nodes may reuse
        // one old checkpoint. The first claimant renames, the rest copy.
        let mut claimants: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (&new, &old) in mapping {
            if referenced.contains(&old) {
                claimants.entry(old).or_default().push(new);
            }
        }

        for (&old, news) in &claimants {
            let first = news[0];
            let first_data = self.temp_data_path(first);
            let first_meta = self.temp_metadata_path(first);
            rename(&self.data_path(old), &first_data)?;
            rename(&self.metadata_path(old), &first_meta)?;
            for &other in &news[1..] {
                copy_dir(&first_data, &self.temp_data_path(other))?;
                std::fs::copy(&first_meta, self.temp_metadata_path(other))
                    .map_err(|e| StepflowError::storage(&first_meta, e.to_string()))?;
            }
        }

        for news in claimants.values() {
            for &new in news {
                rename(&self.temp_data_path(new), &self.data_path(new))?;
                rename(&self.temp_metadata_path(new), &self.metadata_path(new))?;
            }
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Checkpoint Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a step result and its metadata
    ///
    /// Output-marked steps are additionally published under the output
    /// directory, replacing any previous artifact of the same name. The
    /// data directory is not wiped when it already exists: it may host a
    /// nested sub-pipeline store.
    pub async fn store(
        &self,
        handle: &StepHandle,
        factory: &dyn StepFactory,
        value: &Value,
        metadata: &Value,
    ) -> StepflowResult<()> {
        let codec = self.formats.get(factory.data_format())?;

        if let (Some(output_dir), Some(filename)) =
            (&self.output_dir, self.output_files.get(&handle.raw_id()))
        {
            let out = output_dir.join(filename);
            if out.exists() {
                tokio::fs::remove_dir_all(&out)
                    .await
                    .map_err(|e| StepflowError::storage(&out, e.to_string()))?;
            }
            tokio::fs::create_dir_all(&out)
                .await
                .map_err(|e| StepflowError::storage(&out, e.to_string()))?;
            codec.store(&out, value).await?;
            debug!(%handle, path = %out.display(), "published output");
        }

        let data = self.data_path(handle.raw_id());
        let existed = data.exists();
        tokio::fs::create_dir_all(&data)
            .await
            .map_err(|e| StepflowError::storage(&data, e.to_string()))?;
        if let Err(e) = codec.store(&data, value).await {
            if !existed {
                let _ = tokio::fs::remove_dir_all(&data).await;
            }
            return Err(e);
        }

        let meta_path = self.metadata_path(handle.raw_id());
        let encoded = serde_json::to_string(metadata)?;
        tokio::fs::write(&meta_path, encoded)
            .await
            .map_err(|e| StepflowError::storage(&meta_path, e.to_string()))?;

        Ok(())
    }

    /// Load a step's checkpointed result
    pub async fn retrieve(
        &self,
        handle: &StepHandle,
        factory: &dyn StepFactory,
    ) -> StepflowResult<Value> {
        if !self.have_checkpoint(handle) {
            return Err(StepflowError::MissingCheckpoint {
                handle: handle.clone(),
            });
        }
        let codec = self.formats.get(factory.data_format())?;
        codec.load(&self.data_path(handle.raw_id())).await
    }

    /// Load the metadata stored next to a step's checkpoint
    pub async fn retrieve_metadata(&self, handle: &StepHandle) -> StepflowResult<Value> {
        let path = self.metadata_path(handle.raw_id());
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StepflowError::storage(&path, e.to_string()))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Whether a complete checkpoint (data and metadata) exists
    pub fn have_checkpoint(&self, handle: &StepHandle) -> bool {
        self.have_checkpoint_raw(handle.raw_id())
    }

    /// Directory reserved for a step's checkpoint data
    pub fn checkpoint_path(&self, handle: &StepHandle) -> PathBuf {
        self.data_path(handle.raw_id())
    }

    /// Published output directory of an output-marked step
    ///
    /// Fails on sub-stores, which have no output directory.
    pub fn output_path(&self, handle: &StepHandle) -> StepflowResult<PathBuf> {
        let output_dir = self.output_dir.as_ref().ok_or_else(|| {
            StepflowError::storage(
                &self.checkpoint_dir,
                "no output directory is set (trying to publish from a sub-pipeline?)",
            )
        })?;
        let filename = self.output_files.get(&handle.raw_id()).ok_or_else(|| {
            StepflowError::storage(output_dir, format!("step {handle} is not an output step"))
        })?;
        Ok(output_dir.join(filename))
    }

    fn have_checkpoint_raw(&self, id: usize) -> bool {
        self.data_path(id).exists() && self.metadata_path(id).exists()
    }

    fn data_path(&self, id: usize) -> PathBuf {
        self.data_dir.join(id.to_string())
    }

    fn metadata_path(&self, id: usize) -> PathBuf {
        self.metadata_dir.join(format!("{id}.json"))
    }

    fn temp_data_path(&self, id: usize) -> PathBuf {
        self.data_dir.join(format!("{id}{TEMP_SUFFIX}"))
    }

    fn temp_metadata_path(&self, id: usize) -> PathBuf {
        self.metadata_dir.join(format!("{id}{TEMP_SUFFIX}.json"))
    }
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

/// Parse the raw checkpoint id out of a directory entry, stripping the
/// `.json` extension for metadata files.
fn entry_id(path: &Path) -> Option<usize> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn list_dir(dir: &Path) -> StepflowResult<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in
        std::fs::read_dir(dir).map_err(|e| StepflowError::storage(dir, e.to_string()))?
    {
        let entry = entry.map_err(|e| StepflowError::storage(dir, e.to_string()))?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

fn rename(from: &Path, to: &Path) -> StepflowResult<()> {
    std::fs::rename(from, to).map_err(|e| {
        StepflowError::storage(from, format!("rename to '{}' failed: {e}", to.display()))
    })
}

fn copy_dir(from: &Path, to: &Path) -> StepflowResult<()> {
    std::fs::create_dir_all(to).map_err(|e| StepflowError::storage(to, e.to_string()))?;
    for entry in list_dir(from)? {
        let target = to.join(entry.file_name().unwrap_or_default());
        if entry.is_dir() {
            copy_dir(&entry, &target)?;
        } else {
            std::fs::copy(&entry, &target)
                .map_err(|e| StepflowError::storage(&entry, e.to_string()))?;
        }
    }
    Ok(())
}
