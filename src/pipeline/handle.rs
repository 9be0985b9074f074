// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step handles
//!
//! A handle is a dense, pipeline-local identifier assigned at insertion
//! order. Equality, hashing, and ordering use the integer alone; the
//! optional name exists for display and for sub-pipeline renaming.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counter used to tag handles with their owning pipeline.
static PIPELINE_TAGS: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh pipeline tag
pub(crate) fn next_pipeline_tag() -> u64 {
    PIPELINE_TAGS.fetch_add(1, Ordering::Relaxed)
}

/// Opaque identifier for a step within one pipeline
#[derive(Clone)]
pub struct StepHandle {
    id: usize,
    pipeline: u64,
    name: Option<Arc<str>>,
}

impl StepHandle {
    pub(crate) fn new(id: usize, pipeline: u64, name: Option<&str>) -> Self {
        Self {
            id,
            pipeline,
            name: name.map(Arc::from),
        }
    }

    /// The raw dense identifier, used for on-disk checkpoint names
    pub fn raw_id(&self) -> usize {
        self.id
    }

    /// The optional human-readable name given at insertion
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Tag of the pipeline that minted this handle
    pub(crate) fn pipeline_tag(&self) -> u64 {
        self.pipeline
    }
}

impl PartialEq for StepHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StepHandle {}

impl std::hash::Hash for StepHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for StepHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StepHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} (#{})", name, self.id),
            None => write!(f, "step-{}", self.id),
        }
    }
}

impl fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
