// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Cross-run checkpoint matching
//!
//! A [`CheckpointGraph`] is the projection of a pipeline that gets
//! persisted next to its checkpoints. On the next run the matcher compares
//! the current projection against the stored one and decides which
//! checkpoints may be reused, even when handles were renumbered.

mod fingerprint;
mod graph;
mod matcher;

pub use fingerprint::{hash_file, hash_string};
pub use graph::{CheckpointGraph, CheckpointNode};
pub use matcher::compute_mapping;
