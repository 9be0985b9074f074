// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Error types for pipeline construction, storage, and execution
//!
//! Graph construction errors are raised synchronously from `connect` and
//! `build`; storage and execution errors surface from the result store and
//! the task executor.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::StepHandle;

/// Result type for stepflow operations
pub type StepflowResult<T> = Result<T, StepflowError>;

/// Main error type for stepflow
#[derive(Error, Debug, Diagnostic)]
pub enum StepflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Graph Construction Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step {handle} does not belong to pipeline '{pipeline}'")]
    #[diagnostic(
        code(stepflow::unknown_step),
        help("Handles are only valid within the pipeline that created them")
    )]
    UnknownStep { pipeline: String, handle: StepHandle },

    #[error("Cannot connect step {handle} to itself")]
    #[diagnostic(code(stepflow::self_loop))]
    SelfLoop { handle: StepHandle },

    #[error("Connection from {from_step} to {target} already exists")]
    #[diagnostic(code(stepflow::duplicate_edge))]
    DuplicateEdge { from_step: StepHandle, target: StepHandle },

    #[error("Cannot use input step {target} as a connection target")]
    #[diagnostic(
        code(stepflow::input_as_sink),
        help("Input steps are sources; they cannot receive pipeline data")
    )]
    InputAsSink { target: StepHandle },

    #[error("Step {target} does not accept {from_step} under label '{label}'")]
    #[diagnostic(code(stepflow::unsupported_label))]
    UnsupportedLabel {
        from_step: StepHandle,
        target: StepHandle,
        label: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Validation Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step {handle} is missing connections for labels: {}", labels.join(", "))]
    #[diagnostic(
        code(stepflow::missing_connection),
        help("Every declared non-wildcard input label must be connected exactly once")
    )]
    MissingConnection { handle: StepHandle, labels: Vec<String> },

    #[error("Step {handle} is neither an input nor an output but lacks {side} connections")]
    #[diagnostic(code(stepflow::bad_boundary))]
    BadBoundary { handle: StepHandle, side: &'static str },

    #[error("Steps not reachable from any input: {}", fmt_handles(handles))]
    #[diagnostic(code(stepflow::unreachable))]
    Unreachable { handles: Vec<StepHandle> },

    #[error("Cycle detected in pipeline near step {handle}")]
    #[diagnostic(
        code(stepflow::cycle),
        help("Review your connections to remove the cycle")
    )]
    Cycle { handle: StepHandle },

    // ─────────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("No checkpoint stored for step {handle}")]
    #[diagnostic(code(stepflow::missing_checkpoint))]
    MissingCheckpoint { handle: StepHandle },

    #[error("Storage error at '{path}': {message}")]
    #[diagnostic(code(stepflow::storage_error))]
    Storage { path: PathBuf, message: String },

    #[error("Codec '{format}' failed: {message}")]
    #[diagnostic(code(stepflow::codec_error))]
    Codec { format: String, message: String },

    #[error("No data format registered under '{name}'")]
    #[diagnostic(
        code(stepflow::unknown_format),
        help("Built-in formats: json, json-lines, text")
    )]
    UnknownFormat { name: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step {handle} failed")]
    #[diagnostic(code(stepflow::step_failed))]
    StepFailed {
        handle: StepHandle,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Sub-pipeline of step {parent} failed")]
    #[diagnostic(code(stepflow::sub_pipeline))]
    SubPipeline {
        parent: StepHandle,
        #[source]
        cause: Box<StepflowError>,
    },

    #[error("Execution failed: {message}")]
    #[diagnostic(code(stepflow::execution_failed))]
    Execution { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(stepflow::io_error))]
    Io { message: String },

    #[error("JSON error: {message}")]
    #[diagnostic(code(stepflow::json_error))]
    Json { message: String },
}

fn fmt_handles(handles: &[StepHandle]) -> String {
    handles
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<std::io::Error> for StepflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_json::Error> for StepflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl StepflowError {
    /// Create a storage error with path context
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Wrap a user step failure
    pub fn step_failed(handle: StepHandle, cause: anyhow::Error) -> Self {
        Self::StepFailed {
            handle,
            cause: cause.into(),
        }
    }
}
