// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! # stepflow - Checkpointed Pipeline Engine
//!
//! `stepflow` executes computation pipelines expressed as DAGs of steps
//! and persists every intermediate result as an on-disk checkpoint. When
//! the same pipeline (or a structurally similar one) runs again, previous
//! results are reused instead of recomputed, even when step handles were
//! renumbered between runs.
//!
//! ## Features
//!
//! - **Typed graph construction** - Label-checked edges with full
//!   validation (completeness, reachability, acyclicity)
//! - **Cooperative execution** - Independent steps run concurrently on
//!   tokio, released as their dependencies finish
//! - **Structural checkpoint reuse** - A graph matcher pairs the current
//!   pipeline with the persisted one, so checkpoints survive renumbering
//! - **Crash-safe storage** - Two-phase renames with recovery of stranded
//!   temporaries at startup
//! - **Scatter/gather** - Steps can fan out into per-group inner
//!   pipelines that checkpoint recursively
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepflow::{ExecuteOptions, Pipeline};
//!
//! let mut pipeline = Pipeline::new("topics");
//! let load = pipeline.add_source(load_factory, Some("load"));
//! let tokenize = pipeline.add_step(tokenize_factory, Some("tokenize"));
//! let report = pipeline.add_sink(report_factory, "report", None);
//! pipeline.connect(&load, &tokenize, "documents")?;
//! pipeline.connect(&tokenize, &report, "tokens")?;
//!
//! let plan = pipeline.build(configs)?;
//! plan.execute(ExecuteOptions::new("checkpoints", "outputs")).await?;
//! # Ok::<(), stepflow::StepflowError>(())
//! ```

pub mod checkpoint;
pub mod errors;
pub mod formats;
pub mod pipeline;
pub mod step;
pub mod store;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export commonly used types
pub use errors::{StepflowError, StepflowResult};
pub use formats::{DataFormat, FormatRegistry};
pub use pipeline::{
    run_scatter_gather, ExecuteOptions, ExecutionPlan, InnerPipeline, Pipeline, ScatterGather,
    StepHandle, SCATTER_INPUT_LABEL,
};
pub use step::{ExecutionContext, InputLabels, Step, StepFactory, StepInputs};
pub use store::ResultStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
