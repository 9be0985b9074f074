// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Pipeline construction, compilation, and execution
//!
//! The lifecycle: build a [`Pipeline`] incrementally, `build` it into an
//! [`ExecutionPlan`], and `execute` the plan against checkpoint and output
//! roots. Scatter/gather steps expand into nested pipelines through
//! [`run_scatter_gather`].

pub(crate) mod builder;
pub(crate) mod executor;
pub(crate) mod handle;
pub(crate) mod plan;
pub(crate) mod subpipeline;

pub use builder::{Pipeline, PipelineEdge, PipelineNode};
pub use executor::TaskExecutor;
pub use handle::StepHandle;
pub use plan::{ExecuteOptions, ExecutionPlan, InputSlot, Instruction, Start, Sync};
pub use subpipeline::{run_scatter_gather, InnerPipeline, ScatterGather, SCATTER_INPUT_LABEL};
