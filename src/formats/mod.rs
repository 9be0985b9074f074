// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Data-format registry
//!
//! Codecs persist step results into checkpoint directories and read them
//! back. They are looked up by the name a [`StepFactory`](crate::step::StepFactory)
//! reports through `data_format()`.

mod builtin;

pub use builtin::{JsonFormat, JsonLinesFormat, TextFormat};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::errors::{StepflowError, StepflowResult};

/// Trait for checkpoint codecs
///
/// The store guarantees `dir` exists before `store` and is fully
/// materialized before `load`. Codecs write fixed filenames inside the
/// directory, so re-storing overwrites a prior artifact in place.
#[async_trait]
pub trait DataFormat: Send + Sync {
    /// Write a value into a fresh directory
    async fn store(&self, dir: &Path, value: &Value) -> StepflowResult<()>;

    /// Read a value back from a directory previously written by `store`
    async fn load(&self, dir: &Path) -> StepflowResult<Value>;
}

/// Registry of named codecs
#[derive(Clone)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn DataFormat>>,
}

impl FormatRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            formats: HashMap::new(),
        }
    }

    /// Create a registry with the built-in codecs registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("json", Arc::new(JsonFormat));
        registry.register("json-lines", Arc::new(JsonLinesFormat));
        registry.register("text", Arc::new(TextFormat));
        registry
    }

    /// Register a codec under a name, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, format: Arc<dyn DataFormat>) {
        self.formats.insert(name.into(), format);
    }

    /// Look up a codec by name
    pub fn get(&self, name: &str) -> StepflowResult<Arc<dyn DataFormat>> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| StepflowError::UnknownFormat {
                name: name.to_string(),
            })
    }

    /// Registered format names
    pub fn names(&self) -> Vec<&str> {
        self.formats.keys().map(String::as_str).collect()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
