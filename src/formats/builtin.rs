// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Built-in codecs
//!
//! All three persist `serde_json::Value` payloads; they differ in layout.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

use super::DataFormat;
use crate::errors::{StepflowError, StepflowResult};

fn codec_err(format: &str, e: impl std::fmt::Display) -> StepflowError {
    StepflowError::Codec {
        format: format.to_string(),
        message: e.to_string(),
    }
}

/// Whole value as a single pretty-printed `value.json`
pub struct JsonFormat;

#[async_trait]
impl DataFormat for JsonFormat {
    async fn store(&self, dir: &Path, value: &Value) -> StepflowResult<()> {
        let json = serde_json::to_string_pretty(value).map_err(|e| codec_err("json", e))?;
        tokio::fs::write(dir.join("value.json"), json)
            .await
            .map_err(|e| codec_err("json", e))
    }

    async fn load(&self, dir: &Path) -> StepflowResult<Value> {
        let content = tokio::fs::read_to_string(dir.join("value.json"))
            .await
            .map_err(|e| codec_err("json", e))?;
        serde_json::from_str(&content).map_err(|e| codec_err("json", e))
    }
}

/// Top-level array written one element per line to `records.jsonl`
///
/// Suited to large record collections where line-oriented tooling matters.
pub struct JsonLinesFormat;

#[async_trait]
impl DataFormat for JsonLinesFormat {
    async fn store(&self, dir: &Path, value: &Value) -> StepflowResult<()> {
        let records = value.as_array().ok_or_else(|| {
            codec_err("json-lines", "value is not a top-level array")
        })?;
        let mut out = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(|e| codec_err("json-lines", e))?;
            out.push_str(&line);
            out.push('\n');
        }
        tokio::fs::write(dir.join("records.jsonl"), out)
            .await
            .map_err(|e| codec_err("json-lines", e))
    }

    async fn load(&self, dir: &Path) -> StepflowResult<Value> {
        let content = tokio::fs::read_to_string(dir.join("records.jsonl"))
            .await
            .map_err(|e| codec_err("json-lines", e))?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line).map_err(|e| codec_err("json-lines", e))?);
        }
        Ok(Value::Array(records))
    }
}

/// String payload stored verbatim as `content.txt`
pub struct TextFormat;

#[async_trait]
impl DataFormat for TextFormat {
    async fn store(&self, dir: &Path, value: &Value) -> StepflowResult<()> {
        let text = value
            .as_str()
            .ok_or_else(|| codec_err("text", "value is not a string"))?;
        tokio::fs::write(dir.join("content.txt"), text)
            .await
            .map_err(|e| codec_err("text", e))
    }

    async fn load(&self, dir: &Path) -> StepflowResult<Value> {
        let content = tokio::fs::read_to_string(dir.join("content.txt"))
            .await
            .map_err(|e| codec_err("text", e))?;
        Ok(Value::String(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let value = json!({"vocabulary": ["a", "b"], "size": 2});

        JsonFormat.store(dir.path(), &value).await.unwrap();
        let loaded = JsonFormat.load(dir.path()).await.unwrap();
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn test_json_lines_round_trip() {
        let dir = TempDir::new().unwrap();
        let value = json!([{"id": 1}, {"id": 2}, {"id": 3}]);

        JsonLinesFormat.store(dir.path(), &value).await.unwrap();
        let loaded = JsonLinesFormat.load(dir.path()).await.unwrap();
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn test_json_lines_rejects_non_array() {
        let dir = TempDir::new().unwrap();
        let err = JsonLinesFormat
            .store(dir.path(), &json!({"not": "an array"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::Codec { .. }));
    }

    #[tokio::test]
    async fn test_text_round_trip() {
        let dir = TempDir::new().unwrap();
        let value = json!("some plain text\nwith lines");

        TextFormat.store(dir.path(), &value).await.unwrap();
        let loaded = TextFormat.load(dir.path()).await.unwrap();
        assert_eq!(loaded, value);
    }
}
