// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Content fingerprinting for checkpoint validity checks
//!
//! Steps that read external files typically record a fingerprint in their
//! checkpoint metadata and compare it in `checkpoint_is_valid`. BLAKE3
//! keeps that cheap even for large corpora.

use blake3::Hasher;
use std::path::Path;

use crate::errors::{StepflowError, StepflowResult};

/// Compute the hex fingerprint of a string
pub fn hash_string(s: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Compute the hex fingerprint of a file's contents
pub fn hash_file(path: &Path) -> StepflowResult<String> {
    let content = std::fs::read(path).map_err(|e| {
        StepflowError::storage(path, format!("failed to read file for hashing: {e}"))
    })?;

    let mut hasher = Hasher::new();
    hasher.update(&content);
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string_deterministic() {
        assert_eq!(hash_string("corpus"), hash_string("corpus"));
        assert_ne!(hash_string("corpus"), hash_string("corpse"));
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "contents").unwrap();

        let first = hash_file(&path).unwrap();
        std::fs::write(&path, "changed").unwrap();
        let second = hash_file(&path).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_hash_missing_file_errors() {
        let err = hash_file(Path::new("/nonexistent/input.txt")).unwrap_err();
        assert!(matches!(err, StepflowError::Storage { .. }));
    }
}
