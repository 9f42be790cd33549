//! Blob backends holding the CSV table.
//!
//! A backend stores opaque text blobs addressed by path and hands out a
//! [`VersionToken`] with every read. Writes are conditioned on the token the
//! writer last observed, so a concurrent writer is detected instead of being
//! silently overwritten.

mod file;
mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};

pub use file::FileBlobStore;
pub use sqlite::{BlobCommit, SqliteBlobStore};

/// Opaque identifier of one exact state of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A blob's content together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content: String,
    pub version: VersionToken,
}

/// Storage for versioned text blobs.
///
/// Implementations are synchronous. Remote implementations drive their own
/// runtime and must not be called from inside an async task.
pub trait BlobStore: Send + Sync {
    /// Read a blob. Fails with [`StoreError::NotFound`] when it does not exist.
    fn get(&self, path: &str) -> Result<Blob>;

    /// Replace a blob's content if its current version is `expected`.
    ///
    /// Fails with [`StoreError::Conflict`] when another writer got there first.
    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken>;

    /// Create a new blob. Fails with [`StoreError::Conflict`] if it already exists.
    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken>;
}

impl<B: BlobStore + ?Sized> BlobStore for Box<B> {
    fn get(&self, path: &str) -> Result<Blob> {
        (**self).get(path)
    }

    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        (**self).put(path, content, message, expected)
    }

    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken> {
        (**self).create(path, content, message)
    }
}

impl<B: BlobStore + ?Sized> BlobStore for Arc<B> {
    fn get(&self, path: &str) -> Result<Blob> {
        (**self).get(path)
    }

    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        (**self).put(path, content, message, expected)
    }

    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken> {
        (**self).create(path, content, message)
    }
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<String, (String, u64)>,
    commits: Vec<(String, String)>,
    next_version: u64,
}

/// In-process blob store; versions are a global counter.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryState>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit messages recorded for `path`, oldest first.
    #[must_use]
    pub fn commits(&self, path: &str) -> Vec<String> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .commits
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn bump(state: &mut MemoryState) -> u64 {
        state.next_version += 1;
        state.next_version
    }
}

fn memory_token(version: u64) -> VersionToken {
    VersionToken::new(format!("v{version}"))
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, path: &str) -> Result<Blob> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (content, version) = state
            .blobs
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(Blob {
            content: content.clone(),
            version: memory_token(*version),
        })
    }

    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = state
            .blobs
            .get(path)
            .map(|(_, v)| *v)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if memory_token(current) != *expected {
            return Err(StoreError::conflict(path));
        }
        let version = Self::bump(&mut state);
        state
            .blobs
            .insert(path.to_string(), (content.to_string(), version));
        state.commits.push((path.to_string(), message.to_string()));
        debug!(path, version, message, "memory blob updated");
        Ok(memory_token(version))
    }

    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.blobs.contains_key(path) {
            return Err(StoreError::conflict(path));
        }
        let version = Self::bump(&mut state);
        state
            .blobs
            .insert(path.to_string(), (content.to_string(), version));
        state.commits.push((path.to_string(), message.to_string()));
        debug!(path, version, message, "memory blob created");
        Ok(memory_token(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_get_missing() {
        let store = MemoryBlobStore::new();
        let err = store.get("health.csv").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_memory_create_then_put() {
        let store = MemoryBlobStore::new();
        let v1 = store.create("health.csv", "date\n", "init").unwrap();
        let blob = store.get("health.csv").unwrap();
        assert_eq!(blob.version, v1);
        assert_eq!(blob.content, "date\n");

        let v2 = store
            .put("health.csv", "date\n2024-01-01\n", "add", &v1)
            .unwrap();
        assert_ne!(v1, v2);
        assert_eq!(store.commits("health.csv"), vec!["init", "add"]);
    }

    #[test]
    fn test_memory_stale_token_conflicts() {
        let store = MemoryBlobStore::new();
        let v1 = store.create("health.csv", "a", "init").unwrap();
        store.put("health.csv", "b", "first writer", &v1).unwrap();

        let err = store
            .put("health.csv", "c", "second writer", &v1)
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("health.csv").unwrap().content, "b");
    }

    #[test]
    fn test_memory_create_existing_conflicts() {
        let store = MemoryBlobStore::new();
        store.create("health.csv", "a", "init").unwrap();
        assert!(store.create("health.csv", "b", "again").unwrap_err().is_conflict());
    }

    #[test]
    fn test_memory_put_missing_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store
            .put("health.csv", "a", "m", &VersionToken::new("v1"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_boxed_store_delegates() {
        let store: Box<dyn BlobStore> = Box::new(MemoryBlobStore::new());
        let v = store.create("x", "1", "init").unwrap();
        assert_eq!(store.get("x").unwrap().version, v);
    }
}
