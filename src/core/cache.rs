//! Result Cache Client
//!
//! Content-addressed cache of child results. A child whose fingerprint is
//! already cached does not need to run again.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::template::TaskIdentifier;

/// Identifies one cached child result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub task: TaskIdentifier,
    pub discovery_version: String,
    pub input_path: String,
    pub child_index: usize,
}

impl CacheKey {
    /// Stable textual fingerprint of the key.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}/{}@{}#{}:{}",
            self.task.project,
            self.task.domain,
            self.task.name,
            self.task.version,
            self.discovery_version,
            self.input_path,
            self.child_index
        )
    }
}

/// A cached result: where the child's outputs were written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub output_path: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Lookup and store of cached results.
pub trait CacheClient: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError>;
}

/// Cache held in process memory, keyed by fingerprint.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheClient for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("lock poisoned".to_string()))?;
        Ok(entries.get(&key.fingerprint()).cloned())
    }

    fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("lock poisoned".to_string()))?;
        entries.insert(key.fingerprint(), entry);
        Ok(())
    }
}
