//! The key-value contract the session persists through.
//!
//! The store sees one logical table per category plus `_index` blobs for
//! batched collections. All values are binary; a `None` value deletes.

use std::collections::HashMap;

/// Error type for store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("commit failed after retries: {0}")]
    CommitFailed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Logical categories.
pub mod categories {
    pub const CREDS: &str = "creds";
    pub const PRE_KEY: &str = "pre-key";
    pub const SIGNED_PRE_KEY: &str = "signed-pre-key";
    pub const SESSION: &str = "session";
    pub const SENDER_KEY: &str = "sender-key";
    pub const SENDER_KEY_MEMORY: &str = "sender-key-memory";
    pub const DEVICE_LIST: &str = "device-list";
    pub const LID_MAPPING: &str = "lid-mapping";
    pub const APP_STATE_SYNC_KEY: &str = "app-state-sync-key";
}

/// Reserved id for the index blob of batched collections.
pub const INDEX_KEY: &str = "_index";

/// One write: upsert when `value` is set, delete when `None`.
#[derive(Debug, Clone)]
pub struct KvWrite {
    pub category: String,
    pub id: String,
    pub value: Option<Vec<u8>>,
}

impl KvWrite {
    pub fn put(category: &str, id: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            category: category.to_string(),
            id: id.into(),
            value: Some(value),
        }
    }

    pub fn delete(category: &str, id: impl Into<String>) -> Self {
        Self {
            category: category.to_string(),
            id: id.into(),
            value: None,
        }
    }
}

/// Backend storage contract. May be remote; commits can fail transiently
/// and are retried by the caller.
pub trait KvBackend: Send + Sync {
    /// Fetch values by id within a category. Missing ids are absent from
    /// the result map.
    fn get(&self, category: &str, ids: &[&str]) -> StoreResult<HashMap<String, Vec<u8>>>;

    /// Apply a batch of writes atomically.
    fn put(&self, writes: &[KvWrite]) -> StoreResult<()>;

    /// List all ids within a category.
    fn keys(&self, category: &str) -> StoreResult<Vec<String>>;
}
