//! In-memory store backend for development and testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::store::traits::{KvBackend, KvWrite, StoreError, StoreResult};

/// In-memory implementation of the KV contract.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryStore {
    fn get(&self, category: &str, ids: &[&str]) -> StoreResult<HashMap<String, Vec<u8>>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let mut result = HashMap::with_capacity(ids.len());
        if let Some(table) = tables.get(category) {
            for id in ids {
                if let Some(value) = table.get(*id) {
                    result.insert((*id).to_string(), value.clone());
                }
            }
        }
        Ok(result)
    }

    fn put(&self, writes: &[KvWrite]) -> StoreResult<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        for write in writes {
            let table = tables.entry(write.category.clone()).or_default();
            match &write.value {
                Some(value) => {
                    table.insert(write.id.clone(), value.clone());
                }
                None => {
                    table.remove(&write.id);
                }
            }
        }
        Ok(())
    }

    fn keys(&self, category: &str) -> StoreResult<Vec<String>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        Ok(tables
            .get(category)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store
            .put(&[KvWrite::put("session", "addr.0", vec![1, 2, 3])])
            .unwrap();

        let got = store.get("session", &["addr.0", "missing"]).unwrap();
        assert_eq!(got.get("addr.0"), Some(&vec![1, 2, 3]));
        assert!(!got.contains_key("missing"));

        store.put(&[KvWrite::delete("session", "addr.0")]).unwrap();
        assert!(store.get("session", &["addr.0"]).unwrap().is_empty());
    }

    #[test]
    fn test_keys_sorted() {
        let store = MemoryStore::new();
        store
            .put(&[
                KvWrite::put("pre-key", "3", vec![]),
                KvWrite::put("pre-key", "1", vec![]),
                KvWrite::put("pre-key", "2", vec![]),
            ])
            .unwrap();
        assert_eq!(store.keys("pre-key").unwrap(), vec!["1", "2", "3"]);
    }
}
