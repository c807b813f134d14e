//! The signal store: typed, transactional access to all persistent
//! cryptographic state.
//!
//! Transactions are keyed: one outstanding transaction per key, acquired
//! with `lock_key`. Commits are retried with backoff on transient failure.
//! Indexed collections are trimmed to a hard ceiling on every write,
//! keeping the lexicographically greatest keys.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::crypto::{KeyPair, PreKey, SignedPreKey};
use crate::prekeys::INITIAL_BATCH_SIZE;
use crate::store::creds::Credentials;
use crate::store::traits::{categories, KvBackend, KvWrite, StoreError, StoreResult, INDEX_KEY};

/// Commit retry budget.
const COMMIT_ATTEMPTS: u32 = 3;

/// Hard ceilings per indexed collection.
const SESSION_CEILING: usize = 1000;
const DEVICE_LIST_CEILING: usize = 500;
const SENDER_KEY_MEMORY_CEILING: usize = 500;
const LID_MAPPING_CEILING: usize = 500;

const CREDS_ID: &str = "self";

/// Categories carrying an `_index` blob and a size ceiling.
fn ceiling_for(category: &str) -> Option<usize> {
    match category {
        categories::SESSION => Some(SESSION_CEILING),
        categories::DEVICE_LIST => Some(DEVICE_LIST_CEILING),
        categories::SENDER_KEY_MEMORY => Some(SENDER_KEY_MEMORY_CEILING),
        categories::LID_MAPPING => Some(LID_MAPPING_CEILING),
        _ => None,
    }
}

pub struct SignalStore {
    backend: Arc<dyn KvBackend>,
    txn_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SignalStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            txn_locks: DashMap::new(),
        })
    }

    /// Acquire the transaction guard for a key. All mutations of state
    /// belonging to that key must happen while the guard is held.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .txn_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Commit a batch of writes, retrying on transient failure, then
    /// enforce ceilings and refresh indexes of touched collections.
    pub async fn commit(&self, writes: Vec<KvWrite>) -> StoreResult<()> {
        let mut last_err = None;
        for attempt in 0..COMMIT_ATTEMPTS {
            match self.backend.put(&writes) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!("store commit attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                }
            }
        }
        if let Some(e) = last_err {
            return Err(StoreError::CommitFailed(e.to_string()));
        }

        let mut touched: BTreeSet<&str> = BTreeSet::new();
        for write in &writes {
            if ceiling_for(&write.category).is_some() {
                touched.insert(&write.category);
            }
        }
        for category in touched {
            self.enforce_ceiling(category)?;
        }
        Ok(())
    }

    /// Trim a collection to its ceiling (keeping the lexicographically
    /// greatest keys) and rewrite its `_index` blob.
    fn enforce_ceiling(&self, category: &str) -> StoreResult<()> {
        let ceiling = match ceiling_for(category) {
            Some(c) => c,
            None => return Ok(()),
        };
        let mut keys: Vec<String> = self
            .backend
            .keys(category)?
            .into_iter()
            .filter(|k| k != INDEX_KEY)
            .collect();
        keys.sort();

        let mut writes = Vec::new();
        if keys.len() > ceiling {
            let excess = keys.len() - ceiling;
            debug!("trimming {excess} entries from {category}");
            for key in keys.drain(..excess) {
                writes.push(KvWrite::delete(category, key));
            }
        }
        let index = serde_json::to_vec(&keys)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        writes.push(KvWrite::put(category, INDEX_KEY, index));
        self.backend.put(&writes)
    }

    fn get_one(&self, category: &str, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut map = self.backend.get(category, &[id])?;
        Ok(map.remove(id))
    }

    /// Raw access for collaborators with their own key formats.
    pub fn get_raw(&self, category: &str, id: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_one(category, id)
    }

    pub async fn put_raw(&self, category: &str, id: &str, value: Vec<u8>) -> StoreResult<()> {
        self.commit(vec![KvWrite::put(category, id, value)]).await
    }

    // -- credentials --------------------------------------------------------

    pub fn load_creds(&self) -> StoreResult<Option<Credentials>> {
        match self.get_one(categories::CREDS, CREDS_ID)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn save_creds(&self, creds: &Credentials) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec(creds).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.commit(vec![KvWrite::put(categories::CREDS, CREDS_ID, bytes)])
            .await
    }

    // -- pre-keys -----------------------------------------------------------

    pub fn get_pre_key(&self, id: u32) -> StoreResult<Option<PreKey>> {
        match self.get_one(categories::PRE_KEY, &id.to_string())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn delete_pre_key(&self, id: u32) -> StoreResult<()> {
        self.commit(vec![KvWrite::delete(categories::PRE_KEY, id.to_string())])
            .await
    }

    /// Generate `count` fresh pre-keys starting at the credentials cursor,
    /// persist them together with the advanced cursor, and return them.
    pub async fn generate_and_store_pre_keys(
        &self,
        creds: &mut Credentials,
        count: usize,
    ) -> StoreResult<Vec<PreKey>> {
        let start = creds.next_pre_key_id;
        let mut writes = Vec::with_capacity(count + 1);
        let mut batch = Vec::with_capacity(count);
        for i in 0..count as u32 {
            let pre_key = PreKey::new(start + i);
            let bytes = serde_json::to_vec(&pre_key)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            writes.push(KvWrite::put(
                categories::PRE_KEY,
                pre_key.key_id.to_string(),
                bytes,
            ));
            batch.push(pre_key);
        }
        creds.next_pre_key_id = start + count as u32;
        let creds_bytes =
            serde_json::to_vec(creds).map_err(|e| StoreError::Serialization(e.to_string()))?;
        writes.push(KvWrite::put(categories::CREDS, CREDS_ID, creds_bytes));
        self.commit(writes).await?;
        Ok(batch)
    }

    pub fn get_signed_pre_key(&self, id: u32) -> StoreResult<Option<SignedPreKey>> {
        match self.get_one(categories::SIGNED_PRE_KEY, &id.to_string())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn put_signed_pre_key(&self, key: &SignedPreKey) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec(key).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.commit(vec![KvWrite::put(
            categories::SIGNED_PRE_KEY,
            key.key_id.to_string(),
            bytes,
        )])
        .await
    }

    // -- sessions -----------------------------------------------------------

    pub fn get_session(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_one(categories::SESSION, address)
    }

    pub fn has_session(&self, address: &str) -> StoreResult<bool> {
        Ok(self.get_session(address)?.is_some())
    }

    pub async fn put_session(&self, address: &str, record: Vec<u8>) -> StoreResult<()> {
        self.commit(vec![KvWrite::put(categories::SESSION, address, record)])
            .await
    }

    pub async fn delete_session(&self, address: &str) -> StoreResult<()> {
        self.commit(vec![KvWrite::delete(categories::SESSION, address)])
            .await
    }

    // -- sender keys --------------------------------------------------------

    pub fn get_sender_key(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_one(categories::SENDER_KEY, name)
    }

    pub async fn put_sender_key(&self, name: &str, record: Vec<u8>) -> StoreResult<()> {
        self.commit(vec![KvWrite::put(categories::SENDER_KEY, name, record)])
            .await
    }

    /// The set of device JIDs that already hold the current sender key for
    /// a group.
    pub fn get_sender_key_memory(&self, group: &str) -> StoreResult<BTreeSet<String>> {
        match self.get_one(categories::SENDER_KEY_MEMORY, group)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Build the write recording sender-key distribution, for committing
    /// atomically with the message ciphertext.
    pub fn sender_key_memory_write(
        &self,
        group: &str,
        memory: &BTreeSet<String>,
    ) -> StoreResult<KvWrite> {
        let bytes =
            serde_json::to_vec(memory).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(KvWrite::put(categories::SENDER_KEY_MEMORY, group, bytes))
    }

    pub async fn clear_sender_key_memory(&self, group: &str) -> StoreResult<()> {
        self.commit(vec![KvWrite::delete(categories::SENDER_KEY_MEMORY, group)])
            .await
    }

    // -- device lists -------------------------------------------------------

    pub fn get_device_list(&self, user: &str) -> StoreResult<Option<Vec<u16>>> {
        match self.get_one(categories::DEVICE_LIST, user)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Persist a batch of device lists in a single commit.
    pub async fn put_device_lists(&self, lists: &[(String, Vec<u16>)]) -> StoreResult<()> {
        let mut writes = Vec::with_capacity(lists.len());
        for (user, devices) in lists {
            let bytes = serde_json::to_vec(devices)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            writes.push(KvWrite::put(categories::DEVICE_LIST, user.clone(), bytes));
        }
        self.commit(writes).await
    }

    // -- LID mapping --------------------------------------------------------

    fn reverse_key(lid_user: &str) -> String {
        format!("{lid_user}_reverse")
    }

    pub fn lid_for_pn(&self, pn_user: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_one(categories::LID_MAPPING, pn_user)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn pn_for_lid(&self, lid_user: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_one(categories::LID_MAPPING, &Self::reverse_key(lid_user))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Store a PN->LID pair with its reverse entry. The mapping is
    /// write-once: re-mapping a PN to a different LID is rejected.
    pub async fn put_lid_mapping(&self, pn_user: &str, lid_user: &str) -> StoreResult<bool> {
        if let Some(existing) = self.lid_for_pn(pn_user)? {
            if existing == lid_user {
                return Ok(true);
            }
            warn!("rejecting LID re-mapping for {pn_user}: {existing} -> {lid_user}");
            return Ok(false);
        }
        self.commit(vec![
            KvWrite::put(
                categories::LID_MAPPING,
                pn_user,
                lid_user.as_bytes().to_vec(),
            ),
            KvWrite::put(
                categories::LID_MAPPING,
                Self::reverse_key(lid_user),
                pn_user.as_bytes().to_vec(),
            ),
        ])
        .await?;
        Ok(true)
    }

    // -- startup integrity --------------------------------------------------

    /// Verify store integrity before login: required indexes exist and the
    /// pre-key at the cursor is present. A missing cursor pre-key triggers
    /// a full batch regeneration. Returns true when keys were regenerated.
    pub async fn validate_on_startup(&self, creds: &mut Credentials) -> StoreResult<bool> {
        for category in [categories::DEVICE_LIST, categories::SESSION] {
            if self.get_one(category, INDEX_KEY)?.is_none() {
                debug!("creating missing {category} index");
                self.enforce_ceiling(category)?;
            }
        }

        let cursor_ok = if creds.next_pre_key_id <= 1 {
            false
        } else {
            self.get_pre_key(creds.next_pre_key_id - 1)?.is_some()
        };
        if cursor_ok {
            return Ok(false);
        }

        warn!(
            "pre-key at cursor {} missing, regenerating {INITIAL_BATCH_SIZE}",
            creds.next_pre_key_id.saturating_sub(1)
        );
        self.generate_and_store_pre_keys(creds, INITIAL_BATCH_SIZE)
            .await?;
        Ok(true)
    }

    // -- identity -----------------------------------------------------------

    /// Derive and persist a fresh signed pre-key, advancing the id.
    pub async fn rotate_signed_pre_key(
        &self,
        creds: &mut Credentials,
        identity: &KeyPair,
    ) -> StoreResult<SignedPreKey> {
        let next_id = creds.signed_pre_key.key_id + 1;
        let rotated = SignedPreKey::new(next_id, identity);
        creds.signed_pre_key = rotated.clone();
        self.put_signed_pre_key(&rotated).await?;
        self.save_creds(creds).await?;
        Ok(rotated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn store() -> Arc<SignalStore> {
        SignalStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let store = store();
        store.put_session("15550001111.0", vec![9; 8]).await.unwrap();
        assert!(store.has_session("15550001111.0").unwrap());
        assert_eq!(store.get_session("15550001111.0").unwrap(), Some(vec![9; 8]));

        store.delete_session("15550001111.0").await.unwrap();
        assert!(!store.has_session("15550001111.0").unwrap());
    }

    #[tokio::test]
    async fn test_session_index_maintained() {
        let store = store();
        store.put_session("b.0", vec![1]).await.unwrap();
        store.put_session("a.0", vec![2]).await.unwrap();

        let index = store.get_raw(categories::SESSION, INDEX_KEY).unwrap().unwrap();
        let ids: Vec<String> = serde_json::from_slice(&index).unwrap();
        assert_eq!(ids, vec!["a.0", "b.0"]);
    }

    #[tokio::test]
    async fn test_lid_mapping_write_once() {
        let store = store();
        assert!(store.put_lid_mapping("15550001111", "201111").await.unwrap());
        // Same pair again: idempotent.
        assert!(store.put_lid_mapping("15550001111", "201111").await.unwrap());
        // Different LID for the same PN: rejected.
        assert!(!store.put_lid_mapping("15550001111", "209999").await.unwrap());

        assert_eq!(
            store.lid_for_pn("15550001111").unwrap().as_deref(),
            Some("201111")
        );
        assert_eq!(
            store.pn_for_lid("201111").unwrap().as_deref(),
            Some("15550001111")
        );
    }

    #[tokio::test]
    async fn test_pre_key_generation_advances_cursor() {
        let store = store();
        let mut creds = Credentials::generate();
        let batch = store
            .generate_and_store_pre_keys(&mut creds, 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].key_id, 1);
        assert_eq!(creds.next_pre_key_id, 11);
        assert!(store.get_pre_key(10).unwrap().is_some());

        // Persisted creds carry the advanced cursor.
        let loaded = store.load_creds().unwrap().unwrap();
        assert_eq!(loaded.next_pre_key_id, 11);
    }

    #[tokio::test]
    async fn test_startup_integrity_regenerates_missing_cursor() {
        let store = store();
        let mut creds = Credentials::generate();
        creds.next_pre_key_id = 50;

        let regenerated = store.validate_on_startup(&mut creds).await.unwrap();
        assert!(regenerated);
        assert_eq!(creds.next_pre_key_id, 50 + INITIAL_BATCH_SIZE as u32);
        assert!(store.get_pre_key(50).unwrap().is_some());

        // Second pass: cursor pre-key present, nothing regenerated.
        let regenerated = store.validate_on_startup(&mut creds).await.unwrap();
        assert!(!regenerated);
    }

    #[tokio::test]
    async fn test_keyed_lock_serializes() {
        let store = store();
        let guard = store.lock_key("me").await;
        assert!(store.txn_locks.get("me").unwrap().try_lock().is_err());
        drop(guard);
        assert!(store.txn_locks.get("me").unwrap().try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_device_list_trim_keeps_greatest() {
        let store = store();
        // Overfill past the ceiling in one batch.
        let lists: Vec<(String, Vec<u16>)> = (0..DEVICE_LIST_CEILING + 20)
            .map(|i| (format!("user{i:05}"), vec![0]))
            .collect();
        store.put_device_lists(&lists).await.unwrap();

        let keys: Vec<String> = {
            let index = store
                .get_raw(categories::DEVICE_LIST, INDEX_KEY)
                .unwrap()
                .unwrap();
            serde_json::from_slice(&index).unwrap()
        };
        assert_eq!(keys.len(), DEVICE_LIST_CEILING);
        // The smallest keys were evicted.
        assert!(store.get_device_list("user00000").unwrap().is_none());
        assert!(store
            .get_device_list(&format!("user{:05}", DEVICE_LIST_CEILING + 19))
            .unwrap()
            .is_some());
    }
}
