//! Device-list and LID resolution.
//!
//! Turns chat-level JIDs into the concrete per-device destinations a
//! message fans out to. Cache misses are batched into one USync query
//! carrying both the `devices` and `lid` protocols; new LID mappings are
//! persisted write-once and device lists under the batched collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::binary::Node;
use crate::conn::{ConnError, NodeSender};
use crate::signal::{PreKeyBundle, SessionCipher, SignalError};
use crate::store::{categories, Credentials, SignalStore, StoreError, INDEX_KEY};
use crate::types::jid::servers;
use crate::types::Jid;

/// In-memory device cache TTL.
const DEVICE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// How long a completed PN->LID session migration stays cached, in ms.
const MIGRATION_CACHE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("malformed server reply: {0}")]
    BadReply(&'static str),
}

struct CachedDevices {
    devices: Vec<u16>,
    fetched: Instant,
}

/// Resolver scoped to one connection instance; its caches must never be
/// shared between concurrent sessions.
pub struct DeviceResolver {
    store: Arc<SignalStore>,
    sender: Arc<dyn NodeSender>,
    cipher: SessionCipher,
    /// PN user -> cached device list.
    device_cache: DashMap<String, CachedDevices>,
    /// Signal address -> session known-usable.
    session_ok: DashMap<String, ()>,
}

impl DeviceResolver {
    pub fn new(
        store: Arc<SignalStore>,
        creds: Arc<RwLock<Credentials>>,
        sender: Arc<dyn NodeSender>,
    ) -> Self {
        Self {
            cipher: SessionCipher::new(store.clone(), creds),
            store,
            sender,
            device_cache: DashMap::new(),
            session_ok: DashMap::new(),
        }
    }

    /// Resolve chat-level JIDs into per-device JIDs, preserving each
    /// request's addressing domain (LID in, LID out).
    pub async fn resolve_devices(&self, jids: &[Jid]) -> Result<Vec<Jid>, ResolveError> {
        let mut resolved = Vec::new();
        // (pn_user, original request) pairs still needing a device list.
        let mut wanted: Vec<(String, Jid)> = Vec::new();

        for jid in jids {
            if jid.device > 0 {
                // Explicit device: passthrough.
                resolved.push(jid.clone());
                continue;
            }
            let pn_user = if jid.is_lid() {
                match self.store.pn_for_lid(&jid.user)? {
                    Some(pn) => pn,
                    None => {
                        warn!("no PN mapping for LID {}, querying as-is", jid.user);
                        jid.user.clone()
                    }
                }
            } else {
                jid.user.clone()
            };
            wanted.push((pn_user, jid.clone()));
        }

        let mut misses = Vec::new();
        for (pn_user, _) in &wanted {
            let cached = self
                .device_cache
                .get(pn_user)
                .filter(|c| c.fetched.elapsed() < DEVICE_CACHE_TTL)
                .is_some();
            if !cached && !misses.contains(pn_user) {
                misses.push(pn_user.clone());
            }
        }

        if !misses.is_empty() {
            self.fetch_usync(&misses).await?;
        }

        for (pn_user, request) in wanted {
            let devices = match self.device_cache.get(&pn_user) {
                Some(cached) => cached.devices.clone(),
                None => {
                    // The user has no usable device list (e.g. not on the
                    // platform); resolve to the primary device only.
                    debug!("no device list for {pn_user}, assuming primary");
                    vec![0]
                }
            };
            for device in devices {
                resolved.push(Jid::with_device(
                    request.user.clone(),
                    device,
                    request.server.clone(),
                ));
            }
        }
        Ok(resolved)
    }

    /// One USync query covering the `devices` and `lid` protocols for a
    /// batch of unresolved users.
    async fn fetch_usync(&self, pn_users: &[String]) -> Result<(), ResolveError> {
        let list = pn_users
            .iter()
            .map(|user| {
                Node::new("user").attr("jid", Jid::new(user.clone(), servers::DEFAULT_USER))
            })
            .collect();

        let sid: u32 = rand::random();
        let iq = Node::new("iq")
            .attr("type", "get")
            .attr("xmlns", "usync")
            .attr("to", servers::DEFAULT_USER)
            .children(vec![Node::new("usync")
                .attr("sid", format!("{sid:x}"))
                .attr("context", "message")
                .attr("mode", "query")
                .attr("last", "true")
                .attr("index", "0")
                .children(vec![
                    Node::new("query").children(vec![
                        Node::new("devices").attr("version", "2"),
                        Node::new("lid"),
                    ]),
                    Node::new("list").children(list),
                ])]);

        let reply = self.sender.query(iq, None).await?;
        let list = reply
            .get_optional_child_by_tag(&["usync", "list"])
            .ok_or(ResolveError::BadReply("missing usync list"))?;

        let mut device_lists = Vec::new();
        for user in list.get_children_by_tag("user") {
            let jid = user
                .get_attr_jid("jid")
                .ok_or(ResolveError::BadReply("user without jid"))?;

            let mut devices: Vec<u16> = user
                .get_optional_child_by_tag(&["devices", "device-list"])
                .map(|dl| {
                    dl.get_children_by_tag("device")
                        .iter()
                        .filter_map(|d| d.get_attr_int("id"))
                        .map(|id| id as u16)
                        .collect()
                })
                .unwrap_or_default();
            if devices.is_empty() {
                devices.push(0);
            }

            if let Some(lid) = user
                .get_child_by_tag("lid")
                .and_then(|l| l.get_attr_jid("val"))
            {
                // Write-once; a rejected re-mapping is logged by the store.
                self.store.put_lid_mapping(&jid.user, &lid.user).await?;
            }

            self.device_cache.insert(
                jid.user.clone(),
                CachedDevices {
                    devices: devices.clone(),
                    fetched: Instant::now(),
                },
            );
            device_lists.push((jid.user, devices));
        }
        self.store.put_device_lists(&device_lists).await?;
        Ok(())
    }

    // -- session assertion --------------------------------------------------

    /// Ensure a usable 1:1 session exists for every address, fetching
    /// pre-key bundles in one `key` IQ for the gaps. `force` re-fetches
    /// even when a session exists.
    pub async fn assert_sessions(&self, jids: &[Jid], force: bool) -> Result<(), ResolveError> {
        let mut missing: Vec<Jid> = Vec::new();
        for jid in jids {
            let address = jid.signal_address();
            if !force && self.session_ok.contains_key(&address) {
                continue;
            }
            if !force && self.cipher.has_open_session(&address)? {
                self.session_ok.insert(address, ());
                continue;
            }
            missing.push(jid.clone());
        }
        if missing.is_empty() {
            return Ok(());
        }

        // Translate PNs to their wire LIDs where a mapping exists.
        let mut wire_to_address: HashMap<String, String> = HashMap::new();
        let users = missing
            .iter()
            .map(|jid| {
                let wire = if !jid.is_lid() {
                    match self.store.lid_for_pn(&jid.user) {
                        Ok(Some(lid_user)) => {
                            Jid::with_device(lid_user, jid.device, servers::HIDDEN_USER)
                        }
                        _ => jid.clone(),
                    }
                } else {
                    jid.clone()
                };
                wire_to_address.insert(wire.to_string(), jid.signal_address());
                Node::new("user").attr("jid", wire)
            })
            .collect();

        let iq = Node::new("iq")
            .attr("type", "get")
            .attr("xmlns", "encrypt")
            .attr("to", servers::DEFAULT_USER)
            .children(vec![Node::new("key").children(users)]);
        let reply = self.sender.query(iq, None).await?;

        let list = reply
            .get_child_by_tag("list")
            .ok_or(ResolveError::BadReply("missing key list"))?;
        for user in list.get_children_by_tag("user") {
            let wire_jid = user
                .get_attr_jid("jid")
                .ok_or(ResolveError::BadReply("bundle without jid"))?;
            let address = wire_to_address
                .get(&wire_jid.to_string())
                .cloned()
                .unwrap_or_else(|| wire_jid.signal_address());

            let bundle = parse_bundle(user)?;
            self.cipher.init_outgoing(&address, &bundle).await?;
            self.session_ok.insert(address, ());
        }
        Ok(())
    }

    /// Drop the cached validity of an address, forcing the next send to
    /// re-assert the session. Called on decrypt corruption.
    pub fn invalidate_session(&self, address: &str) {
        self.session_ok.remove(address);
    }

    pub fn session_validity_cached(&self, address: &str) -> bool {
        self.session_ok.contains_key(address)
    }

    // -- own-device bootstrap ----------------------------------------------

    /// Process our own LID as delivered on login: store the mapping, record
    /// the own device in the device list, and migrate PN sessions to LID
    /// addresses. The migration is idempotent and cached for seven days.
    pub async fn adopt_own_lid(&self, me: &Jid, lid: &Jid) -> Result<(), ResolveError> {
        self.store.put_lid_mapping(&me.user, &lid.user).await?;

        let mut devices = self.store.get_device_list(&me.user)?.unwrap_or_default();
        if !devices.contains(&me.device) {
            devices.push(me.device);
            devices.sort_unstable();
            self.store
                .put_device_lists(&[(me.user.clone(), devices)])
                .await?;
        }

        self.migrate_sessions_to_lid(&me.user, &lid.user).await
    }

    async fn migrate_sessions_to_lid(
        &self,
        pn_user: &str,
        lid_user: &str,
    ) -> Result<(), ResolveError> {
        let marker_id = format!("{pn_user}_migrated");
        if let Some(raw) = self.store.get_raw(categories::LID_MAPPING, &marker_id)? {
            if let Ok(ts) = String::from_utf8_lossy(&raw).parse::<i64>() {
                let age = chrono::Utc::now().timestamp_millis() - ts;
                if age < MIGRATION_CACHE_MS {
                    debug!("PN->LID migration for {pn_user} already done {age}ms ago");
                    return Ok(());
                }
            }
        }

        let session_ids: Vec<String> = self
            .store
            .get_raw(categories::SESSION, INDEX_KEY)?
            .map(|raw| serde_json::from_slice(&raw).unwrap_or_default())
            .unwrap_or_default();
        let pn_prefix = format!("{pn_user}.");

        for id in session_ids {
            let Some(device) = id.strip_prefix(&pn_prefix) else {
                continue;
            };
            if let Some(bytes) = self.store.get_session(&id)? {
                let lid_address =
                    Jid::with_device(lid_user, device.parse().unwrap_or(0), servers::HIDDEN_USER)
                        .signal_address();
                debug!("migrating session {id} -> {lid_address}");
                self.store.put_session(&lid_address, bytes).await?;
                self.store.delete_session(&id).await?;
            }
        }

        self.store
            .put_raw(
                categories::LID_MAPPING,
                &marker_id,
                chrono::Utc::now().timestamp_millis().to_string().into_bytes(),
            )
            .await?;
        Ok(())
    }
}

/// Parse one `<user>` bundle from a `key` IQ reply.
fn parse_bundle(user: &Node) -> Result<PreKeyBundle, ResolveError> {
    fn bytes32(node: Option<&Node>) -> Option<[u8; 32]> {
        node?.get_bytes()?.try_into().ok()
    }
    fn key_id(node: Option<&Node>) -> Option<u32> {
        let id = node?.get_child_by_tag("id")?.get_bytes()?;
        let mut padded = [0u8; 4];
        padded[4 - id.len()..].copy_from_slice(id);
        Some(u32::from_be_bytes(padded))
    }

    let registration = user
        .get_child_by_tag("registration")
        .and_then(|n| n.get_bytes())
        .and_then(|b| b.try_into().ok().map(u32::from_be_bytes))
        .ok_or(ResolveError::BadReply("bundle registration"))?;
    let identity_key = bytes32(user.get_child_by_tag("identity"))
        .ok_or(ResolveError::BadReply("bundle identity"))?;
    let identity_ed = bytes32(user.get_child_by_tag("vident"))
        .ok_or(ResolveError::BadReply("bundle vident"))?;

    let skey = user
        .get_child_by_tag("skey")
        .ok_or(ResolveError::BadReply("bundle skey"))?;
    let signed_pre_key_id =
        key_id(Some(skey)).ok_or(ResolveError::BadReply("bundle skey id"))?;
    let signed_pre_key = bytes32(skey.get_child_by_tag("value"))
        .ok_or(ResolveError::BadReply("bundle skey value"))?;
    let signed_pre_key_signature: [u8; 64] = skey
        .get_child_by_tag("signature")
        .and_then(|n| n.get_bytes())
        .and_then(|b| b.try_into().ok())
        .ok_or(ResolveError::BadReply("bundle skey signature"))?;

    let pre_key = user.get_child_by_tag("key").and_then(|key| {
        Some((key_id(Some(key))?, bytes32(key.get_child_by_tag("value"))?))
    });

    Ok(PreKeyBundle {
        registration_id: registration,
        identity_key,
        identity_ed,
        signed_pre_key_id,
        signed_pre_key,
        signed_pre_key_signature,
        pre_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::MockSender;

    fn fixture() -> (DeviceResolver, Arc<MockSender>, Arc<SignalStore>) {
        let store = SignalStore::new(Arc::new(MemoryStore::new()));
        let creds = Arc::new(RwLock::new(Credentials::generate()));
        let sender = Arc::new(MockSender::new());
        (
            DeviceResolver::new(store.clone(), creds, sender.clone()),
            sender,
            store,
        )
    }

    fn usync_reply(users: &[(&str, &[u16], Option<&str>)]) -> Node {
        let user_nodes = users
            .iter()
            .map(|(user, devices, lid)| {
                let device_nodes = devices
                    .iter()
                    .map(|d| Node::new("device").attr("id", *d as i64))
                    .collect();
                let mut node = Node::new("user")
                    .attr("jid", Jid::new(*user, servers::DEFAULT_USER))
                    .children(vec![Node::new("devices").children(vec![
                        Node::new("device-list").children(device_nodes),
                    ])]);
                if let Some(lid) = lid {
                    node.add_child(
                        Node::new("lid").attr("val", Jid::new(*lid, servers::HIDDEN_USER)),
                    );
                }
                node
            })
            .collect();
        Node::new("iq").attr("type", "result").children(vec![
            Node::new("usync").children(vec![Node::new("list").children(user_nodes)]),
        ])
    }

    #[tokio::test]
    async fn test_explicit_device_passthrough() {
        let (resolver, sender, _) = fixture();
        let jid = Jid::with_device("15550001111", 3, servers::DEFAULT_USER);
        let out = resolver.resolve_devices(&[jid.clone()]).await.unwrap();
        assert_eq!(out, vec![jid]);
        assert!(sender.queried().is_empty(), "no USync for explicit devices");
    }

    #[tokio::test]
    async fn test_usync_fetch_and_cache() {
        let (resolver, sender, store) = fixture();
        sender.respond_to("usync", |_| {
            Some(usync_reply(&[("15550001111", &[0, 2, 5], Some("201111"))]))
        });

        let jid = Jid::new("15550001111", servers::DEFAULT_USER);
        let out = resolver.resolve_devices(&[jid.clone()]).await.unwrap();
        assert_eq!(
            out,
            vec![
                Jid::with_device("15550001111", 0, servers::DEFAULT_USER),
                Jid::with_device("15550001111", 2, servers::DEFAULT_USER),
                Jid::with_device("15550001111", 5, servers::DEFAULT_USER),
            ]
        );

        // LID mapping persisted, device list persisted.
        assert_eq!(
            store.lid_for_pn("15550001111").unwrap().as_deref(),
            Some("201111")
        );
        assert_eq!(
            store.get_device_list("15550001111").unwrap(),
            Some(vec![0, 2, 5])
        );

        // Second resolution hits the cache: no further queries.
        let queries_before = sender.queried().len();
        resolver.resolve_devices(&[jid]).await.unwrap();
        assert_eq!(sender.queried().len(), queries_before);
    }

    #[tokio::test]
    async fn test_lid_request_emits_lids() {
        let (resolver, sender, store) = fixture();
        store.put_lid_mapping("15550001111", "201111").await.unwrap();
        sender.respond_to("usync", |_| {
            Some(usync_reply(&[("15550001111", &[0, 1], None)]))
        });

        let lid = Jid::new("201111", servers::HIDDEN_USER);
        let out = resolver.resolve_devices(&[lid]).await.unwrap();
        assert_eq!(
            out,
            vec![
                Jid::with_device("201111", 0, servers::HIDDEN_USER),
                Jid::with_device("201111", 1, servers::HIDDEN_USER),
            ]
        );

        // The USync list itself was queried by PN.
        let query = &sender.queried()[0];
        let listed = query
            .get_optional_child_by_tag(&["usync", "list", "user"])
            .and_then(|u| u.get_attr_jid("jid"))
            .unwrap();
        assert_eq!(listed.user, "15550001111");
    }

    #[tokio::test]
    async fn test_usync_batches_misses_into_one_query() {
        let (resolver, sender, _) = fixture();
        sender.respond_to("usync", |_| {
            Some(usync_reply(&[
                ("15550001111", &[0], None),
                ("15550002222", &[0, 1], None),
            ]))
        });

        resolver
            .resolve_devices(&[
                Jid::new("15550001111", servers::DEFAULT_USER),
                Jid::new("15550002222", servers::DEFAULT_USER),
            ])
            .await
            .unwrap();
        assert_eq!(sender.queried().len(), 1);
    }

    #[tokio::test]
    async fn test_session_migration_is_idempotent() {
        let (resolver, _, store) = fixture();
        let session_bytes = vec![42u8; 16];
        store.put_session("15550001111.0", session_bytes.clone()).await.unwrap();
        store.put_session("15550001111.2", vec![7u8; 8]).await.unwrap();

        let me = Jid::new("15550001111", servers::DEFAULT_USER);
        let lid = Jid::new("201111", servers::HIDDEN_USER);
        resolver.adopt_own_lid(&me, &lid).await.unwrap();

        // Sessions moved to the LID addresses.
        assert_eq!(
            store.get_session("201111_1.0").unwrap(),
            Some(session_bytes.clone())
        );
        assert!(store.get_session("15550001111.0").unwrap().is_none());
        assert!(store.get_session("201111_1.2").unwrap().is_some());

        // Re-running is a no-op: re-create a PN session and confirm the
        // cached migration leaves it alone.
        store.put_session("15550001111.0", vec![1]).await.unwrap();
        resolver.adopt_own_lid(&me, &lid).await.unwrap();
        assert_eq!(store.get_session("15550001111.0").unwrap(), Some(vec![1]));
        assert_eq!(store.get_session("201111_1.0").unwrap(), Some(session_bytes));
    }

    #[tokio::test]
    async fn test_own_device_recorded() {
        let (resolver, _, store) = fixture();
        let me = Jid::with_device("15550001111", 4, servers::DEFAULT_USER);
        let lid = Jid::new("201111", servers::HIDDEN_USER);
        resolver.adopt_own_lid(&me, &lid).await.unwrap();

        assert_eq!(store.get_device_list("15550001111").unwrap(), Some(vec![4]));
    }

    #[tokio::test]
    async fn test_invalidate_session_clears_cache() {
        let (resolver, _, _) = fixture();
        resolver.session_ok.insert("x.0".to_string(), ());
        assert!(resolver.session_validity_cached("x.0"));
        resolver.invalidate_session("x.0");
        assert!(!resolver.session_validity_cached("x.0"));
    }
}
