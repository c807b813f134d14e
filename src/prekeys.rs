//! Pre-key inventory management.
//!
//! Monitors the server-side count of one-time pre-keys and replenishes it
//! so peers can always establish sessions asynchronously. Uploads are
//! strictly serialized; priorities decide who may bypass the check
//! throttle.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::binary::Node;
use crate::conn::{ConnError, NodeSender};
use crate::crypto::PreKey;
use crate::store::{Credentials, SignalStore, StoreError};
use crate::types::events::{CredsUpdate, Event};
use crate::types::jid::servers;

/// Server-side minimum before a refill is due.
pub const MIN_SERVER_PRE_KEYS: usize = 5;
/// At or below this count the refill is critical.
pub const CRITICAL_SERVER_PRE_KEYS: usize = 3;
/// Batch size for the initial upload and critical refills.
pub const INITIAL_BATCH_SIZE: usize = 95;
/// Standard refill size.
pub const STANDARD_UPLOAD_SIZE: usize = 20;

/// Minimum time between server count checks.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Scheduled sweep interval.
pub const SCHEDULED_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Minimum time between uploads.
const MIN_UPLOAD_INTERVAL: Duration = Duration::from_secs(5);
/// Timeout for the upload IQ.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Upload retry budget.
const UPLOAD_RETRIES: u32 = 3;

/// Priority of a pre-key audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditPriority {
    /// Scheduled sweep.
    Low,
    /// Send-error or receive path.
    Normal,
    /// Lifecycle events: pairing, connection open.
    High,
    /// Suspected pre-key desync (bad MAC); overrides the check throttle.
    Critical,
}

#[derive(Debug, thiserror::Error)]
pub enum PreKeyError {
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed server reply: {0}")]
    BadReply(&'static str),
}

pub struct PreKeyManager {
    store: Arc<SignalStore>,
    creds: Arc<RwLock<Credentials>>,
    sender: Arc<dyn NodeSender>,
    events: mpsc::UnboundedSender<Event>,
    last_check_ms: AtomicI64,
    last_upload_ms: AtomicI64,
    uploading: AtomicBool,
    queued: Mutex<Vec<AuditPriority>>,
}

impl PreKeyManager {
    pub fn new(
        store: Arc<SignalStore>,
        creds: Arc<RwLock<Credentials>>,
        sender: Arc<dyn NodeSender>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            creds,
            sender,
            events,
            last_check_ms: AtomicI64::new(0),
            last_upload_ms: AtomicI64::new(0),
            uploading: AtomicBool::new(false),
            queued: Mutex::new(Vec::new()),
        })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Run one audit: query the server count and refill as needed. Only one
    /// audit may be in flight; concurrent requests queue behind it and the
    /// highest queued priority runs afterwards.
    pub fn audit(
        self: &Arc<Self>,
        priority: AuditPriority,
    ) -> futures::future::BoxFuture<'_, ()> {
        Box::pin(self.audit_inner(priority))
    }

    async fn audit_inner(self: &Arc<Self>, priority: AuditPriority) {
        let now = Self::now_ms();
        let since_check = now - self.last_check_ms.load(Ordering::Acquire);
        if priority < AuditPriority::Critical
            && since_check < MIN_CHECK_INTERVAL.as_millis() as i64
        {
            debug!("pre-key audit throttled ({priority:?}, checked {since_check}ms ago)");
            return;
        }

        if self.uploading.swap(true, Ordering::AcqRel) {
            self.queued.lock().await.push(priority);
            return;
        }

        if let Err(e) = self.check_and_upload(priority).await {
            warn!("pre-key audit failed: {e}");
        }
        self.uploading.store(false, Ordering::Release);

        let followup = {
            let mut queued = self.queued.lock().await;
            let max = queued.iter().copied().max();
            queued.clear();
            max
        };
        if let Some(priority) = followup {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.audit(priority).await;
            });
        }
    }

    async fn check_and_upload(&self, priority: AuditPriority) -> Result<(), PreKeyError> {
        self.last_check_ms.store(Self::now_ms(), Ordering::Release);
        let count = self.fetch_server_count().await?;
        debug!("server reports {count} pre-keys (priority {priority:?})");

        let (upload_count, effective) = if count <= CRITICAL_SERVER_PRE_KEYS {
            (INITIAL_BATCH_SIZE, AuditPriority::Critical)
        } else if count < MIN_SERVER_PRE_KEYS {
            (
                STANDARD_UPLOAD_SIZE.max(MIN_SERVER_PRE_KEYS - count + 5),
                priority,
            )
        } else if priority == AuditPriority::Critical {
            (STANDARD_UPLOAD_SIZE, priority)
        } else {
            return Ok(());
        };

        let since_upload = Self::now_ms() - self.last_upload_ms.load(Ordering::Acquire);
        if since_upload < MIN_UPLOAD_INTERVAL.as_millis() as i64 {
            debug!("pre-key upload skipped, last upload {since_upload}ms ago");
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 0..UPLOAD_RETRIES {
            match self.upload(upload_count).await {
                Ok(()) => {
                    info!("uploaded {upload_count} pre-keys (priority {effective:?})");
                    return Ok(());
                }
                Err(e) => {
                    warn!("pre-key upload attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
        Err(last_err.expect("retries exhausted with an error"))
    }

    /// Query the server for the available pre-key count.
    pub async fn fetch_server_count(&self) -> Result<usize, PreKeyError> {
        let iq = Node::new("iq")
            .attr("type", "get")
            .attr("xmlns", "encrypt")
            .attr("to", servers::DEFAULT_USER)
            .children(vec![Node::new("count")]);
        let reply = self.sender.query(iq, None).await?;
        let count = reply
            .get_child_by_tag("count")
            .and_then(|n| n.get_attr_int("value"))
            .ok_or(PreKeyError::BadReply("missing count"))?;
        Ok(count.max(0) as usize)
    }

    /// Generate and upload one batch inside a store transaction keyed on
    /// the pre-key cursor. The creds update event fires before the IQ so
    /// the new cursor is never lost to a crash mid-upload.
    async fn upload(&self, count: usize) -> Result<(), PreKeyError> {
        let _guard = self.store.lock_key("pre-key-upload").await;

        let (batch, iq) = {
            let mut creds = self.creds.write().await;
            let batch = self
                .store
                .generate_and_store_pre_keys(&mut creds, count)
                .await?;
            let _ = self.events.send(Event::Creds(CredsUpdate {
                next_pre_key_id: Some(creds.next_pre_key_id),
                ..Default::default()
            }));
            let iq = build_upload_iq(&creds, &batch);
            (batch, iq)
        };
        debug_assert!(!batch.is_empty());

        self.sender.query(iq, Some(UPLOAD_TIMEOUT)).await?;
        self.last_upload_ms.store(Self::now_ms(), Ordering::Release);
        Ok(())
    }
}

fn bytes_node(tag: &str, bytes: Vec<u8>) -> Node {
    let mut node = Node::new(tag);
    node.set_bytes(bytes);
    node
}

fn key_id_bytes(id: u32) -> Vec<u8> {
    id.to_be_bytes()[1..].to_vec()
}

/// Build the registration/keys upload IQ.
pub fn build_upload_iq(creds: &Credentials, batch: &[PreKey]) -> Node {
    let keys = batch
        .iter()
        .map(|pk| {
            Node::new("key").children(vec![
                bytes_node("id", key_id_bytes(pk.key_id)),
                bytes_node("value", pk.key_pair.public.to_vec()),
            ])
        })
        .collect();

    Node::new("iq")
        .attr("type", "set")
        .attr("xmlns", "encrypt")
        .attr("to", servers::DEFAULT_USER)
        .children(vec![
            bytes_node(
                "registration",
                (creds.registration_id as u32).to_be_bytes().to_vec(),
            ),
            bytes_node("type", vec![5]),
            bytes_node("identity", creds.identity_key.public.to_vec()),
            bytes_node("vident", creds.identity_key.verifying_key().to_vec()),
            Node::new("list").children(keys),
            Node::new("skey").children(vec![
                bytes_node("id", key_id_bytes(creds.signed_pre_key.key_id)),
                bytes_node("value", creds.signed_pre_key.key_pair.public.to_vec()),
                bytes_node("signature", creds.signed_pre_key.signature.to_vec()),
            ]),
        ])
}

/// Extract the uploaded pre-key ids from an upload IQ, for verification.
pub fn uploaded_ids(iq: &Node) -> Vec<u32> {
    iq.get_child_by_tag("list")
        .map(|list| {
            list.get_children_by_tag("key")
                .iter()
                .filter_map(|key| {
                    let id = key.get_child_by_tag("id")?.get_bytes()?;
                    let mut padded = [0u8; 4];
                    padded[4 - id.len()..].copy_from_slice(id);
                    Some(u32::from_be_bytes(padded))
                })
                .collect()
        })
        .unwrap_or_default()
}
