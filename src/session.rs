//! Session assembly.
//!
//! Builds one connected client out of the parts: store, credentials,
//! connection supervisor, resolver, relay, pre-key manager and event
//! buffer, and registers the stanza routes that tie them together. The
//! supervisor never imports the relay; everything below it sees only the
//! narrow `NodeSender` interface.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::binary::Node;
use crate::config::Config;
use crate::conn::{Connection, NodeSender, RouteSelector};
use crate::eventbuf::EventBuffer;
use crate::pair;
use crate::prekeys::{AuditPriority, PreKeyManager};
use crate::relay::{GroupMetaSource, MessageRelay};
use crate::resolver::DeviceResolver;
use crate::store::{Credentials, KvBackend, SignalStore, StoreError};
use crate::types::events::{ConnectionUpdate, Event, Receipt, ReceiptType};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

enum BufferCtl {
    Start,
    Flush,
}

/// A fully wired session. Events arrive on the receiver returned by
/// `build`; the caller drives `conn.connect()`.
pub struct Session {
    pub store: Arc<SignalStore>,
    pub creds: Arc<RwLock<Credentials>>,
    pub conn: Arc<Connection>,
    pub resolver: Arc<DeviceResolver>,
    pub relay: Arc<MessageRelay>,
    pub prekeys: Arc<PreKeyManager>,
    buffer_ctl: mpsc::UnboundedSender<BufferCtl>,
}

impl Session {
    /// Assemble a session over a store backend. Credentials are loaded from
    /// the store or generated fresh; store integrity is validated before
    /// anything else runs.
    pub async fn build(
        cfg: Config,
        backend: Arc<dyn KvBackend>,
        group_meta: Option<Arc<dyn GroupMetaSource>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>), SessionError> {
        let store = SignalStore::new(backend);

        let mut creds = match store.load_creds()? {
            Some(creds) => creds,
            None => {
                info!("no stored credentials, generating fresh identity");
                let creds = Credentials::generate();
                store.save_creds(&creds).await?;
                creds
            }
        };
        store.validate_on_startup(&mut creds).await?;
        let registered = creds.registered;
        let creds = Arc::new(RwLock::new(creds));

        // Raw events flow through the buffer task before reaching the app.
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<BufferCtl>();
        tokio::spawn(async move {
            let mut buffer = EventBuffer::new(out_tx);
            loop {
                tokio::select! {
                    ctl = ctl_rx.recv() => match ctl {
                        Some(BufferCtl::Start) => buffer.start(),
                        Some(BufferCtl::Flush) => {
                            buffer.flush();
                        }
                        None => break,
                    },
                    event = raw_rx.recv() => match event {
                        Some(event) => buffer.emit(event),
                        None => break,
                    },
                }
            }
        });

        let conn = Connection::new(cfg, store.clone(), creds.clone(), raw_tx.clone());
        let sender: Arc<dyn NodeSender> = conn.clone();
        let resolver = Arc::new(DeviceResolver::new(
            store.clone(),
            creds.clone(),
            sender.clone(),
        ));
        let prekeys = PreKeyManager::new(
            store.clone(),
            creds.clone(),
            sender.clone(),
            raw_tx.clone(),
        );
        let relay = Arc::new(MessageRelay::new(
            store.clone(),
            creds.clone(),
            resolver.clone(),
            sender,
            prekeys.clone(),
            raw_tx.clone(),
            group_meta,
        ));

        let session = Self {
            store,
            creds,
            conn,
            resolver,
            relay,
            prekeys,
            buffer_ctl: ctl_tx,
        };
        session.register_routes(raw_tx);
        if registered {
            // Credentials known: coalesce history-sync events until the
            // first offline batch completes.
            let _ = session.buffer_ctl.send(BufferCtl::Start);
        }
        Ok((session, out_rx))
    }

    fn register_routes(&self, events: mpsc::UnboundedSender<Event>) {
        let conn = Arc::downgrade(&self.conn);

        // Inbound messages: decrypt and dispatch.
        let relay = self.relay.clone();
        self.conn
            .register_route(RouteSelector::tag("message"), move |node| {
                let relay = relay.clone();
                Box::pin(async move { relay.handle_incoming(node).await })
            });

        // Receipts feed the buffered event stream.
        let receipt_events = events.clone();
        self.conn
            .register_route(RouteSelector::tag("receipt"), move |node| {
                let events = receipt_events.clone();
                Box::pin(async move {
                    if let Some(receipt) = parse_receipt(&node) {
                        let _ = events.send(Event::Receipt(receipt));
                    }
                })
            });

        // QR pairing: ack the IQ and start ref rotation.
        let pair_conn = conn.clone();
        let pair_creds = self.creds.clone();
        let pair_events = events.clone();
        self.conn.register_route(
            RouteSelector::tag("iq")
                .with_attr("type", "set")
                .with_child("pair-device"),
            move |node| {
                let conn = pair_conn.clone();
                let creds = pair_creds.clone();
                let events = pair_events.clone();
                Box::pin(async move {
                    let refs = match pair::parse_pair_device_refs(&node) {
                        Ok(refs) => refs,
                        Err(e) => {
                            warn!("bad pair-device stanza: {e}");
                            return;
                        }
                    };
                    if let (Some(conn), Some(id)) = (conn.upgrade(), node.get_attr_str("id")) {
                        let ack = Node::new("iq").attr("id", id).attr("type", "result");
                        if let Err(e) = conn.send_node(ack).await {
                            warn!("failed to ack pair-device: {e}");
                        }
                    }
                    let creds = creds.read().await.clone();
                    // Rotation sleeps between refs; keep it off the
                    // dispatch path.
                    tokio::spawn(pair::run_qr_rotation(refs, creds, events));
                })
            },
        );

        // Pairing completion: validate, countersign, persist, confirm.
        let success_conn = conn.clone();
        let success_creds = self.creds.clone();
        let success_store = self.store.clone();
        let success_events = events.clone();
        let success_ctl = self.buffer_ctl.clone();
        self.conn.register_route(
            RouteSelector::tag("iq").with_child("pair-success"),
            move |node| {
                let conn = success_conn.clone();
                let creds = success_creds.clone();
                let store = success_store.clone();
                let events = success_events.clone();
                let ctl = success_ctl.clone();
                Box::pin(async move {
                    let outcome = {
                        let creds = creds.read().await;
                        match pair::configure_successful_pairing(&node, &creds) {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                warn!("pairing validation failed: {e}");
                                return;
                            }
                        }
                    };
                    {
                        let mut creds = creds.write().await;
                        pair::apply_pairing(&mut creds, &outcome);
                        if let Err(e) = store.save_creds(&creds).await {
                            warn!("failed to persist paired credentials: {e}");
                        }
                    }
                    let _ = events.send(Event::Creds(outcome.update.clone()));
                    let _ = events.send(Event::Connection(ConnectionUpdate {
                        is_new_login: true,
                        ..Default::default()
                    }));
                    let _ = ctl.send(BufferCtl::Start);
                    if let Some(conn) = conn.upgrade() {
                        if let Err(e) = conn.send_node(outcome.reply.clone()).await {
                            warn!("failed to confirm pairing: {e}");
                        }
                    }
                })
            },
        );

        // Login success: adopt the server-assigned LID and audit pre-keys.
        let login_resolver = self.resolver.clone();
        let login_creds = self.creds.clone();
        let login_store = self.store.clone();
        let login_prekeys = self.prekeys.clone();
        self.conn
            .register_route(RouteSelector::tag("success"), move |node| {
                let resolver = login_resolver.clone();
                let creds = login_creds.clone();
                let store = login_store.clone();
                let prekeys = login_prekeys.clone();
                Box::pin(async move {
                    let lid = node.get_attr_jid("lid");
                    let me = creds.read().await.me.clone();
                    if let (Some(me), Some(lid)) = (me, lid) {
                        {
                            let mut creds = creds.write().await;
                            if creds.lid.is_none() {
                                creds.lid = Some(lid.clone());
                                if let Err(e) = store.save_creds(&creds).await {
                                    warn!("failed to persist own LID: {e}");
                                }
                            }
                        }
                        if let Err(e) = resolver.adopt_own_lid(&me, &lid).await {
                            warn!("own-LID adoption failed: {e}");
                        }
                    }
                    prekeys.audit(AuditPriority::High).await;
                })
            });

        // End of the offline batch: flush everything coalesced so far.
        let flush_ctl = self.buffer_ctl.clone();
        self.conn.register_route(
            RouteSelector::tag("ib").with_child("offline"),
            move |_node| {
                let ctl = flush_ctl.clone();
                Box::pin(async move {
                    let _ = ctl.send(BufferCtl::Flush);
                })
            },
        );
    }
}

fn parse_receipt(node: &Node) -> Option<Receipt> {
    let chat = node.get_attr_jid("from")?;
    let sender = node.get_attr_jid("participant").unwrap_or_else(|| chat.clone());
    let mut message_ids: Vec<String> = node
        .get_attr_str("id")
        .map(|id| vec![id.to_string()])
        .unwrap_or_default();
    if let Some(list) = node.get_child_by_tag("list") {
        for item in list.get_children_by_tag("item") {
            if let Some(id) = item.get_attr_str("id") {
                message_ids.push(id.to_string());
            }
        }
    }
    if message_ids.is_empty() {
        return None;
    }
    let receipt_type = match node.get_attr_str("type") {
        Some("read") => ReceiptType::Read,
        Some("played") => ReceiptType::Played,
        Some("retry") => ReceiptType::Retry,
        Some("server") => ReceiptType::Server,
        _ => ReceiptType::Delivered,
    };
    Some(Receipt {
        message_ids,
        chat,
        sender,
        receipt_type,
        timestamp: node
            .get_attr_int("t")
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
    })
}

/// Build the `<presence/>` announcement sent after login.
pub fn build_presence(name: &str) -> Node {
    Node::new("presence").attr("name", name).attr("type", "available")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::jid::servers;
    use crate::types::Jid;

    #[tokio::test]
    async fn test_build_generates_and_persists_creds() {
        let backend = Arc::new(MemoryStore::new());
        let (session, _events) = Session::build(Config::default(), backend, None)
            .await
            .unwrap();

        let stored = session.store.load_creds().unwrap().unwrap();
        let live = session.creds.read().await;
        assert_eq!(stored.noise_key.public, live.noise_key.public);
        // Startup integrity created the first pre-key batch.
        assert!(live.next_pre_key_id > 1);
        assert!(session.store.get_pre_key(1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_build_reuses_stored_creds() {
        let backend = Arc::new(MemoryStore::new());
        let (first, _events) = Session::build(Config::default(), backend.clone(), None)
            .await
            .unwrap();
        let original = first.creds.read().await.noise_key.public;
        drop(first);

        let (second, _events) = Session::build(Config::default(), backend, None)
            .await
            .unwrap();
        assert_eq!(second.creds.read().await.noise_key.public, original);
    }

    #[tokio::test]
    async fn test_message_route_is_registered() {
        let backend = Arc::new(MemoryStore::new());
        let (session, _events) = Session::build(Config::default(), backend, None)
            .await
            .unwrap();

        // Dispatch of an unparseable message stanza must not panic and must
        // hit the relay route (which logs and drops it).
        session
            .conn
            .dispatch(Node::new("message").attr("id", "X"))
            .await;
    }

    #[tokio::test]
    async fn test_receipt_parsing() {
        let node = Node::new("receipt")
            .attr("from", Jid::new("15551234567", servers::DEFAULT_USER))
            .attr("id", "ABC")
            .attr("type", "read")
            .attr("t", 1700i64);
        let receipt = parse_receipt(&node).unwrap();
        assert_eq!(receipt.message_ids, vec!["ABC"]);
        assert_eq!(receipt.receipt_type, ReceiptType::Read);
        assert_eq!(receipt.timestamp, 1700);
    }
}
