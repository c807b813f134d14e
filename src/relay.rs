//! Outbound message fan-out and inbound decryption.
//!
//! The single entry point for sending: resolves recipient devices, encrypts
//! per device (1:1 double-ratchet) or once per group (sender key), builds
//! the wire stanza and hands it to the connection. All work for one message
//! runs inside a store transaction keyed on the sender's own id, so
//! messages to the same destination keep their submission order.

use std::collections::HashMap;
use std::sync::Arc;

use base64::encode as b64encode;
use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture};
use log::{debug, info, warn};
use prost::Message as ProstMessage;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::binary::Node;
use crate::conn::{ConnError, NodeSender};
use crate::prekeys::{AuditPriority, PreKeyManager};
use crate::proto::wa;
use crate::resolver::{DeviceResolver, ResolveError};
use crate::signal::{sender_key_name, EncType, GroupCipher, SessionCipher, SignalError};
use crate::store::{Credentials, SignalStore, StoreError};
use crate::types::events::{Event, IncomingMessage, MessageInfo};
use crate::types::{Jid, MessageId};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("per-recipient patching is not allowed in groups")]
    PerRecipientPatchInGroup,
    #[error("not registered")]
    NotRegistered,
    #[error("no group metadata source")]
    NoGroupMeta,
}

/// Group metadata as the relay consumes it. Group management RPCs live with
/// the caller; only this narrow lookup is required here.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub jid: Jid,
    pub participants: Vec<Jid>,
    pub addressing_mode: AddressingMode,
    /// Disappearing-message timer, seconds.
    pub ephemeral: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Pn,
    Lid,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Pn => "pn",
            AddressingMode::Lid => "lid",
        }
    }
}

/// Narrow source for group metadata, injected at construction.
pub trait GroupMetaSource: Send + Sync {
    fn group_info(&self, jid: &Jid) -> BoxFuture<'_, Result<GroupInfo, ConnError>>;
}

/// Caller-provided message patching hook.
pub trait MessagePatcher: Send + Sync {
    fn patch(&self, message: &wa::Message, recipients: &[Jid]) -> PatchResult;
}

pub enum PatchResult {
    /// One patched message for all recipients.
    Uniform(wa::Message),
    /// Per-recipient messages keyed by full JID string. 1:1 only.
    PerRecipient(HashMap<String, wa::Message>),
}

/// Stanza edit attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAttr {
    MessageEdit,
    Pin,
    AdminRevoke,
    SenderRevoke,
}

impl EditAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditAttr::MessageEdit => "1",
            EditAttr::Pin => "2",
            EditAttr::AdminRevoke => "7",
            EditAttr::SenderRevoke => "8",
        }
    }
}

/// Retry-resend parameters: encrypt for exactly this participant.
#[derive(Debug, Clone)]
pub struct RetryParticipant {
    pub jid: Jid,
    pub count: u32,
}

/// Options for one send.
#[derive(Default)]
pub struct SendOptions {
    pub message_id: Option<MessageId>,
    pub retry: Option<RetryParticipant>,
    pub extra_attrs: Vec<(String, String)>,
    /// Additional recipients for a status broadcast.
    pub status_jid_list: Vec<Jid>,
    pub use_cached_group_meta: bool,
    pub edit: Option<EditAttr>,
    pub patcher: Option<Arc<dyn MessagePatcher>>,
}

/// Result of a send: the id and final destination key.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub id: MessageId,
    pub to: Jid,
}

/// Generate a client message id: uppercase hex with the web prefix.
pub fn generate_message_id() -> MessageId {
    let bytes: [u8; 9] = rand::random();
    format!("3EB0{}", hex::encode_upper(bytes))
}

/// Participant hash over the sorted recipient set, for tamper detection.
pub fn participant_hash(jids: &[Jid]) -> String {
    let mut users: Vec<String> = jids.iter().map(|j| j.to_string()).collect();
    users.sort();
    users.dedup();
    let mut hasher = Sha256::new();
    for user in &users {
        hasher.update(user.as_bytes());
    }
    let digest = hasher.finalize();
    format!("2:{}", b64encode(&digest[..6]))
}

pub struct MessageRelay {
    store: Arc<SignalStore>,
    creds: Arc<RwLock<Credentials>>,
    resolver: Arc<DeviceResolver>,
    sender: Arc<dyn NodeSender>,
    session_cipher: SessionCipher,
    group_cipher: GroupCipher,
    prekeys: Arc<PreKeyManager>,
    events: mpsc::UnboundedSender<Event>,
    group_meta: Option<Arc<dyn GroupMetaSource>>,
    group_cache: DashMap<String, GroupInfo>,
    /// Per-recipient mutexes so concurrent sends never interleave ratchet
    /// steps for the same address.
    recipient_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MessageRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SignalStore>,
        creds: Arc<RwLock<Credentials>>,
        resolver: Arc<DeviceResolver>,
        sender: Arc<dyn NodeSender>,
        prekeys: Arc<PreKeyManager>,
        events: mpsc::UnboundedSender<Event>,
        group_meta: Option<Arc<dyn GroupMetaSource>>,
    ) -> Self {
        Self {
            session_cipher: SessionCipher::new(store.clone(), creds.clone()),
            group_cipher: GroupCipher::new(store.clone()),
            store,
            creds,
            resolver,
            sender,
            prekeys,
            events,
            group_meta,
            group_cache: DashMap::new(),
            recipient_locks: DashMap::new(),
        }
    }

    /// Send one already-built message to a destination.
    pub async fn send_message(
        &self,
        to: Jid,
        message: wa::Message,
        opts: SendOptions,
    ) -> Result<SendReceipt, RelayError> {
        let id = opts
            .message_id
            .clone()
            .unwrap_or_else(generate_message_id);

        let (me, own_lid) = {
            let creds = self.creds.read().await;
            (
                creds.me.clone().ok_or(RelayError::NotRegistered)?,
                creds.lid.clone(),
            )
        };

        // Serialize all encryption work end-to-end per sender.
        let _txn = self.store.lock_key(&me.to_string()).await;

        let stanza = if to.is_newsletter() {
            self.build_newsletter_stanza(&to, &id, &message)
        } else if to.is_group() || to.is_status_broadcast() {
            self.build_group_stanza(&to, &me, own_lid.as_ref(), &id, &message, &opts)
                .await?
        } else {
            self.build_dm_stanza(&to, &me, own_lid.as_ref(), &id, &message, &opts)
                .await?
        };

        self.sender.send_node(stanza).await?;
        Ok(SendReceipt { id, to })
    }

    // -- newsletter ---------------------------------------------------------

    fn build_newsletter_stanza(&self, to: &Jid, id: &str, message: &wa::Message) -> Node {
        let mut plaintext = Node::new("plaintext");
        plaintext.set_bytes(wa::encode_newsletter_message(message));
        Node::new("message")
            .attr("id", id)
            .attr("to", to.clone())
            .attr("type", message_stanza_type(message))
            .children(vec![plaintext])
    }

    // -- 1:1 ---------------------------------------------------------------

    async fn build_dm_stanza(
        &self,
        to: &Jid,
        me: &Jid,
        own_lid: Option<&Jid>,
        id: &str,
        message: &wa::Message,
        opts: &SendOptions,
    ) -> Result<Node, RelayError> {
        // Retry-resend targets exactly one participant.
        let targets = match &opts.retry {
            Some(retry) => vec![retry.jid.clone()],
            None => {
                // The own user is always included so other own devices get
                // the device-sent variant.
                let chats = vec![to.to_non_ad(), me.to_non_ad()];
                self.resolver.resolve_devices(&chats).await?
            }
        };
        let targets: Vec<Jid> = targets
            .into_iter()
            .filter(|jid| jid.is_encryption_target())
            .filter(|jid| !is_same_device(jid, me, own_lid))
            .collect();

        self.resolver.assert_sessions(&targets, false).await?;

        // Patch hook: per-recipient results are honored here.
        let patched = apply_patch(opts.patcher.as_deref(), message, &targets, false)?;

        let encrypt_jobs = targets.iter().map(|target| {
            let is_own_device = is_own_user(target, me, own_lid);
            let base = patched.for_recipient(target);
            let plaintext = if is_own_device && !is_same_chat(target, to) {
                let dsm = wa::Message {
                    device_sent_message: Some(wa::DeviceSentMessage {
                        destination_jid: Some(to.to_string()),
                        message: Some(Box::new(base.clone())),
                    }),
                    ..Default::default()
                };
                wa::encode_wa_message(&dsm)
            } else {
                wa::encode_wa_message(base)
            };
            self.encrypt_for(target.clone(), plaintext, opts.retry.as_ref())
        });
        let encrypted: Vec<(Node, bool)> = try_join_all(encrypt_jobs).await?;

        let any_pkmsg = encrypted.iter().any(|(_, pkmsg)| *pkmsg);
        let to_nodes: Vec<Node> = encrypted.into_iter().map(|(node, _)| node).collect();

        let mut stanza = Node::new("message")
            .attr("id", id)
            .attr("to", to.clone())
            .attr("type", message_stanza_type(message));
        if let Some(mediatype) = media_type(message) {
            stanza.set_attr("mediatype", mediatype);
        }
        if let Some(edit) = opts.edit {
            stanza.set_attr("edit", edit.as_str());
        }
        if hide_decrypt_fail(message, opts.edit) {
            stanza.set_attr("decrypt-fail", "hide");
        }
        for (key, value) in &opts.extra_attrs {
            stanza.set_attr(key.clone(), value.clone());
        }
        if opts.retry.is_none() {
            stanza.set_attr("phash", participant_hash(&targets));
        }

        let mut participants = Node::new("participants");
        participants.set_children(to_nodes);
        stanza.add_child(participants);

        if any_pkmsg {
            self.attach_device_identity(&mut stanza).await;
        }
        Ok(stanza)
    }

    // -- groups -------------------------------------------------------------

    async fn group_info(
        &self,
        group: &Jid,
        use_cache: bool,
    ) -> Result<GroupInfo, RelayError> {
        if use_cache {
            if let Some(info) = self.group_cache.get(&group.to_string()) {
                return Ok(info.clone());
            }
        }
        let source = self.group_meta.as_ref().ok_or(RelayError::NoGroupMeta)?;
        let info = source.group_info(group).await?;
        self.group_cache.insert(group.to_string(), info.clone());
        Ok(info)
    }

    async fn build_group_stanza(
        &self,
        to: &Jid,
        me: &Jid,
        own_lid: Option<&Jid>,
        id: &str,
        message: &wa::Message,
        opts: &SendOptions,
    ) -> Result<Node, RelayError> {
        // Per-recipient patching cannot work when everyone shares one
        // sender-key ciphertext.
        let patched = apply_patch(opts.patcher.as_deref(), message, &[], true)?;
        let message = patched.uniform();

        let (participants, addressing_mode, ephemeral) = if to.is_status_broadcast() {
            (opts.status_jid_list.clone(), AddressingMode::Pn, None)
        } else {
            let info = self.group_info(to, opts.use_cached_group_meta).await?;
            (info.participants, info.addressing_mode, info.ephemeral)
        };

        // Own identity participates so own devices receive the sender key.
        let mut chats: Vec<Jid> = participants.iter().map(|p| p.to_non_ad()).collect();
        let own_chat = match (addressing_mode, own_lid) {
            (AddressingMode::Lid, Some(lid)) => lid.to_non_ad(),
            _ => me.to_non_ad(),
        };
        if !chats.contains(&own_chat) {
            chats.push(own_chat);
        }

        let devices = self.resolver.resolve_devices(&chats).await?;
        let own_address = self.own_sending_address(me, own_lid, addressing_mode);
        let key_name = sender_key_name(&to.to_string(), &own_address);

        let targets: Vec<Jid> = devices
            .into_iter()
            .filter(|jid| jid.is_encryption_target())
            .filter(|jid| !is_same_device(jid, me, own_lid))
            .collect();

        // Devices that never received the current sender key get an SKDM.
        let mut memory = self.store.get_sender_key_memory(&to.to_string())?;
        let skdm_targets: Vec<Jid> = match &opts.retry {
            Some(retry) => {
                // Retry-resend recomputes for the one recipient only.
                vec![retry.jid.clone()]
                    .into_iter()
                    .filter(|jid| jid.is_encryption_target())
                    .collect()
            }
            None => targets
                .iter()
                .filter(|jid| !memory.contains(&jid.to_string()))
                .cloned()
                .collect(),
        };

        let mut to_nodes = Vec::new();
        let mut any_pkmsg = false;
        if !skdm_targets.is_empty() {
            self.resolver.assert_sessions(&skdm_targets, false).await?;

            let skdm_wire = self.group_cipher.create_distribution(&key_name).await?;
            let skdm_message = wa::Message {
                sender_key_distribution_message: Some(wa::SenderKeyDistributionHolder {
                    group_id: Some(to.to_string()),
                    axolotl_sender_key_distribution_message: Some(skdm_wire),
                }),
                ..Default::default()
            };
            let plaintext = wa::encode_wa_message(&skdm_message);

            let jobs = skdm_targets.iter().map(|target| {
                self.encrypt_for(target.clone(), plaintext.clone(), opts.retry.as_ref())
            });
            for (node, pkmsg) in try_join_all(jobs).await? {
                any_pkmsg |= pkmsg;
                to_nodes.push(node);
            }
        }

        // One sender-key ciphertext for the whole group.
        let padded = wa::encode_wa_message(message);
        let skmsg = self.group_cipher.encrypt(&key_name, &padded).await?;

        // Record distribution atomically with the ciphertext.
        if opts.retry.is_none() {
            for target in &skdm_targets {
                memory.insert(target.to_string());
            }
            let write = self
                .store
                .sender_key_memory_write(&to.to_string(), &memory)?;
            self.store.commit(vec![write]).await?;
        }

        let mut enc = Node::new("enc").attr("v", "2").attr("type", "skmsg");
        if let Some(mediatype) = media_type(message) {
            enc.set_attr("mediatype", mediatype);
        }
        enc.set_bytes(skmsg);

        // Retry-resend delivers the skmsg to the one participant only,
        // tagged with the retry count; a normal send broadcasts it as a
        // bare child.
        let mut broadcast_enc = None;
        match &opts.retry {
            Some(retry) => {
                enc.set_attr("count", retry.count as i64);
                let existing = to_nodes
                    .iter()
                    .position(|n| n.get_attr_jid("jid").as_ref() == Some(&retry.jid));
                match existing {
                    Some(i) => to_nodes[i].add_child(enc),
                    None => to_nodes.push(
                        Node::new("to")
                            .attr("jid", retry.jid.clone())
                            .children(vec![enc]),
                    ),
                }
            }
            None => broadcast_enc = Some(enc),
        }

        let mut stanza = Node::new("message")
            .attr("id", id)
            .attr("to", to.clone())
            .attr("type", message_stanza_type(message))
            .attr("addressing_mode", addressing_mode.as_str());
        if let Some(mediatype) = media_type(message) {
            stanza.set_attr("mediatype", mediatype);
        }
        if let Some(expiration) = ephemeral {
            stanza.set_attr("expiration", expiration as i64);
        }
        if let Some(edit) = opts.edit {
            stanza.set_attr("edit", edit.as_str());
        }
        if hide_decrypt_fail(message, opts.edit) {
            stanza.set_attr("decrypt-fail", "hide");
        }
        for (key, value) in &opts.extra_attrs {
            stanza.set_attr(key.clone(), value.clone());
        }

        if !to_nodes.is_empty() {
            let mut participants_node = Node::new("participants");
            participants_node.set_children(to_nodes);
            stanza.add_child(participants_node);
        }
        if let Some(enc) = broadcast_enc {
            stanza.add_child(enc);
        }

        if any_pkmsg {
            self.attach_device_identity(&mut stanza).await;
        }
        Ok(stanza)
    }

    fn own_sending_address(
        &self,
        me: &Jid,
        own_lid: Option<&Jid>,
        mode: AddressingMode,
    ) -> String {
        match (mode, own_lid) {
            (AddressingMode::Lid, Some(lid)) => {
                Jid::with_device(lid.user.clone(), me.device, lid.server.clone()).signal_address()
            }
            _ => me.signal_address(),
        }
    }

    // -- shared -------------------------------------------------------------

    /// Encrypt one plaintext for one device under the recipient's keyed
    /// mutex. Returns the `<to>` node and whether a `pkmsg` was produced.
    async fn encrypt_for(
        &self,
        target: Jid,
        plaintext: Vec<u8>,
        retry: Option<&RetryParticipant>,
    ) -> Result<(Node, bool), RelayError> {
        let lock = self
            .recipient_locks
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let address = target.signal_address();
        let (enc_type, ciphertext) = self.session_cipher.encrypt(&address, &plaintext).await?;

        let mut enc = Node::new("enc")
            .attr("v", "2")
            .attr("type", enc_type.as_str());
        if let Some(retry) = retry {
            enc.set_attr("count", retry.count as i64);
        }
        enc.set_bytes(ciphertext);

        let node = Node::new("to").attr("jid", target).children(vec![enc]);
        Ok((node, enc_type == EncType::PreKey))
    }

    async fn attach_device_identity(&self, stanza: &mut Node) {
        let creds = self.creds.read().await;
        if let Some(account) = &creds.account {
            let mut node = Node::new("device-identity");
            node.set_bytes(account.clone());
            stanza.add_child(node);
        } else {
            warn!("pkmsg sent but no signed device identity available");
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Handle one incoming `message` stanza: decrypt every `enc` child and
    /// emit the results. Crypto failures are logged and surfaced, never
    /// thrown; a bad MAC additionally schedules a critical pre-key audit
    /// and clears the cached session validity for the sender.
    pub async fn handle_incoming(&self, node: Node) {
        let Some(info) = parse_message_info(&node) else {
            warn!("message stanza without usable routing info");
            return;
        };
        let sender_address = info.sender.signal_address();

        for enc in collect_enc_children(&node) {
            let Some(ciphertext) = enc.get_bytes() else {
                continue;
            };
            let enc_type = enc.get_attr_str("type").unwrap_or_default().to_string();

            let result = match enc_type.as_str() {
                "pkmsg" | "msg" => {
                    let wire_type = EncType::from_str(&enc_type).expect("matched above");
                    self.session_cipher
                        .decrypt(&sender_address, wire_type, ciphertext)
                        .await
                }
                "skmsg" => {
                    let name = sender_key_name(&info.chat.to_string(), &sender_address);
                    self.group_cipher.decrypt(&name, ciphertext).await
                }
                other => {
                    debug!("ignoring enc child of unknown type {other:?}");
                    continue;
                }
            };

            match result {
                Ok(padded) => {
                    let Some(plaintext) = wa::unpad_wa_message(&padded) else {
                        warn!("[msg:{}] bad padding after decrypt", info.id);
                        continue;
                    };
                    match wa::Message::decode(plaintext) {
                        Ok(message) => {
                            self.process_decrypted(&info, message).await;
                        }
                        Err(e) => warn!("[msg:{}] undecodable plaintext: {e}", info.id),
                    }
                }
                Err(e) => {
                    warn!("[msg:{}] decrypt failed ({enc_type}): {e}", info.id);
                    if e.is_corruption() {
                        // Assume pre-keys are out of sync with the server.
                        self.resolver.invalidate_session(&sender_address);
                        let prekeys = self.prekeys.clone();
                        tokio::spawn(async move {
                            prekeys.audit(AuditPriority::Critical).await;
                        });
                    }
                    let _ = self.events.send(Event::Undecryptable(info.clone()));
                }
            }
        }
    }

    async fn process_decrypted(&self, info: &MessageInfo, message: wa::Message) {
        // Piggybacked sender-key distribution installs the group ratchet.
        if let Some(holder) = &message.sender_key_distribution_message {
            if let (Some(group), Some(skdm)) = (
                &holder.group_id,
                &holder.axolotl_sender_key_distribution_message,
            ) {
                let name = sender_key_name(group, &info.sender.signal_address());
                if let Err(e) = self.group_cipher.process_distribution(&name, skdm).await {
                    warn!("[msg:{}] bad sender key distribution: {e}", info.id);
                }
            }
        }

        info!("[msg:{}] decrypted message from {}", info.id, info.sender);
        let _ = self.events.send(Event::Message(Box::new(IncomingMessage {
            info: info.clone(),
            message,
        })));
    }
}

fn is_same_chat(target: &Jid, to: &Jid) -> bool {
    target.user == to.user && target.server == to.server
}

fn is_own_user(jid: &Jid, me: &Jid, own_lid: Option<&Jid>) -> bool {
    jid.user == me.user || own_lid.map(|l| l.user == jid.user).unwrap_or(false)
}

fn is_same_device(jid: &Jid, me: &Jid, own_lid: Option<&Jid>) -> bool {
    is_own_user(jid, me, own_lid) && jid.device == me.device
}

enum Patched<'a> {
    Original(&'a wa::Message),
    Uniform(wa::Message),
    PerRecipient(HashMap<String, wa::Message>, &'a wa::Message),
}

impl<'a> Patched<'a> {
    fn for_recipient(&self, jid: &Jid) -> &wa::Message {
        match self {
            Patched::Original(m) => m,
            Patched::Uniform(m) => m,
            Patched::PerRecipient(map, fallback) => {
                map.get(&jid.to_string()).unwrap_or(fallback)
            }
        }
    }

    fn uniform(&self) -> &wa::Message {
        match self {
            Patched::Original(m) => m,
            Patched::Uniform(m) => m,
            Patched::PerRecipient(..) => unreachable!("rejected before use"),
        }
    }
}

fn apply_patch<'a>(
    patcher: Option<&dyn MessagePatcher>,
    message: &'a wa::Message,
    recipients: &[Jid],
    is_group: bool,
) -> Result<Patched<'a>, RelayError> {
    match patcher {
        None => Ok(Patched::Original(message)),
        Some(patcher) => match patcher.patch(message, recipients) {
            PatchResult::Uniform(patched) => Ok(Patched::Uniform(patched)),
            PatchResult::PerRecipient(_) if is_group => Err(RelayError::PerRecipientPatchInGroup),
            PatchResult::PerRecipient(map) => Ok(Patched::PerRecipient(map, message)),
        },
    }
}

/// Derive the stanza `type` attribute from the content.
pub fn message_stanza_type(message: &wa::Message) -> &'static str {
    if message.reaction_message.is_some() {
        "reaction"
    } else if message.poll_creation_message.is_some() {
        "poll"
    } else if message.event_message.is_some() {
        "event"
    } else if media_type(message).is_some() {
        "media"
    } else {
        "text"
    }
}

/// Derive the stanza `mediatype` attribute, when applicable.
pub fn media_type(message: &wa::Message) -> Option<&'static str> {
    if message.image_message.is_some() {
        Some("image")
    } else if message.video_message.is_some() {
        Some("video")
    } else if message.audio_message.is_some() {
        Some("audio")
    } else if message.document_message.is_some() {
        Some("document")
    } else if message.sticker_message.is_some() {
        Some("sticker")
    } else {
        None
    }
}

fn hide_decrypt_fail(message: &wa::Message, edit: Option<EditAttr>) -> bool {
    message.reaction_message.is_some()
        || message.protocol_message.is_some()
        || matches!(edit, Some(EditAttr::MessageEdit) | Some(EditAttr::Pin))
}

fn parse_message_info(node: &Node) -> Option<MessageInfo> {
    let id = node.get_attr_str("id")?.to_string();
    let from = node.get_attr_jid("from")?;
    let is_group = from.is_group();
    let sender = if is_group {
        node.get_attr_jid("participant")?
    } else {
        from.clone()
    };
    Some(MessageInfo {
        id,
        sender,
        chat: from,
        is_from_me: false,
        is_group,
        timestamp: node
            .get_attr_int("t")
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        push_name: node.get_attr_str("notify").map(String::from),
    })
}

fn collect_enc_children(node: &Node) -> Vec<&Node> {
    let mut encs: Vec<&Node> = node.get_children_by_tag("enc");
    if let Some(participants) = node.get_child_by_tag("participants") {
        for to in participants.get_children_by_tag("to") {
            encs.extend(to.get_children_by_tag("enc"));
        }
    }
    encs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::MockSender;
    use crate::types::jid::{servers, HOSTED_DEVICE_ID};

    /// A full peer with their own store, for producing real pre-key bundle
    /// responses and decrypting what the relay emits.
    struct TestPeer {
        creds: Arc<RwLock<Credentials>>,
        store: Arc<SignalStore>,
        cipher: SessionCipher,
    }

    impl TestPeer {
        async fn new() -> Self {
            let store = SignalStore::new(Arc::new(MemoryStore::new()));
            let creds = Arc::new(RwLock::new(Credentials::generate()));
            Self {
                cipher: SessionCipher::new(store.clone(), creds.clone()),
                store,
                creds,
            }
        }

        async fn bundle_node(&self, wire_jid: &Jid) -> Node {
            let mut creds = self.creds.write().await;
            let pre_key = self
                .store
                .generate_and_store_pre_keys(&mut creds, 1)
                .await
                .unwrap()
                .remove(0);

            fn bytes_node(tag: &str, bytes: Vec<u8>) -> Node {
                let mut n = Node::new(tag);
                n.set_bytes(bytes);
                n
            }
            fn id_bytes(id: u32) -> Vec<u8> {
                id.to_be_bytes()[1..].to_vec()
            }

            Node::new("user").attr("jid", wire_jid.clone()).children(vec![
                bytes_node(
                    "registration",
                    (creds.registration_id as u32).to_be_bytes().to_vec(),
                ),
                bytes_node("identity", creds.identity_key.public.to_vec()),
                bytes_node("vident", creds.identity_key.verifying_key().to_vec()),
                Node::new("skey").children(vec![
                    bytes_node("id", id_bytes(creds.signed_pre_key.key_id)),
                    bytes_node("value", creds.signed_pre_key.key_pair.public.to_vec()),
                    bytes_node("signature", creds.signed_pre_key.signature.to_vec()),
                ]),
                Node::new("key").children(vec![
                    bytes_node("id", id_bytes(pre_key.key_id)),
                    bytes_node("value", pre_key.key_pair.public.to_vec()),
                ]),
            ])
        }
    }

    struct StaticGroupMeta(GroupInfo);

    impl GroupMetaSource for StaticGroupMeta {
        fn group_info(&self, _jid: &Jid) -> BoxFuture<'_, Result<GroupInfo, ConnError>> {
            let info = self.0.clone();
            Box::pin(async move { Ok(info) })
        }
    }

    struct Fixture {
        relay: MessageRelay,
        sender: Arc<MockSender>,
        store: Arc<SignalStore>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    async fn fixture(group: Option<GroupInfo>) -> Fixture {
        let store = SignalStore::new(Arc::new(MemoryStore::new()));
        let mut creds_inner = Credentials::generate();
        creds_inner.me = Some(Jid::new("15550009999", servers::DEFAULT_USER));
        creds_inner.account = Some(vec![0xDD; 32]);
        creds_inner.registered = true;
        let creds = Arc::new(RwLock::new(creds_inner));

        let sender = Arc::new(MockSender::new());
        let resolver = Arc::new(DeviceResolver::new(
            store.clone(),
            creds.clone(),
            sender.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let prekeys = PreKeyManager::new(
            store.clone(),
            creds.clone(),
            sender.clone(),
            events_tx.clone(),
        );
        let relay = MessageRelay::new(
            store.clone(),
            creds,
            resolver,
            sender.clone(),
            prekeys,
            events_tx,
            group.map(|g| Arc::new(StaticGroupMeta(g)) as Arc<dyn GroupMetaSource>),
        );
        Fixture {
            relay,
            sender,
            store,
            events: events_rx,
        }
    }

    fn text(body: &str) -> wa::Message {
        wa::Message {
            conversation: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn usync_reply_for(users: Vec<(String, Vec<u16>)>) -> Node {
        let user_nodes = users
            .into_iter()
            .map(|(user, devices)| {
                let device_nodes = devices
                    .into_iter()
                    .map(|d| Node::new("device").attr("id", d as i64))
                    .collect();
                Node::new("user")
                    .attr("jid", Jid::new(user, servers::DEFAULT_USER))
                    .children(vec![Node::new("devices").children(vec![
                        Node::new("device-list").children(device_nodes),
                    ])])
            })
            .collect();
        Node::new("iq").attr("type", "result").children(vec![
            Node::new("usync").children(vec![Node::new("list").children(user_nodes)]),
        ])
    }

    fn sent_message_stanza(sender: &MockSender) -> Node {
        sender
            .sent()
            .into_iter()
            .find(|n| n.tag == "message")
            .expect("a message stanza was sent")
    }

    fn enc_nodes(stanza: &Node) -> Vec<Node> {
        collect_enc_children(stanza).into_iter().cloned().collect()
    }

    /// 1:1 text to a new contact: one USync, one key fetch, pkmsg for the
    /// recipient plus msg/pkmsg for the own secondary device, and a
    /// device-identity child.
    #[tokio::test]
    async fn test_dm_to_new_contact() {
        let fx = fixture(None).await;
        let contact = TestPeer::new().await;
        let own_other = TestPeer::new().await;

        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551234567".to_string(), vec![0]),
                ("15550009999".to_string(), vec![0, 2]),
            ]))
        });
        let contact_bundle = contact
            .bundle_node(&Jid::new("15551234567", servers::DEFAULT_USER))
            .await;
        let own_bundle = own_other
            .bundle_node(&Jid::with_device("15550009999", 2, servers::DEFAULT_USER))
            .await;
        fx.sender.respond_to("key", move |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(vec![contact_bundle.clone(), own_bundle.clone()]),
            ]))
        });

        let to = Jid::new("15551234567", servers::DEFAULT_USER);
        let receipt = fx
            .relay
            .send_message(to.clone(), text("hi"), SendOptions::default())
            .await
            .unwrap();
        assert!(!receipt.id.is_empty());

        let queried = fx.sender.queried();
        assert_eq!(
            queried
                .iter()
                .filter(|n| n.get_child_by_tag("usync").is_some())
                .count(),
            1
        );
        assert_eq!(
            queried
                .iter()
                .filter(|n| n.get_child_by_tag("key").is_some())
                .count(),
            1
        );

        let stanza = sent_message_stanza(&fx.sender);
        assert_eq!(stanza.get_attr_str("type"), Some("text"));
        assert!(stanza.get_attr_str("phash").unwrap().starts_with("2:"));

        let encs = enc_nodes(&stanza);
        assert_eq!(encs.len(), 2, "recipient + own secondary device");
        assert!(encs
            .iter()
            .all(|e| e.get_attr_str("type") == Some("pkmsg")));
        assert!(stanza.get_child_by_tag("device-identity").is_some());

        // The recipient can actually decrypt their copy.
        let their_enc = {
            let participants = stanza.get_child_by_tag("participants").unwrap();
            participants
                .get_children_by_tag("to")
                .into_iter()
                .find(|n| n.get_attr_jid("jid").unwrap().user == "15551234567")
                .unwrap()
                .get_child_by_tag("enc")
                .unwrap()
                .clone()
        };
        let padded = contact
            .cipher
            .decrypt(
                "15550009999.0",
                EncType::PreKey,
                their_enc.get_bytes().unwrap(),
            )
            .await
            .unwrap();
        let plaintext = wa::unpad_wa_message(&padded).unwrap();
        let decoded = wa::Message::decode(plaintext).unwrap();
        assert_eq!(decoded.conversation.as_deref(), Some("hi"));
    }

    /// Second send to the same contact is a plain msg with no USync or key
    /// fetch and no device identity.
    #[tokio::test]
    async fn test_dm_second_send_uses_existing_session() {
        let fx = fixture(None).await;
        let contact = TestPeer::new().await;

        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551234567".to_string(), vec![0]),
                ("15550009999".to_string(), vec![0]),
            ]))
        });
        let bundle = contact
            .bundle_node(&Jid::new("15551234567", servers::DEFAULT_USER))
            .await;
        fx.sender.respond_to("key", move |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(vec![bundle.clone()]),
            ]))
        });

        let to = Jid::new("15551234567", servers::DEFAULT_USER);
        fx.relay
            .send_message(to.clone(), text("first"), SendOptions::default())
            .await
            .unwrap();

        // Peer processes the pkmsg so their reply confirms the session; we
        // only need our side: second send reuses the pending session.
        let queries_after_first = fx.sender.queried().len();
        fx.relay
            .send_message(to, text("second"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(fx.sender.queried().len(), queries_after_first);
    }

    fn group_info(participants: &[&str]) -> GroupInfo {
        GroupInfo {
            jid: Jid::new("123-456", servers::GROUP),
            participants: participants
                .iter()
                .map(|u| Jid::new(*u, servers::DEFAULT_USER))
                .collect(),
            addressing_mode: AddressingMode::Pn,
            ephemeral: None,
        }
    }

    async fn group_fixture() -> (Fixture, Jid) {
        let fx = fixture(Some(group_info(&[
            "15551111111",
            "15552222222",
            "15553333333",
        ])))
        .await;

        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551111111".to_string(), vec![0]),
                ("15552222222".to_string(), vec![0]),
                ("15553333333".to_string(), vec![0]),
                ("15550009999".to_string(), vec![0]),
            ]))
        });

        // One bundle per participant device, generated on demand.
        let peers = [
            ("15551111111", TestPeer::new().await),
            ("15552222222", TestPeer::new().await),
            ("15553333333", TestPeer::new().await),
        ];
        let mut bundles = Vec::new();
        for (user, peer) in &peers {
            bundles.push(
                peer.bundle_node(&Jid::new(*user, servers::DEFAULT_USER))
                    .await,
            );
        }
        fx.sender.respond_to("key", move |query| {
            let wanted: Vec<Jid> = query
                .get_child_by_tag("key")
                .map(|k| {
                    k.get_children_by_tag("user")
                        .iter()
                        .filter_map(|u| u.get_attr_jid("jid"))
                        .collect()
                })
                .unwrap_or_default();
            let selected: Vec<Node> = bundles
                .iter()
                .filter(|b| {
                    b.get_attr_jid("jid")
                        .map(|j| wanted.iter().any(|w| w.user == j.user))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(selected),
            ]))
        });

        (fx, Jid::new("123-456", servers::GROUP))
    }

    /// Group send: first stanza distributes the sender key to everyone,
    /// the immediate second send carries only the skmsg.
    #[tokio::test]
    async fn test_group_send_skdm_replay_avoidance() {
        let (fx, group) = group_fixture().await;

        fx.relay
            .send_message(group.clone(), text("a"), SendOptions::default())
            .await
            .unwrap();
        let first = sent_message_stanza(&fx.sender);
        assert_eq!(first.get_attr_str("addressing_mode"), Some("pn"));

        let participants = first.get_child_by_tag("participants").unwrap();
        assert_eq!(participants.get_children_by_tag("to").len(), 3);
        let skmsg = first.get_children_by_tag("enc");
        assert_eq!(skmsg.len(), 1);
        assert_eq!(skmsg[0].get_attr_str("type"), Some("skmsg"));

        // Sender-key memory now covers the three participant devices.
        let memory = fx.store.get_sender_key_memory(&group.to_string()).unwrap();
        assert_eq!(memory.len(), 3);

        fx.relay
            .send_message(group.clone(), text("b"), SendOptions::default())
            .await
            .unwrap();
        let second = fx
            .sender
            .sent()
            .into_iter()
            .filter(|n| n.tag == "message")
            .nth(1)
            .unwrap();
        assert!(second.get_child_by_tag("participants").is_none());
        let encs = second.get_children_by_tag("enc");
        assert_eq!(encs.len(), 1);
        assert_eq!(encs[0].get_attr_str("type"), Some("skmsg"));
    }

    /// Evicting the sender-key memory re-distributes on the next send.
    #[tokio::test]
    async fn test_group_redistributes_after_memory_eviction() {
        let (fx, group) = group_fixture().await;

        fx.relay
            .send_message(group.clone(), text("a"), SendOptions::default())
            .await
            .unwrap();
        fx.store
            .clear_sender_key_memory(&group.to_string())
            .await
            .unwrap();

        fx.relay
            .send_message(group.clone(), text("b"), SendOptions::default())
            .await
            .unwrap();
        let second = fx
            .sender
            .sent()
            .into_iter()
            .filter(|n| n.tag == "message")
            .nth(1)
            .unwrap();
        assert!(second.get_child_by_tag("participants").is_some());
    }

    /// Group retry-resend: the skmsg is encrypted for the one participant
    /// only, carries the retry count, and leaves sender-key memory alone.
    #[tokio::test]
    async fn test_group_retry_resend_scoped_to_participant() {
        let (fx, group) = group_fixture().await;

        fx.relay
            .send_message(group.clone(), text("a"), SendOptions::default())
            .await
            .unwrap();
        let memory_before = fx.store.get_sender_key_memory(&group.to_string()).unwrap();

        let retry_jid = Jid::with_device("15552222222", 0, servers::DEFAULT_USER);
        fx.relay
            .send_message(
                group.clone(),
                text("a"),
                SendOptions {
                    retry: Some(RetryParticipant {
                        jid: retry_jid.clone(),
                        count: 3,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retry_stanza = fx
            .sender
            .sent()
            .into_iter()
            .filter(|n| n.tag == "message")
            .nth(1)
            .unwrap();

        // No broadcast skmsg child: everything sits under the one <to>.
        assert!(retry_stanza.get_children_by_tag("enc").is_empty());
        let participants = retry_stanza.get_child_by_tag("participants").unwrap();
        let to_nodes = participants.get_children_by_tag("to");
        assert_eq!(to_nodes.len(), 1);
        assert_eq!(to_nodes[0].get_attr_jid("jid"), Some(retry_jid));

        // The recomputed SKDM and the skmsg both target that participant;
        // the skmsg carries the retry count.
        let skmsg: Vec<&Node> = to_nodes[0]
            .get_children_by_tag("enc")
            .into_iter()
            .filter(|e| e.get_attr_str("type") == Some("skmsg"))
            .collect();
        assert_eq!(skmsg.len(), 1);
        assert_eq!(skmsg[0].get_attr_str("count"), Some("3"));
        assert!(to_nodes[0]
            .get_children_by_tag("enc")
            .iter()
            .any(|e| e.get_attr_str("type") != Some("skmsg")));

        // Sender-key memory is untouched by the retry.
        let memory_after = fx.store.get_sender_key_memory(&group.to_string()).unwrap();
        assert_eq!(memory_after, memory_before);
    }

    #[tokio::test]
    async fn test_per_recipient_patch_rejected_in_group() {
        let (fx, group) = group_fixture().await;

        struct BadPatcher;
        impl MessagePatcher for BadPatcher {
            fn patch(&self, _m: &wa::Message, _r: &[Jid]) -> PatchResult {
                PatchResult::PerRecipient(HashMap::new())
            }
        }

        let err = fx
            .relay
            .send_message(
                group,
                text("x"),
                SendOptions {
                    patcher: Some(Arc::new(BadPatcher)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PerRecipientPatchInGroup));
    }

    #[tokio::test]
    async fn test_hosted_and_reserved_devices_excluded() {
        let fx = fixture(None).await;
        let contact = TestPeer::new().await;

        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551234567".to_string(), vec![0, HOSTED_DEVICE_ID]),
                ("15550009999".to_string(), vec![0]),
            ]))
        });
        let bundle = contact
            .bundle_node(&Jid::new("15551234567", servers::DEFAULT_USER))
            .await;
        fx.sender.respond_to("key", move |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(vec![bundle.clone()]),
            ]))
        });

        fx.relay
            .send_message(
                Jid::new("15551234567", servers::DEFAULT_USER),
                text("hi"),
                SendOptions::default(),
            )
            .await
            .unwrap();

        let stanza = sent_message_stanza(&fx.sender);
        let encs = enc_nodes(&stanza);
        // Device 99 never receives a ciphertext.
        assert_eq!(encs.len(), 1);
    }

    #[tokio::test]
    async fn test_newsletter_send_is_plaintext() {
        let fx = fixture(None).await;
        let to = Jid::new("12034567", servers::NEWSLETTER);
        fx.relay
            .send_message(to, text("public"), SendOptions::default())
            .await
            .unwrap();

        let stanza = sent_message_stanza(&fx.sender);
        assert!(stanza.get_child_by_tag("plaintext").is_some());
        assert!(stanza.get_child_by_tag("participants").is_none());
        assert!(enc_nodes(&stanza).is_empty());
    }

    #[tokio::test]
    async fn test_retry_resend_single_recipient_with_count() {
        let fx = fixture(None).await;
        let contact = TestPeer::new().await;

        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551234567".to_string(), vec![0]),
                ("15550009999".to_string(), vec![0]),
            ]))
        });
        let bundle = contact
            .bundle_node(&Jid::new("15551234567", servers::DEFAULT_USER))
            .await;
        fx.sender.respond_to("key", move |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(vec![bundle.clone()]),
            ]))
        });

        let to = Jid::new("15551234567", servers::DEFAULT_USER);
        fx.relay
            .send_message(to.clone(), text("original"), SendOptions::default())
            .await
            .unwrap();

        fx.relay
            .send_message(
                to.clone(),
                text("again"),
                SendOptions {
                    retry: Some(RetryParticipant {
                        jid: Jid::with_device("15551234567", 0, servers::DEFAULT_USER),
                        count: 2,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retry_stanza = fx
            .sender
            .sent()
            .into_iter()
            .filter(|n| n.tag == "message")
            .nth(1)
            .unwrap();
        let encs = enc_nodes(&retry_stanza);
        assert_eq!(encs.len(), 1);
        assert_eq!(encs[0].get_attr_str("count"), Some("2"));
        // Retry stanzas carry no participant hash.
        assert!(retry_stanza.get_attr_str("phash").is_none());
    }

    #[tokio::test]
    async fn test_reaction_hides_decrypt_fail() {
        let fx = fixture(None).await;
        let contact = TestPeer::new().await;
        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551234567".to_string(), vec![0]),
                ("15550009999".to_string(), vec![0]),
            ]))
        });
        let bundle = contact
            .bundle_node(&Jid::new("15551234567", servers::DEFAULT_USER))
            .await;
        fx.sender.respond_to("key", move |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(vec![bundle.clone()]),
            ]))
        });

        let reaction = wa::Message {
            reaction_message: Some(wa::ReactionMessage {
                target_message_id: Some("ABC".into()),
                text: Some("👍".into()),
            }),
            ..Default::default()
        };
        fx.relay
            .send_message(
                Jid::new("15551234567", servers::DEFAULT_USER),
                reaction,
                SendOptions::default(),
            )
            .await
            .unwrap();

        let stanza = sent_message_stanza(&fx.sender);
        assert_eq!(stanza.get_attr_str("type"), Some("reaction"));
        assert_eq!(stanza.get_attr_str("decrypt-fail"), Some("hide"));
    }

    /// Bad-MAC on inbound: the frame is surfaced as undecryptable, the
    /// session validity cache cleared, and a critical audit scheduled.
    #[tokio::test]
    async fn test_incoming_bad_mac_recovery() {
        let mut fx = fixture(None).await;
        let contact = TestPeer::new().await;

        fx.sender.respond_to("usync", |_| {
            Some(usync_reply_for(vec![
                ("15551234567".to_string(), vec![0]),
                ("15550009999".to_string(), vec![0]),
            ]))
        });
        let bundle = contact
            .bundle_node(&Jid::new("15551234567", servers::DEFAULT_USER))
            .await;
        fx.sender.respond_to("key", move |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("list").children(vec![bundle.clone()]),
            ]))
        });
        // The critical audit will query the count.
        fx.sender.respond_to("count", |_| {
            Some(Node::new("iq").attr("type", "result").children(vec![
                Node::new("count").attr("value", 50i64),
            ]))
        });

        // Establish a session by sending once and let the contact process
        // the pre-key message.
        let to = Jid::new("15551234567", servers::DEFAULT_USER);
        fx.relay
            .send_message(to, text("hello"), SendOptions::default())
            .await
            .unwrap();
        let stanza = sent_message_stanza(&fx.sender);
        let our_enc = enc_nodes(&stanza).remove(0);
        contact
            .cipher
            .decrypt(
                "15550009999.0",
                EncType::PreKey,
                our_enc.get_bytes().unwrap(),
            )
            .await
            .unwrap();

        // The contact replies, but the MAC byte is flipped in transit.
        let (_, mut reply_wire) = contact
            .cipher
            .encrypt("15550009999.0", b"tampered reply")
            .await
            .unwrap();
        let last = reply_wire.len() - 1;
        reply_wire[last] ^= 0x01;

        let mut enc = Node::new("enc").attr("v", "2").attr("type", "msg");
        enc.set_bytes(reply_wire);
        let stanza = Node::new("message")
            .attr("id", "XYZ")
            .attr("from", Jid::new("15551234567", servers::DEFAULT_USER))
            .children(vec![enc]);

        fx.relay.handle_incoming(stanza).await;

        // Undecryptable surfaced; session validity cleared.
        let mut saw_undecryptable = false;
        while let Ok(event) = fx.events.try_recv() {
            if matches!(event, Event::Undecryptable(_)) {
                saw_undecryptable = true;
            }
        }
        assert!(saw_undecryptable);
        assert!(!fx
            .relay
            .resolver
            .session_validity_cached("15551234567.0"));
    }

    #[test]
    fn test_participant_hash_is_order_insensitive() {
        let a = Jid::new("15551111111", servers::DEFAULT_USER);
        let b = Jid::new("15552222222", servers::DEFAULT_USER);
        let h1 = participant_hash(&[a.clone(), b.clone()]);
        let h2 = participant_hash(&[b, a]);
        assert_eq!(h1, h2);
        assert!(h1.starts_with("2:"));
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(message_stanza_type(&text("x")), "text");

        let media = wa::Message {
            image_message: Some(wa::MediaMessage::default()),
            ..Default::default()
        };
        assert_eq!(message_stanza_type(&media), "media");
        assert_eq!(media_type(&media), Some("image"));

        let poll = wa::Message {
            poll_creation_message: Some(wa::PollCreationMessage::default()),
            ..Default::default()
        };
        assert_eq!(message_stanza_type(&poll), "poll");
    }

    #[test]
    fn test_generated_message_ids_unique() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with("3EB0"));
        assert_eq!(a.len(), 4 + 18);
    }
}
