//! Events emitted over the lifetime of a session.
//!
//! Connection lifecycle updates bypass the event buffer; everything that
//! feeds application state (creds, chats, contacts, messages, receipts) is
//! buffered during initial sync and flushed in a deterministic order.

use serde::{Deserialize, Serialize};

use crate::proto::wa;
use crate::types::Jid;

/// Coarse connection state surfaced on `ConnectionUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Reason a connection ended, surfaced on `ConnectionUpdate::last_disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    TimedOut,
    MultideviceMismatch,
    Forbidden,
    ConnectionReplaced,
}

impl DisconnectReason {
    /// Stream-error status code associated with this reason.
    pub fn status_code(&self) -> u16 {
        match self {
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::TimedOut => 408,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::Forbidden => 403,
            DisconnectReason::ConnectionReplaced => 440,
        }
    }

    /// Whether the supervisor may auto-reconnect after this reason.
    /// 401/403/419-class errors end the session for good.
    pub fn should_reconnect(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::LoggedOut
                | DisconnectReason::Forbidden
                | DisconnectReason::ConnectionReplaced
        )
    }

    /// Maps a `<stream:error>` code attribute to a reason.
    pub fn from_stream_error_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            403 => DisconnectReason::Forbidden,
            408 => DisconnectReason::TimedOut,
            411 => DisconnectReason::MultideviceMismatch,
            419 | 440 => DisconnectReason::ConnectionReplaced,
            _ => DisconnectReason::ConnectionClosed,
        }
    }
}

/// Connection lifecycle update.
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    /// Comma-joined QR payload ready to render, when pairing.
    pub qr: Option<String>,
    pub is_new_login: bool,
    pub last_disconnect: Option<DisconnectReason>,
}

impl ConnectionUpdate {
    pub fn state(state: ConnectionState) -> Self {
        Self {
            connection: Some(state),
            ..Default::default()
        }
    }

    pub fn closed(reason: DisconnectReason) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(reason),
            ..Default::default()
        }
    }
}

/// Partial credentials update; scalar fields follow latest-wins merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredsUpdate {
    pub me: Option<Jid>,
    pub lid: Option<Jid>,
    pub next_pre_key_id: Option<u32>,
    pub registered: Option<bool>,
    pub platform: Option<String>,
}

impl CredsUpdate {
    /// Merge another update on top of this one, latest scalar wins.
    pub fn merge(&mut self, other: CredsUpdate) {
        if other.me.is_some() {
            self.me = other.me;
        }
        if other.lid.is_some() {
            self.lid = other.lid;
        }
        if other.next_pre_key_id.is_some() {
            self.next_pre_key_id = other.next_pre_key_id;
        }
        if other.registered.is_some() {
            self.registered = other.registered;
        }
        if other.platform.is_some() {
            self.platform = other.platform;
        }
    }
}

/// Information about a delivered message.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub id: String,
    pub sender: Jid,
    pub chat: Jid,
    pub is_from_me: bool,
    pub is_group: bool,
    pub timestamp: i64,
    pub push_name: Option<String>,
}

/// A decrypted incoming message.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub info: MessageInfo,
    pub message: wa::Message,
}

/// Chat metadata upsert, produced during history sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatUpsert {
    pub jid: Jid,
    pub name: Option<String>,
    pub unread_count: Option<u32>,
    pub last_message_timestamp: Option<i64>,
}

/// Contact upsert, produced during history sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactUpsert {
    pub jid: Jid,
    pub notify: Option<String>,
    pub full_name: Option<String>,
}

/// Type of receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    Delivered,
    Read,
    Played,
    Server,
    Retry,
}

/// Receipt for message delivery/read status.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub message_ids: Vec<String>,
    pub chat: Jid,
    pub sender: Jid,
    pub receipt_type: ReceiptType,
    pub timestamp: i64,
}

/// All events a session emits.
#[derive(Debug, Clone)]
pub enum Event {
    Connection(ConnectionUpdate),
    Creds(CredsUpdate),
    Chats(Vec<ChatUpsert>),
    Contacts(Vec<ContactUpsert>),
    Message(Box<IncomingMessage>),
    Receipt(Receipt),
    /// A message arrived that could not be decrypted.
    Undecryptable(MessageInfo),
    /// All reconnect attempts were exhausted.
    ReconnectFailed,
    /// The first offline batch has been fully delivered.
    OfflineBatchDone { count: usize },
}
