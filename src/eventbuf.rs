//! Event coalescing during initial sync.
//!
//! From the moment credentials are known until the first offline batch
//! completes, application-state events are buffered and merged so history
//! sync lands as one coherent flush. Connection updates always pass
//! through unbuffered.

use log::debug;
use tokio::sync::mpsc;

use crate::types::events::{
    ChatUpsert, ContactUpsert, CredsUpdate, Event, IncomingMessage, Receipt,
};

/// Buffers session events and flushes them in a deterministic order:
/// creds, chats, contacts, messages, receipts.
pub struct EventBuffer {
    out: mpsc::UnboundedSender<Event>,
    buffering: bool,
    creds: Option<CredsUpdate>,
    chats: Vec<ChatUpsert>,
    contacts: Vec<ContactUpsert>,
    messages: Vec<IncomingMessage>,
    receipts: Vec<Receipt>,
}

impl EventBuffer {
    pub fn new(out: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            out,
            buffering: false,
            creds: None,
            chats: Vec::new(),
            contacts: Vec::new(),
            messages: Vec::new(),
            receipts: Vec::new(),
        }
    }

    /// Start buffering; called when credentials become known.
    pub fn start(&mut self) {
        self.buffering = true;
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Emit or buffer one event.
    pub fn emit(&mut self, event: Event) {
        if !self.buffering {
            let _ = self.out.send(event);
            return;
        }
        match event {
            // Connection lifecycle is never delayed.
            Event::Connection(_) | Event::ReconnectFailed => {
                let _ = self.out.send(event);
            }
            Event::Creds(update) => match &mut self.creds {
                Some(merged) => merged.merge(update),
                None => self.creds = Some(update),
            },
            Event::Chats(chats) => {
                for chat in chats {
                    merge_by_key(&mut self.chats, chat, |c| c.jid.clone(), merge_chat);
                }
            }
            Event::Contacts(contacts) => {
                for contact in contacts {
                    merge_by_key(&mut self.contacts, contact, |c| c.jid.clone(), merge_contact);
                }
            }
            Event::Message(message) => {
                // Same-id duplicates: latest wins.
                if let Some(existing) = self
                    .messages
                    .iter_mut()
                    .find(|m| m.info.id == message.info.id && m.info.chat == message.info.chat)
                {
                    *existing = *message;
                } else {
                    self.messages.push(*message);
                }
            }
            Event::Receipt(receipt) => {
                // Union-merge message-id lists for the same chat + type.
                if let Some(existing) = self.receipts.iter_mut().find(|r| {
                    r.chat == receipt.chat
                        && r.sender == receipt.sender
                        && r.receipt_type == receipt.receipt_type
                }) {
                    for id in receipt.message_ids {
                        if !existing.message_ids.contains(&id) {
                            existing.message_ids.push(id);
                        }
                    }
                    existing.timestamp = existing.timestamp.max(receipt.timestamp);
                } else {
                    self.receipts.push(receipt);
                }
            }
            other => {
                let _ = self.out.send(other);
            }
        }
    }

    /// Flush everything buffered, in order, and stop buffering.
    pub fn flush(&mut self) -> usize {
        let mut count = 0;
        if let Some(creds) = self.creds.take() {
            let _ = self.out.send(Event::Creds(creds));
            count += 1;
        }
        if !self.chats.is_empty() {
            count += self.chats.len();
            let _ = self.out.send(Event::Chats(std::mem::take(&mut self.chats)));
        }
        if !self.contacts.is_empty() {
            count += self.contacts.len();
            let _ = self
                .out
                .send(Event::Contacts(std::mem::take(&mut self.contacts)));
        }
        for message in std::mem::take(&mut self.messages) {
            let _ = self.out.send(Event::Message(Box::new(message)));
            count += 1;
        }
        for receipt in std::mem::take(&mut self.receipts) {
            let _ = self.out.send(Event::Receipt(receipt));
            count += 1;
        }
        self.buffering = false;
        debug!("flushed {count} buffered events");
        let _ = self.out.send(Event::OfflineBatchDone { count });
        count
    }
}

fn merge_by_key<T, K, F>(items: &mut Vec<T>, incoming: T, key: impl Fn(&T) -> K, merge: F)
where
    K: PartialEq,
    F: Fn(&mut T, T),
{
    let incoming_key = key(&incoming);
    match items.iter_mut().find(|item| key(item) == incoming_key) {
        Some(existing) => merge(existing, incoming),
        None => items.push(incoming),
    }
}

fn merge_chat(existing: &mut ChatUpsert, incoming: ChatUpsert) {
    if incoming.name.is_some() {
        existing.name = incoming.name;
    }
    if incoming.unread_count.is_some() {
        existing.unread_count = incoming.unread_count;
    }
    if incoming.last_message_timestamp.is_some() {
        existing.last_message_timestamp = incoming.last_message_timestamp;
    }
}

fn merge_contact(existing: &mut ContactUpsert, incoming: ContactUpsert) {
    if incoming.notify.is_some() {
        existing.notify = incoming.notify;
    }
    if incoming.full_name.is_some() {
        existing.full_name = incoming.full_name;
    }
}

/// Convenience: drain a receiver into a map of event-kind counts, test use.
#[cfg(test)]
pub(crate) fn drain_kinds(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match event {
            Event::Connection(_) => "connection",
            Event::Creds(_) => "creds",
            Event::Chats(_) => "chats",
            Event::Contacts(_) => "contacts",
            Event::Message(_) => "message",
            Event::Receipt(_) => "receipt",
            Event::Undecryptable(_) => "undecryptable",
            Event::ReconnectFailed => "reconnect-failed",
            Event::OfflineBatchDone { .. } => "offline-batch-done",
        });
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::events::{ConnectionState, ConnectionUpdate, MessageInfo, ReceiptType};
    use crate::types::jid::servers;
    use crate::types::Jid;

    fn message(id: &str, body: &str) -> Event {
        Event::Message(Box::new(IncomingMessage {
            info: MessageInfo {
                id: id.to_string(),
                sender: Jid::new("15551234567", servers::DEFAULT_USER),
                chat: Jid::new("15551234567", servers::DEFAULT_USER),
                is_from_me: false,
                is_group: false,
                timestamp: 0,
                push_name: None,
            },
            message: crate::proto::wa::Message {
                conversation: Some(body.to_string()),
                ..Default::default()
            },
        }))
    }

    #[test]
    fn test_passthrough_when_not_buffering() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);
        buffer.emit(message("A", "x"));
        assert_eq!(drain_kinds(&mut rx), vec!["message"]);
    }

    #[test]
    fn test_flush_order_is_deterministic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);
        buffer.start();

        buffer.emit(Event::Receipt(Receipt {
            message_ids: vec!["A".into()],
            chat: Jid::new("1555", servers::DEFAULT_USER),
            sender: Jid::new("1555", servers::DEFAULT_USER),
            receipt_type: ReceiptType::Read,
            timestamp: 5,
        }));
        buffer.emit(message("A", "x"));
        buffer.emit(Event::Contacts(vec![ContactUpsert {
            jid: Jid::new("1555", servers::DEFAULT_USER),
            notify: None,
            full_name: Some("Contact".into()),
        }]));
        buffer.emit(Event::Chats(vec![ChatUpsert {
            jid: Jid::new("1555", servers::DEFAULT_USER),
            name: Some("Chat".into()),
            unread_count: None,
            last_message_timestamp: None,
        }]));
        buffer.emit(Event::Creds(CredsUpdate {
            next_pre_key_id: Some(9),
            ..Default::default()
        }));

        assert!(drain_kinds(&mut rx).is_empty(), "nothing leaks mid-buffer");
        buffer.flush();
        assert_eq!(
            drain_kinds(&mut rx),
            vec![
                "creds",
                "chats",
                "contacts",
                "message",
                "receipt",
                "offline-batch-done"
            ]
        );
    }

    #[test]
    fn test_connection_updates_bypass_buffer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);
        buffer.start();
        buffer.emit(Event::Connection(ConnectionUpdate::state(
            ConnectionState::Open,
        )));
        assert_eq!(drain_kinds(&mut rx), vec!["connection"]);
    }

    #[test]
    fn test_same_key_events_merge_latest_wins() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);
        buffer.start();

        buffer.emit(Event::Chats(vec![ChatUpsert {
            jid: Jid::new("1555", servers::DEFAULT_USER),
            name: Some("Old".into()),
            unread_count: Some(1),
            last_message_timestamp: None,
        }]));
        buffer.emit(Event::Chats(vec![ChatUpsert {
            jid: Jid::new("1555", servers::DEFAULT_USER),
            name: Some("New".into()),
            unread_count: None,
            last_message_timestamp: Some(77),
        }]));
        buffer.emit(message("A", "first"));
        buffer.emit(message("A", "second"));

        buffer.flush();
        let mut chats = None;
        let mut body = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Chats(c) => chats = Some(c),
                Event::Message(m) => body = m.message.conversation.clone(),
                _ => {}
            }
        }
        let chats = chats.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name.as_deref(), Some("New"));
        assert_eq!(chats[0].unread_count, Some(1));
        assert_eq!(chats[0].last_message_timestamp, Some(77));
        assert_eq!(body.as_deref(), Some("second"));
    }

    #[test]
    fn test_receipts_union_merge_by_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = EventBuffer::new(tx);
        buffer.start();

        let chat = Jid::new("1555", servers::DEFAULT_USER);
        for ids in [vec!["A", "B"], vec!["B", "C"]] {
            buffer.emit(Event::Receipt(Receipt {
                message_ids: ids.into_iter().map(String::from).collect(),
                chat: chat.clone(),
                sender: chat.clone(),
                receipt_type: ReceiptType::Delivered,
                timestamp: 1,
            }));
        }
        buffer.flush();

        let mut receipt = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::Receipt(r) = event {
                receipt = Some(r);
            }
        }
        assert_eq!(receipt.unwrap().message_ids, vec!["A", "B", "C"]);
    }
}
