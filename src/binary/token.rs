//! Token dictionary for binary XML compression (dictionary version 3).
//!
//! Common tags, attribute names and values are sent as a one-byte index
//! into this table instead of a length-prefixed string.

use std::collections::HashMap;

/// Single-byte tokens. Index 0 is reserved for the empty-list marker.
pub static SINGLE_BYTE_TOKENS: &[&str] = &[
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.whatsapp.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "notification",
    "status",
    "jid",
    "broadcast",
    "user",
    "devices",
    "device_hash",
    "to",
    "offline",
    "message",
    "result",
    "class",
    "xmlns",
    "duration",
    "notify",
    "iq",
    "t",
    "ack",
    "g.us",
    "enc",
    "presence",
    "config_value",
    "picture",
    "error",
    "catch-up",
    "contact",
    "mediatype",
    "routing_info",
    "edge_routing",
    "get",
    "read",
    "urn:xmpp:ping",
    "0",
    "chatstate",
    "unavailable",
    "skmsg",
    "composing",
    "handshake",
    "device-list",
    "media",
    "text",
    "device",
    "creation",
    "location",
    "config",
    "item",
    "count",
    "image",
    "business",
    "2",
    "hostname",
    "display_name",
    "platform",
    "success",
    "msg",
    "offline_preview",
    "prop",
    "key-index",
    "v",
    "pkmsg",
    "version",
    "1",
    "ping",
    "w:p",
    "download",
    "video",
    "set",
    "props",
    "primary",
    "unknown",
    "hash",
    "last",
    "subscribe",
    "call",
    "profile",
    "sticker",
    "mode",
    "participants",
    "value",
    "query",
    "code",
    "offline_batch",
    "usync",
    "index",
    "context",
    "sid",
    "list",
    "encrypt",
    "registration",
    "identity",
    "skey",
    "key",
    "signature",
    "lid",
    "device-identity",
    "plaintext",
    "audio",
    "document",
    "retry",
    "pair-device",
    "pair-success",
    "ref",
    "companion_hello",
    "stream:error",
    "ib",
    "edit",
    "expiration",
    "phash",
    "decrypt-fail",
    "addressing_mode",
    "newsletter",
    "add",
    "remove",
    "groups",
    "w:g2",
    "member_add_mode",
    "announcement",
    "not_announcement",
    "locked",
    "unlocked",
    "delete",
    "reason",
    "stage",
    "link_code_companion_reg",
    "companion_server_auth_token_and_link_code",
    "link_code_pairing_wrapped_companion_ephemeral_pub",
    "link_code_pairing_ref",
];

lazy_static::lazy_static! {
    static ref TOKEN_INDEX: HashMap<&'static str, u8> = {
        let mut map = HashMap::with_capacity(SINGLE_BYTE_TOKENS.len());
        // Skip index 0: it is the empty-list marker, never a string token.
        for (i, token) in SINGLE_BYTE_TOKENS.iter().enumerate().skip(1) {
            map.insert(*token, i as u8);
        }
        map
    };
}

/// Looks up the index for a string, if it is in the dictionary.
pub fn index_of(s: &str) -> Option<u8> {
    TOKEN_INDEX.get(s).copied()
}

/// Looks up the string for a token index.
pub fn token_at(index: u8) -> Option<&'static str> {
    if index == 0 {
        return None;
    }
    SINGLE_BYTE_TOKENS.get(index as usize).copied()
}
