//! Binary encoder: Node trees to wire bytes.

use crate::types::Jid;

use super::node::{AttrValue, Node, NodeContent};
use super::token;

pub(super) const AD_JID: u8 = 0xF7;
pub(super) const LIST_8: u8 = 0xF8;
pub(super) const LIST_16: u8 = 0xF9;
pub(super) const JID_PAIR: u8 = 0xFA;
pub(super) const BINARY_8: u8 = 0xFC;
pub(super) const BINARY_20: u8 = 0xFD;
pub(super) const BINARY_32: u8 = 0xFE;

/// Binary encoder for XML nodes.
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Encode a node and return the wire bytes.
    pub fn encode(node: &Node) -> Vec<u8> {
        let mut encoder = Self::new();
        encoder.write_node(node);
        encoder.data
    }

    fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn write_list_header(&mut self, len: usize) {
        if len < 256 {
            self.write_byte(LIST_8);
            self.write_byte(len as u8);
        } else {
            self.write_byte(LIST_16);
            self.write_byte((len >> 8) as u8);
            self.write_byte((len & 0xFF) as u8);
        }
    }

    fn write_string(&mut self, s: &str) {
        if let Some(index) = token::index_of(s) {
            self.write_byte(index);
            return;
        }
        self.write_binary(s.as_bytes());
    }

    fn write_binary(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 256 {
            self.write_byte(BINARY_8);
            self.write_byte(len as u8);
        } else if len < (1 << 20) {
            self.write_byte(BINARY_20);
            self.write_byte(((len >> 16) & 0x0F) as u8);
            self.write_byte(((len >> 8) & 0xFF) as u8);
            self.write_byte((len & 0xFF) as u8);
        } else {
            self.write_byte(BINARY_32);
            self.write_bytes(&(len as u32).to_be_bytes());
        }
        self.write_bytes(bytes);
    }

    fn write_jid(&mut self, jid: &Jid) {
        if jid.device > 0 || jid.is_lid() || jid.is_hosted() {
            self.write_byte(AD_JID);
            self.write_byte(jid.domain_type());
            self.write_byte(jid.device as u8);
            self.write_string(&jid.user);
        } else {
            self.write_byte(JID_PAIR);
            self.write_string(&jid.user);
            self.write_string(&jid.server);
        }
    }

    fn write_attr_value(&mut self, value: &AttrValue) {
        match value {
            AttrValue::String(s) => self.write_string(s),
            AttrValue::Jid(jid) => self.write_jid(jid),
            AttrValue::Bytes(b) => self.write_binary(b),
        }
    }

    fn write_node(&mut self, node: &Node) {
        let has_content = !matches!(node.content, NodeContent::None);
        let size = 1 + 2 * node.attrs.len() + usize::from(has_content);
        self.write_list_header(size);

        self.write_string(&node.tag);

        for (key, value) in &node.attrs {
            self.write_string(key);
            self.write_attr_value(value);
        }

        match &node.content {
            NodeContent::None => {}
            NodeContent::Children(children) => {
                self.write_list_header(children.len());
                for child in children {
                    self.write_node(child);
                }
            }
            NodeContent::Bytes(bytes) => self.write_binary(bytes),
        }
    }
}

/// Encode a node to its binary wire format.
pub fn encode(node: &Node) -> Vec<u8> {
    Encoder::encode(node)
}
