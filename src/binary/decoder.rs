//! Binary decoder: wire bytes to Node trees.

use crate::types::jid::{
    servers, HOSTED_DOMAIN, HOSTED_LID_DOMAIN, LID_DOMAIN, WHATSAPP_DOMAIN,
};
use crate::types::Jid;

use super::encoder::{AD_JID, BINARY_20, BINARY_32, BINARY_8, JID_PAIR, LIST_16, LIST_8};
use super::node::{AttrValue, Attrs, Node, NodeContent};
use super::token;

/// Error type for decoding.
#[derive(Debug, Clone, thiserror::Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

/// Binary decoder for XML nodes.
pub struct Decoder<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    /// Decode wire bytes into a node, requiring the full input be consumed.
    pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
        let mut decoder = Decoder::new(data);
        let node = decoder.read_node()?;

        if decoder.index != decoder.data.len() {
            return Err(DecodeError(format!(
                "{} leftover bytes after decoding",
                decoder.data.len() - decoder.index
            )));
        }

        Ok(node)
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        if self.index >= self.data.len() {
            return Err(DecodeError("unexpected end of data".into()));
        }
        let b = self.data[self.index];
        self.index += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, DecodeError> {
        if self.index + n > self.data.len() {
            return Err(DecodeError("unexpected end of data".into()));
        }
        let bytes = self.data[self.index..self.index + n].to_vec();
        self.index += n;
        Ok(bytes)
    }

    fn read_int(&mut self, bytes: usize) -> Result<usize, DecodeError> {
        let mut result = 0usize;
        for _ in 0..bytes {
            result = (result << 8) | (self.read_byte()? as usize);
        }
        Ok(result)
    }

    fn read_binary(&mut self, marker: u8) -> Result<Vec<u8>, DecodeError> {
        let len = match marker {
            BINARY_8 => self.read_byte()? as usize,
            BINARY_20 => self.read_int(3)? & 0x000F_FFFF,
            BINARY_32 => self.read_int(4)?,
            _ => return Err(DecodeError(format!("invalid binary marker 0x{marker:02x}"))),
        };
        self.read_bytes(len)
    }

    fn read_string(&mut self, marker: u8) -> Result<String, DecodeError> {
        match marker {
            BINARY_8 | BINARY_20 | BINARY_32 => {
                let bytes = self.read_binary(marker)?;
                String::from_utf8(bytes).map_err(|e| DecodeError(format!("invalid utf8: {e}")))
            }
            _ => token::token_at(marker)
                .map(str::to_string)
                .ok_or_else(|| DecodeError(format!("unknown token 0x{marker:02x}"))),
        }
    }

    fn read_jid(&mut self, marker: u8) -> Result<Jid, DecodeError> {
        match marker {
            JID_PAIR => {
                let user_marker = self.read_byte()?;
                let user = self.read_string(user_marker)?;
                let server_marker = self.read_byte()?;
                let server = self.read_string(server_marker)?;
                Ok(Jid::new(user, server))
            }
            AD_JID => {
                let domain = self.read_byte()?;
                let device = self.read_byte()? as u16;
                let user_marker = self.read_byte()?;
                let user = self.read_string(user_marker)?;
                let server = match domain {
                    WHATSAPP_DOMAIN => servers::DEFAULT_USER,
                    LID_DOMAIN => servers::HIDDEN_USER,
                    HOSTED_DOMAIN => servers::HOSTED,
                    HOSTED_LID_DOMAIN => servers::HOSTED_LID,
                    _ => {
                        return Err(DecodeError(format!("unknown JID domain {domain}")));
                    }
                };
                Ok(Jid::with_device(user, device, server))
            }
            _ => Err(DecodeError(format!("invalid JID marker 0x{marker:02x}"))),
        }
    }

    fn read_attr_value(&mut self) -> Result<AttrValue, DecodeError> {
        let marker = self.read_byte()?;
        match marker {
            JID_PAIR | AD_JID => Ok(AttrValue::Jid(self.read_jid(marker)?)),
            BINARY_8 | BINARY_20 | BINARY_32 => {
                // Attribute payloads are strings when valid UTF-8.
                let bytes = self.read_binary(marker)?;
                match String::from_utf8(bytes) {
                    Ok(s) => Ok(AttrValue::String(s)),
                    Err(e) => Ok(AttrValue::Bytes(e.into_bytes())),
                }
            }
            _ => Ok(AttrValue::String(self.read_string(marker)?)),
        }
    }

    fn read_list_size(&mut self, marker: u8) -> Result<usize, DecodeError> {
        match marker {
            0x00 => Ok(0),
            LIST_8 => Ok(self.read_byte()? as usize),
            LIST_16 => self.read_int(2),
            _ => Err(DecodeError(format!(
                "expected list marker, got 0x{marker:02x}"
            ))),
        }
    }

    fn read_node(&mut self) -> Result<Node, DecodeError> {
        let marker = self.read_byte()?;
        let size = self.read_list_size(marker)?;
        if size == 0 {
            return Err(DecodeError("empty list where node expected".into()));
        }

        let tag_marker = self.read_byte()?;
        let tag = self.read_string(tag_marker)?;

        let attr_pairs = (size - 1) / 2;
        let mut attrs = Attrs::with_capacity(attr_pairs);
        for _ in 0..attr_pairs {
            let key_marker = self.read_byte()?;
            let key = self.read_string(key_marker)?;
            let value = self.read_attr_value()?;
            attrs.insert(key, value);
        }

        let content = if (size - 1) % 2 == 1 {
            let content_marker = self.read_byte()?;
            match content_marker {
                LIST_8 | LIST_16 => {
                    let len = self.read_list_size(content_marker)?;
                    let mut children = Vec::with_capacity(len);
                    for _ in 0..len {
                        children.push(self.read_node()?);
                    }
                    NodeContent::Children(children)
                }
                BINARY_8 | BINARY_20 | BINARY_32 => {
                    NodeContent::Bytes(self.read_binary(content_marker)?)
                }
                _ => {
                    return Err(DecodeError(format!(
                        "invalid content marker 0x{content_marker:02x}"
                    )));
                }
            }
        } else {
            NodeContent::None
        };

        Ok(Node { tag, attrs, content })
    }
}

/// Decode binary data into a node.
pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
    Decoder::decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::encoder::encode;
    use crate::types::servers;

    fn roundtrip(node: &Node) -> Node {
        decode(&encode(node)).unwrap()
    }

    #[test]
    fn test_roundtrip_attrs_and_bytes() {
        let node = Node::new("message")
            .attr("id", "3EB0ABCD1234")
            .attr("type", "text")
            .bytes(vec![1, 2, 3, 4, 5]);

        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_roundtrip_nested_children() {
        let node = Node::new("iq").attr("type", "get").children(vec![
            Node::new("usync").children(vec![
                Node::new("query").children(vec![Node::new("devices"), Node::new("lid")]),
                Node::new("list"),
            ]),
        ]);

        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_roundtrip_jid_attrs() {
        let node = Node::new("to")
            .attr("jid", Jid::with_device("15551234567", 2, servers::DEFAULT_USER));
        assert_eq!(roundtrip(&node), node);

        let lid = Node::new("to").attr("jid", Jid::new("8123456", servers::HIDDEN_USER));
        assert_eq!(roundtrip(&lid), lid);
    }

    #[test]
    fn test_roundtrip_long_binary() {
        let node = Node::new("enc").bytes(vec![0xAB; 700]);
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_truncated_input_fails() {
        let node = Node::new("message").attr("id", "X");
        let mut encoded = encode(&node);
        encoded.truncate(encoded.len() - 1);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn test_leftover_bytes_fail() {
        let node = Node::new("ack");
        let mut encoded = encode(&node);
        encoded.push(0x00);
        assert!(decode(&encoded).is_err());
    }
}
