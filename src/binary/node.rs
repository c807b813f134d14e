//! Binary XML node type.
//!
//! Stanzas are trees of nodes: a tag, a flat attribute map, and either
//! child nodes or a byte payload.

use std::collections::HashMap;

use crate::types::Jid;

/// Attributes of a node.
pub type Attrs = HashMap<String, AttrValue>;

/// Possible values for node attributes.
///
/// Integers and booleans are carried as their decimal/literal string form
/// on the wire, so the string variant is canonical for scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Jid(Jid),
    Bytes(Vec<u8>),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<u32> for AttrValue {
    fn from(n: u32) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::String(if b { "true" } else { "false" }.to_string())
    }
}

impl From<Jid> for AttrValue {
    fn from(jid: Jid) -> Self {
        AttrValue::Jid(jid)
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_jid(&self) -> Option<&Jid> {
        match self {
            AttrValue::Jid(jid) => Some(jid),
            _ => None,
        }
    }
}

/// A binary XML element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

/// Content of a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NodeContent {
    #[default]
    None,
    Children(Vec<Node>),
    Bytes(Vec<u8>),
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::None,
        }
    }

    /// Builder-style attribute setter.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style children setter.
    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Builder-style byte-content setter.
    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn get_attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn get_attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }

    pub fn get_attr_int(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(|v| v.as_int())
    }

    /// Returns the attribute as a JID, parsing string attributes on demand.
    pub fn get_attr_jid(&self, key: &str) -> Option<Jid> {
        match self.attrs.get(key)? {
            AttrValue::Jid(jid) => Some(jid.clone()),
            AttrValue::String(s) => s.parse().ok(),
            AttrValue::Bytes(_) => None,
        }
    }

    pub fn add_child(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Children(children) => children.push(child),
            _ => self.content = NodeContent::Children(vec![child]),
        }
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.content = NodeContent::Bytes(bytes);
    }

    pub fn set_children(&mut self, children: Vec<Node>) {
        self.content = NodeContent::Children(children);
    }

    pub fn get_children(&self) -> Option<&[Node]> {
        match &self.content {
            NodeContent::Children(children) => Some(children),
            _ => None,
        }
    }

    pub fn get_children_by_tag(&self, tag: &str) -> Vec<&Node> {
        match &self.content {
            NodeContent::Children(children) => children.iter().filter(|n| n.tag == tag).collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.get_children_by_tag(tag).into_iter().next()
    }

    /// Walks through nested tags, returning the innermost node if the full
    /// path exists.
    pub fn get_optional_child_by_tag(&self, tags: &[&str]) -> Option<&Node> {
        let mut current = self;
        for tag in tags {
            current = current.get_child_by_tag(tag)?;
        }
        Some(current)
    }

    pub fn get_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let node = Node::new("message").attr("id", "123").attr("type", "text");

        assert_eq!(node.tag, "message");
        assert_eq!(node.get_attr_str("id"), Some("123"));
        assert_eq!(node.get_attr_str("type"), Some("text"));
    }

    #[test]
    fn test_node_children() {
        let mut parent = Node::new("iq");
        parent.add_child(Node::new("query"));
        parent.add_child(Node::new("result"));

        let children = parent.get_children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].tag, "query");
    }

    #[test]
    fn test_nested_lookup() {
        let node = Node::new("iq").children(vec![
            Node::new("usync").children(vec![Node::new("list").children(vec![Node::new("user")])])
        ]);

        assert!(node
            .get_optional_child_by_tag(&["usync", "list", "user"])
            .is_some());
        assert!(node.get_optional_child_by_tag(&["usync", "query"]).is_none());
    }

    #[test]
    fn test_int_attr_is_stringly() {
        let node = Node::new("retry").attr("count", 2i64);
        assert_eq!(node.get_attr_str("count"), Some("2"));
        assert_eq!(node.get_attr_int("count"), Some(2));
    }
}
