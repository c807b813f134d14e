//! Binary XML codec.
//!
//! The framed transport carries stanzas in a compact binary XML encoding
//! with a dictionary of common strings (version 3).

pub mod decoder;
pub mod encoder;
pub mod node;
pub mod token;

pub use decoder::{decode, DecodeError};
pub use encoder::encode;
pub use node::{AttrValue, Attrs, Node, NodeContent};
