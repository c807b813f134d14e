//! Core protocol types.

pub mod events;
pub mod jid;

pub use jid::{servers, Jid, MessageId, ParseJidError, HOSTED_DEVICE_ID};
