//! wamd: WhatsApp Web Multi-Device Session Core
//!
//! The cryptographic transport and session layer of a WhatsApp Web
//! multi-device client: the Noise XX handshake that bootstraps a framed
//! channel over a WebSocket, the Signal-family end-to-end encryption stack
//! (1:1 double-ratchet and group sender-key sessions), the pre-key
//! lifecycle, the outbound fan-out relay and the connection supervisor.
//!
//! ## Modules
//!
//! - `types` - Core types like JID, events and disconnect reasons
//! - `binary` - Binary XML encoding/decoding
//! - `crypto` - Key pairs, HKDF, AEAD and the Noise transport
//! - `proto` - Wire protobuf definitions
//! - `store` - Keyed transactional persistence for all cryptographic state
//! - `signal` - 1:1 double-ratchet and group sender-key ciphers
//! - `prekeys` - Pre-key inventory monitoring and replenishment
//! - `resolver` - Device list and LID resolution via USync
//! - `relay` - Outbound message fan-out and inbound decryption
//! - `socket` - WebSocket frame transport with send pacing
//! - `conn` - Connection supervision: keep-alive, reconnect, stanza routing
//! - `eventbuf` - Event coalescing during initial sync
//! - `pair` - QR and pairing-code device registration
//! - `session` - Assembly of all of the above into one client

pub mod types;
pub mod binary;
pub mod crypto;
pub mod proto;
pub mod store;
pub mod signal;
pub mod prekeys;
pub mod resolver;
pub mod relay;
pub mod socket;
pub mod conn;
pub mod eventbuf;
pub mod pair;
pub mod session;
mod config;

#[cfg(test)]
pub(crate) mod testutil;

pub use binary::{decode, encode, Node};
pub use config::Config;
pub use session::Session;
pub use store::{Credentials, SignalStore};
pub use types::events::Event;
pub use types::{Jid, MessageId};
