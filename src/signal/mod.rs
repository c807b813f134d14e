//! Signal-family end-to-end encryption: 1:1 double-ratchet sessions and
//! group sender-key sessions.

pub mod ratchet;
pub mod sender_key;
pub mod session;

use crate::store::StoreError;

pub use sender_key::{sender_key_name, GroupCipher, SenderKeyRecord};
pub use session::{EncType, PreKeyBundle, SessionCipher, SessionState};

/// Errors from the end-to-end ciphers.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// MAC or signature verification failed. Never retried in place.
    #[error("bad MAC")]
    BadMac,
    #[error("no session for address")]
    SessionNotFound,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unknown pre-key id {0}")]
    InvalidPreKeyId(u32),
    #[error("message {0} iterations ahead of chain")]
    TooFarAhead(u32),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SignalError {
    /// Whether this error indicates session corruption that should trigger
    /// a pre-key audit and session re-establishment.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SignalError::BadMac | SignalError::SessionNotFound)
    }
}
