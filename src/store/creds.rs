//! Identity credentials: the process-scoped key material of a session.
//!
//! Owned by the session and mutated only while holding the store's keyed
//! transaction guard; every mutation is surfaced as a creds update event.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, SignedPreKey};
use crate::types::Jid;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Noise static key pair.
    pub noise_key: KeyPair,
    /// Signed identity key pair.
    pub identity_key: KeyPair,
    /// Current signed pre-key, monotonically numbered.
    pub signed_pre_key: SignedPreKey,
    /// Next unused one-time pre-key id.
    pub next_pre_key_id: u32,
    /// 16-bit registration id.
    pub registration_id: u16,
    /// Advertising secret used to authenticate the device identity.
    pub adv_secret_key: [u8; 32],
    /// Ephemeral key pair for the pairing-code flow.
    pub pairing_ephemeral: KeyPair,
    /// Server-issued routing blob, echoed in the Noise intro header.
    pub routing_info: Option<Vec<u8>>,
    /// Own canonical phone-number JID, set after pairing.
    pub me: Option<Jid>,
    /// Own LID JID, set by the server on login.
    pub lid: Option<Jid>,
    /// Platform reported by the primary device.
    pub platform: Option<String>,
    /// Serialized signed device identity, attached to stanzas that carry a
    /// pre-key message.
    pub account: Option<Vec<u8>>,
    /// Whether pairing has completed.
    pub registered: bool,
}

impl Credentials {
    /// Generate a fresh, unregistered credential set.
    pub fn generate() -> Self {
        let identity_key = KeyPair::generate();
        let signed_pre_key = SignedPreKey::new(1, &identity_key);

        let mut adv_secret_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut adv_secret_key);

        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            next_pre_key_id: 1,
            registration_id: (rand::random::<u16>() & 0x3FFF).max(1),
            adv_secret_key,
            pairing_ephemeral: KeyPair::generate(),
            routing_info: None,
            me: None,
            lid: None,
            platform: None,
            account: None,
            registered: false,
        }
    }

    /// The signal address of this device's phone-number identity.
    pub fn own_signal_address(&self) -> Option<String> {
        self.me.as_ref().map(|jid| jid.signal_address())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("me", &self.me)
            .field("lid", &self.lid)
            .field("registration_id", &self.registration_id)
            .field("next_pre_key_id", &self.next_pre_key_id)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}
