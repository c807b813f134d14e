//! Group sender-key cipher.
//!
//! One record per (group, sender address), holding up to a handful of past
//! states. Each state carries a chain key, an Ed25519 signing pair (private
//! half only for our own states) and a bounded cache of skipped message
//! keys for out-of-order delivery.

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use prost::Message as ProstMessage;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::Hkdf;
use crate::proto::wa;
use crate::signal::ratchet::{cbc_decrypt, cbc_encrypt};
use crate::signal::session::CIPHERTEXT_VERSION;
use crate::signal::SignalError;
use crate::store::SignalStore;

type HmacSha256 = Hmac<Sha256>;

/// Past states kept per record.
pub const MAX_SENDER_KEY_STATES: usize = 5;

/// Maximum iterations a message may be ahead of the chain.
pub const MAX_JUMP: u32 = 2000;

const MAX_SKIPPED_KEYS: usize = 1000;
const SIGNATURE_LENGTH: usize = 64;

/// Key name for a sender-key record: `(group, sender address)`.
pub fn sender_key_name(group: &str, sender_address: &str) -> String {
    format!("{group}::{sender_address}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderChainKey {
    pub iteration: u32,
    pub seed: [u8; 32],
}

impl SenderChainKey {
    fn hmac(&self, label: u8) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.seed).expect("HMAC accepts any key size");
        mac.update(&[label]);
        mac.finalize().into_bytes().into()
    }

    pub fn next(&self) -> SenderChainKey {
        SenderChainKey {
            iteration: self.iteration + 1,
            seed: self.hmac(0x02),
        }
    }

    /// Message key for the current iteration: `(iv, cipher_key)`.
    pub fn message_key(&self) -> SenderMessageKey {
        let seed = self.hmac(0x01);
        let derived: [u8; 48] = Hkdf::derive_fixed(None, &seed, b"WhisperGroup");
        let mut iv = [0u8; 16];
        let mut cipher_key = [0u8; 32];
        iv.copy_from_slice(&derived[0..16]);
        cipher_key.copy_from_slice(&derived[16..48]);
        SenderMessageKey {
            iteration: self.iteration,
            iv,
            cipher_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderMessageKey {
    pub iteration: u32,
    pub iv: [u8; 16],
    pub cipher_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub chain_key: SenderChainKey,
    pub signing_pub: [u8; 32],
    /// Present only for states we created ourselves.
    pub signing_priv: Option<[u8; 32]>,
    skipped: Vec<SenderMessageKey>,
}

impl SenderKeyState {
    fn take_skipped(&mut self, iteration: u32) -> Option<SenderMessageKey> {
        let pos = self.skipped.iter().position(|k| k.iteration == iteration)?;
        Some(self.skipped.remove(pos))
    }

    fn push_skipped(&mut self, key: SenderMessageKey) {
        self.skipped.push(key);
        if self.skipped.len() > MAX_SKIPPED_KEYS {
            let excess = self.skipped.len() - MAX_SKIPPED_KEYS;
            self.skipped.drain(..excess);
        }
    }
}

/// Per-(group, sender) record, newest state first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    states: Vec<SenderKeyState>,
}

impl SenderKeyRecord {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn current(&self) -> Option<&SenderKeyState> {
        self.states.first()
    }

    fn current_mut(&mut self) -> Option<&mut SenderKeyState> {
        self.states.first_mut()
    }

    fn state_mut(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|s| s.key_id == key_id)
    }

    fn push_state(&mut self, state: SenderKeyState) {
        self.states.insert(0, state);
        self.states.truncate(MAX_SENDER_KEY_STATES);
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(|e| SignalError::Serialization(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SignalError> {
        serde_json::from_slice(bytes).map_err(|e| SignalError::Serialization(e.to_string()))
    }
}

/// The group cipher bound to the store.
pub struct GroupCipher {
    store: Arc<SignalStore>,
}

impl GroupCipher {
    pub fn new(store: Arc<SignalStore>) -> Self {
        Self { store }
    }

    fn load(&self, name: &str) -> Result<SenderKeyRecord, SignalError> {
        match self.store.get_sender_key(name)? {
            Some(bytes) => SenderKeyRecord::deserialize(&bytes),
            None => Ok(SenderKeyRecord::default()),
        }
    }

    async fn persist(&self, name: &str, record: &SenderKeyRecord) -> Result<(), SignalError> {
        self.store
            .put_sender_key(name, record.serialize()?)
            .await?;
        Ok(())
    }

    /// Build the distribution message for our own sender key, creating the
    /// state on first use.
    pub async fn create_distribution(&self, name: &str) -> Result<Vec<u8>, SignalError> {
        let mut record = self.load(name)?;
        if record.current().map(|s| s.signing_priv.is_none()).unwrap_or(true) {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            let mut signing_seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut signing_seed);
            let signing = SigningKey::from_bytes(&signing_seed);

            record.push_state(SenderKeyState {
                key_id: rand::random::<u32>() & 0x7FFF_FFFF,
                chain_key: SenderChainKey {
                    iteration: 0,
                    seed,
                },
                signing_pub: signing.verifying_key().to_bytes(),
                signing_priv: Some(signing_seed),
                skipped: Vec::new(),
            });
            self.persist(name, &record).await?;
        }

        let state = record.current().expect("state just ensured");
        let skdm = wa::SenderKeyDistributionMessageProto {
            id: Some(state.key_id),
            iteration: Some(state.chain_key.iteration),
            chain_key: Some(state.chain_key.seed.to_vec()),
            signing_key: Some(state.signing_pub.to_vec()),
        };
        let mut wire = vec![CIPHERTEXT_VERSION];
        skdm.encode(&mut wire).expect("vec write is infallible");
        Ok(wire)
    }

    /// Install a peer's distributed sender key.
    pub async fn process_distribution(&self, name: &str, wire: &[u8]) -> Result<(), SignalError> {
        if wire.len() < 2 || wire[0] != CIPHERTEXT_VERSION {
            return Err(SignalError::InvalidMessage("bad skdm version".into()));
        }
        let skdm = wa::SenderKeyDistributionMessageProto::decode(&wire[1..])
            .map_err(|e| SignalError::InvalidMessage(e.to_string()))?;
        let seed: [u8; 32] = skdm
            .chain_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| SignalError::InvalidMessage("missing chain key".into()))?;
        let signing_pub: [u8; 32] = skdm
            .signing_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| SignalError::InvalidMessage("missing signing key".into()))?;

        let mut record = self.load(name)?;
        record.push_state(SenderKeyState {
            key_id: skdm.id.unwrap_or_default(),
            chain_key: SenderChainKey {
                iteration: skdm.iteration.unwrap_or_default(),
                seed,
            },
            signing_pub,
            signing_priv: None,
            skipped: Vec::new(),
        });
        self.persist(name, &record).await
    }

    /// Encrypt one group message: ratchet the chain by one, sign the result.
    pub async fn encrypt(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, SignalError> {
        let mut record = self.load(name)?;
        let state = record.current_mut().ok_or(SignalError::SessionNotFound)?;
        let signing_seed = state.signing_priv.ok_or(SignalError::SessionNotFound)?;

        let key = state.chain_key.message_key();
        let ciphertext = cbc_encrypt(&key.cipher_key, &key.iv, plaintext);

        let proto = wa::SenderKeyMessageProto {
            id: Some(state.key_id),
            iteration: Some(key.iteration),
            ciphertext: Some(ciphertext),
        };
        let mut serialized = vec![CIPHERTEXT_VERSION];
        proto
            .encode(&mut serialized)
            .expect("vec write is infallible");

        let signing = SigningKey::from_bytes(&signing_seed);
        let signature = signing.sign(&serialized);
        serialized.extend_from_slice(&signature.to_bytes());

        state.chain_key = state.chain_key.next();
        self.persist(name, &record).await?;
        Ok(serialized)
    }

    /// Decrypt one group message, caching skipped iterations.
    pub async fn decrypt(&self, name: &str, wire: &[u8]) -> Result<Vec<u8>, SignalError> {
        if wire.len() < 1 + SIGNATURE_LENGTH || wire[0] != CIPHERTEXT_VERSION {
            return Err(SignalError::InvalidMessage("bad skmsg framing".into()));
        }
        let (serialized, signature) = wire.split_at(wire.len() - SIGNATURE_LENGTH);
        let proto = wa::SenderKeyMessageProto::decode(&serialized[1..])
            .map_err(|e| SignalError::InvalidMessage(e.to_string()))?;
        let key_id = proto.id.unwrap_or_default();
        let iteration = proto.iteration.unwrap_or_default();
        let ciphertext = proto
            .ciphertext
            .as_deref()
            .ok_or_else(|| SignalError::InvalidMessage("missing ciphertext".into()))?;

        let mut record = self.load(name)?;
        let state = record
            .state_mut(key_id)
            .ok_or(SignalError::SessionNotFound)?;

        let vk = VerifyingKey::from_bytes(&state.signing_pub)
            .map_err(|_| SignalError::InvalidMessage("bad signing key".into()))?;
        let sig_bytes: [u8; 64] = signature.try_into().expect("length checked");
        vk.verify(serialized, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignalError::BadMac)?;

        let key = if iteration < state.chain_key.iteration {
            state
                .take_skipped(iteration)
                .ok_or_else(|| SignalError::InvalidMessage(format!(
                    "iteration {iteration} already ratcheted past"
                )))?
        } else {
            if iteration - state.chain_key.iteration > MAX_JUMP {
                return Err(SignalError::TooFarAhead(
                    iteration - state.chain_key.iteration,
                ));
            }
            while state.chain_key.iteration < iteration {
                let skipped = state.chain_key.message_key();
                state.push_skipped(skipped);
                state.chain_key = state.chain_key.next();
            }
            let key = state.chain_key.message_key();
            state.chain_key = state.chain_key.next();
            key
        };

        let plaintext =
            cbc_decrypt(&key.cipher_key, &key.iv, ciphertext).map_err(|_| SignalError::BadMac)?;
        self.persist(name, &record).await?;
        Ok(plaintext)
    }
}
