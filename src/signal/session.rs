//! 1:1 double-ratchet session cipher.
//!
//! One session per protocol address. Encrypt yields `pkmsg` until the peer
//! has demonstrably processed our pre-key message, `msg` afterwards.
//! Decryption works on a cloned state: a bad MAC leaves the persisted
//! session untouched.

use prost::Message as ProstMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::keypair::DJB_TYPE;
use crate::crypto::{verify_key_signature, Hkdf, KeyPair};
use crate::proto::wa;
use crate::signal::ratchet::{cbc_decrypt, cbc_encrypt, ChainKey, MessageKeys, RootKey};
use crate::signal::SignalError;
use crate::store::{Credentials, SignalStore};

type HmacSha256 = Hmac<Sha256>;

/// Wire version byte: protocol version 3 in both nibbles.
pub const CIPHERTEXT_VERSION: u8 = 0x33;

/// Maximum number of message keys a chain may be ratcheted forward at once.
pub const MAX_SKIP: u32 = 2000;

const MAX_SKIPPED_KEYS: usize = 1000;
const MAX_RECEIVER_CHAINS: usize = 5;
const MAC_LENGTH: usize = 8;

/// Wire type of a 1:1 ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncType {
    /// Pre-key message: first contact, carries session-bootstrap material.
    PreKey,
    /// Regular ratchet message.
    Msg,
}

impl EncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncType::PreKey => "pkmsg",
            EncType::Msg => "msg",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pkmsg" => Some(EncType::PreKey),
            "msg" => Some(EncType::Msg),
            _ => None,
        }
    }
}

/// Pre-key bundle fetched from the server for session establishment.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    /// Peer identity, Curve25519.
    pub identity_key: [u8; 32],
    /// Peer identity verifying key for the signed pre-key signature.
    pub identity_ed: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub pre_key: Option<(u32, [u8; 32])>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingPreKey {
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceiverChain {
    ratchet_key: [u8; 32],
    chain: ChainKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    keys: MessageKeys,
}

/// Serialized per-address session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    root_key: RootKey,
    sender_ratchet: KeyPair,
    sender_chain: Option<ChainKey>,
    previous_counter: u32,
    remote_ratchet_key: Option<[u8; 32]>,
    receiver_chains: Vec<ReceiverChain>,
    skipped: Vec<SkippedKey>,
    local_identity: [u8; 32],
    remote_identity: [u8; 32],
    remote_registration_id: u32,
    pending_pre_key: Option<PendingPreKey>,
}

impl SessionState {
    /// A session is open when it can produce a sender chain.
    pub fn is_open(&self) -> bool {
        self.sender_chain.is_some() || self.remote_ratchet_key.is_some()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(|e| SignalError::Serialization(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SignalError> {
        serde_json::from_slice(bytes).map_err(|e| SignalError::Serialization(e.to_string()))
    }
}

fn x3dh_master(parts: &[[u8; 32]]) -> RootKey {
    let mut master = Vec::with_capacity(32 + parts.len() * 32);
    master.extend_from_slice(&[0xFF; 32]);
    for part in parts {
        master.extend_from_slice(part);
    }
    let derived: [u8; 64] = Hkdf::derive_fixed(None, &master, b"WhisperText");
    let mut root = [0u8; 32];
    root.copy_from_slice(&derived[0..32]);
    RootKey(root)
}

fn truncated_mac(
    mac_key: &[u8; 32],
    sender_identity: &[u8; 32],
    receiver_identity: &[u8; 32],
    data: &[u8],
) -> [u8; MAC_LENGTH] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts any key size");
    mac.update(&[DJB_TYPE]);
    mac.update(sender_identity);
    mac.update(&[DJB_TYPE]);
    mac.update(receiver_identity);
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LENGTH];
    out.copy_from_slice(&full[..MAC_LENGTH]);
    out
}

/// The 1:1 cipher bound to a store and the local identity.
pub struct SessionCipher {
    store: Arc<SignalStore>,
    creds: Arc<RwLock<Credentials>>,
}

impl SessionCipher {
    pub fn new(store: Arc<SignalStore>, creds: Arc<RwLock<Credentials>>) -> Self {
        Self { store, creds }
    }

    fn load(&self, address: &str) -> Result<Option<SessionState>, SignalError> {
        match self.store.get_session(address)? {
            Some(bytes) => Ok(Some(SessionState::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, address: &str, state: &SessionState) -> Result<(), SignalError> {
        self.store.put_session(address, state.serialize()?).await?;
        Ok(())
    }

    /// Whether an open session exists for the address.
    pub fn has_open_session(&self, address: &str) -> Result<bool, SignalError> {
        Ok(self.load(address)?.map(|s| s.is_open()).unwrap_or(false))
    }

    /// Initialize an outgoing session from a fetched pre-key bundle.
    pub async fn init_outgoing(
        &self,
        address: &str,
        bundle: &PreKeyBundle,
    ) -> Result<(), SignalError> {
        if !verify_key_signature(
            &bundle.identity_ed,
            &bundle.signed_pre_key,
            &bundle.signed_pre_key_signature,
        ) {
            return Err(SignalError::InvalidMessage(
                "signed pre-key signature rejected".into(),
            ));
        }

        let identity = self.creds.read().await.identity_key.clone();
        let base = KeyPair::generate();

        let mut parts = vec![
            identity.dh(&bundle.signed_pre_key),
            base.dh(&bundle.identity_key),
            base.dh(&bundle.signed_pre_key),
        ];
        if let Some((_, pre_key)) = &bundle.pre_key {
            parts.push(base.dh(pre_key));
        }
        let root = x3dh_master(&parts);

        // Initial sending ratchet against the peer's signed pre-key.
        let sender_ratchet = KeyPair::generate();
        let (root, sender_chain) = root.ratchet(&sender_ratchet.dh(&bundle.signed_pre_key));

        let state = SessionState {
            root_key: root,
            local_identity: identity.public,
            remote_identity: bundle.identity_key,
            remote_registration_id: bundle.registration_id,
            sender_ratchet,
            sender_chain: Some(sender_chain),
            previous_counter: 0,
            remote_ratchet_key: Some(bundle.signed_pre_key),
            receiver_chains: Vec::new(),
            skipped: Vec::new(),
            pending_pre_key: Some(PendingPreKey {
                pre_key_id: bundle.pre_key.map(|(id, _)| id),
                signed_pre_key_id: bundle.signed_pre_key_id,
                base_key: base.public,
            }),
        };
        self.persist(address, &state).await
    }

    /// Encrypt a plaintext for the address. Returns the wire type and the
    /// serialized ciphertext.
    pub async fn encrypt(
        &self,
        address: &str,
        plaintext: &[u8],
    ) -> Result<(EncType, Vec<u8>), SignalError> {
        let mut state = self.load(address)?.ok_or(SignalError::SessionNotFound)?;

        // Re-ratchet lazily after a receiving step consumed our chain.
        if state.sender_chain.is_none() {
            let remote = state
                .remote_ratchet_key
                .ok_or(SignalError::SessionNotFound)?;
            let fresh = KeyPair::generate();
            let (root, chain) = state.root_key.ratchet(&fresh.dh(&remote));
            state.root_key = root;
            state.sender_ratchet = fresh;
            state.sender_chain = Some(chain);
        }

        let chain = state.sender_chain.clone().expect("sender chain just ensured");
        let keys = chain.message_keys();
        state.sender_chain = Some(chain.next());

        let ciphertext = cbc_encrypt(&keys.cipher_key, &keys.iv, plaintext);
        let proto = wa::SignalMessageProto {
            ratchet_key: Some(state.sender_ratchet.public.to_vec()),
            counter: Some(keys.index),
            previous_counter: Some(state.previous_counter),
            ciphertext: Some(ciphertext),
        };
        let mut serialized = vec![CIPHERTEXT_VERSION];
        proto
            .encode(&mut serialized)
            .expect("vec write is infallible");
        let mac = truncated_mac(
            &keys.mac_key,
            &state.local_identity,
            &state.remote_identity,
            &serialized,
        );
        serialized.extend_from_slice(&mac);

        let (enc_type, wire) = match &state.pending_pre_key {
            Some(pending) => {
                let creds = self.creds.read().await;
                let outer = wa::PreKeySignalMessageProto {
                    registration_id: Some(creds.registration_id as u32),
                    pre_key_id: pending.pre_key_id,
                    signed_pre_key_id: Some(pending.signed_pre_key_id),
                    base_key: Some(pending.base_key.to_vec()),
                    identity_key: Some(state.local_identity.to_vec()),
                    message: Some(serialized),
                };
                let mut wire = vec![CIPHERTEXT_VERSION];
                outer.encode(&mut wire).expect("vec write is infallible");
                (EncType::PreKey, wire)
            }
            None => (EncType::Msg, serialized),
        };

        self.persist(address, &state).await?;
        Ok((enc_type, wire))
    }

    /// Decrypt either wire type, updating the ratchet on success.
    pub async fn decrypt(
        &self,
        address: &str,
        enc_type: EncType,
        wire: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        match enc_type {
            EncType::PreKey => self.decrypt_pre_key_message(address, wire).await,
            EncType::Msg => {
                let mut state = self.load(address)?.ok_or(SignalError::SessionNotFound)?;
                let plaintext = self.decrypt_msg_in(&mut state, wire)?;
                // Any inbound ratchet message confirms the session.
                state.pending_pre_key = None;
                self.persist(address, &state).await?;
                Ok(plaintext)
            }
        }
    }

    async fn decrypt_pre_key_message(
        &self,
        address: &str,
        wire: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        if wire.len() < 2 || wire[0] != CIPHERTEXT_VERSION {
            return Err(SignalError::InvalidMessage("bad pkmsg version".into()));
        }
        let outer = wa::PreKeySignalMessageProto::decode(&wire[1..])
            .map_err(|e| SignalError::InvalidMessage(e.to_string()))?;
        let base_key: [u8; 32] = outer
            .base_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| SignalError::InvalidMessage("missing base key".into()))?;
        let their_identity: [u8; 32] = outer
            .identity_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| SignalError::InvalidMessage("missing identity".into()))?;
        let inner = outer
            .message
            .as_deref()
            .ok_or_else(|| SignalError::InvalidMessage("missing inner message".into()))?;

        let mut state = match self.load(address)? {
            // Repeated pkmsg for a session we already built: just decrypt.
            Some(state) if state.remote_identity == their_identity => state,
            _ => {
                self.init_incoming(&outer, &base_key, &their_identity)
                    .await?
            }
        };

        let plaintext = self.decrypt_msg_in(&mut state, inner)?;
        self.persist(address, &state).await?;

        // The one-time pre-key is consumed only once the message decrypted.
        if let Some(pre_key_id) = outer.pre_key_id {
            self.store.delete_pre_key(pre_key_id).await?;
        }
        Ok(plaintext)
    }

    async fn init_incoming(
        &self,
        outer: &wa::PreKeySignalMessageProto,
        base_key: &[u8; 32],
        their_identity: &[u8; 32],
    ) -> Result<SessionState, SignalError> {
        let creds = self.creds.read().await;
        let signed_id = outer
            .signed_pre_key_id
            .ok_or_else(|| SignalError::InvalidMessage("missing signed pre-key id".into()))?;
        if signed_id != creds.signed_pre_key.key_id {
            return Err(SignalError::InvalidPreKeyId(signed_id));
        }
        let spk = creds.signed_pre_key.key_pair.clone();
        let identity = creds.identity_key.clone();
        let registration_id = outer.registration_id.unwrap_or_default();
        drop(creds);

        let mut parts = vec![
            spk.dh(their_identity),
            identity.dh(base_key),
            spk.dh(base_key),
        ];
        if let Some(pre_key_id) = outer.pre_key_id {
            let pre_key = self
                .store
                .get_pre_key(pre_key_id)?
                .ok_or(SignalError::InvalidPreKeyId(pre_key_id))?;
            parts.push(pre_key.key_pair.dh(base_key));
        }
        let root = x3dh_master(&parts);

        Ok(SessionState {
            root_key: root,
            local_identity: identity.public,
            remote_identity: *their_identity,
            remote_registration_id: registration_id,
            // Our signed pre-key doubles as the initial ratchet key.
            sender_ratchet: spk,
            sender_chain: None,
            previous_counter: 0,
            remote_ratchet_key: None,
            receiver_chains: Vec::new(),
            skipped: Vec::new(),
            pending_pre_key: None,
        })
    }

    /// Core ratchet-message decryption. Mutates the passed state only; the
    /// caller persists on success, so a bad MAC cannot corrupt the record.
    fn decrypt_msg_in(
        &self,
        state: &mut SessionState,
        wire: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        if wire.len() < 1 + MAC_LENGTH || wire[0] != CIPHERTEXT_VERSION {
            return Err(SignalError::InvalidMessage("bad msg framing".into()));
        }
        let (serialized, their_mac) = wire.split_at(wire.len() - MAC_LENGTH);
        let proto = wa::SignalMessageProto::decode(&serialized[1..])
            .map_err(|e| SignalError::InvalidMessage(e.to_string()))?;
        let their_key: [u8; 32] = proto
            .ratchet_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| SignalError::InvalidMessage("missing ratchet key".into()))?;
        let counter = proto.counter.unwrap_or(0);
        let ciphertext = proto
            .ciphertext
            .as_deref()
            .ok_or_else(|| SignalError::InvalidMessage("missing ciphertext".into()))?;

        // Skipped-key fast path: an out-of-order message from an old chain.
        if let Some(pos) = state
            .skipped
            .iter()
            .position(|sk| sk.ratchet_key == their_key && sk.keys.index == counter)
        {
            let keys = state.skipped[pos].keys.clone();
            let plaintext = Self::open(state, &keys, serialized, their_mac, ciphertext)?;
            state.skipped.remove(pos);
            return Ok(plaintext);
        }

        // Locate or create the receiver chain for this ratchet key.
        let chain_idx = match state
            .receiver_chains
            .iter()
            .position(|rc| rc.ratchet_key == their_key)
        {
            Some(idx) => idx,
            None => {
                let dh = state.sender_ratchet.dh(&their_key);
                let (root, chain) = state.root_key.ratchet(&dh);
                state.root_key = root;
                state.receiver_chains.push(ReceiverChain {
                    ratchet_key: their_key,
                    chain,
                });
                if state.receiver_chains.len() > MAX_RECEIVER_CHAINS {
                    state.receiver_chains.remove(0);
                }
                state.remote_ratchet_key = Some(their_key);
                state.previous_counter = state
                    .sender_chain
                    .as_ref()
                    .map(|c| c.index)
                    .unwrap_or(0);
                // Our sending chain is stale after a receiving step.
                state.sender_chain = None;
                state.receiver_chains.len() - 1
            }
        };

        let mut chain = state.receiver_chains[chain_idx].chain.clone();
        if counter < chain.index {
            return Err(SignalError::InvalidMessage(format!(
                "counter {counter} already ratcheted past"
            )));
        }
        if counter - chain.index > MAX_SKIP {
            return Err(SignalError::TooFarAhead(counter - chain.index));
        }
        let mut newly_skipped = Vec::new();
        while chain.index < counter {
            newly_skipped.push(SkippedKey {
                ratchet_key: their_key,
                keys: chain.message_keys(),
            });
            chain = chain.next();
        }
        let keys = chain.message_keys();

        let plaintext = Self::open(state, &keys, serialized, their_mac, ciphertext)?;

        // Persist ratchet progress only after authentication.
        state.receiver_chains[chain_idx].chain = chain.next();
        state.skipped.extend(newly_skipped);
        if state.skipped.len() > MAX_SKIPPED_KEYS {
            let excess = state.skipped.len() - MAX_SKIPPED_KEYS;
            state.skipped.drain(..excess);
        }
        Ok(plaintext)
    }

    fn open(
        state: &SessionState,
        keys: &MessageKeys,
        serialized: &[u8],
        their_mac: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let expected = truncated_mac(
            &keys.mac_key,
            &state.remote_identity,
            &state.local_identity,
            serialized,
        );
        if expected != their_mac {
            return Err(SignalError::BadMac);
        }
        cbc_decrypt(&keys.cipher_key, &keys.iv, ciphertext).map_err(|_| SignalError::BadMac)
    }
}
