//! Curve25519 key pairs and pre-key material.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use x25519_dalek::{PublicKey, StaticSecret};

/// Curve25519 key type byte prefixed to public keys on the wire.
pub const DJB_TYPE: u8 = 0x05;

/// A Curve25519 key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key (32 bytes)
    pub public: [u8; 32],
    /// Private key (32 bytes)
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut private = [0u8; 32];
        rng.fill_bytes(&mut private);

        // Clamping per the Curve25519 spec
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let their_key = PublicKey::from(*their_public);
        *secret.diffie_hellman(&their_key).as_bytes()
    }

    /// The public key with the key-type byte prefixed, as sent on the wire.
    pub fn public_prefixed(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = DJB_TYPE;
        out[1..].copy_from_slice(&self.public);
        out
    }

    /// Sign another public key (type-prefixed) with this key pair.
    pub fn sign_key(&self, key_to_sign: &[u8; 32]) -> [u8; 64] {
        let mut message = [0u8; 33];
        message[0] = DJB_TYPE;
        message[1..].copy_from_slice(key_to_sign);

        let signing_key = SigningKey::from_bytes(&self.private);
        signing_key.sign(&message).to_bytes()
    }

    /// The Ed25519 verifying key corresponding to this pair's signing key.
    pub fn verifying_key(&self) -> [u8; 32] {
        SigningKey::from_bytes(&self.private)
            .verifying_key()
            .to_bytes()
    }
}

/// Verify a 64-byte signature over a type-prefixed public key.
pub fn verify_key_signature(
    verifying_key: &[u8; 32],
    signed_key: &[u8; 32],
    signature: &[u8; 64],
) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(verifying_key) else {
        return false;
    };
    let mut message = [0u8; 33];
    message[0] = DJB_TYPE;
    message[1..].copy_from_slice(signed_key);
    vk.verify(&message, &Signature::from_bytes(signature)).is_ok()
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A numbered one-time pre-key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
}

impl PreKey {
    /// Generate a new pre-key with the given id.
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key_id,
        }
    }
}

/// A medium-term pre-key signed by the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedPreKey {
    /// Generate a signed pre-key, numbered and signed by `identity`.
    pub fn new(key_id: u32, identity: &KeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign_key(&key_pair.public);
        Self {
            key_pair,
            key_id,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        assert_eq!(alice.dh(&bob.public), bob.dh(&alice.public));
    }

    #[test]
    fn test_signed_pre_key_verifies() {
        let identity = KeyPair::generate();
        let spk = SignedPreKey::new(1, &identity);

        assert!(verify_key_signature(
            &identity.verifying_key(),
            &spk.key_pair.public,
            &spk.signature
        ));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let identity = KeyPair::generate();
        let spk = SignedPreKey::new(1, &identity);

        let mut bad = spk.signature;
        bad[0] ^= 0x01;
        assert!(!verify_key_signature(
            &identity.verifying_key(),
            &spk.key_pair.public,
            &bad
        ));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let kp = KeyPair::generate();
        let rendered = format!("{kp:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&hex::encode(kp.private)));
    }
}
