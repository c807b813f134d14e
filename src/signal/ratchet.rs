//! Ratchet primitives shared by the 1:1 and group ciphers.
//!
//! Chain keys advance by one HMAC step per message; each step yields a
//! message key set (cipher key, MAC key, IV) derived via HKDF.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::Hkdf;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

/// A symmetric chain key with its iteration counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainKey {
    pub index: u32,
    pub key: [u8; 32],
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { index, key }
    }

    fn hmac(&self, seed: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(seed);
        mac.finalize().into_bytes().into()
    }

    /// Advance the chain by one step.
    pub fn next(&self) -> ChainKey {
        ChainKey {
            index: self.index + 1,
            key: self.hmac(CHAIN_KEY_SEED),
        }
    }

    /// Derive the message keys for the current step.
    pub fn message_keys(&self) -> MessageKeys {
        let seed = self.hmac(MESSAGE_KEY_SEED);
        let derived: [u8; 80] = Hkdf::derive_fixed(None, &seed, b"WhisperMessageKeys");

        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut iv = [0u8; 16];
        cipher_key.copy_from_slice(&derived[0..32]);
        mac_key.copy_from_slice(&derived[32..64]);
        iv.copy_from_slice(&derived[64..80]);

        MessageKeys {
            index: self.index,
            cipher_key,
            mac_key,
            iv,
        }
    }
}

/// Key material for a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageKeys {
    pub index: u32,
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
}

/// Root key driving Diffie-Hellman ratchet steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootKey(pub [u8; 32]);

impl RootKey {
    /// Mix a DH output into the root, producing the next root key and a
    /// fresh chain key.
    pub fn ratchet(&self, dh_output: &[u8; 32]) -> (RootKey, ChainKey) {
        let derived: [u8; 64] = Hkdf::derive_fixed(Some(&self.0), dh_output, b"WhisperRatchet");
        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&derived[0..32]);
        chain.copy_from_slice(&derived[32..64]);
        (RootKey(root), ChainKey::new(chain, 0))
    }
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-256-CBC decrypt, rejecting bad padding.
pub fn cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, ()> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_advances_index() {
        let ck = ChainKey::new([1u8; 32], 0);
        let next = ck.next();
        assert_eq!(next.index, 1);
        assert_ne!(next.key, ck.key);
    }

    #[test]
    fn test_message_keys_differ_per_step() {
        let ck = ChainKey::new([1u8; 32], 0);
        let mk0 = ck.message_keys();
        let mk1 = ck.next().message_keys();
        assert_ne!(mk0.cipher_key, mk1.cipher_key);
        assert_eq!(mk0.index, 0);
        assert_eq!(mk1.index, 1);
    }

    #[test]
    fn test_root_ratchet_is_deterministic() {
        let root = RootKey([7u8; 32]);
        let (r1, c1) = root.ratchet(&[9u8; 32]);
        let (r2, c2) = root.ratchet(&[9u8; 32]);
        assert_eq!(r1, r2);
        assert_eq!(c1, c2);
        assert_ne!(r1.0, root.0);
    }

    #[test]
    fn test_cbc_roundtrip() {
        let key = [3u8; 32];
        let iv = [4u8; 16];
        let ct = cbc_encrypt(&key, &iv, b"attack at dawn");
        assert_eq!(cbc_decrypt(&key, &iv, &ct).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_cbc_tamper_detected_or_garbled() {
        let key = [3u8; 32];
        let iv = [4u8; 16];
        let mut ct = cbc_encrypt(&key, &iv, b"attack at dawn");
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        // Either padding fails or the plaintext differs.
        match cbc_decrypt(&key, &iv, &ct) {
            Ok(pt) => assert_ne!(pt, b"attack at dawn"),
            Err(()) => {}
        }
    }
}
