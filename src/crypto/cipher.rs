//! AEAD primitives for the framed transport.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Builds the 12-byte GCM IV for a frame counter:
/// eight zero bytes followed by the counter, big-endian.
pub fn counter_iv(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..12].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// AES-256-GCM encrypt with explicit IV and associated data.
pub fn gcm_encrypt(
    key: &[u8; 32],
    iv: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|_| CipherError::EncryptionFailed)
}

/// AES-256-GCM decrypt with explicit IV and associated data.
pub fn gcm_decrypt(
    key: &[u8; 32],
    iv: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CipherError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [0xab; 32];
        let iv = counter_iv(7);

        let ciphertext = gcm_encrypt(&key, &iv, b"aad", b"hello").unwrap();
        let plaintext = gcm_decrypt(&key, &iv, b"aad", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [0xab; 32];
        let iv = counter_iv(0);

        let ciphertext = gcm_encrypt(&key, &iv, b"correct", b"hello").unwrap();
        assert_eq!(
            gcm_decrypt(&key, &iv, b"wrong", &ciphertext),
            Err(CipherError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrong_counter_fails() {
        let key = [0xab; 32];
        let ciphertext = gcm_encrypt(&key, &counter_iv(1), &[], b"hello").unwrap();
        assert!(gcm_decrypt(&key, &counter_iv(2), &[], &ciphertext).is_err());
    }

    #[test]
    fn test_counter_iv_layout() {
        let iv = counter_iv(0x01020304);
        assert_eq!(&iv[0..8], &[0u8; 8]);
        assert_eq!(&iv[8..12], &[0x01, 0x02, 0x03, 0x04]);
    }
}
