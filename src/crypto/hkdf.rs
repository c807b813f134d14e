//! HKDF-SHA256 key derivation.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// HKDF-Extract with the given salt and input key material.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = salt.unwrap_or(&[0u8; 32]);
        let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key size");
        mac.update(ikm);
        let prk: [u8; 32] = mac.finalize().into_bytes().into();

        Self { prk }
    }

    /// HKDF-Expand to the desired length.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut t = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            let mut mac = HmacSha256::new_from_slice(&self.prk).expect("HMAC accepts any key size");
            mac.update(&t);
            mac.update(info);
            mac.update(&[counter]);
            t = mac.finalize().into_bytes().to_vec();

            let remaining = length - output.len();
            output.extend_from_slice(&t[..remaining.min(t.len())]);
            counter += 1;
        }

        output
    }

    /// Extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        Self::new(salt, ikm).expand(info, length)
    }

    /// Extract and expand into a fixed-size array.
    pub fn derive_fixed<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; N] {
        let derived = Self::derive(salt, ikm, info, N);
        let mut out = [0u8; N];
        out.copy_from_slice(&derived);
        out
    }
}

/// Split 64 derived bytes into two 32-byte keys.
pub fn split_keys(derived: &[u8]) -> ([u8; 32], [u8; 32]) {
    debug_assert!(derived.len() >= 64);
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&derived[0..32]);
    second.copy_from_slice(&derived[32..64]);
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_length() {
        let output = Hkdf::derive(Some(&[0x00; 13]), &[0x0b; 22], b"info", 42);
        assert_eq!(output.len(), 42);
    }

    #[test]
    fn test_hkdf_deterministic() {
        let a = Hkdf::derive(Some(b"salt"), b"ikm", b"info", 64);
        let b = Hkdf::derive(Some(b"salt"), b"ikm", b"info", 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hkdf_salt_matters() {
        let a = Hkdf::derive(Some(b"salt-a"), b"ikm", b"", 32);
        let b = Hkdf::derive(Some(b"salt-b"), b"ikm", b"", 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_fixed_matches_derive() {
        let vec = Hkdf::derive(None, b"ikm", b"x", 64);
        let arr: [u8; 64] = Hkdf::derive_fixed(None, b"ikm", b"x");
        assert_eq!(vec, arr);
    }
}
