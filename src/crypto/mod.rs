//! Cryptographic primitives: key pairs, HKDF, AEAD, and the Noise channel.

pub mod cipher;
pub mod hkdf;
pub mod keypair;
pub mod noise;

pub use cipher::{counter_iv, gcm_decrypt, gcm_encrypt, CipherError};
pub use hkdf::Hkdf;
pub use keypair::{verify_key_signature, KeyPair, PreKey, SignedPreKey};
pub use noise::{Handshake, NoiseError, NoiseTransport};
