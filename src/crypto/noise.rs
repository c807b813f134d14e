//! Noise transport: XX handshake and framed AEAD channel.
//!
//! Implements `Noise_XX_25519_AESGCM_SHA256`. The handshake authenticates
//! every blob into a rolling hash; key mixing runs HKDF over the salt and
//! DH output. After `finish_init` the channel flips to transport mode with
//! independent read/write keys and counters.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::{debug, warn};
use prost::Message as ProstMessage;
use sha2::{Digest, Sha256};

use crate::crypto::cipher::{counter_iv, gcm_decrypt, gcm_encrypt, CipherError};
use crate::crypto::hkdf::{split_keys, Hkdf};
use crate::crypto::keypair::KeyPair;
use crate::proto::wa;

/// Noise protocol pattern name, padded to exactly 32 bytes.
pub const NOISE_PATTERN: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

/// Connection header: 'W', 'A', magic, dictionary version.
pub const NOISE_HEADER: [u8; 4] = [b'W', b'A', 6, 3];

/// Root public key the server certificate chain must descend from.
pub const SERVER_CERT_ROOT_KEY: [u8; 32] = [
    0x14, 0x23, 0x75, 0x57, 0x4d, 0x0a, 0x58, 0x71, 0x66, 0xaa, 0xe7, 0x1e, 0xbe, 0x51, 0x64,
    0x37, 0xc4, 0xa2, 0x8b, 0x73, 0xe3, 0x69, 0x5c, 0x6c, 0xe1, 0xf7, 0xf9, 0x54, 0x5d, 0xa8,
    0xee, 0x6b,
];

/// Issuer serial the intermediate certificate must carry.
pub const CERT_ISSUER_SERIAL: u32 = 0;

/// Noise errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NoiseError {
    #[error("handshake message too short")]
    MessageTooShort,
    #[error("handshake AEAD failure")]
    HandshakeDecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("missing handshake field: {0}")]
    MissingField(&'static str),
    #[error("certificate verification failed: {0}")]
    CertVerifyFailed(&'static str),
    #[error("malformed handshake protobuf: {0}")]
    BadProto(String),
    #[error("handshake not finished")]
    NotFinished,
    #[error("handshake already finished")]
    AlreadyFinished,
}

impl From<prost::DecodeError> for NoiseError {
    fn from(e: prost::DecodeError) -> Self {
        NoiseError::BadProto(e.to_string())
    }
}

/// Builds the intro header prepended to the very first frame.
///
/// With routing info: `"ED" 0x00 0x01 len24 blob` followed by the regular
/// header; without, just the regular header.
pub fn intro_header(routing_info: Option<&[u8]>) -> Vec<u8> {
    match routing_info {
        Some(blob) => {
            let mut header = Vec::with_capacity(7 + blob.len() + NOISE_HEADER.len());
            header.extend_from_slice(b"ED");
            header.push(0x00);
            header.push(0x01);
            header.push(((blob.len() >> 16) & 0xFF) as u8);
            header.push(((blob.len() >> 8) & 0xFF) as u8);
            header.push((blob.len() & 0xFF) as u8);
            header.extend_from_slice(blob);
            header.extend_from_slice(&NOISE_HEADER);
            header
        }
        None => NOISE_HEADER.to_vec(),
    }
}

/// Noise channel state: handshake phase and transport phase share the
/// struct; `finished` separates the two. This type exclusively owns the
/// AES keys and the counters.
pub struct NoiseTransport {
    hash: [u8; 32],
    salt: [u8; 32],
    enc_key: [u8; 32],
    dec_key: [u8; 32],
    /// Single counter driving both directions during the handshake.
    hs_counter: u32,
    write_counter: u32,
    read_counter: u32,
    finished: bool,
    /// Intro header, consumed by the first outgoing frame.
    intro: Option<Vec<u8>>,
}

impl NoiseTransport {
    /// Initialize handshake state and authenticate the connection header.
    pub fn new(routing_info: Option<&[u8]>) -> Self {
        let hash: [u8; 32] = *NOISE_PATTERN;
        let mut state = Self {
            hash,
            salt: hash,
            enc_key: hash,
            dec_key: hash,
            hs_counter: 0,
            write_counter: 0,
            read_counter: 0,
            finished: false,
            intro: Some(intro_header(routing_info)),
        };
        state.authenticate(&NOISE_HEADER);
        state
    }

    /// Mix data into the rolling handshake hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    /// Mix a DH output into the key material: new salt and symmetric key,
    /// counter reset.
    fn mix_into_key(&mut self, input: &[u8]) {
        let derived = Hkdf::derive(Some(&self.salt), input, b"", 64);
        let (salt, key) = split_keys(&derived);
        self.salt = salt;
        self.enc_key = key;
        self.dec_key = key;
        self.hs_counter = 0;
    }

    /// DH then mix.
    pub fn mix_shared_secret(&mut self, private: &KeyPair, public: &[u8; 32]) {
        let shared = private.dh(public);
        self.mix_into_key(&shared);
    }

    /// Encrypt a handshake blob: AAD is the rolling hash, and the
    /// ciphertext is authenticated into it.
    pub fn encrypt_hs(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.finished {
            return Err(NoiseError::AlreadyFinished);
        }
        let iv = counter_iv(self.hs_counter);
        let ciphertext = gcm_encrypt(&self.enc_key, &iv, &self.hash, plaintext)
            .map_err(|_| NoiseError::EncryptFailed)?;
        self.hs_counter += 1;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt a handshake blob. Failure here is fatal to the connection.
    pub fn decrypt_hs(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.finished {
            return Err(NoiseError::AlreadyFinished);
        }
        let iv = counter_iv(self.hs_counter);
        let plaintext = gcm_decrypt(&self.dec_key, &iv, &self.hash, ciphertext)
            .map_err(|_| NoiseError::HandshakeDecryptFailed)?;
        self.hs_counter += 1;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Derive the final transport keys and flip to transport mode. The
    /// handshake hash is discarded and both counters reset.
    pub fn finish_init(&mut self) -> Result<(), NoiseError> {
        if self.finished {
            return Err(NoiseError::AlreadyFinished);
        }
        let derived = Hkdf::derive(Some(&self.salt), &[], b"", 64);
        let (write_key, read_key) = split_keys(&derived);
        self.enc_key = write_key;
        self.dec_key = read_key;
        self.hash = [0u8; 32];
        self.write_counter = 0;
        self.read_counter = 0;
        self.finished = true;
        Ok(())
    }

    /// Responder-side variant of `finish_init`: the key halves swap.
    #[cfg(test)]
    pub(crate) fn finish_init_responder(&mut self) -> Result<(), NoiseError> {
        self.finish_init()?;
        std::mem::swap(&mut self.enc_key, &mut self.dec_key);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn read_counter(&self) -> u32 {
        self.read_counter
    }

    pub fn write_counter(&self) -> u32 {
        self.write_counter
    }

    pub(crate) fn handshake_hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Encrypt a transport payload and wrap it in a length-prefixed frame.
    /// The intro header is prepended exactly once, on the first frame sent.
    pub fn frame_outgoing(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if !self.finished {
            return Err(NoiseError::NotFinished);
        }
        let iv = counter_iv(self.write_counter);
        let ciphertext = gcm_encrypt(&self.enc_key, &iv, &[], plaintext)
            .map_err(|_| NoiseError::EncryptFailed)?;
        self.write_counter = self.write_counter.wrapping_add(1);
        Ok(self.frame_raw(&ciphertext))
    }

    /// Wrap pre-encrypted (or handshake) bytes in a length-prefixed frame,
    /// consuming the intro header if still pending.
    pub fn frame_raw(&mut self, payload: &[u8]) -> Vec<u8> {
        let intro = self.intro.take().unwrap_or_default();
        let mut frame = Vec::with_capacity(intro.len() + 3 + payload.len());
        frame.extend_from_slice(&intro);
        frame.push(((payload.len() >> 16) & 0xFF) as u8);
        frame.push(((payload.len() >> 8) & 0xFF) as u8);
        frame.push((payload.len() & 0xFF) as u8);
        frame.extend_from_slice(payload);
        frame
    }

    /// Decrypt one transport frame body (length prefix already stripped).
    ///
    /// A failed frame is skipped, not fatal: the counter consumed by the
    /// attempt stays consumed and `None` is returned. A one-shot probe at
    /// counter+1 and counter-1 covers the desync recovery path; a probe
    /// result is only persisted when it succeeds.
    pub fn decrypt_frame(&mut self, ciphertext: &[u8]) -> Result<Option<Vec<u8>>, NoiseError> {
        if !self.finished {
            return Err(NoiseError::NotFinished);
        }
        let c = self.read_counter;

        match self.try_decrypt_at(c, ciphertext) {
            Ok(plaintext) => {
                self.read_counter = c.wrapping_add(1);
                return Ok(Some(plaintext));
            }
            Err(CipherError::DecryptionFailed) => {}
            Err(_) => return Ok(None),
        }

        // Recovery-only: a correct peer never desyncs, so these probes are
        // expected to be unreachable.
        if let Ok(plaintext) = self.try_decrypt_at(c.wrapping_add(1), ciphertext) {
            warn!("noise: frame decrypted one counter ahead, resyncing read counter");
            self.read_counter = c.wrapping_add(2);
            return Ok(Some(plaintext));
        }
        if let Ok(plaintext) = self.try_decrypt_at(c.wrapping_sub(1), ciphertext) {
            warn!("noise: frame decrypted one counter behind, leaving read counter");
            self.read_counter = c.wrapping_add(1);
            return Ok(Some(plaintext));
        }

        debug!("noise: skipping undecryptable frame at counter {c}");
        self.read_counter = c.wrapping_add(1);
        Ok(None)
    }

    fn try_decrypt_at(&self, counter: u32, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        gcm_decrypt(&self.dec_key, &counter_iv(counter), &[], ciphertext)
    }
}

/// Driver for the client side of the XX exchange.
///
/// Produces and consumes protobuf-framed handshake messages; the caller is
/// responsible for the socket.
pub struct Handshake {
    transport: NoiseTransport,
    ephemeral: KeyPair,
    noise_static: KeyPair,
    server_ephemeral: Option<[u8; 32]>,
    cert_root_key: [u8; 32],
}

impl Handshake {
    pub fn new(noise_static: KeyPair, routing_info: Option<&[u8]>) -> Self {
        Self {
            transport: NoiseTransport::new(routing_info),
            ephemeral: KeyPair::generate(),
            noise_static,
            server_ephemeral: None,
            cert_root_key: SERVER_CERT_ROOT_KEY,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cert_root(mut self, root: [u8; 32]) -> Self {
        self.cert_root_key = root;
        self
    }

    /// Step 1: `-> e`. Returns the framed client hello.
    pub fn client_hello(&mut self) -> Vec<u8> {
        self.transport.authenticate(&self.ephemeral.public);

        let hello = wa::HandshakeMessage {
            client_hello: Some(wa::ClientHello {
                ephemeral: Some(self.ephemeral.public.to_vec()),
            }),
            ..Default::default()
        };
        let mut buf = Vec::with_capacity(hello.encoded_len());
        hello.encode(&mut buf).expect("vec write is infallible");
        self.transport.frame_raw(&buf)
    }

    /// Step 2: `<- e, ee, s, es`. Verifies the certificate chain carried in
    /// the encrypted payload.
    pub fn read_server_hello(&mut self, body: &[u8]) -> Result<(), NoiseError> {
        let msg = wa::HandshakeMessage::decode(body)?;
        let server_hello = msg
            .server_hello
            .ok_or(NoiseError::MissingField("server_hello"))?;
        let ephemeral = server_hello
            .ephemeral
            .ok_or(NoiseError::MissingField("ephemeral"))?;
        let static_ct = server_hello
            .r#static
            .ok_or(NoiseError::MissingField("static"))?;
        let payload_ct = server_hello
            .payload
            .ok_or(NoiseError::MissingField("payload"))?;

        let server_eph: [u8; 32] = ephemeral
            .as_slice()
            .try_into()
            .map_err(|_| NoiseError::InvalidKeyLength)?;

        self.transport.authenticate(&server_eph);
        self.transport.mix_shared_secret(&self.ephemeral, &server_eph);
        self.server_ephemeral = Some(server_eph);

        let server_static_raw = self.transport.decrypt_hs(&static_ct)?;
        let server_static: [u8; 32] = server_static_raw
            .as_slice()
            .try_into()
            .map_err(|_| NoiseError::InvalidKeyLength)?;
        self.transport.mix_shared_secret(&self.ephemeral, &server_static);

        let cert_payload = self.transport.decrypt_hs(&payload_ct)?;
        verify_cert_chain(&cert_payload, &server_static, &self.cert_root_key)?;

        Ok(())
    }

    /// Step 3: `-> s, se`. Encrypts the local static key and the client
    /// payload (login or registration) and returns the framed message.
    pub fn client_finish(&mut self, client_payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let static_public = self.noise_static.public;
        let static_ct = self.transport.encrypt_hs(&static_public)?;

        let server_eph = self
            .server_ephemeral
            .ok_or(NoiseError::MissingField("server ephemeral"))?;
        let noise_static = self.noise_static.clone();
        self.transport.mix_shared_secret(&noise_static, &server_eph);

        let payload_ct = self.transport.encrypt_hs(client_payload)?;

        let finish = wa::HandshakeMessage {
            client_finish: Some(wa::ClientFinish {
                r#static: Some(static_ct),
                payload: Some(payload_ct),
            }),
            ..Default::default()
        };
        let mut buf = Vec::with_capacity(finish.encoded_len());
        finish.encode(&mut buf).expect("vec write is infallible");
        Ok(self.transport.frame_raw(&buf))
    }

    /// Derive transport keys and hand over the channel.
    pub fn finish(mut self) -> Result<NoiseTransport, NoiseError> {
        self.transport.finish_init()?;
        Ok(self.transport)
    }

    #[cfg(test)]
    pub(crate) fn handshake_hash(&self) -> [u8; 32] {
        self.transport.handshake_hash()
    }
}

/// Verify the server certificate chain: intermediate signed by the root,
/// leaf signed by the intermediate, issuer serial pinned, and the leaf key
/// matching the server's Noise static key.
pub fn verify_cert_chain(
    payload: &[u8],
    server_static: &[u8; 32],
    root_key: &[u8; 32],
) -> Result<(), NoiseError> {
    let chain = wa::CertChain::decode(payload)?;
    let intermediate = chain
        .intermediate
        .ok_or(NoiseError::CertVerifyFailed("missing intermediate"))?;
    let leaf = chain.leaf.ok_or(NoiseError::CertVerifyFailed("missing leaf"))?;

    let int_details_raw = intermediate
        .details
        .ok_or(NoiseError::CertVerifyFailed("intermediate details"))?;
    let int_sig = intermediate
        .signature
        .ok_or(NoiseError::CertVerifyFailed("intermediate signature"))?;
    verify_ed25519(root_key, &int_details_raw, &int_sig)
        .map_err(|_| NoiseError::CertVerifyFailed("intermediate not signed by root"))?;

    let int_details = wa::CertificateDetails::decode(int_details_raw.as_slice())?;
    if int_details.issuer_serial != Some(CERT_ISSUER_SERIAL) {
        return Err(NoiseError::CertVerifyFailed("issuer serial mismatch"));
    }
    let int_key: [u8; 32] = int_details
        .key
        .as_deref()
        .and_then(|k| k.try_into().ok())
        .ok_or(NoiseError::CertVerifyFailed("intermediate key"))?;

    let leaf_details_raw = leaf
        .details
        .ok_or(NoiseError::CertVerifyFailed("leaf details"))?;
    let leaf_sig = leaf
        .signature
        .ok_or(NoiseError::CertVerifyFailed("leaf signature"))?;
    verify_ed25519(&int_key, &leaf_details_raw, &leaf_sig)
        .map_err(|_| NoiseError::CertVerifyFailed("leaf not signed by intermediate"))?;

    let leaf_details = wa::CertificateDetails::decode(leaf_details_raw.as_slice())?;
    if leaf_details.key.as_deref() != Some(server_static.as_slice()) {
        return Err(NoiseError::CertVerifyFailed("leaf key != server static"));
    }

    Ok(())
}

fn verify_ed25519(key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), ()> {
    let vk = VerifyingKey::from_bytes(key).map_err(|_| ())?;
    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| ())?;
    vk.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| ())
}
