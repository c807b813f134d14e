//! Device registration: QR pairing and pairing-code bootstrap.
//!
//! The QR flow rotates server-issued refs on a timer and validates the
//! signed device identity delivered on `pair-success`. The pairing-code
//! flow wraps the pairing ephemeral key under a key derived from a short
//! human-readable code.

use std::time::Duration;

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::encode as b64encode;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use log::{debug, info};
use prost::Message as ProstMessage;
use qrcode::render::unicode;
use qrcode::QrCode;
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::mpsc;

use crate::binary::Node;
use crate::crypto::Hkdf;
use crate::proto::wa;
use crate::store::Credentials;
use crate::types::events::{ConnectionUpdate, CredsUpdate, Event};
use crate::types::Jid;

type HmacSha256 = Hmac<Sha256>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Crockford base32 alphabet used for pairing codes.
const PAIRING_CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
/// Pairing codes are exactly this long.
pub const PAIRING_CODE_LENGTH: usize = 8;

const ACCOUNT_SIGNATURE_PREFIX: [u8; 2] = [0x06, 0x00];
const DEVICE_SIGNATURE_PREFIX: [u8; 2] = [0x06, 0x01];

/// Pairing errors. All of them are fatal to the pairing attempt.
#[derive(Debug, thiserror::Error)]
pub enum PairError {
    #[error("malformed pairing stanza: {0}")]
    BadNode(&'static str),
    #[error("device identity HMAC mismatch")]
    HmacMismatch,
    #[error("device identity signature invalid")]
    SignatureInvalid,
    #[error("pairing code must be {PAIRING_CODE_LENGTH} characters")]
    InvalidCode,
    #[error("malformed protobuf: {0}")]
    BadProto(String),
}

impl From<prost::DecodeError> for PairError {
    fn from(e: prost::DecodeError) -> Self {
        PairError::BadProto(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// QR flow
// ---------------------------------------------------------------------------

/// Extract the ref tokens from a `pair-device` IQ.
pub fn parse_pair_device_refs(node: &Node) -> Result<Vec<String>, PairError> {
    let pair_device = node
        .get_child_by_tag("pair-device")
        .ok_or(PairError::BadNode("missing pair-device"))?;
    let refs: Vec<String> = pair_device
        .get_children_by_tag("ref")
        .iter()
        .filter_map(|r| r.get_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect();
    if refs.is_empty() {
        return Err(PairError::BadNode("no refs"));
    }
    Ok(refs)
}

/// Build the QR payload for one ref:
/// `ref,b64(noise_pub),b64(identity_pub),b64(adv_secret)`.
pub fn qr_payload(reference: &str, creds: &Credentials) -> String {
    format!(
        "{},{},{},{}",
        reference,
        b64encode(creds.noise_key.public),
        b64encode(creds.identity_key.public),
        b64encode(creds.adv_secret_key),
    )
}

/// How long a QR code at the given rotation index stays valid.
pub fn qr_timeout(index: usize) -> Duration {
    if index == 0 {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(20)
    }
}

/// Drive QR rotation: emit one `ConnectionUpdate{qr}` per ref, consuming
/// the next ref when the previous one times out. Ends when refs run out or
/// the receiver is gone.
pub async fn run_qr_rotation(
    refs: Vec<String>,
    creds: Credentials,
    events: mpsc::UnboundedSender<Event>,
) {
    for (index, reference) in refs.iter().enumerate() {
        let update = ConnectionUpdate {
            qr: Some(qr_payload(reference, &creds)),
            ..Default::default()
        };
        if events.send(Event::Connection(update)).is_err() {
            return;
        }
        debug!("emitted QR ref {index}, next in {:?}", qr_timeout(index));
        tokio::time::sleep(qr_timeout(index)).await;
    }
    info!("QR refs exhausted without pairing");
}

/// Render a QR payload for terminal display.
pub fn render_qr_ascii(data: &str) -> Result<String, PairError> {
    let code = QrCode::new(data.as_bytes()).map_err(|_| PairError::BadNode("qr render"))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

// ---------------------------------------------------------------------------
// pair-success
// ---------------------------------------------------------------------------

/// Outcome of a validated `pair-success`.
pub struct PairingOutcome {
    /// Fields to merge into the credentials.
    pub update: CredsUpdate,
    /// Serialized self-signed device identity for later stanzas.
    pub account: Vec<u8>,
    /// Reply stanza confirming the pairing.
    pub reply: Node,
}

/// Validate the signed device identity from `pair-success`, countersign it
/// and produce the confirmation reply. The credentials are only updated by
/// the caller after the reply is accepted.
pub fn configure_successful_pairing(
    node: &Node,
    creds: &Credentials,
) -> Result<PairingOutcome, PairError> {
    let pair_success = node
        .get_child_by_tag("pair-success")
        .ok_or(PairError::BadNode("missing pair-success"))?;
    let identity_bytes = pair_success
        .get_child_by_tag("device-identity")
        .and_then(|n| n.get_bytes())
        .ok_or(PairError::BadNode("missing device-identity"))?;
    let device_jid = pair_success
        .get_child_by_tag("device")
        .and_then(|n| n.get_attr_jid("jid"))
        .ok_or(PairError::BadNode("missing device jid"))?;
    let lid_jid = pair_success
        .get_child_by_tag("device")
        .and_then(|n| n.get_attr_jid("lid"));
    let platform = pair_success
        .get_child_by_tag("platform")
        .and_then(|n| n.get_attr_str("name"))
        .map(String::from);

    // Outer wrapper: HMAC under the advertising secret.
    let wrapper = wa::SignedDeviceIdentityHmac::decode(identity_bytes)?;
    let details = wrapper.details.ok_or(PairError::BadNode("hmac details"))?;
    let hmac = wrapper.hmac.ok_or(PairError::BadNode("hmac value"))?;

    let mut mac =
        HmacSha256::new_from_slice(&creds.adv_secret_key).expect("HMAC accepts any key size");
    mac.update(&details);
    if mac.finalize().into_bytes().as_slice() != hmac.as_slice() {
        return Err(PairError::HmacMismatch);
    }

    // Inner identity: the account signature must cover our identity key.
    let mut identity = wa::SignedDeviceIdentity::decode(details.as_slice())?;
    let inner_details = identity
        .details
        .clone()
        .ok_or(PairError::BadNode("identity details"))?;
    let account_sig = identity
        .account_signature
        .as_deref()
        .and_then(|s| <[u8; 64]>::try_from(s).ok())
        .ok_or(PairError::BadNode("account signature"))?;
    let account_key: [u8; 32] = identity
        .account_signature_key
        .as_deref()
        .and_then(|k| k.try_into().ok())
        .ok_or(PairError::BadNode("account signature key"))?;

    let mut signed_message =
        Vec::with_capacity(2 + inner_details.len() + creds.identity_key.public.len());
    signed_message.extend_from_slice(&ACCOUNT_SIGNATURE_PREFIX);
    signed_message.extend_from_slice(&inner_details);
    signed_message.extend_from_slice(&creds.identity_key.public);

    let verifying =
        VerifyingKey::from_bytes(&account_key).map_err(|_| PairError::SignatureInvalid)?;
    verifying
        .verify(&signed_message, &Signature::from_bytes(&account_sig))
        .map_err(|_| PairError::SignatureInvalid)?;

    // Countersign with our identity key.
    let mut device_message = Vec::with_capacity(2 + inner_details.len() + 64);
    device_message.extend_from_slice(&DEVICE_SIGNATURE_PREFIX);
    device_message.extend_from_slice(&inner_details);
    device_message.extend_from_slice(&creds.identity_key.public);
    device_message.extend_from_slice(&account_key);
    let signing = SigningKey::from_bytes(&creds.identity_key.private);
    identity.device_signature = Some(signing.sign(&device_message).to_bytes().to_vec());

    let details_proto = wa::DeviceIdentityDetails::decode(inner_details.as_slice())?;
    let key_index = details_proto.key_index.unwrap_or(0);

    let mut account = Vec::with_capacity(identity.encoded_len());
    identity
        .encode(&mut account)
        .expect("vec write is infallible");

    let mut identity_node = Node::new("device-identity");
    identity_node.set_attr("key-index", key_index as i64);
    identity_node.set_bytes(account.clone());
    let reply = Node::new("iq")
        .attr("type", "result")
        .attr("to", crate::types::jid::servers::DEFAULT_USER)
        .children(vec![Node::new("pair-device-sign").children(vec![identity_node])]);

    info!("paired as {device_jid} (platform {platform:?})");
    Ok(PairingOutcome {
        update: CredsUpdate {
            me: Some(device_jid),
            lid: lid_jid,
            registered: Some(true),
            platform,
            next_pre_key_id: None,
        },
        account,
        reply,
    })
}

/// Apply a pairing outcome to the credentials.
pub fn apply_pairing(creds: &mut Credentials, outcome: &PairingOutcome) {
    creds.me = outcome.update.me.clone();
    creds.lid = outcome.update.lid.clone();
    creds.platform = outcome.update.platform.clone();
    creds.account = Some(outcome.account.clone());
    creds.registered = true;
}

// ---------------------------------------------------------------------------
// Pairing code flow
// ---------------------------------------------------------------------------

/// Generate a fresh 8-character Crockford base32 pairing code.
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LENGTH)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % PAIRING_CODE_ALPHABET.len();
            PAIRING_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Derive the pairing wrap key from the code and a salt.
fn pairing_key(code: &str, salt: &[u8; 32]) -> [u8; 32] {
    Hkdf::derive_fixed(Some(salt), code.as_bytes(), b"link code pairing key")
}

/// Wrap the pairing ephemeral public key under the code-derived key:
/// `salt(32) || iv(16) || ctr-ciphertext(32)`.
pub fn wrap_pairing_ephemeral(code: &str, ephemeral_pub: &[u8; 32]) -> Result<Vec<u8>, PairError> {
    if code.len() != PAIRING_CODE_LENGTH {
        return Err(PairError::InvalidCode);
    }
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);

    let key = pairing_key(code, &salt);
    let mut buf = *ephemeral_pub;
    Aes256Ctr::new(&key.into(), &iv.into()).apply_keystream(&mut buf);

    let mut wrapped = Vec::with_capacity(32 + 16 + 32);
    wrapped.extend_from_slice(&salt);
    wrapped.extend_from_slice(&iv);
    wrapped.extend_from_slice(&buf);
    Ok(wrapped)
}

/// Unwrap a pairing ephemeral wrapped by `wrap_pairing_ephemeral`.
pub fn unwrap_pairing_ephemeral(code: &str, wrapped: &[u8]) -> Result<[u8; 32], PairError> {
    if wrapped.len() != 80 {
        return Err(PairError::BadNode("wrapped ephemeral length"));
    }
    let salt: [u8; 32] = wrapped[..32].try_into().expect("length checked");
    let iv: [u8; 16] = wrapped[32..48].try_into().expect("length checked");
    let mut buf: [u8; 32] = wrapped[48..].try_into().expect("length checked");

    let key = pairing_key(code, &salt);
    Aes256Ctr::new(&key.into(), &iv.into()).apply_keystream(&mut buf);
    Ok(buf)
}

/// Build the `companion_hello` registration IQ for the pairing-code flow.
/// A caller-supplied code must be exactly eight characters.
pub fn build_pairing_code_iq(
    code: Option<String>,
    phone: &Jid,
    creds: &Credentials,
) -> Result<(String, Node), PairError> {
    let code = match code {
        Some(code) if code.len() == PAIRING_CODE_LENGTH => code.to_uppercase(),
        Some(_) => return Err(PairError::InvalidCode),
        None => generate_pairing_code(),
    };
    let wrapped = wrap_pairing_ephemeral(&code, &creds.pairing_ephemeral.public)?;

    let mut wrapped_node = Node::new("link_code_pairing_wrapped_companion_ephemeral_pub");
    wrapped_node.set_bytes(wrapped);

    let iq = Node::new("iq")
        .attr("type", "set")
        .attr("xmlns", "md")
        .attr("to", crate::types::jid::servers::DEFAULT_USER)
        .children(vec![Node::new("link_code_companion_reg")
            .attr("jid", phone.clone())
            .attr("stage", "companion_hello")
            .children(vec![wrapped_node])]);
    Ok((code, iq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::jid::servers;

    fn refs_node(refs: &[&str]) -> Node {
        let ref_nodes = refs
            .iter()
            .map(|r| {
                let mut n = Node::new("ref");
                n.set_bytes(r.as_bytes().to_vec());
                n
            })
            .collect();
        Node::new("iq")
            .attr("type", "set")
            .children(vec![Node::new("pair-device").children(ref_nodes)])
    }

    #[test]
    fn test_parse_refs_and_payload() {
        let creds = Credentials::generate();
        let refs = parse_pair_device_refs(&refs_node(&["R1", "R2"])).unwrap();
        assert_eq!(refs, vec!["R1", "R2"]);

        let payload = qr_payload(&refs[0], &creds);
        let parts: Vec<&str> = payload.split(',').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "R1");
        assert_eq!(parts[1], b64encode(creds.noise_key.public));
        assert_eq!(parts[2], b64encode(creds.identity_key.public));
        assert_eq!(parts[3], b64encode(creds.adv_secret_key));
    }

    #[test]
    fn test_qr_rotation_timing() {
        assert_eq!(qr_timeout(0), Duration::from_secs(60));
        assert_eq!(qr_timeout(1), Duration::from_secs(20));
        assert_eq!(qr_timeout(5), Duration::from_secs(20));
    }

    #[test]
    fn test_empty_pair_device_rejected() {
        let node = Node::new("iq").children(vec![Node::new("pair-device")]);
        assert!(matches!(
            parse_pair_device_refs(&node),
            Err(PairError::BadNode(_))
        ));
    }

    /// Build a synthetic but fully-signed pair-success stanza.
    fn pair_success_node(creds: &Credentials, tamper_hmac: bool) -> Node {
        let account_key = SigningKey::from_bytes(&[11u8; 32]);

        let details_proto = wa::DeviceIdentityDetails {
            raw_id: Some(42),
            timestamp: Some(1_700_000_000),
            key_index: Some(1),
        };
        let mut details = Vec::new();
        ProstMessage::encode(&details_proto, &mut details).unwrap();

        let mut message = Vec::new();
        message.extend_from_slice(&ACCOUNT_SIGNATURE_PREFIX);
        message.extend_from_slice(&details);
        message.extend_from_slice(&creds.identity_key.public);
        let account_signature = account_key.sign(&message).to_bytes().to_vec();

        let identity = wa::SignedDeviceIdentity {
            details: Some(details),
            account_signature: Some(account_signature),
            account_signature_key: Some(account_key.verifying_key().to_bytes().to_vec()),
            device_signature: None,
        };
        let mut inner = Vec::new();
        ProstMessage::encode(&identity, &mut inner).unwrap();

        let mut mac =
            HmacSha256::new_from_slice(&creds.adv_secret_key).expect("HMAC accepts any key size");
        mac.update(&inner);
        let mut hmac = mac.finalize().into_bytes().to_vec();
        if tamper_hmac {
            hmac[0] ^= 0xFF;
        }

        let wrapper = wa::SignedDeviceIdentityHmac {
            details: Some(inner),
            hmac: Some(hmac),
        };
        let mut wrapper_bytes = Vec::new();
        ProstMessage::encode(&wrapper, &mut wrapper_bytes).unwrap();

        let mut identity_node = Node::new("device-identity");
        identity_node.set_bytes(wrapper_bytes);
        Node::new("iq").attr("type", "result").children(vec![
            Node::new("pair-success").children(vec![
                identity_node,
                Node::new("device")
                    .attr(
                        "jid",
                        Jid::with_device("15550009999", 7, servers::DEFAULT_USER),
                    )
                    .attr("lid", Jid::new("209999", servers::HIDDEN_USER)),
                Node::new("platform").attr("name", "android"),
            ]),
        ])
    }

    #[test]
    fn test_pair_success_validates_and_countersigns() {
        let mut creds = Credentials::generate();
        let node = pair_success_node(&creds, false);

        let outcome = configure_successful_pairing(&node, &creds).unwrap();
        assert_eq!(
            outcome.update.me,
            Some(Jid::with_device("15550009999", 7, servers::DEFAULT_USER))
        );
        assert_eq!(outcome.update.registered, Some(true));
        assert_eq!(outcome.update.platform.as_deref(), Some("android"));

        // The countersigned identity decodes and carries our signature.
        let identity = wa::SignedDeviceIdentity::decode(outcome.account.as_slice()).unwrap();
        assert!(identity.device_signature.is_some());

        // The reply carries the signed identity under pair-device-sign.
        assert!(outcome
            .reply
            .get_optional_child_by_tag(&["pair-device-sign", "device-identity"])
            .is_some());

        apply_pairing(&mut creds, &outcome);
        assert!(creds.registered);
        assert!(creds.account.is_some());
        assert_eq!(creds.lid, Some(Jid::new("209999", servers::HIDDEN_USER)));
    }

    #[test]
    fn test_pair_success_hmac_tamper_rejected() {
        let creds = Credentials::generate();
        let node = pair_success_node(&creds, true);
        assert!(matches!(
            configure_successful_pairing(&node, &creds),
            Err(PairError::HmacMismatch)
        ));
    }

    #[test]
    fn test_pair_success_wrong_identity_rejected() {
        // Signed for someone else's identity key: signature check fails.
        let creds = Credentials::generate();
        let other = Credentials::generate();
        let node = pair_success_node(&other, false);
        // Fix up the HMAC for our adv secret so only the signature differs.
        let mut forged = pair_success_node(&creds, false);
        let other_identity = node
            .get_optional_child_by_tag(&["pair-success", "device-identity"])
            .unwrap()
            .get_bytes()
            .unwrap()
            .to_vec();
        let other_inner = wa::SignedDeviceIdentityHmac::decode(other_identity.as_slice())
            .unwrap()
            .details
            .unwrap();
        let mut mac = HmacSha256::new_from_slice(&creds.adv_secret_key).unwrap();
        mac.update(&other_inner);
        let wrapper = wa::SignedDeviceIdentityHmac {
            details: Some(other_inner),
            hmac: Some(mac.finalize().into_bytes().to_vec()),
        };
        let mut wrapper_bytes = Vec::new();
        ProstMessage::encode(&wrapper, &mut wrapper_bytes).unwrap();
        if let Some(pair_success) = forged.get_child_by_tag("pair-success") {
            let mut patched = pair_success.clone();
            if let crate::binary::NodeContent::Children(children) = &mut patched.content {
                for child in children.iter_mut() {
                    if child.tag == "device-identity" {
                        child.set_bytes(wrapper_bytes.clone());
                    }
                }
            }
            forged = Node::new("iq").attr("type", "result").children(vec![patched]);
        }

        assert!(matches!(
            configure_successful_pairing(&forged, &creds),
            Err(PairError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_pairing_code_charset_and_length() {
        for _ in 0..20 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), PAIRING_CODE_LENGTH);
            assert!(code.bytes().all(|b| PAIRING_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_pairing_code_wrap_roundtrip() {
        let creds = Credentials::generate();
        let code = generate_pairing_code();
        let wrapped = wrap_pairing_ephemeral(&code, &creds.pairing_ephemeral.public).unwrap();
        assert_eq!(wrapped.len(), 80);

        let unwrapped = unwrap_pairing_ephemeral(&code, &wrapped).unwrap();
        assert_eq!(unwrapped, creds.pairing_ephemeral.public);

        // Wrong code yields a different key stream.
        let wrong = unwrap_pairing_ephemeral("AAAAAAAA", &wrapped).unwrap();
        assert_ne!(wrong, creds.pairing_ephemeral.public);
    }

    #[test]
    fn test_pairing_code_iq_shape() {
        let creds = Credentials::generate();
        let phone = Jid::new("15550009999", servers::DEFAULT_USER);
        let (code, iq) = build_pairing_code_iq(None, &phone, &creds).unwrap();
        assert_eq!(code.len(), PAIRING_CODE_LENGTH);

        let reg = iq.get_child_by_tag("link_code_companion_reg").unwrap();
        assert_eq!(reg.get_attr_str("stage"), Some("companion_hello"));
        assert!(reg
            .get_child_by_tag("link_code_pairing_wrapped_companion_ephemeral_pub")
            .is_some());

        // Caller-supplied codes must be exactly eight characters.
        assert!(matches!(
            build_pairing_code_iq(Some("SHORT".into()), &phone, &creds),
            Err(PairError::InvalidCode)
        ));
    }

    #[test]
    fn test_qr_ascii_render() {
        let rendered = render_qr_ascii("2@abc,def,ghi").unwrap();
        assert!(!rendered.is_empty());
    }
}
