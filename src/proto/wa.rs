//! Wire protobuf definitions.
//!
//! Covers the Noise handshake envelope, the client payload sent inside the
//! final handshake message, the server certificate chain, the signed device
//! identity exchanged during pairing, and the top-level `Message` container
//! the relay encrypts. High-level message content construction lives with
//! the caller; the relay only serializes what it is handed.

use prost::Message as ProstMessage;

/// Handshake envelope for the Noise XX exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "2")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "3")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "4")]
    pub client_finish: Option<ClientFinish>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientFinish {
    #[prost(bytes, optional, tag = "1")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Server certificate chain delivered encrypted inside the server hello.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CertChain {
    #[prost(message, optional, tag = "1")]
    pub leaf: Option<NoiseCertificate>,
    #[prost(message, optional, tag = "2")]
    pub intermediate: Option<NoiseCertificate>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NoiseCertificate {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
}

/// Decoded form of `NoiseCertificate::details`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CertificateDetails {
    #[prost(uint32, optional, tag = "1")]
    pub serial: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub issuer_serial: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub key: Option<Vec<u8>>,
    #[prost(int64, optional, tag = "4")]
    pub not_before: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub not_after: Option<i64>,
}

/// Client payload sent encrypted inside the client finish.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(message, optional, tag = "6")]
    pub web_info: Option<WebInfo>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub session_id: Option<i32>,
    #[prost(bool, optional, tag = "10")]
    pub short_connect: Option<bool>,
    #[prost(int32, optional, tag = "12")]
    pub connect_type: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub connect_reason: Option<i32>,
    #[prost(uint32, optional, tag = "16")]
    pub connect_attempt_count: Option<u32>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingData>,
    #[prost(bool, optional, tag = "23")]
    pub oc: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub app_version: Option<AppVersion>,
    #[prost(int32, optional, tag = "3")]
    pub release_channel: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub device: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub locale: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub manufacturer: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppVersion {
    #[prost(uint32, optional, tag = "1")]
    pub primary: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub secondary: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub tertiary: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WebInfo {
    #[prost(string, optional, tag = "1")]
    pub ref_token: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub version: Option<String>,
}

/// Registration data sent in the client payload when pairing a new device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DevicePairingData {
    #[prost(bytes, optional, tag = "1")]
    pub e_reg_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub e_key_type: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub e_s_key_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub e_s_key_val: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub e_s_key_sig: Option<Vec<u8>>,
}

/// HMAC-wrapped signed device identity from `pair-success`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedDeviceIdentityHmac {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub hmac: Option<Vec<u8>>,
}

/// Signed device identity carried inside the HMAC wrapper and attached to
/// outgoing stanzas whenever a `pkmsg` is present.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedDeviceIdentity {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub account_signature: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub account_signature_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

/// Decoded form of `SignedDeviceIdentity::details`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceIdentityDetails {
    #[prost(uint32, optional, tag = "1")]
    pub raw_id: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub key_index: Option<u32>,
}

// ---------------------------------------------------------------------------
// Message container
// ---------------------------------------------------------------------------

/// Top-level message container. The relay serializes this; it never builds
/// content beyond the protocol-internal variants (DSM, SKDM).
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(string, optional, tag = "1")]
    pub conversation: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub sender_key_distribution_message: Option<SenderKeyDistributionHolder>,
    #[prost(message, optional, tag = "3")]
    pub image_message: Option<MediaMessage>,
    #[prost(message, optional, tag = "7")]
    pub document_message: Option<MediaMessage>,
    #[prost(message, optional, tag = "8")]
    pub audio_message: Option<MediaMessage>,
    #[prost(message, optional, tag = "9")]
    pub video_message: Option<MediaMessage>,
    #[prost(message, optional, tag = "26")]
    pub sticker_message: Option<MediaMessage>,
    #[prost(message, optional, tag = "31")]
    pub device_sent_message: Option<DeviceSentMessage>,
    #[prost(message, optional, tag = "38")]
    pub reaction_message: Option<ReactionMessage>,
    #[prost(message, optional, tag = "49")]
    pub poll_creation_message: Option<PollCreationMessage>,
    #[prost(message, optional, tag = "58")]
    pub event_message: Option<EventMessage>,
    #[prost(message, optional, tag = "12")]
    pub protocol_message: Option<ProtocolMessage>,
}

/// Wrapper carrying serialized sender-key distribution material.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderKeyDistributionHolder {
    #[prost(string, optional, tag = "1")]
    pub group_id: Option<String>,
    #[prost(bytes, optional, tag = "2")]
    pub axolotl_sender_key_distribution_message: Option<Vec<u8>>,
}

/// Minimal media envelope, enough for stanza `mediatype` derivation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MediaMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(bytes, optional, tag = "3")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub media_key: Option<Vec<u8>>,
}

/// Own-devices variant of an outgoing 1:1 message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceSentMessage {
    #[prost(string, optional, tag = "1")]
    pub destination_jid: Option<String>,
    #[prost(message, optional, boxed, tag = "2")]
    pub message: Option<Box<Message>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReactionMessage {
    #[prost(string, optional, tag = "1")]
    pub target_message_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PollCreationMessage {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EventMessage {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

/// Protocol-internal message (edits, revokes, pins).
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolMessage {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
}

// ---------------------------------------------------------------------------
// Signal wire messages
// ---------------------------------------------------------------------------

/// Body of a 1:1 ratchet message (`msg`), MACed separately.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignalMessageProto {
    #[prost(bytes, optional, tag = "1")]
    pub ratchet_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    pub counter: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub previous_counter: Option<u32>,
    #[prost(bytes, optional, tag = "4")]
    pub ciphertext: Option<Vec<u8>>,
}

/// Body of a pre-key message (`pkmsg`) carrying session-bootstrap material.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PreKeySignalMessageProto {
    #[prost(uint32, optional, tag = "5")]
    pub registration_id: Option<u32>,
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub signed_pre_key_id: Option<u32>,
    #[prost(bytes, optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub identity_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub message: Option<Vec<u8>>,
}

/// Group ratchet message (`skmsg`) body, signed by the sender's signing key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderKeyMessageProto {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub ciphertext: Option<Vec<u8>>,
}

/// Sender-key distribution message delivered over a 1:1 session.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderKeyDistributionMessageProto {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub iteration: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub chain_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub signing_key: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Platform identifiers used in the user agent.
pub mod platform {
    pub const ANDROID: i32 = 0;
    pub const IOS: i32 = 1;
    pub const WEB: i32 = 14;
}

/// Serialize a message and append random padding: 1-16 bytes, each equal to
/// the pad length.
pub fn encode_wa_message(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.encoded_len() + 16);
    msg.encode(&mut buf).expect("vec write is infallible");
    let pad = (rand::random::<u8>() & 0x0F) + 1;
    buf.extend(std::iter::repeat(pad).take(pad as usize));
    buf
}

/// Strip message padding applied by `encode_wa_message`.
pub fn unpad_wa_message(data: &[u8]) -> Option<&[u8]> {
    let pad = *data.last()? as usize;
    if pad == 0 || pad > 16 || pad > data.len() {
        return None;
    }
    Some(&data[..data.len() - pad])
}

/// Serialize a newsletter message; newsletters are not E2E encrypted and
/// carry no padding.
pub fn encode_newsletter_message(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).expect("vec write is infallible");
    buf
}

/// Build a login client payload for an already-registered device.
pub fn login_payload(user: u64, device: u32) -> ClientPayload {
    ClientPayload {
        username: Some(user),
        passive: Some(false),
        user_agent: Some(web_user_agent()),
        web_info: Some(WebInfo {
            ref_token: None,
            version: Some("2.3000.1012170356".to_string()),
        }),
        device: Some(device),
        connect_type: Some(1),
        connect_reason: Some(1),
        connect_attempt_count: Some(0),
        oc: Some(false),
        ..Default::default()
    }
}

/// Build a registration client payload for a device being paired.
pub fn registration_payload(pairing: DevicePairingData) -> ClientPayload {
    ClientPayload {
        passive: Some(false),
        user_agent: Some(web_user_agent()),
        web_info: Some(WebInfo {
            ref_token: None,
            version: Some("2.3000.1012170356".to_string()),
        }),
        device_pairing_data: Some(pairing),
        connect_type: Some(1),
        connect_reason: Some(1),
        connect_attempt_count: Some(0),
        oc: Some(false),
        ..Default::default()
    }
}

fn web_user_agent() -> UserAgent {
    UserAgent {
        platform: Some(platform::WEB),
        app_version: Some(AppVersion {
            primary: Some(2),
            secondary: Some(3000),
            tertiary: Some(1012170356),
        }),
        release_channel: Some(0),
        os_version: Some("10.15.7".to_string()),
        device: Some("macOS".to_string()),
        locale: Some("en".to_string()),
        manufacturer: Some("Google Chrome".to_string()),
    }
}

/// Build the device pairing data block from registration credentials.
pub fn make_device_pairing_data(
    registration_id: u16,
    identity_key: &[u8; 32],
    signed_pre_key_id: u32,
    signed_pre_key: &[u8; 32],
    signed_pre_key_sig: &[u8; 64],
) -> DevicePairingData {
    let mut e_ident = Vec::with_capacity(33);
    e_ident.push(5);
    e_ident.extend_from_slice(identity_key);

    let mut e_s_key_val = Vec::with_capacity(33);
    e_s_key_val.push(5);
    e_s_key_val.extend_from_slice(signed_pre_key);

    DevicePairingData {
        e_reg_id: Some((registration_id as u32).to_be_bytes().to_vec()),
        e_key_type: Some(vec![5]),
        e_ident: Some(e_ident),
        e_s_key_id: Some(signed_pre_key_id.to_be_bytes()[1..].to_vec()),
        e_s_key_val: Some(e_s_key_val),
        e_s_key_sig: Some(signed_pre_key_sig.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_padding_roundtrip() {
        let msg = Message {
            conversation: Some("hi".into()),
            ..Default::default()
        };
        let padded = encode_wa_message(&msg);
        let stripped = unpad_wa_message(&padded).unwrap();
        let decoded = Message::decode(stripped).unwrap();
        assert_eq!(decoded.conversation.as_deref(), Some("hi"));
    }

    #[test]
    fn test_unpad_rejects_bad_padding() {
        assert!(unpad_wa_message(&[]).is_none());
        assert!(unpad_wa_message(&[0x00]).is_none());
        assert!(unpad_wa_message(&[0x11]).is_none());
    }

    #[test]
    fn test_pairing_data_key_prefixes() {
        let identity = [0xAA; 32];
        let spk = [0xBB; 32];
        let sig = [0xCC; 64];
        let data = make_device_pairing_data(1234, &identity, 1, &spk, &sig);

        assert_eq!(data.e_ident.as_ref().unwrap()[0], 5);
        assert_eq!(data.e_s_key_val.as_ref().unwrap()[0], 5);
        assert_eq!(data.e_s_key_id.as_ref().unwrap().len(), 3);
        assert_eq!(data.e_reg_id.as_ref().unwrap(), &1234u32.to_be_bytes());
    }
}
