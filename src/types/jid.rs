//! JID (Jabber ID) addressing.
//!
//! JIDs identify users, their linked identities (LIDs), groups, newsletters
//! and broadcast lists. A user-level JID may carry a device number; device 0
//! is the primary device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known JID servers.
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
    pub const NEWSLETTER: &str = "newsletter";
    pub const HOSTED: &str = "hosted";
    pub const HOSTED_LID: &str = "hosted.lid";
}

/// Domain type discriminants used in signal addresses.
pub const WHATSAPP_DOMAIN: u8 = 0;
pub const LID_DOMAIN: u8 = 1;
pub const HOSTED_DOMAIN: u8 = 128;
pub const HOSTED_LID_DOMAIN: u8 = 129;

/// Device number reserved as a marker. Never a valid encryption target.
pub const HOSTED_DEVICE_ID: u16 = 99;

/// MessageId is the client-generated ID of a message.
pub type MessageId = String;

/// A WhatsApp address: `user[:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl Jid {
    /// Creates a device-0 JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Creates a JID with an explicit device number.
    pub fn with_device(user: impl Into<String>, device: u16, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device,
            server: server.into(),
        }
    }

    /// Returns the domain type discriminant for this JID's server.
    pub fn domain_type(&self) -> u8 {
        match self.server.as_str() {
            servers::HIDDEN_USER => LID_DOMAIN,
            servers::HOSTED => HOSTED_DOMAIN,
            servers::HOSTED_LID => HOSTED_LID_DOMAIN,
            _ => WHATSAPP_DOMAIN,
        }
    }

    /// Returns this JID with the device number stripped.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            device: 0,
            server: self.server.clone(),
        }
    }

    pub fn is_lid(&self) -> bool {
        self.server == servers::HIDDEN_USER || self.server == servers::HOSTED_LID
    }

    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == servers::NEWSLETTER
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == servers::BROADCAST
    }

    /// Returns true if this is the status broadcast pseudo-chat.
    pub fn is_status_broadcast(&self) -> bool {
        self.server == servers::BROADCAST && self.user == "status"
    }

    pub fn is_hosted(&self) -> bool {
        self.server == servers::HOSTED || self.server == servers::HOSTED_LID
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    /// Whether an end-to-end session may be established with this address.
    /// Hosted devices and the reserved device 99 are markers, not targets.
    pub fn is_encryption_target(&self) -> bool {
        !self.is_hosted() && self.device != HOSTED_DEVICE_ID
    }

    /// Returns the user part of the signal protocol address, with the
    /// domain type appended when non-default.
    pub fn signal_user(&self) -> String {
        let domain = self.domain_type();
        if domain != WHATSAPP_DOMAIN {
            format!("{}_{}", self.user, domain)
        } else {
            self.user.clone()
        }
    }

    /// Returns the full signal protocol address string,
    /// `{user}[_{domainType}].{device}`.
    pub fn signal_address(&self) -> String {
        format!("{}.{}", self.signal_user(), self.device)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to parse JID: {0}")]
pub struct ParseJidError(pub String);

impl FromStr for Jid {
    type Err = ParseJidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            Some((u, srv)) => (u, srv),
            None => return Ok(Jid::new("", s)),
        };

        let (user, device) = match user_part.split_once(':') {
            Some((u, dev)) => {
                let device = dev
                    .parse()
                    .map_err(|_| ParseJidError(format!("bad device in {s:?}")))?;
                (u, device)
            }
            None => (user_part, 0),
        };

        if user.contains(':') {
            return Err(ParseJidError(format!("unexpected extra colon in {s:?}")));
        }

        Ok(Jid {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}

// Well-known JIDs
lazy_static::lazy_static! {
    pub static ref SERVER_JID: Jid = Jid::new("", servers::DEFAULT_USER);
    pub static ref GROUP_SERVER_JID: Jid = Jid::new("", servers::GROUP);
    pub static ref BROADCAST_SERVER_JID: Jid = Jid::new("", servers::BROADCAST);
    pub static ref STATUS_BROADCAST_JID: Jid = Jid::new("status", servers::BROADCAST);
}
