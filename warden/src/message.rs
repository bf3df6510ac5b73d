use std::net::Ipv4Addr;

use crate::error::SpaError;

pub const MIN_IPV4_STR_LEN: usize = 7;
pub const MAX_IPV4_STR_LEN: usize = 15;
/// Bound on the request portion carried past the embedded source IP.
pub const MAX_DECRYPTED_SPA_LEN: usize = 1024;

/// Closed message-type enumeration; the discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Command = 0,
    LegacyAccess = 1,
    Access = 2,
    ClientTimeoutAccess = 3,
    NatAccess = 4,
    ClientTimeoutNatAccess = 5,
    LocalNatAccess = 6,
    ClientTimeoutLocalNatAccess = 7,
    ServiceAccess = 8,
    ClientTimeoutServiceAccess = 9,
}

impl MessageType {
    pub fn from_wire(v: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match v {
            0 => Command,
            1 => LegacyAccess,
            2 => Access,
            3 => ClientTimeoutAccess,
            4 => NatAccess,
            5 => ClientTimeoutNatAccess,
            6 => LocalNatAccess,
            7 => ClientTimeoutLocalNatAccess,
            8 => ServiceAccess,
            9 => ClientTimeoutServiceAccess,
            _ => return None,
        })
    }

    /// Everything that predates the service table is legacy-gated: only
    /// command and service requests pass when legacy access is disabled.
    pub fn is_legacy(self) -> bool {
        !matches!(
            self,
            MessageType::Command
                | MessageType::ServiceAccess
                | MessageType::ClientTimeoutServiceAccess
        )
    }

    pub fn is_nat(self) -> bool {
        matches!(
            self,
            MessageType::NatAccess | MessageType::ClientTimeoutNatAccess
        )
    }

    pub fn is_local_nat(self) -> bool {
        matches!(
            self,
            MessageType::LocalNatAccess | MessageType::ClientTimeoutLocalNatAccess
        )
    }

    pub fn is_service(self) -> bool {
        matches!(
            self,
            MessageType::ServiceAccess | MessageType::ClientTimeoutServiceAccess
        )
    }

    pub fn has_client_timeout(self) -> bool {
        matches!(
            self,
            MessageType::ClientTimeoutAccess
                | MessageType::ClientTimeoutNatAccess
                | MessageType::ClientTimeoutLocalNatAccess
                | MessageType::ClientTimeoutServiceAccess
        )
    }

    pub fn carries_nat_access(self) -> bool {
        self.is_nat() || self.is_local_nat()
    }
}

/// Decoded SPA plaintext:
/// `random:user:timestamp:version:msg_type:msg_body[:nat_access][:server_auth][:client_timeout]`
#[derive(Debug)]
pub struct SpaMessage {
    pub username: String,
    pub timestamp: i64,
    pub version: String,
    pub message_type: MessageType,
    pub message: String,
    pub nat_access: Option<String>,
    pub server_auth: Option<String>,
    pub client_timeout: u32,
}

/// Pull just the message type out of the plaintext. The coordinator needs it
/// before the full decode, and a failure here ends the stanza search rather
/// than continuing it.
pub fn parse_message_type(plaintext: &str) -> Option<MessageType> {
    let field = plaintext.split(':').nth(4)?;
    MessageType::from_wire(field.parse().ok()?)
}

/// Full field extraction. Any failure is reported as a context error; the
/// caller logs and moves on.
pub fn parse(plaintext: &str) -> Result<SpaMessage, SpaError> {
    let fields: Vec<&str> = plaintext.split(':').collect();
    if fields.len() < 6 || fields.len() > 9 {
        return Err(SpaError::CryptoContext);
    }
    if fields[0].is_empty() || fields[1].is_empty() {
        return Err(SpaError::CryptoContext);
    }
    let username = fields[1].to_string();
    let timestamp: i64 = fields[2].parse().map_err(|_| SpaError::CryptoContext)?;
    let version = fields[3].to_string();
    let message_type = fields[4]
        .parse::<u8>()
        .ok()
        .and_then(MessageType::from_wire)
        .ok_or(SpaError::CryptoContext)?;
    let message = fields[5].to_string();
    if message.is_empty() {
        return Err(SpaError::CryptoContext);
    }

    let mut rest: Vec<&str> = fields[6..].to_vec();

    let mut client_timeout = 0u32;
    if message_type.has_client_timeout() {
        let raw = rest.pop().ok_or(SpaError::CryptoContext)?;
        client_timeout = raw.parse().map_err(|_| SpaError::CryptoContext)?;
    }

    let mut nat_access = None;
    if message_type.carries_nat_access() {
        if rest.is_empty() {
            return Err(SpaError::CryptoContext);
        }
        nat_access = Some(rest.remove(0).to_string());
    }

    let server_auth = match rest.len() {
        0 => None,
        1 => Some(rest.remove(0).to_string()),
        _ => return Err(SpaError::CryptoContext),
    };

    Ok(SpaMessage {
        username,
        timestamp,
        version,
        message_type,
        message,
        nat_access,
        server_auth,
        client_timeout,
    })
}

/// How splitting the message body can fail; the two cases carry different
/// search semantics upstream.
#[derive(Debug, PartialEq, Eq)]
pub enum BodySplitError {
    /// No comma at all; another stanza could still make sense of the packet.
    MissingComma,
    /// A comma but no usable IPv4 in front of it; no stanza can fix that.
    InvalidIp,
}

/// Split `msg_body` into the embedded source IP and the request remainder.
/// The remainder is clamped to the decrypted-payload bound.
pub fn split_spa_message(body: &str) -> Result<(Ipv4Addr, String), BodySplitError> {
    let (ip_str, remain) = body.split_once(',').ok_or(BodySplitError::MissingComma)?;
    if ip_str.len() < MIN_IPV4_STR_LEN - 1 || ip_str.len() > MAX_IPV4_STR_LEN {
        return Err(BodySplitError::InvalidIp);
    }
    let ip: Ipv4Addr = ip_str.parse().map_err(|_| BodySplitError::InvalidIp)?;
    let mut remain = remain.to_string();
    remain.truncate(MAX_DECRYPTED_SPA_LEN);
    Ok((ip, remain))
}
