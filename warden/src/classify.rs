use std::net::Ipv4Addr;

use base64::Engine;
use subtle::ConstantTimeEq;

use crate::crypto::B64_WIRE;
use crate::error::SpaError;
use crate::ServerConfig;

pub const MIN_SPA_DATA_SIZE: usize = 80;
pub const MAX_SPA_PACKET_LEN: usize = 1500;
/// Encoded length above which a packet can be an asymmetric (GPG) message.
pub const MIN_GPG_MSG_SIZE: usize = 655;

/// Base64 form of the "Salted__" symmetric-cipher magic. Legitimate packets
/// never carry it: the client strips it before transmission.
pub const B64_RIJNDAEL_SALT: &[u8] = b"U2FsdGVkX1";
/// Base64 form of the leading GPG packet octets, stripped the same way.
pub const B64_GPG_PREFIX: &[u8] = b"hQ";

pub const CLIENT_ID_SIZE: usize = 4;
/// 4 bytes encode to exactly 6 unpadded base64 characters.
pub const B64_CLIENT_ID_STR_LEN: usize = 6;

/// Per-datagram scratch record, captured at recv time and destroyed when the
/// pipeline returns.
#[derive(Debug)]
pub struct SpaPacket {
    pub data: Vec<u8>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Extracted client identifier; 0 unless identifier mode is enabled.
    pub client_id: u32,
    pub client_id_str: String,
}

impl SpaPacket {
    pub fn new(data: Vec<u8>, src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> SpaPacket {
        SpaPacket {
            data,
            src_ip: src.0,
            src_port: src.1,
            dst_ip: dst.0,
            dst_port: dst.1,
            client_id: 0,
            client_id_str: String::new(),
        }
    }

    /// Ciphertext view with the client-ID prefix (if any) removed.
    pub fn enc_data(&self) -> &[u8] {
        if self.client_id != 0 {
            &self.data[B64_CLIENT_ID_STR_LEN..]
        } else {
            &self.data
        }
    }
}

/// Timing-independent prefix test. Input content must not influence how long
/// the rejection branch takes, only input length may.
fn ct_prefix_match(data: &[u8], prefix: &[u8]) -> bool {
    if data.len() < prefix.len() {
        return false;
    }
    data[..prefix.len()].ct_eq(prefix).into()
}

fn is_base64(data: &[u8]) -> bool {
    let mut pad_seen = 0usize;
    for &b in data {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' => {
                if pad_seen > 0 {
                    return false;
                }
            }
            b'=' => {
                pad_seen += 1;
                if pad_seen > 2 {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Validate and, where needed, rewrite the raw SPA data in place. Never
/// decrypts. Distinguishes structural garbage (`BadData`) from data that is
/// plausibly just not ours (`NotSpaData`).
pub fn preprocess(pkt: &mut SpaPacket, cfg: &ServerConfig) -> Result<(), SpaError> {
    // Length gates are re-run here even though the collector already applied
    // them; the classifier owns its own contract.
    if pkt.data.len() < MIN_SPA_DATA_SIZE || pkt.data.len() > MAX_SPA_PACKET_LEN {
        return Err(SpaError::BadData);
    }

    // A replayed ciphertext with a pasted-on cipher prefix would hash to a
    // fresh digest, so both known prefixes are rejected outright. Constant
    // time: no early exit keyed on where the bytes differ.
    if ct_prefix_match(&pkt.data, B64_RIJNDAEL_SALT) {
        return Err(SpaError::BadData);
    }
    if pkt.data.len() > MIN_GPG_MSG_SIZE && ct_prefix_match(&pkt.data, B64_GPG_PREFIX) {
        return Err(SpaError::BadData);
    }

    // SPA over HTTP: a single GET whose path is the packet, base64url-flavored.
    if cfg.enable_spa_over_http
        && pkt.data.starts_with(b"GET /")
        && find_subslice(&pkt.data, b"User-Agent: Fwknop").is_some()
    {
        let mut unwrapped = Vec::with_capacity(pkt.data.len() - 5);
        for &b in &pkt.data[5..] {
            if b.is_ascii_whitespace() {
                break;
            }
            unwrapped.push(match b {
                b'-' => b'+',
                b'_' => b'/',
                other => other,
            });
        }
        if unwrapped.len() < MIN_SPA_DATA_SIZE {
            return Err(SpaError::BadData);
        }
        pkt.data = unwrapped;
    }

    if !is_base64(&pkt.data) {
        return Err(SpaError::NotSpaData);
    }

    // Identifier mode: the first six characters carry the 4-byte client ID.
    if cfg.client_id_mode {
        if pkt.data.len() <= B64_CLIENT_ID_STR_LEN {
            return Err(SpaError::NotSpaData);
        }
        let decoded = B64_WIRE
            .decode(&pkt.data[..B64_CLIENT_ID_STR_LEN])
            .map_err(|_| SpaError::NotSpaData)?;
        let bytes: [u8; CLIENT_ID_SIZE] =
            decoded.try_into().map_err(|_| SpaError::NotSpaData)?;
        let id = u32::from_le_bytes(bytes);
        if id == 0 {
            return Err(SpaError::NotSpaData);
        }
        pkt.client_id = id;
        pkt.client_id_str = id.to_string();
    }

    Ok(())
}
