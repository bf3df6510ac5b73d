use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Proto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoPort {
    pub proto: Proto,
    pub port: u16,
}

impl fmt::Display for ProtoPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proto, self.port)
    }
}

impl FromStr for ProtoPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, port) = s
            .split_once('/')
            .ok_or_else(|| format!("expected proto/port: {s}"))?;
        let proto = proto.trim().parse()?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| format!("bad port number: {port}"))?;
        if port == 0 {
            return Err("port 0 not allowed".to_string());
        }
        Ok(ProtoPort { proto, port })
    }
}

/// Comma-separated proto/port list, e.g. "tcp/22, udp/1194".
#[derive(Debug, Clone, Default)]
pub struct PortList(Vec<ProtoPort>);

impl PortList {
    pub fn contains(&self, pp: ProtoPort) -> bool {
        self.0.iter().any(|x| *x == pp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtoPort> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<ProtoPort> {
        self.0.first().copied()
    }
}

impl FromStr for PortList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            out.push(part.parse()?);
        }
        if out.is_empty() {
            return Err("empty port list".to_string());
        }
        Ok(PortList(out))
    }
}

#[derive(Debug, Clone, Copy)]
struct AddrMask {
    net: u32,
    mask: u32,
}

/// Source/destination match list: "ANY", single addresses, CIDR prefixes, or
/// dotted netmasks, comma-separated.
#[derive(Debug, Clone)]
pub struct AddressList(Vec<AddrMask>);

impl AddressList {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.0.iter().any(|m| ip & m.mask == m.net & m.mask)
    }
}

impl FromStr for AddressList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part.eq_ignore_ascii_case("any") {
                out.push(AddrMask { net: 0, mask: 0 });
                continue;
            }
            let (addr, mask) = match part.split_once('/') {
                None => (part, u32::MAX),
                Some((addr, m)) => {
                    let mask = if m.contains('.') {
                        u32::from(
                            m.parse::<Ipv4Addr>()
                                .map_err(|_| format!("bad netmask: {m}"))?,
                        )
                    } else {
                        let bits: u32 =
                            m.parse().map_err(|_| format!("bad prefix length: {m}"))?;
                        if bits > 32 {
                            return Err(format!("bad prefix length: {m}"));
                        }
                        if bits == 0 {
                            0
                        } else {
                            u32::MAX << (32 - bits)
                        }
                    };
                    (addr, mask)
                }
            };
            let net = u32::from(
                addr.parse::<Ipv4Addr>()
                    .map_err(|_| format!("bad address: {addr}"))?,
            );
            out.push(AddrMask { net, mask });
        }
        if out.is_empty() {
            return Err("empty address list".to_string());
        }
        Ok(AddressList(out))
    }
}

/// HMAC algorithm selection for a stanza.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacKind {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HmacKind {
    pub fn digest_len(self) -> usize {
        match self {
            HmacKind::Sha256 => 32,
            HmacKind::Sha384 => 48,
            HmacKind::Sha512 => 64,
        }
    }
}

fn de_addr_list<'de, D>(de: D) -> Result<AddressList, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(de)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn de_opt_addr_list<'de, D>(de: D) -> Result<Option<AddressList>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(de)?;
    s.map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

fn de_opt_port_list<'de, D>(de: D) -> Result<Option<PortList>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(de)?;
    s.map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

fn de_opt_id_list<'de, D>(de: D) -> Result<Option<Vec<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(de)?;
    s.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u32>().map_err(serde::de::Error::custom))
            .collect()
    })
    .transpose()
}

fn de_opt_str_list<'de, D>(de: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(de)?;
    Ok(s.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }))
}

/// One access policy entry. Long-lived; referenced read-only by in-flight
/// packets, so the only mutable bit (the sticky expired flag) is atomic.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessStanza {
    #[serde(deserialize_with = "de_addr_list")]
    pub source: AddressList,
    #[serde(default, deserialize_with = "de_opt_addr_list")]
    pub destination: Option<AddressList>,
    /// Identifier-mode lookup key.
    #[serde(default)]
    pub client_id: Option<u32>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub hmac_key: Option<String>,
    #[serde(default)]
    pub hmac_type: HmacKind,
    #[serde(default, deserialize_with = "de_opt_port_list")]
    pub open_ports: Option<PortList>,
    #[serde(default, deserialize_with = "de_opt_port_list")]
    pub restrict_ports: Option<PortList>,
    #[serde(default, deserialize_with = "de_opt_id_list")]
    pub service_list: Option<Vec<u32>>,
    #[serde(default)]
    pub require_username: Option<String>,
    #[serde(default)]
    pub require_source_address: bool,
    #[serde(default)]
    pub fw_access_timeout: u32,
    /// Epoch seconds after which this stanza no longer grants anything.
    #[serde(default)]
    pub access_expire: Option<i64>,
    #[serde(default)]
    pub enable_cmd_exec: bool,
    #[serde(default)]
    pub enable_cmd_sudo_exec: bool,
    #[serde(default)]
    pub cmd_exec_user: Option<String>,
    #[serde(default)]
    pub cmd_exec_group: Option<String>,
    #[serde(default)]
    pub cmd_exec_uid: u32,
    #[serde(default)]
    pub cmd_exec_gid: u32,
    #[serde(default)]
    pub cmd_sudo_exec_user: Option<String>,
    #[serde(default)]
    pub cmd_sudo_exec_group: Option<String>,
    #[serde(default)]
    pub cmd_cycle_open: Option<String>,
    #[serde(default)]
    pub cmd_cycle_close: Option<String>,
    #[serde(default)]
    pub use_gpg: bool,
    #[serde(default)]
    pub gpg_exe: Option<PathBuf>,
    #[serde(default)]
    pub gpg_home_dir: Option<PathBuf>,
    #[serde(default)]
    pub gpg_decrypt_id: Option<String>,
    #[serde(default)]
    pub gpg_decrypt_pw: Option<String>,
    #[serde(default)]
    pub gpg_allow_no_pw: bool,
    #[serde(default)]
    pub gpg_require_sig: bool,
    #[serde(default)]
    pub gpg_ignore_sig_error: bool,
    #[serde(default, deserialize_with = "de_opt_str_list")]
    pub gpg_remote_id: Option<Vec<String>>,
    #[serde(default, deserialize_with = "de_opt_str_list")]
    pub gpg_remote_fpr: Option<Vec<String>>,
    #[serde(skip)]
    expired: AtomicBool,
}

impl AccessStanza {
    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_none() && !self.use_gpg {
            return Err("no symmetric key and GPG not enabled".to_string());
        }
        if self.hmac_key.is_none() {
            return Err("hmac_key is required".to_string());
        }
        if self.use_gpg {
            if self.gpg_home_dir.is_none() {
                return Err("gpg_home_dir is required when use_gpg is set".to_string());
            }
            if self.gpg_decrypt_pw.is_none() && !self.gpg_allow_no_pw {
                return Err(
                    "gpg_decrypt_pw is required unless gpg_allow_no_pw is set".to_string()
                );
            }
        }
        Ok(())
    }

    /// Sticky expiration: once observed past `access_expire` the stanza stays
    /// expired for every later packet.
    pub fn expired_now(&self, now: i64) -> bool {
        match self.access_expire {
            Some(when) if when > 0 => {
                if self.expired.load(Ordering::Relaxed) {
                    return true;
                }
                if now > when {
                    self.expired.store(true, Ordering::Relaxed);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Every requested proto/port must clear the restrict list and, when an
    /// open list is configured, appear in it.
    pub fn check_port_access(&self, request: &str) -> bool {
        let requested: PortList = match request.parse() {
            Ok(list) => list,
            Err(_) => return false,
        };
        for pp in requested.iter() {
            if let Some(restrict) = &self.restrict_ports {
                if restrict.contains(*pp) {
                    return false;
                }
            }
            if let Some(open) = &self.open_ports {
                if !open.contains(*pp) {
                    return false;
                }
            }
        }
        true
    }

    /// Every requested service ID must appear in the stanza's service list.
    pub fn check_service_access(&self, request: &str) -> bool {
        let Some(allowed) = &self.service_list else {
            return false;
        };
        let mut any = false;
        for part in request.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Ok(id) = part.parse::<u32>() else {
                return false;
            };
            if !allowed.contains(&id) {
                return false;
            }
            any = true;
        }
        any
    }
}

/// The stanza collection plus both selection models: document-order scan for
/// IP mode and the mutex-guarded ID map for identifier mode. Stanza numbers
/// are 1-based document order, stable across both.
pub struct StanzaSet {
    stanzas: Vec<Arc<AccessStanza>>,
    by_client_id: Mutex<HashMap<String, (usize, Arc<AccessStanza>)>>,
}

impl StanzaSet {
    pub fn new(stanzas: Vec<AccessStanza>) -> StanzaSet {
        let stanzas: Vec<Arc<AccessStanza>> = stanzas.into_iter().map(Arc::new).collect();
        let mut by_client_id = HashMap::new();
        for (idx, acc) in stanzas.iter().enumerate() {
            if let Some(id) = acc.client_id {
                by_client_id.insert(id.to_string(), (idx + 1, Arc::clone(acc)));
            }
        }
        StanzaSet {
            stanzas,
            by_client_id: Mutex::new(by_client_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stanzas.is_empty()
    }

    /// IP-mode precheck: does any stanza's source list cover this address?
    pub fn any_source_match(&self, ip: Ipv4Addr) -> bool {
        self.stanzas.iter().any(|acc| acc.source.contains(ip))
    }

    /// IP-mode candidates: every stanza, numbered; per-stanza source and
    /// destination filtering happens inside the evaluator.
    pub fn candidates(&self) -> Vec<(usize, Arc<AccessStanza>)> {
        self.stanzas
            .iter()
            .enumerate()
            .map(|(idx, acc)| (idx + 1, Arc::clone(acc)))
            .collect()
    }

    /// Identifier-mode lookup; at most one candidate.
    pub fn lookup_client_id(&self, id_str: &str) -> Option<(usize, Arc<AccessStanza>)> {
        let tbl = self.by_client_id.lock().expect("stanza map lock poisoned");
        tbl.get(id_str)
            .map(|(num, acc)| (*num, Arc::clone(acc)))
    }
}
