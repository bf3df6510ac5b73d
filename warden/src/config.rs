use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::access::{AccessStanza, Proto};

/// Upper bound accepted for `max_packet_age` (seconds).
const MAX_PACKET_AGE_CEILING: i64 = 100_000;

/// One entry of the service table: a service ID a client may request by
/// number instead of naming a protocol/port directly.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDef {
    pub proto: Proto,
    pub port: u16,
}

/// A requested service ID resolved through the service table.
#[derive(Debug, Clone, Copy)]
pub struct ServiceData {
    pub id: u32,
    pub proto: Proto,
    pub port: u16,
}

/// Daemon configuration, read from a JSON file. Access stanzas ride along in
/// the `access` array; producing them from whatever policy format an operator
/// prefers is the job of an external tool.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// UDP listen address, e.g. 0.0.0.0:62201
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Socket read timeout between housekeeping passes (ms)
    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,
    #[serde(default)]
    pub enable_spa_over_http: bool,
    /// Identifier mode: stanza selection by the 4-byte client ID prefix
    /// instead of a source-IP scan.
    #[serde(default)]
    pub client_id_mode: bool,
    #[serde(default = "default_true")]
    pub enable_packet_aging: bool,
    #[serde(default = "default_max_packet_age")]
    pub max_packet_age: i64,
    #[serde(default = "default_true")]
    pub enable_digest_persistence: bool,
    /// Digest set backing file; memory-only replay suppression when unset.
    #[serde(default)]
    pub digest_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub allow_legacy_access_requests: bool,
    #[serde(default)]
    pub enable_forwarding: bool,
    #[serde(default)]
    pub enable_local_nat: bool,
    /// Every N collector iterations, expire-check with a full sweep.
    #[serde(default = "default_rules_check_threshold")]
    pub rules_check_threshold: u32,
    #[serde(default = "default_sudo_exe")]
    pub sudo_exe: PathBuf,
    /// Stop after this many datagrams (0 = run forever); test harness knob.
    #[serde(default)]
    pub packet_limit: u64,
    /// Hash client IPs in the decision log.
    #[serde(default)]
    pub obfuscate_ip: bool,
    /// JSONL decision log path; stderr when unset.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
    /// Hard ceiling applied to setuid/setgid command runs (seconds).
    #[serde(default = "default_cmd_timeout_secs")]
    pub cmd_timeout_secs: u64,
    #[serde(default = "default_nft_family")]
    pub nft_family: String,
    #[serde(default = "default_nft_table")]
    pub nft_table: String,
    #[serde(default = "default_nft_set")]
    pub nft_set: String,
    #[serde(default)]
    pub services: HashMap<u32, ServiceDef>,
    #[serde(default)]
    pub access: Vec<AccessStanza>,
}

fn default_listen() -> String {
    "0.0.0.0:62201".to_string()
}
fn default_select_timeout_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_max_packet_age() -> i64 {
    120
}
fn default_rules_check_threshold() -> u32 {
    20
}
fn default_sudo_exe() -> PathBuf {
    PathBuf::from("/usr/bin/sudo")
}
fn default_cmd_timeout_secs() -> u64 {
    30
}
fn default_nft_family() -> String {
    "inet".to_string()
}
fn default_nft_table() -> String {
    "filter".to_string()
}
fn default_nft_set() -> String {
    "spa_allow".to_string()
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<ServerConfig> {
        let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: ServerConfig =
            serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_age < 1 || self.max_packet_age > MAX_PACKET_AGE_CEILING {
            return Err(anyhow!("max_packet_age out of range"));
        }
        if self.select_timeout_ms == 0 {
            return Err(anyhow!("select_timeout_ms must be nonzero"));
        }
        for (num, acc) in self.access.iter().enumerate() {
            acc.validate()
                .map_err(|e| anyhow!("access stanza #{}: {}", num + 1, e))?;
            if self.client_id_mode && acc.client_id.is_none() {
                return Err(anyhow!(
                    "access stanza #{}: client_id required in identifier mode",
                    num + 1
                ));
            }
        }
        Ok(())
    }
}
