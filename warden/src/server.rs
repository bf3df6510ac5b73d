use std::fs::File;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::access::StanzaSet;
use crate::classify::{SpaPacket, MAX_SPA_PACKET_LEN};
use crate::cmd::CmdCycle;
use crate::config::ServerConfig;
use crate::fw::Firewall;
use crate::now_unix;
use crate::pipeline;
use crate::replay::ReplayStore;

#[derive(Debug, serde::Serialize)]
struct LogLine<'a> {
    ts: i64,
    client_ip: String,
    decision: &'a str,
    reason: &'a str,
    opens_for_secs: u64,
}

/// JSONL decision log: one line per datagram verdict, to stderr or a file.
/// Source addresses can be hashed for log shipping.
pub struct AuditLog {
    file: Option<Mutex<File>>,
    obfuscate: bool,
}

impl AuditLog {
    pub fn new(path: Option<&std::path::Path>, obfuscate: bool) -> Result<AuditLog> {
        let file = match path {
            Some(p) => Some(Mutex::new(
                File::create(p).with_context(|| format!("create {}", p.display()))?,
            )),
            None => None,
        };
        Ok(AuditLog { file, obfuscate })
    }

    fn hash_ip(ip: Ipv4Addr) -> String {
        use std::hash::{Hash, Hasher};
        let mut s = std::collections::hash_map::DefaultHasher::new();
        ip.hash(&mut s);
        format!("{:x}", s.finish())
    }

    fn log(&self, ip: Ipv4Addr, decision: &str, reason: &str, secs: u64) {
        let line = LogLine {
            ts: now_unix(),
            client_ip: if self.obfuscate {
                Self::hash_ip(ip)
            } else {
                ip.to_string()
            },
            decision,
            reason,
            opens_for_secs: secs,
        };
        let Ok(mut rendered) = serde_json::to_string(&line) else {
            return;
        };
        rendered.push('\n');
        match &self.file {
            Some(f) => {
                if let Ok(mut f) = f.lock() {
                    let _ = f.write_all(rendered.as_bytes());
                }
            }
            None => eprint!("{rendered}"),
        }
    }

    pub fn log_allow(&self, ip: Ipv4Addr, reason: &str, secs: u64) {
        self.log(ip, "allow", reason, secs);
    }

    pub fn log_drop(&self, ip: Ipv4Addr, reason: &str, secs: u64) {
        self.log(ip, "drop", reason, secs);
    }
}

/// The long-lived server value handed read-only to the pipeline. Interior
/// mutability is confined to the replay store, the stanza ID map, and the
/// command-cycle queue, each behind its own lock.
pub struct Server {
    pub config: ServerConfig,
    pub stanzas: StanzaSet,
    pub replay: ReplayStore,
    pub fw: Arc<dyn Firewall>,
    pub cmd_cycle: CmdCycle,
    pub audit: AuditLog,
    pub test: bool,
    stop: Arc<AtomicBool>,
    packet_ctr: AtomicU64,
}

impl Server {
    pub fn new(mut config: ServerConfig, fw: Arc<dyn Firewall>, test: bool) -> Result<Server> {
        config.validate()?;

        let replay = if !config.enable_digest_persistence {
            ReplayStore::disabled()
        } else {
            match &config.digest_file {
                Some(path) => ReplayStore::open(path)?,
                None => ReplayStore::in_memory(),
            }
        };

        let audit = AuditLog::new(config.audit_log.as_deref(), config.obfuscate_ip)?;
        let stanzas = StanzaSet::new(std::mem::take(&mut config.access));
        if stanzas.is_empty() {
            warn!("No access stanzas configured; every SPA packet will be dropped");
        }

        Ok(Server {
            config,
            stanzas,
            replay,
            fw,
            cmd_cycle: CmdCycle::new(),
            audit,
            test,
            stop: Arc::new(AtomicBool::new(false)),
            packet_ctr: AtomicU64::new(0),
        })
    }

    /// Flag checked once per collector iteration; in-flight packets finish.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn packets_processed(&self) -> u64 {
        self.packet_ctr.load(Ordering::Relaxed)
    }

    /// Collect SPA packets over UDP. The socket is non-blocking through its
    /// read timeout so housekeeping (rule expiry, command-cycle closes) runs
    /// even when the network is quiet.
    pub fn run_udp_server(&self) -> Result<()> {
        let sock =
            UdpSocket::bind(&self.config.listen).with_context(|| format!("bind {}", self.config.listen))?;
        sock.set_read_timeout(Some(Duration::from_millis(self.config.select_timeout_ms)))?;

        let local = sock.local_addr()?;
        let (dst_ip, dst_port) = match local {
            SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
            SocketAddr::V6(_) => (Ipv4Addr::UNSPECIFIED, local.port()),
        };

        info!("Kicking off UDP server to listen on {}.", self.config.listen);

        let mut rules_ctr: u32 = 0;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("udp_server: terminating signal received, will stop.");
                break;
            }

            if !self.test {
                let mut full_sweep = false;
                if self.config.rules_check_threshold > 0 {
                    rules_ctr += 1;
                    if rules_ctr % self.config.rules_check_threshold == 0 {
                        full_sweep = true;
                        rules_ctr = 0;
                    }
                }
                self.fw.check_and_expire_rules(full_sweep);
                self.cmd_cycle.run_due();
            }

            let mut buf = [0u8; MAX_SPA_PACKET_LEN + 1];
            match sock.recv_from(&mut buf) {
                Ok((pkt_len, peer)) => {
                    if pkt_len > 0 && pkt_len <= MAX_SPA_PACKET_LEN {
                        if let SocketAddr::V4(peer_v4) = peer {
                            debug!(
                                "udp_server: Got UDP datagram ({} bytes) from: {}",
                                pkt_len,
                                peer_v4.ip()
                            );

                            let mut pkt = SpaPacket::new(
                                buf[..pkt_len].to_vec(),
                                (*peer_v4.ip(), peer_v4.port()),
                                (dst_ip, dst_port),
                            );
                            pipeline::incoming_spa(self, &mut pkt);
                        } else {
                            debug!("udp_server: ignoring non-IPv4 datagram from {peer}");
                        }
                    }

                    // discarded datagrams count too
                    let seen = self.packet_ctr.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.config.packet_limit > 0 && seen >= self.config.packet_limit {
                        warn!(
                            "* Incoming packet count limit of {} reached",
                            self.config.packet_limit
                        );
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // read timeout; loop back around for housekeeping
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.replay.flush();
        self.cmd_cycle.flush_all();
        if !self.test {
            self.fw.cleanup_all();
        }
        Ok(())
    }
}
