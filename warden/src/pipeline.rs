use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::access::AccessStanza;
use crate::classify::{self, SpaPacket};
use crate::cmd::{self, DIRECT_CMD_TIMEOUT};
use crate::config::{ServerConfig, ServiceData};
use crate::crypto::{self, AsymOutcome, EncryptionType, GpgVerdict};
use crate::error::SpaError;
use crate::message::{self, BodySplitError, MessageType};
use crate::now_unix;
use crate::replay::{self, SpaDigest};
use crate::server::Server;

/// Default access window when neither the client nor the stanza asks for one.
pub const DEF_FW_ACCESS_TIMEOUT: u32 = 30;

/// Verdict a stanza attempt hands back to the coordinator: try the next
/// candidate, or the packet is finished (granted, handled, or unfixable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAction {
    KeepSearching,
    StopSearching,
}

use SearchAction::{KeepSearching, StopSearching};

enum DecryptOutcome {
    Sym(Zeroizing<String>),
    Asym(AsymOutcome),
}

impl DecryptOutcome {
    fn plaintext(&self) -> &str {
        match self {
            DecryptOutcome::Sym(pt) => pt.as_str(),
            DecryptOutcome::Asym(a) => a.plaintext.as_str(),
        }
    }
}

/// What finally happened to a packet, for the decision log.
type Handled = (&'static str, u32);

/// Per-datagram state machine: classify, replay-precheck, select candidate
/// stanzas, then drive the per-stanza attempt loop. All scratch state,
/// plaintext included, dies on every exit path of this function.
pub fn incoming_spa(srv: &Server, pkt: &mut SpaPacket) {
    debug!("incoming_spa(): datagram from {}", pkt.src_ip);

    if let Err(e) = classify::preprocess(pkt, &srv.config) {
        debug!("[{}] packet classifier rejected incoming data: {}", pkt.src_ip, e);
        srv.audit.log_drop(pkt.src_ip, e.reason(), 0);
        return;
    }

    // Digest of the untouched ciphertext, before any decryption attempt, so
    // that a replay which would no longer decrypt is still suppressed.
    let digest = replay::spa_digest(&pkt.data);
    if srv.replay.contains(&digest) {
        warn!("[{}] Replay detected of previously accepted SPA packet", pkt.src_ip);
        srv.audit.log_drop(pkt.src_ip, SpaError::Replay.reason(), 0);
        return;
    }

    let candidates = if srv.config.client_id_mode {
        match srv.stanzas.lookup_client_id(&pkt.client_id_str) {
            Some(found) => vec![found],
            None => {
                warn!(
                    "[{}] No access data found for client ID: {}",
                    pkt.src_ip, pkt.client_id
                );
                srv.audit
                    .log_drop(pkt.src_ip, SpaError::AccessDenied.reason(), 0);
                return;
            }
        }
    } else {
        if !srv.stanzas.any_source_match(pkt.src_ip) {
            warn!("No access data found for source IP: {}", pkt.src_ip);
            srv.audit
                .log_drop(pkt.src_ip, SpaError::AccessDenied.reason(), 0);
            return;
        }
        srv.stanzas.candidates()
    };

    let mut added_replay_digest = false;
    let mut handled: Option<Handled> = None;

    for (stanza_num, acc) in candidates {
        let action = process_stanza(
            srv,
            pkt,
            &acc,
            stanza_num,
            &digest,
            &mut added_replay_digest,
            &mut handled,
        );
        // per-attempt plaintext and derived keys were dropped (and zeroed)
        // inside process_stanza before we get here
        match action {
            KeepSearching => continue,
            StopSearching => break,
        }
    }

    match handled {
        Some((reason, secs)) => srv.audit.log_allow(pkt.src_ip, reason, u64::from(secs)),
        None => srv
            .audit
            .log_drop(pkt.src_ip, SpaError::AccessDenied.reason(), 0),
    }
}

fn src_dst_check(acc: &AccessStanza, pkt: &SpaPacket, stanza_num: usize) -> bool {
    if !acc.source.contains(pkt.src_ip)
        || acc
            .destination
            .as_ref()
            .is_some_and(|d| !d.contains(pkt.dst_ip))
    {
        debug!(
            "(stanza #{}) SPA packet ({} -> {}) filtered by SOURCE and/or DESTINATION criteria",
            stanza_num, pkt.src_ip, pkt.dst_ip
        );
        return false;
    }
    true
}

fn check_pkt_age(cfg: &ServerConfig, timestamp: i64, src: Ipv4Addr, stanza_num: usize) -> bool {
    if cfg.enable_packet_aging {
        let ts_diff = (now_unix() - timestamp).abs();
        if ts_diff > cfg.max_packet_age {
            warn!(
                "[{}] (stanza #{}) SPA data time difference is too great ({} seconds).",
                src, stanza_num, ts_diff
            );
            return false;
        }
    }
    true
}

/// One attempt of one packet against one stanza: crypto, replay insert, the
/// predicate cascade, then the action dispatch.
#[allow(clippy::too_many_lines)]
fn process_stanza(
    srv: &Server,
    pkt: &SpaPacket,
    acc: &AccessStanza,
    stanza_num: usize,
    digest: &SpaDigest,
    added_replay_digest: &mut bool,
    handled: &mut Option<Handled>,
) -> SearchAction {
    let src = pkt.src_ip;

    // 1. source/destination filter
    if !src_dst_check(acc, pkt, stanza_num) {
        return KeepSearching;
    }

    info!(
        "(stanza #{}) SPA Packet from IP: {} received with access source match",
        stanza_num, src
    );

    // 2. sticky stanza expiration
    if acc.expired_now(now_unix()) {
        info!("[{}] (stanza #{}) Access stanza has expired", src, stanza_num);
        return KeepSearching;
    }

    // 3. decrypt: symmetric first; asymmetric only when the prefix-free
    // ciphertext looks asymmetric and symmetric did not already succeed
    let enc_data = pkt.enc_data();
    let enc_type = crypto::encryption_type(enc_data);
    let mut attempted = false;
    let mut outcome: Option<DecryptOutcome> = None;

    if let Some(key) = &acc.key {
        // command-enabled stanzas get a symmetric try regardless of the
        // apparent encryption type, so signed commands work either way
        if enc_type == EncryptionType::RijndaelSymmetric || acc.enable_cmd_exec {
            attempted = true;
            if let Some(hmac_key) = acc.hmac_key.as_deref() {
                if let Ok(pt) = crypto::decrypt_symmetric(
                    enc_data,
                    key.as_bytes(),
                    hmac_key.as_bytes(),
                    acc.hmac_type,
                ) {
                    outcome = Some(DecryptOutcome::Sym(pt));
                }
            }
        }
    }

    if acc.use_gpg && enc_type == EncryptionType::AsymmetricSigned && outcome.is_none() {
        if acc.gpg_decrypt_pw.is_some() || acc.gpg_allow_no_pw {
            attempted = true;
            match crypto::decrypt_asymmetric(enc_data, acc) {
                Ok(asym) => outcome = Some(DecryptOutcome::Asym(asym)),
                Err(e) => {
                    debug!("[{}] (stanza #{}) asymmetric attempt: {}", src, stanza_num, e);
                }
            }
        }
    }

    if !attempted {
        error!(
            "[{}] (stanza #{}) No stanza encryption mode match for encryption type: {:?}.",
            src, stanza_num, enc_type
        );
        return KeepSearching;
    }
    let Some(outcome) = outcome else {
        warn!(
            "[{}] (stanza #{}) SPA data did not decrypt or authenticate",
            src, stanza_num
        );
        return KeepSearching;
    };

    // 4. replay insert, durable before any side effect below
    if !srv.test && !*added_replay_digest {
        match srv.replay.insert(digest) {
            Ok(()) => *added_replay_digest = true,
            Err(e) => {
                warn!(
                    "[{}] (stanza #{}) Could not add digest to replay cache: {}",
                    src, stanza_num, e
                );
                return KeepSearching;
            }
        }
    }

    // 5. message type; an undecodable type field ends the search outright
    let Some(msg_type) = message::parse_message_type(outcome.plaintext()) else {
        warn!(
            "[{}] (stanza #{}) Could not read message type from decrypted SPA data",
            src, stanza_num
        );
        return StopSearching;
    };

    if msg_type.is_legacy() && !srv.config.allow_legacy_access_requests {
        error!(
            "[{}] SPA packet made legacy access request, server configured to deny.",
            src
        );
        return StopSearching;
    }

    // 6. asymmetric signer allow-lists
    if let DecryptOutcome::Asym(asym) = &outcome {
        if acc.gpg_require_sig && !check_gpg_signers(acc, &asym.verdict, src, stanza_num) {
            return KeepSearching;
        }
    }

    // full field extraction
    let msg = match message::parse(outcome.plaintext()) {
        Ok(m) => m,
        Err(e) => {
            error!(
                "[{}] (stanza #{}) Unexpected error pulling SPA data fields: {}",
                src, stanza_num, e
            );
            return KeepSearching;
        }
    };

    // effective timeout: client request, then stanza, then default
    let fw_access_timeout = if msg.client_timeout > 0 {
        msg.client_timeout
    } else if acc.fw_access_timeout > 0 {
        acc.fw_access_timeout
    } else {
        DEF_FW_ACCESS_TIMEOUT
    };

    // 7. freshness
    if !check_pkt_age(&srv.config, msg.timestamp, src, stanza_num) {
        return KeepSearching;
    }

    // embedded source IP and request remainder
    let (spa_src_ip, remain) = match message::split_spa_message(&msg.message) {
        Ok(parts) => parts,
        Err(BodySplitError::MissingComma) => {
            warn!(
                "[{}] (stanza #{}) Error parsing SPA message string",
                src, stanza_num
            );
            return KeepSearching;
        }
        Err(BodySplitError::InvalidIp) => {
            warn!(
                "[{}] (stanza #{}) Invalid source IP in SPA message, ignoring SPA packet",
                src, stanza_num
            );
            return StopSearching;
        }
    };

    // 8. a 0.0.0.0 placeholder means "use the address you saw me from"
    let use_src_ip = if spa_src_ip.is_unspecified() {
        if acc.require_source_address {
            warn!(
                "[{}] (stanza #{}) Got 0.0.0.0 when valid source IP was required.",
                src, stanza_num
            );
            return KeepSearching;
        }
        src
    } else {
        spa_src_ip
    };

    // 9. username match applies only outside identifier mode
    if !srv.config.client_id_mode {
        if let Some(required) = &acc.require_username {
            if msg.username != *required {
                warn!(
                    "[{}] (stanza #{}) Username in SPA data ({}) does not match required username: {}",
                    src, stanza_num, msg.username, required
                );
                return KeepSearching;
            }
        }
    }

    // 10. NAT request classes need backend support and the matching enable
    if msg_type.is_nat() {
        if !srv.fw.supports_forwarding() {
            warn!(
                "(stanza #{}) SPA packet from {} requested unsupported NAT access",
                stanza_num, src
            );
            return StopSearching;
        }
        if !srv.config.enable_forwarding {
            warn!(
                "(stanza #{}) SPA packet from {} requested NAT access, but it is not enabled",
                stanza_num, src
            );
            return KeepSearching;
        }
    } else if msg_type.is_local_nat() {
        if !srv.fw.supports_local_nat() {
            warn!(
                "(stanza #{}) SPA packet from {} requested unsupported local NAT access",
                stanza_num, src
            );
            return StopSearching;
        }
        if !srv.config.enable_local_nat {
            warn!(
                "(stanza #{}) SPA packet from {} requested local NAT access, but it is not enabled",
                stanza_num, src
            );
            return KeepSearching;
        }
    }

    // command cycle takes precedence over every other action for the stanza
    if acc.cmd_cycle_open.is_some() {
        return if cmd_cycle_open(srv, acc, use_src_ip, &remain, fw_access_timeout, src, stanza_num)
        {
            *handled = Some(("cmd_cycle", fw_access_timeout));
            StopSearching
        } else {
            KeepSearching
        };
    }

    if msg_type == MessageType::Command {
        return if process_cmd_msg(srv, acc, &remain, src, stanza_num) {
            *handled = Some(("command", 0));
            StopSearching
        } else {
            KeepSearching
        };
    }

    // 11. request permissibility: the service table for service requests,
    // the port lists for everything else
    let request = if msg_type.is_service() {
        if !acc.check_service_access(&remain) {
            warn!("[{}] One or more requested services was denied.", src);
            return StopSearching;
        }
        let Some(service_data) = get_service_data_list(&srv.config, &remain) else {
            error!("Failed to gather necessary data for requested services.");
            return StopSearching;
        };
        render_service_request(&service_data)
    } else {
        if !acc.check_port_access(&remain) {
            warn!(
                "[{}] (stanza #{}) One or more requested protocol/ports was denied.",
                src, stanza_num
            );
            return KeepSearching;
        }
        remain.clone()
    };

    if srv.test {
        warn!(
            "[{}] (stanza #{}) --test mode enabled, skipping firewall manipulation.",
            src, stanza_num
        );
        return KeepSearching;
    }

    match srv.fw.install_access(use_src_ip, fw_access_timeout, &request) {
        Ok(()) => {
            info!(
                "[{}] (stanza #{}) Granted access to {} for {} seconds: {}",
                src, stanza_num, use_src_ip, fw_access_timeout, request
            );
            *handled = Some(("valid", fw_access_timeout));
        }
        Err(e) => {
            error!(
                "[{}] (stanza #{}) Firewall rule installation failed: {:#}",
                src, stanza_num, e
            );
        }
    }
    StopSearching
}

/// Signer allow-list check for asymmetric packets: the fingerprint list
/// takes precedence, and both lists are consulted when both are set.
fn check_gpg_signers(
    acc: &AccessStanza,
    verdict: &GpgVerdict,
    src: Ipv4Addr,
    stanza_num: usize,
) -> bool {
    let signer_id = verdict.signer_id.as_deref().unwrap_or("");
    let signer_fpr = verdict.signer_fpr.as_deref().unwrap_or("");
    info!(
        "[{}] (stanza #{}) Incoming SPA data signed by '{}' (fingerprint '{}').",
        src, stanza_num, signer_id, signer_fpr
    );
    if let Some(fprs) = &acc.gpg_remote_fpr {
        if !fprs.iter().any(|f| f.eq_ignore_ascii_case(signer_fpr)) {
            warn!(
                "[{}] (stanza #{}) Incoming SPA packet signed by: {}, but that fingerprint is not in the allowed fingerprint list.",
                src, stanza_num, signer_fpr
            );
            return false;
        }
    }
    if let Some(ids) = &acc.gpg_remote_id {
        if !ids.iter().any(|i| i.eq_ignore_ascii_case(signer_id)) {
            warn!(
                "[{}] (stanza #{}) Incoming SPA packet signed by ID: {}, but that ID is not in the allowed signer list.",
                src, stanza_num, signer_id
            );
            return false;
        }
    }
    true
}

/// Run a stanza's templated open command; on success the rendered close
/// command is queued to fire when the access window lapses.
fn cmd_cycle_open(
    srv: &Server,
    acc: &AccessStanza,
    use_src_ip: Ipv4Addr,
    remain: &str,
    timeout_secs: u32,
    src: Ipv4Addr,
    stanza_num: usize,
) -> bool {
    if srv.test {
        warn!(
            "[{}] (stanza #{}) --test mode enabled, skipping command cycle.",
            src, stanza_num
        );
        return false;
    }
    let Some(tpl) = acc.cmd_cycle_open.as_deref() else {
        return false;
    };
    let port = remain.parse::<crate::access::PortList>().ok().and_then(|l| l.first());
    let open_cmd = cmd::render_template(tpl, use_src_ip, port, timeout_secs);

    info!(
        "[{}] (stanza #{}) Running command cycle open: '{}'",
        src, stanza_num, open_cmd
    );
    match cmd::run(&open_cmd, None, Some(DIRECT_CMD_TIMEOUT)) {
        Ok(out) if out.status == Some(0) => {
            if let Some(close_tpl) = acc.cmd_cycle_close.as_deref() {
                let close_cmd = cmd::render_template(close_tpl, use_src_ip, port, timeout_secs);
                srv.cmd_cycle
                    .register_close(close_cmd, now_unix() + i64::from(timeout_secs));
            }
            true
        }
        Ok(out) => {
            warn!(
                "[{}] (stanza #{}) Command cycle open returned {:?}",
                src, stanza_num, out.status
            );
            false
        }
        Err(e) => {
            warn!(
                "[{}] (stanza #{}) Command cycle open failed: {:#}",
                src, stanza_num, e
            );
            false
        }
    }
}

/// Handle a COMMAND message. Returns true when this stanza consumed the
/// packet (even if the command itself failed), matching the
/// stop-looking-once-processed contract.
fn process_cmd_msg(
    srv: &Server,
    acc: &AccessStanza,
    command: &str,
    src: Ipv4Addr,
    stanza_num: usize,
) -> bool {
    if !acc.enable_cmd_exec {
        warn!(
            "[{}] (stanza #{}) SPA Command messages are not allowed in the current configuration.",
            src, stanza_num
        );
        return false;
    }
    if srv.test {
        warn!(
            "[{}] (stanza #{}) --test mode enabled, skipping command execution.",
            src, stanza_num
        );
        return false;
    }

    info!(
        "[{}] (stanza #{}) Processing SPA Command message: command='{}'.",
        src, stanza_num, command
    );

    let mut cmd_buf = String::new();
    if acc.enable_cmd_sudo_exec {
        // route through sudo so the sudoers policy filters the command
        cmd_buf.push_str(&srv.config.sudo_exe.to_string_lossy());
        if let Some(user) = &acc.cmd_sudo_exec_user {
            if !user.eq_ignore_ascii_case("root") {
                cmd_buf.push_str(" -u ");
                cmd_buf.push_str(user);
            }
        }
        if let Some(group) = &acc.cmd_sudo_exec_group {
            if !group.eq_ignore_ascii_case("root") {
                cmd_buf.push_str(" -g ");
                cmd_buf.push_str(group);
            }
        }
        cmd_buf.push(' ');
        cmd_buf.push_str(command);
    } else {
        cmd_buf.push_str(command);
    }

    let run_as_user = acc
        .cmd_exec_user
        .as_deref()
        .filter(|u| !u.eq_ignore_ascii_case("root"));

    let result = match run_as_user {
        Some(user) => {
            info!(
                "[{}] (stanza #{}) Running command '{}' setuid/setgid user/group to {}/{} (UID={},GID={})",
                src,
                stanza_num,
                cmd_buf,
                user,
                acc.cmd_exec_group.as_deref().unwrap_or(user),
                acc.cmd_exec_uid,
                acc.cmd_exec_gid
            );
            cmd::run_as(
                acc.cmd_exec_uid,
                acc.cmd_exec_gid,
                &cmd_buf,
                None,
                Some(Duration::from_secs(srv.config.cmd_timeout_secs)),
            )
        }
        None => {
            info!(
                "[{}] (stanza #{}) Running command '{}'",
                src, stanza_num, cmd_buf
            );
            cmd::run(&cmd_buf, None, Some(DIRECT_CMD_TIMEOUT))
        }
    };

    match result {
        Ok(out) => {
            info!(
                "[{}] (stanza #{}) CMD_EXEC: command returned {:?}",
                src, stanza_num, out.status
            );
            if out.status != Some(0) {
                warn!(
                    "[{}] (stanza #{}) {}",
                    src,
                    stanza_num,
                    SpaError::Command
                );
            }
        }
        Err(e) => {
            warn!(
                "[{}] (stanza #{}) Command execution failed: {:#}",
                src, stanza_num, e
            );
        }
    }
    true
}

fn get_service_data_list(cfg: &ServerConfig, remain: &str) -> Option<Vec<ServiceData>> {
    let mut out = Vec::new();
    for part in remain.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id: u32 = part.parse().ok()?;
        let def = cfg.services.get(&id)?;
        out.push(ServiceData {
            id,
            proto: def.proto,
            port: def.port,
        });
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn render_service_request(services: &[ServiceData]) -> String {
    services
        .iter()
        .map(|s| format!("{}/{}", s.proto, s.port))
        .collect::<Vec<_>>()
        .join(",")
}
