use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use warden::access::HmacKind;
use warden::classify::SpaPacket;
use warden::config::ServerConfig;
use warden::crypto;
use warden::fw::Firewall;
use warden::now_unix;
use warden::pipeline::incoming_spa;
use warden::replay;
use warden::server::Server;

const KEY: &[u8] = b"test_key_12345";
const HMAC_KEY: &[u8] = b"hmac_key_67890";

#[derive(Default)]
struct RecordingFirewall {
    grants: Mutex<Vec<(Ipv4Addr, u32, String)>>,
    forwarding: bool,
    local_nat: bool,
}

impl RecordingFirewall {
    fn with_forwarding() -> RecordingFirewall {
        RecordingFirewall {
            forwarding: true,
            local_nat: true,
            ..Default::default()
        }
    }

    fn grants(&self) -> Vec<(Ipv4Addr, u32, String)> {
        self.grants.lock().unwrap().clone()
    }
}

impl Firewall for RecordingFirewall {
    fn install_access(
        &self,
        use_src_ip: Ipv4Addr,
        timeout_secs: u32,
        request: &str,
    ) -> anyhow::Result<()> {
        self.grants
            .lock()
            .unwrap()
            .push((use_src_ip, timeout_secs, request.to_string()));
        Ok(())
    }

    fn check_and_expire_rules(&self, _full_sweep: bool) {}

    fn cleanup_all(&self) {}

    fn supports_forwarding(&self) -> bool {
        self.forwarding
    }

    fn supports_local_nat(&self) -> bool {
        self.local_nat
    }
}

fn server(cfg: serde_json::Value, fw: Arc<RecordingFirewall>, test: bool) -> Server {
    let cfg: ServerConfig = serde_json::from_value(cfg).unwrap();
    Server::new(cfg, fw, test).unwrap()
}

fn packet(data: &str, src: [u8; 4]) -> SpaPacket {
    SpaPacket::new(
        data.as_bytes().to_vec(),
        (Ipv4Addr::from(src), 40000),
        (Ipv4Addr::new(10, 0, 0, 1), 62201),
    )
}

fn encode(plaintext: &str) -> String {
    crypto::encode_spa_packet(plaintext, 0, KEY, HMAC_KEY, HmacKind::Sha256).unwrap()
}

fn plaintext_access(src_ip: &str, request: &str) -> String {
    format!("1234:alice:{}:2.0.3:1:{},{}", now_unix(), src_ip, request)
}

fn one_stanza_cfg() -> serde_json::Value {
    json!({
        "access": [{
            "source": "192.168.1.0/24",
            "key": "test_key_12345",
            "hmac_key": "hmac_key_67890",
            "open_ports": "tcp/22"
        }]
    })
}

#[test]
fn happy_path_symmetric_grant() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    let mut pkt = packet(&wire, [192, 168, 1, 7]);
    incoming_spa(&srv, &mut pkt);

    assert_eq!(
        fw.grants(),
        vec![(Ipv4Addr::new(192, 168, 1, 7), 30, "tcp/22".to_string())]
    );
    assert!(srv.replay.contains(&replay::spa_digest(wire.as_bytes())));
}

#[test]
fn replayed_packet_is_suppressed() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));

    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn stale_timestamp_drops_but_digest_sticks() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);

    let wire = encode("1234:alice:1600000000:2.0.3:1:192.168.1.7,tcp/22");
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));

    assert!(fw.grants().is_empty());
    // crypto succeeded, so the digest went in before the freshness check
    assert!(srv.replay.contains(&replay::spa_digest(wire.as_bytes())));
}

#[test]
fn prefix_poisoned_replay_never_reaches_crypto() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    let poisoned = format!("U2FsdGVkX1{wire}");
    incoming_spa(&srv, &mut packet(&poisoned, [192, 168, 1, 7]));

    assert!(fw.grants().is_empty());
    assert!(!srv.replay.contains(&replay::spa_digest(poisoned.as_bytes())));
}

fn http_wrap(wire: &str) -> String {
    let urlish: String = wire
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    format!("GET /{urlish} HTTP/1.1\r\nUser-Agent: Fwknop/2.0\r\n\r\n")
}

#[test]
fn http_wrapped_packet_honored_only_when_enabled() {
    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    let wrapped = http_wrap(&wire);

    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["enable_spa_over_http"] = json!(true);
    let srv = server(cfg, fw.clone(), false);
    incoming_spa(&srv, &mut packet(&wrapped, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);

    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);
    incoming_spa(&srv, &mut packet(&wrapped, [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());
}

fn id_mode_cfg() -> serde_json::Value {
    json!({
        "client_id_mode": true,
        "access": [{
            "source": "ANY",
            "client_id": 12345,
            "key": "test_key_12345",
            "hmac_key": "hmac_key_67890",
            "open_ports": "tcp/22",
            "require_username": "bob"
        }]
    })
}

#[test]
fn identifier_mode_unknown_id_is_dropped_before_crypto() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(id_mode_cfg(), fw.clone(), false);

    let wire = crypto::encode_spa_packet(
        &plaintext_access("192.168.1.7", "tcp/22"),
        99999,
        KEY,
        HMAC_KEY,
        HmacKind::Sha256,
    )
    .unwrap();
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());
}

#[test]
fn identifier_mode_grant_skips_username_check() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(id_mode_cfg(), fw.clone(), false);

    // username is alice but the stanza requires bob; identifier mode does
    // not consult the username predicate
    let wire = crypto::encode_spa_packet(
        &plaintext_access("192.168.1.7", "tcp/22"),
        12345,
        KEY,
        HMAC_KEY,
        HmacKind::Sha256,
    )
    .unwrap();
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn command_message_denied_without_cmd_exec() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);

    let plaintext = format!(
        "1234:alice:{}:2.0.3:0:192.168.1.7,/bin/touch {}",
        now_unix(),
        marker.display()
    );
    let wire = encode(&plaintext);
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));

    assert!(fw.grants().is_empty());
    assert!(!marker.exists());
    assert!(srv.replay.contains(&replay::spa_digest(wire.as_bytes())));
}

#[test]
fn command_message_runs_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let fw = Arc::new(RecordingFirewall::default());
    let cfg = json!({
        "access": [{
            "source": "192.168.1.0/24",
            "key": "test_key_12345",
            "hmac_key": "hmac_key_67890",
            "enable_cmd_exec": true
        }]
    });
    let srv = server(cfg, fw.clone(), false);

    let plaintext = format!(
        "1234:alice:{}:2.0.3:0:192.168.1.7,/bin/touch {}",
        now_unix(),
        marker.display()
    );
    let wire = encode(&plaintext);
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));

    assert!(marker.exists());
    assert!(fw.grants().is_empty());
}

#[test]
fn wrong_key_stanza_keeps_searching() {
    let fw = Arc::new(RecordingFirewall::default());
    let cfg = json!({
        "access": [
            {
                "source": "192.168.1.0/24",
                "key": "some_other_key",
                "hmac_key": "some_other_hmac",
                "open_ports": "tcp/22"
            },
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/22"
            }
        ]
    });
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn port_denial_keeps_searching_to_a_permissive_stanza() {
    let fw = Arc::new(RecordingFirewall::default());
    let cfg = json!({
        "access": [
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/80"
            },
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/22"
            }
        ]
    });
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn first_grant_ends_the_search() {
    let fw = Arc::new(RecordingFirewall::default());
    let cfg = json!({
        "access": [
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/22"
            },
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/22"
            }
        ]
    });
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn invalid_embedded_ip_stops_the_search() {
    let fw = Arc::new(RecordingFirewall::default());
    let cfg = json!({
        "access": [
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/22"
            },
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "open_ports": "tcp/22"
            }
        ]
    });
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("299.299.299.299", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());
}

#[test]
fn legacy_denied_stops_the_search() {
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["allow_legacy_access_requests"] = json!(false);
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());

    // every pre-service request type falls under the gate, type 2 included
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["allow_legacy_access_requests"] = json!(false);
    let srv = server(cfg, fw.clone(), false);
    let plaintext = format!("1234:alice:{}:2.0.3:2:192.168.1.7,tcp/22", now_unix());
    incoming_spa(&srv, &mut packet(&encode(&plaintext), [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());

    // service requests are what the gate exists to leave open
    let cfg = json!({
        "allow_legacy_access_requests": false,
        "services": {"123": {"proto": "tcp", "port": 8080}},
        "access": [{
            "source": "192.168.1.0/24",
            "key": "test_key_12345",
            "hmac_key": "hmac_key_67890",
            "service_list": "123"
        }]
    });
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(cfg, fw.clone(), false);
    let plaintext = format!("1234:alice:{}:2.0.3:8:192.168.1.7,123", now_unix());
    incoming_spa(&srv, &mut packet(&encode(&plaintext), [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn test_mode_observes_but_touches_nothing() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), true);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));

    assert!(fw.grants().is_empty());
    // test mode also leaves the replay store untouched
    assert!(!srv.replay.contains(&replay::spa_digest(wire.as_bytes())));
}

#[test]
fn disabled_replay_store_grants_twice() {
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["enable_digest_persistence"] = json!(false);
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 2);
}

#[test]
fn timeout_selection_prefers_client_then_stanza() {
    // client-requested window wins
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);
    let plaintext = format!("1234:alice:{}:2.0.3:3:192.168.1.7,tcp/22:90", now_unix());
    incoming_spa(&srv, &mut packet(&encode(&plaintext), [192, 168, 1, 7]));
    assert_eq!(fw.grants()[0].1, 90);

    // stanza timeout next
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["access"][0]["fw_access_timeout"] = json!(120);
    let srv = server(cfg, fw.clone(), false);
    let plaintext = format!("1234:alice:{}:2.0.3:2:192.168.1.7,tcp/22", now_unix());
    incoming_spa(&srv, &mut packet(&encode(&plaintext), [192, 168, 1, 7]));
    assert_eq!(fw.grants()[0].1, 120);
}

#[test]
fn unspecified_embedded_ip_uses_packet_source() {
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(one_stanza_cfg(), fw.clone(), false);
    let wire = encode(&plaintext_access("0.0.0.0", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 44]));
    assert_eq!(fw.grants()[0].0, Ipv4Addr::new(192, 168, 1, 44));

    // unless the stanza demands a literal source address
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["access"][0]["require_source_address"] = json!(true);
    let srv = server(cfg, fw.clone(), false);
    let wire = encode(&plaintext_access("0.0.0.0", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 44]));
    assert!(fw.grants().is_empty());
}

#[test]
fn username_mismatch_keeps_searching() {
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["access"][0]["require_username"] = json!("bob");
    let srv = server(cfg, fw.clone(), false);
    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());

    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["access"][0]["require_username"] = json!("alice");
    let srv = server(cfg, fw.clone(), false);
    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn nat_requests_respect_capability_and_enablement() {
    let nat_plaintext = format!(
        "1234:alice:{}:2.0.3:4:192.168.1.7,tcp/22:192.168.5.5,5555",
        now_unix()
    );

    // backend cannot forward at all
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["enable_forwarding"] = json!(true);
    let srv = server(cfg, fw.clone(), false);
    incoming_spa(&srv, &mut packet(&encode(&nat_plaintext), [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());

    // capable backend, forwarding switched off
    let fw = Arc::new(RecordingFirewall::with_forwarding());
    let srv = server(one_stanza_cfg(), fw.clone(), false);
    incoming_spa(&srv, &mut packet(&encode(&nat_plaintext), [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());

    // capable and enabled
    let fw = Arc::new(RecordingFirewall::with_forwarding());
    let mut cfg = one_stanza_cfg();
    cfg["enable_forwarding"] = json!(true);
    let srv = server(cfg, fw.clone(), false);
    incoming_spa(&srv, &mut packet(&encode(&nat_plaintext), [192, 168, 1, 7]));
    assert_eq!(fw.grants().len(), 1);
}

#[test]
fn service_request_resolves_through_the_table() {
    let cfg = json!({
        "services": {"123": {"proto": "tcp", "port": 8080}},
        "access": [{
            "source": "192.168.1.0/24",
            "key": "test_key_12345",
            "hmac_key": "hmac_key_67890",
            "service_list": "123"
        }]
    });
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(cfg, fw.clone(), false);

    let plaintext = format!("1234:alice:{}:2.0.3:8:192.168.1.7,123", now_unix());
    incoming_spa(&srv, &mut packet(&encode(&plaintext), [192, 168, 1, 7]));
    assert_eq!(
        fw.grants(),
        vec![(Ipv4Addr::new(192, 168, 1, 7), 30, "tcp/8080".to_string())]
    );
}

#[test]
fn denied_service_stops_the_search() {
    let cfg = json!({
        "services": {"123": {"proto": "tcp", "port": 8080}},
        "access": [
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "service_list": "999"
            },
            {
                "source": "192.168.1.0/24",
                "key": "test_key_12345",
                "hmac_key": "hmac_key_67890",
                "service_list": "123"
            }
        ]
    });
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(cfg, fw.clone(), false);

    let plaintext = format!("1234:alice:{}:2.0.3:8:192.168.1.7,123", now_unix());
    incoming_spa(&srv, &mut packet(&encode(&plaintext), [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());
}

#[test]
fn command_cycle_open_queues_the_close() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("opened");
    let cfg = json!({
        "access": [{
            "source": "192.168.1.0/24",
            "key": "test_key_12345",
            "hmac_key": "hmac_key_67890",
            "open_ports": "tcp/22",
            "cmd_cycle_open": format!("/bin/touch {}", marker.display()),
            "cmd_cycle_close": "/bin/true"
        }]
    });
    let fw = Arc::new(RecordingFirewall::default());
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));

    assert!(marker.exists());
    // the firewall was bypassed in favor of the cycle
    assert!(fw.grants().is_empty());
    assert_eq!(srv.cmd_cycle.pending_len(), 1);
}

#[test]
fn collector_stops_on_signal() {
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["listen"] = json!("127.0.0.1:0");
    cfg["select_timeout_ms"] = json!(50);
    let srv = Arc::new(server(cfg, fw, true));
    let stop = srv.stop_handle();

    let handle = {
        let srv = Arc::clone(&srv);
        std::thread::spawn(move || srv.run_udp_server().unwrap())
    };
    std::thread::sleep(Duration::from_millis(120));
    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
    assert_eq!(srv.packets_processed(), 0);
}

#[test]
fn expired_stanza_is_skipped() {
    let fw = Arc::new(RecordingFirewall::default());
    let mut cfg = one_stanza_cfg();
    cfg["access"][0]["access_expire"] = json!(1000);
    let srv = server(cfg, fw.clone(), false);

    let wire = encode(&plaintext_access("192.168.1.7", "tcp/22"));
    incoming_spa(&srv, &mut packet(&wire, [192, 168, 1, 7]));
    assert!(fw.grants().is_empty());
}
