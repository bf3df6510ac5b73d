#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use warden::access::HmacKind;
use warden::cmd;
use warden::crypto;
use warden::message::MessageType;
use warden::now_unix;

#[derive(Debug, serde::Deserialize)]
struct Config {
    server_host: String,
    spa_port: u16,
    #[serde(default)]
    key: Option<String>,
    hmac_key: String,
    #[serde(default)]
    hmac_type: HmacKind,
    #[serde(default)]
    client_id: u32,
    #[serde(default)]
    gpg_recipient: Option<String>,
    #[serde(default)]
    gpg_signer: Option<String>,
    #[serde(default)]
    gpg_home_dir: Option<PathBuf>,
    #[serde(default)]
    gpg_exe: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(name = "spa-signet", version)]
struct Cli {
    /// Path to client config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Requested access, e.g. "tcp/22" or "tcp/22,udp/1194"
    #[arg(short, long, default_value = "tcp/22")]
    access: String,

    /// Send a command message instead of an access request
    #[arg(long)]
    command: Option<String>,

    /// Request services by ID, e.g. "123,456"
    #[arg(long)]
    services: Option<String>,

    /// NAT access specifier, e.g. "192.168.5.5,5555"
    #[arg(long)]
    nat_access: Option<String>,

    /// Ask the server for this many seconds of access
    #[arg(long, default_value_t = 0)]
    client_timeout: u32,

    /// Embed 0.0.0.0 so the server uses the address it sees
    #[arg(long, default_value_t = false)]
    source_ip_any: bool,

    /// Send the old-style access request type
    #[arg(long, default_value_t = false)]
    legacy: bool,

    /// Wrap the packet in a single HTTP GET
    #[arg(long, default_value_t = false)]
    http: bool,

    /// Username field; defaults to $USER
    #[arg(long)]
    user: Option<String>,
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let p = PathBuf::from(xdg).join("spa-signet.json");
        if p.exists() {
            return Some(p);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let p = PathBuf::from(home).join(".config").join("spa-signet.json");
        if p.exists() {
            return Some(p);
        }
    }
    let local = PathBuf::from("spa-signet.json");
    if local.exists() {
        Some(local)
    } else {
        None
    }
}

fn random_field() -> Result<String> {
    let mut raw = [0u8; 8];
    getrandom::getrandom(&mut raw).map_err(|e| anyhow!(e))?;
    let n = u64::from_le_bytes(raw) % 10_000_000_000_000_000;
    Ok(format!("{n:016}"))
}

fn pick_message_type(cli: &Cli) -> Result<MessageType> {
    if cli.command.is_some() {
        return Ok(MessageType::Command);
    }
    if cli.services.is_some() {
        return Ok(if cli.client_timeout > 0 {
            MessageType::ClientTimeoutServiceAccess
        } else {
            MessageType::ServiceAccess
        });
    }
    if cli.nat_access.is_some() {
        return Ok(if cli.client_timeout > 0 {
            MessageType::ClientTimeoutNatAccess
        } else {
            MessageType::NatAccess
        });
    }
    if cli.legacy {
        if cli.client_timeout > 0 {
            return Err(anyhow!("legacy requests cannot carry a client timeout"));
        }
        return Ok(MessageType::LegacyAccess);
    }
    Ok(if cli.client_timeout > 0 {
        MessageType::ClientTimeoutAccess
    } else {
        MessageType::Access
    })
}

fn gpg_encrypt(cfg: &Config, recipient: &str, plaintext: &str) -> Result<Vec<u8>> {
    let home = cfg
        .gpg_home_dir
        .as_ref()
        .ok_or_else(|| anyhow!("gpg_home_dir required for gpg mode"))?;
    let exe = cfg
        .gpg_exe
        .clone()
        .unwrap_or_else(|| PathBuf::from("gpg"));

    let mut args: Vec<OsString> = vec![
        "--batch".into(),
        "--yes".into(),
        "--quiet".into(),
        "--homedir".into(),
        home.into(),
        "--trust-model".into(),
        "always".into(),
        "--recipient".into(),
        recipient.into(),
    ];
    if let Some(signer) = &cfg.gpg_signer {
        args.push("--sign".into());
        args.push("--local-user".into());
        args.push(signer.into());
    }
    args.push("--encrypt".into());
    args.push("-o".into());
    args.push("-".into());

    let out = cmd::run_argv(
        &exe,
        &args,
        Some(plaintext.as_bytes()),
        Some(Duration::from_secs(10)),
    )?;
    if out.status != Some(0) {
        return Err(anyhow!("gpg --encrypt failed: {:?}", out.status));
    }
    Ok(out.stdout)
}

fn http_wrap(packet: &str) -> String {
    let urlish: String = packet
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    format!(
        "GET /{urlish} HTTP/1.1\r\nUser-Agent: Fwknop/{}\r\nHost: spa\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg_path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or_else(|| anyhow!("config not found; pass --config"))?;
    let cfg_data =
        fs::read_to_string(&cfg_path).with_context(|| format!("read {}", cfg_path.display()))?;
    let cfg: Config = serde_json::from_str(&cfg_data)?;

    let addr = format!("{}:{}", cfg.server_host, cfg.spa_port);
    let mut addrs = addr.to_socket_addrs()?;
    let dst = addrs.next().ok_or_else(|| anyhow!("resolve {}", addr))?;

    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.connect(dst)?;

    // source IP field: 0.0.0.0 on request, else the local IPv4 we send from
    let source_ip = if cli.source_ip_any {
        "0.0.0.0".to_string()
    } else {
        match sock.local_addr()? {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            _ => return Err(anyhow!("local address not IPv4")),
        }
    };

    let msg_type = pick_message_type(&cli)?;
    let request = if let Some(command) = &cli.command {
        command.clone()
    } else if let Some(services) = &cli.services {
        services.clone()
    } else {
        cli.access.clone()
    };

    let username = cli
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut fields = vec![
        random_field()?,
        username,
        now_unix().to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
        (msg_type as u8).to_string(),
        format!("{source_ip},{request}"),
    ];
    if let Some(nat) = &cli.nat_access {
        fields.push(nat.clone());
    }
    if cli.client_timeout > 0 {
        fields.push(cli.client_timeout.to_string());
    }
    let plaintext = fields.join(":");

    let packet = if let Some(recipient) = &cfg.gpg_recipient {
        let msg = gpg_encrypt(&cfg, recipient, &plaintext)?;
        let body = crypto::encode_asymmetric_body(&msg, cfg.hmac_key.as_bytes(), cfg.hmac_type)
            .map_err(|e| anyhow!("encode: {e}"))?;
        if cfg.client_id != 0 {
            crypto::encode_client_id(cfg.client_id) + &body
        } else {
            body
        }
    } else {
        let key = cfg
            .key
            .as_ref()
            .ok_or_else(|| anyhow!("key required unless gpg_recipient is set"))?;
        crypto::encode_spa_packet(
            &plaintext,
            cfg.client_id,
            key.as_bytes(),
            cfg.hmac_key.as_bytes(),
            cfg.hmac_type,
        )
        .map_err(|e| anyhow!("encode: {e}"))?
    };

    let wire = if cli.http {
        http_wrap(&packet)
    } else {
        packet
    };
    sock.send(wire.as_bytes())?;

    // the server never answers; a valid knock shows up as opened access
    println!("Knock sent. If valid, access should open shortly.");
    Ok(())
}
