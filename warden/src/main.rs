#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden::config::ServerConfig;
use warden::fw::NftSetFirewall;
use warden::server::Server;

#[derive(Parser, Debug)]
#[command(name = "spa-warden", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SPA daemon
    Run {
        /// Path to server config JSON
        #[arg(long, default_value = "/etc/spa/warden.json")]
        config: PathBuf,
        /// Validate and log only; no firewall or command side effects
        #[arg(long, default_value_t = false)]
        test: bool,
        /// Increase verbosity (developer runs)
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },

    /// Validate nftables family/table/set exist
    NftValidate {
        /// nftables family (e.g., inet)
        #[arg(long, default_value = "inet")]
        nft_family: String,
        /// nftables table
        #[arg(long, default_value = "filter")]
        nft_table: String,
        /// nftables set to check
        #[arg(long, default_value = "spa_allow")]
        nft_set: String,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Run {
            config,
            test,
            verbose,
        } => {
            init_tracing(verbose);
            let cfg = ServerConfig::load(&config)?;
            let fw = NftSetFirewall::new(&cfg.nft_family, &cfg.nft_table, &cfg.nft_set);
            if !test {
                fw.ensure_exists()?;
            }
            let server = Server::new(cfg, Arc::new(fw), test)?;
            server.run_udp_server()
        }
        Command::NftValidate {
            nft_family,
            nft_table,
            nft_set,
        } => {
            init_tracing(0);
            let fw = NftSetFirewall::new(&nft_family, &nft_table, &nft_set);
            if fw.ensure_exists().is_ok() {
                println!("ok");
                Ok(())
            } else {
                Err(anyhow!("nft missing: ensure family/table/set exist"))
            }
        }
    }
}
