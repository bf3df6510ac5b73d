use std::net::Ipv4Addr;

use anyhow::{anyhow, Context, Result};

use crate::cmd::{self, DIRECT_CMD_TIMEOUT};

/// Firewall back-end interface. The pipeline only ever asks for a
/// time-limited source allow, periodic expiry housekeeping, and teardown;
/// capability probes let the evaluator tell "unsupported" apart from
/// "switched off".
pub trait Firewall: Send + Sync {
    /// Install time-limited access for `use_src_ip` covering `request`
    /// ("proto/port[,proto/port...]").
    fn install_access(&self, use_src_ip: Ipv4Addr, timeout_secs: u32, request: &str)
        -> Result<()>;

    /// Expire-check pass; `full_sweep` forces a complete reconciliation.
    fn check_and_expire_rules(&self, full_sweep: bool);

    /// Remove everything this daemon installed.
    fn cleanup_all(&self);

    fn supports_forwarding(&self) -> bool {
        false
    }

    fn supports_local_nat(&self) -> bool {
        false
    }
}

/// nftables set back-end: grants become timed elements of a preexisting set,
/// so expiry is handled by the kernel and the sweep has nothing to reconcile.
pub struct NftSetFirewall {
    family: String,
    table: String,
    set: String,
}

impl NftSetFirewall {
    pub fn new(family: &str, table: &str, set: &str) -> NftSetFirewall {
        NftSetFirewall {
            family: family.to_string(),
            table: table.to_string(),
            set: set.to_string(),
        }
    }

    /// Fail-fast verification that the table and target set exist.
    pub fn ensure_exists(&self) -> Result<()> {
        let table_cmd = format!("nft list table {} {}", self.family, self.table);
        let ok_table = cmd::run(&table_cmd, None, Some(DIRECT_CMD_TIMEOUT))
            .map(|out| out.status == Some(0))
            .unwrap_or(false);
        let set_cmd = format!(
            "nft list set {} {} {}",
            self.family, self.table, self.set
        );
        let ok_set = cmd::run(&set_cmd, None, Some(DIRECT_CMD_TIMEOUT))
            .map(|out| out.status == Some(0))
            .unwrap_or(false);
        if !(ok_table && ok_set) {
            return Err(anyhow!(
                "nftables {}/{} set {} not found",
                self.family,
                self.table,
                self.set
            ));
        }
        Ok(())
    }

    fn element_spec(ip: Ipv4Addr, timeout_secs: u32) -> String {
        format!("{{ {ip} timeout {timeout_secs}s }}")
    }
}

impl Firewall for NftSetFirewall {
    fn install_access(
        &self,
        use_src_ip: Ipv4Addr,
        timeout_secs: u32,
        _request: &str,
    ) -> Result<()> {
        let elem = Self::element_spec(use_src_ip, timeout_secs);
        let cmdline = format!(
            "nft add element {} {} {} {}",
            self.family, self.table, self.set, elem
        );
        let out = cmd::run(&cmdline, None, Some(DIRECT_CMD_TIMEOUT)).context("nft add element")?;
        if out.status != Some(0) {
            return Err(anyhow!("nft add element failed: {:?}", out.status));
        }
        Ok(())
    }

    fn check_and_expire_rules(&self, full_sweep: bool) {
        // set elements expire kernel-side; nothing to reconcile
        if full_sweep {
            tracing::debug!(
                "nft set {}/{}/{}: timeout-managed, full sweep is a no-op",
                self.family,
                self.table,
                self.set
            );
        }
    }

    fn cleanup_all(&self) {
        let cmdline = format!(
            "nft flush set {} {} {}",
            self.family, self.table, self.set
        );
        match cmd::run(&cmdline, None, Some(DIRECT_CMD_TIMEOUT)) {
            Ok(out) if out.status == Some(0) => {}
            Ok(out) => tracing::warn!("nft flush set returned {:?}", out.status),
            Err(e) => tracing::warn!("nft flush set failed: {e:#}"),
        }
    }
}
