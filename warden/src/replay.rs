use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::SpaError;

pub const SPA_DIGEST_LEN: usize = 32;

/// Canonical content digest of a ciphertext, computed before any decryption
/// attempt so that undecryptable replays are still suppressed.
pub type SpaDigest = [u8; SPA_DIGEST_LEN];

pub fn spa_digest(data: &[u8]) -> SpaDigest {
    Sha256::digest(data).into()
}

fn to_hex(d: &SpaDigest) -> String {
    let mut s = String::with_capacity(SPA_DIGEST_LEN * 2);
    for b in d {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn from_hex(line: &str) -> Option<SpaDigest> {
    let line = line.trim();
    if line.len() != SPA_DIGEST_LEN * 2 || !line.is_ascii() {
        return None;
    }
    let mut out = [0u8; SPA_DIGEST_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&line[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

struct StoreInner {
    seen: HashSet<SpaDigest>,
    file: Option<File>,
}

/// Set of previously accepted ciphertext digests. One mutex covers the set
/// and its backing file so a concurrent duplicate cannot slip between
/// membership test and insert.
pub struct ReplayStore {
    inner: Option<Mutex<StoreInner>>,
}

impl ReplayStore {
    /// Disabled store: `contains` is always false, `insert` a no-op.
    pub fn disabled() -> ReplayStore {
        ReplayStore { inner: None }
    }

    /// Memory-only store; replay suppression does not survive a restart.
    pub fn in_memory() -> ReplayStore {
        ReplayStore {
            inner: Some(Mutex::new(StoreInner {
                seen: HashSet::new(),
                file: None,
            })),
        }
    }

    /// Persistent store: load every digest recorded by earlier runs, then
    /// append new ones as they are accepted.
    pub fn open(path: &Path) -> Result<ReplayStore> {
        let mut seen = HashSet::new();
        if path.exists() {
            let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
            for line in BufReader::new(f).lines() {
                let line = line?;
                if let Some(d) = from_hex(&line) {
                    seen.insert(d);
                } else if !line.trim().is_empty() {
                    tracing::warn!("Skipping malformed digest line in {}", path.display());
                }
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("append {}", path.display()))?;
        tracing::info!(
            "Loaded {} digest(s) from replay store {}",
            seen.len(),
            path.display()
        );
        Ok(ReplayStore {
            inner: Some(Mutex::new(StoreInner { seen, file: Some(file) })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn contains(&self, digest: &SpaDigest) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => inner
                .lock()
                .expect("replay store lock poisoned")
                .seen
                .contains(digest),
        }
    }

    /// Add a digest. The write is flushed and synced before this returns so a
    /// crash between grant and durability cannot re-admit the packet. A digest
    /// already present is a replay, not an IO failure.
    pub fn insert(&self, digest: &SpaDigest) -> Result<(), SpaError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let mut inner = inner.lock().expect("replay store lock poisoned");
        if !inner.seen.insert(*digest) {
            return Err(SpaError::Replay);
        }
        if let Some(file) = inner.file.as_mut() {
            let line = to_hex(digest) + "\n";
            if file.write_all(line.as_bytes()).is_err() || file.sync_data().is_err() {
                return Err(SpaError::Digest);
            }
        }
        Ok(())
    }

    pub fn flush(&self) {
        if let Some(inner) = &self.inner {
            let mut inner = inner.lock().expect("replay store lock poisoned");
            if let Some(file) = inner.file.as_mut() {
                let _ = file.sync_data();
            }
        }
    }
}
