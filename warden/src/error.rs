use thiserror::Error;

/// Per-packet pipeline outcomes. These kinds are stable: the collector and
/// the decision log key off them, and they deliberately carry no detail about
/// why crypto failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaError {
    #[error("malformed packet data")]
    BadData,
    #[error("not SPA data")]
    NotSpaData,
    #[error("crypto context construction failed")]
    CryptoContext,
    #[error("digest computation or store failure")]
    Digest,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("replayed packet digest")]
    Replay,
    #[error("access denied")]
    AccessDenied,
    #[error("command did not exit cleanly")]
    Command,
}

impl SpaError {
    /// Short token for the JSONL decision log.
    pub fn reason(self) -> &'static str {
        match self {
            SpaError::BadData => "bad_data",
            SpaError::NotSpaData => "not_spa_data",
            SpaError::CryptoContext => "ctx_error",
            SpaError::Digest => "digest_error",
            SpaError::DecryptFailed => "decrypt_failed",
            SpaError::Replay => "replay",
            SpaError::AccessDenied => "access_denied",
            SpaError::Command => "command_error",
        }
    }
}
