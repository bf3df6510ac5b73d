#![forbid(unsafe_code)]

pub mod access;
pub mod classify;
pub mod cmd;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fw;
pub mod message;
pub mod pipeline;
pub mod replay;
pub mod server;

pub use config::ServerConfig;
pub use error::SpaError;
pub use server::Server;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
