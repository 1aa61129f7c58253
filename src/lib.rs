pub mod agents;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod ftp;
pub mod kcp;
pub mod logging;
pub mod modules;
pub mod net;
pub mod server;
pub mod tunnel;

pub use config::RuntimeConfig;
pub use server::C2Server;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum C2Error {
    #[error("agent {0} is not connected")]
    AgentNotConnected(String),

    #[error("unknown agent: {0}")]
    AgentUnknown(String),

    #[error("command {0} timed out")]
    CommandTimeout(String),

    #[error("{} is already being downloaded", .0.display())]
    AlreadyInProgress(PathBuf),

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("port {0} is in use")]
    PortInUse(u16),

    #[error("no such module: {0}")]
    ModuleUnknown(String),

    #[error("option {0} not found")]
    OptionUnknown(String),

    #[error("no active target")]
    NoActiveTarget,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, C2Error>;
