use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Service {service} exited during startup ({status})")]
    ExitedEarly { service: String, status: String },

    #[error("Service {service} did not bind port {port} within {timeout:?}")]
    StartupTimeout {
        service: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Service {0} is not running")]
    NotRunning(String),

    #[error("No workspace selected")]
    NoWorkspace,

    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Config error: {0}")]
    Config(String),

    #[cfg(unix)]
    #[error("Unix error: {0}")]
    Unix(#[from] nix::errno::Errno),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
