pub mod backoff;
pub mod config;
pub mod error;
pub mod process;
pub mod state;
pub mod supervisor;

pub use backoff::CrashPolicy;
pub use config::{
    AgentConfig, BackoffConfig, CommandConfig, Config, ConfigLoader, ContentConfig,
    ShutdownConfig, SupervisorConfig,
};
pub use error::{Error, Result};
pub use process::{ChildCloser, GracefulClose, ProcessBuilder, ServiceHandle};
pub use state::{StatusSnapshot, SupervisorState};
pub use supervisor::{Launcher, StatusListener};
