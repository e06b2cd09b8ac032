pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub use loader::ConfigLoader;

pub const DEFAULT_AGENT_HEALTH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_CONTENT_HEALTH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_MANIFEST_ROUTE: &str = "/api/manifest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_crash_count: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_crash_count: crate::backoff::MAX_CRASH_COUNT,
        }
    }
}

/// Timings of the two-phase shutdown and of the port-close poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_ms: u64,
    pub kill_grace_ms: u64,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2_000,
            kill_grace_ms: 1_000,
            probe_timeout_ms: 500,
            poll_interval_ms: 200,
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub backoff: BackoffConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: DEFAULT_AGENT_HEALTH_INTERVAL_MS,
            health_timeout_ms: 3_000,
            startup_timeout_ms: 15_000,
            backoff: BackoffConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn agent() -> Self {
        Self::default()
    }

    pub fn content() -> Self {
        Self {
            health_interval_ms: DEFAULT_CONTENT_HEALTH_INTERVAL_MS,
            ..Self::default()
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.health_interval_ms == 0 {
            return Err(crate::Error::Config(
                "health_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.health_timeout_ms == 0 || self.startup_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "health and startup timeouts must be greater than zero".to_string(),
            ));
        }
        if self.backoff.max_crash_count == 0 {
            return Err(crate::Error::Config(
                "max_crash_count must be at least 1".to_string(),
            ));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(crate::Error::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        if self.shutdown.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// How to spawn a managed backend.
///
/// `args` may contain the placeholders `{port}` and `{workspace}`; they are substituted at
/// every launch. When `port_env` is set the assigned port is also exported under that name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub port_env: Option<String>,
}

impl CommandConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.command.trim().is_empty() {
            return Err(crate::Error::Config("command must not be empty".to_string()));
        }
        Ok(())
    }
}

// Raw deserialization struct for CommandConfig
#[derive(Debug, Deserialize)]
struct CommandConfigRaw {
    pub command: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub port_env: Option<String>,
}

impl<'de> Deserialize<'de> for CommandConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        CommandConfigRaw::deserialize(deserializer).map(Into::into)
    }
}

impl From<CommandConfigRaw> for CommandConfig {
    fn from(raw: CommandConfigRaw) -> Self {
        // If args weren't provided, try to parse them from the command
        let (command, args) = if let Some(args) = raw.args {
            (raw.command, args)
        } else {
            match shell_words::split(&raw.command) {
                Ok(parts) if !parts.is_empty() => {
                    let command = parts[0].clone();
                    let args = parts.into_iter().skip(1).collect();
                    (command, args)
                }
                _ => (raw.command, Vec::new()),
            }
        };

        CommandConfig {
            command,
            args,
            cwd: raw.cwd,
            env: raw.env.unwrap_or_default(),
            port_env: raw.port_env,
        }
    }
}

fn default_health_route() -> String {
    "/".to_string()
}

fn default_manifest_route() -> String {
    DEFAULT_MANIFEST_ROUTE.to_string()
}

/// The AI-agent backend: one instance on an ephemeral port, probed at its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub process: CommandConfig,
    #[serde(default = "default_health_route")]
    pub health_route: String,
    #[serde(default = "SupervisorConfig::agent")]
    pub supervisor: SupervisorConfig,
}

/// The per-workspace content server, probed through its manifest route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentConfig {
    pub process: CommandConfig,
    #[serde(default = "default_manifest_route")]
    pub manifest_route: String,
    #[serde(default)]
    pub workspace_env: Option<String>,
    #[serde(default = "SupervisorConfig::content")]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: Option<AgentConfig>,
    #[serde(default)]
    pub content: Option<ContentConfig>,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        Self::from_json(&content)
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> crate::Result<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if let Some(agent) = &self.agent {
            agent.process.validate()?;
            agent.supervisor.validate()?;
        }
        if let Some(content) = &self.content {
            content.process.validate()?;
            content.supervisor.validate()?;
            if !content.manifest_route.starts_with('/') {
                return Err(crate::Error::Config(format!(
                    "manifest_route must start with '/': {}",
                    content.manifest_route
                )));
            }
        }
        Ok(())
    }
}
