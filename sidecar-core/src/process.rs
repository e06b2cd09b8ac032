use async_trait::async_trait;
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// The cooperative half of shutdown: ask the service to exit and return without waiting.
#[async_trait]
pub trait GracefulClose: Send + Sync {
    async fn close(&mut self) -> crate::Result<()>;
}

/// Result of a successful launch. Owned by exactly one supervisor.
pub struct ServiceHandle {
    port: u16,
    pid: Option<u32>,
    started_at: Instant,
    closer: Box<dyn GracefulClose>,
}

impl ServiceHandle {
    pub fn new(port: u16, closer: impl GracefulClose + 'static) -> Self {
        Self {
            port,
            pid: None,
            started_at: Instant::now(),
            closer: Box::new(closer),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn close(&mut self) -> crate::Result<()> {
        self.closer.close().await
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Graceful close for a spawned child process.
///
/// Sends SIGTERM first and falls back to the runtime's kill when the signal cannot be
/// delivered. The child is spawned with `kill_on_drop`, so dropping the closer kills it too.
pub struct ChildCloser {
    service: String,
    pid: Option<u32>,
    child: Child,
}

impl ChildCloser {
    pub fn new(service: impl Into<String>, child: Child) -> Self {
        let pid = child.id();
        Self {
            service: service.into(),
            pid,
            child,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking check for an exit status.
    pub fn try_exit_status(&mut self) -> crate::Result<Option<std::process::ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    #[cfg(unix)]
    fn terminate(&self) -> crate::Result<bool> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(false);
        };
        let pid = i32::try_from(pid)
            .map_err(|_| crate::Error::SpawnFailed(format!("PID {} too large for system", pid)))?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)?;
        Ok(true)
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> crate::Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl GracefulClose for ChildCloser {
    async fn close(&mut self) -> crate::Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("{} already exited with {}", self.service, status);
            return Ok(());
        }

        match self.terminate() {
            Ok(true) => {
                debug!("Sent SIGTERM to {} (PID {:?})", self.service, self.pid);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!("SIGTERM to {} failed: {}, falling back to kill", self.service, e);
            }
        }

        self.child.start_kill()?;
        Ok(())
    }
}

/// Ask the OS for a free loopback port by binding port 0, then release it for the child.
pub fn allocate_ephemeral_port() -> crate::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

pub struct ProcessBuilder {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl ProcessBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.env
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            self.env
                .push((k.as_ref().to_string(), v.as_ref().to_string()));
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn spawn(self) -> crate::Result<Child> {
        tracing::info!(
            "Spawning process: command='{}', args={:?}",
            self.command,
            self.args
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(cwd) = self.cwd {
            debug!("Setting working directory to: {:?}", cwd);
            cmd.current_dir(cwd);
        }

        for (key, value) in self.env {
            cmd.env(key, value);
        }

        cmd.spawn()
            .map_err(|e| crate::Error::SpawnFailed(format!("{}: {}", self.command, e)))
    }
}
