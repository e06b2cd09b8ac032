use async_trait::async_trait;
use sidecar_core::process::allocate_ephemeral_port;
use sidecar_core::{
    ChildCloser, CommandConfig, Error, Launcher, ProcessBuilder, Result, ServiceHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::probe::{PortProbe, wait_for_port_bound};
use crate::workspace::WorkspaceSlot;

pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

const PORT_PLACEHOLDER: &str = "{port}";
const WORKSPACE_PLACEHOLDER: &str = "{workspace}";

/// Spawns a configured command on a fresh loopback port and waits for it to bind.
pub struct CommandLauncher {
    service: String,
    command: CommandConfig,
    workspace: Option<(WorkspaceSlot, Option<String>)>,
    probe: Arc<dyn PortProbe>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl CommandLauncher {
    pub fn new(
        service: impl Into<String>,
        command: CommandConfig,
        probe: Arc<dyn PortProbe>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            command,
            workspace: None,
            probe,
            startup_timeout,
            poll_interval: DEFAULT_READY_POLL_INTERVAL,
        }
    }

    /// Launch against whatever workspace `slot` holds at launch time.
    ///
    /// The workspace path is exported under `env_var` when one is given.
    pub fn with_workspace(mut self, slot: WorkspaceSlot, env_var: Option<String>) -> Self {
        self.workspace = Some((slot, env_var));
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn substitute(arg: &str, port: u16, workspace: Option<&str>) -> String {
        let arg = arg.replace(PORT_PLACEHOLDER, &port.to_string());
        match workspace {
            Some(path) => arg.replace(WORKSPACE_PLACEHOLDER, path),
            None => arg,
        }
    }

    async fn wait_until_ready(&self, closer: &mut ChildCloser, port: u16) -> Result<()> {
        tokio::select! {
            biased;
            err = self.wait_for_exit(closer) => Err(err),
            bound = wait_for_port_bound(
                self.probe.as_ref(),
                port,
                self.startup_timeout,
                self.poll_interval,
            ) => {
                if bound {
                    Ok(())
                } else {
                    Err(Error::StartupTimeout {
                        service: self.service.clone(),
                        port,
                        timeout: self.startup_timeout,
                    })
                }
            }
        }
    }

    /// Resolves only once the child has exited (or can no longer be polled).
    async fn wait_for_exit(&self, closer: &mut ChildCloser) -> Error {
        loop {
            match closer.try_exit_status() {
                Ok(Some(status)) => {
                    return Error::ExitedEarly {
                        service: self.service.clone(),
                        status: status.to_string(),
                    };
                }
                Ok(None) => sleep(self.poll_interval).await,
                Err(e) => return e,
            }
        }
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self) -> Result<ServiceHandle> {
        let workspace = match &self.workspace {
            None => None,
            Some((slot, env_var)) => {
                let current = slot.current().ok_or(Error::NoWorkspace)?;
                if !current.path.is_dir() {
                    return Err(Error::InvalidWorkspace(format!(
                        "{} is not a directory",
                        current.path.display()
                    )));
                }
                Some((current, env_var.as_deref()))
            }
        };
        let workspace_path = workspace
            .as_ref()
            .map(|(ws, _)| ws.path.to_string_lossy().into_owned());

        let port = allocate_ephemeral_port()?;
        let args: Vec<String> = self
            .command
            .args
            .iter()
            .map(|arg| Self::substitute(arg, port, workspace_path.as_deref()))
            .collect();

        let mut builder = ProcessBuilder::new(&self.command.command)
            .args(&args)
            .envs(&self.command.env);

        if let Some(cwd) = &self.command.cwd {
            builder = builder.current_dir(cwd);
        }
        if let Some(var) = &self.command.port_env {
            builder = builder.env(var, port.to_string());
        }
        if let (Some((_, Some(var))), Some(path)) = (&workspace, &workspace_path) {
            builder = builder.env(var, path);
        }

        let mut child = builder.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.service.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.service.clone(), stderr, true);
        }

        let mut closer = ChildCloser::new(self.service.clone(), child);

        if let Err(e) = self.wait_until_ready(&mut closer, port).await {
            warn!(service = %self.service, port, "Launch failed: {}", e);
            // Dropping the closer kills the child.
            drop(closer);
            return Err(e);
        }

        info!(service = %self.service, port, ?pid, "Service bound its port");

        let handle = ServiceHandle::new(port, closer);
        Ok(match pid {
            Some(pid) => handle.with_pid(pid),
            None => handle,
        })
    }
}

fn forward_output<R>(service: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => warn!(service = %service, "{}", line),
                Ok(Some(line)) => info!(service = %service, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(service = %service, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    });
}
