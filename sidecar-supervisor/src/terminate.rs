use async_trait::async_trait;
use sidecar_core::{Error, Result, ServiceHandle, ShutdownConfig};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::probe::{PortProbe, wait_for_port_close};

/// Forcefully kills whatever is listening on a port.
#[async_trait]
pub trait PortKiller: Send + Sync {
    /// Returns the pids that were signalled.
    async fn kill_listeners(&self, port: u16) -> Result<Vec<u32>>;
}

/// Looks up listening sockets through the OS and kills their owners.
///
/// The current process is never a candidate, even if it owns the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerKiller;

impl ListenerKiller {
    pub fn new() -> Self {
        Self
    }

    /// Pids listening on `port`, without the current process.
    pub async fn pids_on_port(port: u16) -> Result<Vec<u32>> {
        let found = tokio::task::spawn_blocking(move || {
            listeners::get_all()
                .map(|all| {
                    all.into_iter()
                        .filter(|listener| listener.socket.port() == port)
                        .map(|listener| listener.process.pid)
                        .collect::<Vec<u32>>()
                })
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| Error::Other(e.into()))?
        .map_err(|e| Error::Other(anyhow::anyhow!("Failed to list listeners: {}", e)))?;

        Ok(exclude_self(found, std::process::id()))
    }
}

fn exclude_self(mut pids: Vec<u32>, own_pid: u32) -> Vec<u32> {
    pids.retain(|&pid| pid != own_pid && pid != 0);
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[async_trait]
impl PortKiller for ListenerKiller {
    async fn kill_listeners(&self, port: u16) -> Result<Vec<u32>> {
        let pids = Self::pids_on_port(port).await?;
        let mut killed = Vec::with_capacity(pids.len());

        for pid in pids {
            match force_kill(pid) {
                Ok(()) => {
                    debug!("Killed PID {} listening on port {}", pid, port);
                    killed.push(pid);
                }
                Err(e) => warn!("Failed to kill PID {} on port {}: {}", pid, port, e),
            }
        }

        Ok(killed)
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid_i32 = i32::try_from(pid)
        .map_err(|_| Error::Other(anyhow::anyhow!("PID {} too large for system", pid)))?;
    signal::kill(Pid::from_raw(pid_i32), Signal::SIGKILL)?;
    Ok(())
}

#[cfg(windows)]
fn force_kill(pid: u32) -> Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(std::io::Error::last_os_error().into());
        }
        let ok = TerminateProcess(handle, 1);
        let err = std::io::Error::last_os_error();
        CloseHandle(handle);
        if ok == 0 {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Two-phase shutdown of a service handle.
///
/// Phase one asks the handle to close and polls the port for the grace window. If the
/// port is still bound, phase two kills the listeners on that port and polls again.
/// Every failure is logged and swallowed.
pub struct Terminator {
    service: String,
    probe: Arc<dyn PortProbe>,
    killer: Arc<dyn PortKiller>,
    config: ShutdownConfig,
}

impl Terminator {
    pub fn new(
        service: impl Into<String>,
        probe: Arc<dyn PortProbe>,
        killer: Arc<dyn PortKiller>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            service: service.into(),
            probe,
            killer,
            config,
        }
    }

    /// Returns `true` when the port was observed free afterwards.
    pub async fn terminate(&self, mut handle: ServiceHandle) -> bool {
        let port = handle.port();

        if let Err(e) = handle.close().await {
            debug!(service = %self.service, port, "Graceful close failed: {}", e);
        }

        if wait_for_port_close(
            self.probe.as_ref(),
            port,
            self.config.grace(),
            self.config.poll_interval(),
        )
        .await
        {
            debug!(service = %self.service, port, "Port released after graceful close");
            return true;
        }

        warn!(
            service = %self.service,
            port,
            "Port still bound after {:?}, forcing kill",
            self.config.grace()
        );

        match self.killer.kill_listeners(port).await {
            Ok(pids) if pids.is_empty() => {
                warn!(service = %self.service, port, "No killable listener found on port");
            }
            Ok(pids) => info!(service = %self.service, port, ?pids, "Force-killed listeners"),
            Err(e) => warn!(service = %self.service, port, "Forced kill failed: {}", e),
        }

        let freed = wait_for_port_close(
            self.probe.as_ref(),
            port,
            self.config.kill_grace(),
            self.config.poll_interval(),
        )
        .await;

        if !freed {
            error!(service = %self.service, port, "Port still bound after forced kill");
        }

        drop(handle);
        freed
    }
}
