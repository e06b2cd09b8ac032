use sidecar_core::{AgentConfig, Result};
use std::sync::Arc;

use crate::health::{HttpHealthCheck, StatusFailure};
use crate::launcher::CommandLauncher;
use crate::probe::HttpPortProbe;
use crate::supervisor::Supervisor;
use crate::terminate::ListenerKiller;

pub const AGENT_SERVICE: &str = "agent";

/// Supervisor for the agent backend: one instance on an ephemeral port, probed at
/// `health_route`. Any failed probe is a crash.
pub fn agent_supervisor(config: AgentConfig) -> Result<Supervisor> {
    config.process.validate()?;

    let timings = config.supervisor;
    let probe = Arc::new(HttpPortProbe::new(timings.shutdown.probe_timeout())?);
    let health = HttpHealthCheck::new(config.health_route, timings.health_timeout())?
        .with_status_failure(StatusFailure::Unreachable);

    let launcher = CommandLauncher::new(
        AGENT_SERVICE,
        config.process,
        probe.clone(),
        timings.startup_timeout(),
    );

    Supervisor::builder(AGENT_SERVICE, launcher)
        .config(timings)
        .health_check(Arc::new(health))
        .port_probe(probe)
        .port_killer(Arc::new(ListenerKiller::new()))
        .build()
}
