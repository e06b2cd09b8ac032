use crate::cli::PortArgs;
use sidecar_core::ShutdownConfig;
use sidecar_supervisor::{HttpPortProbe, PortProbe};

pub async fn execute(args: PortArgs) -> anyhow::Result<()> {
    let probe = HttpPortProbe::new(ShutdownConfig::default().probe_timeout())?;

    if probe.is_bound(args.port).await {
        println!("bound");
    } else {
        println!("closed");
    }
    Ok(())
}
