use crate::cli::PortArgs;
use anyhow::Context;
use sidecar_supervisor::{ListenerKiller, PortKiller};

pub async fn execute(args: PortArgs) -> anyhow::Result<()> {
    let killed = ListenerKiller::new()
        .kill_listeners(args.port)
        .await
        .with_context(|| format!("Failed to clear port {}", args.port))?;

    if killed.is_empty() {
        println!("No process listening on port {}", args.port);
    } else {
        for pid in killed {
            println!("Killed PID {} on port {}", pid, args.port);
        }
    }
    Ok(())
}
