#![cfg(unix)]

mod common;

use common::{BoundProbe, ClosedProbe};
use sidecar_core::{CommandConfig, Error, Launcher};
use sidecar_supervisor::{CommandLauncher, Workspace, WorkspaceSlot};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn command(cmd: &str, args: &[&str]) -> CommandConfig {
    CommandConfig {
        command: cmd.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_early_exit_is_reported() {
    let launcher = CommandLauncher::new(
        "agent",
        command("sh", &["-c", "exit 3"]),
        Arc::new(ClosedProbe),
        Duration::from_secs(5),
    )
    .with_poll_interval(Duration::from_millis(20));

    let err = launcher.launch().await.unwrap_err();
    assert!(matches!(err, Error::ExitedEarly { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_port_never_bound_times_out() {
    let launcher = CommandLauncher::new(
        "agent",
        command("sleep", &["10"]),
        Arc::new(ClosedProbe),
        Duration::from_millis(300),
    )
    .with_poll_interval(Duration::from_millis(20));

    let err = launcher.launch().await.unwrap_err();
    match err {
        Error::StartupTimeout { service, timeout, .. } => {
            assert_eq!(service, "agent");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected startup timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_binary_is_spawn_failure() {
    let launcher = CommandLauncher::new(
        "agent",
        command("this_command_does_not_exist_12345", &[]),
        Arc::new(BoundProbe),
        Duration::from_secs(1),
    );

    let err = launcher.launch().await.unwrap_err();
    assert!(matches!(err, Error::SpawnFailed(_)));
}

#[tokio::test]
async fn test_ready_launch_returns_closable_handle() {
    let launcher = CommandLauncher::new(
        "agent",
        command("sleep", &["30"]),
        Arc::new(BoundProbe),
        Duration::from_secs(1),
    );

    let mut handle = launcher.launch().await.unwrap();
    assert_ne!(handle.port(), 0);
    assert!(handle.pid().is_some());

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_workspace_launcher_requires_workspace() {
    let slot = WorkspaceSlot::new();
    let launcher = CommandLauncher::new(
        "content",
        command("sleep", &["30"]),
        Arc::new(BoundProbe),
        Duration::from_secs(1),
    )
    .with_workspace(slot.clone(), Some("SIDECAR_WORKSPACE".to_string()));

    assert!(matches!(launcher.launch().await, Err(Error::NoWorkspace)));

    slot.set(Workspace::new("/definitely/not/a/workspace", None));
    assert!(matches!(
        launcher.launch().await,
        Err(Error::InvalidWorkspace(_))
    ));

    let root = TempDir::new().unwrap();
    slot.set(Workspace::new(root.path(), None));
    let mut handle = launcher.launch().await.unwrap();
    handle.close().await.unwrap();
}
