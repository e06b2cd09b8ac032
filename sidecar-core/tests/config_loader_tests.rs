use sidecar_core::config::loader::CONFIG_FILE_NAME;
use sidecar_core::{ConfigLoader, Error};
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"{
    "agent": {
        "process": {
            "command": "agent-server --port {port}",
            "env": { "AGENT_MODE": "local" }
        },
        "health_route": "/health",
        "supervisor": {
            "health_interval_ms": 2500,
            "backoff": { "max_crash_count": 3 }
        }
    },
    "content": {
        "process": {
            "command": "content-server",
            "args": ["--root", "{workspace}"],
            "port_env": "PORT"
        },
        "workspace_env": "CONTENT_ROOT"
    }
}"#;

#[tokio::test]
async fn test_load_sidecar_json() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&config_path, CONFIG).unwrap();

    let loaded = ConfigLoader::new().load_from(&config_path).await.unwrap();

    let agent = loaded.agent.unwrap();
    assert_eq!(agent.process.command, "agent-server");
    assert_eq!(agent.process.args, vec!["--port", "{port}"]);
    assert_eq!(agent.process.env.get("AGENT_MODE").map(String::as_str), Some("local"));
    assert_eq!(agent.health_route, "/health");
    assert_eq!(agent.supervisor.health_interval(), Duration::from_millis(2500));
    assert_eq!(agent.supervisor.backoff.max_crash_count, 3);
    assert_eq!(agent.supervisor.backoff.base_delay_ms, 1000);
    assert_eq!(agent.supervisor.shutdown.grace_ms, 2000);

    let content = loaded.content.unwrap();
    assert_eq!(content.process.args, vec!["--root", "{workspace}"]);
    assert_eq!(content.process.port_env.as_deref(), Some("PORT"));
    assert_eq!(content.workspace_env.as_deref(), Some("CONTENT_ROOT"));
    assert_eq!(content.manifest_route, "/api/manifest");
    assert_eq!(content.supervisor.health_interval(), Duration::from_secs(10));
}

#[tokio::test]
async fn test_discover_prefers_earlier_search_path() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    std::fs::write(second.path().join(CONFIG_FILE_NAME), CONFIG).unwrap();

    let loader = ConfigLoader::with_paths([first.path(), second.path()]);
    assert_eq!(
        loader.discover(),
        Some(second.path().join(CONFIG_FILE_NAME))
    );

    std::fs::write(
        first.path().join(CONFIG_FILE_NAME),
        r#"{"agent": {"process": {"command": "other"}}}"#,
    )
    .unwrap();
    let loaded = loader.load().await.unwrap();
    assert_eq!(loaded.agent.unwrap().process.command, "other");
    assert!(loaded.content.is_none());
}

#[tokio::test]
async fn test_missing_config_is_config_error() {
    let empty = TempDir::new().unwrap();
    let loader = ConfigLoader::with_paths([empty.path()]);

    assert!(loader.discover().is_none());
    assert!(matches!(loader.load().await, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_invalid_configs_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(CONFIG_FILE_NAME);
    let loader = ConfigLoader::new();

    for bad in [
        r#"{"agent": {"process": {"command": ""}}}"#,
        r#"{"content": {"process": {"command": "serve"}, "manifest_route": "api"}}"#,
        r#"{"agent": {"process": {"command": "a"}, "supervisor": {"health_interval_ms": 0}}}"#,
        r#"{"agent": {"process": {"command": "a"}, "supervisor": {"backoff": {"max_crash_count": 0}}}}"#,
        r#"{"agent": "#,
    ] {
        std::fs::write(&path, bad).unwrap();
        assert!(
            matches!(loader.load_from(&path).await, Err(Error::Config(_))),
            "accepted {bad}"
        );
    }
}
