use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use sidecar_core::{ContentConfig, Error, Result, StatusSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::health::{HttpHealthCheck, StatusFailure};
use crate::launcher::CommandLauncher;
use crate::probe::HttpPortProbe;
use crate::supervisor::Supervisor;
use crate::terminate::ListenerKiller;

pub const CONTENT_SERVICE: &str = "content";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub name: String,
}

impl Workspace {
    /// Name defaults to the last path component.
    pub fn new(path: impl Into<PathBuf>, name: Option<String>) -> Self {
        let path = path.into();
        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        });
        Self { path, name }
    }
}

/// The workspace the content server is launched against. Shared with its launcher.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSlot(Arc<ArcSwapOption<Workspace>>);

impl WorkspaceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Workspace>> {
        self.0.load_full()
    }

    pub fn set(&self, workspace: Workspace) {
        self.0.store(Some(Arc::new(workspace)));
    }
}

#[derive(Default)]
struct ManifestCache {
    generation: u64,
    entry: Option<(u16, serde_json::Value)>,
}

/// Content-server supervisor bound to a switchable workspace.
pub struct WorkspaceSupervisor {
    supervisor: Supervisor,
    slot: WorkspaceSlot,
    manifest_route: String,
    client: reqwest::Client,
    cache: Mutex<ManifestCache>,
}

impl WorkspaceSupervisor {
    pub fn new(config: ContentConfig) -> Result<Self> {
        config.process.validate()?;

        let slot = WorkspaceSlot::new();
        let timings = config.supervisor.clone();
        let probe = Arc::new(HttpPortProbe::new(timings.shutdown.probe_timeout())?);
        let health = HttpHealthCheck::new(&config.manifest_route, timings.health_timeout())?
            .with_status_failure(StatusFailure::Invalid);

        let launcher = CommandLauncher::new(
            CONTENT_SERVICE,
            config.process,
            probe.clone(),
            timings.startup_timeout(),
        )
        .with_workspace(slot.clone(), config.workspace_env);

        let supervisor = Supervisor::builder(CONTENT_SERVICE, launcher)
            .config(timings)
            .health_check(Arc::new(health))
            .port_probe(probe)
            .port_killer(Arc::new(ListenerKiller::new()))
            .build()?;

        Self::from_supervisor(supervisor, slot, config.manifest_route)
    }

    /// Wrap an already built supervisor whose launcher reads `slot`.
    pub fn from_supervisor(
        supervisor: Supervisor,
        slot: WorkspaceSlot,
        manifest_route: impl Into<String>,
    ) -> Result<Self> {
        let timeout = supervisor.config().health_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Http(format!("Failed to build manifest client: {}", e)))?;

        Ok(Self {
            supervisor,
            slot,
            manifest_route: manifest_route.into(),
            client,
            cache: Mutex::new(ManifestCache::default()),
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn workspace(&self) -> Option<Arc<Workspace>> {
        self.slot.current()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.supervisor.status()
    }

    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.invalidate_manifest();
        self.supervisor.stop().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.invalidate_manifest();
        self.supervisor.restart().await
    }

    /// Serve a different workspace without passing through `Stopped`.
    pub async fn switch_workspace(
        &self,
        path: impl AsRef<Path>,
        name: Option<String>,
    ) -> Result<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::InvalidWorkspace(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let workspace = Workspace::new(path, name);
        info!(
            service = CONTENT_SERVICE,
            workspace = %workspace.name,
            path = %workspace.path.display(),
            "Switching workspace"
        );

        self.invalidate_manifest();
        self.slot.set(workspace);
        self.supervisor.hot_swap().await
    }

    /// The manifest served by the running instance, cached until the next switch or stop.
    ///
    /// A non-2xx or malformed reply puts the instance that served it into `Error`, unless
    /// that instance was replaced while the fetch was in flight.
    pub async fn manifest(&self) -> Result<serde_json::Value> {
        let (instance, port) = self
            .supervisor
            .running_instance()
            .ok_or_else(|| Error::NotRunning(CONTENT_SERVICE.to_string()))?;

        let generation = {
            let cache = self.cache.lock();
            if let Some((cached_port, manifest)) = &cache.entry
                && *cached_port == port
            {
                return Ok(manifest.clone());
            }
            cache.generation
        };

        let manifest = match self.fetch_manifest(port).await {
            Ok(manifest) => manifest,
            Err(Error::InvalidContent(reason)) => {
                return Err(self.invalid(instance, generation, reason).await);
            }
            Err(e) => return Err(e),
        };

        let mut cache = self.cache.lock();
        if cache.generation == generation {
            cache.entry = Some((port, manifest.clone()));
        } else {
            debug!(service = CONTENT_SERVICE, port, "Manifest fetched across a switch, not cached");
        }
        Ok(manifest)
    }

    async fn fetch_manifest(&self, port: u16) -> Result<serde_json::Value> {
        let url = format!("http://127.0.0.1:{}{}", port, self.manifest_route);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::InvalidContent(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::InvalidContent(format!("{} returned malformed manifest: {}", url, e)))
    }

    async fn invalid(&self, instance: u64, generation: u64, reason: String) -> Error {
        let current = {
            let mut cache = self.cache.lock();
            if cache.generation == generation {
                cache.generation += 1;
                cache.entry = None;
                true
            } else {
                false
            }
        };

        if current {
            warn!(service = CONTENT_SERVICE, "{}", reason);
            self.supervisor.report_invalid(instance, reason.clone()).await;
        } else {
            debug!(
                service = CONTENT_SERVICE,
                "Invalid manifest from a replaced instance ignored: {}", reason
            );
        }
        Error::InvalidContent(reason)
    }

    fn invalidate_manifest(&self) {
        let mut cache = self.cache.lock();
        cache.generation += 1;
        cache.entry = None;
    }
}
