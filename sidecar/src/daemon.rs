use crate::cli::RunArgs;
use anyhow::{Context, bail};
use serde::Serialize;
use sidecar_core::{Config, ConfigLoader, StatusSnapshot};
use sidecar_supervisor::{
    AGENT_SERVICE, CONTENT_SERVICE, Supervisor, WorkspaceSupervisor, agent_supervisor,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Serialize)]
struct EventLine<'a> {
    service: &'a str,
    #[serde(flatten)]
    snapshot: &'a StatusSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Agent,
    Content,
}

#[derive(Debug, PartialEq, Eq)]
enum Request {
    Start(Target),
    Stop(Target),
    Restart(Target),
    Status(Target),
    Switch { path: PathBuf, name: Option<String> },
    Manifest,
    Quit,
}

impl Request {
    fn parse(line: &str) -> Result<Self, String> {
        let words = shell_words::split(line).map_err(|e| format!("Malformed command: {}", e))?;
        let mut words = words.iter().map(String::as_str);

        let request = match (words.next(), words.next(), words.next()) {
            (Some("start"), Some(t), None) => Request::Start(parse_target(t)?),
            (Some("stop"), Some(t), None) => Request::Stop(parse_target(t)?),
            (Some("restart"), Some(t), None) => Request::Restart(parse_target(t)?),
            (Some("status"), Some(t), None) => Request::Status(parse_target(t)?),
            (Some("switch"), Some(path), name) => Request::Switch {
                path: PathBuf::from(path),
                name: name.map(str::to_string),
            },
            (Some("manifest"), None, None) => Request::Manifest,
            (Some("quit" | "exit"), None, None) => Request::Quit,
            _ => return Err(format!("Unknown command: {}", line.trim())),
        };

        if words.next().is_some() {
            return Err(format!("Too many arguments: {}", line.trim()));
        }
        Ok(request)
    }
}

fn parse_target(word: &str) -> Result<Target, String> {
    match word {
        AGENT_SERVICE => Ok(Target::Agent),
        CONTENT_SERVICE => Ok(Target::Content),
        other => Err(format!("Unknown service: {}", other)),
    }
}

fn print_event(service: &str, snapshot: &StatusSnapshot) {
    match serde_json::to_string(&EventLine { service, snapshot }) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode status event: {}", e),
    }
}

fn print_error(message: impl std::fmt::Display) {
    println!("{}", serde_json::json!({ "error": message.to_string() }));
}

pub struct Daemon {
    agent: Option<Supervisor>,
    content: Option<WorkspaceSupervisor>,
}

impl Daemon {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        if config.agent.is_none() && config.content.is_none() {
            bail!("Config defines neither an agent nor a content service");
        }

        let agent = config
            .agent
            .map(agent_supervisor)
            .transpose()
            .context("Failed to set up agent supervisor")?;
        let content = config
            .content
            .map(WorkspaceSupervisor::new)
            .transpose()
            .context("Failed to set up content supervisor")?;

        Ok(Self { agent, content })
    }

    pub async fn run(self, workspace: Option<(PathBuf, Option<String>)>) -> anyhow::Result<()> {
        info!("Sidecar starting...");

        let (event_tx, mut events) = mpsc::unbounded_channel::<(String, StatusSnapshot)>();
        for supervisor in self.supervisors() {
            let tx = event_tx.clone();
            supervisor.add_listener(move |service: &str, snapshot: &StatusSnapshot| {
                let _ = tx.send((service.to_string(), snapshot.clone()));
            });
        }
        drop(event_tx);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        Self::setup_signal_handlers(shutdown_tx);

        if let Some(agent) = &self.agent
            && let Err(e) = agent.start().await
        {
            warn!("Agent failed to start: {}", e);
        }
        if let (Some(content), Some((path, name))) = (&self.content, workspace)
            && let Err(e) = content.switch_workspace(&path, name).await
        {
            warn!("Content server failed to start: {}", e);
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                Some((service, snapshot)) = events.recv() => {
                    print_event(&service, &snapshot);
                }

                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            info!("stdin closed");
                            break;
                        }
                        Err(e) => {
                            warn!("Failed to read stdin: {}", e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Request::parse(&line) {
                        Ok(Request::Quit) => break,
                        Ok(request) => {
                            if let Err(e) = self.handle(request).await {
                                print_error(e);
                            }
                        }
                        Err(e) => print_error(e),
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;

        while let Ok((service, snapshot)) = events.try_recv() {
            print_event(&service, &snapshot);
        }
        Ok(())
    }

    fn supervisors(&self) -> impl Iterator<Item = &Supervisor> {
        self.agent
            .iter()
            .chain(self.content.iter().map(|c| c.supervisor()))
    }

    fn agent(&self) -> anyhow::Result<&Supervisor> {
        self.agent
            .as_ref()
            .context("agent service is not configured")
    }

    fn content(&self) -> anyhow::Result<&WorkspaceSupervisor> {
        self.content
            .as_ref()
            .context("content service is not configured")
    }

    async fn handle(&self, request: Request) -> anyhow::Result<()> {
        match request {
            Request::Start(Target::Agent) => self.agent()?.start().await?,
            Request::Start(Target::Content) => self.content()?.start().await?,
            Request::Stop(Target::Agent) => self.agent()?.stop().await?,
            Request::Stop(Target::Content) => self.content()?.stop().await?,
            Request::Restart(Target::Agent) => self.agent()?.restart().await?,
            Request::Restart(Target::Content) => self.content()?.restart().await?,
            Request::Status(Target::Agent) => print_event(AGENT_SERVICE, &self.agent()?.status()),
            Request::Status(Target::Content) => {
                print_event(CONTENT_SERVICE, &self.content()?.status())
            }
            Request::Switch { path, name } => {
                self.content()?.switch_workspace(&path, name).await?
            }
            Request::Manifest => {
                let manifest = self.content()?.manifest().await?;
                println!("{}", serde_json::json!({ "manifest": manifest }));
            }
            Request::Quit => {}
        }
        Ok(())
    }

    fn setup_signal_handlers(shutdown_tx: mpsc::Sender<()>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            tokio::spawn(async move {
                let (mut sigterm, mut sigint) = match (
                    signal(SignalKind::terminate()),
                    signal(SignalKind::interrupt()),
                ) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                }

                let _ = shutdown_tx.send(()).await;
            });
        }
        #[cfg(not(unix))]
        {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C");
                    let _ = shutdown_tx.send(()).await;
                }
            });
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down sidecar...");

        let agent = async {
            if let Some(agent) = &self.agent {
                let _ = agent.stop().await;
            }
        };
        let content = async {
            if let Some(content) = &self.content {
                let _ = content.stop().await;
            }
        };
        tokio::join!(agent, content);
    }
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let loader = ConfigLoader::new();
    let config = match &args.config {
        Some(path) => loader
            .load_from(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => loader.load().await.context("Failed to load config")?,
    };

    let daemon = Daemon::new(config)?;
    daemon.run(args.workspace.map(|path| (path, args.name))).await
}
