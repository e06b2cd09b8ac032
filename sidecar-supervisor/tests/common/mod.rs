#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sidecar_core::{
    Error, GracefulClose, Launcher, Result, ServiceHandle, StatusSnapshot, SupervisorState,
};
use sidecar_supervisor::{Health, HealthCheck, PortKiller, PortProbe, WorkspaceSlot};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct CountingCloser(pub Arc<AtomicU32>);

#[async_trait]
impl GracefulClose for CountingCloser {
    async fn close(&mut self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launch outcomes are taken from `script` first, then from `default_ok`.
pub struct FakeLauncher {
    script: Mutex<VecDeque<bool>>,
    pub default_ok: AtomicBool,
    pub delay: Duration,
    pub launches: AtomicU32,
    pub closes: Arc<AtomicU32>,
}

impl FakeLauncher {
    pub fn new(script: impl IntoIterator<Item = bool>, default_ok: bool) -> Arc<Self> {
        Self::with_delay(script, default_ok, Duration::ZERO)
    }

    pub fn with_delay(
        script: impl IntoIterator<Item = bool>,
        default_ok: bool,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            default_ok: AtomicBool::new(default_ok),
            delay,
            launches: AtomicU32::new(0),
            closes: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> Result<ServiceHandle> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let ok = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_ok.load(Ordering::SeqCst));

        if ok {
            Ok(ServiceHandle::new(
                4100 + n as u16,
                CountingCloser(self.closes.clone()),
            ))
        } else {
            Err(Error::SpawnFailed(format!("scripted failure #{}", n + 1)))
        }
    }
}

/// Answers from `script` first, healthy afterwards.
#[derive(Default)]
pub struct ScriptedHealth {
    script: Mutex<VecDeque<Health>>,
}

impl ScriptedHealth {
    pub fn new(script: impl IntoIterator<Item = Health>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
        })
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealth {
    async fn check(&self, _port: u16) -> Health {
        self.script.lock().pop_front().unwrap_or(Health::Healthy)
    }
}

pub struct ClosedProbe;

#[async_trait]
impl PortProbe for ClosedProbe {
    async fn is_bound(&self, _port: u16) -> bool {
        false
    }
}

pub struct BoundProbe;

#[async_trait]
impl PortProbe for BoundProbe {
    async fn is_bound(&self, _port: u16) -> bool {
        true
    }
}

/// Records the ports it was asked to clear and shuts down `victim` if one is set.
#[derive(Default)]
pub struct RecordingKiller {
    pub ports: Mutex<Vec<u16>>,
    pub victim: Mutex<Option<Responder>>,
}

#[async_trait]
impl PortKiller for RecordingKiller {
    async fn kill_listeners(&self, port: u16) -> Result<Vec<u32>> {
        self.ports.lock().push(port);
        match self.victim.lock().take() {
            Some(responder) => {
                drop(responder);
                Ok(vec![4242])
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Status events with the (possibly paused) clock reading at which they arrived.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(Instant, StatusSnapshot)>>>,
}

impl Recorder {
    pub fn listener(&self) -> impl Fn(&str, &StatusSnapshot) + Send + Sync + 'static {
        let events = self.events.clone();
        move |_service: &str, snapshot: &StatusSnapshot| {
            events.lock().push((Instant::now(), snapshot.clone()));
        }
    }

    pub fn states(&self) -> Vec<SupervisorState> {
        self.events.lock().iter().map(|(_, s)| s.status).collect()
    }

    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        self.events.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    /// Arrival times of every event in `state`.
    pub fn times_of(&self, state: SupervisorState) -> Vec<Instant> {
        self.events
            .lock()
            .iter()
            .filter(|(_, s)| s.status == state)
            .map(|(at, _)| *at)
            .collect()
    }
}

/// Minimal HTTP/1.1 responder on an ephemeral loopback port.
pub struct Responder {
    pub port: u16,
    pub status: Arc<AtomicU16>,
    pub hits: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl Responder {
    pub async fn spawn(body: impl Into<String>) -> Self {
        Self::with_status(body, Arc::new(AtomicU16::new(200))).await
    }

    /// The response status is read from `status` on every request.
    pub async fn with_status(body: impl Into<String>, status: Arc<AtomicU16>) -> Self {
        Self::scripted(body, status, Arc::new(AtomicU64::new(0))).await
    }

    /// Like [`Responder::with_status`], also holding each reply back by `delay_ms`, read
    /// when the request is accepted.
    pub async fn scripted(
        body: impl Into<String>,
        status: Arc<AtomicU16>,
        delay_ms: Arc<AtomicU64>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicU32::new(0));
        let body = body.into();

        let task = {
            let status = status.clone();
            let hits = hits.clone();
            let delay_ms = delay_ms.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    hits.fetch_add(1, Ordering::SeqCst);
                    let code = status.load(Ordering::SeqCst);
                    let delay = Duration::from_millis(delay_ms.load(Ordering::SeqCst));
                    let body = body.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 2048];
                        let _ = socket.read(&mut buf).await;
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let response = format!(
                            "HTTP/1.1 {} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                            code,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
            })
        };

        Self {
            port,
            status,
            hits,
            task,
        }
    }

    pub fn set_status(&self, code: u16) {
        self.status.store(code, Ordering::SeqCst);
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Closing the handle stops the responder.
pub struct ResponderCloser(pub Option<Responder>);

#[async_trait]
impl GracefulClose for ResponderCloser {
    async fn close(&mut self) -> Result<()> {
        self.0.take();
        Ok(())
    }
}

/// Serves `{"workspace": "<name>"}` for whichever workspace the slot holds at launch time.
pub struct ContentLauncher {
    pub slot: WorkspaceSlot,
    pub status: Arc<AtomicU16>,
    pub delay_ms: Arc<AtomicU64>,
    pub launches: Arc<AtomicU32>,
    pub hits: Arc<Mutex<Vec<Arc<AtomicU32>>>>,
}

impl ContentLauncher {
    pub fn new(slot: WorkspaceSlot) -> Self {
        Self {
            slot,
            status: Arc::new(AtomicU16::new(200)),
            delay_ms: Arc::new(AtomicU64::new(0)),
            launches: Arc::new(AtomicU32::new(0)),
            hits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Total requests served by every instance launched so far.
    pub fn total_hits(hits: &Mutex<Vec<Arc<AtomicU32>>>) -> u32 {
        hits.lock().iter().map(|h| h.load(Ordering::SeqCst)).sum()
    }
}

#[async_trait]
impl Launcher for ContentLauncher {
    async fn launch(&self) -> Result<ServiceHandle> {
        let workspace = self.slot.current().ok_or(Error::NoWorkspace)?;
        self.launches.fetch_add(1, Ordering::SeqCst);

        let body = serde_json::json!({ "workspace": workspace.name }).to_string();
        let responder = Responder::scripted(body, self.status.clone(), self.delay_ms.clone()).await;
        self.hits.lock().push(responder.hits.clone());

        let port = responder.port;
        Ok(ServiceHandle::new(port, ResponderCloser(Some(responder))))
    }
}
