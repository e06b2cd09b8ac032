use parking_lot::Mutex;
use sidecar_core::{
    CrashPolicy, Launcher, Result, ServiceHandle, StatusListener, StatusSnapshot,
    SupervisorConfig, SupervisorState,
};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::health::{Health, HealthCheck, HttpHealthCheck, spawn_monitor};
use crate::probe::{HttpPortProbe, PortProbe};
use crate::terminate::{ListenerKiller, PortKiller, Terminator};

/// Owns the lifecycle of one managed service.
///
/// Cloning is cheap and every clone drives the same service. At most one restart timer
/// and one health monitor exist at any time; both are cancelled before a replacement is
/// scheduled.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: SupervisorConfig,
    policy: CrashPolicy,
    launcher: Arc<dyn Launcher>,
    health: Arc<dyn HealthCheck>,
    terminator: Terminator,
    shared: Mutex<Shared>,
    listeners: Mutex<Vec<Arc<dyn StatusListener>>>,
    // Filled under the `shared` lock so transitions keep their order; drained after it is released.
    outbox: Mutex<VecDeque<StatusSnapshot>>,
    delivering: Mutex<()>,
}

struct Shared {
    state: SupervisorState,
    handle: Option<ServiceHandle>,
    crash_count: u32,
    busy: bool,
    // Bumped by stop() and hot_swap(); a launch that finishes under an older epoch is stale.
    epoch: u64,
    // Bumped on every successful launch; health failures carry the instance they probed.
    instance: u64,
    last_error: Option<String>,
    restart_timer: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: SupervisorState::Stopped,
            handle: None,
            crash_count: 0,
            busy: false,
            epoch: 0,
            instance: 0,
            last_error: None,
            restart_timer: None,
            health_task: None,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let running = self.state.is_running();
        StatusSnapshot {
            status: self.state,
            port: self.handle.as_ref().map(|h| h.port()),
            uptime_ms: self
                .handle
                .as_ref()
                .filter(|_| running)
                .map(|h| h.uptime().as_millis() as u64),
            error_message: if self.state.is_faulted() {
                self.last_error.clone()
            } else {
                None
            },
        }
    }

    fn cancel_restart_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }

    fn cancel_health_monitor(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }
}

impl Inner {
    fn transition(&self, shared: &mut Shared, next: SupervisorState) {
        let previous = shared.state;
        shared.state = next;
        let snapshot = shared.snapshot();

        debug!(service = %self.name, from = %previous, to = %next, "State transition");

        self.outbox.lock().push_back(snapshot);
    }

    /// Hand queued snapshots to listeners, in order, with no supervisor lock held.
    ///
    /// Whoever holds `delivering` drains the queue; a concurrent caller leaves its
    /// snapshots to that drainer.
    fn deliver(&self) {
        loop {
            {
                let Some(_delivering) = self.delivering.try_lock() else {
                    return;
                };
                loop {
                    let next = self.outbox.lock().pop_front();
                    let Some(snapshot) = next else {
                        break;
                    };
                    let listeners = self.listeners.lock().clone();
                    for listener in &listeners {
                        listener.on_status(&self.name, &snapshot);
                    }
                }
            }
            // Something may have been queued between the last pop and the unlock.
            if self.outbox.lock().is_empty() {
                return;
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        shared.cancel_restart_timer();
        shared.cancel_health_monitor();
    }
}

struct ChannelListener(mpsc::UnboundedSender<StatusSnapshot>);

impl StatusListener for ChannelListener {
    fn on_status(&self, _service: &str, snapshot: &StatusSnapshot) {
        let _ = self.0.send(snapshot.clone());
    }
}

pub struct SupervisorBuilder {
    name: String,
    launcher: Arc<dyn Launcher>,
    config: SupervisorConfig,
    health: Option<Arc<dyn HealthCheck>>,
    probe: Option<Arc<dyn PortProbe>>,
    killer: Option<Arc<dyn PortKiller>>,
}

impl SupervisorBuilder {
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(check);
        self
    }

    pub fn port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn port_killer(mut self, killer: Arc<dyn PortKiller>) -> Self {
        self.killer = Some(killer);
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        self.config.validate()?;

        let probe: Arc<dyn PortProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpPortProbe::new(self.config.shutdown.probe_timeout())?),
        };
        let health: Arc<dyn HealthCheck> = match self.health {
            Some(health) => health,
            None => Arc::new(HttpHealthCheck::new("/", self.config.health_timeout())?),
        };
        let killer = self
            .killer
            .unwrap_or_else(|| Arc::new(ListenerKiller::new()));

        let terminator = Terminator::new(
            self.name.clone(),
            probe,
            killer,
            self.config.shutdown.clone(),
        );

        Ok(Supervisor {
            inner: Arc::new(Inner {
                policy: CrashPolicy::from(&self.config.backoff),
                name: self.name,
                config: self.config,
                launcher: self.launcher,
                health,
                terminator,
                shared: Mutex::new(Shared::new()),
                listeners: Mutex::new(Vec::new()),
                outbox: Mutex::new(VecDeque::new()),
                delivering: Mutex::new(()),
            }),
        })
    }
}

impl Supervisor {
    pub fn builder(name: impl Into<String>, launcher: impl Launcher + 'static) -> SupervisorBuilder {
        SupervisorBuilder {
            name: name.into(),
            launcher: Arc::new(launcher),
            config: SupervisorConfig::default(),
            health: None,
            probe: None,
            killer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.shared.lock().snapshot()
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.shared.lock().state
    }

    pub fn crash_count(&self) -> u32 {
        self.inner.shared.lock().crash_count
    }

    pub fn has_pending_restart(&self) -> bool {
        self.inner.shared.lock().restart_timer.is_some()
    }

    /// Instance id and port of the live instance while `Running`.
    ///
    /// The id changes with every successful launch, so it tells a report about the
    /// current instance apart from one about an instance already replaced.
    pub fn running_instance(&self) -> Option<(u64, u16)> {
        let shared = self.inner.shared.lock();
        match (&shared.handle, shared.state.is_running()) {
            (Some(handle), true) => Some((shared.instance, handle.port())),
            _ => None,
        }
    }

    /// Listeners are called after the state lock is released, so they may read
    /// [`status`](Self::status) or register further listeners.
    pub fn add_listener(&self, listener: impl StatusListener + 'static) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    /// Every subsequent status transition, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_listener(ChannelListener(tx));
        rx
    }

    /// Launch the service unless it is already starting or running, or has `Failed`.
    ///
    /// A launch failure is recorded against the crash counter (scheduling a restart or
    /// entering `Failed`) and also returned to the caller.
    pub async fn start(&self) -> Result<()> {
        let epoch = {
            let mut shared = self.inner.shared.lock();
            if shared.busy || shared.state.is_active() {
                debug!(service = %self.inner.name, state = %shared.state, "Start ignored");
                return Ok(());
            }
            if shared.state == SupervisorState::Failed {
                warn!(
                    service = %self.inner.name,
                    crash_count = shared.crash_count,
                    "Service failed permanently, only restart() can recover it"
                );
                return Ok(());
            }
            shared.busy = true;
            shared.cancel_restart_timer();
            self.inner.transition(&mut shared, SupervisorState::Starting);
            shared.epoch
        };
        self.inner.deliver();

        let launched = self.inner.launcher.launch().await;
        self.finish_start(epoch, launched).await
    }

    /// Tear the service down and end in `Stopped`. Safe to call in any state.
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let mut shared = self.inner.shared.lock();
            shared.epoch += 1;
            shared.busy = false;
            shared.cancel_restart_timer();
            shared.cancel_health_monitor();
            shared.handle.take()
        };

        if let Some(handle) = handle {
            info!(service = %self.inner.name, port = handle.port(), "Stopping service");
            self.inner.terminator.terminate(handle).await;
        }

        // A start() issued while the old instance was shutting down is discarded too.
        let late = {
            let mut shared = self.inner.shared.lock();
            shared.epoch += 1;
            shared.busy = false;
            shared.cancel_restart_timer();
            shared.cancel_health_monitor();
            shared.last_error = None;
            let late = shared.handle.take();
            if !shared.state.is_stopped() {
                self.inner.transition(&mut shared, SupervisorState::Stopped);
            }
            late
        };
        self.inner.deliver();

        if let Some(handle) = late {
            self.inner.terminator.terminate(handle).await;
        }

        Ok(())
    }

    /// User-initiated reset: stop, clear the crash counter, start.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.inner.shared.lock().crash_count = 0;
        self.start().await
    }

    /// Replace the running instance with a fresh launch without passing through `Stopped`.
    ///
    /// The launcher is expected to already point at the new target.
    pub async fn hot_swap(&self) -> Result<()> {
        let (epoch, previous) = {
            let mut shared = self.inner.shared.lock();
            shared.epoch += 1;
            shared.cancel_restart_timer();
            shared.cancel_health_monitor();
            shared.crash_count = 0;
            shared.last_error = None;
            shared.busy = true;
            let previous = shared.handle.take();
            if shared.state != SupervisorState::Starting {
                self.inner.transition(&mut shared, SupervisorState::Starting);
            }
            (shared.epoch, previous)
        };
        self.inner.deliver();

        if let Some(handle) = previous {
            info!(
                service = %self.inner.name,
                port = handle.port(),
                "Closing previous instance for hot swap"
            );
            self.inner.terminator.terminate(handle).await;
        }

        let launched = self.inner.launcher.launch().await;
        self.finish_start(epoch, launched).await
    }

    /// Instance `instance` is alive but its content is invalid: go straight to `Error`,
    /// no backoff.
    ///
    /// Ignored unless that instance is the one currently `Running`
    /// (see [`running_instance`](Self::running_instance)).
    pub async fn report_invalid(&self, instance: u64, reason: impl Into<String>) {
        let handle = {
            let mut shared = self.inner.shared.lock();
            if shared.instance != instance || !shared.state.is_running() {
                debug!(
                    service = %self.inner.name,
                    state = %shared.state,
                    instance,
                    current = shared.instance,
                    "Ignoring invalid-content report"
                );
                return;
            }
            shared.cancel_health_monitor();
            let handle = shared.handle.take();
            let port = handle.as_ref().map(|h| h.port());
            self.enter_error(&mut shared, reason.into(), port);
            handle
        };
        self.inner.deliver();

        if let Some(handle) = handle {
            self.inner.terminator.terminate(handle).await;
        }
    }

    async fn finish_start(&self, epoch: u64, launched: Result<ServiceHandle>) -> Result<()> {
        let (result, stale) = {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch {
                (Ok(()), launched.ok())
            } else {
                shared.busy = false;
                match launched {
                    Ok(handle) => {
                        let port = handle.port();
                        let pid = handle.pid();
                        shared.handle = Some(handle);
                        shared.instance += 1;
                        shared.crash_count = 0;
                        shared.last_error = None;
                        self.inner.transition(&mut shared, SupervisorState::Running);
                        self.arm_health_monitor(&mut shared, port);
                        info!(service = %self.inner.name, port, ?pid, "Service running");
                        (Ok(()), None)
                    }
                    Err(e) => {
                        self.record_crash(&mut shared, e.to_string(), None);
                        (Err(e), None)
                    }
                }
            }
        };
        self.inner.deliver();

        if let Some(handle) = stale {
            debug!(
                service = %self.inner.name,
                port = handle.port(),
                "Discarding instance launched before a stop"
            );
            self.inner.terminator.terminate(handle).await;
        }
        result
    }

    fn record_crash(&self, shared: &mut Shared, reason: String, port: Option<u16>) {
        shared.crash_count = shared.crash_count.saturating_add(1);
        shared.last_error = Some(reason);
        let crash_count = shared.crash_count;
        let reason = shared.last_error.as_deref().unwrap_or_default();

        match self.inner.policy.next_delay(crash_count) {
            None => {
                error!(
                    service = %self.inner.name,
                    crash_count,
                    ?port,
                    retry_scheduled = false,
                    "Service failed permanently: {}",
                    reason
                );
                shared.cancel_restart_timer();
                self.inner.transition(shared, SupervisorState::Failed);
            }
            Some(delay) => {
                warn!(
                    service = %self.inner.name,
                    crash_count,
                    ?port,
                    delay_ms = delay.as_millis() as u64,
                    retry_scheduled = true,
                    "Service crashed: {}",
                    reason
                );
                self.inner.transition(shared, SupervisorState::Crashed);
                self.schedule_restart(shared, delay);
            }
        }
    }

    fn enter_error(&self, shared: &mut Shared, reason: String, port: Option<u16>) {
        error!(
            service = %self.inner.name,
            crash_count = shared.crash_count,
            ?port,
            retry_scheduled = false,
            "Service reported invalid content: {}",
            reason
        );
        shared.last_error = Some(reason);
        shared.cancel_restart_timer();
        self.inner.transition(shared, SupervisorState::Error);
    }

    fn schedule_restart(&self, shared: &mut Shared, delay: Duration) {
        shared.cancel_restart_timer();

        let weak = Arc::downgrade(&self.inner);
        let epoch = shared.epoch;

        shared.restart_timer = Some(tokio::spawn(async move {
            sleep(delay).await;

            let Some(supervisor) = Self::upgrade(&weak) else {
                return;
            };
            {
                let mut shared = supervisor.inner.shared.lock();
                if shared.epoch != epoch || shared.state != SupervisorState::Crashed {
                    return;
                }
                // Detach instead of abort: start() must not cancel the task running it.
                drop(shared.restart_timer.take());
            }

            let _ = supervisor.start().await;
        }));
    }

    fn arm_health_monitor(&self, shared: &mut Shared, port: u16) {
        shared.cancel_health_monitor();

        let weak = Arc::downgrade(&self.inner);
        let instance = shared.instance;

        shared.health_task = Some(spawn_monitor(
            self.inner.health.clone(),
            port,
            self.inner.config.health_interval(),
            self.inner.config.health_timeout(),
            move |health| async move {
                if let Some(supervisor) = Self::upgrade(&weak) {
                    supervisor.on_health_failure(instance, health).await;
                }
            },
        ));
    }

    async fn on_health_failure(&self, instance: u64, health: Health) {
        let handle = {
            let mut shared = self.inner.shared.lock();
            if health.is_healthy()
                || shared.instance != instance
                || !shared.state.is_running()
                || shared.handle.is_none()
            {
                debug!(
                    service = %self.inner.name,
                    state = %shared.state,
                    "Discarding health failure for an instance no longer supervised"
                );
                return;
            }

            // Detach instead of abort: this runs on the monitor task itself.
            drop(shared.health_task.take());
            let handle = shared.handle.take();
            let port = handle.as_ref().map(|h| h.port());

            match health {
                Health::Invalid(reason) => self.enter_error(&mut shared, reason, port),
                Health::Unreachable(reason) => self.record_crash(&mut shared, reason, port),
                Health::Healthy => {}
            }
            handle
        };
        self.inner.deliver();

        if let Some(handle) = handle {
            self.inner.terminator.terminate(handle).await;
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Supervisor> {
        weak.upgrade().map(|inner| Supervisor { inner })
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}
