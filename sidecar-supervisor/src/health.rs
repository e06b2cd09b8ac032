use async_trait::async_trait;
use sidecar_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace};

/// Outcome of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// The service did not answer properly; handled as a crash.
    Unreachable(String),
    /// The service answered but reports its content as invalid; handled as a hard error.
    Invalid(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy => None,
            Self::Unreachable(reason) | Self::Invalid(reason) => Some(reason),
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, port: u16) -> Health;
}

/// What a non-2xx answer from the health route means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFailure {
    /// Treat it like no answer at all.
    Unreachable,
    /// The service is alive but its content is bad.
    Invalid,
}

/// HTTP GET against `http://127.0.0.1:<port><route>` with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    route: String,
    on_error_status: StatusFailure,
}

impl HttpHealthCheck {
    pub fn new(route: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Http(format!("Failed to build health client: {}", e)))?;

        Ok(Self {
            client,
            route: route.into(),
            on_error_status: StatusFailure::Unreachable,
        })
    }

    pub fn with_status_failure(mut self, failure: StatusFailure) -> Self {
        self.on_error_status = failure;
        self
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://127.0.0.1:{}{}", port, self.route)
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, port: u16) -> Health {
        let url = self.url(port);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                trace!("Health check passed at {}", url);
                Health::Healthy
            }
            Ok(response) => {
                let reason = format!("{} returned status {}", url, response.status());
                match self.on_error_status {
                    StatusFailure::Unreachable => Health::Unreachable(reason),
                    StatusFailure::Invalid => Health::Invalid(reason),
                }
            }
            Err(e) if e.is_timeout() => Health::Unreachable(format!("{} timed out", url)),
            Err(e) => Health::Unreachable(format!("Health check failed: {}", e)),
        }
    }
}

/// Spawn the repeating liveness probe for one running instance.
///
/// The first probe fires one `every` after the call. The loop ends at the first failure,
/// which is handed to `on_failure`; the callback must re-check that the supervisor still
/// cares before acting. A probe that exceeds `timeout` counts as unreachable.
pub fn spawn_monitor<F, Fut>(
    check: Arc<dyn HealthCheck>,
    port: u16,
    every: Duration,
    timeout: Duration,
    on_failure: F,
) -> JoinHandle<()>
where
    F: FnOnce(Health) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let health = match tokio::time::timeout(timeout, check.check(port)).await {
                Ok(health) => health,
                Err(_) => Health::Unreachable(format!("Health probe exceeded {:?}", timeout)),
            };

            if health.is_healthy() {
                continue;
            }

            debug!(port, "Health check failed: {:?}", health);
            on_failure(health).await;
            return;
        }
    })
}
