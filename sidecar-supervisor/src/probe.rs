use async_trait::async_trait;
use sidecar_core::{Error, Result};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::trace;

/// Answers "is something still bound to this loopback port?".
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_bound(&self, port: u16) -> bool;
}

/// Probes `http://127.0.0.1:<port>` with a short timeout.
///
/// A connection-level failure means the port is closed. Any response, including error
/// statuses, and any other failure (timeouts, garbled replies) mean it is still bound.
#[derive(Debug, Clone)]
pub struct HttpPortProbe {
    client: reqwest::Client,
}

impl HttpPortProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Http(format!("Failed to build probe client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PortProbe for HttpPortProbe {
    async fn is_bound(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}", port);
        match self.client.get(&url).send().await {
            Ok(response) => {
                trace!("Port {} answered with {}", port, response.status());
                true
            }
            Err(e) if e.is_connect() => false,
            Err(e) => {
                trace!("Port {} probe inconclusive: {}", port, e);
                true
            }
        }
    }
}

/// Poll `probe` every `interval` until the port closes or `window` elapses.
///
/// Returns `true` as soon as the port is observed closed.
pub async fn wait_for_port_close(
    probe: &dyn PortProbe,
    port: u16,
    window: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if !probe.is_bound(port).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}

/// Poll `probe` every `interval` until the port binds or `window` elapses.
pub async fn wait_for_port_bound(
    probe: &dyn PortProbe,
    port: u16,
    window: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if probe.is_bound(port).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports bound for the first `bound_for` probes.
    struct CountdownProbe {
        bound_for: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PortProbe for CountdownProbe {
        async fn is_bound(&self, _port: u16) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) < self.bound_for
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_close_observes_release() {
        let probe = CountdownProbe {
            bound_for: 3,
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();

        let closed = wait_for_port_close(
            &probe,
            4100,
            Duration::from_secs(2),
            Duration::from_millis(200),
        )
        .await;

        assert!(closed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_close_gives_up_at_deadline() {
        let probe = CountdownProbe {
            bound_for: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();

        let closed = wait_for_port_close(
            &probe,
            4100,
            Duration::from_secs(2),
            Duration::from_millis(200),
        )
        .await;

        assert!(!closed);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2400));
    }

    /// Reports bound from the `closed_for`-th probe on.
    struct WarmupProbe {
        closed_for: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PortProbe for WarmupProbe {
        async fn is_bound(&self, _port: u16) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.closed_for
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bound_observes_bind() {
        let probe = WarmupProbe {
            closed_for: 2,
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();

        let bound = wait_for_port_bound(
            &probe,
            4100,
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .await;

        assert!(bound);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bound_gives_up_at_deadline() {
        let probe = WarmupProbe {
            closed_for: u32::MAX,
            calls: AtomicU32::new(0),
        };

        let bound = wait_for_port_bound(
            &probe,
            4100,
            Duration::from_millis(500),
            Duration::from_millis(100),
        )
        .await;

        assert!(!bound);
    }

    #[tokio::test]
    async fn test_http_probe_reports_closed_port() {
        let port = sidecar_core::process::allocate_ephemeral_port().unwrap();
        let probe = HttpPortProbe::new(Duration::from_millis(500)).unwrap();

        assert!(!probe.is_bound(port).await);
    }
}
