use async_trait::async_trait;
use std::sync::Arc;

use crate::{ServiceHandle, StatusSnapshot};

/// Starts one instance of a managed service.
///
/// A launch succeeds only once the service is reachable on the returned handle's port;
/// any error counts as a spawn failure against the crash counter.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> crate::Result<ServiceHandle>;
}

#[async_trait]
impl<L: Launcher + ?Sized> Launcher for Arc<L> {
    async fn launch(&self) -> crate::Result<ServiceHandle> {
        (**self).launch().await
    }
}

/// Receives every status transition of a supervisor, in order.
///
/// Called from the task that caused the transition, after the supervisor has released
/// its state lock. Keep it quick; it must not block on the supervisor's async operations.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, service: &str, snapshot: &StatusSnapshot);
}

impl<F> StatusListener for F
where
    F: Fn(&str, &StatusSnapshot) + Send + Sync,
{
    fn on_status(&self, service: &str, snapshot: &StatusSnapshot) {
        self(service, snapshot)
    }
}
