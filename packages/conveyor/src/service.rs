//! Long-running background services.
//!
//! A [`Service`] is a named run loop driven by a shared `CancellationToken`;
//! the [`ServiceHost`] spawns a set of them, propagates shutdown, and joins
//! them on stop. Dispatcher loops, scheduler workers, reapers, and cleanup
//! sweeps all hang off this trait.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A background worker with start/stop semantics.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Runs until the shutdown token fires. Implementations check the token
    /// between iterations and between items.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Collects services and runs them together.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn with_boxed_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Spawns every service. Returns a handle that stops them.
    pub fn start(self) -> RunningServices {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "starting service");
            handles.push(tokio::spawn(async move {
                if let Err(err) = service.run(token).await {
                    error!(service = name, error = %err, "service exited with error");
                }
            }));
        }
        RunningServices { shutdown, handles }
    }

    /// Runs every service until `shutdown` fires, then joins them.
    pub async fn run_until_shutdown(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let running = self.start();
        shutdown.cancelled().await;
        running.stop().await;
        Ok(())
    }
}

/// Handle over a started set of services.
pub struct RunningServices {
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningServices {
    /// Token shared by every running service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals shutdown and waits for every service to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("all services stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TickUntilShutdown {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for TickUntilShutdown {
        fn name(&self) -> &'static str {
            "tick"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn host_stops_services_on_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let running = ServiceHost::new()
            .with_service(TickUntilShutdown {
                stopped: stopped.clone(),
            })
            .start();
        running.stop().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn empty_host_is_fine() {
        let running = ServiceHost::new().start();
        running.stop().await;
    }
}
