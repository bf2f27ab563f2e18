//! Periodic maintenance services: retention sweeps and claim reapers.
//!
//! Both run on a fixed interval per store. A sweep against a table that does
//! not exist yet (fresh database, schema deployment disabled) is logged at
//! `warn` and the loop keeps running; every other storage error is logged
//! and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::inbox::InboxStore;
use crate::lease::LeaseStore;
use crate::outbox::OutboxStore;
use crate::scheduler::SchedulerStore;
use crate::service::Service;

/// A maintenance action returning how many rows it touched.
pub type SweepFn = Arc<dyn Fn() -> BoxFuture<'static, Result<u64>> + Send + Sync>;

async fn sweep_once(label: &str, what: &str, sweep: &SweepFn) {
    match sweep().await {
        Ok(0) => {}
        Ok(count) => debug!(store = label, count, "{what} swept rows"),
        Err(err) if err.is_missing_relation() => {
            warn!(store = label, error = %err, "{what} target missing, skipping");
        }
        Err(err) => {
            error!(store = label, error = %err, "{what} sweep failed");
        }
    }
}

async fn run_interval_loop(
    name: &str,
    label: String,
    interval: Duration,
    sweep: SweepFn,
    shutdown: CancellationToken,
) {
    info!(store = %label, interval_secs = interval.as_secs(), "{name} starting");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        sweep_once(&label, name, &sweep).await;
    }
    info!(store = %label, "{name} stopped");
}

// ============================================================================
// CleanupService
// ============================================================================

/// Deletes terminal rows older than the retention window, forever.
pub struct CleanupService {
    label: String,
    interval: Duration,
    sweep: SweepFn,
}

impl CleanupService {
    pub fn new(
        label: impl Into<String>,
        interval: Duration,
        sweep: SweepFn,
    ) -> Self {
        Self {
            label: label.into(),
            interval,
            sweep,
        }
    }

    pub fn for_outbox(
        label: impl Into<String>,
        store: Arc<OutboxStore>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.cleanup(retention).await }.boxed()
            }),
        )
    }

    pub fn for_inbox(
        label: impl Into<String>,
        store: Arc<InboxStore>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.cleanup(retention).await }.boxed()
            }),
        )
    }

    pub fn for_scheduler(
        label: impl Into<String>,
        store: Arc<SchedulerStore>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.cleanup(retention).await }.boxed()
            }),
        )
    }

    /// Clears expired lease rows (the lock table keeps no terminal history,
    /// so its sweep is expiry-based).
    pub fn for_leases(
        label: impl Into<String>,
        store: Arc<LeaseStore>,
        interval: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.cleanup_expired().await }.boxed()
            }),
        )
    }
}

#[async_trait]
impl Service for CleanupService {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        run_interval_loop("cleanup", self.label, self.interval, self.sweep, shutdown).await;
        Ok(())
    }
}

// ============================================================================
// ReaperService
// ============================================================================

/// Returns expired claims to the ready state, forever.
pub struct ReaperService {
    label: String,
    interval: Duration,
    sweep: SweepFn,
}

impl ReaperService {
    pub fn new(label: impl Into<String>, interval: Duration, sweep: SweepFn) -> Self {
        Self {
            label: label.into(),
            interval,
            sweep,
        }
    }

    pub fn for_outbox(
        label: impl Into<String>,
        store: Arc<OutboxStore>,
        interval: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.reap_expired().await }.boxed()
            }),
        )
    }

    pub fn for_inbox(
        label: impl Into<String>,
        store: Arc<InboxStore>,
        interval: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.reap_expired().await }.boxed()
            }),
        )
    }

    pub fn for_scheduler(
        label: impl Into<String>,
        store: Arc<SchedulerStore>,
        interval: Duration,
    ) -> Self {
        Self::new(
            label,
            interval,
            Arc::new(move || {
                let store = store.clone();
                async move { store.reap_expired().await }.boxed()
            }),
        )
    }
}

#[async_trait]
impl Service for ReaperService {
    fn name(&self) -> &'static str {
        "reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        run_interval_loop("reaper", self.label, self.interval, self.sweep, shutdown).await;
        Ok(())
    }
}
