//! Multi-outbox dispatcher.
//!
//! One pass ([`Dispatcher::run_once`]) selects an outbox via the configured
//! strategy, optionally takes a fencing lease named after the store's
//! identifier, claims a batch, and walks it: resolve the handler by topic
//! (case-insensitive), ack on success, abandon with backoff on failure, fail
//! terminally when attempts run out or no handler exists. The long-running
//! [`DispatchService`] repeats passes until shutdown.
//!
//! # Attempt accounting
//!
//! A row's `retry_count` is the number of *previous* attempts; the execution
//! in flight is attempt `retry_count + 1`. With `max_attempts = 3`, a message
//! runs at most three times before it is failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::DispatcherOptions;
use crate::error::Result;
use crate::id::{InstanceId, OwnerToken};
use crate::lease::AcquireOutcome;
use crate::outbox::{OutboxMessage, OutboxStore};
use crate::provider::StoreProvider;
use crate::router::LeaseRouter;
use crate::service::Service;

// ============================================================================
// Handlers
// ============================================================================

/// Where a message came from, handed to handlers that need per-tenant
/// collaborators (e.g. the `join.wait` handler resolving the right stores).
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Identifier of the outbox store the message was claimed from.
    pub store_identifier: String,
}

/// Processes one outbox message. Returning an error triggers the dispatcher's
/// abandon-or-fail decision.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(
        &self,
        message: &OutboxMessage,
        ctx: &DispatchContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Case-insensitive topic → handler map, built once at wiring time.
pub struct HandlerResolver {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl HandlerResolver {
    pub fn builder() -> HandlerResolverBuilder {
        HandlerResolverBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Resolves a handler; `Topic`, `topic`, and `TOPIC` are the same key.
    pub fn get(&self, topic: &str) -> Option<&Arc<dyn OutboxHandler>> {
        self.handlers.get(&topic.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct HandlerResolverBuilder {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl HandlerResolverBuilder {
    /// Registers a handler; a later registration for the same topic wins.
    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.insert(topic.into().to_lowercase(), handler);
        self
    }

    pub fn build(self) -> HandlerResolver {
        HandlerResolver {
            handlers: self.handlers,
        }
    }
}

// ============================================================================
// Store selection
// ============================================================================

/// Picks which outbox a pass drains.
pub trait SelectionStrategy: Send + Sync {
    /// Index into the current store snapshot, or `None` when it is empty.
    fn next(&self, store_count: usize) -> Option<usize>;
}

/// Default strategy: one store per pass, rotating across passes.
#[derive(Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn next(&self, store_count: usize) -> Option<usize> {
        if store_count == 0 {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % store_count)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Maps the attempt number (1-based) to a retry delay.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;
const BACKOFF_CAP: Duration = Duration::from_secs(120);

/// Default backoff: `500ms × 2^(attempt-1)` plus uniform jitter in
/// `[0, 250ms)`, capped at two minutes.
pub fn default_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
    let jitter = fastrand::u64(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base.saturating_add(jitter)).min(BACKOFF_CAP)
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Drains per-tenant outboxes through registered handlers.
pub struct Dispatcher {
    provider: Arc<dyn StoreProvider<OutboxStore>>,
    resolver: Arc<HandlerResolver>,
    strategy: Arc<dyn SelectionStrategy>,
    lease_router: Option<LeaseRouter>,
    options: DispatcherOptions,
    backoff: BackoffFn,
    clock: SharedClock,
    instance: String,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn StoreProvider<OutboxStore>>,
        resolver: Arc<HandlerResolver>,
    ) -> Self {
        Self {
            provider,
            resolver,
            strategy: Arc::new(RoundRobin::new()),
            lease_router: None,
            options: DispatcherOptions::default(),
            backoff: Arc::new(default_backoff),
            clock: system_clock(),
            instance: format!("dispatcher-{}", InstanceId::random()),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Gate each outbox behind a fencing lease named by its identifier, so
    /// at most one dispatcher drains a given outbox at a time.
    pub fn with_lease_router(mut self, lease_router: LeaseRouter) -> Self {
        self.lease_router = Some(lease_router);
        self
    }

    pub fn with_options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    /// True when a handler is registered for `topic`.
    pub fn resolves(&self, topic: &str) -> bool {
        self.resolver.get(topic).is_some()
    }

    /// Runs one dispatch pass over one selected outbox.
    ///
    /// Returns the number of messages inspected (acked, abandoned, or
    /// failed). A pass that finds no store, no eligible messages, or no
    /// lease returns zero.
    pub async fn run_once(&self, limit: i64, cancel: &CancellationToken) -> Result<usize> {
        let stores = self.provider.get_all_stores().await?;
        let Some(index) = self.strategy.next(stores.len()) else {
            return Ok(0);
        };
        let store = &stores[index];
        let identifier = self.provider.get_store_identifier(store).await;

        let lease = match &self.lease_router {
            None => None,
            Some(router) => {
                let lease_store = router.get(&identifier).await?;
                match lease_store
                    .acquire(&identifier, self.options.store_lease_duration, None)
                    .await?
                {
                    AcquireOutcome::Acquired(lease) => Some(lease),
                    AcquireOutcome::NotAcquired { .. } => {
                        debug!(outbox = %identifier, "outbox lease held elsewhere, skipping");
                        return Ok(0);
                    }
                }
            }
        };

        let processed = self
            .drain(store, &identifier, lease.as_ref().map(|l| l.loss_signal()), limit, cancel)
            .await;

        if let Some(lease) = lease {
            if let Err(err) = lease.release().await {
                warn!(outbox = %identifier, error = %err, "failed to release outbox lease");
            }
        }
        processed
    }

    async fn drain(
        &self,
        store: &OutboxStore,
        identifier: &str,
        lease_lost: Option<CancellationToken>,
        limit: i64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let owner = OwnerToken::random();
        let ids = store.claim(owner, self.options.claim_lease, limit).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let messages = store.fetch(&ids).await?;
        debug!(outbox = %identifier, count = messages.len(), "claimed outbox batch");

        let ctx = DispatchContext {
            store_identifier: identifier.to_string(),
        };
        let mut processed = 0usize;
        for message in &messages {
            // Unprocessed leftovers keep their claim until the reaper
            // returns them.
            if cancel.is_cancelled() {
                break;
            }
            if let Some(lost) = &lease_lost {
                if lost.is_cancelled() {
                    warn!(outbox = %identifier, "outbox lease lost mid-batch, stopping");
                    break;
                }
            }
            self.process_one(store, owner, message, &ctx, cancel).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_one(
        &self,
        store: &OutboxStore,
        owner: OwnerToken,
        message: &OutboxMessage,
        ctx: &DispatchContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(handler) = self.resolver.get(&message.topic) else {
            let reason = format!("No handler registered for topic '{}'", message.topic);
            warn!(id = %message.id, topic = %message.topic, "{reason}");
            store
                .fail(owner, &[message.id], Some(reason.as_str()), Some(self.instance.as_str()))
                .await?;
            return Ok(());
        };

        match handler.handle(message, ctx, cancel).await {
            Ok(()) => {
                debug!(id = %message.id, topic = %message.topic, "message handled");
                store.ack(owner, &[message.id]).await?;
            }
            Err(err) => {
                let attempt = message.retry_count.saturating_add(1) as u32;
                let reason = format!("{err:#}");
                if attempt >= self.options.max_attempts {
                    error!(
                        id = %message.id,
                        topic = %message.topic,
                        attempt,
                        error = %reason,
                        "message failed terminally"
                    );
                    store
                        .fail(owner, &[message.id], Some(reason.as_str()), Some(self.instance.as_str()))
                        .await?;
                } else {
                    let delay = (self.backoff)(attempt);
                    let due = self.clock.now_utc()
                        + chrono::Duration::from_std(delay).unwrap_or_default();
                    debug!(
                        id = %message.id,
                        topic = %message.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "message abandoned for retry"
                    );
                    store
                        .abandon(owner, &[message.id], Some(reason.as_str()), Some(due))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Long-running service
// ============================================================================

/// Dispatch loop: repeats [`Dispatcher::run_once`] until shutdown, sleeping
/// `poll_interval` after an empty pass.
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
    batch_size: i64,
}

impl DispatchService {
    pub fn new(dispatcher: Arc<Dispatcher>, batch_size: i64) -> Self {
        Self {
            dispatcher,
            batch_size,
        }
    }
}

#[async_trait]
impl Service for DispatchService {
    fn name(&self) -> &'static str {
        "outbox-dispatcher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(batch_size = self.batch_size, "outbox dispatcher starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.dispatcher.run_once(self.batch_size, &shutdown).await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.dispatcher.options.poll_interval) => {}
                    }
                }
                Ok(count) => {
                    debug!(count, "dispatch pass processed messages");
                }
                Err(err) => {
                    error!(error = %err, "dispatch pass failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.dispatcher.options.poll_interval) => {}
                    }
                }
            }
        }
        info!("outbox dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl OutboxHandler for NoopHandler {
        async fn handle(
            &self,
            _message: &OutboxMessage,
            _ctx: &DispatchContext,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolver_is_case_insensitive() {
        let resolver = HandlerResolver::builder()
            .register("Orders.Sync", Arc::new(NoopHandler))
            .build();
        assert!(resolver.get("orders.sync").is_some());
        assert!(resolver.get("ORDERS.SYNC").is_some());
        assert!(resolver.get("orders.other").is_none());
    }

    #[test]
    fn later_registration_wins_the_topic() {
        struct Refusing;

        #[async_trait]
        impl OutboxHandler for Refusing {
            async fn handle(
                &self,
                _message: &OutboxMessage,
                _ctx: &DispatchContext,
                _cancel: &CancellationToken,
            ) -> anyhow::Result<()> {
                anyhow::bail!("should have been replaced")
            }
        }

        let resolver = HandlerResolver::builder()
            .register("orders.sync", Arc::new(Refusing))
            .register("ORDERS.SYNC", Arc::new(NoopHandler))
            .build();
        // One case-folded entry survives, and it is the later one.
        assert!(!resolver.is_empty());
        assert!(resolver.get("Orders.Sync").is_some());
    }

    #[test]
    fn round_robin_rotates_and_wraps() {
        let strategy = RoundRobin::new();
        assert_eq!(strategy.next(3), Some(0));
        assert_eq!(strategy.next(3), Some(1));
        assert_eq!(strategy.next(3), Some(2));
        assert_eq!(strategy.next(3), Some(0));
        assert_eq!(strategy.next(0), None);
    }

    #[test]
    fn backoff_bounds_are_deterministic() {
        for _ in 0..50 {
            let first = default_backoff(1);
            assert!(first >= Duration::from_millis(500), "{first:?}");
            assert!(first < Duration::from_millis(750), "{first:?}");

            let second = default_backoff(2);
            assert!(second >= Duration::from_millis(1000), "{second:?}");
            assert!(second < Duration::from_millis(1250), "{second:?}");
        }
    }

    #[test]
    fn backoff_is_capped_at_two_minutes() {
        assert_eq!(default_backoff(60), Duration::from_secs(120));
        assert_eq!(default_backoff(u32::MAX), Duration::from_secs(120));
    }
}
