//! Wiring: builds providers, routers, dispatcher, and maintenance services
//! from tenant configs.
//!
//! The builder replaces a dependency-injection registration surface: hand it
//! the tenant list (or a discovery), register handlers by topic, and it
//! produces a [`Conveyor`]: routers for application code plus a service set
//! (dispatch loop, scheduler worker, reapers, cleanup sweeps) ready to start.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::warn;

use crate::clock::{system_clock, SharedClock};
use crate::config::{DispatcherOptions, TenantConfig};
use crate::dispatch::{
    DispatchService, Dispatcher, HandlerResolver, OutboxHandler,
};
use crate::error::Result;
use crate::inbox::InboxStore;
use crate::join::{JoinStore, JoinWaitHandler, JOIN_WAIT_TOPIC};
use crate::lease::LeaseStore;
use crate::outbox::OutboxStore;
use crate::provider::{
    ConfiguredProvider, Discovery, DynamicProvider, PoolCache, StoreFactory, StoreProvider,
};
use crate::router::{
    InboxRouter, JoinRouter, LeaseRouter, OutboxRouter, Router, SchedulerRouter,
};
use crate::scheduler::{SchedulerService, SchedulerStore};
use crate::schema;
use crate::service::{RunningServices, Service, ServiceHost};
use crate::cleanup::{CleanupService, ReaperService};

const DEFAULT_BATCH_SIZE: i64 = 25;
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CLEANUP_TICK: Duration = Duration::from_secs(60);

/// Builder for a fully wired engine.
pub struct ConveyorBuilder {
    tenants: Vec<TenantConfig>,
    discovery: Option<(Arc<dyn Discovery>, Duration)>,
    handlers: Vec<(String, Arc<dyn OutboxHandler>)>,
    dispatcher_options: DispatcherOptions,
    lease_gated_dispatch: bool,
    register_join_wait: bool,
    dispatch_batch_size: i64,
    reap_interval: Duration,
    cleanup_tick: Duration,
    clock: SharedClock,
}

impl Default for ConveyorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConveyorBuilder {
    pub fn new() -> Self {
        Self {
            tenants: Vec::new(),
            discovery: None,
            handlers: Vec::new(),
            dispatcher_options: DispatcherOptions::default(),
            lease_gated_dispatch: true,
            register_join_wait: true,
            dispatch_batch_size: DEFAULT_BATCH_SIZE,
            reap_interval: DEFAULT_REAP_INTERVAL,
            cleanup_tick: DEFAULT_CLEANUP_TICK,
            clock: system_clock(),
        }
    }

    /// Adds a statically configured tenant.
    pub fn tenant(mut self, config: TenantConfig) -> Self {
        self.tenants.push(config);
        self
    }

    /// Uses dynamic discovery instead of (or in addition to an initial) static
    /// list; the snapshot refreshes at most once per `refresh_interval`.
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>, refresh_interval: Duration) -> Self {
        self.discovery = Some((discovery, refresh_interval));
        self
    }

    /// Registers an outbox handler for `topic` (case-insensitive).
    pub fn handler(mut self, topic: impl Into<String>, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.push((topic.into(), handler));
        self
    }

    pub fn dispatcher_options(mut self, options: DispatcherOptions) -> Self {
        self.dispatcher_options = options;
        self
    }

    /// Disables the per-outbox lease gate (multiple dispatchers may then
    /// drain the same outbox; claims stay exclusive either way).
    pub fn without_lease_gating(mut self) -> Self {
        self.lease_gated_dispatch = false;
        self
    }

    /// Skips the built-in `join.wait` handler registration.
    pub fn without_join_handler(mut self) -> Self {
        self.register_join_wait = false;
        self
    }

    pub fn dispatch_batch_size(mut self, batch_size: i64) -> Self {
        self.dispatch_batch_size = batch_size;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn cleanup_tick(mut self, interval: Duration) -> Self {
        self.cleanup_tick = interval;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn provider<S: Send + Sync + 'static>(
        &self,
        factory: StoreFactory<S>,
    ) -> Result<Arc<dyn StoreProvider<S>>> {
        match &self.discovery {
            Some((discovery, refresh_interval)) => Ok(Arc::new(DynamicProvider::with_clock(
                discovery.clone(),
                factory,
                *refresh_interval,
                self.clock.clone(),
            ))),
            None => Ok(Arc::new(ConfiguredProvider::new(&self.tenants, factory)?)),
        }
    }

    /// Wires everything. Stores share one pool per connection string.
    pub fn build(self) -> Result<Conveyor> {
        self.dispatcher_options.validate()?;
        for tenant in &self.tenants {
            tenant.validate()?;
        }

        let pools = PoolCache::new();
        let clock = self.clock.clone();

        let outbox_factory: StoreFactory<OutboxStore> = {
            let pools = pools.clone();
            let clock = clock.clone();
            Arc::new(move |config: &TenantConfig| {
                let pool = pools.get(&config.connection_string)?;
                let joins =
                    JoinStore::with_clock(pool.clone(), config.join.clone(), clock.clone())?;
                Ok(
                    OutboxStore::with_clock(pool, config.outbox.clone(), clock.clone())?
                        .with_joins(Arc::new(joins)),
                )
            })
        };
        let inbox_factory: StoreFactory<InboxStore> = {
            let pools = pools.clone();
            let clock = clock.clone();
            Arc::new(move |config: &TenantConfig| {
                let pool = pools.get(&config.connection_string)?;
                InboxStore::with_clock(pool, config.inbox.clone(), clock.clone())
            })
        };
        let scheduler_factory: StoreFactory<SchedulerStore> = {
            let pools = pools.clone();
            let clock = clock.clone();
            Arc::new(move |config: &TenantConfig| {
                let pool = pools.get(&config.connection_string)?;
                SchedulerStore::with_clock(pool, config.scheduler.clone(), clock.clone())
            })
        };
        let lease_factory: StoreFactory<LeaseStore> = {
            let pools = pools.clone();
            let clock = clock.clone();
            Arc::new(move |config: &TenantConfig| {
                let pool = pools.get(&config.connection_string)?;
                LeaseStore::with_clock(pool, config.lease.clone(), clock.clone())
            })
        };
        let join_factory: StoreFactory<JoinStore> = {
            let pools = pools.clone();
            let clock = clock.clone();
            Arc::new(move |config: &TenantConfig| {
                let pool = pools.get(&config.connection_string)?;
                JoinStore::with_clock(pool, config.join.clone(), clock.clone())
            })
        };

        let outbox_provider = self.provider(outbox_factory)?;
        let inbox_provider = self.provider(inbox_factory)?;
        let scheduler_provider = self.provider(scheduler_factory)?;
        let lease_provider = self.provider(lease_factory)?;
        let join_provider = self.provider(join_factory)?;

        let outboxes = Router::new(outbox_provider.clone());
        let inboxes = Router::new(inbox_provider.clone());
        let schedulers = Router::new(scheduler_provider.clone());
        let leases = Router::new(lease_provider);
        let joins = Router::new(join_provider);

        let mut resolver = HandlerResolver::builder();
        if self.register_join_wait {
            resolver = resolver.register(
                JOIN_WAIT_TOPIC,
                Arc::new(JoinWaitHandler::routed(joins.clone(), outboxes.clone())),
            );
        }
        for (topic, handler) in self.handlers {
            resolver = resolver.register(topic, handler);
        }

        let mut dispatcher = Dispatcher::new(outbox_provider.clone(), Arc::new(resolver.build()))
            .with_options(self.dispatcher_options)
            .with_clock(clock.clone());
        if self.lease_gated_dispatch {
            dispatcher = dispatcher.with_lease_router(leases.clone());
        }
        let dispatcher = Arc::new(dispatcher);

        let mut host = ServiceHost::new()
            .with_service(DispatchService::new(
                dispatcher.clone(),
                self.dispatch_batch_size,
            ))
            .with_service(SchedulerService::new(
                scheduler_provider.clone(),
                outboxes.clone(),
            ));
        host = host.with_service(reaper_for(
            outbox_provider.clone(),
            inbox_provider.clone(),
            scheduler_provider.clone(),
            self.reap_interval,
        ));
        host = host.with_service(cleanup_for(
            outbox_provider,
            inbox_provider,
            scheduler_provider,
            self.cleanup_tick,
        ));

        Ok(Conveyor {
            outboxes,
            inboxes,
            schedulers,
            leases,
            joins,
            dispatcher,
            tenants: self.tenants,
            discovery: self.discovery.map(|(discovery, _)| discovery),
            pools,
            host,
        })
    }
}

/// One reaper sweeping every store behind the providers.
fn reaper_for(
    outboxes: Arc<dyn StoreProvider<OutboxStore>>,
    inboxes: Arc<dyn StoreProvider<InboxStore>>,
    schedulers: Arc<dyn StoreProvider<SchedulerStore>>,
    interval: Duration,
) -> ReaperService {
    ReaperService::new(
        "all-stores",
        interval,
        Arc::new(move || {
            let outboxes = outboxes.clone();
            let inboxes = inboxes.clone();
            let schedulers = schedulers.clone();
            async move {
                let mut total = 0u64;
                for store in outboxes.get_all_stores().await? {
                    total += tolerate_missing(store.reap_expired().await)?;
                }
                for store in inboxes.get_all_stores().await? {
                    total += tolerate_missing(store.reap_expired().await)?;
                }
                for store in schedulers.get_all_stores().await? {
                    total += tolerate_missing(store.reap_expired().await)?;
                }
                Ok(total)
            }
            .boxed()
        }),
    )
}

/// One retention sweep honoring each store's own cleanup options.
fn cleanup_for(
    outboxes: Arc<dyn StoreProvider<OutboxStore>>,
    inboxes: Arc<dyn StoreProvider<InboxStore>>,
    schedulers: Arc<dyn StoreProvider<SchedulerStore>>,
    interval: Duration,
) -> CleanupService {
    CleanupService::new(
        "all-stores",
        interval,
        Arc::new(move || {
            let outboxes = outboxes.clone();
            let inboxes = inboxes.clone();
            let schedulers = schedulers.clone();
            async move {
                let mut total = 0u64;
                for store in outboxes.get_all_stores().await? {
                    let options = store.options();
                    if options.enable_automatic_cleanup {
                        total +=
                            tolerate_missing(store.cleanup(options.retention_period).await)?;
                    }
                }
                for store in inboxes.get_all_stores().await? {
                    let options = store.options();
                    if options.enable_automatic_cleanup {
                        total +=
                            tolerate_missing(store.cleanup(options.retention_period).await)?;
                    }
                }
                for store in schedulers.get_all_stores().await? {
                    let options = store.options();
                    if options.enable_automatic_cleanup {
                        total +=
                            tolerate_missing(store.cleanup(options.retention_period).await)?;
                    }
                }
                Ok(total)
            }
            .boxed()
        }),
    )
}

/// A missing table on one tenant must not starve the other tenants' sweeps.
fn tolerate_missing(result: Result<u64>) -> Result<u64> {
    match result {
        Ok(count) => Ok(count),
        Err(err) if err.is_missing_relation() => {
            warn!(error = %err, "sweep target missing, skipping");
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

/// A wired engine: routers for application code plus the background services.
pub struct Conveyor {
    pub outboxes: OutboxRouter,
    pub inboxes: InboxRouter,
    pub schedulers: SchedulerRouter,
    pub leases: LeaseRouter,
    pub joins: JoinRouter,
    pub dispatcher: Arc<Dispatcher>,
    tenants: Vec<TenantConfig>,
    discovery: Option<Arc<dyn Discovery>>,
    pools: PoolCache,
    host: ServiceHost,
}

impl Conveyor {
    /// Deploys schemas for every tenant that enables deployment. With
    /// discovery configured, deploys for the currently discovered set.
    pub async fn deploy_schemas(&self) -> Result<()> {
        for tenant in &self.tenants {
            let pool = self.pools.get(&tenant.connection_string)?;
            schema::deploy_tenant(&pool, tenant).await?;
        }
        if let Some(discovery) = &self.discovery {
            for tenant in discovery.discover().await? {
                let pool = self.pools.get(&tenant.connection_string)?;
                schema::deploy_tenant(&pool, &tenant).await?;
            }
        }
        Ok(())
    }

    /// Forces every family's provider to refresh its tenant snapshot now,
    /// rather than waiting out the discovery interval.
    pub async fn refresh_providers(&self) -> Result<()> {
        self.outboxes.refresh().await?;
        self.inboxes.refresh().await?;
        self.schedulers.refresh().await?;
        self.leases.refresh().await?;
        self.joins.refresh().await
    }

    /// Adds an extra service to run alongside the built-in set.
    pub fn with_service(mut self, service: impl Service) -> Self {
        self.host = self.host.with_service(service);
        self
    }

    /// Starts the background services. Routers and dispatcher stay usable
    /// through the returned handle.
    pub fn start(self) -> RunningConveyor {
        RunningConveyor {
            outboxes: self.outboxes,
            inboxes: self.inboxes,
            schedulers: self.schedulers,
            leases: self.leases,
            joins: self.joins,
            dispatcher: self.dispatcher,
            running: self.host.start(),
        }
    }
}

/// A running engine; drop through [`stop`](RunningConveyor::stop) for a
/// graceful shutdown.
pub struct RunningConveyor {
    pub outboxes: OutboxRouter,
    pub inboxes: InboxRouter,
    pub schedulers: SchedulerRouter,
    pub leases: LeaseRouter,
    pub joins: JoinRouter,
    pub dispatcher: Arc<Dispatcher>,
    running: RunningServices,
}

impl RunningConveyor {
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.running.shutdown_token()
    }

    /// Signals shutdown and joins every service.
    pub async fn stop(self) {
        self.running.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxOptions;

    #[tokio::test]
    async fn build_wires_routers_and_dispatcher() {
        let conveyor = ConveyorBuilder::new()
            .tenant(TenantConfig::new("t1", "postgres://localhost/app"))
            .build()
            .unwrap();
        assert!(conveyor.outboxes.get("t1").await.is_ok());
        assert!(conveyor.leases.get("t1").await.is_ok());
        assert!(conveyor.joins.get("t1").await.is_ok());
        assert!(matches!(
            conveyor.inboxes.get("t2").await,
            Err(crate::error::Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn build_rejects_invalid_tenant() {
        let bad = TenantConfig {
            outbox: OutboxOptions {
                schema_name: "bad schema".into(),
                ..Default::default()
            },
            ..TenantConfig::new("t1", "postgres://localhost/app")
        };
        assert!(ConveyorBuilder::new().tenant(bad).build().is_err());
    }

    #[tokio::test]
    async fn join_wait_handler_is_registered_by_default() {
        let conveyor = ConveyorBuilder::new()
            .tenant(TenantConfig::new("t1", "postgres://localhost/app"))
            .build()
            .unwrap();
        // The dispatcher owns the resolver; reaching through it is enough to
        // know the topic routes somewhere.
        assert!(conveyor.dispatcher.resolves(crate::join::JOIN_WAIT_TOPIC));

        let bare = ConveyorBuilder::new()
            .tenant(TenantConfig::new("t1", "postgres://localhost/app"))
            .without_join_handler()
            .build()
            .unwrap();
        assert!(!bare.dispatcher.resolves(crate::join::JOIN_WAIT_TOPIC));
    }
}
