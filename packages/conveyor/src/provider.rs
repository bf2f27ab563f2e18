//! Multi-tenant store providers.
//!
//! A provider owns the lifecycle of one store family (outbox, inbox,
//! scheduler, lease, join) across tenants. [`ConfiguredProvider`] is built
//! once from a static tenant list; [`DynamicProvider`] polls a [`Discovery`]
//! and reconciles its snapshot when the refresh interval lapses. Snapshots
//! are immutable once published: readers that arrive during a refresh keep
//! seeing the previous snapshot until the swap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::clock::{system_clock, SharedClock};
use crate::config::TenantConfig;
use crate::error::Result;

/// Identifier reported for stores a provider did not create.
pub const UNKNOWN_STORE: &str = "Unknown";

/// Builds one store from a tenant config.
pub type StoreFactory<S> = Arc<dyn Fn(&TenantConfig) -> Result<S> + Send + Sync>;

/// Keyed access to per-tenant stores.
#[async_trait]
pub trait StoreProvider<S: Send + Sync>: Send + Sync {
    /// Current snapshot of all stores.
    async fn get_all_stores(&self) -> Result<Vec<Arc<S>>>;

    /// The store registered under `key`, if any.
    async fn get_store_by_key(&self, key: &str) -> Result<Option<Arc<S>>>;

    /// The identifier a store was registered under, or [`UNKNOWN_STORE`]
    /// for stores this provider did not create.
    async fn get_store_identifier(&self, store: &Arc<S>) -> String;

    /// Forces a discovery cycle now, regardless of the refresh interval.
    /// Providers over a fixed tenant list have nothing to refresh.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Source of truth for the current tenant list, polled by
/// [`DynamicProvider`].
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<TenantConfig>>;
}

/// A [`Discovery`] over a swappable in-memory list. Useful as a stand-in
/// while a real discovery endpoint does not exist yet, and in tests.
#[derive(Default)]
pub struct StaticDiscovery {
    configs: std::sync::Mutex<Vec<TenantConfig>>,
}

impl StaticDiscovery {
    pub fn new(configs: Vec<TenantConfig>) -> Self {
        Self {
            configs: std::sync::Mutex::new(configs),
        }
    }

    /// Replaces the advertised tenant list; visible on the next refresh.
    pub fn set(&self, configs: Vec<TenantConfig>) {
        *self.configs.lock().expect("discovery mutex poisoned") = configs;
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<TenantConfig>> {
        Ok(self.configs.lock().expect("discovery mutex poisoned").clone())
    }
}

/// Process-wide pool registry: one `PgPool` per connection string, so every
/// store family for a tenant shares its pool.
#[derive(Clone, Default)]
pub struct PoolCache {
    pools: Arc<std::sync::Mutex<HashMap<String, PgPool>>>,
}

impl PoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pool for `connection_string`, creating it lazily
    /// (no connection is opened until first use).
    pub fn get(&self, connection_string: &str) -> Result<PgPool> {
        let mut pools = self.pools.lock().expect("pool cache mutex poisoned");
        if let Some(pool) = pools.get(connection_string) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new().connect_lazy(connection_string)?;
        pools.insert(connection_string.to_string(), pool.clone());
        Ok(pool)
    }
}

struct ProviderEntry<S> {
    identifier: String,
    store: Arc<S>,
}

fn find_identifier<S>(entries: &[ProviderEntry<S>], store: &Arc<S>) -> String {
    entries
        .iter()
        .find(|entry| Arc::ptr_eq(&entry.store, store))
        .map(|entry| entry.identifier.clone())
        .unwrap_or_else(|| UNKNOWN_STORE.to_string())
}

// ============================================================================
// ConfiguredProvider
// ============================================================================

/// Provider over a fixed tenant list; stores are instantiated eagerly at
/// construction and never change.
pub struct ConfiguredProvider<S> {
    entries: Vec<ProviderEntry<S>>,
}

impl<S: Send + Sync> ConfiguredProvider<S> {
    pub fn new(configs: &[TenantConfig], factory: StoreFactory<S>) -> Result<Self> {
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            entries.push(ProviderEntry {
                identifier: config.identifier.clone(),
                store: Arc::new(factory(config)?),
            });
        }
        Ok(Self { entries })
    }
}

#[async_trait]
impl<S: Send + Sync> StoreProvider<S> for ConfiguredProvider<S> {
    async fn get_all_stores(&self) -> Result<Vec<Arc<S>>> {
        Ok(self.entries.iter().map(|e| e.store.clone()).collect())
    }

    async fn get_store_by_key(&self, key: &str) -> Result<Option<Arc<S>>> {
        Ok(self
            .entries
            .iter()
            .find(|e| e.identifier == key)
            .map(|e| e.store.clone()))
    }

    async fn get_store_identifier(&self, store: &Arc<S>) -> String {
        find_identifier(&self.entries, store)
    }
}

// ============================================================================
// DynamicProvider
// ============================================================================

struct DynamicState<S> {
    entries: Vec<ProviderEntry<S>>,
    last_refresh: Option<DateTime<Utc>>,
}

/// Provider that tracks a [`Discovery`], refreshing its snapshot at most
/// once per `refresh_interval`.
///
/// Refreshes are single-flight: the caller that observes a due refresh runs
/// it, concurrent readers keep the previous snapshot. Stores for identifiers
/// that survive a refresh are reused, so pools and claims stay stable.
pub struct DynamicProvider<S> {
    discovery: Arc<dyn Discovery>,
    factory: StoreFactory<S>,
    refresh_interval: Duration,
    clock: SharedClock,
    state: tokio::sync::RwLock<DynamicState<S>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<S: Send + Sync> DynamicProvider<S> {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        factory: StoreFactory<S>,
        refresh_interval: Duration,
    ) -> Self {
        Self::with_clock(discovery, factory, refresh_interval, system_clock())
    }

    pub fn with_clock(
        discovery: Arc<dyn Discovery>,
        factory: StoreFactory<S>,
        refresh_interval: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            discovery,
            factory,
            refresh_interval,
            clock,
            state: tokio::sync::RwLock::new(DynamicState {
                entries: Vec::new(),
                last_refresh: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn refresh_due(&self, last_refresh: Option<DateTime<Utc>>) -> bool {
        let Ok(interval) = chrono::Duration::from_std(self.refresh_interval) else {
            return false;
        };
        match last_refresh {
            None => true,
            Some(last) => self.clock.now_utc() - last >= interval,
        }
    }

    async fn refresh_if_due(&self) -> Result<()> {
        let last = self.state.read().await.last_refresh;
        if !self.refresh_due(last) {
            return Ok(());
        }
        // Single flight: whoever gets the lock refreshes, everyone else
        // serves the previous snapshot.
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            return Ok(());
        };
        let last = self.state.read().await.last_refresh;
        if !self.refresh_due(last) {
            return Ok(());
        }
        self.reconcile().await
    }

    async fn reconcile(&self) -> Result<()> {
        let configs = self.discovery.discover().await?;
        let now = self.clock.now_utc();

        let mut next = Vec::with_capacity(configs.len());
        {
            let state = self.state.read().await;
            for config in &configs {
                config.validate()?;
                let existing = state
                    .entries
                    .iter()
                    .find(|e| e.identifier == config.identifier)
                    .map(|e| e.store.clone());
                let store = match existing {
                    Some(store) => store,
                    None => {
                        debug!(identifier = %config.identifier, "discovered new tenant store");
                        Arc::new((self.factory)(config)?)
                    }
                };
                next.push(ProviderEntry {
                    identifier: config.identifier.clone(),
                    store,
                });
            }
        }

        let mut state = self.state.write().await;
        let removed = state
            .entries
            .iter()
            .filter(|e| !next.iter().any(|n| n.identifier == e.identifier))
            .count();
        if removed > 0 || next.len() != state.entries.len() {
            info!(
                tenants = next.len(),
                removed, "reconciled tenant store snapshot"
            );
        }
        state.entries = next;
        state.last_refresh = Some(now);
        Ok(())
    }
}

#[async_trait]
impl<S: Send + Sync> StoreProvider<S> for DynamicProvider<S> {
    async fn get_all_stores(&self) -> Result<Vec<Arc<S>>> {
        self.refresh_if_due().await?;
        let state = self.state.read().await;
        Ok(state.entries.iter().map(|e| e.store.clone()).collect())
    }

    async fn get_store_by_key(&self, key: &str) -> Result<Option<Arc<S>>> {
        self.refresh_if_due().await?;
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .find(|e| e.identifier == key)
            .map(|e| e.store.clone()))
    }

    async fn get_store_identifier(&self, store: &Arc<S>) -> String {
        let state = self.state.read().await;
        find_identifier(&state.entries, store)
    }

    async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.reconcile().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(identifier: &str) -> TenantConfig {
        TenantConfig::new(identifier, "postgres://localhost/app")
    }

    fn identity_factory() -> StoreFactory<String> {
        Arc::new(|config: &TenantConfig| Ok(config.identifier.clone()))
    }

    #[tokio::test]
    async fn configured_provider_is_keyed() {
        let provider =
            ConfiguredProvider::new(&[config("t1"), config("t2")], identity_factory()).unwrap();
        assert_eq!(provider.get_all_stores().await.unwrap().len(), 2);

        let store = provider.get_store_by_key("t2").await.unwrap().unwrap();
        assert_eq!(provider.get_store_identifier(&store).await, "t2");
        assert!(provider.get_store_by_key("t3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_store_is_unknown() {
        let provider = ConfiguredProvider::new(&[config("t1")], identity_factory()).unwrap();
        let foreign = Arc::new("elsewhere".to_string());
        assert_eq!(provider.get_store_identifier(&foreign).await, UNKNOWN_STORE);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_eagerly() {
        let bad = TenantConfig::new("t1", "  ");
        assert!(ConfiguredProvider::new(&[bad], identity_factory()).is_err());
    }

    #[tokio::test]
    async fn dynamic_provider_reuses_surviving_stores() {
        use crate::clock::ManualClock;

        let clock = ManualClock::from_system();
        let provider = DynamicProvider::with_clock(
            Arc::new(StaticDiscovery::new(vec![config("t1")])),
            identity_factory(),
            Duration::from_secs(60),
            Arc::new(clock.clone()),
        );
        let first = provider.get_all_stores().await.unwrap();
        assert_eq!(first.len(), 1);

        // Within the interval nothing changes, even across calls.
        let again = provider.get_all_stores().await.unwrap();
        assert!(Arc::ptr_eq(&first[0], &again[0]));
    }

    #[tokio::test]
    async fn forced_refresh_ignores_interval() {
        let provider = DynamicProvider::new(
            Arc::new(StaticDiscovery::new(vec![config("t1")])),
            identity_factory(),
            Duration::from_secs(3600),
        );
        provider.refresh().await.unwrap();
        assert_eq!(provider.get_all_stores().await.unwrap().len(), 1);
    }
}
