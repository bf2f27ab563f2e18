//! Keyed routing over a store provider.
//!
//! A router is the thin front door for "give me tenant X's store": empty
//! keys are rejected, unknown keys surface a typed [`Error::NotFound`], and
//! `Uuid`/[`DatabaseId`] keys are converted to their canonical hyphenated
//! string form before lookup.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::id::DatabaseId;
use crate::inbox::InboxStore;
use crate::join::JoinStore;
use crate::lease::LeaseStore;
use crate::outbox::OutboxStore;
use crate::provider::StoreProvider;
use crate::scheduler::SchedulerStore;

/// Router over one store family.
pub struct Router<S: Send + Sync> {
    provider: Arc<dyn StoreProvider<S>>,
}

impl<S: Send + Sync> Clone for Router<S> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
        }
    }
}

impl<S: Send + Sync> Router<S> {
    pub fn new(provider: Arc<dyn StoreProvider<S>>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn StoreProvider<S>> {
        &self.provider
    }

    /// Resolves the store for `key`.
    pub async fn get(&self, key: &str) -> Result<Arc<S>> {
        if key.trim().is_empty() {
            return Err(Error::invalid_argument("router key must not be blank"));
        }
        self.provider
            .get_store_by_key(key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Resolves by tenant database id (canonical string form).
    pub async fn get_by_database(&self, database_id: DatabaseId) -> Result<Arc<S>> {
        self.get(&database_id.to_string()).await
    }

    /// Current snapshot of every store behind the router.
    pub async fn all(&self) -> Result<Vec<Arc<S>>> {
        self.provider.get_all_stores().await
    }

    /// Forces the backing provider to refresh its tenant snapshot.
    pub async fn refresh(&self) -> Result<()> {
        self.provider.refresh().await
    }
}

/// Per-tenant outbox routing.
pub type OutboxRouter = Router<OutboxStore>;
/// Per-tenant inbox routing.
pub type InboxRouter = Router<InboxStore>;
/// Per-tenant scheduler routing.
pub type SchedulerRouter = Router<SchedulerStore>;
/// Per-tenant lease routing (hands the dispatcher its per-outbox lease).
pub type LeaseRouter = Router<LeaseStore>;
/// Per-tenant join routing.
pub type JoinRouter = Router<JoinStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;
    use crate::provider::{ConfiguredProvider, StoreFactory};

    fn router() -> Router<String> {
        let factory: StoreFactory<String> =
            Arc::new(|config: &TenantConfig| Ok(config.identifier.clone()));
        let provider = ConfiguredProvider::new(
            &[TenantConfig::new("t1", "postgres://localhost/app")],
            factory,
        )
        .unwrap();
        Router::new(Arc::new(provider))
    }

    #[tokio::test]
    async fn known_key_resolves() {
        let store = router().get("t1").await.unwrap();
        assert_eq!(*store, "t1");
    }

    #[tokio::test]
    async fn blank_key_is_invalid_argument() {
        assert!(matches!(
            router().get("  ").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        assert!(matches!(
            router().get("t9").await,
            Err(Error::NotFound(key)) if key == "t9"
        ));
    }

    #[tokio::test]
    async fn database_ids_use_canonical_form() {
        let id = DatabaseId::random();
        match router().get_by_database(id).await {
            Err(Error::NotFound(key)) => assert_eq!(key, id.to_string()),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
