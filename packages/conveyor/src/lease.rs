//! Fencing lease over a database row.
//!
//! A lease names a resource, an owner token, an expiry, and a fencing token
//! that increases on every successful acquire and renew. Holders attach the
//! fencing token to downstream writes so a stale owner (one that lost the
//! lease and does not know it yet) can never clobber a newer one.
//!
//! Acquire, renew, and release are single compare-and-swap statements; the
//! row is never deleted, so the fencing token stays monotone across the full
//! history of a resource. A background task renews at a configurable fraction
//! of the lease duration and cancels the handle's loss signal when a renew
//! definitively fails.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::LeaseOptions;
use crate::error::{Error, Result};
use crate::id::OwnerToken;

/// Result of an acquire attempt.
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Another owner holds an unexpired lease. Carries the timestamp the
    /// store evaluated the attempt at, for clock-skew diagnostics.
    NotAcquired { observed_now: DateTime<Utc> },
}

impl AcquireOutcome {
    pub fn acquired(self) -> Option<Lease> {
        match self {
            AcquireOutcome::Acquired(lease) => Some(lease),
            AcquireOutcome::NotAcquired { .. } => None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }
}

/// Result of one renew attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewOutcome {
    Renewed(i64),
    /// The advisory pre-gate was busy; not a loss, try again next tick.
    GateBusy,
    /// Expired or taken by another owner. Definitive.
    Lost,
}

/// Factory for fencing leases over one lock table.
#[derive(Clone)]
pub struct LeaseStore {
    pool: PgPool,
    table: String,
    options: LeaseOptions,
    clock: SharedClock,
}

impl LeaseStore {
    pub fn new(pool: PgPool, options: LeaseOptions) -> Result<Self> {
        Self::with_clock(pool, options, system_clock())
    }

    pub fn with_clock(pool: PgPool, options: LeaseOptions, clock: SharedClock) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            pool,
            table: format!("\"{}\".\"{}\"", options.schema_name, options.table_name),
            options,
            clock,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Attempts to take the lease on `resource` for `duration`.
    ///
    /// Succeeds when the resource is free, expired, or already held by
    /// `owner`; bumps the fencing token and starts the auto-renew task.
    pub async fn acquire(
        &self,
        resource: &str,
        duration: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<AcquireOutcome> {
        if resource.trim().is_empty() {
            return Err(Error::invalid_argument("resource name must not be blank"));
        }
        let owner = owner.unwrap_or_else(OwnerToken::random);
        let now = self.clock.now_utc();
        let until = now
            + chrono::Duration::from_std(duration)
                .map_err(|e| Error::invalid_argument(format!("duration out of range: {e}")))?;

        let sql = format!(
            r#"INSERT INTO {table} AS lock (resource_name, owner_token, lease_until_utc, fencing_token)
               VALUES ($1, $2, $3, 1)
               ON CONFLICT (resource_name) DO UPDATE
                   SET owner_token = EXCLUDED.owner_token,
                       lease_until_utc = EXCLUDED.lease_until_utc,
                       fencing_token = lock.fencing_token + 1
                   WHERE lock.owner_token IS NULL
                      OR lock.lease_until_utc IS NULL
                      OR lock.lease_until_utc <= $4
                      OR lock.owner_token = $2
               RETURNING fencing_token"#,
            table = self.table
        );
        let fencing = sqlx::query_scalar::<_, i64>(&sql)
            .bind(resource)
            .bind(owner)
            .bind(until)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match fencing {
            Some(fencing_token) => {
                debug!(resource, %owner, fencing_token, "lease acquired");
                Ok(AcquireOutcome::Acquired(Lease::start(
                    self.clone(),
                    resource.to_string(),
                    owner,
                    duration,
                    fencing_token,
                )))
            }
            None => Ok(AcquireOutcome::NotAcquired { observed_now: now }),
        }
    }

    /// Extends the lease while it is still owned and unexpired.
    pub(crate) async fn renew(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
    ) -> Result<RenewOutcome> {
        let now = self.clock.now_utc();
        let until = now
            + chrono::Duration::from_std(duration)
                .map_err(|e| Error::invalid_argument(format!("duration out of range: {e}")))?;
        let sql = format!(
            r#"UPDATE {table}
               SET lease_until_utc = $3, fencing_token = fencing_token + 1
               WHERE resource_name = $1 AND owner_token = $2 AND lease_until_utc > $4
               RETURNING fencing_token"#,
            table = self.table
        );

        let renewed = if self.options.use_gate {
            let mut tx = self.pool.begin().await?;
            let gate = format!(
                "SET LOCAL lock_timeout = '{}ms'",
                self.options.gate_timeout.as_millis().max(1)
            );
            sqlx::query(&gate).execute(&mut *tx).await?;
            let gated = sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), 0)")
                .bind(resource)
                .execute(&mut *tx)
                .await;
            if let Err(err) = gated {
                if is_lock_timeout(&err) {
                    return Ok(RenewOutcome::GateBusy);
                }
                return Err(err.into());
            }
            let renewed = sqlx::query_scalar::<_, i64>(&sql)
                .bind(resource)
                .bind(owner)
                .bind(until)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;
            tx.commit().await?;
            renewed
        } else {
            sqlx::query_scalar::<_, i64>(&sql)
                .bind(resource)
                .bind(owner)
                .bind(until)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
        };

        Ok(match renewed {
            Some(fencing_token) => RenewOutcome::Renewed(fencing_token),
            None => RenewOutcome::Lost,
        })
    }

    /// Clears the owner and expiry while still owned. Idempotent; the row,
    /// and with it the fencing token, survives.
    pub async fn release(&self, resource: &str, owner: OwnerToken) -> Result<()> {
        let sql = format!(
            r#"UPDATE {table}
               SET owner_token = NULL, lease_until_utc = NULL
               WHERE resource_name = $1 AND owner_token = $2"#,
            table = self.table
        );
        sqlx::query(&sql)
            .bind(resource)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears every expired lease. Returns the number of rows cleared.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = self.clock.now_utc();
        let sql = format!(
            r#"UPDATE {table}
               SET owner_token = NULL, lease_until_utc = NULL
               WHERE lease_until_utc IS NOT NULL AND lease_until_utc <= $1"#,
            table = self.table
        );
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    fn renew_interval(&self, duration: Duration) -> Duration {
        duration.mul_f64(self.options.renew_percent)
    }
}

fn is_lock_timeout(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("55P03"),
        _ => false,
    }
}

/// A live fencing lease.
///
/// Dropping the handle stops the auto-renew task but leaves the row to
/// expire; call [`release`](Lease::release) for a prompt hand-off.
pub struct Lease {
    store: LeaseStore,
    resource: String,
    owner: OwnerToken,
    duration: Duration,
    fencing: Arc<AtomicI64>,
    lost: CancellationToken,
    renew_task: Option<tokio::task::JoinHandle<()>>,
}

impl Lease {
    fn start(
        store: LeaseStore,
        resource: String,
        owner: OwnerToken,
        duration: Duration,
        fencing_token: i64,
    ) -> Self {
        let fencing = Arc::new(AtomicI64::new(fencing_token));
        let lost = CancellationToken::new();

        let renew_store = store.clone();
        let renew_resource = resource.clone();
        let renew_fencing = fencing.clone();
        let renew_lost = lost.clone();
        let interval = store.renew_interval(duration);
        let renew_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = renew_lost.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match renew_store.renew(&renew_resource, owner, duration).await {
                    Ok(RenewOutcome::Renewed(token)) => {
                        renew_fencing.store(token, Ordering::SeqCst);
                    }
                    Ok(RenewOutcome::GateBusy) => {
                        debug!(resource = %renew_resource, "renew gate busy, retrying next tick");
                    }
                    Ok(RenewOutcome::Lost) => {
                        info!(resource = %renew_resource, "lease lost during auto-renew");
                        renew_lost.cancel();
                        break;
                    }
                    Err(err) => {
                        // Transient store trouble is not a definitive loss;
                        // expiry will turn it into one on a later tick.
                        warn!(resource = %renew_resource, error = %err, "lease renew failed");
                    }
                }
            }
        });

        Self {
            store,
            resource,
            owner,
            duration,
            fencing,
            lost,
            renew_task: Some(renew_task),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner_token(&self) -> OwnerToken {
        self.owner
    }

    /// The latest fencing token observed by this handle.
    pub fn fencing_token(&self) -> i64 {
        self.fencing.load(Ordering::SeqCst)
    }

    /// Signal that fires when a renew definitively fails. Compose it with
    /// your own cancellation before issuing fenced writes downstream.
    pub fn loss_signal(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Guard for callers about to act under the lease.
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::LeaseLost {
                resource: self.resource.clone(),
            });
        }
        Ok(())
    }

    /// Renews immediately, outside the background cadence. Returns `false`
    /// (and fires the loss signal) when the lease is definitively gone.
    pub async fn try_renew_now(&self) -> Result<bool> {
        match self
            .store
            .renew(&self.resource, self.owner, self.duration)
            .await?
        {
            RenewOutcome::Renewed(token) => {
                self.fencing.store(token, Ordering::SeqCst);
                Ok(true)
            }
            RenewOutcome::GateBusy => Ok(!self.is_lost()),
            RenewOutcome::Lost => {
                self.lost.cancel();
                Ok(false)
            }
        }
    }

    /// Stops auto-renew and clears the row while still owned.
    pub async fn release(mut self) -> Result<()> {
        self.stop_renew();
        self.store.release(&self.resource, self.owner).await
    }

    fn stop_renew(&mut self) {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stop_renew();
    }
}
