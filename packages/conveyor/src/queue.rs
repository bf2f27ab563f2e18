//! The work-queue state machine shared by outbox, inbox, and scheduler rows.
//!
//! One engine drives every queue-shaped table in the system: rows carry
//! `status`, `owner_token`, `locked_until`, and `due_time_utc` columns, and
//! move through
//!
//! ```text
//! Ready ──claim──► InProgress ──ack──► Done
//!   ▲                  │
//!   │             abandon / reap
//!   └──────────────────┘        ──fail──► Failed
//! ```
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent claimers never block
//! each other and never receive overlapping batches. Every mutation after the
//! claim is fenced on the claimer's owner token: a row whose token no longer
//! matches (lease expired, reaped, re-claimed) is silently skipped rather
//! than erroring, which makes duplicate acks and superseded workers benign.
//!
//! Outbox, inbox, and scheduler tables differ only in column inventory
//! (retry counter, processed flag, error text), captured by [`QueueSpec`].
//! Status codes share one numeric mapping; the table-facing enums in
//! `outbox`/`inbox`/`scheduler` give them their domain names.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgHasArrayType;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::debug;

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::id::OwnerToken;

// Shared numeric status codes. Ready/Seen = 0, InProgress/Processing = 1,
// Done = 2, Failed/Dead = 3, Cancelled (timers only) = 4.
pub(crate) const STATUS_READY: i16 = 0;
pub(crate) const STATUS_IN_PROGRESS: i16 = 1;
pub(crate) const STATUS_DONE: i16 = 2;
pub(crate) const STATUS_FAILED: i16 = 3;
pub(crate) const STATUS_CANCELLED: i16 = 4;

/// Shape of one queue-backed table.
#[derive(Debug, Clone)]
pub(crate) struct QueueSpec {
    pub schema: String,
    pub table: String,
    /// Primary key column; `UUID` for outbox/scheduler, `TEXT` for inbox.
    pub id_column: &'static str,
    /// FIFO ordering column (`created_at` / `first_seen_utc`).
    pub order_column: &'static str,
    /// Statuses a claim may pick up (the lock gate still applies).
    pub claimable: &'static [i16],
    /// Terminal statuses swept by cleanup.
    pub terminal: &'static [i16],
    /// Column stamped on ack (`processed_at` / `processed_utc`).
    pub processed_at_column: &'static str,
    pub has_retry_count: bool,
    pub has_processed_flag: bool,
    pub has_processed_by: bool,
    pub has_last_error: bool,
}

impl QueueSpec {
    /// Schema-qualified, quoted table reference.
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

/// Bound on id column types the engine can drive (`Uuid`-shaped ids and
/// `String` message ids both qualify).
pub trait QueueId:
    for<'r> sqlx::Decode<'r, Postgres>
    + for<'q> sqlx::Encode<'q, Postgres>
    + sqlx::Type<Postgres>
    + PgHasArrayType
    + Clone
    + Send
    + Sync
    + Unpin
    + 'static
{
}

impl<T> QueueId for T where
    T: for<'r> sqlx::Decode<'r, Postgres>
        + for<'q> sqlx::Encode<'q, Postgres>
        + sqlx::Type<Postgres>
        + PgHasArrayType
        + Clone
        + Send
        + Sync
        + Unpin
        + 'static
{
}

/// The claim/ack/abandon/fail/reap engine over one table.
pub struct WorkQueue<I> {
    pool: PgPool,
    spec: QueueSpec,
    clock: SharedClock,
    _id: PhantomData<fn() -> I>,
}

impl<I: QueueId> WorkQueue<I> {
    pub(crate) fn new(pool: PgPool, spec: QueueSpec, clock: SharedClock) -> Self {
        Self {
            pool,
            spec,
            clock,
            _id: PhantomData,
        }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // ------------------------------------------------------------------
    // claim
    // ------------------------------------------------------------------

    /// Claims up to `batch_size` eligible rows for `owner`.
    ///
    /// Eligible means: claimable status, `due_time_utc` absent or due, and
    /// `locked_until` absent or expired. Rows locked by a concurrent claim
    /// are skipped, not waited on. Returned ids are in FIFO order.
    pub async fn claim(
        &self,
        owner: OwnerToken,
        lease: std::time::Duration,
        batch_size: i64,
    ) -> Result<Vec<I>> {
        let mut conn = self.pool.acquire().await?;
        self.claim_in(&mut conn, owner, lease, batch_size).await
    }

    pub(crate) async fn claim_in(
        &self,
        conn: &mut PgConnection,
        owner: OwnerToken,
        lease: std::time::Duration,
        batch_size: i64,
    ) -> Result<Vec<I>> {
        if batch_size < 1 {
            return Err(Error::invalid_argument(format!(
                "batch_size must be >= 1, got {batch_size}"
            )));
        }
        let now = self.clock.now_utc();
        let locked_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| Error::invalid_argument(format!("lease out of range: {e}")))?;

        let qt = self.spec.qualified();
        let id = self.spec.id_column;
        let order = self.spec.order_column;
        let sql = format!(
            r#"
            WITH picked AS (
                SELECT "{id}"
                FROM {qt}
                WHERE status = ANY($1)
                  AND (due_time_utc IS NULL OR due_time_utc <= $2)
                  AND (locked_until IS NULL OR locked_until <= $2)
                ORDER BY "{order}" ASC, "{id}" ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {qt} AS q
            SET status = {STATUS_IN_PROGRESS},
                owner_token = $4,
                locked_until = $5
            FROM picked
            WHERE q."{id}" = picked."{id}"
            RETURNING q."{id}" AS id, q."{order}" AS queued_at
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(self.spec.claimable)
            .bind(now)
            .bind(batch_size)
            .bind(owner)
            .bind(locked_until)
            .fetch_all(&mut *conn)
            .await?;

        let mut claimed: Vec<(I, DateTime<Utc>)> = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push((row.try_get("id")?, row.try_get("queued_at")?));
        }
        // UPDATE .. RETURNING does not preserve the CTE's ordering.
        claimed.sort_by(|a, b| a.1.cmp(&b.1));

        debug!(
            table = %self.spec.table,
            owner = %owner,
            count = claimed.len(),
            "claimed work items"
        );
        Ok(claimed.into_iter().map(|(id, _)| id).collect())
    }

    // ------------------------------------------------------------------
    // ack
    // ------------------------------------------------------------------

    /// Marks still-owned `InProgress` rows as `Done`. Rows that are terminal
    /// or owned by someone else are skipped. Returns the acked ids.
    pub async fn ack(&self, owner: OwnerToken, ids: &[I]) -> Result<Vec<I>> {
        let mut conn = self.pool.acquire().await?;
        self.ack_in(&mut conn, owner, ids).await
    }

    pub(crate) async fn ack_in(
        &self,
        conn: &mut PgConnection,
        owner: OwnerToken,
        ids: &[I],
    ) -> Result<Vec<I>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now_utc();
        let qt = self.spec.qualified();
        let id = self.spec.id_column;
        let processed_at = self.spec.processed_at_column;

        let mut set = format!(
            "status = {STATUS_DONE}, owner_token = NULL, locked_until = NULL, \"{processed_at}\" = $3"
        );
        if self.spec.has_processed_flag {
            set.push_str(", is_processed = TRUE");
        }
        let sql = format!(
            r#"UPDATE {qt} SET {set}
               WHERE "{id}" = ANY($1) AND status = {STATUS_IN_PROGRESS} AND owner_token = $2
               RETURNING "{id}""#
        );

        let rows = sqlx::query(&sql)
            .bind(ids)
            .bind(owner)
            .bind(now)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get(0).map_err(Error::from))
            .collect()
    }

    // ------------------------------------------------------------------
    // abandon
    // ------------------------------------------------------------------

    /// Returns still-owned rows to the ready state for a later attempt.
    ///
    /// Bumps the retry counter where the table has one, merges `last_error`,
    /// and sets `due_time_utc` to the explicit value, the existing value, or
    /// now, in that order.
    pub async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[I],
        last_error: Option<&str>,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        self.abandon_in(&mut conn, owner, ids, last_error, due_time)
            .await
    }

    pub(crate) async fn abandon_in(
        &self,
        conn: &mut PgConnection,
        owner: OwnerToken,
        ids: &[I],
        last_error: Option<&str>,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now_utc();
        let qt = self.spec.qualified();
        let id = self.spec.id_column;

        let mut set = format!(
            "status = {STATUS_READY}, owner_token = NULL, locked_until = NULL, \
             due_time_utc = COALESCE($3, due_time_utc, $4)"
        );
        if self.spec.has_retry_count {
            set.push_str(", retry_count = retry_count + 1");
        }
        let bind_error = self.spec.has_last_error;
        if bind_error {
            set.push_str(", last_error = COALESCE($5, last_error)");
        }
        let sql = format!(
            r#"UPDATE {qt} SET {set}
               WHERE "{id}" = ANY($1) AND status = {STATUS_IN_PROGRESS} AND owner_token = $2"#
        );

        let mut query = sqlx::query(&sql)
            .bind(ids)
            .bind(owner)
            .bind(due_time)
            .bind(now);
        if bind_error {
            query = query.bind(last_error);
        }
        let result = query.execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // fail
    // ------------------------------------------------------------------

    /// Moves still-owned rows to the terminal failed state. Returns the
    /// affected ids.
    pub async fn fail(
        &self,
        owner: OwnerToken,
        ids: &[I],
        last_error: Option<&str>,
        processed_by: Option<&str>,
    ) -> Result<Vec<I>> {
        let mut conn = self.pool.acquire().await?;
        self.fail_in(&mut conn, owner, ids, last_error, processed_by)
            .await
    }

    pub(crate) async fn fail_in(
        &self,
        conn: &mut PgConnection,
        owner: OwnerToken,
        ids: &[I],
        last_error: Option<&str>,
        processed_by: Option<&str>,
    ) -> Result<Vec<I>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let qt = self.spec.qualified();
        let id = self.spec.id_column;

        let mut set =
            format!("status = {STATUS_FAILED}, owner_token = NULL, locked_until = NULL");
        let mut next_param = 2;
        let bind_error = self.spec.has_last_error;
        if bind_error {
            next_param += 1;
            set.push_str(&format!(", last_error = COALESCE(${next_param}, last_error)"));
        }
        let bind_by = self.spec.has_processed_by;
        if bind_by {
            next_param += 1;
            set.push_str(&format!(
                ", processed_by = COALESCE(${next_param}, processed_by)"
            ));
        }
        let sql = format!(
            r#"UPDATE {qt} SET {set}
               WHERE "{id}" = ANY($1) AND status = {STATUS_IN_PROGRESS} AND owner_token = $2
               RETURNING "{id}""#
        );

        let mut query = sqlx::query(&sql).bind(ids).bind(owner);
        if bind_error {
            query = query.bind(last_error);
        }
        if bind_by {
            query = query.bind(processed_by);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.into_iter()
            .map(|row| row.try_get(0).map_err(Error::from))
            .collect()
    }

    // ------------------------------------------------------------------
    // lease maintenance
    // ------------------------------------------------------------------

    /// Extends `locked_until` for still-owned in-progress rows (heartbeat for
    /// handlers that outlive their original lease).
    pub async fn extend(
        &self,
        owner: OwnerToken,
        ids: &[I],
        lease: std::time::Duration,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let locked_until = self.clock.now_utc()
            + chrono::Duration::from_std(lease)
                .map_err(|e| Error::invalid_argument(format!("lease out of range: {e}")))?;
        let qt = self.spec.qualified();
        let id = self.spec.id_column;
        let sql = format!(
            r#"UPDATE {qt} SET locked_until = $3
               WHERE "{id}" = ANY($1) AND status = {STATUS_IN_PROGRESS} AND owner_token = $2"#
        );
        let result = sqlx::query(&sql)
            .bind(ids)
            .bind(owner)
            .bind(locked_until)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Returns expired in-progress rows to the ready state and clears their
    /// owner and lock. Returns the number of rows reaped.
    pub async fn reap_expired(&self) -> Result<u64> {
        let now = self.clock.now_utc();
        let qt = self.spec.qualified();
        let sql = format!(
            r#"UPDATE {qt}
               SET status = {STATUS_READY}, owner_token = NULL, locked_until = NULL
               WHERE status = {STATUS_IN_PROGRESS}
                 AND locked_until IS NOT NULL
                 AND locked_until <= $1"#
        );
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        let reaped = result.rows_affected();
        if reaped > 0 {
            debug!(table = %self.spec.table, count = reaped, "reaped expired claims");
        }
        Ok(reaped)
    }

    // ------------------------------------------------------------------
    // retention
    // ------------------------------------------------------------------

    /// Deletes terminal rows older than `retention`. Returns the number of
    /// rows deleted.
    pub async fn cleanup(&self, retention: std::time::Duration) -> Result<u64> {
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(retention)
                .map_err(|e| Error::invalid_argument(format!("retention out of range: {e}")))?;
        let qt = self.spec.qualified();
        let order = self.spec.order_column;
        let processed_at = self.spec.processed_at_column;
        let sql = format!(
            r#"DELETE FROM {qt}
               WHERE status = ANY($1)
                 AND COALESCE("{processed_at}", "{order}") < $2"#
        );
        let result = sqlx::query(&sql)
            .bind(self.spec.terminal)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> QueueSpec {
        QueueSpec {
            schema: "infra".into(),
            table: "Outbox".into(),
            id_column: "id",
            order_column: "created_at",
            claimable: &[STATUS_READY],
            terminal: &[STATUS_DONE, STATUS_FAILED],
            processed_at_column: "processed_at",
            has_retry_count: true,
            has_processed_flag: true,
            has_processed_by: true,
            has_last_error: true,
        }
    }

    #[test]
    fn qualified_name_is_quoted() {
        assert_eq!(spec().qualified(), r#""infra"."Outbox""#);
    }

    #[test]
    fn status_codes_are_stable() {
        // The numeric mapping is part of the storage contract.
        assert_eq!(STATUS_READY, 0);
        assert_eq!(STATUS_IN_PROGRESS, 1);
        assert_eq!(STATUS_DONE, 2);
        assert_eq!(STATUS_FAILED, 3);
        assert_eq!(STATUS_CANCELLED, 4);
    }
}
