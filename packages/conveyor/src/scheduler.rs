//! Scheduler: one-shot timers and cron jobs that materialize as outbox
//! messages at their due time.
//!
//! Timers and job runs are work-queue tables like the outbox; the scheduler
//! worker claims due rows through the shared engine, enqueues the matching
//! outbox message, and acks. Cron arithmetic is delegated to the `cron`
//! crate, treated purely as an oracle yielding the next due instant.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::SchedulerOptions;
use crate::error::{Error, Result};
use crate::id::{JobRunId, OwnerToken, TimerId};
use crate::outbox::{NewMessage, OutboxStore};
use crate::provider::StoreProvider;
use crate::queue::{
    QueueSpec, WorkQueue, STATUS_CANCELLED, STATUS_DONE, STATUS_FAILED, STATUS_IN_PROGRESS,
    STATUS_READY,
};
use crate::router::OutboxRouter;
use crate::service::Service;

/// Status of timers and job runs. `Cancelled` only ever applies to pending
/// timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[repr(i16)]
pub enum ScheduleStatus {
    #[default]
    Pending = STATUS_READY,
    InProgress = STATUS_IN_PROGRESS,
    Done = STATUS_DONE,
    Failed = STATUS_FAILED,
    Cancelled = STATUS_CANCELLED,
}

/// A registered cron job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CronJob {
    pub job_name: String,
    pub topic: String,
    pub cron_schedule: String,
    pub payload: Option<String>,
    pub next_due_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A one-shot timer row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TimerRow {
    pub id: TimerId,
    pub topic: String,
    pub payload: String,
    pub due_time_utc: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One materialization of a cron job (or a manual trigger).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRunRow {
    pub id: JobRunId,
    pub job_name: String,
    pub topic: String,
    pub payload: Option<String>,
    pub due_time_utc: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Next fire time of `cron_schedule` strictly after `after`.
///
/// `None` means the schedule has no further occurrences.
pub fn next_due_utc(cron_schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = cron::Schedule::from_str(cron_schedule).map_err(|e| Error::InvalidCronSchedule {
        schedule: cron_schedule.to_string(),
        message: e.to_string(),
    })?;
    Ok(schedule.after(&after).next())
}

/// PostgreSQL-backed scheduler store for one tenant.
pub struct SchedulerStore {
    jobs: String,
    timers: WorkQueue<TimerId>,
    runs: WorkQueue<JobRunId>,
    clock: SharedClock,
    options: SchedulerOptions,
}

impl SchedulerStore {
    pub fn new(pool: PgPool, options: SchedulerOptions) -> Result<Self> {
        Self::with_clock(pool, options, system_clock())
    }

    pub fn with_clock(pool: PgPool, options: SchedulerOptions, clock: SharedClock) -> Result<Self> {
        options.validate()?;
        let timer_spec = QueueSpec {
            schema: options.schema_name.clone(),
            table: options.timers_table.clone(),
            id_column: "id",
            order_column: "due_time_utc",
            claimable: &[STATUS_READY],
            terminal: &[STATUS_DONE, STATUS_FAILED, STATUS_CANCELLED],
            processed_at_column: "processed_at",
            has_retry_count: true,
            has_processed_flag: false,
            has_processed_by: false,
            has_last_error: true,
        };
        let run_spec = QueueSpec {
            schema: options.schema_name.clone(),
            table: options.job_runs_table.clone(),
            id_column: "id",
            order_column: "due_time_utc",
            claimable: &[STATUS_READY],
            terminal: &[STATUS_DONE, STATUS_FAILED],
            processed_at_column: "processed_at",
            has_retry_count: true,
            has_processed_flag: false,
            has_processed_by: false,
            has_last_error: true,
        };
        Ok(Self {
            jobs: format!("\"{}\".\"{}\"", options.schema_name, options.jobs_table),
            timers: WorkQueue::new(pool.clone(), timer_spec, clock.clone()),
            runs: WorkQueue::new(pool, run_spec, clock.clone()),
            clock,
            options,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.timers.pool()
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    /// Inserts a pending timer due at `due_time`.
    pub async fn schedule_timer(
        &self,
        topic: &str,
        payload: &str,
        due_time: DateTime<Utc>,
    ) -> Result<TimerId> {
        if topic.trim().is_empty() {
            return Err(Error::invalid_argument("timer topic must not be blank"));
        }
        let id = TimerId::random();
        let now = self.clock.now_utc();
        let qt = self.timers.spec().qualified();
        let sql = format!(
            r#"INSERT INTO {qt}
               (id, topic, payload, due_time_utc, created_at, status, retry_count)
               VALUES ($1, $2, $3, $4, $5, {STATUS_READY}, 0)"#
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(topic)
            .bind(payload)
            .bind(due_time)
            .bind(now)
            .execute(self.pool())
            .await?;
        debug!(%id, topic, %due_time, "scheduled timer");
        Ok(id)
    }

    /// Cancels a timer that is still pending. Reports whether a row changed.
    pub async fn cancel_timer(&self, id: TimerId) -> Result<bool> {
        let qt = self.timers.spec().qualified();
        let sql = format!(
            r#"UPDATE {qt} SET status = {STATUS_CANCELLED}
               WHERE id = $1 AND status = {STATUS_READY}"#
        );
        let result = sqlx::query(&sql).bind(id).execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Loads one timer.
    pub async fn get_timer(&self, id: TimerId) -> Result<Option<TimerRow>> {
        let qt = self.timers.spec().qualified();
        let sql = format!(
            r#"SELECT id, topic, payload, due_time_utc, created_at, status, locked_until,
                      owner_token, retry_count, last_error, processed_at
               FROM {qt} WHERE id = $1"#
        );
        Ok(sqlx::query_as::<_, TimerRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn claim_timers(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: i64,
    ) -> Result<Vec<TimerId>> {
        self.timers.claim(owner, lease, batch_size).await
    }

    pub async fn fetch_timers(&self, ids: &[TimerId]) -> Result<Vec<TimerRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let qt = self.timers.spec().qualified();
        let sql = format!(
            r#"SELECT id, topic, payload, due_time_utc, created_at, status, locked_until,
                      owner_token, retry_count, last_error, processed_at
               FROM {qt} WHERE id = ANY($1)
               ORDER BY due_time_utc ASC, id ASC"#
        );
        Ok(sqlx::query_as::<_, TimerRow>(&sql)
            .bind(ids)
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn ack_timers(&self, owner: OwnerToken, ids: &[TimerId]) -> Result<()> {
        self.timers.ack(owner, ids).await?;
        Ok(())
    }

    pub async fn abandon_timers(
        &self,
        owner: OwnerToken,
        ids: &[TimerId],
        last_error: Option<&str>,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.timers.abandon(owner, ids, last_error, due_time).await?;
        Ok(())
    }

    pub async fn fail_timers(
        &self,
        owner: OwnerToken,
        ids: &[TimerId],
        last_error: Option<&str>,
    ) -> Result<()> {
        self.timers.fail(owner, ids, last_error, None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // cron jobs
    // ------------------------------------------------------------------

    /// Upserts a job by name; the next due time comes from the cron oracle.
    pub async fn create_or_update_job(
        &self,
        job_name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<&str>,
    ) -> Result<()> {
        if job_name.trim().is_empty() {
            return Err(Error::invalid_argument("job_name must not be blank"));
        }
        if topic.trim().is_empty() {
            return Err(Error::invalid_argument("job topic must not be blank"));
        }
        let now = self.clock.now_utc();
        let next_due = next_due_utc(cron_schedule, now)?;
        let sql = format!(
            r#"INSERT INTO {jobs}
               (job_name, topic, cron_schedule, payload, next_due_time, is_enabled,
                created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
               ON CONFLICT (job_name) DO UPDATE
                   SET topic = EXCLUDED.topic,
                       cron_schedule = EXCLUDED.cron_schedule,
                       payload = EXCLUDED.payload,
                       next_due_time = EXCLUDED.next_due_time,
                       updated_at = EXCLUDED.updated_at"#,
            jobs = self.jobs
        );
        sqlx::query(&sql)
            .bind(job_name)
            .bind(topic)
            .bind(cron_schedule)
            .bind(payload)
            .bind(next_due)
            .bind(now)
            .execute(self.pool())
            .await?;
        info!(job_name, cron_schedule, next_due = ?next_due, "upserted cron job");
        Ok(())
    }

    /// Removes a job. Reports whether a row was deleted.
    pub async fn delete_job(&self, job_name: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {jobs} WHERE job_name = $1", jobs = self.jobs);
        let result = sqlx::query(&sql).bind(job_name).execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_job(&self, job_name: &str) -> Result<Option<CronJob>> {
        let sql = format!(
            r#"SELECT job_name, topic, cron_schedule, payload, next_due_time, last_run_time,
                      last_run_status, is_enabled, created_at, updated_at
               FROM {jobs} WHERE job_name = $1"#,
            jobs = self.jobs
        );
        Ok(sqlx::query_as::<_, CronJob>(&sql)
            .bind(job_name)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Enables or disables a job without touching its schedule.
    pub async fn set_job_enabled(&self, job_name: &str, enabled: bool) -> Result<bool> {
        let now = self.clock.now_utc();
        let sql = format!(
            r#"UPDATE {jobs} SET is_enabled = $2, updated_at = $3 WHERE job_name = $1"#,
            jobs = self.jobs
        );
        let result = sqlx::query(&sql)
            .bind(job_name)
            .bind(enabled)
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Inserts an immediately-due run for `job_name`.
    pub async fn trigger_job(&self, job_name: &str) -> Result<JobRunId> {
        let job = self
            .get_job(job_name)
            .await?
            .ok_or_else(|| Error::NotFound(job_name.to_string()))?;
        let now = self.clock.now_utc();
        self.insert_job_run(&job, now).await
    }

    async fn insert_job_run(&self, job: &CronJob, due: DateTime<Utc>) -> Result<JobRunId> {
        let id = JobRunId::random();
        let now = self.clock.now_utc();
        let qt = self.runs.spec().qualified();
        let sql = format!(
            r#"INSERT INTO {qt}
               (id, job_name, topic, payload, due_time_utc, created_at, status, retry_count)
               VALUES ($1, $2, $3, $4, $5, $6, {STATUS_READY}, 0)"#
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&job.job_name)
            .bind(&job.topic)
            .bind(&job.payload)
            .bind(due)
            .bind(now)
            .execute(self.pool())
            .await?;
        debug!(%id, job_name = %job.job_name, %due, "inserted job run");
        Ok(id)
    }

    /// Creates runs for every enabled job whose due time has arrived, and
    /// advances each job's `next_due_time` past now. Returns how many runs
    /// were created.
    pub async fn spawn_due_runs(&self, limit: i64) -> Result<u64> {
        let now = self.clock.now_utc();
        let mut tx = self.pool().begin().await?;
        let select = format!(
            r#"SELECT job_name, topic, cron_schedule, payload, next_due_time, last_run_time,
                      last_run_status, is_enabled, created_at, updated_at
               FROM {jobs}
               WHERE is_enabled AND next_due_time IS NOT NULL AND next_due_time <= $1
               ORDER BY next_due_time ASC
               LIMIT $2
               FOR UPDATE SKIP LOCKED"#,
            jobs = self.jobs
        );
        let due_jobs = sqlx::query_as::<_, CronJob>(&select)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        let mut spawned = 0u64;
        for job in &due_jobs {
            let next = match next_due_utc(&job.cron_schedule, now) {
                Ok(next) => next,
                Err(err) => {
                    // An unparseable schedule must not wedge the sweep.
                    warn!(job_name = %job.job_name, error = %err, "disabling job with bad schedule");
                    let disable = format!(
                        "UPDATE {jobs} SET is_enabled = FALSE, updated_at = $2 WHERE job_name = $1",
                        jobs = self.jobs
                    );
                    sqlx::query(&disable)
                        .bind(&job.job_name)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    continue;
                }
            };
            let advance = format!(
                "UPDATE {jobs} SET next_due_time = $2, updated_at = $3 WHERE job_name = $1",
                jobs = self.jobs
            );
            sqlx::query(&advance)
                .bind(&job.job_name)
                .bind(next)
                .bind(now)
                .execute(&mut *tx)
                .await?;

            let id = JobRunId::random();
            let qt = self.runs.spec().qualified();
            let insert = format!(
                r#"INSERT INTO {qt}
                   (id, job_name, topic, payload, due_time_utc, created_at, status, retry_count)
                   VALUES ($1, $2, $3, $4, $5, $6, {STATUS_READY}, 0)"#
            );
            sqlx::query(&insert)
                .bind(id)
                .bind(&job.job_name)
                .bind(&job.topic)
                .bind(&job.payload)
                .bind(job.next_due_time.unwrap_or(now))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            spawned += 1;
        }
        tx.commit().await?;
        if spawned > 0 {
            debug!(count = spawned, "spawned due job runs");
        }
        Ok(spawned)
    }

    /// Stamps the parent job after a run materialized (or failed to).
    pub async fn record_job_run_outcome(&self, job_name: &str, status: &str) -> Result<()> {
        let now = self.clock.now_utc();
        let sql = format!(
            r#"UPDATE {jobs}
               SET last_run_time = $2, last_run_status = $3, updated_at = $2
               WHERE job_name = $1"#,
            jobs = self.jobs
        );
        sqlx::query(&sql)
            .bind(job_name)
            .bind(now)
            .bind(status)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // job runs as a work queue
    // ------------------------------------------------------------------

    pub async fn claim_job_runs(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: i64,
    ) -> Result<Vec<JobRunId>> {
        self.runs.claim(owner, lease, batch_size).await
    }

    pub async fn fetch_job_runs(&self, ids: &[JobRunId]) -> Result<Vec<JobRunRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let qt = self.runs.spec().qualified();
        let sql = format!(
            r#"SELECT id, job_name, topic, payload, due_time_utc, created_at, status,
                      locked_until, owner_token, retry_count, last_error, processed_at
               FROM {qt} WHERE id = ANY($1)
               ORDER BY due_time_utc ASC, id ASC"#
        );
        Ok(sqlx::query_as::<_, JobRunRow>(&sql)
            .bind(ids)
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn ack_job_runs(&self, owner: OwnerToken, ids: &[JobRunId]) -> Result<()> {
        self.runs.ack(owner, ids).await?;
        Ok(())
    }

    pub async fn abandon_job_runs(
        &self,
        owner: OwnerToken,
        ids: &[JobRunId],
        last_error: Option<&str>,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.runs.abandon(owner, ids, last_error, due_time).await?;
        Ok(())
    }

    pub async fn fail_job_runs(
        &self,
        owner: OwnerToken,
        ids: &[JobRunId],
        last_error: Option<&str>,
    ) -> Result<()> {
        self.runs.fail(owner, ids, last_error, None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Returns expired timer and job-run claims to pending.
    pub async fn reap_expired(&self) -> Result<u64> {
        Ok(self.timers.reap_expired().await? + self.runs.reap_expired().await?)
    }

    /// Deletes terminal timers and job runs older than `retention`.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64> {
        Ok(self.timers.cleanup(retention).await? + self.runs.cleanup(retention).await?)
    }
}

// ============================================================================
// Scheduler worker
// ============================================================================

/// Materializes due timers and job runs into each tenant's outbox.
pub struct SchedulerService {
    schedulers: Arc<dyn StoreProvider<SchedulerStore>>,
    outboxes: OutboxRouter,
    poll_interval: Duration,
    claim_lease: Duration,
    batch_size: i64,
}

impl SchedulerService {
    pub fn new(schedulers: Arc<dyn StoreProvider<SchedulerStore>>, outboxes: OutboxRouter) -> Self {
        Self {
            schedulers,
            outboxes,
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(60),
            batch_size: 50,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// One pass over every tenant. Returns the number of rows materialized.
    ///
    /// A tenant whose schema is missing, or whose store is misbehaving, is
    /// skipped for this pass; the other tenants still get served.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let stores = self.schedulers.get_all_stores().await?;
        let mut materialized = 0usize;
        for store in &stores {
            if cancel.is_cancelled() {
                break;
            }
            let identifier = self.schedulers.get_store_identifier(store).await;
            let drained = match self.outboxes.get(&identifier).await {
                Ok(outbox) => self.drain_tenant(store, &outbox).await,
                Err(err) => Err(err),
            };
            match drained {
                Ok(count) => materialized += count,
                Err(err) if err.is_missing_relation() => {
                    warn!(tenant = %identifier, error = %err, "scheduler tables missing, skipping tenant");
                }
                Err(err) => {
                    error!(tenant = %identifier, error = %err, "scheduler pass failed for tenant");
                }
            }
        }
        Ok(materialized)
    }

    async fn drain_tenant(&self, store: &SchedulerStore, outbox: &OutboxStore) -> Result<usize> {
        store.spawn_due_runs(self.batch_size).await?;

        let owner = OwnerToken::random();
        let mut materialized = 0usize;

        let run_ids = store
            .claim_job_runs(owner, self.claim_lease, self.batch_size)
            .await?;
        for run in store.fetch_job_runs(&run_ids).await? {
            let message = NewMessage::new(&run.topic, run.payload.clone().unwrap_or_default())
                .correlation_id(format!("job:{}", run.job_name));
            match outbox.enqueue(message).await {
                Ok(_) => {
                    store.ack_job_runs(owner, &[run.id]).await?;
                    store
                        .record_job_run_outcome(&run.job_name, "Succeeded")
                        .await?;
                    materialized += 1;
                }
                Err(err) => {
                    warn!(run = %run.id, job_name = %run.job_name, error = %err,
                          "failed to materialize job run");
                    let reason = err.to_string();
                    store
                        .abandon_job_runs(owner, &[run.id], Some(reason.as_str()), None)
                        .await?;
                    store.record_job_run_outcome(&run.job_name, "Failed").await?;
                }
            }
        }

        let timer_ids = store
            .claim_timers(owner, self.claim_lease, self.batch_size)
            .await?;
        for timer in store.fetch_timers(&timer_ids).await? {
            let message = NewMessage::new(&timer.topic, timer.payload.clone())
                .correlation_id(format!("timer:{}", timer.id));
            match outbox.enqueue(message).await {
                Ok(_) => {
                    store.ack_timers(owner, &[timer.id]).await?;
                    materialized += 1;
                }
                Err(err) => {
                    warn!(timer = %timer.id, error = %err, "failed to materialize timer");
                    let reason = err.to_string();
                    store
                        .abandon_timers(owner, &[timer.id], Some(reason.as_str()), None)
                        .await?;
                }
            }
        }
        Ok(materialized)
    }
}

#[async_trait]
impl Service for SchedulerService {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("scheduler worker starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once(&shutdown).await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Ok(count) => {
                    debug!(count, "scheduler pass materialized rows");
                }
                Err(err) => {
                    error!(error = %err, "scheduler pass failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!("scheduler worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_due_advances_past_now() {
        let now = Utc::now();
        // Every minute, at second 0.
        let next = next_due_utc("0 * * * * *", now).unwrap().unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::seconds(60));
    }

    #[test]
    fn bad_cron_schedule_is_a_typed_error() {
        assert!(matches!(
            next_due_utc("not a schedule", Utc::now()),
            Err(Error::InvalidCronSchedule { .. })
        ));
    }

    #[test]
    fn schedule_status_default_is_pending() {
        assert_eq!(ScheduleStatus::default(), ScheduleStatus::Pending);
    }
}
