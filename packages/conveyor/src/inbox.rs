//! Deduplicating inbox store.
//!
//! Consumers register every incoming message id before processing it.
//! Registration is a single upsert: the first caller creates the row in
//! `Seen`, every later caller bumps `attempts`, and the return value says
//! whether the message has already been fully processed. Registered messages
//! optionally carry work-queue columns so they can be drained through the
//! same claim/ack engine as the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::config::InboxOptions;
use crate::error::{Error, Result};
use crate::id::OwnerToken;
use crate::queue::{
    QueueSpec, WorkQueue, STATUS_DONE, STATUS_FAILED, STATUS_IN_PROGRESS, STATUS_READY,
};

/// Lifecycle status of an inbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[repr(i16)]
pub enum InboxStatus {
    #[default]
    Seen = STATUS_READY,
    Processing = STATUS_IN_PROGRESS,
    Done = STATUS_DONE,
    Dead = STATUS_FAILED,
}

/// One inbox row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InboxRecord {
    pub message_id: String,
    pub source: String,
    pub hash: Option<Vec<u8>>,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
    /// Number of registration calls observed for this id.
    pub attempts: i32,
    pub status: InboxStatus,
    pub topic: Option<String>,
    pub payload: Option<String>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
}

/// A registration, optionally carrying work-queue fields.
#[derive(Debug, Clone)]
pub struct InboxRegistration {
    message_id: String,
    source: String,
    hash: Option<Vec<u8>>,
    topic: Option<String>,
    payload: Option<String>,
    due_time_utc: Option<DateTime<Utc>>,
}

impl InboxRegistration {
    pub fn new(message_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            source: source.into(),
            hash: None,
            topic: None,
            payload: None,
            due_time_utc: None,
        }
    }

    /// Content digest for payload-level dedup diagnostics.
    pub fn hash(mut self, hash: impl Into<Vec<u8>>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Makes the message drainable through the work-queue surface.
    pub fn work(mut self, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self.payload = Some(payload.into());
        self
    }

    pub fn due_at(mut self, due: DateTime<Utc>) -> Self {
        self.due_time_utc = Some(due);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.message_id.trim().is_empty() {
            return Err(Error::invalid_argument("message_id must not be blank"));
        }
        if self.source.trim().is_empty() {
            return Err(Error::invalid_argument("source must not be blank"));
        }
        Ok(())
    }
}

/// PostgreSQL-backed inbox store.
pub struct InboxStore {
    queue: WorkQueue<String>,
    options: InboxOptions,
}

impl InboxStore {
    pub fn new(pool: PgPool, options: InboxOptions) -> Result<Self> {
        Self::with_clock(pool, options, system_clock())
    }

    pub fn with_clock(pool: PgPool, options: InboxOptions, clock: SharedClock) -> Result<Self> {
        options.validate()?;
        let spec = QueueSpec {
            schema: options.schema_name.clone(),
            table: options.table_name.clone(),
            id_column: "message_id",
            order_column: "first_seen_utc",
            // Seen rows, plus Processing rows whose lock has lapsed.
            claimable: &[STATUS_READY, STATUS_IN_PROGRESS],
            terminal: &[STATUS_DONE, STATUS_FAILED],
            processed_at_column: "processed_utc",
            has_retry_count: false,
            has_processed_flag: false,
            has_processed_by: false,
            has_last_error: false,
        };
        Ok(Self {
            queue: WorkQueue::new(pool, spec, clock),
            options,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.queue.pool()
    }

    pub fn options(&self) -> &InboxOptions {
        &self.options
    }

    fn clock(&self) -> &SharedClock {
        self.queue.clock()
    }

    // ------------------------------------------------------------------
    // dedup
    // ------------------------------------------------------------------

    /// Registers a message id and reports whether it was already processed.
    ///
    /// Exactly one row exists per id no matter how many callers race;
    /// `attempts` ends up equal to the number of calls.
    pub async fn already_processed(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&[u8]>,
    ) -> Result<bool> {
        let mut registration = InboxRegistration::new(message_id, source);
        if let Some(hash) = hash {
            registration = registration.hash(hash.to_vec());
        }
        self.register(registration).await
    }

    /// Full registration, optionally with work-queue fields. Returns `true`
    /// iff the message had already reached `Done`.
    pub async fn register(&self, registration: InboxRegistration) -> Result<bool> {
        registration.validate()?;
        let now = self.clock().now_utc();
        let qt = self.queue.spec().qualified();
        let sql = format!(
            r#"INSERT INTO {qt} AS inbox
               (message_id, source, hash, first_seen_utc, last_seen_utc, attempts, status,
                topic, payload, due_time_utc)
               VALUES ($1, $2, $3, $4, $4, 1, {STATUS_READY}, $5, $6, $7)
               ON CONFLICT (message_id) DO UPDATE
                   SET attempts = inbox.attempts + 1,
                       last_seen_utc = $4
               RETURNING status"#
        );
        let status: InboxStatus = sqlx::query_scalar(&sql)
            .bind(&registration.message_id)
            .bind(&registration.source)
            .bind(&registration.hash)
            .bind(now)
            .bind(&registration.topic)
            .bind(&registration.payload)
            .bind(registration.due_time_utc)
            .fetch_one(self.pool())
            .await?;
        debug!(message_id = %registration.message_id, ?status, "registered inbox message");
        Ok(status == InboxStatus::Done)
    }

    // ------------------------------------------------------------------
    // status marks
    // ------------------------------------------------------------------

    /// Marks a message as in flight. Terminal rows are untouched.
    pub async fn mark_processing(&self, message_id: &str) -> Result<()> {
        self.mark(message_id, InboxStatus::Processing, &[STATUS_READY, STATUS_IN_PROGRESS])
            .await
    }

    /// Marks a message as fully processed and stamps `processed_utc` once.
    pub async fn mark_processed(&self, message_id: &str) -> Result<()> {
        self.require_id(message_id)?;
        let now = self.clock().now_utc();
        let qt = self.queue.spec().qualified();
        let sql = format!(
            r#"UPDATE {qt}
               SET status = {STATUS_DONE},
                   processed_utc = COALESCE(processed_utc, $2),
                   owner_token = NULL,
                   locked_until = NULL
               WHERE message_id = $1
                 AND status IN ({STATUS_READY}, {STATUS_IN_PROGRESS}, {STATUS_DONE})"#
        );
        sqlx::query(&sql)
            .bind(message_id)
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Terminally refuses a message.
    pub async fn mark_dead(&self, message_id: &str) -> Result<()> {
        self.mark(
            message_id,
            InboxStatus::Dead,
            &[STATUS_READY, STATUS_IN_PROGRESS, STATUS_FAILED],
        )
        .await
    }

    async fn mark(&self, message_id: &str, to: InboxStatus, from: &[i16]) -> Result<()> {
        self.require_id(message_id)?;
        let qt = self.queue.spec().qualified();
        let sql = format!(
            r#"UPDATE {qt}
               SET status = $2, owner_token = NULL, locked_until = NULL
               WHERE message_id = $1 AND status = ANY($3)"#
        );
        sqlx::query(&sql)
            .bind(message_id)
            .bind(to)
            .bind(from)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    fn require_id(&self, message_id: &str) -> Result<()> {
        if message_id.trim().is_empty() {
            return Err(Error::invalid_argument("message_id must not be blank"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // work-queue surface
    // ------------------------------------------------------------------

    /// Claims due registered messages for `owner`, FIFO by first sighting.
    pub async fn claim(
        &self,
        owner: OwnerToken,
        lease: std::time::Duration,
        batch_size: i64,
    ) -> Result<Vec<String>> {
        self.queue.claim(owner, lease, batch_size).await
    }

    /// Acks still-owned in-flight messages (they become `Done`).
    pub async fn ack(&self, owner: OwnerToken, message_ids: &[String]) -> Result<()> {
        self.queue.ack(owner, message_ids).await?;
        Ok(())
    }

    /// Returns still-owned messages to `Seen` for a later attempt.
    pub async fn abandon(
        &self,
        owner: OwnerToken,
        message_ids: &[String],
        due_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.queue.abandon(owner, message_ids, None, due_time).await?;
        Ok(())
    }

    /// Terminally refuses still-owned messages (they become `Dead`).
    pub async fn fail(&self, owner: OwnerToken, message_ids: &[String]) -> Result<()> {
        self.queue.fail(owner, message_ids, None, None).await?;
        Ok(())
    }

    /// Extends the claim lease for still-owned in-flight messages.
    pub async fn extend(
        &self,
        owner: OwnerToken,
        message_ids: &[String],
        lease: std::time::Duration,
    ) -> Result<u64> {
        self.queue.extend(owner, message_ids, lease).await
    }

    /// Returns expired claims to `Seen`; reports the count.
    pub async fn reap_expired(&self) -> Result<u64> {
        self.queue.reap_expired().await
    }

    /// Deletes terminal rows older than `retention`; reports the count.
    pub async fn cleanup(&self, retention: std::time::Duration) -> Result<u64> {
        self.queue.cleanup(retention).await
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    /// Loads records by message id, FIFO by first sighting.
    pub async fn fetch(&self, message_ids: &[String]) -> Result<Vec<InboxRecord>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let qt = self.queue.spec().qualified();
        let sql = format!(
            r#"SELECT message_id, source, hash, first_seen_utc, last_seen_utc, processed_utc,
                      attempts, status, topic, payload, due_time_utc, locked_until, owner_token
               FROM {qt}
               WHERE message_id = ANY($1)
               ORDER BY first_seen_utc ASC, message_id ASC"#
        );
        let records = sqlx::query_as::<_, InboxRecord>(&sql)
            .bind(message_ids)
            .fetch_all(self.pool())
            .await?;
        Ok(records)
    }

    /// Loads one record by message id.
    pub async fn get(&self, message_id: &str) -> Result<Option<InboxRecord>> {
        self.require_id(message_id)?;
        Ok(self
            .fetch(&[message_id.to_string()])
            .await?
            .into_iter()
            .next())
    }
}
