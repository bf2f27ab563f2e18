//! Transactional outbox store.
//!
//! Work items are written in the same database transaction as application
//! data ([`OutboxStore::enqueue_in`]), then drained by the dispatcher through
//! the shared work-queue engine. Acks and fails thread the join side table:
//! when a message that was attached to a join reaches a terminal state, the
//! join's completed/failed counters advance in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::config::OutboxOptions;
use crate::error::{Error, Result};
use crate::id::{MessageId, OwnerToken, WorkItemId};
use crate::join::JoinStore;
use crate::queue::{
    QueueSpec, WorkQueue, STATUS_DONE, STATUS_FAILED, STATUS_IN_PROGRESS, STATUS_READY,
};

/// Maximum accepted topic length.
pub const MAX_TOPIC_LEN: usize = 255;

/// Lifecycle status of an outbox work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[repr(i16)]
pub enum WorkStatus {
    #[default]
    Ready = STATUS_READY,
    InProgress = STATUS_IN_PROGRESS,
    Done = STATUS_DONE,
    Failed = STATUS_FAILED,
}

/// One outbox row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: WorkItemId,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    /// Stable consumer-side id; survives retries and is the key joins attach
    /// to, distinct from the row id.
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
    pub status: WorkStatus,
    pub is_processed: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    /// Number of previous attempts; the execution in flight is attempt
    /// `retry_count + 1`.
    pub retry_count: i32,
    pub last_error: Option<String>,
}

/// A message to enqueue.
#[derive(Debug, Clone)]
pub struct NewMessage {
    topic: String,
    payload: String,
    correlation_id: Option<String>,
    message_id: MessageId,
    due_time_utc: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            correlation_id: None,
            message_id: MessageId::random(),
            due_time_utc: None,
        }
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Overrides the generated consumer-side message id (stable re-publish).
    pub fn message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// The consumer-side message id this message will carry. Attach it to a
    /// join before enqueueing.
    pub fn consumer_message_id(&self) -> MessageId {
        self.message_id
    }

    /// Defers eligibility until `due`.
    pub fn due_at(mut self, due: DateTime<Utc>) -> Self {
        self.due_time_utc = Some(due);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::invalid_argument("topic must not be blank"));
        }
        if self.topic.len() > MAX_TOPIC_LEN {
            return Err(Error::invalid_argument(format!(
                "topic exceeds {MAX_TOPIC_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// PostgreSQL-backed outbox store.
pub struct OutboxStore {
    queue: WorkQueue<WorkItemId>,
    joins: Option<Arc<JoinStore>>,
    options: OutboxOptions,
}

impl OutboxStore {
    pub fn new(pool: PgPool, options: OutboxOptions) -> Result<Self> {
        Self::with_clock(pool, options, system_clock())
    }

    pub fn with_clock(pool: PgPool, options: OutboxOptions, clock: SharedClock) -> Result<Self> {
        options.validate()?;
        let spec = QueueSpec {
            schema: options.schema_name.clone(),
            table: options.table_name.clone(),
            id_column: "id",
            order_column: "created_at",
            claimable: &[STATUS_READY],
            terminal: &[STATUS_DONE, STATUS_FAILED],
            processed_at_column: "processed_at",
            has_retry_count: true,
            has_processed_flag: true,
            has_processed_by: true,
            has_last_error: true,
        };
        Ok(Self {
            queue: WorkQueue::new(pool, spec, clock),
            joins: None,
            options,
        })
    }

    /// Threads the join side table through ack/fail.
    pub fn with_joins(mut self, joins: Arc<JoinStore>) -> Self {
        self.joins = Some(joins);
        self
    }

    pub fn pool(&self) -> &PgPool {
        self.queue.pool()
    }

    pub fn options(&self) -> &OutboxOptions {
        &self.options
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        self.queue.clock()
    }

    // ------------------------------------------------------------------
    // enqueue
    // ------------------------------------------------------------------

    /// Inserts a ready message using the store's pool.
    pub async fn enqueue(&self, message: NewMessage) -> Result<WorkItemId> {
        let mut conn = self.pool().acquire().await?;
        self.enqueue_in(&mut conn, message).await
    }

    /// Inserts a ready message inside the caller's transaction, the heart
    /// of the outbox pattern: domain rows and the work item commit together.
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        message: NewMessage,
    ) -> Result<WorkItemId> {
        message.validate()?;
        let id = WorkItemId::random();
        let now = self.clock().now_utc();
        let qt = self.queue.spec().qualified();
        let sql = format!(
            r#"INSERT INTO {qt}
               (id, topic, payload, correlation_id, message_id, created_at, due_time_utc,
                status, is_processed, retry_count)
               VALUES ($1, $2, $3, $4, $5, $6, $7, {STATUS_READY}, FALSE, 0)"#
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(&message.correlation_id)
            .bind(message.message_id)
            .bind(now)
            .bind(message.due_time_utc)
            .execute(&mut *conn)
            .await?;
        debug!(%id, topic = %message.topic, "enqueued outbox message");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // work-queue surface
    // ------------------------------------------------------------------

    /// Claims up to `batch_size` due messages for `owner`, FIFO.
    pub async fn claim(
        &self,
        owner: OwnerToken,
        lease: std::time::Duration,
        batch_size: i64,
    ) -> Result<Vec<WorkItemId>> {
        self.queue.claim(owner, lease, batch_size).await
    }

    /// Acks still-owned in-progress messages and advances any joins their
    /// message ids are attached to, in one transaction.
    pub async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        let acked = self.queue.ack_in(&mut tx, owner, ids).await?;
        if let Some(joins) = &self.joins {
            let message_ids = self.message_ids_of(&mut tx, &acked).await?;
            joins
                .record_completed_for_messages_in(&mut tx, &message_ids)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns still-owned messages to `Ready` with a retry bump.
    pub async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.queue.abandon(owner, ids, last_error, due_time).await?;
        Ok(())
    }

    /// Terminally fails still-owned messages and advances any joins their
    /// message ids are attached to, in one transaction.
    pub async fn fail(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        processed_by: Option<&str>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        let failed = self
            .queue
            .fail_in(&mut tx, owner, ids, last_error, processed_by)
            .await?;
        if let Some(joins) = &self.joins {
            let message_ids = self.message_ids_of(&mut tx, &failed).await?;
            joins
                .record_failed_for_messages_in(&mut tx, &message_ids)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Extends the claim lease for still-owned in-progress messages.
    pub async fn extend(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        lease: std::time::Duration,
    ) -> Result<u64> {
        self.queue.extend(owner, ids, lease).await
    }

    /// Returns expired claims to `Ready`; reports the count.
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

    /// Loads messages by row id, FIFO ordered.
    pub async fn fetch(&self, ids: &[WorkItemId]) -> Result<Vec<OutboxMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let qt = self.queue.spec().qualified();
        let sql = format!(
            r#"SELECT id, topic, payload, correlation_id, message_id, created_at,
                      due_time_utc, processed_at, processed_by, status, is_processed,
                      locked_until, owner_token, retry_count, last_error
               FROM {qt}
               WHERE id = ANY($1)
               ORDER BY created_at ASC, id ASC"#
        );
        let messages = sqlx::query_as::<_, OutboxMessage>(&sql)
            .bind(ids)
            .fetch_all(self.pool())
            .await?;
        Ok(messages)
    }

    /// Loads one message by row id.
    pub async fn get(&self, id: WorkItemId) -> Result<Option<OutboxMessage>> {
        Ok(self.fetch(&[id]).await?.into_iter().next())
    }

    async fn message_ids_of(
        &self,
        conn: &mut PgConnection,
        ids: &[WorkItemId],
    ) -> Result<Vec<MessageId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let qt = self.queue.spec().qualified();
        let sql = format!(r#"SELECT message_id FROM {qt} WHERE id = ANY($1)"#);
        let message_ids = sqlx::query_scalar::<_, MessageId>(&sql)
            .bind(ids)
            .fetch_all(&mut *conn)
            .await?;
        Ok(message_ids)
    }
}
