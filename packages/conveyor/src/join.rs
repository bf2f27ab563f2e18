//! Join coordinator: aggregates completion of N sibling outbox messages.
//!
//! A join declares how many steps it expects, members attach by outbox
//! message id, and the outbox ack/fail path advances the counters in the same
//! transaction as the terminal transition. Each member contributes to at most
//! one counter at most once, so re-delivery and duplicate acks cannot
//! over-count. The `join.wait` outbox handler turns a ready join into its
//! terminal status and optionally emits a follow-up message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{system_clock, SharedClock};
use crate::config::JoinOptions;
use crate::dispatch::{DispatchContext, OutboxHandler};
use crate::error::{Error, Result};
use crate::id::{JoinId, MessageId};
use crate::outbox::{NewMessage, OutboxMessage, OutboxStore};
use crate::router::{JoinRouter, OutboxRouter};

/// Topic the dispatcher routes to [`JoinWaitHandler`].
pub const JOIN_WAIT_TOPIC: &str = "join.wait";

/// Terminal-or-pending state of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[repr(i16)]
pub enum JoinStatus {
    #[default]
    Pending = 0,
    Completed = 1,
    Failed = 2,
}

/// Snapshot of one join aggregate.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Join {
    pub join_id: JoinId,
    pub tenant_id: i64,
    pub expected_steps: i32,
    /// Clamped so it never exceeds `expected_steps`.
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: JoinStatus,
    pub created_utc: DateTime<Utc>,
    pub last_updated_utc: DateTime<Utc>,
    pub metadata: Option<String>,
}

impl Join {
    /// True once every expected step is accounted for, completed or failed.
    ///
    /// The wait handler gates on this rather than on completions alone: a
    /// join with a failed member could otherwise never resolve.
    pub fn is_settled(&self) -> bool {
        self.completed_steps + self.failed_steps >= self.expected_steps
    }
}

/// PostgreSQL-backed join coordinator.
pub struct JoinStore {
    pool: PgPool,
    joins: String,
    members: String,
    clock: SharedClock,
}

impl JoinStore {
    pub fn new(pool: PgPool, options: JoinOptions) -> Result<Self> {
        Self::with_clock(pool, options, system_clock())
    }

    pub fn with_clock(pool: PgPool, options: JoinOptions, clock: SharedClock) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            pool,
            joins: format!("\"{}\".\"{}\"", options.schema_name, options.joins_table),
            members: format!("\"{}\".\"{}\"", options.schema_name, options.members_table),
            clock,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Creates a pending join expecting `expected_steps` completions.
    pub async fn create_join(
        &self,
        tenant_id: i64,
        expected_steps: i32,
        metadata: Option<String>,
    ) -> Result<Join> {
        if expected_steps < 0 {
            return Err(Error::invalid_argument(format!(
                "expected_steps must be >= 0, got {expected_steps}"
            )));
        }
        let now = self.clock.now_utc();
        let sql = format!(
            r#"INSERT INTO {joins}
               (join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                status, created_utc, last_updated_utc, metadata)
               VALUES ($1, $2, $3, 0, 0, 0, $4, $4, $5)
               RETURNING join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                         status, created_utc, last_updated_utc, metadata"#,
            joins = self.joins
        );
        let join = sqlx::query_as::<_, Join>(&sql)
            .bind(JoinId::random())
            .bind(tenant_id)
            .bind(expected_steps)
            .bind(now)
            .bind(metadata)
            .fetch_one(&self.pool)
            .await?;
        debug!(join_id = %join.join_id, expected_steps, "created join");
        Ok(join)
    }

    /// Attaches an outbox message as a member. Idempotent.
    pub async fn attach_message(&self, join_id: JoinId, message_id: MessageId) -> Result<()> {
        let sql = format!(
            r#"INSERT INTO {members}
               (join_id, outbox_message_id, completed_counted, failed_counted)
               VALUES ($1, $2, FALSE, FALSE)
               ON CONFLICT (join_id, outbox_message_id) DO NOTHING"#,
            members = self.members
        );
        sqlx::query(&sql)
            .bind(join_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // counters
    // ------------------------------------------------------------------

    /// Counts the member toward `completed_steps` if it has not been counted
    /// either way yet, clamped to `expected_steps`. Returns the fresh join.
    pub async fn increment_completed(&self, join_id: JoinId, message_id: MessageId) -> Result<Join> {
        self.increment(join_id, message_id, Outcome::Completed).await
    }

    /// Counts the member toward `failed_steps`, symmetric to
    /// [`increment_completed`](Self::increment_completed).
    pub async fn increment_failed(&self, join_id: JoinId, message_id: MessageId) -> Result<Join> {
        self.increment(join_id, message_id, Outcome::Failed).await
    }

    async fn increment(
        &self,
        join_id: JoinId,
        message_id: MessageId,
        outcome: Outcome,
    ) -> Result<Join> {
        let mut tx = self.pool.begin().await?;
        let mark = format!(
            r#"UPDATE {members}
               SET {counted} = TRUE
               WHERE join_id = $1 AND outbox_message_id = $2
                 AND NOT completed_counted AND NOT failed_counted"#,
            members = self.members,
            counted = outcome.member_column(),
        );
        let marked = sqlx::query(&mark)
            .bind(join_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if marked > 0 {
            self.bump_counter_in(&mut tx, join_id, outcome, marked as i32)
                .await?;
        }
        let join = self
            .get_join_in(&mut tx, join_id)
            .await?
            .ok_or_else(|| Error::NotFound(join_id.to_string()))?;
        tx.commit().await?;
        Ok(join)
    }

    async fn bump_counter_in(
        &self,
        conn: &mut PgConnection,
        join_id: JoinId,
        outcome: Outcome,
        by: i32,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        let sql = match outcome {
            Outcome::Completed => format!(
                r#"UPDATE {joins}
                   SET completed_steps = LEAST(completed_steps + $2, expected_steps),
                       last_updated_utc = $3
                   WHERE join_id = $1"#,
                joins = self.joins
            ),
            Outcome::Failed => format!(
                r#"UPDATE {joins}
                   SET failed_steps = LEAST(failed_steps + $2,
                                            GREATEST(expected_steps - completed_steps, 0)),
                       last_updated_utc = $3
                   WHERE join_id = $1"#,
                joins = self.joins
            ),
        };
        sqlx::query(&sql)
            .bind(join_id)
            .bind(by)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Advances counters for every not-yet-counted member among
    /// `message_ids`. Called from the outbox ack path inside its transaction.
    pub(crate) async fn record_completed_for_messages_in(
        &self,
        conn: &mut PgConnection,
        message_ids: &[MessageId],
    ) -> Result<()> {
        self.record_for_messages_in(conn, message_ids, Outcome::Completed)
            .await
    }

    /// Fail-path sibling of
    /// [`record_completed_for_messages_in`](Self::record_completed_for_messages_in).
    pub(crate) async fn record_failed_for_messages_in(
        &self,
        conn: &mut PgConnection,
        message_ids: &[MessageId],
    ) -> Result<()> {
        self.record_for_messages_in(conn, message_ids, Outcome::Failed)
            .await
    }

    async fn record_for_messages_in(
        &self,
        conn: &mut PgConnection,
        message_ids: &[MessageId],
        outcome: Outcome,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_utc();
        let counter = match outcome {
            Outcome::Completed => {
                "completed_steps = LEAST(j.completed_steps + m.hits, j.expected_steps)"
            }
            Outcome::Failed => {
                "failed_steps = LEAST(j.failed_steps + m.hits, \
                 GREATEST(j.expected_steps - j.completed_steps, 0))"
            }
        };
        let sql = format!(
            r#"WITH marked AS (
                   UPDATE {members}
                   SET {counted} = TRUE
                   WHERE outbox_message_id = ANY($1)
                     AND NOT completed_counted AND NOT failed_counted
                   RETURNING join_id
               )
               UPDATE {joins} AS j
               SET {counter}, last_updated_utc = $2
               FROM (SELECT join_id, COUNT(*) AS hits FROM marked GROUP BY join_id) AS m
               WHERE j.join_id = m.join_id"#,
            members = self.members,
            joins = self.joins,
            counted = outcome.member_column(),
        );
        sqlx::query(&sql)
            .bind(message_ids)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // status
    // ------------------------------------------------------------------

    /// Applies a terminal status. Pending→Completed and Pending→Failed are
    /// the allowed transitions; re-applying the same terminal status is a
    /// no-op, and a conflicting terminal transition changes nothing.
    pub async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()> {
        if status == JoinStatus::Pending {
            return Err(Error::invalid_argument(
                "a join cannot transition back to Pending",
            ));
        }
        let now = self.clock.now_utc();
        let sql = format!(
            r#"UPDATE {joins}
               SET status = $2, last_updated_utc = $3
               WHERE join_id = $1 AND (status = 0 OR status = $2)"#,
            joins = self.joins
        );
        sqlx::query(&sql)
            .bind(join_id)
            .bind(status)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    pub async fn get_join(&self, join_id: JoinId) -> Result<Option<Join>> {
        let mut conn = self.pool.acquire().await?;
        self.get_join_in(&mut conn, join_id).await
    }

    async fn get_join_in(
        &self,
        conn: &mut PgConnection,
        join_id: JoinId,
    ) -> Result<Option<Join>> {
        let sql = format!(
            r#"SELECT join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                      status, created_utc, last_updated_utc, metadata
               FROM {joins}
               WHERE join_id = $1"#,
            joins = self.joins
        );
        let join = sqlx::query_as::<_, Join>(&sql)
            .bind(join_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(join)
    }

    /// Message ids attached to a join.
    pub async fn get_join_messages(&self, join_id: JoinId) -> Result<Vec<MessageId>> {
        let sql = format!(
            r#"SELECT outbox_message_id FROM {members} WHERE join_id = $1
               ORDER BY outbox_message_id"#,
            members = self.members
        );
        let ids = sqlx::query_scalar::<_, MessageId>(&sql)
            .bind(join_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    fn member_column(self) -> &'static str {
        match self {
            Outcome::Completed => "completed_counted",
            Outcome::Failed => "failed_counted",
        }
    }
}

// ============================================================================
// join.wait handler
// ============================================================================

/// Payload of a `join.wait` outbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitPayload {
    pub join_id: JoinId,
    /// When true, any failed step fails the whole join.
    #[serde(default)]
    pub fail_if_any_step_failed: bool,
    /// Follow-up message emitted when the join completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_payload: Option<String>,
}

impl JoinWaitPayload {
    pub fn new(join_id: JoinId) -> Self {
        Self {
            join_id,
            fail_if_any_step_failed: false,
            on_complete_topic: None,
            on_complete_payload: None,
        }
    }

    pub fn fail_if_any_step_failed(mut self) -> Self {
        self.fail_if_any_step_failed = true;
        self
    }

    pub fn on_complete(mut self, topic: impl Into<String>, payload: Option<String>) -> Self {
        self.on_complete_topic = Some(topic.into());
        self.on_complete_payload = payload;
        self
    }
}

enum JoinWiring {
    /// Single-tenant: the stores are known up front.
    Direct {
        joins: Arc<JoinStore>,
        outbox: Arc<OutboxStore>,
    },
    /// Multi-tenant: stores are resolved per message from the dispatch
    /// context's store identifier.
    Routed {
        joins: JoinRouter,
        outboxes: OutboxRouter,
    },
}

/// Outbox handler for [`JOIN_WAIT_TOPIC`].
///
/// Raises [`Error::JoinNotReady`] while steps are outstanding so the
/// dispatcher abandons the message with backoff; once every expected step is
/// in, drives the join to its terminal status and emits the follow-up.
/// Invocations against an already-terminal join are no-ops.
pub struct JoinWaitHandler {
    wiring: JoinWiring,
}

impl JoinWaitHandler {
    pub fn new(joins: Arc<JoinStore>, outbox: Arc<OutboxStore>) -> Self {
        Self {
            wiring: JoinWiring::Direct { joins, outbox },
        }
    }

    /// Tenant-aware wiring: resolves the join and outbox stores of whichever
    /// tenant the message was claimed from.
    pub fn routed(joins: JoinRouter, outboxes: OutboxRouter) -> Self {
        Self {
            wiring: JoinWiring::Routed { joins, outboxes },
        }
    }

    async fn resolve(&self, ctx: &DispatchContext) -> Result<(Arc<JoinStore>, Arc<OutboxStore>)> {
        match &self.wiring {
            JoinWiring::Direct { joins, outbox } => Ok((joins.clone(), outbox.clone())),
            JoinWiring::Routed { joins, outboxes } => Ok((
                joins.get(&ctx.store_identifier).await?,
                outboxes.get(&ctx.store_identifier).await?,
            )),
        }
    }
}

#[async_trait]
impl OutboxHandler for JoinWaitHandler {
    async fn handle(
        &self,
        message: &OutboxMessage,
        ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let wait: JoinWaitPayload = serde_json::from_str(&message.payload)?;
        let (join_store, outbox) = self.resolve(ctx).await?;
        let join = join_store
            .get_join(wait.join_id)
            .await?
            .ok_or(Error::NotFound(wait.join_id.to_string()))?;

        if join.status != JoinStatus::Pending {
            return Ok(());
        }
        if !join.is_settled() {
            return Err(Error::JoinNotReady(join.join_id).into());
        }

        let terminal = if wait.fail_if_any_step_failed && join.failed_steps > 0 {
            JoinStatus::Failed
        } else {
            JoinStatus::Completed
        };
        join_store.update_status(join.join_id, terminal).await?;
        info!(join_id = %join.join_id, ?terminal, "join reached terminal status");

        if terminal == JoinStatus::Completed {
            if let Some(topic) = wait.on_complete_topic {
                let mut follow_up =
                    NewMessage::new(topic, wait.on_complete_payload.unwrap_or_default());
                if let Some(correlation_id) = &message.correlation_id {
                    follow_up = follow_up.correlation_id(correlation_id.clone());
                }
                outbox.enqueue(follow_up).await?;
            }
        }
        Ok(())
    }
}
