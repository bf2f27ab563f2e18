//! Idempotent schema deployment.
//!
//! Every statement is `CREATE … IF NOT EXISTS` under the configured schema
//! and table names, so deployment can run on every startup. Nothing here is
//! a migration system: changing a column requires operator action.

use sqlx::PgPool;
use tracing::info;

use crate::config::{
    InboxOptions, JoinOptions, LeaseOptions, OutboxOptions, SchedulerOptions, TenantConfig,
};
use crate::error::Result;

async fn execute_all(pool: &PgPool, statements: &[String]) -> Result<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\"")
}

/// Deploys the outbox table and its claim indexes.
pub async fn deploy_outbox(pool: &PgPool, options: &OutboxOptions) -> Result<()> {
    options.validate()?;
    let schema = &options.schema_name;
    let table = &options.table_name;
    let qt = format!("\"{schema}\".\"{table}\"");
    let statements = vec![
        create_schema(schema),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {qt} (
                id UUID PRIMARY KEY,
                topic VARCHAR(255) NOT NULL,
                payload TEXT NOT NULL,
                correlation_id TEXT,
                message_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                due_time_utc TIMESTAMPTZ,
                processed_at TIMESTAMPTZ,
                processed_by TEXT,
                status SMALLINT NOT NULL DEFAULT 0,
                is_processed BOOLEAN NOT NULL DEFAULT FALSE,
                locked_until TIMESTAMPTZ,
                owner_token UUID,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_ready_idx"
               ON {qt} (created_at) WHERE status = 0"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_lease_idx"
               ON {qt} (locked_until) WHERE status = 1"#
        ),
        format!(r#"CREATE INDEX IF NOT EXISTS "{table}_message_idx" ON {qt} (message_id)"#),
    ];
    execute_all(pool, &statements).await?;
    info!(schema, table, "outbox schema deployed");
    Ok(())
}

/// Deploys the inbox table and its claim indexes.
pub async fn deploy_inbox(pool: &PgPool, options: &InboxOptions) -> Result<()> {
    options.validate()?;
    let schema = &options.schema_name;
    let table = &options.table_name;
    let qt = format!("\"{schema}\".\"{table}\"");
    let statements = vec![
        create_schema(schema),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {qt} (
                message_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                hash BYTEA,
                first_seen_utc TIMESTAMPTZ NOT NULL,
                last_seen_utc TIMESTAMPTZ NOT NULL,
                processed_utc TIMESTAMPTZ,
                attempts INTEGER NOT NULL DEFAULT 0,
                status SMALLINT NOT NULL DEFAULT 0,
                topic TEXT,
                payload TEXT,
                due_time_utc TIMESTAMPTZ,
                locked_until TIMESTAMPTZ,
                owner_token UUID
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_ready_idx"
               ON {qt} (first_seen_utc) WHERE status IN (0, 1)"#
        ),
    ];
    execute_all(pool, &statements).await?;
    info!(schema, table, "inbox schema deployed");
    Ok(())
}

/// Deploys the lease (distributed lock) table.
pub async fn deploy_lease(pool: &PgPool, options: &LeaseOptions) -> Result<()> {
    options.validate()?;
    let schema = &options.schema_name;
    let table = &options.table_name;
    let qt = format!("\"{schema}\".\"{table}\"");
    let statements = vec![
        create_schema(schema),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {qt} (
                resource_name TEXT PRIMARY KEY,
                owner_token UUID,
                lease_until_utc TIMESTAMPTZ,
                fencing_token BIGINT NOT NULL DEFAULT 0
            )"#
        ),
    ];
    execute_all(pool, &statements).await?;
    info!(schema, table, "lease schema deployed");
    Ok(())
}

/// Deploys the join and join-member tables.
pub async fn deploy_join(pool: &PgPool, options: &JoinOptions) -> Result<()> {
    options.validate()?;
    let schema = &options.schema_name;
    let joins = &options.joins_table;
    let members = &options.members_table;
    let joins_qt = format!("\"{schema}\".\"{joins}\"");
    let members_qt = format!("\"{schema}\".\"{members}\"");
    let statements = vec![
        create_schema(schema),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {joins_qt} (
                join_id UUID PRIMARY KEY,
                tenant_id BIGINT NOT NULL,
                expected_steps INTEGER NOT NULL,
                completed_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps INTEGER NOT NULL DEFAULT 0,
                status SMALLINT NOT NULL DEFAULT 0,
                created_utc TIMESTAMPTZ NOT NULL,
                last_updated_utc TIMESTAMPTZ NOT NULL,
                metadata TEXT
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {members_qt} (
                join_id UUID NOT NULL,
                outbox_message_id UUID NOT NULL,
                completed_counted BOOLEAN NOT NULL DEFAULT FALSE,
                failed_counted BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (join_id, outbox_message_id)
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{members}_message_idx"
               ON {members_qt} (outbox_message_id)"#
        ),
    ];
    execute_all(pool, &statements).await?;
    info!(schema, joins, members, "join schema deployed");
    Ok(())
}

/// Deploys the scheduler tables (jobs, job runs, timers).
pub async fn deploy_scheduler(pool: &PgPool, options: &SchedulerOptions) -> Result<()> {
    options.validate()?;
    let schema = &options.schema_name;
    let jobs = &options.jobs_table;
    let runs = &options.job_runs_table;
    let timers = &options.timers_table;
    let jobs_qt = format!("\"{schema}\".\"{jobs}\"");
    let runs_qt = format!("\"{schema}\".\"{runs}\"");
    let timers_qt = format!("\"{schema}\".\"{timers}\"");
    let statements = vec![
        create_schema(schema),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {jobs_qt} (
                job_name TEXT PRIMARY KEY,
                topic VARCHAR(255) NOT NULL,
                cron_schedule TEXT NOT NULL,
                payload TEXT,
                next_due_time TIMESTAMPTZ,
                last_run_time TIMESTAMPTZ,
                last_run_status TEXT,
                is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{jobs}_due_idx"
               ON {jobs_qt} (next_due_time) WHERE is_enabled"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {runs_qt} (
                id UUID PRIMARY KEY,
                job_name TEXT NOT NULL,
                topic VARCHAR(255) NOT NULL,
                payload TEXT,
                due_time_utc TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                status SMALLINT NOT NULL DEFAULT 0,
                locked_until TIMESTAMPTZ,
                owner_token UUID,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                processed_at TIMESTAMPTZ
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{runs}_due_idx"
               ON {runs_qt} (due_time_utc) WHERE status = 0"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {timers_qt} (
                id UUID PRIMARY KEY,
                topic VARCHAR(255) NOT NULL,
                payload TEXT NOT NULL,
                due_time_utc TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                status SMALLINT NOT NULL DEFAULT 0,
                locked_until TIMESTAMPTZ,
                owner_token UUID,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                processed_at TIMESTAMPTZ
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "{timers}_due_idx"
               ON {timers_qt} (due_time_utc) WHERE status = 0"#
        ),
    ];
    execute_all(pool, &statements).await?;
    info!(schema, jobs, runs, timers, "scheduler schema deployed");
    Ok(())
}

/// Deploys every table family a tenant config enables deployment for.
pub async fn deploy_tenant(pool: &PgPool, config: &TenantConfig) -> Result<()> {
    config.validate()?;
    if config.outbox.enable_schema_deployment {
        deploy_outbox(pool, &config.outbox).await?;
    }
    if config.inbox.enable_schema_deployment {
        deploy_inbox(pool, &config.inbox).await?;
    }
    if config.lease.enable_schema_deployment {
        deploy_lease(pool, &config.lease).await?;
    }
    if config.join.enable_schema_deployment {
        deploy_join(pool, &config.join).await?;
    }
    if config.scheduler.enable_schema_deployment {
        deploy_scheduler(pool, &config.scheduler).await?;
    }
    Ok(())
}
