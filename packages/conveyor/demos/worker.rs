//! Minimal worker process: wire one tenant, deploy schemas, register a
//! handler, and run the background services until Ctrl-C.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/app cargo run --example worker
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor::{
    ConveyorBuilder, DispatchContext, DispatcherOptions, JoinWaitPayload, NewMessage,
    OutboxHandler, OutboxMessage, TenantConfig, JOIN_WAIT_TOPIC,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct SendReminder;

#[async_trait]
impl OutboxHandler for SendReminder {
    async fn handle(
        &self,
        message: &OutboxMessage,
        ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        info!(
            tenant = %ctx.store_identifier,
            id = %message.id,
            payload = %message.payload,
            "sending reminder"
        );
        Ok(())
    }
}

struct RunReport;

#[async_trait]
impl OutboxHandler for RunReport {
    async fn handle(
        &self,
        message: &OutboxMessage,
        _ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        info!(id = %message.id, "all extract steps finished, running report");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/app".to_string());

    let conveyor = ConveyorBuilder::new()
        .tenant(TenantConfig::new("demo", database_url))
        .handler("reminders.send", Arc::new(SendReminder))
        .handler("reports.run", Arc::new(RunReport))
        .dispatcher_options(DispatcherOptions {
            max_attempts: 5,
            ..Default::default()
        })
        .build()?;
    conveyor.deploy_schemas().await?;

    // Seed some work: two sibling messages joined into one follow-up.
    let outbox = conveyor.outboxes.get("demo").await?;
    let joins = conveyor.joins.get("demo").await?;
    let scheduler = conveyor.schedulers.get("demo").await?;

    let join = joins.create_join(1, 2, None).await?;
    for step in ["accounts", "invoices"] {
        let message = NewMessage::new("reminders.send", format!("{{\"step\":\"{step}\"}}"));
        joins
            .attach_message(join.join_id, message.consumer_message_id())
            .await?;
        let enqueued = outbox.enqueue(message).await?;
        info!(%enqueued, step, "enqueued extract step");
    }
    let wait = JoinWaitPayload::new(join.join_id).on_complete("reports.run", None);
    outbox
        .enqueue(NewMessage::new(
            JOIN_WAIT_TOPIC,
            serde_json::to_string(&wait)?,
        ))
        .await?;

    // And a timer a few seconds out.
    scheduler
        .schedule_timer(
            "reminders.send",
            "{\"step\":\"follow-up\"}",
            chrono::Utc::now() + chrono::Duration::seconds(5),
        )
        .await?;

    let running = conveyor.start();
    info!("worker running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    running.stop().await;
    Ok(())
}
