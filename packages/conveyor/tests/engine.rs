//! Whole-engine flow: build, deploy, start the background services, and
//! watch a message travel enqueue → dispatch → handler → done without any
//! manual pumping.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor::{
    ConveyorBuilder, DispatchContext, NewMessage, OutboxHandler, OutboxMessage, WorkStatus,
};
use tokio_util::sync::CancellationToken;

use common::{tenant, test_db};

struct Recorder {
    handled: Arc<AtomicU32>,
}

#[async_trait]
impl OutboxHandler for Recorder {
    async fn handle(
        &self,
        _message: &OutboxMessage,
        _ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    probe()
}

#[tokio::test]
async fn started_engine_drains_the_outbox_in_the_background() {
    let db = test_db().await;
    let handled = Arc::new(AtomicU32::new(0));

    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .handler(
            "orders.sync",
            Arc::new(Recorder {
                handled: handled.clone(),
            }),
        )
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    let running = conveyor.start();
    let outbox = running.outboxes.get("t1").await.unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            outbox
                .enqueue(NewMessage::new("orders.sync", format!("{{\"n\":{n}}}")))
                .await
                .unwrap(),
        );
    }

    let all_handled = {
        let handled = handled.clone();
        move || handled.load(Ordering::SeqCst) >= 3
    };
    assert!(
        wait_until(all_handled, Duration::from_secs(15)).await,
        "dispatch loop did not drain the outbox in time"
    );

    for id in ids {
        let row = outbox.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, WorkStatus::Done);
        assert!(row.is_processed);
    }

    running.stop().await;
}

#[tokio::test]
async fn scheduler_service_feeds_the_dispatcher_end_to_end() {
    let db = test_db().await;
    let handled = Arc::new(AtomicU32::new(0));

    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .handler(
            "reminders.send",
            Arc::new(Recorder {
                handled: handled.clone(),
            }),
        )
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    let running = conveyor.start();
    let scheduler = running.schedulers.get("t1").await.unwrap();

    // Already due: the scheduler worker materializes it, the dispatcher
    // picks it up.
    let due = chrono::Utc::now() - chrono::Duration::seconds(1);
    scheduler
        .schedule_timer("reminders.send", "{\"to\":7}", due)
        .await
        .unwrap();

    let fired = {
        let handled = handled.clone();
        move || handled.load(Ordering::SeqCst) >= 1
    };
    assert!(
        wait_until(fired, Duration::from_secs(15)).await,
        "timer never reached the handler"
    );

    running.stop().await;
}

#[tokio::test]
async fn reaper_service_recovers_abandoned_claims() {
    let db = test_db().await;
    let handled = Arc::new(AtomicU32::new(0));

    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .handler(
            "orders.sync",
            Arc::new(Recorder {
                handled: handled.clone(),
            }),
        )
        .reap_interval(Duration::from_millis(200))
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    // Simulate a crashed worker before the services spin up: claim with a
    // one-second lease and walk away. The reaper must hand the row back to
    // the dispatch loop.
    let outbox = conveyor.outboxes.get("t1").await.unwrap();
    let id = outbox
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    let crashed = conveyor::OwnerToken::random();
    let claimed = outbox
        .claim(crashed, Duration::from_secs(1), 10)
        .await
        .unwrap();
    assert_eq!(claimed, vec![id]);

    let running = conveyor.start();

    let recovered = {
        let handled = handled.clone();
        move || handled.load(Ordering::SeqCst) >= 1
    };
    assert!(
        wait_until(recovered, Duration::from_secs(20)).await,
        "reaper never returned the expired claim"
    );
    assert_eq!(
        outbox.get(id).await.unwrap().unwrap().status,
        WorkStatus::Done
    );

    running.stop().await;
}

#[tokio::test]
async fn cleanup_service_sweeps_terminal_rows() {
    let db = test_db().await;
    let mut config = tenant("t1", &db);
    // Tiny retention so the sweep fires within the test.
    config.outbox.retention_period = Duration::from_millis(1);

    let conveyor = ConveyorBuilder::new()
        .tenant(config)
        .cleanup_tick(Duration::from_millis(200))
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    // Terminal row first, then start the services.
    let outbox = conveyor.outboxes.get("t1").await.unwrap();
    let id = outbox
        .enqueue(NewMessage::new("orders.done", "{}"))
        .await
        .unwrap();
    let owner = conveyor::OwnerToken::random();
    let claimed = outbox.claim(owner, Duration::from_secs(30), 10).await.unwrap();
    outbox.ack(owner, &claimed).await.unwrap();
    assert_eq!(
        outbox.get(id).await.unwrap().unwrap().status,
        WorkStatus::Done
    );

    let running = conveyor.start();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let mut gone = false;
    while tokio::time::Instant::now() < deadline {
        if outbox.get(id).await.unwrap().is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "cleanup never swept the terminal row");

    running.stop().await;
}

#[tokio::test]
async fn stop_is_prompt_and_idempotent_under_load() {
    let db = test_db().await;
    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    let running = conveyor.start();
    let token = running.shutdown_token();
    assert!(!token.is_cancelled());

    // Stopping with nothing in flight returns quickly.
    tokio::time::timeout(Duration::from_secs(10), running.stop())
        .await
        .expect("graceful stop timed out");
    assert!(token.is_cancelled());
}
