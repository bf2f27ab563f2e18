//! End-to-end dispatcher behavior through the builder: retry/backoff,
//! exhaustion, missing handlers, and lease-gated exclusivity.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use conveyor::{
    Clock, ConveyorBuilder, DispatchContext, DispatcherOptions, NewMessage, OutboxHandler,
    OutboxMessage, WorkItemId, WorkStatus,
};
use tokio_util::sync::CancellationToken;

use common::{manual_clock, tenant, test_db};

struct FailingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl OutboxHandler for FailingHandler {
    async fn handle(
        &self,
        _message: &OutboxMessage,
        _ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("downstream unavailable")
    }
}

struct CountingHandler {
    seen: Arc<Mutex<HashMap<WorkItemId, u32>>>,
}

#[async_trait]
impl OutboxHandler for CountingHandler {
    async fn handle(
        &self,
        message: &OutboxMessage,
        _ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        *self
            .seen
            .lock()
            .unwrap()
            .entry(message.id)
            .or_insert(0) += 1;
        Ok(())
    }
}

#[tokio::test]
async fn failing_handler_backs_off_then_exhausts() {
    let db = test_db().await;
    let (clock, shared) = manual_clock();
    let calls = Arc::new(AtomicU32::new(0));

    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .clock(shared)
        .handler(
            "T",
            Arc::new(FailingHandler {
                calls: calls.clone(),
            }),
        )
        .dispatcher_options(DispatcherOptions {
            max_attempts: 3,
            ..Default::default()
        })
        .without_lease_gating()
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    let outbox = conveyor.outboxes.get("t1").await.unwrap();
    let id = outbox
        .enqueue(NewMessage::new("T", "{}"))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    // Attempt 1: abandoned with backoff in [500ms, 750ms).
    let before = clock.now_utc();
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let row = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.retry_count, 1);
    let due = row.due_time_utc.expect("retry must set a due time");
    let delay = due - before;
    assert!(delay >= ChronoDuration::milliseconds(500), "{delay}");
    assert!(delay < ChronoDuration::milliseconds(750), "{delay}");
    assert!(row
        .last_error
        .as_deref()
        .unwrap()
        .contains("downstream unavailable"));

    // Not yet due: the next pass sees nothing.
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 0);

    // Attempt 2.
    clock.advance(ChronoDuration::seconds(2));
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 1);
    assert_eq!(
        outbox.get(id).await.unwrap().unwrap().retry_count,
        2
    );

    // Attempt 3 exhausts max_attempts and fails terminally.
    clock.advance(ChronoDuration::seconds(5));
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 1);
    let row = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Terminal: later passes leave it alone.
    clock.advance(ChronoDuration::seconds(5));
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn unhandled_topic_fails_terminally() {
    let db = test_db().await;
    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .without_lease_gating()
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    let outbox = conveyor.outboxes.get("t1").await.unwrap();
    let id = outbox
        .enqueue(NewMessage::new("nobody.listens", "{}"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 1);

    let row = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Failed);
    assert_eq!(
        row.last_error.as_deref(),
        Some("No handler registered for topic 'nobody.listens'")
    );
    assert!(row.processed_by.is_some());
}

#[tokio::test]
async fn successful_handler_acks_the_batch() {
    let db = test_db().await;
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .handler("orders.sync", Arc::new(CountingHandler { seen: seen.clone() }))
        .without_lease_gating()
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    let outbox = conveyor.outboxes.get("t1").await.unwrap();
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            outbox
                .enqueue(NewMessage::new("orders.sync", format!("{{\"n\":{n}}}")))
                .await
                .unwrap(),
        );
    }

    let cancel = CancellationToken::new();
    assert_eq!(conveyor.dispatcher.run_once(10, &cancel).await.unwrap(), 5);

    for id in ids {
        assert_eq!(
            outbox.get(id).await.unwrap().unwrap().status,
            WorkStatus::Done
        );
    }
    assert!(seen.lock().unwrap().values().all(|&count| count == 1));
}

#[tokio::test]
async fn injected_backoff_and_strategy_are_respected() {
    use conveyor::{Dispatcher, HandlerResolver, SelectionStrategy};

    let db = test_db().await;
    let (clock, shared) = manual_clock();
    let calls = Arc::new(AtomicU32::new(0));

    let conveyor = ConveyorBuilder::new()
        .tenant(tenant("t1", &db))
        .tenant(tenant("t2", &db).with_schema("control"))
        .clock(shared.clone())
        .without_lease_gating()
        .build()
        .unwrap();
    conveyor.deploy_schemas().await.unwrap();

    // Pin every pass to the second tenant and retry with zero delay.
    struct Second;
    impl SelectionStrategy for Second {
        fn next(&self, store_count: usize) -> Option<usize> {
            (store_count > 1).then_some(1)
        }
    }
    let resolver = HandlerResolver::builder()
        .register(
            "T",
            Arc::new(FailingHandler {
                calls: calls.clone(),
            }),
        )
        .build();
    let dispatcher = Dispatcher::new(
        conveyor.outboxes.provider().clone(),
        Arc::new(resolver),
    )
    .with_strategy(Arc::new(Second))
    .with_backoff(Arc::new(|_attempt| Duration::ZERO))
    .with_clock(shared);

    let pinned = conveyor.outboxes.get("t2").await.unwrap();
    let skipped = conveyor.outboxes.get("t1").await.unwrap();
    let pinned_id = pinned.enqueue(NewMessage::new("T", "{}")).await.unwrap();
    let skipped_id = skipped.enqueue(NewMessage::new("T", "{}")).await.unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(dispatcher.run_once(10, &cancel).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Zero backoff means the retry is due immediately.
    let row = pinned.get(pinned_id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.due_time_utc, Some(clock.now_utc()));

    // The first tenant's row was never touched by the pinned strategy.
    let untouched = skipped.get(skipped_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, WorkStatus::Ready);
    assert_eq!(untouched.retry_count, 0);

    assert_eq!(dispatcher.run_once(10, &cancel).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lease_gated_dispatchers_never_double_process() {
    let db = test_db().await;
    let seen = Arc::new(Mutex::new(HashMap::new()));

    // Two independently built engines over the same database, as two
    // processes would be.
    let build = |seen: Arc<Mutex<HashMap<WorkItemId, u32>>>| {
        ConveyorBuilder::new()
            .tenant(tenant("t1", &db))
            .handler("orders.sync", Arc::new(CountingHandler { seen }))
            .build()
            .unwrap()
    };
    let first = build(seen.clone());
    let second = build(seen.clone());
    first.deploy_schemas().await.unwrap();

    let outbox = first.outboxes.get("t1").await.unwrap();
    for n in 0..10 {
        outbox
            .enqueue(NewMessage::new("orders.sync", format!("{{\"n\":{n}}}")))
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let mut processed = 0usize;
    for _ in 0..20 {
        let (a, b) = tokio::join!(
            first.dispatcher.run_once(10, &cancel),
            second.dispatcher.run_once(10, &cancel)
        );
        processed += a.unwrap() + b.unwrap();
        if processed >= 10 {
            break;
        }
    }

    assert_eq!(processed, 10);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    assert!(
        seen.values().all(|&count| count == 1),
        "a message was processed twice: {seen:?}"
    );
}
