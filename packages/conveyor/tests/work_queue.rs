//! Work-queue state machine against real Postgres: claims, fencing,
//! abandonment, reaping, and terminal absorption.

mod common;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use conveyor::schema;
use conveyor::{Clock, Error, NewMessage, OutboxOptions, OutboxStore, OwnerToken, WorkStatus};

use common::{manual_clock, test_db};

const LEASE: Duration = Duration::from_secs(30);

async fn outbox_store() -> (common::TestDb, conveyor::ManualClock, OutboxStore) {
    let db = test_db().await;
    let options = OutboxOptions::default();
    schema::deploy_outbox(&db.pool, &options).await.unwrap();
    let (clock, shared) = manual_clock();
    let store = OutboxStore::with_clock(db.pool.clone(), options, shared).unwrap();
    (db, clock, store)
}

#[tokio::test]
async fn enqueue_claim_ack_roundtrip() {
    let (_db, _clock, store) = outbox_store().await;
    let owner = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{\"n\":1}"))
        .await
        .unwrap();

    let claimed = store.claim(owner, LEASE, 10).await.unwrap();
    assert_eq!(claimed, vec![id]);

    let in_flight = store.get(id).await.unwrap().unwrap();
    assert_eq!(in_flight.status, WorkStatus::InProgress);
    assert_eq!(in_flight.owner_token, Some(owner));
    assert!(in_flight.locked_until.is_some());

    store.ack(owner, &claimed).await.unwrap();
    let done = store.get(id).await.unwrap().unwrap();
    assert_eq!(done.status, WorkStatus::Done);
    assert!(done.is_processed);
    assert!(done.processed_at.is_some());
    assert!(done.owner_token.is_none());
    assert!(done.locked_until.is_none());

    // Double ack is a silent no-op.
    store.ack(owner, &claimed).await.unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        WorkStatus::Done
    );
}

#[tokio::test]
async fn concurrent_claims_are_disjoint_and_fifo() {
    let (_db, clock, store) = outbox_store().await;

    let mut ids = Vec::new();
    for n in 0..10 {
        ids.push(
            store
                .enqueue(NewMessage::new("orders.sync", format!("{{\"n\":{n}}}")))
                .await
                .unwrap(),
        );
        clock.advance(ChronoDuration::milliseconds(1));
    }

    let a = OwnerToken::random();
    let b = OwnerToken::random();
    let (first, second) = tokio::join!(store.claim(a, LEASE, 5), store.claim(b, LEASE, 5));
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.len() + second.len(), 10);
    for id in &first {
        assert!(!second.contains(id), "claim sets overlap on {id}");
    }

    let mut union: Vec<_> = first.iter().chain(second.iter()).copied().collect();
    union.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(union, expected);

    // Each claimer's batch respects enqueue order.
    for batch in [&first, &second] {
        let positions: Vec<_> = batch
            .iter()
            .map(|id| ids.iter().position(|x| x == id).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted, "claim batch out of FIFO order");
    }
}

#[tokio::test]
async fn zero_batch_size_is_invalid_argument() {
    let (_db, _clock, store) = outbox_store().await;
    let err = store
        .claim(OwnerToken::random(), LEASE, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
}

#[tokio::test]
async fn non_owner_mutations_are_no_ops() {
    let (_db, _clock, store) = outbox_store().await;
    let owner = OwnerToken::random();
    let intruder = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store.claim(owner, LEASE, 1).await.unwrap();

    store.ack(intruder, &[id]).await.unwrap();
    store.fail(intruder, &[id], Some("nope"), None).await.unwrap();
    store
        .abandon(intruder, &[id], Some("nope"), None)
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::InProgress);
    assert_eq!(row.owner_token, Some(owner));
    assert_eq!(row.retry_count, 0);
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn abandon_returns_row_for_reclaim() {
    let (_db, _clock, store) = outbox_store().await;
    let owner = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store.claim(owner, LEASE, 1).await.unwrap();
    store
        .abandon(owner, &[id], Some("connection reset"), None)
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("connection reset"));

    let next_owner = OwnerToken::random();
    let reclaimed = store.claim(next_owner, LEASE, 10).await.unwrap();
    assert_eq!(reclaimed, vec![id]);
}

#[tokio::test]
async fn future_due_time_gates_eligibility() {
    let (_db, clock, store) = outbox_store().await;
    let due = clock.now_utc() + ChronoDuration::hours(1);
    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}").due_at(due))
        .await
        .unwrap();

    assert!(store
        .claim(OwnerToken::random(), LEASE, 10)
        .await
        .unwrap()
        .is_empty());

    clock.advance(ChronoDuration::hours(2));
    let claimed = store.claim(OwnerToken::random(), LEASE, 10).await.unwrap();
    assert_eq!(claimed, vec![id]);
}

#[tokio::test]
async fn reaper_returns_expired_claims() {
    let (_db, clock, store) = outbox_store().await;
    let stale_owner = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store
        .claim(stale_owner, Duration::from_secs(1), 1)
        .await
        .unwrap();

    // Lease not yet expired: nothing to reap.
    assert_eq!(store.reap_expired().await.unwrap(), 0);

    clock.advance(ChronoDuration::seconds(2));
    assert_eq!(store.reap_expired().await.unwrap(), 1);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert!(row.owner_token.is_none());

    // A new owner supersedes; the stale owner's ack no longer bites.
    let new_owner = OwnerToken::random();
    assert_eq!(store.claim(new_owner, LEASE, 1).await.unwrap(), vec![id]);
    store.ack(stale_owner, &[id]).await.unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        WorkStatus::InProgress
    );
}

#[tokio::test]
async fn terminal_rows_are_absorbing() {
    let (_db, _clock, store) = outbox_store().await;
    let owner = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store.claim(owner, LEASE, 1).await.unwrap();
    store
        .fail(owner, &[id], Some("gave up"), Some("worker-1"))
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Failed);
    assert_eq!(row.processed_by.as_deref(), Some("worker-1"));

    // Failed rows are never claimed again and never rewritten.
    assert!(store
        .claim(OwnerToken::random(), LEASE, 10)
        .await
        .unwrap()
        .is_empty());
    store.ack(owner, &[id]).await.unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        WorkStatus::Failed
    );
}

#[tokio::test]
async fn extend_prolongs_the_claim_lease() {
    let (_db, clock, store) = outbox_store().await;
    let owner = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store
        .claim(owner, Duration::from_secs(5), 1)
        .await
        .unwrap();

    clock.advance(ChronoDuration::seconds(4));
    assert_eq!(
        store.extend(owner, &[id], Duration::from_secs(30)).await.unwrap(),
        1
    );

    clock.advance(ChronoDuration::seconds(10));
    assert_eq!(store.reap_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn claim_honors_the_batch_limit() {
    let (_db, clock, store) = outbox_store().await;
    for n in 0..7 {
        store
            .enqueue(NewMessage::new("orders.sync", format!("{{\"n\":{n}}}")))
            .await
            .unwrap();
        clock.advance(ChronoDuration::milliseconds(1));
    }

    let owner = OwnerToken::random();
    assert_eq!(store.claim(owner, LEASE, 3).await.unwrap().len(), 3);
    assert_eq!(store.claim(owner, LEASE, 3).await.unwrap().len(), 3);
    assert_eq!(store.claim(owner, LEASE, 3).await.unwrap().len(), 1);
    assert!(store.claim(owner, LEASE, 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn extend_is_fenced_on_the_owner() {
    let (_db, clock, store) = outbox_store().await;
    let owner = OwnerToken::random();
    let intruder = OwnerToken::random();

    let id = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store
        .claim(owner, Duration::from_secs(2), 1)
        .await
        .unwrap();

    // A non-owner cannot stretch the lease.
    assert_eq!(
        store
            .extend(intruder, &[id], Duration::from_secs(600))
            .await
            .unwrap(),
        0
    );

    clock.advance(ChronoDuration::seconds(3));
    assert_eq!(store.reap_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn fuzzed_transitions_never_resurrect_terminal_rows() {
    let (_db, clock, store) = outbox_store().await;
    fastrand::seed(0x5eed);

    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(
            store
                .enqueue(NewMessage::new("orders.sync", format!("{{\"n\":{n}}}")))
                .await
                .unwrap(),
        );
        clock.advance(ChronoDuration::milliseconds(1));
    }

    let mut terminal = std::collections::HashSet::new();
    for _ in 0..200 {
        let owner = OwnerToken::random();
        let claimed = store
            .claim(owner, LEASE, fastrand::i64(1..5))
            .await
            .unwrap();
        for id in &claimed {
            assert!(
                !terminal.contains(id),
                "terminal row {id} returned by claim"
            );
            match fastrand::u8(0..4) {
                0 => {
                    store.ack(owner, &[*id]).await.unwrap();
                    terminal.insert(*id);
                }
                1 => {
                    store.fail(owner, &[*id], Some("fuzz"), None).await.unwrap();
                    terminal.insert(*id);
                }
                2 => {
                    store.abandon(owner, &[*id], None, None).await.unwrap();
                }
                _ => {
                    // Leave it claimed; expiry will return it.
                }
            }
        }
        // Occasionally let leases lapse and reap.
        if fastrand::u8(0..8) == 0 {
            clock.advance(ChronoDuration::seconds(60));
            store.reap_expired().await.unwrap();
        }
        if terminal.len() == ids.len() {
            break;
        }
    }

    // Whatever the interleaving, terminal rows stayed terminal.
    for id in &terminal {
        let status = store.get(*id).await.unwrap().unwrap().status;
        assert!(
            status == WorkStatus::Done || status == WorkStatus::Failed,
            "{id} left terminal state: {status:?}"
        );
    }
}

#[tokio::test]
async fn cleanup_deletes_only_old_terminal_rows() {
    let (_db, clock, store) = outbox_store().await;
    let owner = OwnerToken::random();

    let done = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    let pending = store
        .enqueue(NewMessage::new("orders.sync", "{}"))
        .await
        .unwrap();
    store.claim(owner, LEASE, 10).await.unwrap();
    store.ack(owner, &[done]).await.unwrap();
    store.abandon(owner, &[pending], None, None).await.unwrap();

    clock.advance(ChronoDuration::days(8));
    let deleted = store
        .cleanup(Duration::from_secs(7 * 24 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(store.get(done).await.unwrap().is_none());
    assert!(store.get(pending).await.unwrap().is_some());
}
