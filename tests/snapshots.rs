//! Integration tests for snapshot policies, retention and replay.

#![cfg(feature = "test-util")]

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use annals::{
    EventRecord, JsonSerializer, Payload,
    backend::{Backend, inmemory},
    snapshot::{ArchiveError, Archived, OfferSnapshotError, Policy, SnapshotOffer},
    store::EventStore,
    test::StoreTestExt,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Test Domain: Tally
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Payload)]
#[payload(name = "tally")]
enum Tally {
    Counted(i64),
    Checkpoint { total: i64 },
}

fn fold(records: &[EventRecord<String, Tally>]) -> i64 {
    records
        .iter()
        .fold(0, |total, record| match record.payload().materialize().unwrap() {
            Tally::Counted(n) => total + n,
            Tally::Checkpoint { total: snapshot_total } => *snapshot_total,
        })
}

fn checkpoint(id: &str, sequence: u64, total: i64) -> EventRecord<String, Tally> {
    EventRecord::new(id.to_string(), sequence, Tally::Checkpoint { total })
}

#[derive(Debug, Error)]
#[error("state could not be captured")]
struct CaptureFailed;

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn retention_keeps_most_recent_snapshots() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default())
        .with_max_archived_snapshots(NonZeroUsize::new(2).unwrap());
    let id = "t-1".to_string();
    store
        .seed_records(&id, (0..10).map(Tally::Counted).collect())
        .await
        .unwrap();

    let mut pruned = Vec::new();
    for (sequence, total) in [(2, 3), (5, 9), (9, 20)] {
        let archived = store
            .archive_snapshot(&checkpoint(&id, sequence, total))
            .await
            .unwrap();
        pruned.push(archived.pruned);
    }

    assert_eq!(pruned, [0, 0, 1]);
    assert_eq!(
        store.backend().snapshot_sequences(&id).await.unwrap(),
        [5, 9]
    );
}

#[tokio::test]
async fn retention_is_per_entity() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default());
    let (a, b) = ("a".to_string(), "b".to_string());
    for id in [&a, &b] {
        store
            .seed_records(id, (0..5).map(Tally::Counted).collect())
            .await
            .unwrap();
    }

    store.archive_snapshot(&checkpoint(&a, 1, 1)).await.unwrap();
    store.archive_snapshot(&checkpoint(&b, 4, 4)).await.unwrap();
    store.archive_snapshot(&checkpoint(&a, 3, 3)).await.unwrap();

    assert_eq!(store.backend().snapshot_sequences(&a).await.unwrap(), [3]);
    assert_eq!(store.backend().snapshot_sequences(&b).await.unwrap(), [4]);
}

#[tokio::test]
async fn snapshot_ahead_of_stream_is_refused() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default());
    let id = "t-1".to_string();
    store
        .seed_records(&id, vec![Tally::Counted(1), Tally::Counted(2)])
        .await
        .unwrap();

    let err = store
        .archive_snapshot(&checkpoint(&id, 5, 100))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ArchiveError::BeyondStream {
            sequence: 5,
            last: Some(1)
        }
    ));

    store
        .seed_records(&id, vec![Tally::Counted(3)])
        .await
        .unwrap();
    let replayed: Vec<EventRecord<String, Tally>> =
        store.read_stream(&id).try_collect().await.unwrap();
    assert_eq!(fold(&replayed), 6);
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn replay_from_snapshot_folds_to_same_state() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default());
    let id = "t-1".to_string();
    store
        .seed_records(&id, (1..=6).map(Tally::Counted).collect())
        .await
        .unwrap();

    let full: Vec<EventRecord<String, Tally>> = store
        .read_stream_bypassing_snapshots(&id)
        .try_collect()
        .await
        .unwrap();
    store
        .archive_snapshot(&checkpoint(&id, 3, fold(&full[..4])))
        .await
        .unwrap();

    let from_snapshot: Vec<EventRecord<String, Tally>> =
        store.read_stream(&id).try_collect().await.unwrap();

    assert_eq!(from_snapshot.len(), 3);
    assert_eq!(from_snapshot[0].sequence_number(), 3);
    assert_eq!(fold(&from_snapshot), fold(&full));
    assert_eq!(fold(&full), 21);
}

#[tokio::test]
async fn snapshots_never_delete_events() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default());
    let id = "t-1".to_string();
    store
        .seed_records(&id, vec![Tally::Counted(1), Tally::Counted(2)])
        .await
        .unwrap();
    store.archive_snapshot(&checkpoint(&id, 1, 3)).await.unwrap();

    let records = store.backend().get_records(&id, 0, 10).await.unwrap();
    assert_eq!(records.len(), 2);
}

// ============================================================================
// Policies and offers
// ============================================================================

#[tokio::test]
async fn custom_policy_sees_entity_and_distance() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default())
        .with_snapshot_policy(|id: &String, since: u64| id.starts_with("hot-") && since >= 2);

    let hot = "hot-1".to_string();
    let cold = "cold-1".to_string();
    let hot_result = store
        .append(&hot, None, vec![
            EventRecord::new(hot.clone(), 0, Tally::Counted(1)),
            EventRecord::new(hot.clone(), 1, Tally::Counted(1)),
        ])
        .await
        .unwrap();
    let cold_result = store
        .append(&cold, None, vec![
            EventRecord::new(cold.clone(), 0, Tally::Counted(1)),
            EventRecord::new(cold.clone(), 1, Tally::Counted(1)),
        ])
        .await
        .unwrap();

    assert!(hot_result.snapshot_due);
    assert!(!cold_result.snapshot_due);
}

#[tokio::test]
async fn offer_creates_state_only_when_policy_agrees() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default())
        .with_snapshot_policy(Policy::EveryNEvents(5));
    let id = "t-1".to_string();
    store
        .seed_records(&id, (1..=5).map(Tally::Counted).collect())
        .await
        .unwrap();
    let captures = AtomicUsize::new(0);
    let capture = || {
        captures.fetch_add(1, Ordering::SeqCst);
        Ok::<_, CaptureFailed>(checkpoint(&id, 4, 15))
    };

    let declined = store.offer_snapshot(&id, 4, capture).await.unwrap();
    let stored = store.offer_snapshot(&id, 5, capture).await.unwrap();

    assert_eq!(declined, SnapshotOffer::Declined);
    assert_eq!(stored, SnapshotOffer::Stored(Archived { pruned: 0 }));
    assert_eq!(captures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_capture_is_reported_and_nothing_is_archived() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default())
        .with_snapshot_policy(Policy::Always);
    let id = "t-1".to_string();

    let err = store
        .offer_snapshot::<Tally, _, _>(&id, 1, || Err(CaptureFailed))
        .await
        .unwrap_err();

    assert!(matches!(err, OfferSnapshotError::Create(CaptureFailed)));
    assert!(store.backend().latest_snapshot(&id).await.unwrap().is_none());
}
