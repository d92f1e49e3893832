//! End-to-end scenarios across the store, snapshots and saga routing.

#![cfg(feature = "test-util")]

use std::collections::HashSet;

use annals::{
    AssociationIndex, EventRecord, JsonSerializer, Payload, Saga,
    backend::inmemory,
    snapshot::Policy,
    store::EventStore,
    test::{AssociationValidator, StoreTestExt},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Payload)]
enum Sum {
    Value(i64),
    Snapshot(Vec<i64>),
}

/// Folds a replayed stream back into the list of values it represents.
fn values(records: &[EventRecord<String, Sum>]) -> Vec<i64> {
    let mut values = Vec::new();
    for record in records {
        match record.payload().materialize().unwrap() {
            Sum::Value(v) => values.push(*v),
            Sum::Snapshot(state) => values.clone_from(state),
        }
    }
    values
}

#[tokio::test]
async fn replay_is_unchanged_by_a_snapshot() {
    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default())
        .with_snapshot_policy(Policy::EveryNEvents(2));
    let a = "A".to_string();

    let first = store
        .append(&a, None, vec![
            EventRecord::new(a.clone(), 0, Sum::Value(1)),
            EventRecord::new(a.clone(), 1, Sum::Value(2)),
        ])
        .await
        .unwrap();
    assert!(first.snapshot_due);
    store
        .archive_snapshot(&EventRecord::new(a.clone(), 1, Sum::Snapshot(vec![1, 2])))
        .await
        .unwrap();
    store.seed_records(&a, vec![Sum::Value(3)]).await.unwrap();

    let replayed: Vec<EventRecord<String, Sum>> =
        store.read_stream(&a).try_collect().await.unwrap();
    assert_eq!(values(&replayed), [1, 2, 3]);
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].sequence_number(), 1);

    let bypassed: Vec<EventRecord<String, Sum>> = store
        .read_stream_bypassing_snapshots(&a)
        .try_collect()
        .await
        .unwrap();
    let sequences: Vec<u64> = bypassed.iter().map(EventRecord::sequence_number).collect();
    assert_eq!(sequences, [0, 1, 2]);
    assert_eq!(values(&bypassed), [1, 2, 3]);
}

#[derive(Saga)]
struct OrderSaga;

#[test]
fn saga_removal_ends_routing() {
    let index = AssociationIndex::new();
    index.add(OrderSaga::KIND, "S1".to_string());
    index
        .associate(&"S1".to_string(), "orderId", "42")
        .unwrap();

    assert_eq!(
        index.find(OrderSaga::KIND, "orderId", "42"),
        HashSet::from(["S1".to_string()])
    );

    assert!(index.remove(&"S1".to_string()));
    assert!(index.find(OrderSaga::KIND, "orderId", "42").is_empty());
    AssociationValidator::for_saga::<OrderSaga>(&index).assert_active_sagas(0);
}
