//! Optimistic concurrency: two writers load the same stream, both try to
//! append, and only the first one wins. The loser reloads and retries.
//!
//! Run with: `cargo run --example optimistic_concurrency`

use annals::{
    EventRecord, JsonSerializer, Payload,
    backend::inmemory,
    store::{AppendError, EventStore},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize, Payload)]
#[payload(name = "inventory")]
pub enum InventoryEvent {
    Restocked { quantity: u32 },
    Reserved { quantity: u32 },
}

type Store = EventStore<inmemory::Backend<String>, JsonSerializer>;

/// Current stock and the sequence number it was derived at.
async fn load(store: &Store, item: &String) -> Result<(u32, Option<u64>), Box<dyn std::error::Error>> {
    let records: Vec<EventRecord<String, InventoryEvent>> =
        store.read_stream(item).try_collect().await?;
    let mut available = 0;
    for record in &records {
        match record.payload().materialize()? {
            InventoryEvent::Restocked { quantity } => available += quantity,
            InventoryEvent::Reserved { quantity } => available -= quantity,
        }
    }
    Ok((available, records.last().map(EventRecord::sequence_number)))
}

/// Reserve `quantity` units, reloading and retrying on conflicts.
async fn reserve(
    store: &Store,
    item: &String,
    quantity: u32,
    max_attempts: usize,
) -> Result<bool, Box<dyn std::error::Error>> {
    for attempt in 1..=max_attempts {
        let (available, loaded_at) = load(store, item).await?;
        if available < quantity {
            return Ok(false);
        }
        let next = loaded_at.map_or(0, |last| last + 1);
        let record = EventRecord::new(item.clone(), next, InventoryEvent::Reserved { quantity });
        match store.append(item, loaded_at, vec![record]).await {
            Ok(_) => return Ok(true),
            Err(AppendError::Conflict(conflict)) => {
                println!("  attempt {attempt}: {conflict}");
            }
            Err(other) => return Err(other.into()),
        }
    }
    Err("gave up after repeated conflicts".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store: Store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default());
    let item = "widget".to_string();
    store
        .append(&item, None, vec![EventRecord::new(
            item.clone(),
            0,
            InventoryEvent::Restocked { quantity: 10 },
        )])
        .await?;

    // Both writers load the same version.
    let (_, alice_loaded_at) = load(&store, &item).await?;
    let (_, bob_loaded_at) = load(&store, &item).await?;

    let alice = EventRecord::new(item.clone(), 1, InventoryEvent::Reserved { quantity: 4 });
    store.append(&item, alice_loaded_at, vec![alice]).await?;
    println!("Alice reserved 4");

    let bob = EventRecord::new(item.clone(), 1, InventoryEvent::Reserved { quantity: 3 });
    match store.append(&item, bob_loaded_at, vec![bob]).await {
        Err(AppendError::Conflict(conflict)) => println!("Bob was rejected: {conflict}"),
        other => return Err(format!("expected a conflict, got {other:?}").into()),
    }

    println!("Bob retries with a fresh load");
    let reserved = reserve(&store, &item, 3, 3).await?;
    let (available, _) = load(&store, &item).await?;
    println!("Bob reserved: {reserved}, remaining stock: {available}");
    assert_eq!(available, 3);
    Ok(())
}
