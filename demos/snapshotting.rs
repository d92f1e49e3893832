//! Snapshotting: let a policy decide when to checkpoint state, and replay from
//! the newest checkpoint instead of the full history.
//!
//! Run with: `cargo run --example snapshotting`

use std::{convert::Infallible, num::NonZeroUsize};

use annals::{
    EventRecord, JsonSerializer, Payload,
    backend::{Backend, inmemory},
    snapshot::{Policy, SnapshotOffer},
    store::{EventStore, RecordStream},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Readings for one sensor. `Summary` is the checkpoint form of the state.
#[derive(Clone, Debug, Serialize, Deserialize, Payload)]
#[payload(name = "sensor")]
pub enum SensorEvent {
    Reading { celsius: i32 },
    Summary(SensorState),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorState {
    readings: u32,
    max: Option<i32>,
}

impl SensorState {
    fn apply(&mut self, event: &SensorEvent) {
        match event {
            SensorEvent::Reading { celsius } => {
                self.readings += 1;
                self.max = Some(self.max.map_or(*celsius, |max| max.max(*celsius)));
            }
            SensorEvent::Summary(state) => state.clone_into(self),
        }
    }
}

const RETAINED_SNAPSHOTS: NonZeroUsize = NonZeroUsize::new(2).unwrap();

async fn replay(
    records: RecordStream<'_, String, SensorEvent, Infallible>,
) -> Result<(SensorState, usize), Box<dyn std::error::Error>> {
    let records: Vec<_> = records.try_collect().await?;
    let mut state = SensorState::default();
    for record in &records {
        state.apply(record.payload().materialize()?);
    }
    Ok((state, records.len()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default())
        .with_snapshot_policy(Policy::EveryNEvents(4))
        .with_max_archived_snapshots(RETAINED_SNAPSHOTS);
    let sensor = "sensor-7".to_string();

    let mut state = SensorState::default();
    let mut last = None;
    let mut since_snapshot = 0;
    for celsius in [18, 21, 19, 25, 23, 30, 22, 20, 24, 26] {
        let sequence = last.map_or(0, |l: u64| l + 1);
        let record = EventRecord::new(sensor.clone(), sequence, SensorEvent::Reading { celsius });
        state.apply(record.payload().materialize()?);
        let result = store.append(&sensor, last, vec![record]).await?;
        last = Some(result.last_sequence);
        since_snapshot += 1;

        let offer = store
            .offer_snapshot(&sensor, since_snapshot, || {
                Ok::<_, Infallible>(EventRecord::new(
                    sensor.clone(),
                    result.last_sequence,
                    SensorEvent::Summary(state.clone()),
                ))
            })
            .await?;
        if let SnapshotOffer::Stored(archived) = offer {
            println!(
                "Snapshot at sequence {} (pruned {})",
                result.last_sequence, archived.pruned
            );
            since_snapshot = 0;
        }
    }

    let kept = store.backend().snapshot_sequences(&sensor).await?;
    println!("Snapshots kept: {kept:?}");

    let (fast, fast_len) = replay(store.read_stream(&sensor)).await?;
    let (full, full_len) = replay(store.read_stream_bypassing_snapshots(&sensor)).await?;
    println!("Replayed {fast_len} records from snapshot, {full_len} from scratch");

    assert_eq!(fast, full);
    assert_eq!(fast, state);
    Ok(())
}
