//! In-memory backend for tests, examples and single-process use.
//!
//! ```
//! use annals_core::backend::inmemory;
//!
//! let backend: inmemory::Backend<String> = inmemory::Backend::new();
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    future::{Future, ready},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use nonempty::NonEmpty;

use super::CommitError;
use crate::{concurrency::ConcurrencyConflict, event::StoredRecord};

struct Stream<Id> {
    records: Vec<StoredRecord<Id>>,
    snapshots: BTreeMap<u64, StoredRecord<Id>>,
}

impl<Id> Default for Stream<Id> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            snapshots: BTreeMap::new(),
        }
    }
}

impl<Id> Stream<Id> {
    fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|r| r.sequence_number)
    }
}

type SharedStream<Id> = Arc<Mutex<Stream<Id>>>;

/// Thread-safe in-memory [`Backend`](super::Backend).
///
/// Every entity owns its own stream lock. The entity map is only locked long
/// enough to find or create a stream, so writers to different entities never
/// wait on each other's compare-and-commit.
#[derive(Clone)]
pub struct Backend<Id> {
    streams: Arc<RwLock<HashMap<Id, SharedStream<Id>>>>,
}

impl<Id> Backend<Id> {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<Id> Default for Backend<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: Clone + Eq + Hash> Backend<Id> {
    fn stream(&self, entity_id: &Id) -> Option<SharedStream<Id>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    fn stream_or_create(&self, entity_id: &Id) -> SharedStream<Id> {
        if let Some(stream) = self.stream(entity_id) {
            return stream;
        }
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(streams.entry(entity_id.clone()).or_default())
    }

    /// Number of entities with at least one stored record.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|stream| !lock(stream).records.is_empty())
            .count()
    }
}

fn lock<Id>(stream: &Mutex<Stream<Id>>) -> MutexGuard<'_, Stream<Id>> {
    stream.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<Id> super::Backend for Backend<Id>
where
    Id: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    type Error = Infallible;
    type Id = Id;

    #[tracing::instrument(skip(self, records), fields(record_count = records.len()))]
    fn put_records<'a>(
        &'a self,
        entity_id: &'a Id,
        expected_last: Option<u64>,
        records: NonEmpty<StoredRecord<Id>>,
    ) -> impl Future<Output = Result<(), CommitError<Infallible>>> + Send + 'a {
        let stream = self.stream_or_create(entity_id);
        let mut stream = lock(&stream);

        let actual = stream.last_sequence();
        let result = if actual == expected_last {
            stream.records.extend(records);
            tracing::debug!(last_sequence = ?stream.last_sequence(), "records committed");
            Ok(())
        } else {
            tracing::debug!(?expected_last, ?actual, "sequence mismatch, rejecting commit");
            Err(CommitError::Conflict(ConcurrencyConflict {
                expected: expected_last,
                actual,
            }))
        };
        drop(stream);

        ready(result)
    }

    #[tracing::instrument(skip(self))]
    fn get_records<'a>(
        &'a self,
        entity_id: &'a Id,
        from_sequence: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredRecord<Id>>, Infallible>> + Send + 'a {
        let page = self.stream(entity_id).map_or_else(Vec::new, |stream| {
            let stream = lock(&stream);
            let start = stream
                .records
                .partition_point(|r| r.sequence_number < from_sequence);
            stream.records[start..].iter().take(limit).cloned().collect()
        });
        tracing::trace!(loaded = page.len(), "loaded record page");
        ready(Ok(page))
    }

    fn last_sequence<'a>(
        &'a self,
        entity_id: &'a Id,
    ) -> impl Future<Output = Result<Option<u64>, Infallible>> + Send + 'a {
        let last = self
            .stream(entity_id)
            .and_then(|stream| lock(&stream).last_sequence());
        ready(Ok(last))
    }

    fn latest_snapshot<'a>(
        &'a self,
        entity_id: &'a Id,
    ) -> impl Future<Output = Result<Option<StoredRecord<Id>>, Infallible>> + Send + 'a {
        let latest = self.stream(entity_id).and_then(|stream| {
            lock(&stream)
                .snapshots
                .last_key_value()
                .map(|(_, snapshot)| snapshot.clone())
        });
        ready(Ok(latest))
    }

    #[tracing::instrument(skip(self, snapshot), fields(entity_id = ?snapshot.entity_id, sequence = snapshot.sequence_number))]
    fn put_snapshot(
        &self,
        snapshot: StoredRecord<Id>,
    ) -> impl Future<Output = Result<(), Infallible>> + Send + '_ {
        let stream = self.stream_or_create(&snapshot.entity_id);
        let replaced = lock(&stream)
            .snapshots
            .insert(snapshot.sequence_number, snapshot)
            .is_some();
        tracing::debug!(replaced, "snapshot stored");
        ready(Ok(()))
    }

    fn snapshot_sequences<'a>(
        &'a self,
        entity_id: &'a Id,
    ) -> impl Future<Output = Result<Vec<u64>, Infallible>> + Send + 'a {
        let sequences = self.stream(entity_id).map_or_else(Vec::new, |stream| {
            lock(&stream).snapshots.keys().copied().collect()
        });
        ready(Ok(sequences))
    }

    #[tracing::instrument(skip(self))]
    fn delete_snapshots<'a>(
        &'a self,
        entity_id: &'a Id,
        older_than: u64,
    ) -> impl Future<Output = Result<usize, Infallible>> + Send + 'a {
        let deleted = self.stream(entity_id).map_or(0, |stream| {
            let mut stream = lock(&stream);
            let retained = stream.snapshots.split_off(&older_than);
            let deleted = stream.snapshots.len();
            stream.snapshots = retained;
            deleted
        });
        tracing::debug!(deleted, "snapshots deleted");
        ready(Ok(deleted))
    }
}
