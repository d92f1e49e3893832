//! Event stream store.
//!
//! [`EventStore`] sits between callers (aggregate repositories, replay
//! tooling) and a [`Backend`]. It:
//!
//! - validates that appended records continue the stream without gaps
//! - serializes payloads and hands whole batches to the backend's
//!   compare-and-commit
//! - replays streams lazily, page by page, starting from the newest snapshot
//! - asks the [`SnapshotManager`] whether a snapshot is due
//!
//! No backend call is retried. Failures surface as [`StorageUnavailable`] and
//! concurrency conflicts as [`ConcurrencyConflict`]; the caller decides what
//! to do next.

use std::{future::Future, num::NonZeroUsize, pin::Pin, sync::Arc, time::Duration};

use futures_core::Stream;
use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    backend::{Backend, CommitError},
    concurrency::ConcurrencyConflict,
    config::StoreConfig,
    event::{EventRecord, ToStoredError},
    metadata::MetaData,
    payload::Payload,
    serializer::Serializer,
    snapshot::{
        ArchiveError, Archived, OfferSnapshotError, Policy, SnapshotManager, SnapshotOffer,
        SnapshotPolicy,
    },
};

/// The backend failed or did not answer in time.
#[derive(Debug, Error)]
pub enum StorageUnavailable<E>
where
    E: std::error::Error + 'static,
{
    /// The backend reported an error.
    #[error("backend error: {0}")]
    Backend(#[source] E),
    /// The operation timeout elapsed first.
    #[error("backend call timed out after {0:?}")]
    TimedOut(Duration),
}

/// Error from [`EventStore::append`].
#[derive(Debug, Error)]
pub enum AppendError<E>
where
    E: std::error::Error + 'static,
{
    /// Attempted to append an empty batch.
    #[error("cannot append an empty record batch")]
    EmptyAppend,
    /// A record in the batch belongs to a different entity.
    #[error("record at sequence {sequence_number} belongs to a different entity")]
    EntityMismatch {
        /// Sequence number of the offending record.
        sequence_number: u64,
    },
    /// The batch does not continue the stream from the expected position.
    #[error("expected record with sequence {expected}, got {found}")]
    OutOfOrder {
        /// Sequence number the record should have carried.
        expected: u64,
        /// Sequence number it carried.
        found: u64,
    },
    /// The stream already holds the largest representable sequence number.
    #[error("stream has reached the maximum sequence number")]
    SequenceOverflow,
    /// A payload could not be serialized.
    #[error(transparent)]
    Serialization(#[from] ToStoredError),
    /// Another writer appended first.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// The backend failed or timed out.
    #[error(transparent)]
    Unavailable(#[from] StorageUnavailable<E>),
}

/// Error produced while reading a stream.
#[derive(Debug, Error)]
pub enum ReadError<E>
where
    E: std::error::Error + 'static,
{
    /// The backend failed or timed out.
    #[error(transparent)]
    Unavailable(#[from] StorageUnavailable<E>),
    /// The backend returned a page that skips or repeats a sequence number.
    #[error("stream is not contiguous: expected sequence {expected}, got {found}")]
    SequenceGap {
        /// Sequence number replay expected next.
        expected: u64,
        /// Sequence number the backend returned.
        found: u64,
    },
}

/// Result of a successful append.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendResult {
    /// Sequence number of the last record written in the batch.
    pub last_sequence: u64,
    /// Whether the snapshot policy asks for a snapshot now.
    pub snapshot_due: bool,
}

/// Lazily paged sequence of records returned by the read operations.
pub type RecordStream<'a, Id, T, E> =
    Pin<Box<dyn Stream<Item = Result<EventRecord<Id, T>, ReadError<E>>> + Send + 'a>>;

/// Append and replay engine over a [`Backend`].
///
/// ```
/// use annals_core::{
///     backend::inmemory, event::EventRecord, serializer::JsonSerializer, store::EventStore,
/// };
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let store = EventStore::new(inmemory::Backend::<String>::new(), JsonSerializer::default());
/// let id = "counter-1".to_string();
///
/// let records = vec![EventRecord::new(id.clone(), 0, 10_i64)];
/// let appended = store.append(&id, None, records).await.unwrap();
/// assert_eq!(appended.last_sequence, 0);
/// # });
/// ```
pub struct EventStore<B, S, P = Policy> {
    backend: B,
    serializer: Arc<S>,
    snapshots: SnapshotManager<P>,
    batch_size: NonZeroUsize,
    operation_timeout: Option<Duration>,
}

impl<B: Backend, S: Serializer> EventStore<B, S, Policy> {
    /// Store with default settings: pages of 100 records, no snapshot
    /// requests, a single retained snapshot and no ambient timeout.
    pub fn new(backend: B, serializer: S) -> Self {
        Self::with_config(backend, serializer, &StoreConfig::default())
    }

    /// Store with page size, timeout and snapshot retention taken from
    /// `config`.
    pub fn with_config(backend: B, serializer: S, config: &StoreConfig) -> Self {
        Self {
            backend,
            serializer: Arc::new(serializer),
            snapshots: config.snapshot_manager(),
            batch_size: config.batch_size(),
            operation_timeout: config.operation_timeout(),
        }
    }
}

impl<B: Backend, S: Serializer, P> EventStore<B, S, P> {
    /// Replace the snapshot policy, keeping the retention limit.
    pub fn with_snapshot_policy<Q>(self, policy: Q) -> EventStore<B, S, Q>
    where
        Q: SnapshotPolicy<B::Id>,
    {
        let max_archived = self.snapshots.max_archived();
        EventStore {
            backend: self.backend,
            serializer: self.serializer,
            snapshots: SnapshotManager::new(policy).with_max_archived(max_archived),
            batch_size: self.batch_size,
            operation_timeout: self.operation_timeout,
        }
    }

    /// Number of snapshots kept per entity.
    #[must_use]
    pub fn with_max_archived_snapshots(mut self, max_archived: NonZeroUsize) -> Self {
        self.snapshots = self.snapshots.with_max_archived(max_archived);
        self
    }

    /// Records fetched per backend call while replaying.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Bound every backend call by `timeout`.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// The underlying backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The payload serializer.
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// The snapshot policy and retention limit.
    pub const fn snapshots(&self) -> &SnapshotManager<P> {
        &self.snapshots
    }

    /// Replay page size.
    pub const fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    async fn bounded<F: Future>(
        &self,
        operation: F,
    ) -> Result<F::Output, StorageUnavailable<B::Error>> {
        let Some(limit) = self.operation_timeout else {
            return Ok(operation.await);
        };
        tokio::time::timeout(limit, operation).await.map_err(|_| {
            tracing::debug!(?limit, "backend call timed out");
            StorageUnavailable::TimedOut(limit)
        })
    }

    async fn call<R>(
        &self,
        operation: impl Future<Output = Result<R, B::Error>>,
    ) -> Result<R, StorageUnavailable<B::Error>> {
        self.bounded(operation)
            .await?
            .map_err(StorageUnavailable::Backend)
    }

    /// The last persisted sequence number of an entity, or `None` if the
    /// entity has no records.
    pub async fn last_sequence(
        &self,
        entity_id: &B::Id,
    ) -> Result<Option<u64>, StorageUnavailable<B::Error>> {
        self.call(self.backend.last_sequence(entity_id)).await
    }

    /// Start a transaction that stamps sequence numbers onto payloads and
    /// appends them in one batch on commit.
    pub fn begin<T>(
        &self,
        entity_id: B::Id,
        expected_last: Option<u64>,
    ) -> Transaction<'_, B, S, P, T> {
        Transaction {
            store: self,
            entity_id,
            expected_last,
            records: Vec::new(),
            committed: false,
        }
    }
}

impl<B, S, P> EventStore<B, S, P>
where
    B: Backend,
    S: Serializer,
    P: SnapshotPolicy<B::Id>,
{
    /// Append `records` to the stream of `entity_id`.
    ///
    /// `expected_last` is the sequence number of the last record the caller
    /// observed (`None` for a new entity). Records must carry consecutive
    /// sequence numbers starting right after it. The whole batch commits or
    /// none of it does; if another writer got there first the append fails
    /// with [`AppendError::Conflict`] and nothing is written.
    #[tracing::instrument(
        skip(self, records),
        fields(record_count = records.len())
    )]
    pub async fn append<T>(
        &self,
        entity_id: &B::Id,
        expected_last: Option<u64>,
        records: Vec<EventRecord<B::Id, T>>,
    ) -> Result<AppendResult, AppendError<B::Error>>
    where
        T: Payload + Serialize,
    {
        let mut expected = expected_last.map_or(Some(0), |last| last.checked_add(1));
        let mut stored = Vec::with_capacity(records.len());
        for record in &records {
            let Some(want) = expected else {
                return Err(AppendError::SequenceOverflow);
            };
            if record.entity_id() != entity_id {
                return Err(AppendError::EntityMismatch {
                    sequence_number: record.sequence_number(),
                });
            }
            if record.sequence_number() != want {
                return Err(AppendError::OutOfOrder {
                    expected: want,
                    found: record.sequence_number(),
                });
            }
            stored.push(record.to_stored(self.serializer.as_ref())?);
            expected = want.checked_add(1);
        }
        let Some(stored) = NonEmpty::from_vec(stored) else {
            return Err(AppendError::EmptyAppend);
        };
        let last_sequence = stored.last().sequence_number;

        match self
            .bounded(self.backend.put_records(entity_id, expected_last, stored))
            .await?
        {
            Ok(()) => {}
            Err(CommitError::Conflict(conflict)) => {
                tracing::debug!(%conflict, "append rejected");
                return Err(conflict.into());
            }
            Err(CommitError::Backend(e)) => return Err(StorageUnavailable::Backend(e).into()),
        }
        tracing::debug!(last_sequence, "records appended");

        // The append is durable at this point; bookkeeping failures only
        // cost a snapshot opportunity.
        let snapshot_due = match self.records_since_snapshot(entity_id, last_sequence).await {
            Ok(since) => self.snapshots.should_snapshot(entity_id, since),
            Err(error) => {
                tracing::warn!(%error, "could not determine whether a snapshot is due");
                false
            }
        };

        Ok(AppendResult {
            last_sequence,
            snapshot_due,
        })
    }

    async fn records_since_snapshot(
        &self,
        entity_id: &B::Id,
        last_sequence: u64,
    ) -> Result<u64, StorageUnavailable<B::Error>> {
        let sequences = self.call(self.backend.snapshot_sequences(entity_id)).await?;
        Ok(match sequences.last() {
            Some(&snapshot) => last_sequence.saturating_sub(snapshot),
            None => last_sequence.saturating_add(1),
        })
    }

    /// Archive `snapshot` and prune older snapshots beyond the retention
    /// limit.
    ///
    /// The snapshot's sequence number is the last record its state covers and
    /// must not lie past the end of the stream. The archive is bounded by the
    /// operation timeout as a whole.
    #[tracing::instrument(skip(self, snapshot), fields(sequence = snapshot.sequence_number()))]
    pub async fn archive_snapshot<T>(
        &self,
        snapshot: &EventRecord<B::Id, T>,
    ) -> Result<Archived, ArchiveError<B::Error>>
    where
        T: Payload + Serialize,
    {
        let stored = snapshot
            .to_stored(self.serializer.as_ref())
            .map_err(ArchiveError::Serialization)?;
        self.bounded(self.snapshots.archive(&self.backend, stored))
            .await?
    }

    /// Offer a snapshot; `create` only runs if the policy wants one.
    pub async fn offer_snapshot<T, CE, Create>(
        &self,
        entity_id: &B::Id,
        records_since_snapshot: u64,
        create: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<B::Error, CE>>
    where
        T: Payload + Serialize,
        CE: std::error::Error + Send + Sync + 'static,
        Create: FnOnce() -> Result<EventRecord<B::Id, T>, CE> + Send,
    {
        if !self.snapshots.should_snapshot(entity_id, records_since_snapshot) {
            return Ok(SnapshotOffer::Declined);
        }
        let snapshot = create().map_err(OfferSnapshotError::Create)?;
        let archived = self
            .archive_snapshot(&snapshot)
            .await
            .map_err(OfferSnapshotError::Snapshot)?;
        Ok(SnapshotOffer::Stored(archived))
    }
}

impl<B, S, P> EventStore<B, S, P>
where
    B: Backend,
    S: Serializer,
    P: Sync,
{
    /// Replay the stream of `entity_id`.
    ///
    /// If a snapshot exists, the stream starts with the snapshot record and
    /// continues with the records after it. Otherwise it starts at sequence
    /// 0. Unknown entities yield an empty stream.
    pub fn read_stream<'a, T>(
        &'a self,
        entity_id: &'a B::Id,
    ) -> RecordStream<'a, B::Id, T, B::Error>
    where
        T: Payload + DeserializeOwned + Send + Sync + 'static,
    {
        self.replay(entity_id, true)
    }

    /// Replay every record of `entity_id` from sequence 0, ignoring
    /// snapshots.
    pub fn read_stream_bypassing_snapshots<'a, T>(
        &'a self,
        entity_id: &'a B::Id,
    ) -> RecordStream<'a, B::Id, T, B::Error>
    where
        T: Payload + DeserializeOwned + Send + Sync + 'static,
    {
        self.replay(entity_id, false)
    }

    fn replay<'a, T>(
        &'a self,
        entity_id: &'a B::Id,
        use_snapshots: bool,
    ) -> RecordStream<'a, B::Id, T, B::Error>
    where
        T: Payload + DeserializeOwned + Send + Sync + 'static,
    {
        Box::pin(async_stream::try_stream! {
            // `None` once the cursor has passed `u64::MAX`.
            let mut next = Some(0_u64);

            let snapshot = if use_snapshots {
                self.call(self.backend.latest_snapshot(entity_id)).await?
            } else {
                None
            };
            if let Some(snapshot) = snapshot {
                tracing::trace!(sequence = snapshot.sequence_number, "replaying from snapshot");
                next = snapshot.sequence_number.checked_add(1);
                yield EventRecord::from_stored(snapshot, Arc::clone(&self.serializer));
            }

            let limit = self.batch_size.get();
            while let Some(from) = next {
                let page = self
                    .call(self.backend.get_records(entity_id, from, limit))
                    .await?;
                let fetched = page.len();
                tracing::trace!(from, fetched, "fetched record page");

                for stored in page {
                    if next != Some(stored.sequence_number) {
                        Err::<(), _>(ReadError::SequenceGap {
                            expected: next.unwrap_or(u64::MAX),
                            found: stored.sequence_number,
                        })?;
                    }
                    next = stored.sequence_number.checked_add(1);
                    yield EventRecord::from_stored(stored, Arc::clone(&self.serializer));
                }

                if fetched < limit {
                    break;
                }
            }
        })
    }
}

/// Buffered batch of records for one entity.
///
/// Payloads pushed onto the transaction get consecutive sequence numbers
/// continuing from `expected_last`. Dropping the transaction without
/// committing discards them.
pub struct Transaction<'a, B: Backend, S, P, T> {
    store: &'a EventStore<B, S, P>,
    entity_id: B::Id,
    expected_last: Option<u64>,
    records: Vec<EventRecord<B::Id, T>>,
    committed: bool,
}

impl<B: Backend, S, P, T: Payload> Transaction<'_, B, S, P, T> {
    /// Sequence number the next buffered record will get.
    ///
    /// Saturates at `u64::MAX`; committing past it fails with
    /// [`AppendError::SequenceOverflow`].
    pub fn next_sequence(&self) -> u64 {
        let buffered = u64::try_from(self.records.len()).unwrap_or(u64::MAX);
        self.expected_last
            .map_or(0, |last| last.saturating_add(1))
            .saturating_add(buffered)
    }

    /// Buffer `payload` as the next record, with empty metadata.
    pub fn append(&mut self, payload: T) -> &mut Self {
        self.append_with_metadata(payload, MetaData::empty())
    }

    /// Buffer `payload` as the next record.
    pub fn append_with_metadata(&mut self, payload: T, metadata: MetaData) -> &mut Self {
        let record = EventRecord::new(self.entity_id.clone(), self.next_sequence(), payload)
            .with_metadata(metadata);
        tracing::trace!(sequence = record.sequence_number(), "record buffered");
        self.records.push(record);
        self
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<B, S, P, T> Transaction<'_, B, S, P, T>
where
    B: Backend,
    S: Serializer,
    P: SnapshotPolicy<B::Id>,
    T: Payload + Serialize,
{
    /// Append the buffered records.
    ///
    /// # Errors
    ///
    /// Same as [`EventStore::append`]; an empty transaction fails with
    /// [`AppendError::EmptyAppend`].
    pub async fn commit(mut self) -> Result<AppendResult, AppendError<B::Error>> {
        let records = std::mem::take(&mut self.records);
        self.committed = true;
        tracing::debug!(
            entity_id = ?self.entity_id,
            record_count = records.len(),
            expected_last = ?self.expected_last,
            "committing transaction"
        );
        self.store
            .append(&self.entity_id, self.expected_last, records)
            .await
    }
}

impl<B: Backend, S, P, T> Drop for Transaction<'_, B, S, P, T> {
    fn drop(&mut self) {
        if !self.committed && !self.records.is_empty() {
            tracing::trace!(
                entity_id = ?self.entity_id,
                expected_last = ?self.expected_last,
                record_count = self.records.len(),
                "transaction dropped without commit; discarding buffered records"
            );
        }
    }
}
