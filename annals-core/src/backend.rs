//! Persistence backend contract.
//!
//! A [`Backend`] stores record streams and snapshots for individually
//! addressed entities. It is the only place where the optimistic concurrency
//! check happens: [`Backend::put_records`] compares the caller's expected last
//! sequence number with what is persisted and commits atomically, or rejects
//! the whole batch.
//!
//! The core does not care whether the backend is relational, log-structured,
//! or the in-memory map in [`inmemory`].

use std::{fmt, future::Future, hash::Hash};

pub use nonempty::NonEmpty;
use thiserror::Error;

use crate::{concurrency::ConcurrencyConflict, event::StoredRecord};

pub mod inmemory;

/// Failure of [`Backend::put_records`].
#[derive(Debug, Error)]
pub enum CommitError<E>
where
    E: std::error::Error + 'static,
{
    /// The persisted last sequence number differs from the expected one.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// The backend could not complete the write.
    #[error("backend error: {0}")]
    Backend(#[source] E),
}

/// Storage for record streams and snapshots.
pub trait Backend: Send + Sync {
    /// Entity identifier type.
    ///
    /// Only equality is required; backends never order entities.
    type Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist `records` atomically if the stream's last sequence number is
    /// still `expected_last`.
    ///
    /// `expected_last == None` means the stream must not exist yet. Records
    /// arrive in ascending, gap-free sequence order starting right after
    /// `expected_last`. Either all of them become visible or none do.
    fn put_records<'a>(
        &'a self,
        entity_id: &'a Self::Id,
        expected_last: Option<u64>,
        records: NonEmpty<StoredRecord<Self::Id>>,
    ) -> impl Future<Output = Result<(), CommitError<Self::Error>>> + Send + 'a;

    /// Load up to `limit` records with `sequence_number >= from_sequence`, in
    /// ascending order.
    ///
    /// Unknown entities yield an empty batch.
    fn get_records<'a>(
        &'a self,
        entity_id: &'a Self::Id,
        from_sequence: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredRecord<Self::Id>>, Self::Error>> + Send + 'a;

    /// The last persisted sequence number, or `None` for an empty stream.
    fn last_sequence<'a>(
        &'a self,
        entity_id: &'a Self::Id,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// The snapshot with the highest sequence number, if any.
    fn latest_snapshot<'a>(
        &'a self,
        entity_id: &'a Self::Id,
    ) -> impl Future<Output = Result<Option<StoredRecord<Self::Id>>, Self::Error>> + Send + 'a;

    /// Store a snapshot.
    ///
    /// A snapshot already stored at the same sequence number is replaced: the
    /// most recently archived one wins.
    fn put_snapshot(
        &self,
        snapshot: StoredRecord<Self::Id>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Sequence numbers of all stored snapshots for an entity, ascending.
    fn snapshot_sequences<'a>(
        &'a self,
        entity_id: &'a Self::Id,
    ) -> impl Future<Output = Result<Vec<u64>, Self::Error>> + Send + 'a;

    /// Delete every snapshot with `sequence_number < older_than` and return
    /// how many were removed.
    fn delete_snapshots<'a>(
        &'a self,
        entity_id: &'a Self::Id,
        older_than: u64,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;
}
