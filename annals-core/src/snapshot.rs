//! Snapshot policy and retention.
//!
//! A snapshot is a stored record whose payload is the entity state as of its
//! sequence number. Replay starts from the newest snapshot instead of from
//! sequence 0. This module decides two things:
//!
//! - *when* a snapshot is worth taking ([`SnapshotPolicy`], [`Policy`])
//! - *how many* snapshots are kept once one is archived
//!   ([`SnapshotManager::archive`])
//!
//! Archiving never deletes events. Records covered by a snapshot are bypassed
//! on replay but remain available for a full audit read.

use std::num::NonZeroUsize;

use thiserror::Error;

use crate::{
    backend::Backend,
    event::{StoredRecord, ToStoredError},
    store::StorageUnavailable,
};

/// Decides whether a snapshot should be taken.
///
/// Implementations must be side-effect free: the store may ask more than once
/// for the same state.
///
/// Any `Fn(&Id, u64) -> bool` closure is a policy.
pub trait SnapshotPolicy<Id>: Send + Sync {
    /// `records_since_snapshot` counts the records persisted after the newest
    /// archived snapshot (or since the start of the stream if there is none).
    fn should_snapshot(&self, entity_id: &Id, records_since_snapshot: u64) -> bool;
}

impl<Id, F> SnapshotPolicy<Id> for F
where
    F: Fn(&Id, u64) -> bool + Send + Sync,
{
    fn should_snapshot(&self, entity_id: &Id, records_since_snapshot: u64) -> bool {
        self(entity_id, records_since_snapshot)
    }
}

/// Built-in snapshot policies.
///
/// - [`Policy::Always`]: snapshot after every append (high storage cost,
///   minimal replay)
/// - [`Policy::EveryNEvents`]: snapshot once `n` records have accumulated
/// - [`Policy::Never`]: never request snapshots; snapshots archived by other
///   processes are still used on replay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Snapshot after every append.
    Always,
    /// Snapshot once this many records accumulated.
    EveryNEvents(u64),
    /// Never snapshot.
    #[default]
    Never,
}

impl Policy {
    /// Whether `records_since` records warrant a snapshot.
    #[must_use]
    pub const fn should_snapshot(&self, records_since: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(threshold) => records_since >= *threshold,
            Self::Never => false,
        }
    }
}

impl<Id> SnapshotPolicy<Id> for Policy {
    fn should_snapshot(&self, _entity_id: &Id, records_since_snapshot: u64) -> bool {
        Self::should_snapshot(self, records_since_snapshot)
    }
}

/// Outcome of a successful [`SnapshotManager::archive`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Archived {
    /// Number of older snapshots deleted to honour the retention limit.
    pub pruned: usize,
}

/// Result of offering a snapshot to the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotOffer {
    /// The policy declined; the snapshot was never created.
    Declined,
    /// The snapshot was created and archived.
    Stored(Archived),
}

/// Error archiving a snapshot.
#[derive(Debug, Error)]
pub enum ArchiveError<E>
where
    E: std::error::Error + 'static,
{
    /// The snapshot payload could not be serialized.
    #[error("failed to serialize snapshot: {0}")]
    Serialization(#[source] ToStoredError),
    /// The snapshot claims to cover records the stream does not hold.
    #[error("snapshot at sequence {sequence} is beyond the end of the stream (last sequence {last:?})")]
    BeyondStream {
        /// Sequence number the snapshot was taken at.
        sequence: u64,
        /// Last persisted sequence number, `None` for an empty stream.
        last: Option<u64>,
    },
    /// The backend failed or timed out.
    #[error(transparent)]
    Unavailable(#[from] StorageUnavailable<E>),
}

impl<E> ArchiveError<E>
where
    E: std::error::Error + 'static,
{
    fn backend(error: E) -> Self {
        Self::Unavailable(StorageUnavailable::Backend(error))
    }
}

/// Error returned by
/// [`EventStore::offer_snapshot`](crate::store::EventStore::offer_snapshot).
#[derive(Debug, Error)]
pub enum OfferSnapshotError<E, CreateError>
where
    E: std::error::Error + 'static,
    CreateError: std::error::Error + 'static,
{
    /// Building the snapshot failed.
    #[error("failed to create snapshot: {0}")]
    Create(#[source] CreateError),
    /// Archiving the snapshot failed.
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] ArchiveError<E>),
}

/// Applies a [`SnapshotPolicy`] and the snapshot retention limit.
#[derive(Clone, Debug)]
pub struct SnapshotManager<P> {
    policy: P,
    max_archived: NonZeroUsize,
}

impl Default for SnapshotManager<Policy> {
    fn default() -> Self {
        Self::new(Policy::Never)
    }
}

impl<P> SnapshotManager<P> {
    /// Manager keeping a single archived snapshot per entity.
    pub const fn new(policy: P) -> Self {
        Self {
            policy,
            max_archived: NonZeroUsize::MIN,
        }
    }

    /// Keep up to `max_archived` snapshots per entity.
    #[must_use]
    pub fn with_max_archived(mut self, max_archived: NonZeroUsize) -> Self {
        self.max_archived = max_archived;
        self
    }

    /// The snapshot policy.
    pub const fn policy(&self) -> &P {
        &self.policy
    }

    /// Snapshots retained per entity.
    pub const fn max_archived(&self) -> NonZeroUsize {
        self.max_archived
    }

    /// Ask the policy whether `entity_id` is due a snapshot.
    pub fn should_snapshot<Id>(&self, entity_id: &Id, records_since_snapshot: u64) -> bool
    where
        P: SnapshotPolicy<Id>,
    {
        self.policy.should_snapshot(entity_id, records_since_snapshot)
    }

    /// Store `snapshot`, then delete the oldest snapshots of the same entity
    /// beyond the retention limit.
    ///
    /// Age is judged by sequence number, not wall-clock time. A snapshot
    /// already archived at the same sequence number is replaced.
    ///
    /// A snapshot past the last persisted record is rejected with
    /// [`ArchiveError::BeyondStream`]; replay would otherwise skip records
    /// appended later at the sequence numbers it claims to cover.
    #[tracing::instrument(
        skip(self, backend, snapshot),
        fields(entity_id = ?snapshot.entity_id, sequence = snapshot.sequence_number)
    )]
    pub async fn archive<B: Backend>(
        &self,
        backend: &B,
        snapshot: StoredRecord<B::Id>,
    ) -> Result<Archived, ArchiveError<B::Error>> {
        let entity_id = snapshot.entity_id.clone();
        let sequence = snapshot.sequence_number;
        let last = backend
            .last_sequence(&entity_id)
            .await
            .map_err(ArchiveError::backend)?;
        if last.is_none_or(|last| sequence > last) {
            tracing::debug!(?last, "snapshot rejected, stream is too short");
            return Err(ArchiveError::BeyondStream { sequence, last });
        }

        backend
            .put_snapshot(snapshot)
            .await
            .map_err(ArchiveError::backend)?;

        let sequences = backend
            .snapshot_sequences(&entity_id)
            .await
            .map_err(ArchiveError::backend)?;
        let excess = sequences.len().saturating_sub(self.max_archived.get());
        if excess == 0 {
            tracing::debug!(retained = sequences.len(), "snapshot archived");
            return Ok(Archived { pruned: 0 });
        }

        let oldest_retained = sequences[excess];
        let pruned = backend
            .delete_snapshots(&entity_id, oldest_retained)
            .await
            .map_err(ArchiveError::backend)?;
        tracing::debug!(pruned, oldest_retained, "snapshot archived, older snapshots pruned");
        Ok(Archived { pruned })
    }
}
