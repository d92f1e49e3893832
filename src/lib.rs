#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use annals_core::test;
pub use annals_core::{
    association,
    association::{Association, AssociationIndex, InvalidAssociation, Saga},
    concurrency,
    concurrency::ConcurrencyConflict,
    config,
    config::StoreConfig,
    event,
    event::{EventRecord, StoredRecord},
    metadata,
    metadata::MetaData,
    payload,
    payload::{LazyPayload, Payload, PayloadType, SerializedPayload},
    serializer,
    serializer::{DeserializationError, JsonSerializer, Serializer, TypeRegistry},
};
// Re-export proc macro derives so consumers only depend on `annals`.
pub use annals_macros::{Payload, Saga};

/// Appending and replaying record streams.
pub mod store {
    pub use annals_core::store::{
        AppendError, AppendResult, EventStore, ReadError, RecordStream, StorageUnavailable,
        Transaction,
    };
}

/// Storage backends.
pub mod backend {
    pub use annals_core::backend::{Backend, CommitError, NonEmpty, inmemory};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    /// `PostgreSQL` backend.
    pub mod postgres {
        pub use annals_postgres::{Error, Store};
    }
}

/// Snapshot policies and retention.
pub mod snapshot {
    pub use annals_core::snapshot::{
        ArchiveError, Archived, OfferSnapshotError, Policy, SnapshotManager, SnapshotOffer,
        SnapshotPolicy,
    };
}
