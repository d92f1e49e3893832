//! Event records.
//!
//! An [`EventRecord`] is one immutable fact about one entity: who it belongs
//! to, where it sits in that entity's history, what happened (the payload) and
//! any infrastructure metadata. [`StoredRecord`] is the same fact in the form a
//! [`Backend`](crate::backend::Backend) persists.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    metadata::MetaData,
    payload::{LazyPayload, Payload, PayloadDeserializer, SerializedPayload},
    serializer::{SerializationError, Serializer},
};

/// One fact in an entity's history.
///
/// Records are immutable. Deriving a record with different metadata returns a
/// new record that shares the payload with the original, so a payload
/// materialized through either copy is materialized for both.
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "Id: Serialize, T: Payload + Serialize",
    deserialize = "Id: Deserialize<'de>, T: Payload + Deserialize<'de>"
))]
pub struct EventRecord<Id, T> {
    event_id: Uuid,
    entity_id: Id,
    sequence_number: u64,
    payload: Arc<LazyPayload<T>>,
    metadata: MetaData,
    timestamp: DateTime<Utc>,
}

impl<Id, T: Payload> EventRecord<Id, T> {
    /// Create a record for a fresh in-memory payload with empty metadata.
    pub fn new(entity_id: Id, sequence_number: u64, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_id,
            sequence_number,
            payload: Arc::new(LazyPayload::new(payload)),
            metadata: MetaData::empty(),
            timestamp: Utc::now(),
        }
    }

    /// Rebuild a record from its stored form without deserializing the
    /// payload.
    pub fn from_stored<D>(stored: StoredRecord<Id>, deserializer: Arc<D>) -> Self
    where
        D: PayloadDeserializer<T> + 'static,
    {
        Self {
            event_id: stored.event_id,
            entity_id: stored.entity_id,
            sequence_number: stored.sequence_number,
            payload: Arc::new(LazyPayload::serialized(stored.payload, deserializer)),
            metadata: stored.metadata,
            timestamp: stored.timestamp,
        }
    }
}

impl<Id, T> EventRecord<Id, T> {
    /// Unique record identifier.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Entity the record belongs to.
    #[must_use]
    pub const fn entity_id(&self) -> &Id {
        &self.entity_id
    }

    /// Position within the entity's stream.
    #[must_use]
    pub const fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The payload, materialized on first access.
    #[must_use]
    pub fn payload(&self) -> &LazyPayload<T> {
        &self.payload
    }

    /// Caller-supplied metadata.
    #[must_use]
    pub const fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    /// When the record was created.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl<Id: Clone, T> EventRecord<Id, T> {
    /// Return a record whose metadata is replaced by `metadata`.
    ///
    /// When `metadata` equals the current metadata the returned record shares
    /// the current metadata map instead of holding a copy.
    #[must_use]
    pub fn with_metadata(&self, metadata: MetaData) -> Self {
        if self.metadata == metadata {
            return self.clone();
        }
        self.derive(metadata)
    }

    /// Return a record whose metadata is merged with `additional`.
    ///
    /// Entries in `additional` replace existing entries with the same key.
    #[must_use]
    pub fn and_metadata(&self, additional: &MetaData) -> Self {
        if additional.is_empty() {
            return self.clone();
        }
        self.derive(self.metadata.merged_with(additional))
    }

    fn derive(&self, metadata: MetaData) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }
}

impl<Id: Clone, T: Payload + serde::Serialize> EventRecord<Id, T> {
    /// Produce the stored form of this record.
    ///
    /// A record that was loaded from a backend reuses its stored payload
    /// bytes; nothing is deserialized or re-serialized.
    pub fn to_stored<S: Serializer>(
        &self,
        serializer: &S,
    ) -> Result<StoredRecord<Id>, ToStoredError> {
        let payload = match self.payload.serialized_form() {
            Some(serialized) => serialized.clone(),
            None => {
                let value = self.payload.materialize().map_err(ToStoredError::Payload)?;
                serializer.serialize(value).map_err(ToStoredError::Serialization)?
            }
        };
        Ok(StoredRecord {
            event_id: self.event_id,
            entity_id: self.entity_id.clone(),
            sequence_number: self.sequence_number,
            payload,
            metadata: self.metadata.clone(),
            timestamp: self.timestamp,
        })
    }
}

/// Error turning a record into its stored form.
#[derive(Debug, thiserror::Error)]
pub enum ToStoredError {
    /// The payload value could not be serialized.
    #[error(transparent)]
    Serialization(SerializationError),
    /// The payload had to be materialized first and that failed.
    #[error(transparent)]
    Payload(crate::serializer::DeserializationError),
}

impl<Id: Clone, T> Clone for EventRecord<Id, T> {
    fn clone(&self) -> Self {
        Self {
            event_id: self.event_id,
            entity_id: self.entity_id.clone(),
            sequence_number: self.sequence_number,
            payload: Arc::clone(&self.payload),
            metadata: self.metadata.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl<Id: fmt::Debug, T: fmt::Debug> fmt::Debug for EventRecord<Id, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("event_id", &self.event_id)
            .field("entity_id", &self.entity_id)
            .field("sequence_number", &self.sequence_number)
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Record in the form a backend persists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord<Id> {
    /// Unique record identifier.
    pub event_id: Uuid,
    /// Entity the record belongs to.
    pub entity_id: Id,
    /// Position within the entity's stream, from 0.
    pub sequence_number: u64,
    /// Serialized payload.
    pub payload: SerializedPayload,
    /// Caller-supplied metadata.
    pub metadata: MetaData,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::serializer::JsonSerializer;

    #[test]
    fn new_record_has_empty_metadata() {
        let record = EventRecord::new("a".to_string(), 0, 1_i64);
        assert!(record.metadata().is_empty());
        assert_eq!(record.sequence_number(), 0);
        assert_eq!(record.entity_id(), "a");
    }

    #[test]
    fn with_metadata_copies_and_leaves_original_untouched() {
        let original = EventRecord::new("a".to_string(), 0, 1_i64);
        let derived = original.with_metadata(MetaData::empty().with("user", "alice"));

        assert!(original.metadata().is_empty());
        assert_eq!(derived.metadata().get("user"), Some(&json!("alice")));
        assert_eq!(derived.event_id(), original.event_id());
        assert_eq!(derived.sequence_number(), original.sequence_number());
        assert_eq!(derived.timestamp(), original.timestamp());
    }

    #[test]
    fn with_equal_metadata_is_a_no_op() {
        let original = EventRecord::new("a".to_string(), 0, 1_i64)
            .with_metadata(MetaData::empty().with("user", "alice"));
        let same = original.with_metadata(MetaData::empty().with("user", "alice"));
        assert!(same.metadata().ptr_eq(original.metadata()));
    }

    #[test]
    fn and_metadata_merges() {
        let original = EventRecord::new("a".to_string(), 0, 1_i64)
            .with_metadata(MetaData::empty().with("user", "alice"));
        let derived = original.and_metadata(&MetaData::empty().with("trace", "t-1"));

        assert_eq!(derived.metadata().len(), 2);
        assert_eq!(original.metadata().len(), 1);
    }

    #[test]
    fn and_empty_metadata_is_a_no_op() {
        let original = EventRecord::new("a".to_string(), 0, 1_i64)
            .with_metadata(MetaData::empty().with("user", "alice"));
        let same = original.and_metadata(&MetaData::empty());
        assert!(same.metadata().ptr_eq(original.metadata()));
    }

    #[test]
    fn derived_records_share_payload() {
        let serializer = Arc::new(JsonSerializer::default());
        let stored = EventRecord::new("a".to_string(), 3, 9_i64)
            .to_stored(serializer.as_ref())
            .unwrap();
        let loaded: EventRecord<String, i64> = EventRecord::from_stored(stored, serializer);
        let derived = loaded.with_metadata(MetaData::empty().with("k", "v"));

        assert_eq!(*derived.payload().materialize().unwrap(), 9);
        assert!(loaded.payload().is_materialized());
    }

    #[test]
    fn stored_form_reuses_loaded_bytes() {
        let serializer = Arc::new(JsonSerializer::default());
        let stored = EventRecord::new("a".to_string(), 0, 5_i64)
            .to_stored(serializer.as_ref())
            .unwrap();
        let loaded: EventRecord<String, i64> =
            EventRecord::from_stored(stored.clone(), Arc::clone(&serializer));

        let restored = loaded.to_stored(serializer.as_ref()).unwrap();
        assert!(!loaded.payload().is_materialized());
        assert_eq!(restored, stored);
    }

    #[test]
    fn nested_serialization_materializes_payload() {
        let serializer = Arc::new(JsonSerializer::default());
        let stored = EventRecord::new("a".to_string(), 0, 5_i64)
            .to_stored(serializer.as_ref())
            .unwrap();
        let loaded: EventRecord<String, i64> = EventRecord::from_stored(stored, serializer);

        let json = serde_json::to_value(&loaded).unwrap();
        assert_eq!(json["payload"], json!(5));

        let reloaded: EventRecord<String, i64> = serde_json::from_value(json).unwrap();
        assert!(reloaded.payload().is_materialized());
        assert_eq!(reloaded.event_id(), loaded.event_id());
    }
}
