//! Payload serialization contract.
//!
//! The core never inspects payload bytes itself. It hands values to a
//! [`Serializer`] on append and gives the stored form back to it (through
//! [`LazyPayload`](crate::payload::LazyPayload)) on read.
//!
//! Type resolution is explicit: a [`TypeRegistry`] maps stored descriptors to
//! the types they deserialize as, including aliases for renamed types.

use std::{collections::HashMap, error::Error as StdError};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::payload::{Payload, PayloadDeserializer, PayloadType, SerializedPayload};

/// Boxed source error used by serializers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A payload could not be turned into its stored form.
#[derive(Debug, Error)]
#[error("failed to serialize payload `{payload_type}`: {source}")]
pub struct SerializationError {
    /// Descriptor of the value being serialized.
    pub payload_type: PayloadType,
    /// Underlying serializer error.
    #[source]
    pub source: BoxError,
}

/// A stored payload could not be materialized.
#[derive(Debug, Error)]
pub enum DeserializationError {
    /// The stored bytes do not decode as the declared type.
    #[error("malformed payload `{payload_type}`: {source}")]
    Malformed {
        /// Descriptor the bytes were stored under.
        payload_type: PayloadType,
        /// Underlying decoder error.
        #[source]
        source: BoxError,
    },
    /// The registry has no type registered under the stored descriptor.
    #[error("no payload type registered for `{0}`")]
    UnknownType(PayloadType),
    /// The bytes decoded, but into a different type than the descriptor
    /// declares.
    #[error("payload declared as `{declared}` materialized as `{actual}`")]
    TypeMismatch {
        /// Type the stored descriptor resolved to.
        declared: PayloadType,
        /// Type of the decoded value.
        actual: PayloadType,
    },
}

impl DeserializationError {
    /// Wrap a decoder error.
    pub fn malformed(payload_type: PayloadType, source: impl Into<BoxError>) -> Self {
        Self::Malformed {
            payload_type,
            source: source.into(),
        }
    }
}

/// Converts payload values to and from their stored form.
pub trait Serializer: Send + Sync + 'static {
    /// Produce the stored form of `value`, tagged with its descriptor.
    fn serialize<T>(&self, value: &T) -> Result<SerializedPayload, SerializationError>
    where
        T: Payload + Serialize;

    /// Rebuild a value from its stored form.
    fn deserialize<T>(&self, serialized: &SerializedPayload) -> Result<T, DeserializationError>
    where
        T: DeserializeOwned;

    /// Map a stored descriptor to the type it currently deserializes as.
    ///
    /// `Ok(None)` means the descriptor is not enough to tell.
    fn resolve_type(&self, stored: &PayloadType) -> Result<Option<PayloadType>, DeserializationError>;
}

impl<T, S> PayloadDeserializer<T> for S
where
    S: Serializer,
    T: DeserializeOwned,
{
    fn deserialize(&self, serialized: &SerializedPayload) -> Result<T, DeserializationError> {
        Serializer::deserialize(self, serialized)
    }

    fn resolve_type(&self, stored: &PayloadType) -> Result<Option<PayloadType>, DeserializationError> {
        Serializer::resolve_type(self, stored)
    }
}

/// Explicit mapping from stored descriptor names to payload types.
///
/// A permissive registry (the default) resolves every descriptor to itself,
/// applying aliases first. A strict registry only resolves names that were
/// registered or aliased.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    known: HashMap<String, PayloadType>,
    strict: bool,
}

impl TypeRegistry {
    /// Registry that accepts any descriptor.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Registry that rejects descriptors it does not know.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            known: HashMap::new(),
            strict: true,
        }
    }

    /// Register every descriptor `T` can produce.
    #[must_use]
    pub fn register<T: Payload>(mut self) -> Self {
        for name in T::TYPE_NAMES {
            self.known
                .insert((*name).to_owned(), PayloadType::new(*name));
        }
        self
    }

    /// Resolve a legacy descriptor name to a current payload type.
    #[must_use]
    pub fn alias(mut self, stored_name: impl Into<String>, current: PayloadType) -> Self {
        self.known.insert(stored_name.into(), current);
        self
    }

    /// Resolve a stored descriptor.
    pub fn resolve(&self, stored: &PayloadType) -> Result<Option<PayloadType>, DeserializationError> {
        if stored.name().is_empty() {
            return Ok(None);
        }
        match self.known.get(stored.name()) {
            Some(current) => Ok(Some(current.clone())),
            None if self.strict => Err(DeserializationError::UnknownType(stored.clone())),
            None => Ok(Some(stored.clone())),
        }
    }
}

/// JSON serializer backed by `serde_json`.
#[derive(Clone, Debug, Default)]
pub struct JsonSerializer {
    registry: TypeRegistry,
}

impl JsonSerializer {
    /// Serializer resolving descriptors through `registry`.
    #[must_use]
    pub const fn new(registry: TypeRegistry) -> Self {
        Self { registry }
    }

    /// The type registry in use.
    #[must_use]
    pub const fn registry(&self) -> &TypeRegistry {
        &self.registry
    }
}

impl Serializer for JsonSerializer {
    fn serialize<T>(&self, value: &T) -> Result<SerializedPayload, SerializationError>
    where
        T: Payload + Serialize,
    {
        let payload_type = value.payload_type();
        match serde_json::to_vec(value) {
            Ok(data) => Ok(SerializedPayload { payload_type, data }),
            Err(e) => Err(SerializationError {
                payload_type,
                source: Box::new(e),
            }),
        }
    }

    fn deserialize<T>(&self, serialized: &SerializedPayload) -> Result<T, DeserializationError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&serialized.data)
            .map_err(|e| DeserializationError::malformed(serialized.payload_type.clone(), e))
    }

    fn resolve_type(&self, stored: &PayloadType) -> Result<Option<PayloadType>, DeserializationError> {
        self.registry.resolve(stored)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Payload for OrderPlaced {
        const TYPE_NAMES: &'static [&'static str] = &["order-placed"];

        fn payload_type(&self) -> PayloadType {
            PayloadType::new("order-placed")
        }
    }

    #[test]
    fn json_serializer_roundtrips() {
        let serializer = JsonSerializer::default();
        let value = OrderPlaced {
            order_id: "42".into(),
        };

        let stored = serializer.serialize(&value).unwrap();
        assert_eq!(stored.payload_type.name(), "order-placed");

        let decoded: OrderPlaced = Serializer::deserialize(&serializer, &stored).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_serializer_rejects_invalid_json() {
        let serializer = JsonSerializer::default();
        let stored = SerializedPayload {
            payload_type: PayloadType::new("order-placed"),
            data: b"not valid json".to_vec(),
        };
        let result: Result<OrderPlaced, _> = Serializer::deserialize(&serializer, &stored);
        assert!(matches!(result, Err(DeserializationError::Malformed { .. })));
    }

    #[test]
    fn json_serializer_rejects_wrong_shape() {
        let serializer = JsonSerializer::default();
        let stored = SerializedPayload {
            payload_type: PayloadType::new("order-placed"),
            data: br#"{"wrong_field":123}"#.to_vec(),
        };
        let result: Result<OrderPlaced, _> = Serializer::deserialize(&serializer, &stored);
        assert!(result.is_err());
    }

    #[test]
    fn permissive_registry_resolves_to_itself() {
        let registry = TypeRegistry::permissive();
        let resolved = registry.resolve(&PayloadType::new("anything")).unwrap();
        assert_eq!(resolved, Some(PayloadType::new("anything")));
    }

    #[test]
    fn strict_registry_rejects_unknown_names() {
        let registry = TypeRegistry::strict().register::<OrderPlaced>();

        assert!(registry.resolve(&PayloadType::new("order-placed")).is_ok());
        let err = registry
            .resolve(&PayloadType::new("order-cancelled"))
            .unwrap_err();
        assert!(matches!(err, DeserializationError::UnknownType(_)));
    }

    #[test]
    fn aliases_resolve_renamed_types() {
        let registry = TypeRegistry::strict()
            .register::<OrderPlaced>()
            .alias("order-created", PayloadType::new("order-placed"));

        let resolved = registry.resolve(&PayloadType::new("order-created")).unwrap();
        assert_eq!(resolved, Some(PayloadType::new("order-placed")));
    }

    #[test]
    fn empty_descriptor_is_unresolved() {
        let registry = TypeRegistry::strict();
        assert_eq!(registry.resolve(&PayloadType::new("")).unwrap(), None);
    }
}
