//! Payload type descriptors and lazily materialized payloads.
//!
//! Records loaded from a backend carry their payload in serialized form.
//! [`LazyPayload`] keeps that form together with the deserializer that can
//! turn it back into a value, and only does so when the value is first
//! requested.
//!
//! ```
//! use std::sync::Arc;
//!
//! use annals_core::{
//!     payload::{LazyPayload, Payload},
//!     serializer::{JsonSerializer, Serializer},
//! };
//!
//! let serializer = Arc::new(JsonSerializer::default());
//! let stored = serializer.serialize(&42_i64).unwrap();
//!
//! let payload: LazyPayload<i64> = LazyPayload::serialized(stored, serializer);
//! assert!(!payload.is_materialized());
//! assert_eq!(payload.declared_type().unwrap().name(), "i64");
//! assert!(!payload.is_materialized());
//!
//! assert_eq!(*payload.materialize().unwrap(), 42);
//! assert!(payload.is_materialized());
//! ```

use std::{
    borrow::Cow,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer as SerdeSerializer};

use crate::serializer::DeserializationError;

/// Descriptor of a payload's type as recorded next to its serialized form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadType {
    name: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<Cow<'static, str>>,
}

impl PayloadType {
    /// Descriptor without a revision.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            revision: None,
        }
    }

    /// Attach a schema revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<Cow<'static, str>>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Stable name the type is stored under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Revision of the type's schema, if one was recorded.
    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(revision) => write!(f, "{}@{revision}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A payload in its stored form: the raw bytes plus the descriptor of the
/// type they were produced from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPayload {
    /// Descriptor recorded when the value was serialized.
    pub payload_type: PayloadType,
    /// Serializer output.
    pub data: Vec<u8>,
}

/// Application types that can travel as record payloads.
///
/// Each payload value reports the descriptor it is stored under. Sum types
/// report one descriptor per variant and list all of them in
/// [`Self::TYPE_NAMES`], which is what a strict
/// [`TypeRegistry`](crate::serializer::TypeRegistry) registers.
///
/// Most projects derive this with `#[derive(Payload)]`.
pub trait Payload {
    /// Every descriptor name this type can produce.
    const TYPE_NAMES: &'static [&'static str];

    /// Descriptor for this particular value.
    fn payload_type(&self) -> PayloadType;
}

macro_rules! impl_payload {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl Payload for $ty {
                const TYPE_NAMES: &'static [&'static str] = &[$name];

                fn payload_type(&self) -> PayloadType {
                    PayloadType::new($name)
                }
            }
        )*
    };
}

impl_payload!(
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    String => "string",
    serde_json::Value => "json",
);

/// Object-safe view of a serializer, bound to one payload type.
///
/// [`LazyPayload`] holds one of these so it can materialize itself without
/// knowing the concrete serializer. Every
/// [`Serializer`](crate::serializer::Serializer) gets an implementation for
/// free.
pub trait PayloadDeserializer<T>: Send + Sync {
    /// Produce a value from its serialized form.
    fn deserialize(&self, serialized: &SerializedPayload) -> Result<T, DeserializationError>;

    /// Map a stored descriptor to the type it currently deserializes as.
    ///
    /// Returns `Ok(None)` when the descriptor carries too little information
    /// and the value has to be materialized to find out.
    fn resolve_type(&self, stored: &PayloadType) -> Result<Option<PayloadType>, DeserializationError>;
}

/// A stored form waiting to be deserialized, with the cell its value is
/// published into.
struct Deferred<T> {
    serialized: SerializedPayload,
    deserializer: Arc<dyn PayloadDeserializer<T>>,
    value: OnceLock<T>,
    materializing: Mutex<()>,
}

impl<T: Payload> Deferred<T> {
    fn resolve_type(&self) -> Result<Option<PayloadType>, DeserializationError> {
        self.deserializer.resolve_type(&self.serialized.payload_type)
    }

    fn materialize(&self, declared: &OnceLock<PayloadType>) -> Result<&T, DeserializationError> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let _guard = self
            .materializing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        tracing::trace!(payload_type = %self.serialized.payload_type, "materializing payload");
        let value = self.deserializer.deserialize(&self.serialized)?;
        let actual = value.payload_type();

        let expected = match declared.get() {
            Some(declared) => Some(declared.clone()),
            None => self.resolve_type()?,
        };
        match expected {
            Some(expected) if expected.name() != actual.name() => {
                return Err(DeserializationError::TypeMismatch {
                    declared: expected,
                    actual,
                });
            }
            Some(expected) => {
                declared.get_or_init(|| expected);
            }
            None => {
                declared.get_or_init(|| actual);
            }
        }

        Ok(self.value.get_or_init(|| value))
    }
}

enum State<T> {
    /// Built from a value; never deserialized.
    Ready(T),
    Deferred(Deferred<T>),
}

/// A payload that is deserialized on first access and cached afterwards.
///
/// Concurrent first access is serialized on an internal lock: exactly one
/// caller deserializes and publishes the value, everyone else observes the
/// finished result. Once the value is published, reads never touch the lock.
///
/// A failed materialization caches nothing; the stored form is left as it was.
pub struct LazyPayload<T> {
    state: State<T>,
    declared: OnceLock<PayloadType>,
}

impl<T: Payload> LazyPayload<T> {
    /// Wrap an in-memory value. No deserialization will ever happen.
    pub fn new(value: T) -> Self {
        let declared = OnceLock::from(value.payload_type());
        Self {
            state: State::Ready(value),
            declared,
        }
    }

    /// Wrap a stored form to be deserialized on demand.
    pub fn serialized<D>(serialized: SerializedPayload, deserializer: Arc<D>) -> Self
    where
        D: PayloadDeserializer<T> + 'static,
    {
        Self {
            state: State::Deferred(Deferred {
                serialized,
                deserializer,
                value: OnceLock::new(),
                materializing: Mutex::new(()),
            }),
            declared: OnceLock::new(),
        }
    }

    /// The payload's declared type.
    ///
    /// Resolved from the stored descriptor when possible, so inspecting the
    /// type of a record does not pay for deserializing it.
    pub fn declared_type(&self) -> Result<&PayloadType, DeserializationError> {
        if let Some(declared) = self.declared.get() {
            return Ok(declared);
        }
        if let State::Deferred(deferred) = &self.state
            && let Some(resolved) = deferred.resolve_type()?
        {
            return Ok(self.declared.get_or_init(|| resolved));
        }
        let value = self.materialize()?;
        Ok(self.declared.get_or_init(|| value.payload_type()))
    }

    /// Return the payload value, deserializing it on first call.
    pub fn materialize(&self) -> Result<&T, DeserializationError> {
        match &self.state {
            State::Ready(value) => Ok(value),
            State::Deferred(deferred) => deferred.materialize(&self.declared),
        }
    }
}

impl<T> LazyPayload<T> {
    fn cached(&self) -> Option<&T> {
        match &self.state {
            State::Ready(value) => Some(value),
            State::Deferred(deferred) => deferred.value.get(),
        }
    }

    /// Whether the value is available without deserializing.
    pub fn is_materialized(&self) -> bool {
        self.cached().is_some()
    }

    /// The stored form this payload was loaded from, if any.
    pub fn serialized_form(&self) -> Option<&SerializedPayload> {
        match &self.state {
            State::Ready(_) => None,
            State::Deferred(deferred) => Some(&deferred.serialized),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LazyPayload<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LazyPayload");
        match (self.cached(), self.serialized_form()) {
            (Some(value), _) => debug.field("value", value),
            (None, serialized) => debug.field("serialized", &serialized.map(|s| &s.payload_type)),
        };
        debug.finish_non_exhaustive()
    }
}

/// Serializing the wrapper forces materialization, so the output never
/// depends on the stored form or the deserializer it was loaded with.
impl<T> Serialize for LazyPayload<T>
where
    T: Payload + Serialize,
{
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.materialize()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for LazyPayload<T>
where
    T: Payload + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self::new)
    }
}
