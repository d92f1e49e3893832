//! Saga association index.
//!
//! Sagas are long-running processes that are not addressed by a single entity
//! identifier. Instead each saga instance registers [`Association`]s, plain
//! `(key, value)` pairs such as `("orderId", "42")`, and inbound events are
//! routed to every saga of a given type that holds a matching pair.
//!
//! [`AssociationIndex`] is an explicitly constructed value. Whoever dispatches
//! events to sagas owns it (or a clone of it; clones share state).
//!
//! ```
//! use annals_core::association::AssociationIndex;
//!
//! let index = AssociationIndex::new();
//! index.add("OrderSaga", "saga-1");
//! index.associate(&"saga-1", "orderId", "42").unwrap();
//!
//! assert!(index.find("OrderSaga", "orderId", "42").contains("saga-1"));
//! index.remove(&"saga-1");
//! assert!(index.find("OrderSaga", "orderId", "42").is_empty());
//! ```

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    hash::Hash,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A saga type.
///
/// `KIND` is the name sagas of this type are registered and looked up under.
/// Usually derived with `#[derive(Saga)]`.
pub trait Saga {
    /// Registration name of the saga type.
    const KIND: &'static str;
}

/// Rejected association request. The index is left unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidAssociation {
    /// The key was empty.
    #[error("association key must not be empty")]
    EmptyKey,
    /// The value was empty.
    #[error("association value for key `{key}` must not be empty")]
    EmptyValue { key: String },
    /// The saga was never added to the index or has been removed.
    #[error("saga {0} is not registered")]
    UnknownSaga(String),
}

/// A `(key, value)` pair correlating events with saga instances.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Association {
    key: String,
    value: String,
}

impl Association {
    /// Build an association, rejecting empty keys and values.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self, InvalidAssociation> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() {
            return Err(InvalidAssociation::EmptyKey);
        }
        if value.is_empty() {
            return Err(InvalidAssociation::EmptyValue { key });
        }
        Ok(Self { key, value })
    }

    /// The correlation key, for example `orderId`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value the key must carry.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

struct SagaEntry {
    saga_type: String,
    associations: BTreeSet<Association>,
}

/// key -> value -> saga ids
type Postings<Id> = HashMap<String, HashMap<String, HashSet<Id>>>;

struct Inner<Id> {
    postings: Postings<Id>,
    sagas: HashMap<Id, SagaEntry>,
}

impl<Id: Eq + Hash> Inner<Id> {
    fn ids(&self, key: &str, value: &str) -> Option<&HashSet<Id>> {
        self.postings.get(key)?.get(value)
    }

    fn unlink(&mut self, saga_id: &Id, association: &Association) {
        let Some(values) = self.postings.get_mut(association.key()) else {
            return;
        };
        if let Some(ids) = values.get_mut(association.value()) {
            ids.remove(saga_id);
            if ids.is_empty() {
                values.remove(association.value());
            }
        }
        if values.is_empty() {
            self.postings.remove(association.key());
        }
    }
}

/// Concurrent many-to-many index from associations to saga instances.
///
/// All reads and writes go through one lock whose critical sections are
/// short and never span I/O, so [`find`](Self::find) always reflects every
/// mutation that completed before it, and [`remove`](Self::remove) drops a
/// saga and all of its associations in one step.
pub struct AssociationIndex<Id> {
    inner: Arc<RwLock<Inner<Id>>>,
}

impl<Id> Clone for AssociationIndex<Id> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Id> Default for AssociationIndex<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> AssociationIndex<Id> {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                postings: HashMap::new(),
                sagas: HashMap::new(),
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<Id>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<Id>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<Id> AssociationIndex<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug,
{
    /// Register a live saga instance.
    ///
    /// Returns `false` if the saga was already registered; its type and
    /// associations are left as they were.
    pub fn add(&self, saga_type: &str, saga_id: Id) -> bool {
        let mut inner = self.write();
        if inner.sagas.contains_key(&saga_id) {
            return false;
        }
        tracing::trace!(saga_type, ?saga_id, "saga added");
        inner.sagas.insert(
            saga_id,
            SagaEntry {
                saga_type: saga_type.to_owned(),
                associations: BTreeSet::new(),
            },
        );
        true
    }

    /// Associate a registered saga with `(key, value)`.
    ///
    /// Idempotent: associating twice is the same as associating once.
    pub fn associate(
        &self,
        saga_id: &Id,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), InvalidAssociation> {
        let association = Association::new(key, value)?;
        let mut inner = self.write();
        let Some(entry) = inner.sagas.get_mut(saga_id) else {
            return Err(InvalidAssociation::UnknownSaga(format!("{saga_id:?}")));
        };
        if !entry.associations.insert(association.clone()) {
            return Ok(());
        }
        tracing::trace!(?saga_id, %association, "saga associated");
        let Association { key, value } = association;
        inner
            .postings
            .entry(key)
            .or_default()
            .entry(value)
            .or_default()
            .insert(saga_id.clone());
        Ok(())
    }

    /// Remove one association from a saga. Returns whether it was present.
    pub fn dissociate(&self, saga_id: &Id, key: &str, value: &str) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.sagas.get_mut(saga_id) else {
            return false;
        };
        let association = Association {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        if !entry.associations.remove(&association) {
            return false;
        }
        inner.unlink(saga_id, &association);
        tracing::trace!(?saga_id, %association, "saga dissociated");
        true
    }

    /// Ids of all sagas of `saga_type` currently associated with
    /// `(key, value)`.
    #[must_use]
    pub fn find(&self, saga_type: &str, key: &str, value: &str) -> HashSet<Id> {
        let inner = self.read();
        inner.ids(key, value).map_or_else(HashSet::new, |ids| {
            ids.iter()
                .filter(|id| {
                    inner
                        .sagas
                        .get(*id)
                        .is_some_and(|entry| entry.saga_type == saga_type)
                })
                .cloned()
                .collect()
        })
    }

    /// Whether the saga currently holds `(key, value)`.
    #[must_use]
    pub fn is_associated(&self, saga_id: &Id, key: &str, value: &str) -> bool {
        self.read()
            .ids(key, value)
            .is_some_and(|ids| ids.contains(saga_id))
    }

    /// All associations of a saga, ordered by key then value. Empty for
    /// unknown sagas.
    #[must_use]
    pub fn associations(&self, saga_id: &Id) -> Vec<Association> {
        self.read()
            .sagas
            .get(saga_id)
            .map(|entry| entry.associations.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete a saga and every association it holds. Returns whether the
    /// saga was registered.
    pub fn remove(&self, saga_id: &Id) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.sagas.remove(saga_id) else {
            return false;
        };
        for association in &entry.associations {
            inner.unlink(saga_id, association);
        }
        tracing::trace!(
            ?saga_id,
            associations = entry.associations.len(),
            "saga removed"
        );
        true
    }

    /// Number of live sagas of `saga_type`.
    #[must_use]
    pub fn count(&self, saga_type: &str) -> usize {
        self.read()
            .sagas
            .values()
            .filter(|entry| entry.saga_type == saga_type)
            .count()
    }

    /// Whether the saga is registered.
    #[must_use]
    pub fn contains(&self, saga_id: &Id) -> bool {
        self.read().sagas.contains_key(saga_id)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn rejects_empty_key_or_value() {
        assert_eq!(Association::new("", "42"), Err(InvalidAssociation::EmptyKey));
        assert_eq!(
            Association::new("orderId", ""),
            Err(InvalidAssociation::EmptyValue {
                key: "orderId".into()
            })
        );
    }

    #[test]
    fn invalid_associate_leaves_index_unchanged() {
        let index = AssociationIndex::new();
        index.add("OrderSaga", 1);

        assert!(index.associate(&1, "", "x").is_err());
        assert!(index.associations(&1).is_empty());
    }

    #[test]
    fn associating_unknown_saga_fails() {
        let index = AssociationIndex::<u32>::new();
        let err = index.associate(&7, "orderId", "42").unwrap_err();
        assert_eq!(err, InvalidAssociation::UnknownSaga("7".into()));
    }

    #[test]
    fn find_is_scoped_by_type() {
        let index = AssociationIndex::new();
        index.add("OrderSaga", 1);
        index.add("ShippingSaga", 2);
        index.associate(&1, "orderId", "42").unwrap();
        index.associate(&2, "orderId", "42").unwrap();

        assert_eq!(index.find("OrderSaga", "orderId", "42"), HashSet::from([1]));
        assert_eq!(index.find("ShippingSaga", "orderId", "42"), HashSet::from([2]));
        assert!(index.find("OrderSaga", "orderId", "43").is_empty());
    }

    #[test]
    fn associate_is_idempotent() {
        let index = AssociationIndex::new();
        index.add("OrderSaga", 1);
        index.associate(&1, "orderId", "42").unwrap();
        index.associate(&1, "orderId", "42").unwrap();

        assert_eq!(index.associations(&1).len(), 1);
        assert!(index.dissociate(&1, "orderId", "42"));
        assert!(!index.is_associated(&1, "orderId", "42"));
        assert!(!index.dissociate(&1, "orderId", "42"));
    }

    #[test]
    fn dissociate_removes_only_the_named_pair() {
        let index = AssociationIndex::new();
        index.add("OrderSaga", 1);
        index.add("OrderSaga", 2);
        index.associate(&1, "orderId", "42").unwrap();
        index.associate(&1, "orderId", "43").unwrap();
        index.associate(&2, "orderId", "42").unwrap();

        assert!(!index.dissociate(&1, "orderId", "44"));
        assert!(!index.dissociate(&3, "orderId", "42"));
        assert!(index.dissociate(&1, "orderId", "42"));

        assert_eq!(index.find("OrderSaga", "orderId", "42"), HashSet::from([2]));
        assert_eq!(index.find("OrderSaga", "orderId", "43"), HashSet::from([1]));
        assert_eq!(index.associations(&1).len(), 1);
    }

    #[test]
    fn one_saga_many_associations() {
        let index = AssociationIndex::new();
        index.add("OrderSaga", 1);
        index.associate(&1, "orderId", "42").unwrap();
        index.associate(&1, "customerId", "c-9").unwrap();

        let keys: Vec<_> = index
            .associations(&1)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, vec!["customerId=c-9", "orderId=42"]);
    }

    #[test]
    fn remove_drops_every_association() {
        let index = AssociationIndex::new();
        index.add("OrderSaga", 1);
        index.add("OrderSaga", 2);
        index.associate(&1, "orderId", "42").unwrap();
        index.associate(&1, "customerId", "c-9").unwrap();
        index.associate(&2, "orderId", "42").unwrap();

        assert!(index.remove(&1));
        assert!(!index.remove(&1));
        assert_eq!(index.find("OrderSaga", "orderId", "42"), HashSet::from([2]));
        assert!(index.find("OrderSaga", "customerId", "c-9").is_empty());
        assert_eq!(index.count("OrderSaga"), 1);
    }

    #[test]
    fn re_adding_keeps_existing_state() {
        let index = AssociationIndex::new();
        assert!(index.add("OrderSaga", 1));
        index.associate(&1, "orderId", "42").unwrap();
        assert!(!index.add("ShippingSaga", 1));

        assert_eq!(index.count("ShippingSaga"), 0);
        assert!(index.is_associated(&1, "orderId", "42"));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let index = AssociationIndex::new();
        let handles: Vec<_> = (0..8_u32)
            .map(|n| {
                let index = index.clone();
                thread::spawn(move || {
                    index.add("OrderSaga", n);
                    index.associate(&n, "batch", "b-1").unwrap();
                    index.associate(&n, "saga", n.to_string()).unwrap();
                    if n % 2 == 0 {
                        index.remove(&n);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.count("OrderSaga"), 4);
        assert_eq!(
            index.find("OrderSaga", "batch", "b-1"),
            HashSet::from([1, 3, 5, 7])
        );
        assert!(index.find("OrderSaga", "saga", "2").is_empty());
    }
}
