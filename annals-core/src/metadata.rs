//! Immutable record metadata.
//!
//! [`MetaData`] is an ordered string-keyed map shared behind an [`Arc`], so
//! cloning a record never copies its metadata. Every "mutation" produces a new
//! map and leaves the original untouched.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered, immutable key/value metadata attached to an event record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaData(Arc<BTreeMap<String, Value>>);

impl MetaData {
    /// The empty metadata map.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a single entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether an entry exists for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Return a copy with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut entries = (*self.0).clone();
        entries.insert(key.into(), value.into());
        Self(Arc::new(entries))
    }

    /// Return a copy containing the entries of both maps. Entries in `other`
    /// win on key collisions.
    ///
    /// Merging an empty map returns `self` without allocating.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut entries = (*self.0).clone();
        entries.extend(other.iter().map(|(k, v)| (k.to_owned(), v.clone())));
        Self(Arc::new(entries))
    }

    /// Whether both handles point at the same underlying map.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<K, V> FromIterator<(K, V)> for MetaData
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(Arc::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }
}

impl From<BTreeMap<String, Value>> for MetaData {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self(Arc::new(entries))
    }
}
