//! Core types for the annals event-sourcing persistence library.
//!
//! - [`event`] - Immutable event records (`EventRecord`, `StoredRecord`)
//! - [`metadata`] - Ordered, shareable record metadata (`MetaData`)
//! - [`payload`] - Payload descriptors and lazy materialization (`LazyPayload`)
//! - [`serializer`] - Serialization contract, type registry and JSON serializer
//! - [`backend`] - Persistence backend contract and in-memory backend
//! - [`store`] - Append and replay engine (`EventStore`)
//! - [`snapshot`] - Snapshot policies and retention (`SnapshotManager`)
//! - [`association`] - Saga correlation index (`AssociationIndex`)
//! - [`concurrency`] - Optimistic concurrency conflicts
//! - [`config`] - Store configuration (`StoreConfig`)
//!
//! # Example
//!
//! ```
//! use annals_core::{backend::inmemory, serializer::JsonSerializer, store::EventStore};
//!
//! let store = EventStore::new(inmemory::Backend::<String>::new(), JsonSerializer::default());
//! ```
//!
//! Most users should depend on the `annals` crate, which re-exports these
//! types together with the derive macros.

pub mod association;
pub mod backend;
pub mod concurrency;
pub mod config;
pub mod event;
pub mod metadata;
pub mod payload;
pub mod serializer;
pub mod snapshot;
pub mod store;
