//! Optimistic concurrency conflicts.
//!
//! Writers state the last sequence number they observed when they loaded an
//! entity. The backend compares it with the sequence number it has persisted
//! at commit time and rejects the write on mismatch. The core never retries a
//! rejected write; the caller reloads and decides.

use thiserror::Error;

/// The persisted stream moved on since the writer loaded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.expected.as_ref(), .actual.as_ref()))]
pub struct ConcurrencyConflict {
    /// The last sequence number the writer expected.
    /// `None` means the writer expected a new, empty stream.
    pub expected: Option<u64>,
    /// The last sequence number actually persisted.
    /// `None` means the stream is empty.
    pub actual: Option<u64>,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(expected: Option<&u64>, actual: Option<&u64>) -> String {
    match (expected, actual) {
        (None, Some(actual)) => format!(
            "concurrency conflict: expected new stream, found sequence {actual} (hint: another \
             process created this entity; reload and retry)"
        ),
        (Some(expected), Some(actual)) => format!(
            "concurrency conflict: expected last sequence {expected}, found {actual} (hint: \
             stream was modified; reload and retry)"
        ),
        (Some(expected), None) => format!(
            "concurrency conflict: expected last sequence {expected}, found empty stream (hint: \
             the entity does not exist yet; reload and retry)"
        ),
        (None, None) => "concurrency conflict: unexpected empty state".to_string(),
    }
}
