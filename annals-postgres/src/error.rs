/// Error type for `PostgreSQL` backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A negative sequence number was read from the database.
    #[error("invalid sequence number from database: {0}")]
    InvalidSequence(i64),
    /// A sequence number does not fit the database's `BIGINT` column.
    #[error("sequence number {0} exceeds the supported range")]
    SequenceOutOfRange(u64),
}
