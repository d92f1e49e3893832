//! `PostgreSQL` persistence for annals.
//!
//! [`Store`] implements [`annals_core::backend::Backend`] over three tables:
//!
//! - `annals_streams` - one row per entity holding its last sequence number;
//!   the row lock taken on it serializes concurrent writers
//! - `annals_events` - the append-only record streams
//! - `annals_snapshots` - archived snapshots, at most one per sequence number
//!
//! Entities are addressed by [`Uuid`].

mod error;

use annals_core::{
    backend::{Backend, CommitError},
    concurrency::ConcurrencyConflict,
    event::StoredRecord,
    metadata::MetaData,
    payload::{PayloadType, SerializedPayload},
};
use chrono::{DateTime, Utc};
pub use error::Error;
use nonempty::NonEmpty;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow, types::Json};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "event_id, entity_id, sequence_number, payload_type, \
                              payload_revision, data, metadata, recorded_at";

/// A PostgreSQL-backed [`Backend`].
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Backend over `pool`. Call [`migrate`](Self::migrate) before first use.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS annals_streams (
                entity_id     UUID PRIMARY KEY,
                last_sequence BIGINT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for table in ["annals_events", "annals_snapshots"] {
            sqlx::query(&format!(
                r"
                CREATE TABLE IF NOT EXISTS {table} (
                    entity_id        UUID NOT NULL,
                    sequence_number  BIGINT NOT NULL,
                    event_id         UUID NOT NULL,
                    payload_type     TEXT NOT NULL,
                    payload_revision TEXT NULL,
                    data             BYTEA NOT NULL,
                    metadata         JSONB NOT NULL,
                    recorded_at      TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (entity_id, sequence_number)
                )
                "
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

fn to_db_sequence(sequence: u64) -> Result<i64, Error> {
    i64::try_from(sequence).map_err(|_| Error::SequenceOutOfRange(sequence))
}

fn from_db_sequence(sequence: i64) -> Result<u64, Error> {
    u64::try_from(sequence).map_err(|_| Error::InvalidSequence(sequence))
}

fn decode_record(row: &PgRow) -> Result<StoredRecord<Uuid>, Error> {
    let name: String = row.try_get("payload_type")?;
    let revision: Option<String> = row.try_get("payload_revision")?;
    let mut payload_type = PayloadType::new(name);
    if let Some(revision) = revision {
        payload_type = payload_type.with_revision(revision);
    }
    let Json(metadata): Json<MetaData> = row.try_get("metadata")?;
    let timestamp: DateTime<Utc> = row.try_get("recorded_at")?;

    Ok(StoredRecord {
        event_id: row.try_get("event_id")?,
        entity_id: row.try_get("entity_id")?,
        sequence_number: from_db_sequence(row.try_get("sequence_number")?)?,
        payload: SerializedPayload {
            payload_type,
            data: row.try_get("data")?,
        },
        metadata,
        timestamp,
    })
}

fn backend_error(err: impl Into<Error>) -> CommitError<Error> {
    CommitError::Backend(err.into())
}

impl Backend for Store {
    type Error = Error;
    type Id = Uuid;

    #[tracing::instrument(skip(self, records), fields(record_count = records.len()))]
    async fn put_records<'a>(
        &'a self,
        entity_id: &'a Uuid,
        expected_last: Option<u64>,
        records: NonEmpty<StoredRecord<Uuid>>,
    ) -> Result<(), CommitError<Error>> {
        let expected = expected_last
            .map(to_db_sequence)
            .transpose()
            .map_err(backend_error)?;
        let mut sequences = Vec::with_capacity(records.len());
        for record in &records {
            sequences.push(to_db_sequence(record.sequence_number).map_err(backend_error)?);
        }
        let new_last = sequences.last().copied();

        let mut tx = self.pool.begin().await.map_err(backend_error)?;

        sqlx::query(
            r"
            INSERT INTO annals_streams (entity_id, last_sequence)
            VALUES ($1, NULL)
            ON CONFLICT (entity_id) DO NOTHING
            ",
        )
        .bind(entity_id)
        .execute(&mut *tx)
        .await
        .map_err(backend_error)?;

        let current: Option<i64> = sqlx::query_scalar(
            r"SELECT last_sequence FROM annals_streams WHERE entity_id = $1 FOR UPDATE",
        )
        .bind(entity_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend_error)?;

        if current != expected {
            let actual = current
                .map(from_db_sequence)
                .transpose()
                .map_err(backend_error)?;
            return Err(ConcurrencyConflict {
                expected: expected_last,
                actual,
            }
            .into());
        }

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO annals_events ({RECORD_COLUMNS}) "
        ));
        qb.push_values(records.iter().zip(sequences), |mut b, (record, sequence)| {
            b.push_bind(record.event_id)
                .push_bind(record.entity_id)
                .push_bind(sequence)
                .push_bind(record.payload.payload_type.name().to_owned())
                .push_bind(record.payload.payload_type.revision().map(str::to_owned))
                .push_bind(record.payload.data.clone())
                .push_bind(Json(record.metadata.clone()))
                .push_bind(record.timestamp);
        });
        qb.build().execute(&mut *tx).await.map_err(backend_error)?;

        sqlx::query(r"UPDATE annals_streams SET last_sequence = $2 WHERE entity_id = $1")
            .bind(entity_id)
            .bind(new_last)
            .execute(&mut *tx)
            .await
            .map_err(backend_error)?;

        tx.commit().await.map_err(backend_error)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_records<'a>(
        &'a self,
        entity_id: &'a Uuid,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredRecord<Uuid>>, Error> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {RECORD_COLUMNS}
            FROM annals_events
            WHERE entity_id = $1 AND sequence_number >= $2
            ORDER BY sequence_number ASC
            LIMIT $3
            "
        ))
        .bind(entity_id)
        .bind(to_db_sequence(from_sequence)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_record).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn last_sequence<'a>(&'a self, entity_id: &'a Uuid) -> Result<Option<u64>, Error> {
        let last: Option<Option<i64>> =
            sqlx::query_scalar(r"SELECT last_sequence FROM annals_streams WHERE entity_id = $1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        last.flatten().map(from_db_sequence).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn latest_snapshot<'a>(
        &'a self,
        entity_id: &'a Uuid,
    ) -> Result<Option<StoredRecord<Uuid>>, Error> {
        let row = sqlx::query(&format!(
            r"
            SELECT {RECORD_COLUMNS}
            FROM annals_snapshots
            WHERE entity_id = $1
            ORDER BY sequence_number DESC
            LIMIT 1
            "
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_record).transpose()
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(entity_id = %snapshot.entity_id, sequence = snapshot.sequence_number)
    )]
    async fn put_snapshot(&self, snapshot: StoredRecord<Uuid>) -> Result<(), Error> {
        sqlx::query(&format!(
            r"
            INSERT INTO annals_snapshots ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (entity_id, sequence_number) DO UPDATE SET
                event_id         = EXCLUDED.event_id,
                payload_type     = EXCLUDED.payload_type,
                payload_revision = EXCLUDED.payload_revision,
                data             = EXCLUDED.data,
                metadata         = EXCLUDED.metadata,
                recorded_at      = EXCLUDED.recorded_at
            "
        ))
        .bind(snapshot.event_id)
        .bind(snapshot.entity_id)
        .bind(to_db_sequence(snapshot.sequence_number)?)
        .bind(snapshot.payload.payload_type.name())
        .bind(snapshot.payload.payload_type.revision())
        .bind(&snapshot.payload.data)
        .bind(Json(&snapshot.metadata))
        .bind(snapshot.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn snapshot_sequences<'a>(&'a self, entity_id: &'a Uuid) -> Result<Vec<u64>, Error> {
        let sequences: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT sequence_number FROM annals_snapshots
            WHERE entity_id = $1
            ORDER BY sequence_number ASC
            ",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        sequences.into_iter().map(from_db_sequence).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn delete_snapshots<'a>(
        &'a self,
        entity_id: &'a Uuid,
        older_than: u64,
    ) -> Result<usize, Error> {
        // Anything at or beyond i64::MAX is older than every stored sequence.
        let older_than = i64::try_from(older_than).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r"DELETE FROM annals_snapshots WHERE entity_id = $1 AND sequence_number < $2",
        )
        .bind(entity_id)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}
