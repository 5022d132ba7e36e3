//! PostgreSQL store implementation.
//!
//! All records live in one table whose name is chosen at construction.
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! each other's candidates. Filters and updates are rendered with
//! [`QueryBuilder`]; every value is a bound parameter and the only
//! interpolated text is the validated table identifier.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use super::{InsertOutcome, RecordFilter, RecordUpdate, Store, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{ClaimedRecord, OwnerId, Record, RecordId, TopicSet},
};

/// Table used when none is configured.
pub const DEFAULT_TABLE: &str = "leaseq_records";

const COLUMNS: &str = "id, payload, topic, in_progress, owner, lease_timestamp, requeued, created_at";

/// PostgreSQL identifiers are truncated beyond this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Checks that `table` is a plain, unquoted SQL identifier.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` if the name is empty, too long, or
/// contains anything other than ASCII letters, digits and underscores, or
/// starts with a digit.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let Some(first) = chars.next() else {
        return Err(CoreError::InvalidInput("table name must not be empty".to_string()));
    };

    if table.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::InvalidInput(format!(
            "table name '{table}' exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }

    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(CoreError::InvalidInput(format!(
            "table name '{table}' is not a plain identifier"
        )));
    }

    Ok(())
}

/// Store backed by a PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresStore {
    /// Wraps an existing pool.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `table` is not a plain
    /// identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;

        Ok(Self { pool: Arc::new(pool), table })
    }

    /// Opens a small pool against `database_url` and verifies it answers.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Unavailable` if no connection can be established,
    /// or `CoreError::InvalidInput` for a bad table name.
    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Unavailable(format!("failed to connect: {e}")))?;

        let store = Self { pool: Arc::new(pool), table };
        store.health_check().await?;
        Ok(store)
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Table this store reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the table and its indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let table = &self.table;
        let statements = [
            format!(
                r"
                CREATE TABLE IF NOT EXISTS {table} (
                    id              TEXT PRIMARY KEY,
                    payload         BYTEA NOT NULL,
                    topic           TEXT,
                    in_progress     BOOLEAN NOT NULL DEFAULT FALSE,
                    owner           UUID,
                    lease_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    requeued        BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    CONSTRAINT {table}_owner_check CHECK (NOT in_progress OR owner IS NOT NULL)
                )
                "
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_available_idx ON {table} (topic) WHERE NOT in_progress"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_lease_idx ON {table} (lease_timestamp) WHERE in_progress"
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&*self.pool).await?;
        }

        info!(table = %self.table, "queue table migrated");
        Ok(())
    }

    /// Executes `SELECT 1` to verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

/// Renders `UPDATE <table> SET ... WHERE ...`, scoped to `target` when given.
fn build_update(
    table: &str,
    target: Option<&RecordId>,
    filter: &RecordFilter,
    update: &RecordUpdate,
) -> Result<QueryBuilder<'static, Postgres>> {
    if update.is_empty() {
        return Err(CoreError::InvalidInput("update assigns no fields".to_string()));
    }

    let mut builder = QueryBuilder::new(format!("UPDATE {table} SET "));
    {
        let mut set = builder.separated(", ");
        if let Some(in_progress) = update.in_progress {
            set.push("in_progress = ").push_bind_unseparated(in_progress);
        }
        if let Some(owner) = update.owner {
            set.push("owner = ").push_bind_unseparated(owner);
        }
        if let Some(requeued) = update.requeued {
            set.push("requeued = ").push_bind_unseparated(requeued);
        }
        if let Some(lease_timestamp) = update.lease_timestamp {
            set.push("lease_timestamp = ").push_bind_unseparated(lease_timestamp);
        }
    }

    match target {
        Some(id) => {
            builder.push(" WHERE id = ").push_bind(id.clone());
        },
        None => {
            builder.push(" WHERE TRUE");
        },
    }
    push_conditions(&mut builder, filter);

    Ok(builder)
}

/// Appends one `AND <column> <op> $n` per filter constraint.
fn push_conditions(builder: &mut QueryBuilder<'static, Postgres>, filter: &RecordFilter) {
    if let Some(in_progress) = filter.in_progress {
        builder.push(" AND in_progress = ").push_bind(in_progress);
    }
    if let Some(owner) = filter.owner {
        builder.push(" AND owner = ").push_bind(owner);
    }
    if let Some(requeued) = filter.requeued {
        builder.push(" AND requeued = ").push_bind(requeued);
    }
    if let Some(cutoff) = filter.lease_before {
        builder.push(" AND lease_timestamp < ").push_bind(cutoff);
    }
}

impl Store for PostgresStore {
    fn select_candidate<'a>(&'a self, topics: &'a TopicSet) -> StoreFuture<'a, Option<Record>> {
        Box::pin(async move {
            let sql = format!(
                r"
                SELECT {COLUMNS} FROM {}
                WHERE NOT in_progress
                  AND (topic IS NULL OR topic = ANY($1))
                ORDER BY random()
                LIMIT 1
                ",
                self.table
            );

            let record = sqlx::query_as::<_, Record>(&sql)
                .bind(topics.to_vec())
                .fetch_optional(&*self.pool)
                .await?;

            Ok(record)
        })
    }

    fn conditional_update<'a>(
        &'a self,
        id: &'a RecordId,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut builder = build_update(&self.table, Some(id), filter, update)?;
            let result = builder.build().execute(&*self.pool).await?;

            Ok(result.rows_affected())
        })
    }

    fn insert<'a>(&'a self, record: &'a Record) -> StoreFuture<'a, InsertOutcome> {
        Box::pin(async move {
            let sql = format!(
                r"
                INSERT INTO {} ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO NOTHING
                ",
                self.table
            );

            let result = sqlx::query(&sql)
                .bind(&record.id)
                .bind(&record.payload)
                .bind(&record.topic)
                .bind(record.in_progress)
                .bind(record.owner)
                .bind(record.lease_timestamp)
                .bind(record.requeued)
                .bind(record.created_at)
                .execute(&*self.pool)
                .await?;

            if result.rows_affected() == 0 {
                debug!(record_id = %record.id, "insert conflicted with existing record");
                return Ok(InsertOutcome::Conflict);
            }
            Ok(InsertOutcome::Inserted)
        })
    }

    fn delete<'a>(&'a self, id: &'a RecordId, filter: &'a RecordFilter) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut builder = QueryBuilder::new(format!("DELETE FROM {} WHERE id = ", self.table));
            builder.push_bind(id.clone());
            push_conditions(&mut builder, filter);

            let result = builder.build().execute(&*self.pool).await?;
            Ok(result.rows_affected())
        })
    }

    fn bulk_conditional_update<'a>(
        &'a self,
        filter: &'a RecordFilter,
        update: &'a RecordUpdate,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            if filter.is_unconstrained() {
                return Err(CoreError::InvalidInput(
                    "bulk update requires at least one constraint".to_string(),
                ));
            }

            let mut builder = build_update(&self.table, None, filter, update)?;
            let result = builder.build().execute(&*self.pool).await?;

            Ok(result.rows_affected())
        })
    }

    fn claim_candidate<'a>(
        &'a self,
        topics: &'a TopicSet,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<ClaimedRecord>> {
        Box::pin(async move {
            let table = &self.table;
            let returning = COLUMNS
                .split(", ")
                .map(|column| format!("{table}.{column}"))
                .collect::<Vec<_>>()
                .join(", ");

            // The candidate row stays locked until the UPDATE commits, so a
            // concurrent claimer skips it instead of waiting.
            let sql = format!(
                r"
                WITH candidate AS (
                    SELECT id, requeued FROM {table}
                    WHERE NOT in_progress
                      AND (topic IS NULL OR topic = ANY($1))
                    ORDER BY random()
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {table}
                SET in_progress = TRUE, owner = $2, lease_timestamp = $3, requeued = FALSE
                FROM candidate
                WHERE {table}.id = candidate.id
                RETURNING {returning}, candidate.requeued AS redelivered
                "
            );

            let claimed = sqlx::query_as::<_, ClaimedRecord>(&sql)
                .bind(topics.to_vec())
                .bind(owner)
                .bind(now)
                .fetch_optional(&*self.pool)
                .await?;

            Ok(claimed)
        })
    }
}
