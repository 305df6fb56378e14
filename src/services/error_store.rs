//! Persistent error store backing the database dead-letter sink.

use chrono::{DateTime, Utc};

use crate::models::{ErrorRecord, FailureClass};

#[derive(Debug, Clone)]
pub struct ErrorStore {
    pool: sqlx::PgPool,
}

impl ErrorStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        ErrorStore { pool }
    }

    /// Persist one terminally failed message. Rows are independent, so
    /// concurrent workers write without cross-row contention.
    pub async fn insert(
        &self,
        record: &str,
        exception: &str,
        class: FailureClass,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO consumer_errors (record, exception, error_type, created_at) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(record)
        .bind(exception)
        .bind(class.error_type())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<ErrorRecord>, sqlx::Error> {
        sqlx::query_as::<_, (i64, String, String, String, DateTime<Utc>)>(
            "SELECT id, record, exception, error_type, created_at \
             FROM consumer_errors WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map(|row| {
            row.map(|(id, record, exception, error_type, created_at)| ErrorRecord {
                id,
                record,
                exception,
                error_type,
                created_at,
            })
        })
    }

    /// Retention hook: drop records older than the cutoff.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM consumer_errors WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
