use std::{future::Future, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{
    Row as _, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use thiserror::Error;

use crate::sensor::{SensorReading, StoredReading};

/// Fixed-width UTC layout, so that text order matches chronological order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Durable, append-only storage for sensor readings.
///
/// Each operation is atomic on its own; callers never need a transaction
/// spanning more than one call.
pub trait ReadingStore: Clone + Send + Sync + 'static {
    /// Appends one reading, timestamped with the time of the write.
    fn insert(
        &self,
        reading: &SensorReading,
    ) -> impl Future<Output = Result<StoredReading, StorageError>> + Send;

    /// Removes every reading captured strictly before `threshold` and returns
    /// how many were removed.
    fn delete_older_than(
        &self,
        threshold: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the SQLite database at `url`, e.g.
    /// `sqlite:sensor_data.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // A single long-lived connection: writes are serialized anyway, and an
        // in-memory database only lives as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Creates the readings table and its timestamp index. Idempotent.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                temperature REAL,
                humidity INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_timestamp ON sensor_readings (timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sensor_readings")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("n")?)
    }

    /// Capture times of all stored rows in insertion order, as UTC.
    pub async fn timestamps(&self) -> Result<Vec<DateTime<Utc>>, StorageError> {
        let rows = sqlx::query("SELECT timestamp FROM sensor_readings ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("timestamp")?;
                parse_timestamp(&raw)
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Database {
    async fn insert_at(
        &self,
        reading: &SensorReading,
        at: DateTime<Utc>,
    ) -> Result<StoredReading, StorageError> {
        let result = sqlx::query(
            "INSERT INTO sensor_readings (timestamp, temperature, humidity) VALUES (?, ?, ?)",
        )
        .bind(format_timestamp(at))
        .bind(reading.temperature_celsius)
        .bind(i64::from(reading.humidity_percent))
        .execute(&self.pool)
        .await?;

        Ok(StoredReading {
            id: result.last_insert_rowid(),
            reading: SensorReading {
                captured_at: at.with_timezone(&reading.captured_at.timezone()),
                ..reading.clone()
            },
        })
    }
}

impl ReadingStore for Database {
    async fn insert(&self, reading: &SensorReading) -> Result<StoredReading, StorageError> {
        self.insert_at(reading, Utc::now()).await
    }

    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE timestamp < ?")
            .bind(format_timestamp(threshold))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StorageError::InvalidData(format!("bad timestamp {raw:?}: {e}")))
}
