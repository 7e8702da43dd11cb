//! SQLite-backed stores, snapshot fingerprinting, and HTTP fetch utilities.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use tamalog_core::{BulkRow, Observation};

pub const CRATE_NAME: &str = "tamalog-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Explicit-id insert collided with an existing row.
    #[error("duplicate id {id}")]
    DuplicateId { id: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Handle to the local SQLite file shared by both tables.
///
/// A single pooled connection is enough: ingestion cycles are serialized by
/// the scheduler and the bulk loader holds its own invocation guard, so the
/// pool doubles as the coarse mutual exclusion between the two paths.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A stored observation: the surrogate id plus the captured row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObservation {
    pub id: i64,
    pub observation: Observation,
}

/// Append-only table of timestamped observations (`transport_weather`).
#[derive(Debug, Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
}

impl ObservationStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Create the table if absent. Idempotent, run on every process start.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transport_weather (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                fetch_time TEXT NOT NULL,
                weather TEXT NOT NULL,
                delay_status TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert one row; returns the store-assigned id.
    pub async fn append(&self, observation: &Observation) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO transport_weather (date, fetch_time, weather, delay_status)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&observation.captured_date)
        .bind(&observation.captured_time)
        .bind(&observation.weather_value)
        .bind(&observation.delay_status_value)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All rows in insertion order. Inspection path, not hot.
    pub async fn all(&self) -> Result<Vec<StoredObservation>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, date, fetch_time, weather, delay_status
             FROM transport_weather ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredObservation {
                id: row.try_get("id")?,
                observation: Observation {
                    captured_date: row.try_get("date")?,
                    captured_time: row.try_get("fetch_time")?,
                    weather_value: row.try_get("weather")?,
                    delay_status_value: row.try_get("delay_status")?,
                },
            });
        }
        Ok(out)
    }
}

/// Bulk-load target table (`weather`): explicit-id rows from the snapshot.
#[derive(Debug, Clone)]
pub struct WeatherArchive {
    pool: SqlitePool,
}

impl WeatherArchive {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS weather (
                id INTEGER PRIMARY KEY,
                area_name TEXT NOT NULL,
                date TEXT NOT NULL,
                weather_desc TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop and recreate the table. Only the fingerprint-gated reload path
    /// calls this, never speculatively.
    pub async fn reset_schema(&self) -> Result<(), StoreError> {
        sqlx::query("DROP TABLE IF EXISTS weather")
            .execute(&self.pool)
            .await?;
        self.ensure_schema().await
    }

    /// Insert a row under its explicit id. An id collision surfaces as
    /// [`StoreError::DuplicateId`] so the loader can skip and keep going.
    pub async fn insert(&self, row: &BulkRow) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO weather (id, area_name, date, weather_desc)
             VALUES (?, ?, ?, ?)",
        )
        .bind(row.id)
        .bind(&row.area_name)
        .bind(&row.date)
        .bind(&row.weather_desc)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateId { id: row.id })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn all(&self) -> Result<Vec<BulkRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, area_name, date, weather_desc FROM weather ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BulkRow {
                id: row.try_get("id")?,
                area_name: row.try_get("area_name")?,
                date: row.try_get("date")?,
                weather_desc: row.try_get("weather_desc")?,
            });
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM weather")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Side-file holding the last-seen content hash of a snapshot file.
///
/// Absent on first run, which the loader treats as "always differs". The
/// digest is written only after a reload pass completes, so a half-loaded
/// table can never sit behind a clean fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintFile {
    path: PathBuf,
}

impl FingerprintFile {
    pub fn for_snapshot(snapshot: &Path) -> Self {
        let mut name = snapshot.as_os_str().to_os_string();
        name.push(".hash");
        Self { path: name.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn store(&self, digest: &str) -> io::Result<()> {
        fs::write(&self.path, digest).await
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Thin GET client with a bounded timeout and no internal retries; retry
/// across cycles is the scheduler's business, not a single fetch's.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// One request; a timeout or connect failure is a plain transport
    /// error, a non-2xx status is reported with its final URL.
    pub async fn fetch_text(&self, url: &str) -> Result<String, HttpError> {
        debug!(url, "http fetch");
        let resp = self.client.get(url).send().await?;
        let status: StatusCode = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_observation(time: &str, weather: &str) -> Observation {
        Observation {
            captured_date: "2026-03-01".into(),
            captured_time: time.into(),
            weather_value: weather.into(),
            delay_status_value: "normal".into(),
        }
    }

    #[tokio::test]
    async fn append_assigns_ascending_ids_and_preserves_order() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let store = ObservationStore::new(&db);
        store.ensure_schema().await.expect("schema");
        store.ensure_schema().await.expect("schema is idempotent");

        let first = store
            .append(&sample_observation("05:00:00", "晴れ"))
            .await
            .expect("first append");
        let second = store
            .append(&sample_observation("06:00:00", "曇り"))
            .await
            .expect("second append");
        assert!(second > first);

        let rows = store.all().await.expect("all");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].observation.captured_time, "05:00:00");
        assert_eq!(rows[1].observation.weather_value, "曇り");
    }

    #[tokio::test]
    async fn duplicate_explicit_id_is_reported_not_overwritten() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let archive = WeatherArchive::new(&db);
        archive.reset_schema().await.expect("schema");

        let row = BulkRow {
            id: 7,
            area_name: "東京".into(),
            date: "2026-03-01".into(),
            weather_desc: "晴れ".into(),
        };
        archive.insert(&row).await.expect("first insert");

        let clash = BulkRow {
            weather_desc: "雨".into(),
            ..row.clone()
        };
        match archive.insert(&clash).await {
            Err(StoreError::DuplicateId { id }) => assert_eq!(id, 7),
            other => panic!("expected DuplicateId, got {other:?}"),
        }

        let rows = archive.all().await.expect("all");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].weather_desc, "晴れ");
    }

    #[tokio::test]
    async fn reset_schema_clears_previous_rows() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let archive = WeatherArchive::new(&db);
        archive.reset_schema().await.expect("schema");
        archive
            .insert(&BulkRow {
                id: 1,
                area_name: "多摩".into(),
                date: "2026-03-01".into(),
                weather_desc: "雪".into(),
            })
            .await
            .expect("insert");

        archive.reset_schema().await.expect("reset");
        assert_eq!(archive.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn fingerprint_round_trips_and_is_none_when_absent() {
        let dir = tempdir().expect("tempdir");
        let snapshot = dir.path().join("weather.csv");
        let fp = FingerprintFile::for_snapshot(&snapshot);
        assert_eq!(fp.path(), dir.path().join("weather.csv.hash"));
        assert_eq!(fp.load().await.expect("load"), None);

        let digest = sha256_hex(b"1,Tokyo,2026-03-01,sunny");
        fp.store(&digest).await.expect("store");
        assert_eq!(fp.load().await.expect("reload"), Some(digest));
    }

    #[test]
    fn content_hash_is_stable_and_byte_sensitive() {
        let a = sha256_hex(b"id,area_name,date,weather_desc\n");
        let b = sha256_hex(b"id,area_name,date,weather_desc\n");
        let c = sha256_hex(b"id,area_name,date,weather_desc ");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
