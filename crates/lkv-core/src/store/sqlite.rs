//! SQLite backend for both credentials and usage records.

use super::{Credential, CredentialStore};
use crate::cipher::EncryptedSecret;
use crate::error::{Error, Result};
use crate::usage::{UsageFilter, UsageRecord, UsageStore, UsageTotals};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "sqlite";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS credentials (
        user_id          TEXT    NOT NULL,
        provider         TEXT    NOT NULL,
        encrypted_secret TEXT    NOT NULL,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        PRIMARY KEY (user_id, provider)
    )",
    "CREATE TABLE IF NOT EXISTS usage_records (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     TEXT    NOT NULL,
        provider    TEXT    NOT NULL,
        tokens      INTEGER NOT NULL CHECK (tokens >= 0),
        cost_micros INTEGER NOT NULL CHECK (cost_micros >= 0),
        recorded_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_provider_time
        ON usage_records (provider, recorded_at)",
];

/// Credential and usage store over a SQLite connection pool.
///
/// File databases run in WAL mode. `sqlite::memory:` URLs get a single
/// pinned connection so the database lives as long as the store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url` (e.g. `sqlite:lkv.db` or `sqlite::memory:`)
    /// and create the schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::storage(BACKEND, e))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            let filename = options.clone().get_filename().to_path_buf();
            if let Some(parent) = filename.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::storage(BACKEND, e))?;
            }
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| Error::storage(BACKEND, e))?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!(url = database_url, "sqlite store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::storage(BACKEND, e))?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::storage(BACKEND, format!("timestamp {} out of range", micros)))
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::storage(BACKEND, format!("{} {} overflows INTEGER", field, value)))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::storage(BACKEND, format!("{} {} is negative", field, value)))
}

fn credential_from_row(row: &SqliteRow) -> Result<Credential> {
    let get_err = |e: sqlx::Error| Error::storage(BACKEND, e);
    Ok(Credential {
        user_id: row.try_get("user_id").map_err(get_err)?,
        provider: row.try_get("provider").map_err(get_err)?,
        encrypted_secret: EncryptedSecret::from_encoded(
            row.try_get::<String, _>("encrypted_secret").map_err(get_err)?,
        ),
        created_at: from_micros(row.try_get("created_at").map_err(get_err)?)?,
        updated_at: from_micros(row.try_get("updated_at").map_err(get_err)?)?,
    })
}

#[async_trait]
impl CredentialStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn put(&self, user_id: &str, provider: &str, secret: EncryptedSecret) -> Result<()> {
        let now = to_micros(Utc::now());
        sqlx::query(
            "INSERT INTO credentials (user_id, provider, encrypted_secret, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (user_id, provider) DO UPDATE SET
                 encrypted_secret = excluded.encrypted_secret,
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(provider)
        .bind(secret.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;
        Ok(())
    }

    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            "SELECT user_id, provider, encrypted_secret, created_at, updated_at
             FROM credentials WHERE user_id = ? AND provider = ?",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn delete(&self, user_id: &str, provider: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE user_id = ? AND provider = ?")
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(BACKEND, e))?;
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            "SELECT user_id, provider, encrypted_secret, created_at, updated_at
             FROM credentials WHERE user_id = ? ORDER BY provider",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;

        rows.iter().map(credential_from_row).collect()
    }

    async fn list_providers(&self, user_id: &str) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT provider FROM credentials WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::storage(BACKEND, e))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("provider").map_err(|e| Error::storage(BACKEND, e)))
            .collect()
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_records (user_id, provider, tokens, cost_micros, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.user_id)
        .bind(&record.provider)
        .bind(to_i64(record.tokens, "tokens")?)
        .bind(to_i64(record.cost_micros, "cost_micros")?)
        .bind(to_micros(record.timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;
        Ok(())
    }

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS requests,
                    COALESCE(SUM(tokens), 0) AS tokens,
                    COALESCE(SUM(cost_micros), 0) AS cost_micros
             FROM usage_records
             WHERE (? IS NULL OR user_id = ?)
               AND (? IS NULL OR provider = ?)
               AND recorded_at >= ? AND recorded_at < ?",
        )
        .bind(filter.user_id.as_deref())
        .bind(filter.user_id.as_deref())
        .bind(filter.provider.as_deref())
        .bind(filter.provider.as_deref())
        .bind(to_micros(filter.start))
        .bind(to_micros(filter.end))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;

        let get = |col: &str| -> Result<u64> {
            let value: i64 = row.try_get(col).map_err(|e| Error::storage(BACKEND, e))?;
            to_u64(value, col)
        };
        Ok(UsageTotals {
            requests: get("requests")?,
            tokens: get("tokens")?,
            cost_micros: get("cost_micros")?,
        })
    }

    async fn providers(&self, filter: &UsageFilter) -> Result<BTreeSet<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT provider FROM usage_records
             WHERE (? IS NULL OR user_id = ?)
               AND recorded_at >= ? AND recorded_at < ?",
        )
        .bind(filter.user_id.as_deref())
        .bind(filter.user_id.as_deref())
        .bind(to_micros(filter.start))
        .bind(to_micros(filter.end))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(BACKEND, e))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("provider").map_err(|e| Error::storage(BACKEND, e)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn blob(s: &str) -> EncryptedSecret {
        EncryptedSecret::from_encoded(s)
    }

    #[tokio::test]
    async fn test_upsert_replaces_secret_keeps_created_at() {
        let s = store().await;
        s.put("u1", "openai", blob("c1")).await.unwrap();
        let first = s.get("u1", "openai").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        s.put("u1", "openai", blob("c2")).await.unwrap();
        let second = s.get("u1", "openai").await.unwrap().unwrap();

        assert_eq!(second.encrypted_secret, blob("c2"));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(s.list("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_and_delete_idempotent() {
        let s = store().await;
        assert!(s.get("u1", "openai").await.unwrap().is_none());
        s.put("u1", "openai", blob("c1")).await.unwrap();
        s.delete("u1", "openai").await.unwrap();
        s.delete("u1", "openai").await.unwrap();
        assert!(s.get("u1", "openai").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorted_and_scoped() {
        let s = store().await;
        s.put("u1", "openai", blob("a")).await.unwrap();
        s.put("u1", "anthropic", blob("b")).await.unwrap();
        s.put("u2", "gemini", blob("c")).await.unwrap();

        let listed: Vec<String> = s.list("u1").await.unwrap().into_iter().map(|c| c.provider).collect();
        assert_eq!(listed, vec!["anthropic", "openai"]);
        let providers = s.list_providers("u2").await.unwrap();
        assert_eq!(providers.into_iter().collect::<Vec<_>>(), vec!["gemini"]);
    }

    #[tokio::test]
    async fn test_usage_totals_filtering() {
        let s = store().await;
        let now = Utc::now();
        let rec = |user: &str, provider: &str, tokens, cost_micros, ts| UsageRecord {
            user_id: user.to_string(),
            provider: provider.to_string(),
            tokens,
            cost_micros,
            timestamp: ts,
        };
        s.append(&rec("u1", "openai", 10, 1_000_000, now)).await.unwrap();
        s.append(&rec("u1", "openai", 20, 2_000_000, now)).await.unwrap();
        s.append(&rec("u2", "openai", 5, 10, now)).await.unwrap();
        s.append(&rec("u1", "anthropic", 7, 70, now)).await.unwrap();
        s.append(&rec("u1", "openai", 99, 99, now + ChronoDuration::hours(2))).await.unwrap();

        let mut filter = UsageFilter {
            user_id: Some("u1".to_string()),
            provider: Some("openai".to_string()),
            start: now - ChronoDuration::hours(1),
            end: now + ChronoDuration::hours(1),
        };
        let totals = UsageStore::totals(&s, &filter).await.unwrap();
        assert_eq!(totals, UsageTotals { requests: 2, tokens: 30, cost_micros: 3_000_000 });

        filter.user_id = None;
        let totals = UsageStore::totals(&s, &filter).await.unwrap();
        assert_eq!(totals.requests, 3);

        let providers = UsageStore::providers(&s, &filter).await.unwrap();
        assert_eq!(providers.into_iter().collect::<Vec<_>>(), vec!["anthropic", "openai"]);
    }

    #[tokio::test]
    async fn test_usage_totals_empty_window() {
        let s = store().await;
        let now = Utc::now();
        let filter = UsageFilter {
            user_id: None,
            provider: Some("openai".to_string()),
            start: now,
            end: now,
        };
        assert_eq!(UsageStore::totals(&s, &filter).await.unwrap(), UsageTotals::default());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("lkv.db").display());
        {
            let s = SqliteStore::connect(&url).await.unwrap();
            s.put("u1", "openai", blob("c1")).await.unwrap();
            s.close().await;
        }
        let s = SqliteStore::connect(&url).await.unwrap();
        assert_eq!(s.get("u1", "openai").await.unwrap().unwrap().encrypted_secret, blob("c1"));
    }

    #[tokio::test]
    async fn test_nested_database_path_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("a").join("b").join("lkv.db").display());
        SqliteStore::connect(&url).await.unwrap();
        assert!(dir.path().join("a").join("b").join("lkv.db").exists());
    }

    #[tokio::test]
    async fn test_unusable_path_is_storage_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", file.path().join("lkv.db").display());
        let err = SqliteStore::connect(&url).await.err().unwrap();
        assert!(matches!(err, Error::StorageUnavailable { backend: "sqlite", .. }));
    }
}
