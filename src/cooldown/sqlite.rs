use std::path::Path;
use std::str::FromStr;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};

use crate::cooldown::CooldownStore;
use crate::error::StorageError;

pub struct SqliteCooldownStore {
    pool: SqlitePool,
}

impl SqliteCooldownStore {
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        sqlx::migrate!("./migrations/cooldown")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }
}

impl CooldownStore for SqliteCooldownStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<f64, Report<StorageError>>> {
        let key = key.to_string();
        Box::pin(async move {
            let row: Option<(f64,)> =
                sqlx::query_as("SELECT timestamp FROM cooldown WHERE key = ?")
                    .bind(&key)
                    .fetch_optional(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;
            Ok(row.map(|(ts,)| ts).unwrap_or(0.0))
        })
    }

    fn set(&self, key: &str, timestamp: f64) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let key = key.to_string();
        Box::pin(async move {
            sqlx::query("INSERT OR REPLACE INTO cooldown (key, timestamp) VALUES (?, ?)")
                .bind(&key)
                .bind(timestamp)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn load_all(&self) -> BoxFuture<'_, Result<Vec<(String, f64)>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(String, f64)> =
                sqlx::query_as("SELECT key, timestamp FROM cooldown")
                    .fetch_all(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;
            Ok(rows)
        })
    }

    fn cleanup(&self, max_age_seconds: f64) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        Box::pin(async move {
            let cutoff = now_unix_seconds() - max_age_seconds;
            let result = sqlx::query("DELETE FROM cooldown WHERE timestamp < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(result.rows_affected())
        })
    }
}

fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteCooldownStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations/cooldown")
            .run(&pool)
            .await
            .unwrap();
        SqliteCooldownStore { pool }
    }

    #[tokio::test]
    async fn get_returns_zero_for_absent_key() {
        let store = memory_store().await;
        assert_eq!(store.get("BTCUSDT_price_surge").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = memory_store().await;
        store.set("BTCUSDT_price_surge", 1000.0).await.unwrap();
        assert_eq!(store.get("BTCUSDT_price_surge").await.unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn set_upserts_existing_key() {
        let store = memory_store().await;
        store.set("k", 1.0).await.unwrap();
        store.set("k", 2.0).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 2.0);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_stale_entries() {
        let store = memory_store().await;
        let now = now_unix_seconds();
        store.set("stale", now - 90_000.0).await.unwrap();
        store.set("fresh", now).await.unwrap();
        let deleted = store.cleanup(86_400.0).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }
}
