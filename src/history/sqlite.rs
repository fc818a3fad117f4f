use std::path::Path;
use std::str::FromStr;

use chrono::{Duration, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};

use crate::error::StorageError;
use crate::history::{HistoryRecord, HistoryStats, HistoryStore};
use crate::model::Signal;

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    timestamp: String,
    symbol: String,
    signal_type: String,
    direction: String,
    strength: i64,
    message: String,
    timeframe: String,
    price: f64,
    source: String,
    extra: String,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        HistoryRecord {
            id: row.id,
            timestamp: row.timestamp,
            symbol: row.symbol,
            signal_type: row.signal_type,
            direction: row.direction,
            strength: row.strength,
            message: row.message,
            timeframe: row.timeframe,
            price: row.price,
            source: row.source,
            extra: row.extra,
        }
    }
}

pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
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

        sqlx::migrate!("./migrations/history")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }

    async fn try_save(&self, signal: &Signal, source: &str) -> Result<i64, Report<StorageError>> {
        let extra = serde_json::to_string(&signal.extra).unwrap_or_default();
        let result = sqlx::query(
            "INSERT INTO signal_history \
             (timestamp, symbol, signal_type, direction, strength, message, timeframe, price, source, extra) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(signal.timestamp.to_rfc3339())
        .bind(&signal.symbol)
        .bind(signal.signal_type)
        .bind(signal.direction.as_str())
        .bind(signal.strength as i64)
        .bind(&signal.message)
        .bind(signal.timeframe)
        .bind(signal.price)
        .bind(source)
        .bind(&extra)
        .execute(&self.pool)
        .await
        .change_context(StorageError::Insert)?;

        Ok(result.last_insert_rowid())
    }

    async fn try_get_recent(
        &self,
        limit: i64,
        symbol: Option<&str>,
        direction: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, Report<StorageError>> {
        let mut query = String::from(
            "SELECT id, timestamp, symbol, signal_type, direction, strength, message, timeframe, price, source, extra \
             FROM signal_history WHERE 1=1",
        );
        if symbol.is_some() {
            query.push_str(" AND symbol = ?");
        }
        if direction.is_some() {
            query.push_str(" AND direction = ?");
        }
        query.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, HistoryRow>(&query);
        if let Some(symbol) = symbol {
            q = q.bind(symbol);
        }
        if let Some(direction) = direction {
            q = q.bind(direction);
        }
        q = q.bind(limit);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    async fn try_get_by_symbol(
        &self,
        symbol: &str,
        days: i64,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>, Report<StorageError>> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, timestamp, symbol, signal_type, direction, strength, message, timeframe, price, source, extra \
             FROM signal_history \
             WHERE symbol = ? AND timestamp > ? \
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(&since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .change_context(StorageError::Query)?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    async fn try_get_stats(&self, days: i64) -> Result<HistoryStats, Report<StorageError>> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM signal_history WHERE timestamp > ?")
                .bind(&since)
                .fetch_one(&self.pool)
                .await
                .change_context(StorageError::Query)?;

        let by_direction_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT direction, COUNT(*) FROM signal_history WHERE timestamp > ? GROUP BY direction",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await
        .change_context(StorageError::Query)?;

        let by_symbol: Vec<(String, i64)> = sqlx::query_as(
            "SELECT symbol, COUNT(*) as cnt FROM signal_history WHERE timestamp > ? \
             GROUP BY symbol ORDER BY cnt DESC LIMIT 10",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await
        .change_context(StorageError::Query)?;

        let by_source_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source, COUNT(*) FROM signal_history WHERE timestamp > ? GROUP BY source",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await
        .change_context(StorageError::Query)?;

        Ok(HistoryStats {
            total,
            days,
            by_direction: by_direction_rows.into_iter().collect(),
            by_symbol,
            by_source: by_source_rows.into_iter().collect(),
        })
    }

    async fn try_cleanup(&self, days: i64) -> Result<u64, Report<StorageError>> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let result = sqlx::query("DELETE FROM signal_history WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
        Ok(result.rows_affected())
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn save(&self, signal: &Signal, source: &str) -> BoxFuture<'_, i64> {
        let signal = signal.clone();
        let source = source.to_string();
        Box::pin(async move {
            match self.try_save(&signal, &source).await {
                Ok(id) => id,
                Err(report) => {
                    tracing::error!(error = ?report, "failed to save signal history");
                    -1
                }
            }
        })
    }

    fn get_recent(
        &self,
        limit: i64,
        symbol: Option<&str>,
        direction: Option<&str>,
    ) -> BoxFuture<'_, Vec<HistoryRecord>> {
        let symbol = symbol.map(str::to_string);
        let direction = direction.map(str::to_string);
        Box::pin(async move {
            match self
                .try_get_recent(limit, symbol.as_deref(), direction.as_deref())
                .await
            {
                Ok(rows) => rows,
                Err(report) => {
                    tracing::error!(error = ?report, "failed to read signal history");
                    Vec::new()
                }
            }
        })
    }

    fn get_by_symbol(&self, symbol: &str, days: i64, limit: i64) -> BoxFuture<'_, Vec<HistoryRecord>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            match self.try_get_by_symbol(&symbol, days, limit).await {
                Ok(rows) => rows,
                Err(report) => {
                    tracing::error!(error = ?report, "failed to read signal history by symbol");
                    Vec::new()
                }
            }
        })
    }

    fn get_stats(&self, days: i64) -> BoxFuture<'_, HistoryStats> {
        Box::pin(async move {
            match self.try_get_stats(days).await {
                Ok(stats) => stats,
                Err(report) => {
                    tracing::error!(error = ?report, "failed to compute signal history stats");
                    HistoryStats {
                        days,
                        ..Default::default()
                    }
                }
            }
        })
    }

    fn cleanup(&self, days: i64) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            match self.try_cleanup(days).await {
                Ok(deleted) => deleted,
                Err(report) => {
                    tracing::error!(error = ?report, "failed to clean up signal history");
                    0
                }
            }
        })
    }
}
