use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::PgPool;

use crate::data_source::DataSource;
use crate::error::DataSourceError;
use crate::model::{Candle, Metric};

#[derive(sqlx::FromRow)]
struct CandleRow {
    symbol: String,
    bucket_ts: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    trade_count: i64,
    taker_buy_volume: f64,
    taker_buy_quote_volume: f64,
}

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        Candle {
            symbol: row.symbol,
            bucket_ts: row.bucket_ts,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            quote_volume: row.quote_volume,
            trade_count: row.trade_count,
            taker_buy_volume: row.taker_buy_volume,
            taker_buy_quote_volume: row.taker_buy_quote_volume,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MetricRow {
    symbol: String,
    create_time: DateTime<Utc>,
    sum_open_interest: f64,
    sum_open_interest_value: f64,
    count_toptrader_long_short_ratio: f64,
    sum_toptrader_long_short_ratio: f64,
    count_long_short_ratio: f64,
    sum_taker_long_short_vol_ratio: f64,
}

impl From<MetricRow> for Metric {
    fn from(row: MetricRow) -> Self {
        Metric {
            symbol: row.symbol,
            create_time: row.create_time,
            sum_open_interest: row.sum_open_interest,
            sum_open_interest_value: row.sum_open_interest_value,
            count_toptrader_long_short_ratio: row.count_toptrader_long_short_ratio,
            sum_toptrader_long_short_ratio: row.sum_toptrader_long_short_ratio,
            count_long_short_ratio: row.count_long_short_ratio,
            sum_taker_long_short_vol_ratio: row.sum_taker_long_short_vol_ratio,
        }
    }
}

/// Latest-row-per-symbol reader over `candles_1m` and
/// `binance_futures_metrics_5m`, backed by a single shared connection
/// pool reused across ticks. `PgPool` already reconnects on demand, so
/// no explicit reopen logic lives here.
pub struct PostgresDataSource {
    pool: PgPool,
    errors: AtomicU64,
}

impl PostgresDataSource {
    pub async fn connect(database_url: &str) -> Result<Self, Report<DataSourceError>> {
        let pool = PgPool::connect(database_url)
            .await
            .change_context(DataSourceError::Connection)?;
        Ok(Self {
            pool,
            errors: AtomicU64::new(0),
        })
    }

    async fn fetch_candles(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Candle>, Report<DataSourceError>> {
        let rows: Vec<CandleRow> = sqlx::query_as(
            "SELECT DISTINCT ON (symbol) \
             symbol, bucket_ts, open, high, low, close, volume, quote_volume, \
             trade_count, taker_buy_volume, taker_buy_quote_volume \
             FROM candles_1m \
             WHERE symbol = ANY($1) \
             ORDER BY symbol, bucket_ts DESC",
        )
        .bind(symbols)
        .fetch_all(&self.pool)
        .await
        .change_context(DataSourceError::Query {
            table: "candles_1m".into(),
        })?;

        Ok(rows
            .into_iter()
            .map(|row| (row.symbol.clone(), Candle::from(row)))
            .collect())
    }

    async fn fetch_metrics(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Metric>, Report<DataSourceError>> {
        let rows: Vec<MetricRow> = sqlx::query_as(
            "SELECT DISTINCT ON (symbol) \
             symbol, create_time, sum_open_interest, sum_open_interest_value, \
             count_toptrader_long_short_ratio, sum_toptrader_long_short_ratio, \
             count_long_short_ratio, sum_taker_long_short_vol_ratio \
             FROM binance_futures_metrics_5m \
             WHERE symbol = ANY($1) \
             ORDER BY symbol, create_time DESC",
        )
        .bind(symbols)
        .fetch_all(&self.pool)
        .await
        .change_context(DataSourceError::Query {
            table: "binance_futures_metrics_5m".into(),
        })?;

        Ok(rows
            .into_iter()
            .map(|row| (row.symbol.clone(), Metric::from(row)))
            .collect())
    }
}

impl DataSource for PostgresDataSource {
    fn latest_candles(
        &self,
        symbols: &[String],
    ) -> BoxFuture<'_, HashMap<String, Candle>> {
        let symbols = symbols.to_vec();
        Box::pin(async move {
            match self.fetch_candles(&symbols).await {
                Ok(map) => map,
                Err(report) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = ?report, table = "candles_1m", "data source query failed");
                    HashMap::new()
                }
            }
        })
    }

    fn latest_metrics(
        &self,
        symbols: &[String],
    ) -> BoxFuture<'_, HashMap<String, Metric>> {
        let symbols = symbols.to_vec();
        Box::pin(async move {
            match self.fetch_metrics(&symbols).await {
                Ok(map) => map,
                Err(report) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = ?report, table = "binance_futures_metrics_5m", "data source query failed");
                    HashMap::new()
                }
            }
        })
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
