pub mod postgres;

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::model::{Candle, Metric};

/// Latest-row-per-symbol access to the upstream time-series tables.
///
/// Failures are never propagated: a connection drop or query error is
/// logged and counted by the implementation, and the affected fetch
/// returns an empty map, which the engine treats as a transient miss.
pub trait DataSource: Send + Sync {
    fn latest_candles(&self, symbols: &[String]) -> BoxFuture<'_, HashMap<String, Candle>>;

    fn latest_metrics(&self, symbols: &[String]) -> BoxFuture<'_, HashMap<String, Metric>>;

    /// Total transient errors observed across the lifetime of this source.
    fn error_count(&self) -> u64;
}
