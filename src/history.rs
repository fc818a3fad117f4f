pub mod sqlite;

use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::model::Signal;

/// One persisted firing, as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub timestamp: String,
    pub symbol: String,
    pub signal_type: String,
    pub direction: String,
    pub strength: i64,
    pub message: String,
    pub timeframe: String,
    pub price: f64,
    pub source: String,
    pub extra: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStats {
    pub total: i64,
    pub days: i64,
    pub by_direction: BTreeMap<String, i64>,
    pub by_symbol: Vec<(String, i64)>,
    pub by_source: BTreeMap<String, i64>,
}

/// Append-only log of every emitted signal.
///
/// Every method here mirrors the store it is grounded on: internal
/// failures are logged and swallowed, returning the documented
/// sentinel/empty value rather than propagating an error. A signal's
/// delivery to subscribers must never depend on history succeeding.
pub trait HistoryStore: Send + Sync {
    /// Persist one signal. Returns the new row id, or `-1` on failure.
    fn save(&self, signal: &Signal, source: &str) -> BoxFuture<'_, i64>;

    fn get_recent(
        &self,
        limit: i64,
        symbol: Option<&str>,
        direction: Option<&str>,
    ) -> BoxFuture<'_, Vec<HistoryRecord>>;

    fn get_by_symbol(&self, symbol: &str, days: i64, limit: i64) -> BoxFuture<'_, Vec<HistoryRecord>>;

    fn get_stats(&self, days: i64) -> BoxFuture<'_, HistoryStats>;

    /// Delete rows older than `days`. Returns the delete count.
    fn cleanup(&self, days: i64) -> BoxFuture<'_, u64>;
}
