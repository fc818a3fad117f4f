pub mod sqlite;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;

/// Persistent `(symbol, rule)` suppression window, surviving restarts.
///
/// Read failures are treated as "not in cooldown" by the engine (fail
/// open for availability); write failures only risk a re-emission on the
/// next tick, which is acceptable per the gate's own semantics.
pub trait CooldownStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<f64, Report<StorageError>>>;

    fn set(&self, key: &str, timestamp: f64) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn load_all(&self) -> BoxFuture<'_, Result<Vec<(String, f64)>, Report<StorageError>>>;

    fn cleanup(&self, max_age_seconds: f64) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;
}
