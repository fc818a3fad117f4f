pub mod terminal;

use crate::model::Signal;

/// Sink for detected signals, invoked synchronously on the tick task.
///
/// Implementations must be non-blocking or offload their own work, since
/// a slow subscriber stalls every other subscriber and the rest of the
/// tick behind it.
pub trait Notifier: Send + Sync {
    fn notify(&self, signal: &Signal, message: &str);
}
