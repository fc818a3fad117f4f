use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use error_stack::Report;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::RuleThresholds;
use crate::cooldown::CooldownStore;
use crate::data_source::DataSource;
use crate::error::StorageError;
use crate::history::HistoryStore;
use crate::localization::Localizer;
use crate::model::{Candle, Extra, ExtraValue, Metric, Signal};
use crate::notifier::Notifier;
use crate::rules::RULES;

/// Snapshot of the engine's lifetime counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub checks: u64,
    pub signals: u64,
    pub errors: u64,
    pub symbols: usize,
    pub cooldowns: u64,
}

#[derive(Default)]
struct Counters {
    checks: AtomicU64,
    signals: AtomicU64,
    errors: AtomicU64,
    cooldowns: AtomicU64,
}

/// Orchestrates one polling tick: fetch, evaluate every symbol against
/// the fixed rule table, gate by cooldown, deliver to subscribers,
/// persist to history, and advance the baseline.
///
/// A tick is not re-entered: `tick_lock` is held for the duration of
/// `tick()`, matching the single-threaded cooperative model the loop
/// assumes (subscribers run synchronously on the tick task).
pub struct DetectionEngine {
    data_source: Arc<dyn DataSource>,
    cooldown_store: Arc<dyn CooldownStore>,
    history_store: Arc<dyn HistoryStore>,
    localizer: Arc<dyn Localizer>,
    symbols: Vec<String>,
    language: String,
    cooldown_seconds: i64,
    source_tag: &'static str,
    thresholds: RuleThresholds,
    baseline_candles: Mutex<HashMap<String, Candle>>,
    baseline_metrics: Mutex<HashMap<String, Metric>>,
    cooldown_cache: Mutex<HashMap<String, f64>>,
    subscribers: RwLock<Vec<Arc<dyn Notifier>>>,
    tick_lock: Mutex<()>,
    counters: Counters,
    /// Last `data_source.error_count()` observed, so each tick folds only
    /// the *new* data-source errors into `counters.errors` rather than
    /// re-counting the source's lifetime total every tick.
    last_data_source_errors: AtomicU64,
}

impl DetectionEngine {
    pub async fn new(
        data_source: Arc<dyn DataSource>,
        cooldown_store: Arc<dyn CooldownStore>,
        history_store: Arc<dyn HistoryStore>,
        localizer: Arc<dyn Localizer>,
        symbols: Vec<String>,
        language: String,
        cooldown_seconds: i64,
        thresholds: RuleThresholds,
    ) -> Result<Self, Report<StorageError>> {
        let seeded = cooldown_store
            .load_all()
            .await?
            .into_iter()
            .collect::<HashMap<_, _>>();

        Ok(Self {
            data_source,
            cooldown_store,
            history_store,
            localizer,
            symbols,
            language,
            cooldown_seconds,
            source_tag: "signal-detector",
            thresholds,
            baseline_candles: Mutex::new(HashMap::new()),
            baseline_metrics: Mutex::new(HashMap::new()),
            cooldown_cache: Mutex::new(seeded),
            subscribers: RwLock::new(Vec::new()),
            tick_lock: Mutex::new(()),
            counters: Counters::default(),
            last_data_source_errors: AtomicU64::new(0),
        })
    }

    pub async fn register_callback(&self, notifier: Arc<dyn Notifier>) {
        self.subscribers.write().await.push(notifier);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            checks: self.counters.checks.load(Ordering::Relaxed),
            signals: self.counters.signals.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            symbols: self.symbols.len(),
            cooldowns: self.counters.cooldowns.load(Ordering::Relaxed),
        }
    }

    /// Performs one polling cycle and returns every signal emitted during it.
    pub async fn tick(&self) -> Vec<Signal> {
        let _guard = self.tick_lock.lock().await;
        self.counters.checks.fetch_add(1, Ordering::Relaxed);

        let current_candles = self.data_source.latest_candles(&self.symbols).await;
        let current_metrics = self.data_source.latest_metrics(&self.symbols).await;
        self.fold_data_source_errors();

        let mut emitted = Vec::new();

        let mut baseline_candles = self.baseline_candles.lock().await;
        let mut baseline_metrics = self.baseline_metrics.lock().await;

        for symbol in &self.symbols {
            let Some(cc) = current_candles.get(symbol) else {
                continue;
            };
            let pc = baseline_candles.get(symbol);
            let cm = current_metrics.get(symbol);
            let pm = baseline_metrics.get(symbol);

            for rule in RULES {
                if rule.applies_when_metric_present && cm.is_none() {
                    continue;
                }

                let detected = (rule.evaluate)(symbol, cc, pc, cm, pm, &self.thresholds);
                let Some(signal) = detected else {
                    continue;
                };

                if let Some(signal) = self.handle_detection(signal).await {
                    emitted.push(signal);
                }
            }

            baseline_candles.insert(symbol.clone(), cc.clone());
            if let Some(cm) = cm {
                baseline_metrics.insert(symbol.clone(), cm.clone());
            }
        }

        emitted
    }

    /// Folds any new `data_source.error_count()` observed since the last
    /// tick into `counters.errors`, so a sustained outage is visible in
    /// `stats()` rather than only surfacing as empty fetch maps.
    fn fold_data_source_errors(&self) {
        let total = self.data_source.error_count();
        let previous = self.last_data_source_errors.swap(total, Ordering::Relaxed);
        if total > previous {
            self.counters
                .errors
                .fetch_add(total - previous, Ordering::Relaxed);
        }
    }

    async fn handle_detection(&self, mut signal: Signal) -> Option<Signal> {
        let key = Signal::cooldown_key(&signal.symbol, signal.signal_type);

        if !self.cooldown_gate_open(&key).await {
            self.counters.cooldowns.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut substitutions: Extra = signal.extra.clone();
        substitutions.insert("symbol".to_string(), ExtraValue::Text(signal.symbol.clone()));
        signal.message = self
            .localizer
            .format(signal.signal_type, &self.language, &substitutions);

        self.deliver(&signal).await;
        self.history_store.save(&signal, self.source_tag).await;
        self.set_cooldown(&key).await;
        self.counters.signals.fetch_add(1, Ordering::Relaxed);

        Some(signal)
    }

    /// Invokes every subscriber with this signal, isolating a panicking
    /// subscriber so it cannot unwind through the tick and kill the
    /// detection loop (spec.md §7: "Subscriber error: isolated per
    /// subscriber; log, continue with remaining subscribers").
    async fn deliver(&self, signal: &Signal) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            let subscriber = subscriber.clone();
            let signal = signal.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.notify(&signal, &signal.message);
            }));
            if let Err(panic) = result {
                let reason = panic_message(&panic);
                tracing::error!(symbol = %signal.symbol, signal_type = signal.signal_type, reason, "subscriber panicked, continuing with remaining subscribers");
            }
        }
    }

    async fn cooldown_gate_open(&self, key: &str) -> bool {
        let cached = {
            let cache = self.cooldown_cache.lock().await;
            cache.get(key).copied()
        };

        let last_fired = match cached {
            Some(ts) => ts,
            None => match self.cooldown_store.get(key).await {
                Ok(ts) => ts,
                Err(report) => {
                    tracing::warn!(error = ?report, key, "cooldown read failed, treating as open");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    0.0
                }
            },
        };

        now_unix_seconds() - last_fired > self.cooldown_seconds as f64
    }

    async fn set_cooldown(&self, key: &str) {
        let now = now_unix_seconds();
        self.cooldown_cache
            .lock()
            .await
            .insert(key.to_string(), now);

        if let Err(report) = self.cooldown_store.set(key, now).await {
            tracing::warn!(error = ?report, key, "cooldown write failed");
        }
    }

    /// Runs `tick` every `interval_seconds`, sleeping between iterations.
    /// Observes `cancel` between iterations only; a tick in progress runs
    /// to completion.
    pub async fn run(self: Arc<Self>, interval_seconds: u64, cancel: CancellationToken) {
        let interval = std::time::Duration::from_secs(interval_seconds);
        loop {
            let signals = self.tick().await;
            tracing::debug!(count = signals.len(), "tick complete");

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("detection loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

/// Best-effort extraction of a human-readable message from a caught panic
/// payload, for logging only.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use chrono::Utc;
    use futures::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    struct FakeDataSource {
        candles: HashMap<String, Candle>,
        metrics: HashMap<String, Metric>,
        errors: u64,
    }

    impl DataSource for FakeDataSource {
        fn latest_candles(&self, _symbols: &[String]) -> BoxFuture<'_, HashMap<String, Candle>> {
            let candles = self.candles.clone();
            Box::pin(async move { candles })
        }

        fn latest_metrics(&self, _symbols: &[String]) -> BoxFuture<'_, HashMap<String, Metric>> {
            let metrics = self.metrics.clone();
            Box::pin(async move { metrics })
        }

        fn error_count(&self) -> u64 {
            self.errors
        }
    }

    struct MemCooldownStore {
        map: StdMutex<HashMap<String, f64>>,
    }

    impl MemCooldownStore {
        fn new() -> Self {
            Self {
                map: StdMutex::new(HashMap::new()),
            }
        }
    }

    impl CooldownStore for MemCooldownStore {
        fn get(&self, key: &str) -> BoxFuture<'_, Result<f64, Report<StorageError>>> {
            let value = self.map.lock().unwrap().get(key).copied().unwrap_or(0.0);
            Box::pin(async move { Ok(value) })
        }

        fn set(&self, key: &str, timestamp: f64) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
            self.map.lock().unwrap().insert(key.to_string(), timestamp);
            Box::pin(async move { Ok(()) })
        }

        fn load_all(&self) -> BoxFuture<'_, Result<Vec<(String, f64)>, Report<StorageError>>> {
            let rows: Vec<_> = self
                .map
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            Box::pin(async move { Ok(rows) })
        }

        fn cleanup(&self, _max_age_seconds: f64) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
            Box::pin(async move { Ok(0) })
        }
    }

    struct NullHistoryStore;

    impl HistoryStore for NullHistoryStore {
        fn save(&self, _signal: &Signal, _source: &str) -> BoxFuture<'_, i64> {
            Box::pin(async move { 1 })
        }

        fn get_recent(
            &self,
            _limit: i64,
            _symbol: Option<&str>,
            _direction: Option<&str>,
        ) -> BoxFuture<'_, Vec<crate::history::HistoryRecord>> {
            Box::pin(async move { Vec::new() })
        }

        fn get_by_symbol(
            &self,
            _symbol: &str,
            _days: i64,
            _limit: i64,
        ) -> BoxFuture<'_, Vec<crate::history::HistoryRecord>> {
            Box::pin(async move { Vec::new() })
        }

        fn get_stats(&self, days: i64) -> BoxFuture<'_, crate::history::HistoryStats> {
            Box::pin(async move {
                crate::history::HistoryStats {
                    days,
                    ..Default::default()
                }
            })
        }

        fn cleanup(&self, _days: i64) -> BoxFuture<'_, u64> {
            Box::pin(async move { 0 })
        }
    }

    struct EchoLocalizer;

    impl Localizer for EchoLocalizer {
        fn format(&self, key: &str, _lang: &str, _substitutions: &Extra) -> String {
            key.to_string()
        }
    }

    fn candle(close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            bucket_ts: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100.0,
            quote_volume: 100.0,
            trade_count: 5,
            taker_buy_volume: 50.0,
            taker_buy_quote_volume: 50.0,
        }
    }

    async fn build_engine(candles: HashMap<String, Candle>) -> DetectionEngine {
        let data_source = Arc::new(FakeDataSource {
            candles,
            metrics: HashMap::new(),
            errors: 0,
        });
        DetectionEngine::new(
            data_source,
            Arc::new(MemCooldownStore::new()),
            Arc::new(NullHistoryStore),
            Arc::new(EchoLocalizer),
            vec!["BTCUSDT".to_string()],
            "en".to_string(),
            300,
            RuleThresholds::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn cold_start_emits_nothing_but_sets_baseline() {
        let mut candles = HashMap::new();
        candles.insert("BTCUSDT".to_string(), candle(100.0));
        let engine = build_engine(candles).await;

        let signals = engine.tick().await;
        assert!(signals.is_empty());
        assert_eq!(engine.stats().checks, 1);

        let baseline = engine.baseline_candles.lock().await;
        assert_eq!(baseline.get("BTCUSDT").unwrap().close, 100.0);
    }

    #[tokio::test]
    async fn price_surge_fires_on_second_tick() {
        let mut first = HashMap::new();
        first.insert("BTCUSDT".to_string(), candle(100.0));
        let engine = build_engine(first).await;
        engine.tick().await;

        // simulate the next tick's data source returning a surged close
        let data_source = Arc::new(FakeDataSource {
            candles: {
                let mut m = HashMap::new();
                m.insert("BTCUSDT".to_string(), candle(103.0));
                m
            },
            metrics: HashMap::new(),
            errors: 0,
        });
        let engine = DetectionEngine {
            data_source,
            ..engine
        };

        let signals = engine.tick().await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, "price_surge");
        assert_eq!(signals[0].direction, Direction::Buy);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_emission() {
        let mut first = HashMap::new();
        first.insert("BTCUSDT".to_string(), candle(100.0));
        let engine = build_engine(first).await;
        engine.tick().await;

        let engine = DetectionEngine {
            data_source: Arc::new(FakeDataSource {
                candles: {
                    let mut m = HashMap::new();
                    m.insert("BTCUSDT".to_string(), candle(103.0));
                    m
                },
                metrics: HashMap::new(),
                errors: 0,
            }),
            ..engine
        };
        let first_signals = engine.tick().await;
        assert_eq!(first_signals.len(), 1);

        let engine = DetectionEngine {
            data_source: Arc::new(FakeDataSource {
                candles: {
                    let mut m = HashMap::new();
                    m.insert("BTCUSDT".to_string(), candle(106.09));
                    m
                },
                metrics: HashMap::new(),
                errors: 0,
            }),
            ..engine
        };
        let second_signals = engine.tick().await;
        assert!(second_signals.is_empty());
        assert_eq!(engine.stats().cooldowns, 1);
    }

    #[tokio::test]
    async fn missing_metric_skips_metric_rules_without_clobbering_baseline() {
        let mut candles = HashMap::new();
        candles.insert("BTCUSDT".to_string(), candle(100.0));
        let data_source = Arc::new(FakeDataSource {
            candles,
            metrics: HashMap::new(),
            errors: 0,
        });
        let engine = DetectionEngine::new(
            data_source,
            Arc::new(MemCooldownStore::new()),
            Arc::new(NullHistoryStore),
            Arc::new(EchoLocalizer),
            vec!["BTCUSDT".to_string()],
            "en".to_string(),
            300,
            RuleThresholds::default(),
        )
        .await
        .unwrap();

        engine.tick().await;
        let baseline_metrics = engine.baseline_metrics.lock().await;
        assert!(baseline_metrics.get("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn sustained_data_source_outage_is_folded_into_stats_errors() {
        let mut candles = HashMap::new();
        candles.insert("BTCUSDT".to_string(), candle(100.0));
        let engine = build_engine(candles).await;

        let engine = DetectionEngine {
            data_source: Arc::new(FakeDataSource {
                candles: HashMap::new(),
                metrics: HashMap::new(),
                errors: 2,
            }),
            ..engine
        };
        engine.tick().await;
        assert_eq!(engine.stats().errors, 2);

        // a second tick against the same ongoing outage only folds in the
        // *new* errors since the last tick, not the lifetime total again.
        let engine = DetectionEngine {
            data_source: Arc::new(FakeDataSource {
                candles: HashMap::new(),
                metrics: HashMap::new(),
                errors: 5,
            }),
            ..engine
        };
        engine.tick().await;
        assert_eq!(engine.stats().errors, 5);
    }

    struct PanickingNotifier;

    impl Notifier for PanickingNotifier {
        fn notify(&self, _signal: &Signal, _message: &str) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_kill_the_tick() {
        let mut first = HashMap::new();
        first.insert("BTCUSDT".to_string(), candle(100.0));
        let engine = build_engine(first).await;
        engine.tick().await;

        engine.register_callback(Arc::new(PanickingNotifier)).await;

        let engine = DetectionEngine {
            data_source: Arc::new(FakeDataSource {
                candles: {
                    let mut m = HashMap::new();
                    m.insert("BTCUSDT".to_string(), candle(103.0));
                    m
                },
                metrics: HashMap::new(),
                errors: 0,
            }),
            ..engine
        };

        let signals = engine.tick().await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, "price_surge");
    }
}
