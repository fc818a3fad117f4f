use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most recent 1-minute candle observation for a symbol.
///
/// All numeric fields are non-negative per the source table's invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub bucket_ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: i64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
}

/// Most recent 5-minute bucket of futures-derived metrics for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub symbol: String,
    pub create_time: DateTime<Utc>,
    pub sum_open_interest: f64,
    pub sum_open_interest_value: f64,
    pub count_toptrader_long_short_ratio: f64,
    pub sum_toptrader_long_short_ratio: f64,
    pub count_long_short_ratio: f64,
    pub sum_taker_long_short_vol_ratio: f64,
}

/// Direction of an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
    Alert,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Alert => "ALERT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "ALERT" => Some(Self::Alert),
            _ => None,
        }
    }
}

/// An open, rule-specific diagnostic value attached to a `Signal`.
///
/// Modeled as a small string-keyed map rather than a typed struct per
/// rule, since the set of diagnostics varies per rule and is never
/// consumed structurally outside logging/history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Number(f64),
    Text(String),
}

pub type Extra = BTreeMap<String, ExtraValue>;

/// A detected market signal, ready for delivery and persistence.
#[derive(Debug, Clone)]
pub struct Signal {
    pub symbol: String,
    pub signal_type: &'static str,
    pub direction: Direction,
    pub strength: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub timeframe: &'static str,
    pub price: f64,
    pub extra: Extra,
}

impl Signal {
    /// Build a signal, clamping `strength` into `[0, 100]` per the
    /// data-model invariant. A raw strength outside that range is a bug
    /// in the caller, not a legitimate runtime state — clamp rather than
    /// propagate it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        signal_type: &'static str,
        direction: Direction,
        raw_strength: f64,
        message: String,
        timeframe: &'static str,
        price: f64,
        extra: Extra,
    ) -> Self {
        Self {
            symbol,
            signal_type,
            direction,
            strength: clamp_strength(raw_strength),
            message,
            timestamp: Utc::now(),
            timeframe,
            price,
            extra,
        }
    }

    /// Key used for cooldown gating and history grouping: `"{symbol}_{signal_type}"`.
    pub fn cooldown_key(symbol: &str, signal_type: &str) -> String {
        format!("{symbol}_{signal_type}")
    }
}

fn clamp_strength(value: f64) -> u8 {
    value.clamp(0.0, 100.0).trunc() as u8
}
