use crate::config::RuleThresholds;
use crate::model::{Candle, Direction, Extra, ExtraValue, Metric, Signal};

/// One fixed rule: a pure function of the current/previous candle and
/// metric pair, producing at most one signal. `applies_when_metric_present`
/// decides whether this rule is even attempted for a symbol whose current
/// tick has no metric observation (spec.md §4.5 step 3).
pub struct Rule {
    pub id: &'static str,
    pub applies_when_metric_present: bool,
    pub evaluate: RuleFn,
}

type RuleFn = fn(
    symbol: &str,
    cc: &Candle,
    pc: Option<&Candle>,
    cm: Option<&Metric>,
    pm: Option<&Metric>,
    thresholds: &RuleThresholds,
) -> Option<Signal>;

/// The eleven rules actually defined by the rule table (five candle-only,
/// six metric). Order is the fixed evaluation order within a symbol.
pub const RULES: &[Rule] = &[
    Rule {
        id: "price_surge",
        applies_when_metric_present: false,
        evaluate: price_surge,
    },
    Rule {
        id: "price_dump",
        applies_when_metric_present: false,
        evaluate: price_dump,
    },
    Rule {
        id: "volume_spike",
        applies_when_metric_present: false,
        evaluate: volume_spike,
    },
    Rule {
        id: "taker_buy_dominance",
        applies_when_metric_present: false,
        evaluate: taker_buy_dominance,
    },
    Rule {
        id: "taker_sell_dominance",
        applies_when_metric_present: false,
        evaluate: taker_sell_dominance,
    },
    Rule {
        id: "oi_surge",
        applies_when_metric_present: true,
        evaluate: oi_surge,
    },
    Rule {
        id: "oi_dump",
        applies_when_metric_present: true,
        evaluate: oi_dump,
    },
    Rule {
        id: "top_trader_extreme_long",
        applies_when_metric_present: true,
        evaluate: top_trader_extreme_long,
    },
    Rule {
        id: "top_trader_extreme_short",
        applies_when_metric_present: true,
        evaluate: top_trader_extreme_short,
    },
    Rule {
        id: "taker_ratio_flip_long",
        applies_when_metric_present: true,
        evaluate: taker_ratio_flip_long,
    },
    Rule {
        id: "taker_ratio_flip_short",
        applies_when_metric_present: true,
        evaluate: taker_ratio_flip_short,
    },
];

fn extra_one(key: &str, value: f64) -> Extra {
    let mut map = Extra::new();
    map.insert(key.to_string(), ExtraValue::Number(value));
    map
}

fn signal(
    symbol: &str,
    id: &'static str,
    direction: Direction,
    strength: f64,
    price: f64,
    extra: Extra,
) -> Signal {
    Signal::new(
        symbol.to_string(),
        id,
        direction,
        strength,
        id.to_string(),
        "5m",
        price,
        extra,
    )
}

fn price_surge(
    symbol: &str,
    cc: &Candle,
    pc: Option<&Candle>,
    _cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let pc = pc?;
    if pc.close == 0.0 {
        return None;
    }
    let delta_pct = (cc.close - pc.close) / pc.close * 100.0;
    if delta_pct < th.price_surge_pct {
        return None;
    }
    let strength = (50.0 + delta_pct * 10.0).min(90.0);
    Some(signal(
        symbol,
        "price_surge",
        Direction::Buy,
        strength,
        cc.close,
        extra_one("delta_pct", delta_pct),
    ))
}

fn price_dump(
    symbol: &str,
    cc: &Candle,
    pc: Option<&Candle>,
    _cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let pc = pc?;
    if pc.close == 0.0 {
        return None;
    }
    let delta_pct = (cc.close - pc.close) / pc.close * 100.0;
    if delta_pct > -th.price_dump_pct {
        return None;
    }
    let strength = (50.0 + delta_pct.abs() * 10.0).min(90.0);
    Some(signal(
        symbol,
        "price_dump",
        Direction::Sell,
        strength,
        cc.close,
        extra_one("delta_pct", delta_pct),
    ))
}

fn volume_spike(
    symbol: &str,
    cc: &Candle,
    pc: Option<&Candle>,
    _cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let pc = pc?;
    if pc.quote_volume == 0.0 {
        return None;
    }
    let ratio = cc.quote_volume / pc.quote_volume;
    if ratio < th.volume_spike_multiplier {
        return None;
    }
    let strength = (50.0 + ratio * 5.0).min(85.0);
    Some(signal(
        symbol,
        "volume_spike",
        Direction::Alert,
        strength,
        cc.close,
        extra_one("ratio", ratio),
    ))
}

fn taker_buy_dominance(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    _cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    if cc.quote_volume == 0.0 {
        return None;
    }
    let ratio = cc.taker_buy_quote_volume / cc.quote_volume;
    if ratio < th.taker_buy_dominance_ratio {
        return None;
    }
    let strength = 60.0 + ratio * 30.0;
    Some(signal(
        symbol,
        "taker_buy_dominance",
        Direction::Buy,
        strength,
        cc.close,
        extra_one("ratio", ratio),
    ))
}

fn taker_sell_dominance(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    _cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    if cc.quote_volume == 0.0 {
        return None;
    }
    let buy_ratio = cc.taker_buy_quote_volume / cc.quote_volume;
    let sell_ratio = 1.0 - buy_ratio;
    if sell_ratio < th.taker_sell_dominance_ratio {
        return None;
    }
    let strength = 60.0 + sell_ratio * 30.0;
    Some(signal(
        symbol,
        "taker_sell_dominance",
        Direction::Sell,
        strength,
        cc.close,
        extra_one("ratio", sell_ratio),
    ))
}

fn oi_surge(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    cm: Option<&Metric>,
    pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let cm = cm?;
    let pm = pm?;
    if pm.sum_open_interest_value == 0.0 {
        return None;
    }
    let change_pct =
        (cm.sum_open_interest_value - pm.sum_open_interest_value) / pm.sum_open_interest_value
            * 100.0;
    if change_pct < th.oi_surge_pct {
        return None;
    }
    let strength = (55.0 + change_pct * 3.0).min(80.0);
    Some(signal(
        symbol,
        "oi_surge",
        Direction::Alert,
        strength,
        cc.close,
        extra_one("change_pct", change_pct),
    ))
}

fn oi_dump(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    cm: Option<&Metric>,
    pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let cm = cm?;
    let pm = pm?;
    if pm.sum_open_interest_value == 0.0 {
        return None;
    }
    let change_pct =
        (cm.sum_open_interest_value - pm.sum_open_interest_value) / pm.sum_open_interest_value
            * 100.0;
    if change_pct > -th.oi_dump_pct {
        return None;
    }
    let strength = (55.0 + change_pct.abs() * 3.0).min(80.0);
    Some(signal(
        symbol,
        "oi_dump",
        Direction::Alert,
        strength,
        cc.close,
        extra_one("change_pct", change_pct),
    ))
}

fn top_trader_extreme_long(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let cm = cm?;
    let ttr = cm.count_toptrader_long_short_ratio;
    if ttr < th.top_trader_extreme_long_ratio {
        return None;
    }
    let strength = (60.0 + ttr * 8.0).min(85.0);
    Some(signal(
        symbol,
        "top_trader_extreme_long",
        Direction::Alert,
        strength,
        cc.close,
        extra_one("ttr", ttr),
    ))
}

fn top_trader_extreme_short(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    cm: Option<&Metric>,
    _pm: Option<&Metric>,
    th: &RuleThresholds,
) -> Option<Signal> {
    let cm = cm?;
    let ttr = cm.count_toptrader_long_short_ratio;
    if ttr == 0.0 || ttr > th.top_trader_extreme_short_ratio {
        return None;
    }
    let strength = (60.0 + (1.0 / ttr) * 5.0).min(85.0);
    Some(signal(
        symbol,
        "top_trader_extreme_short",
        Direction::Alert,
        strength,
        cc.close,
        extra_one("ttr", ttr),
    ))
}

fn taker_ratio_flip_long(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    cm: Option<&Metric>,
    pm: Option<&Metric>,
    _th: &RuleThresholds,
) -> Option<Signal> {
    let cm = cm?;
    let pm = pm?;
    let tlsr_prev = pm.sum_taker_long_short_vol_ratio;
    let tlsr = cm.sum_taker_long_short_vol_ratio;
    if !(tlsr_prev < 1.0 && tlsr >= 1.2) {
        return None;
    }
    Some(signal(
        symbol,
        "taker_ratio_flip_long",
        Direction::Buy,
        70.0,
        cc.close,
        extra_one("tlsr", tlsr),
    ))
}

fn taker_ratio_flip_short(
    symbol: &str,
    cc: &Candle,
    _pc: Option<&Candle>,
    cm: Option<&Metric>,
    pm: Option<&Metric>,
    _th: &RuleThresholds,
) -> Option<Signal> {
    let cm = cm?;
    let pm = pm?;
    let tlsr_prev = pm.sum_taker_long_short_vol_ratio;
    let tlsr = cm.sum_taker_long_short_vol_ratio;
    if !(tlsr_prev > 1.0 && tlsr <= 0.8) {
        return None;
    }
    Some(signal(
        symbol,
        "taker_ratio_flip_short",
        Direction::Sell,
        70.0,
        cc.close,
        extra_one("tlsr", tlsr),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(close: f64, quote_volume: f64, taker_buy_quote_volume: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            bucket_ts: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: quote_volume,
            quote_volume,
            trade_count: 10,
            taker_buy_volume: taker_buy_quote_volume,
            taker_buy_quote_volume,
        }
    }

    fn metric(oi: f64, ttr: f64, tlsr: f64) -> Metric {
        Metric {
            symbol: "BTCUSDT".into(),
            create_time: Utc::now(),
            sum_open_interest: oi,
            sum_open_interest_value: oi,
            count_toptrader_long_short_ratio: ttr,
            sum_toptrader_long_short_ratio: ttr,
            count_long_short_ratio: ttr,
            sum_taker_long_short_vol_ratio: tlsr,
        }
    }

    #[test]
    fn price_surge_fires_above_threshold() {
        let th = RuleThresholds::default();
        let previous = candle(100.0, 100.0, 50.0);
        let current = candle(103.0, 100.0, 50.0);
        let got = price_surge("BTCUSDT", &current, Some(&previous), None, None, &th).unwrap();
        assert_eq!(got.direction, Direction::Buy);
        assert_eq!(got.strength, 80);
    }

    #[test]
    fn price_surge_absent_without_baseline() {
        let th = RuleThresholds::default();
        let current = candle(103.0, 100.0, 50.0);
        assert!(price_surge("BTCUSDT", &current, None, None, None, &th).is_none());
    }

    #[test]
    fn volume_spike_zero_denominator_guard() {
        let th = RuleThresholds::default();
        let previous = candle(100.0, 0.0, 0.0);
        let current = candle(100.0, 1_000_000.0, 500_000.0);
        assert!(volume_spike("BTCUSDT", &current, Some(&previous), None, None, &th).is_none());
    }

    #[test]
    fn taker_ratio_flip_long_fires_on_crossing() {
        let th = RuleThresholds::default();
        let cc = candle(100.0, 100.0, 50.0);
        let cm = metric(1000.0, 1.0, 1.25);
        let pm = metric(1000.0, 1.0, 0.9);
        let got = taker_ratio_flip_long("BTCUSDT", &cc, None, Some(&cm), Some(&pm), &th).unwrap();
        assert_eq!(got.direction, Direction::Buy);
        assert_eq!(got.strength, 70);
    }

    #[test]
    fn top_trader_extreme_short_guards_zero_ratio() {
        let th = RuleThresholds::default();
        let cc = candle(100.0, 100.0, 50.0);
        let cm = metric(1000.0, 0.0, 1.0);
        assert!(top_trader_extreme_short("BTCUSDT", &cc, None, Some(&cm), None, &th).is_none());
    }

    #[test]
    fn rule_table_has_eleven_entries() {
        assert_eq!(RULES.len(), 11);
        assert_eq!(RULES.iter().filter(|r| r.applies_when_metric_present).count(), 6);
    }
}
