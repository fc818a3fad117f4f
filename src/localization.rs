use std::collections::HashMap;

use crate::model::{Extra, ExtraValue};

/// Renders a message key plus named substitutions into human text.
///
/// The rule table dictates the key per rule id (the key equals the rule's
/// `signal_type`); translations are not part of the stable contract, only
/// the keys are. The engine calls this immediately before delivery, never
/// during rule evaluation.
pub trait Localizer: Send + Sync {
    fn format(&self, key: &str, lang: &str, substitutions: &Extra) -> String;
}

/// Built-in zh/en message catalog for the eleven rule ids.
///
/// An unknown key or language falls back to the key itself rendered with
/// its substitutions, so a translation gap never blocks delivery.
pub struct DefaultLocalizer {
    templates: HashMap<(&'static str, &'static str), &'static str>,
}

impl Default for DefaultLocalizer {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(("zh", "price_surge"), "{symbol} 价格急涨 {delta_pct:.2}%");
        templates.insert(("en", "price_surge"), "{symbol} price surged {delta_pct:.2}%");
        templates.insert(("zh", "price_dump"), "{symbol} 价格急跌 {delta_pct:.2}%");
        templates.insert(("en", "price_dump"), "{symbol} price dumped {delta_pct:.2}%");
        templates.insert(("zh", "volume_spike"), "{symbol} 成交量异常放大，倍数 {ratio:.2}");
        templates.insert(("en", "volume_spike"), "{symbol} volume spiked {ratio:.2}x");
        templates.insert(
            ("zh", "taker_buy_dominance"),
            "{symbol} 主动买盘占比 {ratio:.2}",
        );
        templates.insert(
            ("en", "taker_buy_dominance"),
            "{symbol} taker buy dominance {ratio:.2}",
        );
        templates.insert(
            ("zh", "taker_sell_dominance"),
            "{symbol} 主动卖盘占比 {ratio:.2}",
        );
        templates.insert(
            ("en", "taker_sell_dominance"),
            "{symbol} taker sell dominance {ratio:.2}",
        );
        templates.insert(("zh", "oi_surge"), "{symbol} 持仓量急增 {change_pct:.2}%");
        templates.insert(("en", "oi_surge"), "{symbol} open interest surged {change_pct:.2}%");
        templates.insert(("zh", "oi_dump"), "{symbol} 持仓量急减 {change_pct:.2}%");
        templates.insert(("en", "oi_dump"), "{symbol} open interest dumped {change_pct:.2}%");
        templates.insert(
            ("zh", "top_trader_extreme_long"),
            "{symbol} 大户多头比例极高 {ttr:.2}",
        );
        templates.insert(
            ("en", "top_trader_extreme_long"),
            "{symbol} top traders extremely long {ttr:.2}",
        );
        templates.insert(
            ("zh", "top_trader_extreme_short"),
            "{symbol} 大户空头比例极高 {ttr:.2}",
        );
        templates.insert(
            ("en", "top_trader_extreme_short"),
            "{symbol} top traders extremely short {ttr:.2}",
        );
        templates.insert(
            ("zh", "taker_ratio_flip_long"),
            "{symbol} 主动买卖比反转为多头 {tlsr:.2}",
        );
        templates.insert(
            ("en", "taker_ratio_flip_long"),
            "{symbol} taker ratio flipped long {tlsr:.2}",
        );
        templates.insert(
            ("zh", "taker_ratio_flip_short"),
            "{symbol} 主动买卖比反转为空头 {tlsr:.2}",
        );
        templates.insert(
            ("en", "taker_ratio_flip_short"),
            "{symbol} taker ratio flipped short {tlsr:.2}",
        );
        Self { templates }
    }
}

impl Localizer for DefaultLocalizer {
    fn format(&self, key: &str, lang: &str, substitutions: &Extra) -> String {
        let template = self
            .templates
            .get(&(lang, key))
            .or_else(|| self.templates.get(&("en", key)))
            .copied();

        let Some(template) = template else {
            return render_fallback(key, substitutions);
        };

        render_template(template, substitutions)
    }
}

fn render_fallback(key: &str, substitutions: &Extra) -> String {
    let args: Vec<String> = substitutions
        .iter()
        .map(|(k, v)| format!("{k}={}", render_value(v)))
        .collect();
    if args.is_empty() {
        key.to_string()
    } else {
        format!("{key} ({})", args.join(", "))
    }
}

fn render_value(value: &ExtraValue) -> String {
    match value {
        ExtraValue::Number(n) => format!("{n:.2}"),
        ExtraValue::Text(s) => s.clone(),
    }
}

/// Substitutes `{name}` and `{name:.2}` placeholders from `substitutions`
/// plus the implicit `symbol`/`price` keys the caller merges in. An
/// unresolvable placeholder is left verbatim rather than failing the
/// whole render — a missing substitution should never suppress delivery.
fn render_template(template: &str, substitutions: &Extra) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let placeholder = &template[i + 1..i + end];
                let (name, _spec) = placeholder.split_once(':').unwrap_or((placeholder, ""));
                match substitutions.get(name) {
                    Some(value) => out.push_str(&render_value(value)),
                    None => out.push_str(&template[i..=i + end]),
                }
                i += end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}
