use crate::model::Signal;
use crate::notifier::Notifier;

pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, signal: &Signal, message: &str) {
        tracing::warn!(
            symbol = %signal.symbol,
            signal_type = signal.signal_type,
            direction = %signal.direction,
            strength = signal.strength,
            price = signal.price,
            "SIGNAL: {}",
            message,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, Extra};

    #[test]
    fn terminal_notifier_does_not_panic() {
        let notifier = TerminalNotifier;
        let signal = Signal::new(
            "BTCUSDT".into(),
            "price_surge",
            Direction::Buy,
            80.0,
            "price surged".into(),
            "5m",
            103.0,
            Extra::new(),
        );
        notifier.notify(&signal, "BTCUSDT price surged 3.00%");
    }
}
