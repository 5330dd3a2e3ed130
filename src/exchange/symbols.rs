//! Cached per-symbol trading rules (tick and step sizes)

use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolRules {
    /// Round a trigger price to the nearest tick
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_to_increment(price, self.tick_size, RoundingStrategy::MidpointNearestEven)
    }

    /// Round a quantity down to the step size; reduce-only orders must never exceed the position
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        round_to_increment(quantity, self.step_size, RoundingStrategy::ToZero)
    }
}

fn round_to_increment(value: Decimal, increment: Decimal, strategy: RoundingStrategy) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let steps = (value / increment).round_dp_with_strategy(0, strategy);
    (steps * increment).normalize()
}

/// Thread-safe cache filled lazily from venue instrument endpoints
#[derive(Debug, Default)]
pub struct SymbolRulesCache {
    rules: DashMap<String, SymbolRules>,
}

impl SymbolRulesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolRules> {
        self.rules.get(symbol).map(|r| *r)
    }

    pub fn insert(&self, symbol: impl Into<String>, rules: SymbolRules) {
        self.rules.insert(symbol.into(), rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> SymbolRules {
        SymbolRules {
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
        }
    }

    #[test]
    fn price_rounds_to_tick() {
        assert_eq!(btc().round_price(dec!(93500.04)), dec!(93500));
        assert_eq!(btc().round_price(dec!(93500.06)), dec!(93500.1));
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        assert_eq!(btc().round_quantity(dec!(0.5999)), dec!(0.599));
        assert_eq!(btc().round_quantity(dec!(0.6)), dec!(0.6));
    }

    #[test]
    fn cache_lookup() {
        let cache = SymbolRulesCache::new();
        assert!(cache.get("BTCUSDT").is_none());
        cache.insert("BTCUSDT", btc());
        assert_eq!(cache.get("BTCUSDT"), Some(btc()));
        assert_eq!(cache.len(), 1);
    }
}
