use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One ticker's holdings. Long and short legs are tracked independently and
/// never netted until an explicit close.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub long: u64,
    pub short: u64,
    pub long_cost_basis: Decimal,
    pub short_cost_basis: Decimal,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.long == 0 && self.short == 0
    }
}

/// Cross-day portfolio state. Owned by the multi-day driver, mutated only by
/// the trade executor, snapshotted after each day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: Decimal,
    pub positions: BTreeMap<String, Position>,
    pub margin_requirement: f64,
    pub margin_used: Decimal,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal, margin_requirement: f64) -> Self {
        Self {
            cash: initial_cash,
            positions: BTreeMap::new(),
            margin_requirement,
            margin_used: Decimal::ZERO,
        }
    }

    pub fn position(&self, ticker: &str) -> Position {
        self.positions.get(ticker).cloned().unwrap_or_default()
    }

    /// Absolute market value of both legs for one ticker.
    pub fn position_value(&self, ticker: &str, price: f64) -> f64 {
        let position = self.position(ticker);
        let price = price.max(0.0);
        (position.long + position.short) as f64 * price
    }

    /// Cash plus net long/short exposure at the given prices. Positions with
    /// no quoted price are valued at cost basis.
    pub fn total_value(&self, prices: &BTreeMap<String, f64>) -> f64 {
        let mut total = self.cash.to_f64().unwrap_or(0.0);
        for (ticker, position) in &self.positions {
            let long_px = prices
                .get(ticker)
                .copied()
                .unwrap_or_else(|| position.long_cost_basis.to_f64().unwrap_or(0.0));
            let short_px = prices
                .get(ticker)
                .copied()
                .unwrap_or_else(|| position.short_cost_basis.to_f64().unwrap_or(0.0));
            total += position.long as f64 * long_px;
            total -= position.short as f64 * short_px;
        }
        total
    }

    /// `margin_used <= cash / margin_requirement` when margin is enabled, and
    /// cash is never negative.
    pub fn invariants_hold(&self) -> bool {
        if self.cash < Decimal::ZERO {
            return false;
        }
        if self.margin_requirement > 0.0 {
            let cap = self.cash
                / Decimal::from_f64(self.margin_requirement).unwrap_or(Decimal::ONE);
            if self.margin_used > cap {
                return false;
            }
        }
        true
    }
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new(Decimal::ZERO, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn total_value_nets_short_leg() {
        let mut portfolio = Portfolio::new(dec!(10000), 0.5);
        portfolio.positions.insert(
            "AAPL".to_string(),
            Position {
                long: 10,
                short: 4,
                long_cost_basis: dec!(100),
                short_cost_basis: dec!(100),
            },
        );

        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 110.0);

        // 10000 + 10*110 - 4*110 = 10660
        assert_eq!(portfolio.total_value(&prices), 10660.0);
    }

    #[test]
    fn unpriced_position_falls_back_to_cost_basis() {
        let mut portfolio = Portfolio::new(dec!(1000), 0.0);
        portfolio.positions.insert(
            "TSLA".to_string(),
            Position {
                long: 5,
                short: 0,
                long_cost_basis: dec!(200),
                short_cost_basis: Decimal::ZERO,
            },
        );

        assert_eq!(portfolio.total_value(&BTreeMap::new()), 2000.0);
    }

    #[test]
    fn margin_invariant_detects_violation() {
        let mut portfolio = Portfolio::new(dec!(1000), 0.5);
        portfolio.margin_used = dec!(1500);
        assert!(portfolio.invariants_hold());

        portfolio.margin_used = dec!(2500); // cap is 1000 / 0.5 = 2000
        assert!(!portfolio.invariants_hold());
    }

    #[test]
    fn zero_margin_requirement_disables_margin_check() {
        let mut portfolio = Portfolio::new(dec!(100), 0.0);
        portfolio.margin_used = dec!(99999);
        assert!(portfolio.invariants_hold());
    }
}
