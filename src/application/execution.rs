use crate::domain::portfolio::Portfolio;
use crate::domain::types::{
    ExecutionReport, PortfolioDecision, SkippedTrade, TradeAction, TradeFill,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Applies the portfolio manager's decisions to the portfolio. The single
/// writer of portfolio state.
///
/// Longs are capped by available cash (the quantity is downsized, never the
/// cash driven negative). Shorts are capped so that
/// `margin_used <= cash / margin_requirement` keeps holding; with margin
/// disabled (`margin_requirement == 0`) shorts are rejected outright.
pub fn execute_decisions(
    portfolio: &mut Portfolio,
    decisions: &BTreeMap<String, PortfolioDecision>,
    prices: &BTreeMap<String, f64>,
    date: NaiveDate,
) -> ExecutionReport {
    let mut executed = Vec::new();
    let mut skipped = Vec::new();

    for (ticker, decision) in decisions {
        if decision.action == TradeAction::Hold || decision.quantity == 0 {
            continue;
        }

        let price = prices.get(ticker).copied().unwrap_or(0.0);
        let Some(price_dec) = Decimal::from_f64(price).filter(|p| *p > Decimal::ZERO) else {
            skipped.push(SkippedTrade {
                ticker: ticker.clone(),
                action: decision.action,
                reason: "no current price".to_string(),
            });
            continue;
        };

        match decision.action {
            TradeAction::Long => {
                let affordable = (portfolio.cash / price_dec)
                    .floor()
                    .to_u64()
                    .unwrap_or(0);
                let fill = decision.quantity.min(affordable);
                if fill == 0 {
                    skipped.push(SkippedTrade {
                        ticker: ticker.clone(),
                        action: decision.action,
                        reason: format!(
                            "insufficient cash: {} available at price {:.2}",
                            portfolio.cash, price
                        ),
                    });
                    continue;
                }
                if fill < decision.quantity {
                    warn!(
                        "Executor: downsizing {} long from {} to {} shares",
                        ticker, decision.quantity, fill
                    );
                }

                let cost = Decimal::from(fill) * price_dec;
                portfolio.cash -= cost;

                let position = portfolio.positions.entry(ticker.clone()).or_default();
                let prior = Decimal::from(position.long) * position.long_cost_basis;
                position.long += fill;
                position.long_cost_basis = (prior + cost) / Decimal::from(position.long);

                executed.push(TradeFill {
                    ticker: ticker.clone(),
                    action: TradeAction::Long,
                    requested_quantity: decision.quantity,
                    filled_quantity: fill,
                    price,
                });
            }
            TradeAction::Short => {
                if portfolio.margin_requirement <= 0.0 {
                    skipped.push(SkippedTrade {
                        ticker: ticker.clone(),
                        action: decision.action,
                        reason: "short selling requires a margin account".to_string(),
                    });
                    continue;
                }
                let margin_req = Decimal::from_f64(portfolio.margin_requirement)
                    .unwrap_or(Decimal::ONE);
                let margin_room = portfolio.cash / margin_req - portfolio.margin_used;
                let per_share_margin = price_dec * margin_req;
                let max_shortable = (margin_room / per_share_margin)
                    .floor()
                    .to_u64()
                    .unwrap_or(0);
                let fill = decision.quantity.min(max_shortable);
                if fill == 0 {
                    skipped.push(SkippedTrade {
                        ticker: ticker.clone(),
                        action: decision.action,
                        reason: "insufficient margin headroom".to_string(),
                    });
                    continue;
                }

                let proceeds = Decimal::from(fill) * price_dec;
                portfolio.cash += proceeds;
                portfolio.margin_used += Decimal::from(fill) * per_share_margin;

                let position = portfolio.positions.entry(ticker.clone()).or_default();
                let prior = Decimal::from(position.short) * position.short_cost_basis;
                position.short += fill;
                position.short_cost_basis = (prior + proceeds) / Decimal::from(position.short);

                executed.push(TradeFill {
                    ticker: ticker.clone(),
                    action: TradeAction::Short,
                    requested_quantity: decision.quantity,
                    filled_quantity: fill,
                    price,
                });
            }
            TradeAction::Hold => unreachable!("hold handled above"),
        }
    }

    debug_assert!(portfolio.invariants_hold());
    info!(
        "Executor: {} fills, {} skipped on {}",
        executed.len(),
        skipped.len(),
        date
    );

    ExecutionReport {
        date,
        executed,
        skipped,
        portfolio: portfolio.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn decide(action: TradeAction, quantity: u64) -> PortfolioDecision {
        PortfolioDecision {
            action,
            quantity,
            confidence: 80.0,
            reasoning: "test".to_string(),
        }
    }

    fn run(
        portfolio: &mut Portfolio,
        ticker: &str,
        decision: PortfolioDecision,
        price: f64,
    ) -> ExecutionReport {
        let mut decisions = BTreeMap::new();
        decisions.insert(ticker.to_string(), decision);
        let mut prices = BTreeMap::new();
        prices.insert(ticker.to_string(), price);
        execute_decisions(
            portfolio,
            &decisions,
            &prices,
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        )
    }

    #[test]
    fn unaffordable_long_is_rejected_whole() {
        // 1000 cash cannot buy a single 2000-dollar share.
        let mut portfolio = Portfolio::new(dec!(1000), 0.0);
        let report = run(&mut portfolio, "AAPL", decide(TradeAction::Long, 10), 2000.0);

        assert!(report.executed.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(portfolio.cash, dec!(1000));
        assert_eq!(portfolio.position("AAPL").long, 0);
        assert!(portfolio.invariants_hold());
    }

    #[test]
    fn long_is_downsized_to_affordable_quantity() {
        let mut portfolio = Portfolio::new(dec!(1000), 0.0);
        let report = run(&mut portfolio, "AAPL", decide(TradeAction::Long, 5), 300.0);

        assert_eq!(report.executed[0].filled_quantity, 3);
        assert_eq!(report.executed[0].requested_quantity, 5);
        assert_eq!(portfolio.cash, dec!(100));
        assert_eq!(portfolio.position("AAPL").long, 3);
        assert!(portfolio.invariants_hold());
    }

    #[test]
    fn long_cost_basis_is_weighted_average() {
        let mut portfolio = Portfolio::new(dec!(10000), 0.0);
        run(&mut portfolio, "AAPL", decide(TradeAction::Long, 10), 100.0);
        run(&mut portfolio, "AAPL", decide(TradeAction::Long, 10), 200.0);

        let position = portfolio.position("AAPL");
        assert_eq!(position.long, 20);
        assert_eq!(position.long_cost_basis, dec!(150));
    }

    #[test]
    fn short_without_margin_account_is_rejected() {
        let mut portfolio = Portfolio::new(dec!(10000), 0.0);
        let report = run(&mut portfolio, "TSLA", decide(TradeAction::Short, 5), 100.0);

        assert!(report.executed.is_empty());
        assert_eq!(portfolio.position("TSLA").short, 0);
        assert!(report.skipped[0].reason.contains("margin"));
    }

    #[test]
    fn short_respects_margin_cap() {
        // cash 1000, requirement 0.5: cap = 2000 margin, 50/share margin at
        // price 100, so at most 40 shares.
        let mut portfolio = Portfolio::new(dec!(1000), 0.5);
        let report = run(&mut portfolio, "TSLA", decide(TradeAction::Short, 100), 100.0);

        assert_eq!(report.executed[0].filled_quantity, 40);
        assert_eq!(portfolio.position("TSLA").short, 40);
        assert_eq!(portfolio.margin_used, dec!(2000));
        // Proceeds credited: 1000 + 40*100.
        assert_eq!(portfolio.cash, dec!(5000));
        assert!(portfolio.invariants_hold());
    }

    #[test]
    fn hold_and_zero_quantity_are_no_ops() {
        let mut portfolio = Portfolio::new(dec!(1000), 0.0);
        let report = run(&mut portfolio, "AAPL", decide(TradeAction::Hold, 10), 100.0);
        assert!(report.executed.is_empty() && report.skipped.is_empty());

        let report = run(&mut portfolio, "AAPL", decide(TradeAction::Long, 0), 100.0);
        assert!(report.executed.is_empty() && report.skipped.is_empty());
        assert_eq!(portfolio.cash, dec!(1000));
    }

    #[test]
    fn missing_price_skips_trade() {
        let mut portfolio = Portfolio::new(dec!(1000), 0.0);
        let mut decisions = BTreeMap::new();
        decisions.insert("AAPL".to_string(), decide(TradeAction::Long, 1));
        let report = execute_decisions(
            &mut portfolio,
            &decisions,
            &BTreeMap::new(),
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        );
        assert_eq!(report.skipped[0].reason, "no current price");
    }
}
