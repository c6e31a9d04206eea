mod support;

use quorumtrade::application::agents::persona::AnalystType;
use quorumtrade::application::orchestrator::{DayOrchestrator, DayRunConfig};
use quorumtrade::domain::portfolio::Portfolio;
use quorumtrade::domain::state::{ApiKeys, EngineMode, ModelMetadata};
use quorumtrade::domain::types::{RiskAssessment, TradeAction};
use rust_decimal_macros::dec;
use support::{add_happy_path_rules, build_harness, seed_bars, trading_date};

/// Cash exhaustion: with 1000 cash and a 2000 price, a 10-share long call
/// must not open any position or drive cash negative.
#[tokio::test(start_paused = true)]
async fn unaffordable_decision_leaves_portfolio_intact() {
    let harness = build_harness(
        "cash-exhaustion",
        vec![AnalystType::Fundamental, AnalystType::Technical],
        false,
        None,
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    seed_bars(&harness.market, "AAPL", trading_date(), 2000.0, 2000.0);

    let orchestrator = DayOrchestrator::new(harness.services.clone());
    let outcome = orchestrator
        .run_day(DayRunConfig {
            date: trading_date(),
            tickers: vec!["AAPL".to_string()],
            mode: EngineMode::Portfolio,
            is_live_mode: false,
            api_keys: ApiKeys::default(),
            models: ModelMetadata::default(),
            portfolio: Some(Portfolio::new(dec!(1000), 0.0)),
        })
        .await
        .expect("day should complete");

    // The PM asked for 10 shares.
    assert_eq!(outcome.final_decisions["AAPL"].action, TradeAction::Long);
    assert_eq!(outcome.final_decisions["AAPL"].quantity, 10);

    let report = outcome.execution.expect("backtest mode executes trades");
    let portfolio = &report.portfolio;
    assert!(portfolio.cash >= rust_decimal::Decimal::ZERO);
    assert_eq!(portfolio.position("AAPL").long, 0);
    assert_eq!(report.executed.len(), 0);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.contains("insufficient cash"));
    assert!(portfolio.invariants_hold());
}

/// Portfolio-mode risk output carries position limits, and the executor only
/// ever reads prices produced by the risk manager.
#[tokio::test(start_paused = true)]
async fn executor_reads_risk_manager_prices() {
    let harness = build_harness(
        "risk-prices",
        vec![AnalystType::Technical],
        false,
        None,
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    seed_bars(&harness.market, "AAPL", trading_date(), 95.0, 100.0);

    let orchestrator = DayOrchestrator::new(harness.services.clone());
    let outcome = orchestrator
        .run_day(DayRunConfig {
            date: trading_date(),
            tickers: vec!["AAPL".to_string()],
            mode: EngineMode::Portfolio,
            is_live_mode: false,
            api_keys: ApiKeys::default(),
            models: ModelMetadata::default(),
            portfolio: Some(Portfolio::new(dec!(100000), 0.0)),
        })
        .await
        .unwrap();

    // Non-live mode prices are closing prices.
    assert_eq!(outcome.state.current_prices["AAPL"], 100.0);

    let risk = outcome.state.analyst_signals["risk_manager"].as_risk().unwrap();
    match &risk["AAPL"] {
        RiskAssessment::Position(position) => {
            assert_eq!(position.current_price, 100.0);
            assert!(position.max_shares > 0);
        }
        other => panic!("expected position risk assessment, got {other:?}"),
    }

    let report = outcome.execution.unwrap();
    assert_eq!(report.executed[0].price, 100.0);
    assert_eq!(report.executed[0].filled_quantity, 10);
    assert_eq!(report.portfolio.cash, dec!(99000));
    assert_eq!(report.portfolio.position("AAPL").long, 10);
    assert_eq!(report.portfolio.position("AAPL").long_cost_basis, dec!(100));
}
