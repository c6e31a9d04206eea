mod support;

use chrono::NaiveDate;
use quorumtrade::application::agents::persona::AnalystType;
use quorumtrade::application::driver::{MultiDayDriver, SessionConfig};
use quorumtrade::domain::state::{ApiKeys, EngineMode, ModelMetadata};
use quorumtrade::infrastructure::dashboard::FileDashboardSink;
use quorumtrade::infrastructure::mock::CollectingDashboard;
use rust_decimal_macros::dec;
use std::sync::Arc;
use support::{add_happy_path_rules, build_harness, seed_bars, temp_base};

/// Two-day carry: day one's fills flow into a snapshot file and into day
/// two's starting portfolio, and the driver reports both days successful.
/// Day one's scored outcomes feed day two's portfolio-manager prompt.
#[tokio::test(start_paused = true)]
async fn portfolio_carries_across_days_with_snapshots() {
    let day1 = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(); // Monday
    let day2 = NaiveDate::from_ymd_opt(2024, 5, 7).unwrap();

    let dashboard_dir = temp_base("multi-day-dash");
    let dashboard = Arc::new(FileDashboardSink::new(&dashboard_dir));
    let harness = build_harness(
        "multi-day",
        vec![AnalystType::Technical],
        false,
        Some(dashboard.clone() as Arc<dyn quorumtrade::domain::ports::DashboardSink>),
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    seed_bars(&harness.market, "AAPL", day2, 2000.0, 2000.0);

    let driver = MultiDayDriver::new(harness.services.clone());
    let summary = driver
        .run(SessionConfig {
            start_date: day1,
            end_date: day2,
            tickers: vec!["AAPL".to_string()],
            mode: EngineMode::Portfolio,
            initial_cash: dec!(100000),
            margin_requirement: 0.0,
            is_live_mode: false,
            api_keys: ApiKeys::default(),
            models: ModelMetadata::default(),
        })
        .await;

    assert_eq!(summary.total_days, 2);
    assert_eq!(summary.successful_days, 2);
    assert_eq!(summary.failed_days, 0);

    // Day 1: 10 shares at 2000 leave 80000 cash.
    let snapshot_path = harness
        .base_dir
        .join("state")
        .join(format!("portfolio_{day1}.json"));
    assert!(snapshot_path.exists(), "day-1 snapshot missing");
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
    assert_eq!(snapshot["portfolio"]["cash"], "80000");
    assert_eq!(snapshot["portfolio"]["positions"]["AAPL"]["long"], 10);
    assert_eq!(
        snapshot["portfolio"]["positions"]["AAPL"]["long_cost_basis"],
        "2000"
    );

    // Day 2 started from the carry-in portfolio and bought 10 more.
    let final_portfolio = summary.final_portfolio.unwrap();
    assert_eq!(final_portfolio.cash, dec!(60000));
    assert_eq!(final_portfolio.position("AAPL").long, 20);
    assert_eq!(final_portfolio.position("AAPL").long_cost_basis, dec!(2000));

    // Day 1 closed flat, so its long call scored incorrect; day 2's PM
    // prompt carries the resulting win rates from the dashboard side channel.
    let pm_prompts: Vec<String> = harness
        .provider
        .recorded_requests()
        .into_iter()
        .filter(|p| p.contains("portfolio manager deciding trades"))
        .collect();
    assert_eq!(pm_prompts.len(), 2);
    assert!(!pm_prompts[0].contains("win rate"));
    assert!(pm_prompts[1].contains("portfolio_manager win rate 0%"));
    assert!(pm_prompts[1].contains("technical_analyst_agent win rate 0%"));

    // The dashboard data files landed on disk.
    for name in ["leaderboard.json", "_internal_state.json", "summary.json"] {
        assert!(dashboard_dir.join(name).exists(), "{name} missing");
    }

    // A fresh driver over the same state directory recovers the latest
    // snapshot instead of reinitializing.
    let (date, recovered) = harness
        .services
        .persistence
        .load_latest_snapshot()
        .unwrap()
        .unwrap();
    assert_eq!(date, day2);
    assert_eq!(recovered.cash, dec!(60000));

    std::fs::remove_dir_all(dashboard_dir).ok();
}

/// A day with no price data fails without aborting the batch or advancing
/// the portfolio.
#[tokio::test(start_paused = true)]
async fn failed_day_does_not_advance_portfolio() {
    let day1 = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();

    let collecting = Arc::new(CollectingDashboard::new());
    let harness = build_harness(
        "failed-day",
        vec![AnalystType::Technical],
        false,
        Some(collecting.clone() as Arc<dyn quorumtrade::domain::ports::DashboardSink>),
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    // No bars at all: tools fail, the risk manager has no prices, and the
    // executor can only skip. The day still completes in degraded form.
    let driver = MultiDayDriver::new(harness.services.clone());
    let summary = driver
        .run(SessionConfig {
            start_date: day1,
            end_date: day1,
            tickers: vec![], // empty universe forces the day-level failure
            mode: EngineMode::Portfolio,
            initial_cash: dec!(5000),
            margin_requirement: 0.0,
            is_live_mode: false,
            api_keys: ApiKeys::default(),
            models: ModelMetadata::default(),
        })
        .await;

    assert_eq!(summary.total_days, 1);
    assert_eq!(summary.successful_days, 0);
    assert_eq!(summary.failed_days, 1);
    assert_eq!(summary.daily_results[0].status, "failed");

    // The carry-in portfolio never advanced, and the failed day never
    // reached the dashboard.
    let final_portfolio = summary.final_portfolio.unwrap();
    assert_eq!(final_portfolio.cash, dec!(5000));
    assert!(final_portfolio.positions.is_empty());
    assert!(collecting.updates.lock().unwrap().is_empty());
}
