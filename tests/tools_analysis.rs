mod support;

use chrono::NaiveDate;
use quorumtrade::application::tools::{ToolExecutor, ToolInvocation};
use quorumtrade::domain::types::{CompanyNews, FinancialMetrics, InsiderTrade, Signal};
use quorumtrade::infrastructure::mock::{FixtureMarketData, make_bars};
use std::sync::Arc;
use support::trading_date;

fn invocation(ticker: &str) -> ToolInvocation {
    ToolInvocation {
        ticker: ticker.to_string(),
        start_date: trading_date().checked_sub_days(chrono::Days::new(30)).unwrap(),
        end_date: trading_date(),
        api_key: String::new(),
    }
}

fn strong_metrics(ticker: &str) -> FinancialMetrics {
    FinancialMetrics {
        ticker: ticker.to_string(),
        report_period: "2024-03-31".to_string(),
        period: "ttm".to_string(),
        market_cap: Some(1_000_000_000.0),
        return_on_equity: Some(0.28),
        return_on_assets: Some(0.12),
        net_margin: Some(0.25),
        operating_margin: Some(0.30),
        gross_margin: Some(0.45),
        revenue_growth: Some(0.18),
        earnings_per_share_growth: Some(0.22),
        book_value_growth: Some(0.15),
        free_cash_flow_growth: Some(0.12),
        free_cash_flow: Some(120_000_000.0),
        net_income: Some(150_000_000.0),
        depreciation_and_amortization: Some(30_000_000.0),
        capital_expenditure: Some(-20_000_000.0),
        shareholders_equity: Some(500_000_000.0),
        ebitda: Some(200_000_000.0),
        enterprise_value: Some(1_100_000_000.0),
        current_ratio: Some(2.1),
        quick_ratio: Some(1.6),
        debt_to_equity: Some(0.3),
        earnings_per_share: Some(6.0),
        free_cash_flow_per_share: Some(5.5),
        ..FinancialMetrics::default()
    }
}

#[tokio::test]
async fn profitability_tool_reads_strong_financials_as_bullish() {
    let market = Arc::new(FixtureMarketData::empty());
    market.set_metrics("AAPL", vec![strong_metrics("AAPL")]);
    let executor = ToolExecutor::new(market);

    let result = executor
        .execute("analyze_profitability", &invocation("AAPL"))
        .await;

    assert!(!result.is_failed());
    assert_eq!(result.signal, Signal::Bullish);
    assert!(result.metrics.contains_key("return_on_equity"));
    assert!(result.reasoning.contains("AAPL"));
}

#[tokio::test]
async fn dcf_tool_flags_a_deep_discount() {
    let market = Arc::new(FixtureMarketData::empty());
    // 120M FCF growing ~12% against a 1B cap is worth well over the cap at
    // a 10% discount rate.
    market.set_metrics("AAPL", vec![strong_metrics("AAPL")]);
    let executor = ToolExecutor::new(market);

    let result = executor
        .execute("dcf_valuation_analysis", &invocation("AAPL"))
        .await;

    assert!(!result.is_failed());
    assert_eq!(result.signal, Signal::Bullish);
    assert!(result.metrics["value_gap"] > 0.15);
}

#[tokio::test]
async fn news_sentiment_scores_headline_tone() {
    let market = Arc::new(FixtureMarketData::empty());
    let news = [
        "Record profits delight investors in stunning quarter",
        "Analysts celebrate breakthrough product launch success",
        "Company wins major contract, shares surge",
    ]
    .iter()
    .map(|title| CompanyNews {
        ticker: "AAPL".to_string(),
        title: title.to_string(),
        date: Some(trading_date()),
        source: None,
        url: None,
    })
    .collect();
    market.set_news("AAPL", news);
    let executor = ToolExecutor::new(market);

    let result = executor
        .execute("analyze_news_sentiment", &invocation("AAPL"))
        .await;

    assert!(!result.is_failed());
    assert_eq!(result.signal, Signal::Bullish);
    assert_eq!(result.metrics["articles"], 3.0);
}

#[tokio::test]
async fn insider_selling_wave_reads_bearish() {
    let market = Arc::new(FixtureMarketData::empty());
    let trades = (0..8)
        .map(|i| InsiderTrade {
            ticker: "AAPL".to_string(),
            insider_name: Some(format!("Officer {i}")),
            transaction_date: Some(trading_date()),
            transaction_shares: Some(if i == 0 { 500.0 } else { -10_000.0 }),
            transaction_price_per_share: Some(180.0),
        })
        .collect();
    market.set_insiders("AAPL", trades);
    let executor = ToolExecutor::new(market);

    let result = executor
        .execute("analyze_insider_trading", &invocation("AAPL"))
        .await;

    assert!(!result.is_failed());
    assert_eq!(result.signal, Signal::Bearish);
    assert_eq!(result.metrics["insider_sells"], 7.0);
}

#[tokio::test]
async fn trend_tool_widens_its_window_for_long_averages() {
    let market = Arc::new(FixtureMarketData::empty());
    // Rising series long enough for the 50/200 pair only because the tool
    // fetches 250 extra days behind the requested window.
    let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
    market.set_bars(
        "AAPL",
        make_bars("AAPL", start, trading_date(), |i| {
            let price = 100.0 + i as f64 * 0.5;
            (price, price + 0.25)
        }),
    );
    let executor = ToolExecutor::new(market);

    let result = executor
        .execute("analyze_trend_following", &invocation("AAPL"))
        .await;

    assert!(!result.is_failed());
    assert_eq!(result.signal, Signal::Bullish);
    assert!(result.metrics.contains_key("sma_200"), "{:?}", result.metrics);
}

#[tokio::test]
async fn failures_are_captured_never_thrown() {
    let market = Arc::new(FixtureMarketData::empty());
    let executor = ToolExecutor::new(market);

    // No data seeded at all: every tool degrades to a neutral error result.
    for tool in [
        "analyze_growth",
        "analyze_mean_reversion",
        "analyze_insider_trading",
        "residual_income_valuation_analysis",
    ] {
        let result = executor.execute(tool, &invocation("AAPL")).await;
        assert!(result.is_failed(), "{tool} should fail without data");
        assert_eq!(result.signal, Signal::Neutral);
        assert_eq!(result.confidence, 0.0);
    }

    let unknown = executor.execute("not_a_tool", &invocation("AAPL")).await;
    assert!(unknown.error.unwrap().contains("unknown tool"));

    let no_ticker = executor.execute("analyze_growth", &invocation("")).await;
    assert!(no_ticker.error.unwrap().contains("ticker"));
}
