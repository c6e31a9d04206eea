use super::ToolInvocation;
use crate::domain::errors::ToolError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{FinancialMetrics, Signal, ToolResult};
use anyhow::Result;
use std::collections::BTreeMap;

async fn latest_metrics(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<FinancialMetrics> {
    let mut metrics = market
        .financial_metrics(&invocation.ticker, invocation.end_date, "ttm", 10)
        .await
        .map_err(|e| ToolError::Upstream {
            ticker: invocation.ticker.clone(),
            reason: e.to_string(),
        })?;

    if metrics.is_empty() {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: "no financial metrics available".to_string(),
        }
        .into());
    }
    Ok(metrics.remove(0))
}

/// Scores a set of pass/fail checks into a signal. More than half passing is
/// bullish, fewer than a third bearish, anything else neutral.
fn score_checks(checks: &[(&str, Option<bool>)]) -> (Signal, f64, Vec<String>) {
    let available: Vec<_> = checks
        .iter()
        .filter_map(|(label, pass)| pass.map(|p| (*label, p)))
        .collect();

    if available.is_empty() {
        return (Signal::Neutral, 20.0, vec!["insufficient data".to_string()]);
    }

    let passed = available.iter().filter(|(_, p)| *p).count();
    let ratio = passed as f64 / available.len() as f64;
    let signal = if ratio > 0.5 {
        Signal::Bullish
    } else if ratio < 1.0 / 3.0 {
        Signal::Bearish
    } else {
        Signal::Neutral
    };
    let confidence = (40.0 + 50.0 * (2.0 * ratio - 1.0).abs()).min(90.0);

    let notes = available
        .iter()
        .map(|(label, pass)| format!("{label}: {}", if *pass { "pass" } else { "fail" }))
        .collect();
    (signal, confidence, notes)
}

fn insert_metric(metrics: &mut BTreeMap<String, f64>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        metrics.insert(key.to_string(), v);
    }
}

pub async fn analyze_profitability(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let m = latest_metrics(market, invocation).await?;

    let checks = [
        ("return on equity > 15%", m.return_on_equity.map(|v| v > 0.15)),
        ("net margin > 20%", m.net_margin.map(|v| v > 0.20)),
        ("operating margin > 15%", m.operating_margin.map(|v| v > 0.15)),
        ("return on assets > 5%", m.return_on_assets.map(|v| v > 0.05)),
    ];
    let (signal, confidence, notes) = score_checks(&checks);

    let mut metrics = BTreeMap::new();
    insert_metric(&mut metrics, "return_on_equity", m.return_on_equity);
    insert_metric(&mut metrics, "return_on_assets", m.return_on_assets);
    insert_metric(&mut metrics, "net_margin", m.net_margin);
    insert_metric(&mut metrics, "operating_margin", m.operating_margin);
    insert_metric(&mut metrics, "gross_margin", m.gross_margin);

    Ok(ToolResult {
        tool_name: "analyze_profitability".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!("Profitability checks for {}: {}", invocation.ticker, notes.join("; ")),
        error: None,
    })
}

pub async fn analyze_growth(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let m = latest_metrics(market, invocation).await?;

    let checks = [
        ("revenue growth > 10%", m.revenue_growth.map(|v| v > 0.10)),
        (
            "EPS growth > 10%",
            m.earnings_per_share_growth.or(m.earnings_growth).map(|v| v > 0.10),
        ),
        ("book value growth > 10%", m.book_value_growth.map(|v| v > 0.10)),
        (
            "free cash flow growing",
            m.free_cash_flow_growth.map(|v| v > 0.0),
        ),
    ];
    let (signal, confidence, notes) = score_checks(&checks);

    let mut metrics = BTreeMap::new();
    insert_metric(&mut metrics, "revenue_growth", m.revenue_growth);
    insert_metric(&mut metrics, "earnings_growth", m.earnings_growth);
    insert_metric(
        &mut metrics,
        "earnings_per_share_growth",
        m.earnings_per_share_growth,
    );
    insert_metric(&mut metrics, "book_value_growth", m.book_value_growth);
    insert_metric(&mut metrics, "free_cash_flow_growth", m.free_cash_flow_growth);

    Ok(ToolResult {
        tool_name: "analyze_growth".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!("Growth checks for {}: {}", invocation.ticker, notes.join("; ")),
        error: None,
    })
}

pub async fn analyze_financial_health(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let m = latest_metrics(market, invocation).await?;

    let fcf_conversion = match (m.free_cash_flow_per_share, m.earnings_per_share) {
        (Some(fcf), Some(eps)) if eps.abs() > f64::EPSILON => Some(fcf / eps > 0.8),
        _ => None,
    };
    let checks = [
        ("current ratio > 1.5", m.current_ratio.map(|v| v > 1.5)),
        ("debt to equity < 0.5", m.debt_to_equity.map(|v| v < 0.5)),
        ("quick ratio > 1.0", m.quick_ratio.map(|v| v > 1.0)),
        ("FCF conversion > 80% of EPS", fcf_conversion),
    ];
    let (signal, confidence, notes) = score_checks(&checks);

    let mut metrics = BTreeMap::new();
    insert_metric(&mut metrics, "current_ratio", m.current_ratio);
    insert_metric(&mut metrics, "quick_ratio", m.quick_ratio);
    insert_metric(&mut metrics, "debt_to_equity", m.debt_to_equity);
    insert_metric(
        &mut metrics,
        "free_cash_flow_per_share",
        m.free_cash_flow_per_share,
    );
    insert_metric(&mut metrics, "earnings_per_share", m.earnings_per_share);

    Ok(ToolResult {
        tool_name: "analyze_financial_health".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "Financial health checks for {}: {}",
            invocation.ticker,
            notes.join("; ")
        ),
        error: None,
    })
}

pub async fn analyze_valuation_ratios(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let m = latest_metrics(market, invocation).await?;

    let checks = [
        (
            "P/E below 25",
            m.price_to_earnings_ratio.map(|v| v > 0.0 && v < 25.0),
        ),
        (
            "P/B below 3",
            m.price_to_book_ratio.map(|v| v > 0.0 && v < 3.0),
        ),
        (
            "P/S below 5",
            m.price_to_sales_ratio.map(|v| v > 0.0 && v < 5.0),
        ),
    ];
    let (signal, confidence, notes) = score_checks(&checks);

    let mut metrics = BTreeMap::new();
    insert_metric(&mut metrics, "price_to_earnings_ratio", m.price_to_earnings_ratio);
    insert_metric(&mut metrics, "price_to_book_ratio", m.price_to_book_ratio);
    insert_metric(&mut metrics, "price_to_sales_ratio", m.price_to_sales_ratio);

    Ok(ToolResult {
        tool_name: "analyze_valuation_ratios".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "Valuation ratio checks for {}: {}",
            invocation.ticker,
            notes.join("; ")
        ),
        error: None,
    })
}

pub async fn analyze_efficiency_ratios(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let m = latest_metrics(market, invocation).await?;

    let checks = [
        ("asset turnover > 0.5", m.asset_turnover.map(|v| v > 0.5)),
        ("inventory turnover > 5", m.inventory_turnover.map(|v| v > 5.0)),
        (
            "receivables turnover > 8",
            m.receivables_turnover.map(|v| v > 8.0),
        ),
        (
            "working capital turnover > 4",
            m.working_capital_turnover.map(|v| v > 4.0),
        ),
    ];
    let (signal, confidence, notes) = score_checks(&checks);

    let mut metrics = BTreeMap::new();
    insert_metric(&mut metrics, "asset_turnover", m.asset_turnover);
    insert_metric(&mut metrics, "inventory_turnover", m.inventory_turnover);
    insert_metric(&mut metrics, "receivables_turnover", m.receivables_turnover);
    insert_metric(
        &mut metrics,
        "working_capital_turnover",
        m.working_capital_turnover,
    );

    Ok(ToolResult {
        tool_name: "analyze_efficiency_ratios".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "Efficiency checks for {}: {}",
            invocation.ticker,
            notes.join("; ")
        ),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_checks_majority_pass_is_bullish() {
        let (signal, confidence, _) = score_checks(&[
            ("a", Some(true)),
            ("b", Some(true)),
            ("c", Some(false)),
        ]);
        assert_eq!(signal, Signal::Bullish);
        assert!(confidence > 40.0 && confidence <= 90.0);
    }

    #[test]
    fn score_checks_minority_pass_is_bearish() {
        let (signal, _, _) =
            score_checks(&[("a", Some(false)), ("b", Some(false)), ("c", Some(true))]);
        assert_eq!(signal, Signal::Bearish);
    }

    #[test]
    fn score_checks_no_data_is_low_confidence_neutral() {
        let (signal, confidence, _) = score_checks(&[("a", None), ("b", None)]);
        assert_eq!(signal, Signal::Neutral);
        assert!(confidence <= 20.0);
    }
}
