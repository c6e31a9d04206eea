use super::ToolInvocation;
use crate::domain::errors::ToolError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{FinancialMetrics, Signal, ToolResult};
use anyhow::Result;
use std::collections::BTreeMap;

const DISCOUNT_RATE: f64 = 0.10;
const TERMINAL_GROWTH: f64 = 0.03;
const COST_OF_EQUITY: f64 = 0.10;
const PROJECTION_YEARS: u32 = 5;

async fn metrics_and_cap(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<(FinancialMetrics, f64)> {
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
    let latest = metrics.remove(0);

    let market_cap = match latest.market_cap {
        Some(cap) if cap > 0.0 => cap,
        _ => market
            .market_cap(&invocation.ticker, invocation.end_date)
            .await
            .map_err(|e| ToolError::Upstream {
                ticker: invocation.ticker.clone(),
                reason: e.to_string(),
            })?
            .filter(|cap| *cap > 0.0)
            .ok_or_else(|| ToolError::NoData {
                ticker: invocation.ticker.clone(),
                reason: "no market cap available".to_string(),
            })?,
    };

    Ok((latest, market_cap))
}

/// Maps an intrinsic-value / market-cap gap to a signal. A gap above +15%
/// reads undervalued, below -15% overvalued.
fn signal_from_gap(gap: f64) -> (Signal, f64) {
    if gap > 0.15 {
        (Signal::Bullish, (55.0 + gap * 60.0).min(90.0))
    } else if gap < -0.15 {
        (Signal::Bearish, (55.0 + gap.abs() * 60.0).min(90.0))
    } else {
        (Signal::Neutral, 50.0)
    }
}

pub async fn dcf_valuation_analysis(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let (m, market_cap) = metrics_and_cap(market, invocation).await?;

    let fcf = m.free_cash_flow.ok_or_else(|| ToolError::NoData {
        ticker: invocation.ticker.clone(),
        reason: "no free cash flow data".to_string(),
    })?;

    let growth = m
        .free_cash_flow_growth
        .or(m.earnings_growth)
        .unwrap_or(0.05)
        .clamp(-0.10, 0.25);

    let mut intrinsic = 0.0;
    let mut projected = fcf;
    for year in 1..=PROJECTION_YEARS {
        projected *= 1.0 + growth;
        intrinsic += projected / (1.0 + DISCOUNT_RATE).powi(year as i32);
    }
    let terminal = projected * (1.0 + TERMINAL_GROWTH)
        / (DISCOUNT_RATE - TERMINAL_GROWTH)
        / (1.0 + DISCOUNT_RATE).powi(PROJECTION_YEARS as i32);
    intrinsic += terminal;

    let gap = intrinsic / market_cap - 1.0;
    let (signal, confidence) = signal_from_gap(gap);

    let mut metrics = BTreeMap::new();
    metrics.insert("free_cash_flow".to_string(), fcf);
    metrics.insert("assumed_growth".to_string(), growth);
    metrics.insert("intrinsic_value".to_string(), intrinsic);
    metrics.insert("market_cap".to_string(), market_cap);
    metrics.insert("value_gap".to_string(), gap);

    Ok(ToolResult {
        tool_name: "dcf_valuation_analysis".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: DCF intrinsic value {:.0} vs market cap {:.0} ({:+.1}% gap, {:.0}% growth assumed)",
            invocation.ticker,
            intrinsic,
            market_cap,
            gap * 100.0,
            growth * 100.0
        ),
        error: None,
    })
}

pub async fn owner_earnings_valuation_analysis(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let (m, market_cap) = metrics_and_cap(market, invocation).await?;

    let net_income = m.net_income.ok_or_else(|| ToolError::NoData {
        ticker: invocation.ticker.clone(),
        reason: "no net income data".to_string(),
    })?;
    let depreciation = m.depreciation_and_amortization.unwrap_or(0.0);
    let capex = m.capital_expenditure.unwrap_or(0.0).abs();

    // Buffett's owner earnings: reported earnings plus non-cash charges minus
    // the capex needed to hold the franchise together.
    let owner_earnings = net_income + depreciation - capex;
    if owner_earnings <= 0.0 {
        let mut metrics = BTreeMap::new();
        metrics.insert("owner_earnings".to_string(), owner_earnings);
        return Ok(ToolResult {
            tool_name: "owner_earnings_valuation_analysis".to_string(),
            signal: Signal::Bearish,
            confidence: 60.0,
            metrics,
            reasoning: format!(
                "{}: negative owner earnings ({:.0}) after maintenance capex",
                invocation.ticker, owner_earnings
            ),
            error: None,
        });
    }

    // Conservative capitalization at the discount rate, no growth credit.
    let intrinsic = owner_earnings / DISCOUNT_RATE;
    let gap = intrinsic / market_cap - 1.0;
    let (signal, confidence) = signal_from_gap(gap);

    let mut metrics = BTreeMap::new();
    metrics.insert("owner_earnings".to_string(), owner_earnings);
    metrics.insert("net_income".to_string(), net_income);
    metrics.insert("depreciation".to_string(), depreciation);
    metrics.insert("maintenance_capex".to_string(), capex);
    metrics.insert("intrinsic_value".to_string(), intrinsic);
    metrics.insert("value_gap".to_string(), gap);

    Ok(ToolResult {
        tool_name: "owner_earnings_valuation_analysis".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: owner earnings {:.0} capitalized at {:.0}% gives {:.0} vs cap {:.0} ({:+.1}%)",
            invocation.ticker,
            owner_earnings,
            DISCOUNT_RATE * 100.0,
            intrinsic,
            market_cap,
            gap * 100.0
        ),
        error: None,
    })
}

pub async fn ev_ebitda_valuation_analysis(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let (m, market_cap) = metrics_and_cap(market, invocation).await?;

    let multiple = match m.enterprise_value_to_ebitda_ratio {
        Some(multiple) => multiple,
        None => {
            let ev = m.enterprise_value.unwrap_or(market_cap);
            let ebitda = m.ebitda.filter(|v| *v > 0.0).ok_or_else(|| ToolError::NoData {
                ticker: invocation.ticker.clone(),
                reason: "no EBITDA data".to_string(),
            })?;
            ev / ebitda
        }
    };

    let (signal, confidence) = if multiple <= 0.0 {
        (Signal::Bearish, 60.0)
    } else if multiple < 10.0 {
        (Signal::Bullish, (55.0 + (10.0 - multiple) * 3.0).min(85.0))
    } else if multiple > 14.0 {
        (Signal::Bearish, (55.0 + (multiple - 14.0) * 2.0).min(85.0))
    } else {
        (Signal::Neutral, 50.0)
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("ev_to_ebitda".to_string(), multiple);
    metrics.insert("market_cap".to_string(), market_cap);

    Ok(ToolResult {
        tool_name: "ev_ebitda_valuation_analysis".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: EV/EBITDA {:.1} against the 10-14 fair band",
            invocation.ticker, multiple
        ),
        error: None,
    })
}

pub async fn residual_income_valuation_analysis(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let (m, market_cap) = metrics_and_cap(market, invocation).await?;

    let net_income = m.net_income.ok_or_else(|| ToolError::NoData {
        ticker: invocation.ticker.clone(),
        reason: "no net income data".to_string(),
    })?;
    let equity = m
        .shareholders_equity
        .or_else(|| match (m.book_value_per_share, m.outstanding_shares) {
            (Some(bvps), Some(shares)) => Some(bvps * shares),
            _ => None,
        })
        .filter(|v| *v > 0.0)
        .ok_or_else(|| ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: "no shareholders' equity data".to_string(),
        })?;

    let equity_charge = equity * COST_OF_EQUITY;
    let residual_income = net_income - equity_charge;
    // Book value plus perpetuity of current residual income.
    let intrinsic = equity + residual_income / COST_OF_EQUITY;
    let gap = intrinsic / market_cap - 1.0;
    let (signal, confidence) = signal_from_gap(gap);

    let mut metrics = BTreeMap::new();
    metrics.insert("net_income".to_string(), net_income);
    metrics.insert("shareholders_equity".to_string(), equity);
    metrics.insert("equity_charge".to_string(), equity_charge);
    metrics.insert("residual_income".to_string(), residual_income);
    metrics.insert("intrinsic_value".to_string(), intrinsic);
    metrics.insert("value_gap".to_string(), gap);

    Ok(ToolResult {
        tool_name: "residual_income_valuation_analysis".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: residual income {:.0} over a {:.0}% equity charge, value {:.0} vs cap {:.0}",
            invocation.ticker,
            residual_income,
            COST_OF_EQUITY * 100.0,
            intrinsic,
            market_cap
        ),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_mapping_bands() {
        assert_eq!(signal_from_gap(0.5).0, Signal::Bullish);
        assert_eq!(signal_from_gap(-0.5).0, Signal::Bearish);
        assert_eq!(signal_from_gap(0.05).0, Signal::Neutral);
    }

    #[test]
    fn gap_confidence_is_bounded() {
        let (_, confidence) = signal_from_gap(5.0);
        assert!(confidence <= 90.0);
    }
}
