use super::ToolInvocation;
use crate::domain::errors::ToolError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{PriceBar, Signal, ToolResult};
use anyhow::Result;
use chrono::Days;
use statrs::statistics::{Data, Distribution};
use std::collections::BTreeMap;
use ta::Next;
use ta::indicators::{
    BollingerBands, MovingAverageConvergenceDivergence, RelativeStrengthIndex,
    SimpleMovingAverage,
};

/// Extra calendar days fetched before `start_date` so a 200-day moving
/// average has a full window on the first requested day.
const TREND_LOOKBACK_DAYS: u64 = 250;

async fn fetch_closes(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
    widen_days: u64,
) -> Result<Vec<f64>> {
    let start = invocation
        .start_date
        .checked_sub_days(Days::new(widen_days))
        .unwrap_or(invocation.start_date);

    let mut bars: Vec<PriceBar> = market
        .prices(&invocation.ticker, start, invocation.end_date)
        .await
        .map_err(|e| ToolError::Upstream {
            ticker: invocation.ticker.clone(),
            reason: e.to_string(),
        })?;

    if bars.is_empty() {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: format!("no price bars in {}..{}", start, invocation.end_date),
        }
        .into());
    }

    bars.sort_by_key(|bar| bar.date);
    Ok(bars.iter().map(|bar| bar.close).collect())
}

fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

fn ta_error(e: impl std::fmt::Debug) -> anyhow::Error {
    anyhow::anyhow!("indicator construction failed: {:?}", e)
}

pub async fn analyze_trend_following(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let closes = fetch_closes(market, invocation, TREND_LOOKBACK_DAYS).await?;
    if closes.len() < 30 {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: format!("only {} bars, need 30 for trend analysis", closes.len()),
        }
        .into());
    }

    // Degrade to shorter averages when the history can't feed a 50/200 pair.
    let (fast_period, slow_period) = if closes.len() >= 200 { (50, 200) } else { (20, 50) };

    let mut fast = SimpleMovingAverage::new(fast_period).map_err(ta_error)?;
    let mut slow = SimpleMovingAverage::new(slow_period).map_err(ta_error)?;
    let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).map_err(ta_error)?;

    let mut fast_value = 0.0;
    let mut slow_value = 0.0;
    let mut histogram = 0.0;
    for &close in &closes {
        fast_value = fast.next(close);
        slow_value = slow.next(close);
        histogram = macd.next(close).histogram;
    }
    let price = *closes.last().expect("non-empty");

    let above_fast = price > fast_value;
    let golden = fast_value > slow_value;
    let macd_positive = histogram > 0.0;

    let bullish_votes = [above_fast, golden, macd_positive]
        .iter()
        .filter(|v| **v)
        .count();
    let (signal, confidence) = match bullish_votes {
        3 => (Signal::Bullish, 80.0),
        2 => (Signal::Bullish, 60.0),
        1 => (Signal::Bearish, 55.0),
        _ => (Signal::Bearish, 75.0),
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("price".to_string(), price);
    metrics.insert(format!("sma_{fast_period}"), fast_value);
    metrics.insert(format!("sma_{slow_period}"), slow_value);
    metrics.insert("macd_histogram".to_string(), histogram);

    Ok(ToolResult {
        tool_name: "analyze_trend_following".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: price {:.2} vs SMA{} {:.2} / SMA{} {:.2}, MACD histogram {:.4}",
            invocation.ticker, price, fast_period, fast_value, slow_period, slow_value, histogram
        ),
        error: None,
    })
}

pub async fn analyze_mean_reversion(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let closes = fetch_closes(market, invocation, 40).await?;
    if closes.len() < 20 {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: format!("only {} bars, need 20 for mean reversion", closes.len()),
        }
        .into());
    }

    let mut rsi = RelativeStrengthIndex::new(14).map_err(ta_error)?;
    let mut bands = BollingerBands::new(20, 2.0).map_err(ta_error)?;

    let mut rsi_value = 50.0;
    let mut upper = 0.0;
    let mut lower = 0.0;
    let mut middle = 0.0;
    for &close in &closes {
        rsi_value = rsi.next(close);
        let output = bands.next(close);
        upper = output.upper;
        lower = output.lower;
        middle = output.average;
    }
    let price = *closes.last().expect("non-empty");

    let (signal, confidence) = if rsi_value < 30.0 || price < lower {
        (Signal::Bullish, if rsi_value < 25.0 { 75.0 } else { 60.0 })
    } else if rsi_value > 70.0 || price > upper {
        (Signal::Bearish, if rsi_value > 75.0 { 75.0 } else { 60.0 })
    } else {
        (Signal::Neutral, 50.0)
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("price".to_string(), price);
    metrics.insert("rsi_14".to_string(), rsi_value);
    metrics.insert("bollinger_upper".to_string(), upper);
    metrics.insert("bollinger_middle".to_string(), middle);
    metrics.insert("bollinger_lower".to_string(), lower);

    Ok(ToolResult {
        tool_name: "analyze_mean_reversion".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: RSI(14) {:.1}, price {:.2} vs bands [{:.2}, {:.2}]",
            invocation.ticker, rsi_value, price, lower, upper
        ),
        error: None,
    })
}

pub async fn analyze_momentum(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let closes = fetch_closes(market, invocation, 90).await?;
    if closes.len() < 21 {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: format!("only {} bars, need 21 for momentum", closes.len()),
        }
        .into());
    }

    let horizon_return = |days: usize| -> Option<f64> {
        if closes.len() > days {
            let past = closes[closes.len() - 1 - days];
            if past > 0.0 {
                return Some(closes[closes.len() - 1] / past - 1.0);
            }
        }
        None
    };

    let short = horizon_return(5);
    let medium = horizon_return(20);
    let long = horizon_return(60);

    // Longer horizons dominate, mirroring trend persistence.
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    for (value, weight) in [(short, 0.2), (medium, 0.3), (long, 0.5)] {
        if let Some(v) = value {
            weighted += v * weight;
            weight_sum += weight;
        }
    }
    let composite = if weight_sum > 0.0 { weighted / weight_sum } else { 0.0 };

    let (signal, confidence) = if composite > 0.05 {
        (Signal::Bullish, (55.0 + composite.abs() * 300.0).min(85.0))
    } else if composite < -0.05 {
        (Signal::Bearish, (55.0 + composite.abs() * 300.0).min(85.0))
    } else {
        (Signal::Neutral, 50.0)
    };

    let mut metrics = BTreeMap::new();
    if let Some(v) = short {
        metrics.insert("return_5d".to_string(), v);
    }
    if let Some(v) = medium {
        metrics.insert("return_20d".to_string(), v);
    }
    if let Some(v) = long {
        metrics.insert("return_60d".to_string(), v);
    }
    metrics.insert("composite_momentum".to_string(), composite);

    Ok(ToolResult {
        tool_name: "analyze_momentum".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: weighted momentum {:.2}% (5d/20d/60d horizons)",
            invocation.ticker,
            composite * 100.0
        ),
        error: None,
    })
}

pub async fn analyze_volatility(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let closes = fetch_closes(market, invocation, 60).await?;
    let returns = daily_returns(&closes);
    if returns.len() < 10 {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: format!("only {} returns, need 10 for volatility", returns.len()),
        }
        .into());
    }

    let recent: Vec<f64> = returns.iter().rev().take(10).copied().collect();
    let baseline: Vec<f64> = returns.iter().rev().take(30).copied().collect();

    let recent_vol = Data::new(recent).std_dev().unwrap_or(0.0);
    let baseline_vol = Data::new(baseline).std_dev().unwrap_or(0.0);
    let annualized = baseline_vol * 252.0_f64.sqrt();

    // Expanding volatility reads as risk-off; contracting as stabilizing.
    let expansion = if baseline_vol > 0.0 { recent_vol / baseline_vol } else { 1.0 };
    let (signal, confidence) = if expansion > 1.5 {
        (Signal::Bearish, 60.0)
    } else if expansion < 0.7 {
        (Signal::Bullish, 55.0)
    } else {
        (Signal::Neutral, 50.0)
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("daily_volatility_10d".to_string(), recent_vol);
    metrics.insert("daily_volatility_30d".to_string(), baseline_vol);
    metrics.insert("annualized_volatility".to_string(), annualized);
    metrics.insert("volatility_expansion".to_string(), expansion);

    Ok(ToolResult {
        tool_name: "analyze_volatility".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: annualized volatility {:.1}%, 10d/30d expansion ratio {:.2}",
            invocation.ticker,
            annualized * 100.0,
            expansion
        ),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_returns_skips_zero_prices() {
        let returns = daily_returns(&[100.0, 110.0, 0.0, 120.0]);
        // 0.0 predecessor is dropped; 110 -> 0 yields -1.0.
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn daily_returns_of_flat_series_are_zero() {
        let returns = daily_returns(&[50.0, 50.0, 50.0]);
        assert_eq!(returns, vec![0.0, 0.0]);
    }
}
