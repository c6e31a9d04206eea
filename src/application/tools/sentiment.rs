use super::ToolInvocation;
use crate::domain::errors::ToolError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{Signal, ToolResult};
use anyhow::Result;
use std::collections::BTreeMap;
use vader_sentiment::SentimentIntensityAnalyzer;

pub async fn analyze_insider_trading(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let trades = market
        .insider_trades(
            &invocation.ticker,
            Some(invocation.start_date),
            invocation.end_date,
            100,
        )
        .await
        .map_err(|e| ToolError::Upstream {
            ticker: invocation.ticker.clone(),
            reason: e.to_string(),
        })?;

    if trades.is_empty() {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: "no insider transactions in window".to_string(),
        }
        .into());
    }

    let mut buys = 0usize;
    let mut sells = 0usize;
    let mut net_shares = 0.0;
    for trade in &trades {
        let shares = trade.transaction_shares.unwrap_or(0.0);
        net_shares += shares;
        if shares > 0.0 {
            buys += 1;
        } else if shares < 0.0 {
            sells += 1;
        }
    }

    let total = (buys + sells).max(1);
    let buy_ratio = buys as f64 / total as f64;
    let (signal, confidence) = if buy_ratio > 0.6 {
        (Signal::Bullish, 50.0 + (buy_ratio - 0.6) * 100.0)
    } else if buy_ratio < 0.4 {
        (Signal::Bearish, 50.0 + (0.4 - buy_ratio) * 100.0)
    } else {
        (Signal::Neutral, 45.0)
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("insider_buys".to_string(), buys as f64);
    metrics.insert("insider_sells".to_string(), sells as f64);
    metrics.insert("net_shares".to_string(), net_shares);
    metrics.insert("buy_ratio".to_string(), buy_ratio);

    Ok(ToolResult {
        tool_name: "analyze_insider_trading".to_string(),
        signal,
        confidence: confidence.min(85.0),
        metrics,
        reasoning: format!(
            "{}: {} insider buys vs {} sells, net {:.0} shares",
            invocation.ticker, buys, sells, net_shares
        ),
        error: None,
    })
}

pub async fn analyze_news_sentiment(
    market: &dyn MarketDataProvider,
    invocation: &ToolInvocation,
) -> Result<ToolResult> {
    let news = market
        .company_news(
            &invocation.ticker,
            Some(invocation.start_date),
            invocation.end_date,
            50,
        )
        .await
        .map_err(|e| ToolError::Upstream {
            ticker: invocation.ticker.clone(),
            reason: e.to_string(),
        })?;

    if news.is_empty() {
        return Err(ToolError::NoData {
            ticker: invocation.ticker.clone(),
            reason: "no company news in window".to_string(),
        }
        .into());
    }

    let analyzer = SentimentIntensityAnalyzer::new();
    let mut positive = 0usize;
    let mut negative = 0usize;
    let mut compound_sum = 0.0;
    for item in &news {
        let scores = analyzer.polarity_scores(&item.title);
        let compound = scores.get("compound").copied().unwrap_or(0.0);
        compound_sum += compound;
        if compound >= 0.05 {
            positive += 1;
        } else if compound <= -0.05 {
            negative += 1;
        }
    }
    let mean_compound = compound_sum / news.len() as f64;

    let (signal, confidence) = if mean_compound > 0.1 {
        (Signal::Bullish, (50.0 + mean_compound * 100.0).min(85.0))
    } else if mean_compound < -0.1 {
        (Signal::Bearish, (50.0 + mean_compound.abs() * 100.0).min(85.0))
    } else {
        (Signal::Neutral, 45.0)
    };

    let mut metrics = BTreeMap::new();
    metrics.insert("articles".to_string(), news.len() as f64);
    metrics.insert("positive_articles".to_string(), positive as f64);
    metrics.insert("negative_articles".to_string(), negative as f64);
    metrics.insert("mean_compound_score".to_string(), mean_compound);

    Ok(ToolResult {
        tool_name: "analyze_news_sentiment".to_string(),
        signal,
        confidence,
        metrics,
        reasoning: format!(
            "{}: {} articles, {} positive / {} negative, mean tone {:.3}",
            invocation.ticker,
            news.len(),
            positive,
            negative,
            mean_compound
        ),
        error: None,
    })
}
