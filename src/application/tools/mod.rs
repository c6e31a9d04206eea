pub mod fundamental;
pub mod sentiment;
pub mod technical;
pub mod valuation;

use crate::domain::errors::ToolError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::state::DayState;
use crate::domain::types::{ToolCategory, ToolResult};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::warn;

/// Catalog entry for one analysis tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub category: ToolCategory,
    pub required_params: &'static [&'static str],
    pub optional_params: &'static [&'static str],
    pub description: &'static str,
}

const FUNDAMENTAL_PARAMS: &[&str] = &["ticker", "api_key", "end_date"];
const TIMESERIES_PARAMS: &[&str] = &["ticker", "api_key", "start_date", "end_date"];

/// The full tool catalog: five fundamental, four technical, two sentiment and
/// four valuation tools.
pub const CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "analyze_profitability",
        category: ToolCategory::Fundamental,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period", "limit"],
        description: "Profitability analysis: ROE, net margin, operating margin",
    },
    ToolSpec {
        name: "analyze_growth",
        category: ToolCategory::Fundamental,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period", "limit"],
        description: "Growth analysis: revenue, earnings and book value growth",
    },
    ToolSpec {
        name: "analyze_financial_health",
        category: ToolCategory::Fundamental,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period", "limit"],
        description: "Financial health: liquidity, leverage and cash conversion",
    },
    ToolSpec {
        name: "analyze_valuation_ratios",
        category: ToolCategory::Fundamental,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period", "limit"],
        description: "Valuation ratios: P/E, P/B, P/S against reasonable bands",
    },
    ToolSpec {
        name: "analyze_efficiency_ratios",
        category: ToolCategory::Fundamental,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period", "limit"],
        description: "Efficiency ratios: asset, inventory and receivables turnover",
    },
    ToolSpec {
        name: "analyze_trend_following",
        category: ToolCategory::Technical,
        required_params: TIMESERIES_PARAMS,
        optional_params: &[],
        description: "Trend following: moving-average crossovers and MACD",
    },
    ToolSpec {
        name: "analyze_mean_reversion",
        category: ToolCategory::Technical,
        required_params: TIMESERIES_PARAMS,
        optional_params: &[],
        description: "Mean reversion: Bollinger Bands and RSI overbought/oversold",
    },
    ToolSpec {
        name: "analyze_momentum",
        category: ToolCategory::Technical,
        required_params: TIMESERIES_PARAMS,
        optional_params: &[],
        description: "Momentum: short, medium and long horizon price momentum",
    },
    ToolSpec {
        name: "analyze_volatility",
        category: ToolCategory::Technical,
        required_params: TIMESERIES_PARAMS,
        optional_params: &[],
        description: "Volatility: realized volatility across time windows",
    },
    ToolSpec {
        name: "analyze_insider_trading",
        category: ToolCategory::Sentiment,
        required_params: TIMESERIES_PARAMS,
        optional_params: &["limit"],
        description: "Insider trading: net insider buy/sell balance",
    },
    ToolSpec {
        name: "analyze_news_sentiment",
        category: ToolCategory::Sentiment,
        required_params: TIMESERIES_PARAMS,
        optional_params: &["limit"],
        description: "News sentiment: positive/negative tone of recent coverage",
    },
    ToolSpec {
        name: "dcf_valuation_analysis",
        category: ToolCategory::Valuation,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period"],
        description: "DCF valuation: intrinsic value from projected free cash flow",
    },
    ToolSpec {
        name: "owner_earnings_valuation_analysis",
        category: ToolCategory::Valuation,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period"],
        description: "Owner-earnings valuation: conservative value-investor estimate",
    },
    ToolSpec {
        name: "ev_ebitda_valuation_analysis",
        category: ToolCategory::Valuation,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period"],
        description: "EV/EBITDA multiple valuation against historical bands",
    },
    ToolSpec {
        name: "residual_income_valuation_analysis",
        category: ToolCategory::Valuation,
        required_params: FUNDAMENTAL_PARAMS,
        optional_params: &["period"],
        description: "Residual income valuation: value creation over cost of equity",
    },
];

#[derive(Debug, Clone)]
pub struct ToolRegistry;

impl ToolRegistry {
    pub fn catalog() -> &'static [ToolSpec] {
        CATALOG
    }

    pub fn spec(name: &str) -> Option<&'static ToolSpec> {
        CATALOG.iter().find(|spec| spec.name == name)
    }

    pub fn contains(name: &str) -> bool {
        Self::spec(name).is_some()
    }

    /// Tool schemas rendered for the selection prompt.
    pub fn schema_text() -> String {
        let mut out = String::new();
        for spec in CATALOG {
            out.push_str(&format!(
                "- **{}** ({}): {}. Required params: {}.\n",
                spec.name,
                spec.category,
                spec.description,
                spec.required_params.join(", "),
            ));
        }
        out
    }
}

/// Resolved parameters for one tool run. All tools take a ticker and an api
/// key (chosen by category); time-series tools also take a start date.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub ticker: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub api_key: String,
}

impl ToolInvocation {
    /// Builds the invocation for `spec` from the day state. The financial-data
    /// key goes to fundamental/valuation tools, the news/price key to
    /// technical/sentiment tools.
    pub fn resolve(spec: &ToolSpec, state: &DayState, ticker: &str, end_date: NaiveDate) -> Self {
        Self {
            ticker: ticker.to_string(),
            start_date: state.start_date,
            end_date,
            api_key: state.api_keys.for_category(spec.category),
        }
    }
}

/// Synchronous-from-the-caller's-view tool execution with error capture.
/// Failures never escape: they come back as a neutral `ToolResult` carrying
/// the error text.
pub struct ToolExecutor {
    market: Arc<dyn MarketDataProvider>,
}

impl ToolExecutor {
    pub fn new(market: Arc<dyn MarketDataProvider>) -> Self {
        Self { market }
    }

    pub async fn execute(&self, tool_name: &str, invocation: &ToolInvocation) -> ToolResult {
        if invocation.ticker.is_empty() {
            return ToolResult::failed(
                tool_name,
                ToolError::MissingParam {
                    tool: tool_name.to_string(),
                    param: "ticker".to_string(),
                }
                .to_string(),
            );
        }

        let market = self.market.as_ref();
        let outcome = match tool_name {
            "analyze_profitability" => fundamental::analyze_profitability(market, invocation).await,
            "analyze_growth" => fundamental::analyze_growth(market, invocation).await,
            "analyze_financial_health" => {
                fundamental::analyze_financial_health(market, invocation).await
            }
            "analyze_valuation_ratios" => {
                fundamental::analyze_valuation_ratios(market, invocation).await
            }
            "analyze_efficiency_ratios" => {
                fundamental::analyze_efficiency_ratios(market, invocation).await
            }
            "analyze_trend_following" => technical::analyze_trend_following(market, invocation).await,
            "analyze_mean_reversion" => technical::analyze_mean_reversion(market, invocation).await,
            "analyze_momentum" => technical::analyze_momentum(market, invocation).await,
            "analyze_volatility" => technical::analyze_volatility(market, invocation).await,
            "analyze_insider_trading" => {
                sentiment::analyze_insider_trading(market, invocation).await
            }
            "analyze_news_sentiment" => sentiment::analyze_news_sentiment(market, invocation).await,
            "dcf_valuation_analysis" => valuation::dcf_valuation_analysis(market, invocation).await,
            "owner_earnings_valuation_analysis" => {
                valuation::owner_earnings_valuation_analysis(market, invocation).await
            }
            "ev_ebitda_valuation_analysis" => {
                valuation::ev_ebitda_valuation_analysis(market, invocation).await
            }
            "residual_income_valuation_analysis" => {
                valuation::residual_income_valuation_analysis(market, invocation).await
            }
            other => {
                return ToolResult::failed(other, format!("unknown tool: {other}"));
            }
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Tool {} failed for {}: {}",
                    tool_name, invocation.ticker, e
                );
                ToolResult::failed(tool_name, e.to_string())
            }
        }
    }
}
