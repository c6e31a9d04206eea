use crate::domain::llm::ModelConfig;
use crate::domain::portfolio::Portfolio;
use crate::domain::types::{AgentOutput, CommunicationLogs};
use anyhow::Result;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Engine output mode: directional signals only, or sized portfolio decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Signal,
    Portfolio,
}

impl FromStr for EngineMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "signal" => Ok(EngineMode::Signal),
            "portfolio" => Ok(EngineMode::Portfolio),
            _ => anyhow::bail!("Invalid mode: {}. Must be 'signal' or 'portfolio'", s),
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::Signal => write!(f, "signal"),
            EngineMode::Portfolio => write!(f, "portfolio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    IndividualReview,
    CentralReview,
}

impl FromStr for ReviewMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "individual_review" => Ok(ReviewMode::IndividualReview),
            "central_review" => Ok(ReviewMode::CentralReview),
            _ => anyhow::bail!(
                "Invalid review mode: {}. Must be 'individual_review' or 'central_review'",
                s
            ),
        }
    }
}

/// API keys the tool executor hands to data fetches, chosen by tool category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeys {
    /// Fundamental/valuation tools (financial statement data).
    pub financial: Option<String>,
    /// Technical/sentiment tools (price history and news).
    pub news: Option<String>,
}

impl ApiKeys {
    pub fn for_category(&self, category: crate::domain::types::ToolCategory) -> String {
        use crate::domain::types::ToolCategory::*;
        match category {
            Fundamental | Valuation => self.financial.clone().unwrap_or_default(),
            Technical | Sentiment => self.news.clone().unwrap_or_default(),
        }
    }
}

/// Model resolution metadata carried by the day state. The fallback chain is
/// per-agent override, then the state-level default, then the crate default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub default: Option<ModelConfig>,
    #[serde(default)]
    pub per_agent: BTreeMap<String, ModelConfig>,
}

impl ModelMetadata {
    pub fn resolve(&self, agent_id: &str) -> ModelConfig {
        if let Some(config) = self.per_agent.get(agent_id) {
            return config.clone();
        }
        if let Some(config) = &self.default {
            return config.clone();
        }
        ModelConfig::default()
    }
}

/// Per-day pipeline state. Cloned once per parallel analyst task; the
/// orchestrator owns the canonical copy and performs all merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayState {
    pub tickers: Vec<String>,
    /// Start of the default tool lookback window (trading date - 30 days).
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub trading_date: NaiveDate,
    pub mode: EngineMode,
    pub is_live_mode: bool,
    pub analyst_signals: BTreeMap<String, AgentOutput>,
    pub current_prices: BTreeMap<String, f64>,
    pub communication_logs: CommunicationLogs,
    pub api_keys: ApiKeys,
    pub models: ModelMetadata,
    /// Read-only view in portfolio mode; the executor mutates the driver's copy.
    pub portfolio: Option<Portfolio>,
}

impl DayState {
    pub fn new(
        trading_date: NaiveDate,
        tickers: Vec<String>,
        mode: EngineMode,
        is_live_mode: bool,
    ) -> Self {
        let start_date = trading_date
            .checked_sub_days(Days::new(30))
            .unwrap_or(trading_date);
        Self {
            tickers,
            start_date,
            end_date: trading_date,
            trading_date,
            mode,
            is_live_mode,
            analyst_signals: BTreeMap::new(),
            current_prices: BTreeMap::new(),
            communication_logs: CommunicationLogs::default(),
            api_keys: ApiKeys::default(),
            models: ModelMetadata::default(),
            portfolio: None,
        }
    }

    pub fn resolve_model(&self, agent_id: &str) -> ModelConfig {
        self.models.resolve(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::Provider;

    #[test]
    fn lookback_window_is_thirty_calendar_days() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let state = DayState::new(date, vec!["AAPL".to_string()], EngineMode::Signal, false);
        assert_eq!(state.start_date, NaiveDate::from_ymd_opt(2024, 2, 14).unwrap());
        assert_eq!(state.end_date, date);
    }

    #[test]
    fn model_resolution_fallback_chain() {
        let mut metadata = ModelMetadata::default();
        assert_eq!(metadata.resolve("anyone"), ModelConfig::default());

        metadata.default = Some(ModelConfig::new("claude-sonnet-4-5", Provider::Anthropic));
        assert_eq!(metadata.resolve("anyone").model, "claude-sonnet-4-5");

        metadata.per_agent.insert(
            "technical_analyst_agent".to_string(),
            ModelConfig::new("gpt-4o-mini", Provider::OpenAi),
        );
        assert_eq!(
            metadata.resolve("technical_analyst_agent").model,
            "gpt-4o-mini"
        );
        assert_eq!(metadata.resolve("someone_else").model, "claude-sonnet-4-5");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("signal".parse::<EngineMode>().unwrap(), EngineMode::Signal);
        assert_eq!(
            "PORTFOLIO".parse::<EngineMode>().unwrap(),
            EngineMode::Portfolio
        );
        assert!("paper".parse::<EngineMode>().is_err());
    }
}
