//! Configuration for the analysis engine.
//!
//! Everything is resolved from environment variables at the boundary; the
//! core only ever sees the typed structs built here. CLI flags (in `main`)
//! override the environment.

use crate::application::agents::persona::AnalystType;
use crate::application::communication::ChatSettings;
use crate::application::services::EngineSettings;
use crate::domain::llm::{ModelConfig, Provider};
use crate::domain::state::{ApiKeys, EngineMode, ModelMetadata, ReviewMode};
use crate::infrastructure::http::HttpSettings;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Parses per-agent model overrides from
/// `agent_id=model:provider[,agent_id=model:provider...]`.
pub fn parse_model_overrides(raw: &str) -> Result<BTreeMap<String, ModelConfig>> {
    let mut overrides = BTreeMap::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (agent_id, rest) = entry
            .split_once('=')
            .with_context(|| format!("invalid model override '{entry}': expected agent=model:provider"))?;
        let (model, provider) = rest
            .split_once(':')
            .with_context(|| format!("invalid model override '{entry}': expected model:provider"))?;
        let provider: Provider = provider.trim().parse()?;
        overrides.insert(
            agent_id.trim().to_string(),
            ModelConfig::new(model.trim(), provider),
        );
    }
    Ok(overrides)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: EngineMode,
    pub initial_cash: Decimal,
    pub margin_requirement: f64,
    pub enable_communications: bool,
    pub enable_notifications: bool,
    pub max_communication_cycles: u32,
    pub is_live_mode: bool,
    pub review_mode: ReviewMode,
    pub communication_max_chars: usize,
    pub chat_max_rounds: u32,
    pub analyst_types: Vec<AnalystType>,
    pub default_model: ModelConfig,
    pub model_overrides: BTreeMap<String, ModelConfig>,

    // Boundary secrets and endpoints, treated as opaque strings.
    pub financial_api_key: Option<String>,
    pub news_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub market_data_base_url: Option<String>,
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub http_max_retries: u32,

    pub base_dir: PathBuf,
    pub config_name: String,
    pub personas_file: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let mode: EngineMode = env_opt("MODE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(EngineMode::Signal);

        let review_mode: ReviewMode = env_opt("REVIEW_MODE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(ReviewMode::IndividualReview);

        let analyst_types = match env_opt("ANALYST_TYPES") {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse())
                .collect::<Result<Vec<AnalystType>>>()?,
            None => vec![
                AnalystType::Fundamental,
                AnalystType::Technical,
                AnalystType::Sentiment,
                AnalystType::Valuation,
            ],
        };

        let default_model = match (env_opt("MODEL_NAME"), env_opt("MODEL_PROVIDER")) {
            (Some(model), Some(provider)) => ModelConfig::new(model, provider.parse()?),
            (Some(model), None) => ModelConfig::new(model, Provider::OpenAi),
            _ => ModelConfig::default(),
        };

        let model_overrides = match env_opt("MODEL_OVERRIDES") {
            Some(raw) => parse_model_overrides(&raw)?,
            None => BTreeMap::new(),
        };

        let initial_cash = Decimal::from_f64(env_or("INITIAL_CASH", 100_000.0))
            .context("INITIAL_CASH is not a valid number")?;
        let margin_requirement: f64 = env_or("MARGIN_REQUIREMENT", 0.0);
        anyhow::ensure!(
            (0.0..=1.0).contains(&margin_requirement),
            "MARGIN_REQUIREMENT must be in [0, 1], got {margin_requirement}"
        );

        Ok(Self {
            mode,
            initial_cash,
            margin_requirement,
            enable_communications: env_bool("ENABLE_COMMUNICATIONS", true),
            enable_notifications: env_bool("ENABLE_NOTIFICATIONS", true),
            max_communication_cycles: env_or("MAX_COMMUNICATION_CYCLES", 2u32).max(1),
            is_live_mode: env_bool("IS_LIVE_MODE", false),
            review_mode,
            communication_max_chars: env_or("COMMUNICATION_MAX_CHARS", 400usize),
            chat_max_rounds: env_or("CHAT_MAX_ROUNDS", 1u32).max(1),
            analyst_types,
            default_model,
            model_overrides,
            financial_api_key: env_opt("FINANCIAL_DATASETS_API_KEY"),
            news_api_key: env_opt("NEWS_API_KEY").or_else(|| env_opt("FINANCIAL_DATASETS_API_KEY")),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            openai_base_url: env_opt("OPENAI_BASE_URL"),
            anthropic_base_url: env_opt("ANTHROPIC_BASE_URL"),
            market_data_base_url: env_opt("MARKET_DATA_BASE_URL"),
            http_timeout_secs: env_or("HTTP_TIMEOUT_SECS", 30u64),
            http_connect_timeout_secs: env_or("HTTP_CONNECT_TIMEOUT_SECS", 10u64),
            http_max_retries: env_or("HTTP_MAX_RETRIES", 3u32),
            base_dir: PathBuf::from(env_or("BASE_DIR", "./data".to_string())),
            config_name: env_or("CONFIG_NAME", "default".to_string()),
            personas_file: env_opt("PERSONAS_FILE").map(PathBuf::from),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            analyst_types: self.analyst_types.clone(),
            enable_communications: self.enable_communications,
            enable_notifications: self.enable_notifications,
            chat: ChatSettings {
                max_cycles: self.max_communication_cycles,
                max_chars: self.communication_max_chars,
                max_rounds: self.chat_max_rounds,
                memory_top_k: 3,
            },
            review_mode: self.review_mode,
            worker_pool_size: 4,
        }
    }

    pub fn model_metadata(&self) -> ModelMetadata {
        ModelMetadata {
            default: Some(self.default_model.clone()),
            per_agent: self.model_overrides.clone(),
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout_secs: self.http_timeout_secs,
            connect_timeout_secs: self.http_connect_timeout_secs,
            max_retries: self.http_max_retries,
        }
    }

    pub fn api_keys(&self) -> ApiKeys {
        ApiKeys {
            financial: self.financial_api_key.clone(),
            news: self.news_api_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_override_parsing() {
        let overrides = parse_model_overrides(
            "technical_analyst_agent=gpt-4o-mini:openai,portfolio_manager=claude-sonnet-4-5:anthropic",
        )
        .unwrap();
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides["technical_analyst_agent"].model, "gpt-4o-mini");
        assert_eq!(
            overrides["portfolio_manager"].provider,
            Provider::Anthropic
        );
    }

    #[test]
    fn malformed_override_is_rejected() {
        assert!(parse_model_overrides("just-garbage").is_err());
        assert!(parse_model_overrides("agent=model-without-provider").is_err());
        assert!(parse_model_overrides("agent=model:unknown_provider").is_err());
    }

    #[test]
    fn empty_override_string_is_empty_map() {
        assert!(parse_model_overrides("").unwrap().is_empty());
    }
}
