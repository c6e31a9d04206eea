use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// The closed set of analyst identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalystType {
    Fundamental,
    Technical,
    Sentiment,
    Valuation,
    Comprehensive,
}

impl AnalystType {
    pub const ALL: [AnalystType; 5] = [
        AnalystType::Fundamental,
        AnalystType::Technical,
        AnalystType::Sentiment,
        AnalystType::Valuation,
        AnalystType::Comprehensive,
    ];

    /// Stable agent id used as the key in `analyst_signals` and as the
    /// memory `user_id`.
    pub fn agent_id(&self) -> String {
        format!("{self}_analyst_agent")
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AnalystType::Fundamental => "Fundamental Analyst",
            AnalystType::Technical => "Technical Analyst",
            AnalystType::Sentiment => "Sentiment Analyst",
            AnalystType::Valuation => "Valuation Analyst",
            AnalystType::Comprehensive => "Comprehensive Analyst",
        }
    }
}

impl fmt::Display for AnalystType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalystType::Fundamental => write!(f, "fundamental"),
            AnalystType::Technical => write!(f, "technical"),
            AnalystType::Sentiment => write!(f, "sentiment"),
            AnalystType::Valuation => write!(f, "valuation"),
            AnalystType::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

impl FromStr for AnalystType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fundamental" => Ok(AnalystType::Fundamental),
            "technical" => Ok(AnalystType::Technical),
            "sentiment" => Ok(AnalystType::Sentiment),
            "valuation" => Ok(AnalystType::Valuation),
            "comprehensive" => Ok(AnalystType::Comprehensive),
            _ => anyhow::bail!(
                "Invalid analyst type: {}. Must be one of fundamental, technical, sentiment, valuation, comprehensive",
                s
            ),
        }
    }
}

/// A persona: the fixed role identity an analyst carries into tool selection
/// and synthesis prompts, plus its fallback tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub description: String,
    pub objective: String,
    pub default_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PersonaCatalog {
    personas: BTreeMap<AnalystType, Persona>,
}

impl PersonaCatalog {
    pub fn builtin() -> Self {
        let mut personas = BTreeMap::new();

        personas.insert(
            AnalystType::Fundamental,
            Persona {
                name: "Fundamental Analyst".to_string(),
                description: "You evaluate companies through their financial statements: \
                              profitability, growth trajectory, balance-sheet strength and \
                              capital efficiency. You distrust price action and care about \
                              the underlying business."
                    .to_string(),
                objective: "Judge whether the business fundamentals justify owning the stock"
                    .to_string(),
                default_tools: vec![
                    "analyze_profitability".to_string(),
                    "analyze_growth".to_string(),
                    "analyze_financial_health".to_string(),
                    "analyze_valuation_ratios".to_string(),
                    "analyze_efficiency_ratios".to_string(),
                ],
            },
        );

        personas.insert(
            AnalystType::Technical,
            Persona {
                name: "Technical Analyst".to_string(),
                description: "You read price and volume. Trends, momentum, mean reversion and \
                              volatility regimes drive your view; fundamentals only matter once \
                              the tape confirms them."
                    .to_string(),
                objective: "Determine the direction and strength of the current price trend"
                    .to_string(),
                default_tools: vec![
                    "analyze_trend_following".to_string(),
                    "analyze_momentum".to_string(),
                    "analyze_mean_reversion".to_string(),
                    "analyze_volatility".to_string(),
                ],
            },
        );

        personas.insert(
            AnalystType::Sentiment,
            Persona {
                name: "Sentiment Analyst".to_string(),
                description: "You track what the market believes: news tone, media coverage and \
                              what insiders do with their own money. Positioning and narrative \
                              shifts lead price."
                    .to_string(),
                objective: "Gauge market sentiment and insider conviction for the stock"
                    .to_string(),
                default_tools: vec![
                    "analyze_news_sentiment".to_string(),
                    "analyze_insider_trading".to_string(),
                ],
            },
        );

        personas.insert(
            AnalystType::Valuation,
            Persona {
                name: "Valuation Analyst".to_string(),
                description: "You estimate intrinsic value with several independent models and \
                              compare it to the market price. A wide margin of safety is the \
                              only buy signal you accept."
                    .to_string(),
                objective: "Estimate intrinsic value and the gap to the current market price"
                    .to_string(),
                default_tools: vec![
                    "dcf_valuation_analysis".to_string(),
                    "owner_earnings_valuation_analysis".to_string(),
                    "ev_ebitda_valuation_analysis".to_string(),
                    "residual_income_valuation_analysis".to_string(),
                ],
            },
        );

        personas.insert(
            AnalystType::Comprehensive,
            Persona {
                name: "Comprehensive Analyst".to_string(),
                description: "You synthesize across disciplines: fundamentals for quality, \
                              technicals for timing, sentiment for positioning and valuation \
                              for the margin of safety. You weigh conflicting evidence rather \
                              than discarding it."
                    .to_string(),
                objective: "Form a balanced cross-disciplinary view of the stock".to_string(),
                default_tools: vec![
                    "analyze_profitability".to_string(),
                    "analyze_growth".to_string(),
                    "analyze_trend_following".to_string(),
                    "analyze_momentum".to_string(),
                    "analyze_news_sentiment".to_string(),
                    "dcf_valuation_analysis".to_string(),
                ],
            },
        );

        Self { personas }
    }

    /// Loads persona overrides from a TOML file, falling back to the builtin
    /// catalog for any analyst type the file does not mention.
    pub fn load_or_builtin(path: Option<&Path>) -> Self {
        let mut catalog = Self::builtin();
        let Some(path) = path else {
            return catalog;
        };
        if !path.exists() {
            return catalog;
        }

        match Self::load_overrides(path) {
            Ok(overrides) => {
                for (analyst_type, persona) in overrides {
                    catalog.personas.insert(analyst_type, persona);
                }
                info!("Personas: loaded overrides from {:?}", path);
            }
            Err(e) => {
                tracing::warn!("Personas: failed to load {:?}: {}. Using builtins.", path, e);
            }
        }
        catalog
    }

    fn load_overrides(path: &Path) -> Result<BTreeMap<AnalystType, Persona>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read persona file {path:?}"))?;
        let raw: BTreeMap<String, Persona> =
            toml::from_str(&content).context("failed to parse persona TOML")?;

        let mut out = BTreeMap::new();
        for (key, persona) in raw {
            let analyst_type: AnalystType = key.parse()?;
            out.insert(analyst_type, persona);
        }
        Ok(out)
    }

    pub fn get(&self, analyst_type: AnalystType) -> &Persona {
        self.personas
            .get(&analyst_type)
            .expect("builtin catalog covers every analyst type")
    }
}

impl Default for PersonaCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tools::ToolRegistry;

    #[test]
    fn agent_ids_are_stable() {
        assert_eq!(
            AnalystType::Fundamental.agent_id(),
            "fundamental_analyst_agent"
        );
        assert_eq!(AnalystType::Technical.agent_id(), "technical_analyst_agent");
    }

    #[test]
    fn builtin_default_tools_exist_in_registry() {
        let catalog = PersonaCatalog::builtin();
        for analyst_type in AnalystType::ALL {
            let persona = catalog.get(analyst_type);
            assert!(!persona.default_tools.is_empty());
            for tool in &persona.default_tools {
                assert!(ToolRegistry::contains(tool), "unknown default tool {tool}");
            }
        }
    }

    #[test]
    fn toml_override_replaces_only_named_personas() {
        let dir = std::env::temp_dir().join(format!("quorumtrade-personas-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("personas.toml");
        std::fs::write(
            &path,
            r#"
[technical]
name = "Tape Reader"
description = "Price is the only truth."
objective = "Read the tape"
default_tools = ["analyze_momentum"]
"#,
        )
        .unwrap();

        let catalog = PersonaCatalog::load_or_builtin(Some(path.as_path()));
        assert_eq!(catalog.get(AnalystType::Technical).name, "Tape Reader");
        assert_eq!(
            catalog.get(AnalystType::Technical).default_tools,
            vec!["analyze_momentum".to_string()]
        );
        // Unnamed personas keep their builtin definitions.
        assert_eq!(
            catalog.get(AnalystType::Fundamental).name,
            "Fundamental Analyst"
        );

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_persona_file_falls_back_to_builtin() {
        let path = std::path::Path::new("/nonexistent/personas.toml");
        let catalog = PersonaCatalog::load_or_builtin(Some(path));
        assert_eq!(catalog.get(AnalystType::Valuation).name, "Valuation Analyst");
    }

    #[test]
    fn analyst_type_parsing() {
        assert_eq!(
            "comprehensive".parse::<AnalystType>().unwrap(),
            AnalystType::Comprehensive
        );
        assert!("quant".parse::<AnalystType>().is_err());
    }
}
