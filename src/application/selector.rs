use crate::application::agents::persona::Persona;
use crate::application::gateway::{ModelGateway, StructuredOutput};
use crate::application::tools::{ToolExecutor, ToolInvocation, ToolRegistry};
use crate::domain::llm::{ChatMessage, ModelConfig};
use crate::domain::state::DayState;
use crate::domain::types::{
    SelectedTool, Signal, SynthesisDetails, ToolResult, ToolSelectionPlan, clamp_confidence,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw shape the model returns for a tool-selection request.
#[derive(Debug, Deserialize)]
struct RawToolSelection {
    #[serde(default)]
    selected_tools: Vec<SelectedTool>,
    #[serde(default)]
    analysis_strategy: String,
    #[serde(default)]
    synthesis_approach: String,
}

impl StructuredOutput for RawToolSelection {
    fn fallback() -> Self {
        Self {
            selected_tools: vec![],
            analysis_strategy: String::new(),
            synthesis_approach: String::new(),
        }
    }
}

/// Raw shape the model returns for a synthesis request.
#[derive(Debug, Deserialize)]
struct RawSynthesis {
    signal: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    tool_impact_analysis: BTreeMap<String, String>,
    #[serde(skip)]
    degraded: bool,
}

impl StructuredOutput for RawSynthesis {
    fn fallback() -> Self {
        Self {
            signal: "neutral".to_string(),
            confidence: 50.0,
            reasoning: String::new(),
            tool_impact_analysis: BTreeMap::new(),
            degraded: true,
        }
    }
}

/// The synthesized per-ticker view an analyst derives from its tool runs.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub signal: Signal,
    pub confidence: f64,
    pub reasoning: String,
    pub details: SynthesisDetails,
}

/// LLM-driven tool selection and result synthesis for one analyst persona.
pub struct ToolSelector {
    gateway: Arc<ModelGateway>,
    executor: Arc<ToolExecutor>,
}

impl ToolSelector {
    pub fn new(gateway: Arc<ModelGateway>, executor: Arc<ToolExecutor>) -> Self {
        Self { gateway, executor }
    }

    /// Asks the model which tools fit this persona and ticker. Unknown tool
    /// names are dropped; an empty post-validation list falls back to the
    /// persona's default set.
    pub async fn select(
        &self,
        persona: &Persona,
        ticker: &str,
        market_conditions: &str,
        objective: &str,
        model: &ModelConfig,
    ) -> ToolSelectionPlan {
        let prompt = format!(
            "You are the {name}.\n{description}\n\n\
             Ticker under analysis: {ticker}\n\
             Market conditions: {market_conditions}\n\
             Objective: {objective}\n\n\
             Available analysis tools:\n{schemas}\n\
             Choose the tools that best serve your objective. Respond with JSON only:\n\
             {{\"selected_tools\": [{{\"tool_name\": \"...\", \"reason\": \"...\"}}],\n \
             \"analysis_strategy\": \"...\", \"synthesis_approach\": \"...\"}}",
            name = persona.name,
            description = persona.description,
            schemas = ToolRegistry::schema_text(),
        );

        let raw: RawToolSelection = self
            .gateway
            .call_structured(
                model,
                vec![
                    ChatMessage::system("You select analysis tools for a trading analyst."),
                    ChatMessage::user(prompt),
                ],
                0.3,
                None,
            )
            .await;

        let mut selected: Vec<SelectedTool> = raw
            .selected_tools
            .into_iter()
            .filter(|tool| {
                let known = ToolRegistry::contains(&tool.tool_name);
                if !known {
                    warn!("Selector: dropping unknown tool name '{}'", tool.tool_name);
                }
                known
            })
            .collect();

        if selected.is_empty() {
            debug!(
                "Selector: empty selection for {} ({}), using persona defaults",
                ticker, persona.name
            );
            selected = persona
                .default_tools
                .iter()
                .map(|name| SelectedTool {
                    tool_name: name.clone(),
                    reason: format!("default tool for {}", persona.name),
                })
                .collect();
        }

        let tool_count = selected.len();
        ToolSelectionPlan {
            selected_tools: selected,
            analysis_strategy: if raw.analysis_strategy.is_empty() {
                format!("{} default strategy", persona.name)
            } else {
                raw.analysis_strategy
            },
            synthesis_approach: if raw.synthesis_approach.is_empty() {
                "confidence-weighted synthesis".to_string()
            } else {
                raw.synthesis_approach
            },
            tool_count,
        }
    }

    /// Runs every selected tool. Tool failures come back as error-carrying
    /// neutral results, never as an `Err`.
    pub async fn execute(
        &self,
        plan: &ToolSelectionPlan,
        state: &DayState,
        ticker: &str,
        end_date: NaiveDate,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(plan.selected_tools.len());
        for tool in &plan.selected_tools {
            let Some(spec) = ToolRegistry::spec(&tool.tool_name) else {
                results.push(ToolResult::failed(
                    tool.tool_name.clone(),
                    "tool disappeared from registry",
                ));
                continue;
            };
            let invocation = ToolInvocation::resolve(spec, state, ticker, end_date);
            results.push(self.executor.execute(&tool.tool_name, &invocation).await);
        }
        results
    }

    /// Folds tool outputs into one signal. Retries ride on the gateway's
    /// 1s/2s/4s backoff; after the final failure the outcome degrades to
    /// neutral at confidence 50 with `synthesis_method = "error"`.
    pub async fn synthesize(
        &self,
        tool_results: &[ToolResult],
        plan: &ToolSelectionPlan,
        persona: &Persona,
        ticker: &str,
        model: &ModelConfig,
    ) -> SynthesisOutcome {
        let mut summary = String::new();
        for result in tool_results {
            match &result.error {
                Some(error) => {
                    summary.push_str(&format!("- {} FAILED: {}\n", result.tool_name, error));
                }
                None => {
                    summary.push_str(&format!(
                        "- {}: {} (confidence {:.0}). {}\n",
                        result.tool_name, result.signal, result.confidence, result.reasoning
                    ));
                }
            }
        }

        let prompt = format!(
            "You are the {name}.\n{description}\n\n\
             Ticker: {ticker}\n\
             Your analysis strategy was: {strategy}\n\
             Synthesis approach: {approach}\n\n\
             Tool outputs:\n{summary}\n\
             Weigh the successful tools and produce one overall view. Respond with JSON only:\n\
             {{\"signal\": \"bullish|bearish|neutral\", \"confidence\": 0-100,\n \
             \"reasoning\": \"...\", \"tool_impact_analysis\": {{\"tool_name\": \"impact\"}}}}",
            name = persona.name,
            description = persona.description,
            strategy = plan.analysis_strategy,
            approach = plan.synthesis_approach,
        );

        let raw: RawSynthesis = self
            .gateway
            .call_structured(
                model,
                vec![
                    ChatMessage::system("You synthesize tool outputs into one trading signal."),
                    ChatMessage::user(prompt),
                ],
                0.3,
                None,
            )
            .await;

        if raw.degraded {
            return SynthesisOutcome {
                signal: Signal::Neutral,
                confidence: 50.0,
                reasoning: format!("Failed to synthesize tool results for {ticker}"),
                details: SynthesisDetails {
                    tool_impact_analysis: BTreeMap::new(),
                    synthesis_method: "error".to_string(),
                },
            };
        }

        SynthesisOutcome {
            signal: Signal::parse_loose(&raw.signal),
            confidence: clamp_confidence(raw.confidence),
            reasoning: raw.reasoning,
            details: SynthesisDetails {
                tool_impact_analysis: raw.tool_impact_analysis,
                synthesis_method: "llm_weighted".to_string(),
            },
        }
    }
}
