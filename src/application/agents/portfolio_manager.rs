use crate::application::agents::risk_manager::RISK_MANAGER_ID;
use crate::application::gateway::{ModelGateway, StructuredOutput};
use crate::application::memory::MemoryStore;
use crate::domain::llm::ChatMessage;
use crate::domain::ports::DashboardSink;
use crate::domain::state::{DayState, EngineMode};
use crate::domain::types::{
    AgentOutput, PortfolioDecision, RiskAssessment, Signal, TradeAction, clamp_confidence,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PORTFOLIO_MANAGER_ID: &str = "portfolio_manager";

/// Number of recalled memories per ticker.
const MEMORY_TOP_K: usize = 3;

/// One analyst's contribution to one ticker after shape normalization.
#[derive(Debug, Clone)]
pub struct NormalizedSignal {
    pub signal: Signal,
    pub confidence: f64,
    pub reasoning: String,
    pub error_note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    quantity: f64,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct DecisionSet {
    decisions: BTreeMap<String, RawDecision>,
}

impl StructuredOutput for DecisionSet {
    fn validate(&self) -> Result<(), String> {
        if self.decisions.is_empty() {
            return Err("decisions must be non-empty".to_string());
        }
        Ok(())
    }

    fn fallback() -> Self {
        Self {
            decisions: BTreeMap::new(),
        }
    }
}

/// Aggregates analyst signals, risk limits and recalled memories into one
/// decision per ticker. Degrades to hold-everything on synthesis failure.
pub struct PortfolioManagerAgent {
    gateway: Arc<ModelGateway>,
    memory: Arc<MemoryStore>,
    dashboard: Option<Arc<dyn DashboardSink>>,
}

impl PortfolioManagerAgent {
    pub fn new(
        gateway: Arc<ModelGateway>,
        memory: Arc<MemoryStore>,
        dashboard: Option<Arc<dyn DashboardSink>>,
    ) -> Self {
        Self {
            gateway,
            memory,
            dashboard,
        }
    }

    /// Normalizes every analyst output (first-round per-ticker maps and
    /// round-2 `ticker_signals` lists) into the canonical per-ticker shape.
    pub fn collect_signals(
        state: &DayState,
    ) -> BTreeMap<String, BTreeMap<String, NormalizedSignal>> {
        let mut by_ticker: BTreeMap<String, BTreeMap<String, NormalizedSignal>> = BTreeMap::new();

        for (agent_id, output) in &state.analyst_signals {
            if agent_id == RISK_MANAGER_ID {
                continue;
            }
            match output {
                AgentOutput::FirstRound(map) => {
                    for (ticker, signal) in map {
                        let error_note = if signal.tool_analysis.synthesis_details.synthesis_method
                            == "error"
                            || signal.reasoning.contains("Failed to synthesize")
                        {
                            Some("synthesis failed; signal degraded to neutral".to_string())
                        } else {
                            None
                        };
                        by_ticker.entry(ticker.clone()).or_default().insert(
                            agent_id.clone(),
                            NormalizedSignal {
                                signal: signal.signal,
                                confidence: signal.confidence,
                                reasoning: signal.reasoning.clone(),
                                error_note,
                            },
                        );
                    }
                }
                AgentOutput::SecondRound(analysis) => {
                    for entry in &analysis.ticker_signals {
                        by_ticker.entry(entry.ticker.clone()).or_default().insert(
                            agent_id.clone(),
                            NormalizedSignal {
                                signal: entry.signal,
                                confidence: entry.confidence,
                                reasoning: entry.reasoning.clone(),
                                error_note: None,
                            },
                        );
                    }
                }
                AgentOutput::Risk(_) | AgentOutput::Failed(_) => {}
            }
        }
        by_ticker
    }

    /// Memory recall keyword: the majority analyst direction for the ticker,
    /// or `divergence` when opinions split.
    pub fn recall_keyword(signals: &BTreeMap<String, NormalizedSignal>) -> &'static str {
        let bullish = signals
            .values()
            .filter(|s| s.signal == Signal::Bullish)
            .count();
        let bearish = signals
            .values()
            .filter(|s| s.signal == Signal::Bearish)
            .count();
        if bullish > bearish {
            "bullish"
        } else if bearish > bullish {
            "bearish"
        } else {
            "divergence"
        }
    }

    pub async fn execute(&self, state: &DayState) -> BTreeMap<String, PortfolioDecision> {
        let signals_by_ticker = Self::collect_signals(state);
        let risk = state
            .analyst_signals
            .get(RISK_MANAGER_ID)
            .and_then(AgentOutput::as_risk);

        let mut recalled = String::new();
        for ticker in &state.tickers {
            let Some(ticker_signals) = signals_by_ticker.get(ticker) else {
                continue;
            };
            let keyword = Self::recall_keyword(ticker_signals);
            let query = format!("{ticker} investment decision {keyword} signals");
            match self
                .memory
                .search(&query, PORTFOLIO_MANAGER_ID, MEMORY_TOP_K)
                .await
            {
                Ok(records) if !records.is_empty() => {
                    recalled.push_str(&format!("{ticker}:\n"));
                    for record in records {
                        recalled.push_str(&format!("  - {}\n", record.content));
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("PortfolioManager: memory recall failed for {}: {}", ticker, e),
            }
        }
        if recalled.is_empty() {
            recalled.push_str("(no relevant memories)\n");
        }

        let performance = match &self.dashboard {
            Some(dashboard) => dashboard.recent_performance().await,
            None => None,
        };
        let mut performance_text = String::new();
        if let Some(snapshot) = performance {
            for (date, ticker, action, confidence) in &snapshot.recent_decisions {
                performance_text.push_str(&format!(
                    "  - {date} {ticker}: {action} (confidence {confidence:.0})\n"
                ));
            }
            for (agent, rate) in &snapshot.win_rates {
                performance_text.push_str(&format!("  - {agent} win rate {:.0}%\n", rate * 100.0));
            }
        }
        if performance_text.is_empty() {
            performance_text.push_str("(no recent performance data)\n");
        }

        let signals_json = serde_json::to_string_pretty(&Self::signals_for_prompt(
            &signals_by_ticker,
        ))
        .unwrap_or_default();

        let mut risk_text = String::new();
        if let Some(risk) = risk {
            for (ticker, assessment) in risk {
                match assessment {
                    RiskAssessment::Basic(a) => risk_text.push_str(&format!(
                        "  - {ticker}: price {:.2}, risk {} (score {})\n",
                        a.current_price, a.risk_level, a.risk_score
                    )),
                    RiskAssessment::Position(a) => risk_text.push_str(&format!(
                        "  - {ticker}: price {:.2}, max {} shares, {:.0} limit headroom\n",
                        a.current_price, a.max_shares, a.remaining_position_limit
                    )),
                }
            }
        }
        if risk_text.is_empty() {
            risk_text.push_str("(no risk assessment)\n");
        }

        let mode_instructions = match state.mode {
            EngineMode::Signal => {
                "Direction mode: decide long/short/hold per ticker. Set quantity to 0."
            }
            EngineMode::Portfolio => {
                "Portfolio mode: decide long/short/hold per ticker with an integer share \
                 quantity. Respect the per-ticker max shares and available cash."
            }
        };

        let mut portfolio_text = String::new();
        if let Some(portfolio) = &state.portfolio {
            portfolio_text = format!(
                "Portfolio: cash {:.2}, margin used {:.2}, positions {}\n",
                portfolio.cash,
                portfolio.margin_used,
                serde_json::to_string(&portfolio.positions).unwrap_or_default()
            );
        }

        let tickers = state.tickers.join(", ");
        let prompt = format!(
            "You are the portfolio manager deciding trades for {date}.\n\
             {mode_instructions}\n\n\
             Analyst signals by ticker:\n{signals_json}\n\n\
             Risk assessment:\n{risk_text}\n\
             Relevant memories from past decisions:\n{recalled}\n\
             Recent performance:\n{performance_text}\n\
             {portfolio_text}\n\
             Decide for every ticker: {tickers}. Respond with JSON only:\n\
             {{\"decisions\": {{\"<ticker>\": {{\"action\": \"long|short|hold\",\n \
             \"quantity\": <integer>, \"confidence\": 0-100, \"reasoning\": \"...\"}}}}}}",
            date = state.trading_date,
        );

        let model = state.resolve_model(PORTFOLIO_MANAGER_ID);
        let raw: DecisionSet = self
            .gateway
            .call_structured(
                &model,
                vec![
                    ChatMessage::system(
                        "You are a disciplined portfolio manager aggregating analyst research.",
                    ),
                    ChatMessage::user(prompt),
                ],
                0.2,
                Some(Box::new(DecisionSet::fallback)),
            )
            .await;

        if raw.decisions.is_empty() {
            warn!("PortfolioManager: decision synthesis failed, holding every ticker");
        }

        let mut decisions = BTreeMap::new();
        for ticker in &state.tickers {
            let decision = match raw.decisions.get(ticker) {
                Some(raw_decision) => {
                    let quantity = match state.mode {
                        EngineMode::Signal => 0,
                        EngineMode::Portfolio => raw_decision.quantity.max(0.0).floor() as u64,
                    };
                    PortfolioDecision {
                        action: TradeAction::parse_loose(&raw_decision.action),
                        quantity,
                        confidence: clamp_confidence(raw_decision.confidence),
                        reasoning: raw_decision.reasoning.clone(),
                    }
                }
                None => PortfolioDecision::hold("no decision returned; defaulting to hold"),
            };
            decisions.insert(ticker.clone(), decision);
        }

        info!(
            "PortfolioManager: {} decisions for {}",
            decisions.len(),
            state.trading_date
        );
        decisions
    }

    fn signals_for_prompt(
        signals_by_ticker: &BTreeMap<String, BTreeMap<String, NormalizedSignal>>,
    ) -> BTreeMap<String, BTreeMap<String, serde_json::Value>> {
        signals_by_ticker
            .iter()
            .map(|(ticker, agents)| {
                let entries = agents
                    .iter()
                    .map(|(agent_id, signal)| {
                        let mut entry = serde_json::json!({
                            "signal": signal.signal.to_string(),
                            "confidence": signal.confidence,
                            "reasoning": signal.reasoning,
                        });
                        if let Some(note) = &signal.error_note {
                            entry["error_note"] = serde_json::Value::String(note.clone());
                        }
                        (agent_id.clone(), entry)
                    })
                    .collect();
                (ticker.clone(), entries)
            })
            .collect()
    }
}
