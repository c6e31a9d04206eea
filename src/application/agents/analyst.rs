use crate::application::agents::persona::{AnalystType, PersonaCatalog};
use crate::application::communication::notifications::{NotificationHub, broadcast_and_record};
use crate::application::gateway::{ModelGateway, StructuredOutput};
use crate::application::memory::MemoryStore;
use crate::application::selector::ToolSelector;
use crate::domain::llm::ChatMessage;
use crate::domain::ports::ExchangeCalendar;
use crate::domain::state::DayState;
use crate::domain::types::{
    AgentOutput, FirstRoundSignal, Notification, SecondRoundAnalysis, ToolAnalysis,
    ToolSelectionSummary, Urgency, clamp_confidence,
};
use crate::infrastructure::calendar::naive_previous_weekday;
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl StructuredOutput for SecondRoundAnalysis {
    /// Empty-response guard: a round-2 payload without ticker signals counts
    /// as a parse failure and is retried by the gateway.
    fn validate(&self) -> Result<(), String> {
        if self.ticker_signals.is_empty() {
            return Err("ticker_signals must be non-empty".to_string());
        }
        Ok(())
    }

    fn fallback() -> Self {
        Self {
            analyst_id: String::new(),
            analyst_name: String::new(),
            ticker_signals: vec![],
            timestamp: String::new(),
        }
    }
}

/// Structured decision on whether a round-1 finding warrants a broadcast.
#[derive(Debug, Deserialize)]
struct NotificationDecision {
    should_notify: bool,
    #[serde(default)]
    content: String,
    #[serde(default)]
    urgency: String,
    #[serde(default)]
    category: String,
}

impl StructuredOutput for NotificationDecision {
    fn fallback() -> Self {
        Self {
            should_notify: false,
            content: String::new(),
            urgency: String::new(),
            category: String::new(),
        }
    }
}

pub struct AnalystDependencies {
    pub gateway: Arc<ModelGateway>,
    pub selector: Arc<ToolSelector>,
    pub memory: Arc<MemoryStore>,
    pub notifications: Arc<NotificationHub>,
    pub personas: Arc<PersonaCatalog>,
    pub calendar: Option<Arc<dyn ExchangeCalendar>>,
    pub enable_notifications: bool,
}

/// One specialized analyst. Round 1 selects, executes and synthesizes tools
/// per ticker; round 2 revises the view given peers and notifications.
pub struct AnalystAgent {
    analyst_type: AnalystType,
    deps: AnalystDependencies,
}

impl AnalystAgent {
    pub fn new(analyst_type: AnalystType, deps: AnalystDependencies) -> Self {
        Self { analyst_type, deps }
    }

    pub fn analyst_type(&self) -> AnalystType {
        self.analyst_type
    }

    pub fn agent_id(&self) -> String {
        self.analyst_type.agent_id()
    }

    /// A round-1 payload is usable for round 2 when at least one ticker went
    /// through tool selection end to end.
    pub fn validate_first_round(payload: &BTreeMap<String, FirstRoundSignal>) -> bool {
        !payload.is_empty()
            && payload
                .values()
                .any(|signal| !signal.tool_selection.selected_tools.is_empty())
    }

    async fn effective_end_date(&self, state: &DayState) -> NaiveDate {
        // "Today" is never complete pre-market; tools see data only through
        // the last finished trading day.
        if let Some(calendar) = &self.deps.calendar {
            if let Ok(day) = calendar
                .last_trading_day(state.end_date.pred_opt().unwrap_or(state.end_date))
                .await
            {
                return day;
            }
        }
        naive_previous_weekday(state.end_date)
    }

    pub async fn run_first_round(
        &self,
        state: &DayState,
    ) -> Result<BTreeMap<String, FirstRoundSignal>> {
        let agent_id = self.agent_id();
        let persona = self.deps.personas.get(self.analyst_type).clone();
        let model = state.resolve_model(&agent_id);
        let effective_end = self.effective_end_date(state).await;

        info!(
            "{}: round 1 over {} tickers (window ..{})",
            agent_id,
            state.tickers.len(),
            effective_end
        );

        let market_conditions = format!(
            "Daily analysis for {} with data through {}",
            state.trading_date, effective_end
        );

        let mut signals = BTreeMap::new();
        for ticker in &state.tickers {
            let plan = self
                .deps
                .selector
                .select(&persona, ticker, &market_conditions, &persona.objective, &model)
                .await;

            let tool_results = self
                .deps
                .selector
                .execute(&plan, state, ticker, effective_end)
                .await;

            let successful = tool_results.iter().filter(|r| !r.is_failed()).count();
            let failed = tool_results.len() - successful;

            let synthesis = self
                .deps
                .selector
                .synthesize(&tool_results, &plan, &persona, ticker, &model)
                .await;

            debug!(
                "{}: {} -> {} ({:.0}) via {} tools ({} failed)",
                agent_id, ticker, synthesis.signal, synthesis.confidence, successful, failed
            );

            let mut metadata = BTreeMap::new();
            metadata.insert("analyst_type".to_string(), self.analyst_type.to_string());
            metadata.insert("model".to_string(), model.model.clone());

            signals.insert(
                ticker.clone(),
                FirstRoundSignal {
                    ticker: ticker.clone(),
                    signal: synthesis.signal,
                    confidence: clamp_confidence(synthesis.confidence),
                    reasoning: synthesis.reasoning.clone(),
                    tool_selection: ToolSelectionSummary {
                        strategy: plan.analysis_strategy.clone(),
                        selected_tools: plan
                            .selected_tools
                            .iter()
                            .map(|t| t.tool_name.clone())
                            .collect(),
                        count: plan.tool_count,
                    },
                    tool_analysis: ToolAnalysis {
                        tool_results,
                        successful,
                        failed,
                        synthesis_details: synthesis.details,
                    },
                    metadata,
                },
            );
        }

        if self.deps.enable_notifications {
            self.maybe_notify(state, &signals).await;
        }

        Ok(signals)
    }

    /// Asks the model whether the round-1 findings warrant a broadcast; if
    /// so, fans out to every registered agent's inbox and memory.
    async fn maybe_notify(&self, state: &DayState, signals: &BTreeMap<String, FirstRoundSignal>) {
        let agent_id = self.agent_id();
        let model = state.resolve_model(&agent_id);

        let mut findings = String::new();
        for (ticker, signal) in signals {
            findings.push_str(&format!(
                "- {}: {} at confidence {:.0}\n",
                ticker, signal.signal, signal.confidence
            ));
        }

        let prompt = format!(
            "You are {agent_id}. Your round-1 findings:\n{findings}\n\
             Should the other agents be alerted about anything here before their second pass? \
             Only notify for unusual or high-conviction findings. Respond with JSON only:\n\
             {{\"should_notify\": true|false, \"content\": \"...\",\n \
             \"urgency\": \"low|medium|high|critical\", \"category\": \"...\"}}",
        );

        let decision: NotificationDecision = self
            .deps
            .gateway
            .call_structured(
                &model,
                vec![
                    ChatMessage::system("You decide whether an inter-agent notification is warranted."),
                    ChatMessage::user(prompt),
                ],
                0.2,
                None,
            )
            .await;

        if !decision.should_notify || decision.content.is_empty() {
            return;
        }

        let urgency = match decision.urgency.to_lowercase().as_str() {
            "critical" => Urgency::Critical,
            "high" => Urgency::High,
            "low" => Urgency::Low,
            _ => Urgency::Medium,
        };

        let notification = Notification {
            sender_agent: agent_id.clone(),
            content: decision.content,
            urgency,
            category: if decision.category.is_empty() {
                "analysis".to_string()
            } else {
                decision.category
            },
            timestamp: Utc::now(),
        };

        info!(
            "{}: broadcasting {:?} notification",
            agent_id, notification.urgency
        );
        broadcast_and_record(&self.deps.notifications, &self.deps.memory, notification).await;
    }

    /// Round 2: revise the per-ticker view given the merged round-1 results
    /// and recent notifications. The gateway's empty-list guard retries the
    /// call when the model returns no ticker signals.
    pub async fn run_second_round(
        &self,
        state: &DayState,
        notifications: &[Notification],
    ) -> SecondRoundAnalysis {
        let agent_id = self.agent_id();
        let model = state.resolve_model(&agent_id);

        let own_payload = state
            .analyst_signals
            .get(&agent_id)
            .and_then(AgentOutput::as_first_round)
            .map(|map| serde_json::to_string(map).unwrap_or_default())
            .unwrap_or_default();

        let mut overview = String::new();
        for (other_id, output) in &state.analyst_signals {
            if other_id == &agent_id || other_id.ends_with("_round2") {
                continue;
            }
            if let Some(map) = output.as_first_round() {
                for (ticker, signal) in map {
                    overview.push_str(&format!(
                        "- {}: {} -> {} ({:.0})\n",
                        other_id, ticker, signal.signal, signal.confidence
                    ));
                }
            }
        }

        let mut notice_text = String::new();
        for notification in notifications {
            notice_text.push_str(&format!(
                "- [{:?}] {}: {}\n",
                notification.urgency, notification.sender_agent, notification.content
            ));
        }
        if notice_text.is_empty() {
            notice_text.push_str("(none)\n");
        }

        let tickers = state.tickers.join(", ");
        let prompt = format!(
            "You are {agent_id} ({name}). This is your second analysis round for {date}.\n\n\
             Your first-round analysis (full tool detail):\n{own_payload}\n\n\
             Peer analysts' first-round conclusions:\n{overview}\n\
             Notifications received:\n{notice_text}\n\
             Reconsider each of these tickers: {tickers}. Keep or revise your view. \
             Every ticker must appear in ticker_signals. Respond with JSON only:\n\
             {{\"analyst_id\": \"{agent_id}\", \"analyst_name\": \"{name}\",\n \
             \"ticker_signals\": [{{\"ticker\": \"...\", \"signal\": \"bullish|bearish|neutral\",\n \
             \"confidence\": 0-100, \"reasoning\": \"...\"}}]}}",
            name = self.analyst_type.display_name(),
            date = state.trading_date,
        );

        let mut analysis: SecondRoundAnalysis = self
            .deps
            .gateway
            .call_structured(
                &model,
                vec![
                    ChatMessage::system("You revise your trading signals after seeing peer analyses."),
                    ChatMessage::user(prompt),
                ],
                0.3,
                None,
            )
            .await;

        if analysis.ticker_signals.is_empty() {
            warn!("{}: round 2 degraded to empty payload", agent_id);
        }

        analysis.analyst_id = agent_id;
        analysis.analyst_name = self.analyst_type.display_name().to_string();
        if analysis.timestamp.is_empty() {
            analysis.timestamp = Utc::now().to_rfc3339();
        }
        for signal in &mut analysis.ticker_signals {
            signal.confidence = clamp_confidence(signal.confidence);
        }
        analysis
    }
}
