use crate::application::agents::portfolio_manager::PORTFOLIO_MANAGER_ID;
use crate::application::gateway::StructuredOutput;
use crate::application::services::ServiceRegistry;
use crate::domain::llm::ChatMessage;
use crate::domain::state::{DayState, ReviewMode};
use crate::domain::types::{
    AgentOutput, MemoryOpRecord, PortfolioDecision, ReflectionOutcome, Signal, TradeAction,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const UPDATE_TOOL: &str = "search_and_update_analyst_memory";
const DELETE_TOOL: &str = "search_and_delete_analyst_memory";

#[derive(Debug, Default, Deserialize)]
struct ReflectionParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    memory_id: String,
    #[serde(default)]
    analyst_id: String,
    #[serde(default)]
    new_content: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ReflectionDecision {
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    params: ReflectionParams,
}

impl StructuredOutput for ReflectionDecision {
    fn fallback() -> Self {
        Self {
            tool_name: "none".to_string(),
            params: ReflectionParams::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CentralDecision {
    #[serde(default)]
    operations: Vec<ReflectionDecision>,
}

impl StructuredOutput for CentralDecision {
    fn fallback() -> Self {
        Self { operations: vec![] }
    }
}

/// Bullish calls need the return above +0.5%, bearish below -0.5%, neutral
/// within the band.
pub fn prediction_correct(signal: Signal, actual_return: f64) -> bool {
    signal.matches_return(actual_return)
}

pub fn decision_correct(action: TradeAction, actual_return: f64) -> bool {
    prediction_correct(Signal::from_action(action), actual_return)
}

/// Post-day review: each agent (or a central pass) revises its episodic
/// memory against realized returns. Every executed or refused operation is
/// appended to the day's memory-operations log.
pub struct ReflectionEngine {
    services: Arc<ServiceRegistry>,
}

impl ReflectionEngine {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }

    pub async fn run_post_market(
        &self,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
    ) -> Vec<ReflectionOutcome> {
        let actual_returns = self.realized_returns(state).await;
        self.reflect_with_returns(state, decisions, &actual_returns)
            .await
    }

    /// Reflection pass over already-fetched realized returns. The driver uses
    /// this form so the same returns also feed the dashboard sink.
    pub async fn reflect_with_returns(
        &self,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        actual_returns: &BTreeMap<String, f64>,
    ) -> Vec<ReflectionOutcome> {
        info!(
            "Reflection: {} tickers with realized returns for {}",
            actual_returns.len(),
            state.trading_date
        );

        match self.services.settings.review_mode {
            ReviewMode::IndividualReview => {
                self.individual_review(state, decisions, actual_returns).await
            }
            ReviewMode::CentralReview => {
                self.central_review(state, decisions, actual_returns).await
            }
        }
    }

    /// Realized return: open to close of the trading day. Decisions are made
    /// pre-market at the open; the outcome is read at the close.
    pub async fn realized_returns(&self, state: &DayState) -> BTreeMap<String, f64> {
        let mut returns = BTreeMap::new();
        for ticker in &state.tickers {
            match self
                .services
                .market_data
                .prices(ticker, state.trading_date, state.trading_date)
                .await
            {
                Ok(bars) if !bars.is_empty() && bars[0].open > 0.0 => {
                    let bar = &bars[0];
                    returns.insert(ticker.clone(), bar.close / bar.open - 1.0);
                }
                _ => {
                    warn!(
                        "Reflection: no realized return for {} on {}",
                        ticker, state.trading_date
                    );
                }
            }
        }
        returns
    }

    async fn individual_review(
        &self,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        actual_returns: &BTreeMap<String, f64>,
    ) -> Vec<ReflectionOutcome> {
        // The PM's per-ticker outcome records land in memory before its own
        // reflection runs.
        self.write_pm_outcome_records(state, decisions, actual_returns)
            .await;

        let mut outcomes = Vec::new();
        let mut agent_ids: Vec<String> = self
            .services
            .settings
            .analyst_types
            .iter()
            .map(|t| t.agent_id())
            .collect();
        agent_ids.push(PORTFOLIO_MANAGER_ID.to_string());

        for agent_id in agent_ids {
            let prompt = self.build_reflection_prompt(&agent_id, state, decisions, actual_returns);
            let model = state.resolve_model(&agent_id);
            let decision: ReflectionDecision = self
                .services
                .gateway
                .call_structured(
                    &model,
                    vec![
                        ChatMessage::system(
                            "You review your own trading memory after the market closed.",
                        ),
                        ChatMessage::user(prompt),
                    ],
                    0.2,
                    None,
                )
                .await;

            let operations = self
                .execute_decision(&agent_id, decision, state, true)
                .await;
            outcomes.push(ReflectionOutcome {
                agent_id,
                operations,
            });
        }
        outcomes
    }

    async fn central_review(
        &self,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        actual_returns: &BTreeMap<String, f64>,
    ) -> Vec<ReflectionOutcome> {
        let prompt = format!(
            "You are the portfolio manager running the central end-of-day review for {}.\n\
             You may issue memory operations over any agent's archive.\n\n{}\n\
             Respond with JSON only:\n\
             {{\"operations\": [{{\"tool_name\": \"{UPDATE_TOOL}|{DELETE_TOOL}|none\",\n \
             \"params\": {{\"query\": \"...\", \"memory_id\": \"auto\", \"analyst_id\": \"...\",\n \
             \"new_content\": \"...\", \"reason\": \"...\"}}}}]}}",
            state.trading_date,
            self.performance_digest(state, decisions, actual_returns),
        );

        let model = state.resolve_model(PORTFOLIO_MANAGER_ID);
        let central: CentralDecision = self
            .services
            .gateway
            .call_structured(
                &model,
                vec![
                    ChatMessage::system("You run the central post-market memory review."),
                    ChatMessage::user(prompt),
                ],
                0.2,
                None,
            )
            .await;

        let mut operations = Vec::new();
        for decision in central.operations {
            // Central review is PM-scoped; ownership is intentionally not
            // enforced here.
            let target = if decision.params.analyst_id.is_empty() {
                PORTFOLIO_MANAGER_ID.to_string()
            } else {
                decision.params.analyst_id.clone()
            };
            operations.extend(self.execute_decision(&target, decision, state, false).await);
        }

        vec![ReflectionOutcome {
            agent_id: PORTFOLIO_MANAGER_ID.to_string(),
            operations,
        }]
    }

    async fn write_pm_outcome_records(
        &self,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        actual_returns: &BTreeMap<String, f64>,
    ) {
        for (ticker, decision) in decisions {
            let Some(actual) = actual_returns.get(ticker) else {
                continue;
            };
            let outcome = if decision_correct(decision.action, *actual) {
                "correct"
            } else {
                "incorrect"
            };

            let mut opinions = Vec::new();
            for (agent_id, output) in &state.analyst_signals {
                if let Some(map) = output.as_first_round() {
                    if let Some(signal) = map.get(ticker) {
                        opinions.push(format!("{agent_id}={}", signal.signal));
                    }
                }
            }

            let content = format!(
                "{date} {ticker} investment decision {action} signals: quantity {quantity}, \
                 confidence {confidence:.0}, actual return {actual:+.2}% -> {outcome}. \
                 Reasoning: {reasoning}. Analyst opinions: {opinions}.",
                date = state.trading_date,
                action = decision.action,
                quantity = decision.quantity,
                confidence = decision.confidence,
                actual = actual * 100.0,
                reasoning = decision.reasoning,
                opinions = opinions.join(", "),
            );

            let mut metadata = BTreeMap::new();
            metadata.insert("kind".to_string(), "decision_outcome".to_string());
            metadata.insert("ticker".to_string(), ticker.clone());
            metadata.insert("date".to_string(), state.trading_date.to_string());
            metadata.insert("outcome".to_string(), outcome.to_string());

            if let Err(e) = self
                .services
                .memory
                .add(content, PORTFOLIO_MANAGER_ID, metadata)
                .await
            {
                warn!("Reflection: failed to write PM outcome record: {}", e);
            }
        }
    }

    fn performance_digest(
        &self,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        actual_returns: &BTreeMap<String, f64>,
    ) -> String {
        let mut digest = String::new();
        for (ticker, decision) in decisions {
            let actual = actual_returns.get(ticker).copied();
            let verdict = actual
                .map(|a| {
                    if decision_correct(decision.action, a) {
                        "correct"
                    } else {
                        "incorrect"
                    }
                })
                .unwrap_or("unknown");
            digest.push_str(&format!(
                "- {ticker}: decided {} ({:.0}), actual {} -> {verdict}\n",
                decision.action,
                decision.confidence,
                actual
                    .map(|a| format!("{:+.2}%", a * 100.0))
                    .unwrap_or_else(|| "n/a".to_string()),
            ));
        }

        for (agent_id, output) in &state.analyst_signals {
            if let Some(map) = output.as_first_round() {
                for (ticker, signal) in map {
                    let verdict = actual_returns
                        .get(ticker)
                        .map(|a| {
                            if prediction_correct(signal.signal, *a) {
                                "correct"
                            } else {
                                "incorrect"
                            }
                        })
                        .unwrap_or("unknown");
                    digest.push_str(&format!(
                        "- {agent_id}: {ticker} {} ({:.0}) -> {verdict}\n",
                        signal.signal, signal.confidence
                    ));
                }
            }
        }
        digest
    }

    fn build_reflection_prompt(
        &self,
        agent_id: &str,
        state: &DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        actual_returns: &BTreeMap<String, f64>,
    ) -> String {
        format!(
            "You are {agent_id} reviewing your performance for {date}.\n\n\
             Today's outcomes:\n{digest}\n\
             You may do nothing, or issue exactly one memory operation on YOUR OWN \
             archive:\n\
             - {UPDATE_TOOL}: params query, memory_id (use \"auto\"), \
             analyst_id (must be \"{agent_id}\"), new_content, reason\n\
             - {DELETE_TOOL}: params query, memory_id (use \"auto\"), \
             analyst_id (must be \"{agent_id}\"), reason\n\n\
             Good performance: do nothing. Mixed: consider updating a memory. \
             Poor: consider deleting a misleading memory. Respond with JSON only:\n\
             {{\"tool_name\": \"{UPDATE_TOOL}|{DELETE_TOOL}|none\",\n \
             \"params\": {{\"query\": \"...\", \"memory_id\": \"auto\",\n \
             \"analyst_id\": \"{agent_id}\", \"new_content\": \"...\", \"reason\": \"...\"}}}}",
            date = state.trading_date,
            digest = self.performance_digest(state, decisions, actual_returns),
        )
    }

    /// Executes one reflection decision. With `enforce_ownership`, an op whose
    /// `analyst_id` differs from the reflected agent is refused (logged, not
    /// executed).
    async fn execute_decision(
        &self,
        agent_id: &str,
        decision: ReflectionDecision,
        state: &DayState,
        enforce_ownership: bool,
    ) -> Vec<MemoryOpRecord> {
        let tool_name = decision.tool_name.to_lowercase();
        let is_update = tool_name.contains("update");
        let is_delete = tool_name.contains("delete");
        if !is_update && !is_delete {
            return vec![];
        }

        let args = serde_json::json!({
            "query": decision.params.query,
            "memory_id": decision.params.memory_id,
            "analyst_id": decision.params.analyst_id,
            "new_content": decision.params.new_content,
            "reason": decision.params.reason,
        });

        if enforce_ownership && decision.params.analyst_id != agent_id {
            warn!(
                "Reflection: refusing {} for {}: op targets '{}'",
                tool_name, agent_id, decision.params.analyst_id
            );
            let record = MemoryOpRecord {
                timestamp: Utc::now(),
                agent_id: agent_id.to_string(),
                operation_type: "refused".to_string(),
                tool_name: decision.tool_name.clone(),
                args,
                result: format!(
                    "refused: analyst_id '{}' does not match reflecting agent '{}'",
                    decision.params.analyst_id, agent_id
                ),
                context: format!("individual_review {}", state.trading_date),
            };
            self.log_operation(state, &record);
            return vec![record];
        }

        let target_agent = &decision.params.analyst_id;
        let found = self
            .services
            .memory
            .search(&decision.params.query, target_agent, 1)
            .await;

        let (operation_type, result) = match found {
            Ok(records) if !records.is_empty() => {
                let record_id = records[0].id.clone();
                if is_delete {
                    match self.services.memory.delete(&record_id).await {
                        Ok(()) => ("delete".to_string(), format!("deleted {record_id}")),
                        Err(e) => ("delete".to_string(), format!("error: {e}")),
                    }
                } else {
                    match self
                        .services
                        .memory
                        .update(&record_id, decision.params.new_content.clone(), None)
                        .await
                    {
                        Ok(()) => ("update".to_string(), format!("updated {record_id}")),
                        Err(e) => ("update".to_string(), format!("error: {e}")),
                    }
                }
            }
            Ok(_) => (
                if is_delete { "delete" } else { "update" }.to_string(),
                "error: no matching memory record".to_string(),
            ),
            Err(e) => (
                if is_delete { "delete" } else { "update" }.to_string(),
                format!("error: {e}"),
            ),
        };

        let record = MemoryOpRecord {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            operation_type,
            tool_name: decision.tool_name.clone(),
            args,
            result,
            context: format!("{:?} {}", self.services.settings.review_mode, state.trading_date),
        };
        self.log_operation(state, &record);
        vec![record]
    }

    fn log_operation(&self, state: &DayState, record: &MemoryOpRecord) {
        if let Err(e) = self
            .services
            .persistence
            .append_memory_op(state.trading_date, record)
        {
            warn!("Reflection: failed to log memory op: {}", e);
        }
    }
}
