use crate::application::gateway::{ModelGateway, StructuredOutput};
use crate::application::memory::MemoryStore;
use crate::domain::llm::ChatMessage;
use crate::domain::state::DayState;
use crate::domain::types::{
    AgentOutput, CommunicationDecision, CommunicationLogs, CommunicationType, PortfolioDecision,
    Signal, SignalAdjustment, Transcript, TranscriptTurn, clamp_confidence,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::agents::portfolio_manager::PORTFOLIO_MANAGER_ID;

/// Tunables for the post-analysis communication phase. `max_rounds` bounds
/// the dialog loop per chat and is honored wherever it is surfaced.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_cycles: u32,
    pub max_chars: usize,
    pub max_rounds: u32,
    pub memory_top_k: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_cycles: 2,
            max_chars: 400,
            max_rounds: 1,
            memory_top_k: 3,
        }
    }
}

/// Result of the communication phase. The coordinator is a pure function
/// over `(state, pm_decisions)`: it returns the revised signal entries and a
/// flag; the orchestrator owns the PM re-invocation.
#[derive(Debug)]
pub struct CommunicationOutcome {
    pub updated_signals: BTreeMap<String, AgentOutput>,
    pub should_reinvoke_pm: bool,
    pub logs: CommunicationLogs,
}

#[derive(Debug, Deserialize)]
struct RawCommunicationDecision {
    should_communicate: bool,
    #[serde(default)]
    communication_type: String,
    #[serde(default)]
    target_analysts: Vec<String>,
    #[serde(default)]
    discussion_topic: String,
    #[serde(default)]
    reasoning: String,
}

impl StructuredOutput for RawCommunicationDecision {
    fn fallback() -> Self {
        Self {
            should_communicate: false,
            communication_type: "none".to_string(),
            target_analysts: vec![],
            discussion_topic: String::new(),
            reasoning: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    query: String,
}

impl StructuredOutput for MemoryQuery {
    fn fallback() -> Self {
        Self {
            query: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAdjustedSignal {
    ticker: String,
    signal: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct AnalystReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    signal_adjustment: bool,
    #[serde(default)]
    adjusted_signal: Option<RawAdjustedSignal>,
}

impl StructuredOutput for AnalystReply {
    fn fallback() -> Self {
        Self {
            response: String::new(),
            signal_adjustment: false,
            adjusted_signal: None,
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Decides whether post-analysis communication is needed and runs the
/// private-chat / meeting loops.
pub struct CommunicationCoordinator {
    gateway: Arc<ModelGateway>,
    memory: Arc<MemoryStore>,
    settings: ChatSettings,
}

impl CommunicationCoordinator {
    pub fn new(gateway: Arc<ModelGateway>, memory: Arc<MemoryStore>, settings: ChatSettings) -> Self {
        Self {
            gateway,
            memory,
            settings,
        }
    }

    pub async fn run(
        &self,
        state: &DayState,
        pm_decisions: &BTreeMap<String, PortfolioDecision>,
    ) -> CommunicationOutcome {
        let mut working_signals = state.analyst_signals.clone();
        let mut logs = CommunicationLogs::default();
        let mut any_adjustments = false;

        for cycle in 0..self.settings.max_cycles {
            let decision = self.decide(state, &working_signals, pm_decisions).await;
            logs.communication_decisions.push(decision.clone());

            if !decision.should_communicate
                || decision.communication_type == CommunicationType::None
            {
                debug!("Communication: cycle {} decided no further discussion", cycle + 1);
                break;
            }

            let targets: Vec<String> = decision
                .target_analysts
                .iter()
                .filter(|id| working_signals.contains_key(*id))
                .cloned()
                .collect();
            if targets.is_empty() {
                debug!("Communication: cycle {} named no known analysts", cycle + 1);
                break;
            }

            let mut cycle_adjustments = 0usize;
            match decision.communication_type {
                CommunicationType::PrivateChat => {
                    for analyst_id in &targets {
                        let transcript = self
                            .run_private_chat(
                                state,
                                &mut working_signals,
                                analyst_id,
                                &decision.discussion_topic,
                            )
                            .await;
                        cycle_adjustments += transcript.signal_adjustments.len();
                        logs.private_chats.push(transcript);
                    }
                }
                CommunicationType::Meeting => {
                    let transcript = self
                        .run_meeting(state, &mut working_signals, &targets, &decision.discussion_topic)
                        .await;
                    cycle_adjustments += transcript.signal_adjustments.len();
                    logs.meetings.push(transcript);
                }
                CommunicationType::None => break,
            }

            if cycle_adjustments == 0 {
                debug!("Communication: cycle {} made no adjustments, stopping", cycle + 1);
                break;
            }
            any_adjustments = true;
        }

        info!(
            "Communication: {} chats, {} meetings, reinvoke_pm={}",
            logs.private_chats.len(),
            logs.meetings.len(),
            any_adjustments
        );

        CommunicationOutcome {
            updated_signals: working_signals,
            should_reinvoke_pm: any_adjustments,
            logs,
        }
    }

    async fn decide(
        &self,
        state: &DayState,
        working_signals: &BTreeMap<String, AgentOutput>,
        pm_decisions: &BTreeMap<String, PortfolioDecision>,
    ) -> CommunicationDecision {
        let mut signal_summary = String::new();
        for (agent_id, output) in working_signals {
            if let Some(map) = output.as_first_round() {
                for (ticker, signal) in map {
                    signal_summary.push_str(&format!(
                        "- {agent_id}: {ticker} {} ({:.0})\n",
                        signal.signal, signal.confidence
                    ));
                }
            }
        }
        let mut decision_summary = String::new();
        for (ticker, decision) in pm_decisions {
            decision_summary.push_str(&format!(
                "- {ticker}: {} qty {} ({:.0})\n",
                decision.action, decision.quantity, decision.confidence
            ));
        }

        let analyst_ids: Vec<String> = working_signals
            .keys()
            .filter(|id| !id.ends_with("_round2") && *id != "risk_manager")
            .cloned()
            .collect();

        let prompt = format!(
            "You are the portfolio manager reviewing today's analyses before committing.\n\n\
             Analyst signals:\n{signal_summary}\n\
             Your provisional decisions:\n{decision_summary}\n\
             Available analysts: {}\n\n\
             Is a private chat or a group meeting needed to resolve disagreements or \
             verify weak points? Respond with JSON only:\n\
             {{\"should_communicate\": true|false,\n \
             \"communication_type\": \"private_chat|meeting|none\",\n \
             \"target_analysts\": [\"...\"], \"discussion_topic\": \"...\", \"reasoning\": \"...\"}}",
            analyst_ids.join(", "),
        );

        let model = state.resolve_model(PORTFOLIO_MANAGER_ID);
        let raw: RawCommunicationDecision = self
            .gateway
            .call_structured(
                &model,
                vec![
                    ChatMessage::system("You decide whether inter-agent communication is needed."),
                    ChatMessage::user(prompt),
                ],
                0.2,
                None,
            )
            .await;

        CommunicationDecision {
            should_communicate: raw.should_communicate,
            communication_type: match raw.communication_type.to_lowercase().as_str() {
                "private_chat" => CommunicationType::PrivateChat,
                "meeting" => CommunicationType::Meeting,
                _ => CommunicationType::None,
            },
            target_analysts: raw.target_analysts,
            discussion_topic: raw.discussion_topic,
            reasoning: raw.reasoning,
        }
    }

    /// Two-stage memory retrieval: the model writes the search query for the
    /// analyst, then the store is searched with it.
    async fn retrieve_memories(&self, state: &DayState, analyst_id: &str, topic: &str) -> String {
        let model = state.resolve_model(analyst_id);
        let query_prompt = format!(
            "You are {analyst_id} preparing for a discussion about: {topic}\n\
             Write one short search query for your own memory archive that would surface \
             the most relevant past experience. Respond with JSON only: {{\"query\": \"...\"}}",
        );
        let generated: MemoryQuery = self
            .gateway
            .call_structured(
                &model,
                vec![ChatMessage::user(query_prompt)],
                0.2,
                None,
            )
            .await;

        let query = if generated.query.is_empty() {
            topic.to_string()
        } else {
            generated.query
        };

        match self
            .memory
            .search(&query, analyst_id, self.settings.memory_top_k)
            .await
        {
            Ok(records) if !records.is_empty() => records
                .iter()
                .map(|r| format!("- {}", r.content))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "(no relevant memories)".to_string(),
        }
    }

    async fn analyst_turn(
        &self,
        state: &DayState,
        analyst_id: &str,
        topic: &str,
        conversation: &str,
        memories: &str,
    ) -> AnalystReply {
        let model = state.resolve_model(analyst_id);
        let prompt = format!(
            "You are {analyst_id} in a discussion with the portfolio manager.\n\
             Topic: {topic}\n\n\
             Conversation so far:\n{conversation}\n\
             Your relevant memories:\n{memories}\n\n\
             Reply in at most {max_chars} characters. If the discussion changes your view \
             on a ticker, set signal_adjustment and include the revised signal. \
             Respond with JSON only:\n\
             {{\"response\": \"...\", \"signal_adjustment\": true|false,\n \
             \"adjusted_signal\": {{\"ticker\": \"...\", \"signal\": \"bullish|bearish|neutral\",\n \
             \"confidence\": 0-100, \"reasoning\": \"...\"}}}}",
            max_chars = self.settings.max_chars,
        );

        self.gateway
            .call_structured(
                &model,
                vec![
                    ChatMessage::system("You are an analyst defending or revising your signals."),
                    ChatMessage::user(prompt),
                ],
                0.3,
                None,
            )
            .await
    }

    async fn pm_turn(&self, state: &DayState, topic: &str, conversation: &str) -> String {
        let model = state.resolve_model(PORTFOLIO_MANAGER_ID);
        let prompt = format!(
            "You are the portfolio manager leading a discussion.\n\
             Topic: {topic}\n\nConversation so far:\n{conversation}\n\
             Ask your next question or challenge (at most {} characters).",
            self.settings.max_chars,
        );
        match self
            .gateway
            .call(&model, vec![ChatMessage::user(prompt)], 0.3, None)
            .await
        {
            Ok(response) => truncate_chars(response.content.trim(), self.settings.max_chars),
            Err(_) => format!("Walk me through your reasoning on {topic}."),
        }
    }

    fn apply_adjustment(
        working_signals: &mut BTreeMap<String, AgentOutput>,
        analyst_id: &str,
        raw: &RawAdjustedSignal,
    ) -> Option<SignalAdjustment> {
        let signal = Signal::parse_loose(&raw.signal);
        let confidence = clamp_confidence(raw.confidence);
        let mut applied = false;

        if let Some(AgentOutput::FirstRound(map)) = working_signals.get_mut(analyst_id) {
            if let Some(entry) = map.get_mut(&raw.ticker) {
                entry.signal = signal;
                entry.confidence = confidence;
                entry.reasoning = raw.reasoning.clone();
                applied = true;
            }
        }
        let round2_key = format!("{analyst_id}_round2");
        if let Some(AgentOutput::SecondRound(analysis)) = working_signals.get_mut(&round2_key) {
            for entry in &mut analysis.ticker_signals {
                if entry.ticker == raw.ticker {
                    entry.signal = signal;
                    entry.confidence = confidence;
                    entry.reasoning = raw.reasoning.clone();
                    applied = true;
                }
            }
        }

        applied.then(|| SignalAdjustment {
            analyst_id: analyst_id.to_string(),
            ticker: raw.ticker.clone(),
            signal,
            confidence,
            reasoning: raw.reasoning.clone(),
        })
    }

    async fn run_private_chat(
        &self,
        state: &DayState,
        working_signals: &mut BTreeMap<String, AgentOutput>,
        analyst_id: &str,
        topic: &str,
    ) -> Transcript {
        let mut transcript = Transcript {
            topic: topic.to_string(),
            participants: vec![PORTFOLIO_MANAGER_ID.to_string(), analyst_id.to_string()],
            turns: vec![],
            signal_adjustments: vec![],
        };
        let mut conversation = String::new();

        for round in 1..=self.settings.max_rounds {
            let question = self.pm_turn(state, topic, &conversation).await;
            conversation.push_str(&format!("{PORTFOLIO_MANAGER_ID}: {question}\n"));
            transcript.turns.push(TranscriptTurn {
                speaker: PORTFOLIO_MANAGER_ID.to_string(),
                content: question,
                round,
                timestamp: Utc::now(),
            });

            let memories = self.retrieve_memories(state, analyst_id, topic).await;
            let reply = self
                .analyst_turn(state, analyst_id, topic, &conversation, &memories)
                .await;
            let response = truncate_chars(&reply.response, self.settings.max_chars);
            conversation.push_str(&format!("{analyst_id}: {response}\n"));
            transcript.turns.push(TranscriptTurn {
                speaker: analyst_id.to_string(),
                content: response,
                round,
                timestamp: Utc::now(),
            });

            if reply.signal_adjustment {
                if let Some(raw) = &reply.adjusted_signal {
                    if let Some(adjustment) =
                        Self::apply_adjustment(working_signals, analyst_id, raw)
                    {
                        info!(
                            "Communication: {} adjusted {} to {}",
                            analyst_id, adjustment.ticker, adjustment.signal
                        );
                        transcript.signal_adjustments.push(adjustment);
                    }
                }
            }
        }

        self.persist_transcript(&transcript).await;
        transcript
    }

    async fn run_meeting(
        &self,
        state: &DayState,
        working_signals: &mut BTreeMap<String, AgentOutput>,
        targets: &[String],
        topic: &str,
    ) -> Transcript {
        let mut participants = vec![PORTFOLIO_MANAGER_ID.to_string()];
        participants.extend(targets.iter().cloned());
        let mut transcript = Transcript {
            topic: topic.to_string(),
            participants,
            turns: vec![],
            signal_adjustments: vec![],
        };
        let mut conversation = String::new();

        for round in 1..=self.settings.max_rounds {
            for analyst_id in targets {
                let memories = self.retrieve_memories(state, analyst_id, topic).await;
                let reply = self
                    .analyst_turn(state, analyst_id, topic, &conversation, &memories)
                    .await;
                let statement = truncate_chars(&reply.response, self.settings.max_chars);
                conversation.push_str(&format!("{analyst_id}: {statement}\n"));
                transcript.turns.push(TranscriptTurn {
                    speaker: analyst_id.to_string(),
                    content: statement,
                    round,
                    timestamp: Utc::now(),
                });

                if reply.signal_adjustment {
                    if let Some(raw) = &reply.adjusted_signal {
                        if let Some(adjustment) =
                            Self::apply_adjustment(working_signals, analyst_id, raw)
                        {
                            transcript.signal_adjustments.push(adjustment);
                        }
                    }
                }
            }
        }

        // Closing summary by the chair.
        let summary = self.pm_turn(state, topic, &conversation).await;
        transcript.turns.push(TranscriptTurn {
            speaker: PORTFOLIO_MANAGER_ID.to_string(),
            content: summary,
            round: self.settings.max_rounds,
            timestamp: Utc::now(),
        });

        self.persist_transcript(&transcript).await;
        transcript
    }

    /// Writes the concatenated transcript to every participant's memory.
    async fn persist_transcript(&self, transcript: &Transcript) {
        let text = transcript
            .turns
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker, turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        let content = format!("Discussion '{}':\n{}", transcript.topic, text);

        for participant in &transcript.participants {
            let mut metadata = BTreeMap::new();
            metadata.insert("kind".to_string(), "communication".to_string());
            metadata.insert("topic".to_string(), transcript.topic.clone());
            if let Err(e) = self
                .memory
                .add(content.clone(), participant.clone(), metadata)
                .await
            {
                tracing::warn!(
                    "Communication: failed to persist transcript for {}: {}",
                    participant,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{
        FirstRoundSignal, SynthesisDetails, ToolAnalysis, ToolSelectionSummary,
    };

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello");
        assert_eq!(truncate_chars("héllö wörld", 6), "héllö ");
    }

    #[test]
    fn adjustment_applies_to_both_rounds() {
        let mut signals = BTreeMap::new();
        let mut round1 = BTreeMap::new();
        round1.insert(
            "AAPL".to_string(),
            FirstRoundSignal {
                ticker: "AAPL".to_string(),
                signal: Signal::Bullish,
                confidence: 80.0,
                reasoning: "initial".to_string(),
                tool_selection: ToolSelectionSummary {
                    strategy: "s".to_string(),
                    selected_tools: vec![],
                    count: 0,
                },
                tool_analysis: ToolAnalysis {
                    tool_results: vec![],
                    successful: 0,
                    failed: 0,
                    synthesis_details: SynthesisDetails {
                        tool_impact_analysis: BTreeMap::new(),
                        synthesis_method: "llm_weighted".to_string(),
                    },
                },
                metadata: BTreeMap::new(),
            },
        );
        signals.insert(
            "technical_analyst_agent".to_string(),
            AgentOutput::FirstRound(round1),
        );

        let raw = RawAdjustedSignal {
            ticker: "AAPL".to_string(),
            signal: "bearish".to_string(),
            confidence: 65.0,
            reasoning: "changed my mind".to_string(),
        };
        let adjustment = CommunicationCoordinator::apply_adjustment(
            &mut signals,
            "technical_analyst_agent",
            &raw,
        )
        .expect("adjustment applies");

        assert_eq!(adjustment.signal, Signal::Bearish);
        let updated = signals["technical_analyst_agent"].as_first_round().unwrap();
        assert_eq!(updated["AAPL"].signal, Signal::Bearish);
        assert_eq!(updated["AAPL"].confidence, 65.0);
    }

    #[test]
    fn adjustment_for_unknown_ticker_is_dropped() {
        let mut signals = BTreeMap::new();
        signals.insert(
            "technical_analyst_agent".to_string(),
            AgentOutput::FirstRound(BTreeMap::new()),
        );
        let raw = RawAdjustedSignal {
            ticker: "MSFT".to_string(),
            signal: "bullish".to_string(),
            confidence: 60.0,
            reasoning: String::new(),
        };
        assert!(
            CommunicationCoordinator::apply_adjustment(
                &mut signals,
                "technical_analyst_agent",
                &raw
            )
            .is_none()
        );
    }
}
