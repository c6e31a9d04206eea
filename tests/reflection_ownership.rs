mod support;

use quorumtrade::application::agents::persona::AnalystType;
use quorumtrade::application::reflection::ReflectionEngine;
use quorumtrade::domain::state::{DayState, EngineMode};
use quorumtrade::domain::types::{
    AgentOutput, FirstRoundSignal, PortfolioDecision, Signal, SynthesisDetails, ToolAnalysis,
    ToolSelectionSummary, TradeAction,
};
use std::collections::BTreeMap;
use support::{build_harness, seed_bars, trading_date};

fn first_round_signal(ticker: &str, signal: Signal) -> FirstRoundSignal {
    FirstRoundSignal {
        ticker: ticker.to_string(),
        signal,
        confidence: 70.0,
        reasoning: "view".to_string(),
        tool_selection: ToolSelectionSummary {
            strategy: "s".to_string(),
            selected_tools: vec!["analyze_momentum".to_string()],
            count: 1,
        },
        tool_analysis: ToolAnalysis {
            tool_results: vec![],
            successful: 1,
            failed: 0,
            synthesis_details: SynthesisDetails {
                tool_impact_analysis: BTreeMap::new(),
                synthesis_method: "llm_weighted".to_string(),
            },
        },
        metadata: BTreeMap::new(),
    }
}

/// A reflection op whose `analyst_id` names another agent is refused: it is
/// logged but the memory store is never touched.
#[tokio::test(start_paused = true)]
async fn cross_agent_memory_delete_is_refused() {
    let harness = build_harness(
        "reflection-ownership",
        vec![AnalystType::Fundamental, AnalystType::Technical],
        false,
        None,
    );
    seed_bars(&harness.market, "AAPL", trading_date(), 100.0, 102.0);

    // The technical analyst tries to delete a fundamental-analyst memory.
    harness.provider.add_rule(
        "You are technical_analyst_agent reviewing",
        r#"{"tool_name": "search_and_delete_analyst_memory",
            "params": {"query": "AAPL lessons", "memory_id": "auto",
            "analyst_id": "fundamental_analyst_agent", "reason": "sabotage"}}"#,
    );
    harness.provider.add_rule(
        "reviewing your performance",
        r#"{"tool_name": "none", "params": {}}"#,
    );

    // Seed the record the rogue op targets.
    harness
        .services
        .memory
        .add(
            "AAPL lessons learned from earnings season",
            "fundamental_analyst_agent",
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(harness.memory_backend.len().await, 1);

    let mut state = DayState::new(
        trading_date(),
        vec!["AAPL".to_string()],
        EngineMode::Signal,
        false,
    );
    let mut round1 = BTreeMap::new();
    round1.insert("AAPL".to_string(), first_round_signal("AAPL", Signal::Bullish));
    state.analyst_signals.insert(
        "technical_analyst_agent".to_string(),
        AgentOutput::FirstRound(round1),
    );

    let mut decisions = BTreeMap::new();
    decisions.insert(
        "AAPL".to_string(),
        PortfolioDecision {
            action: TradeAction::Long,
            quantity: 0,
            confidence: 70.0,
            reasoning: "test".to_string(),
        },
    );

    let engine = ReflectionEngine::new(harness.services.clone());
    let outcomes = engine.run_post_market(&state, &decisions).await;

    // The record survived untouched, under the rightful owner. (The PM's
    // own outcome records land under portfolio_manager, not here.)
    let records = harness
        .memory_backend
        .records_for("fundamental_analyst_agent")
        .await;
    assert_eq!(records.len(), 1);
    assert!(records[0].content.contains("AAPL lessons"));

    // The attempt was logged as refused.
    let technical = outcomes
        .iter()
        .find(|o| o.agent_id == "technical_analyst_agent")
        .unwrap();
    assert_eq!(technical.operations.len(), 1);
    assert_eq!(technical.operations[0].operation_type, "refused");
    assert!(technical.operations[0].result.contains("does not match"));

    let log = std::fs::read_to_string(
        harness.services.persistence.memory_ops_path(trading_date()),
    )
    .expect("memory ops log written");
    assert!(log.contains("refused"));
    assert!(log.contains("technical_analyst_agent"));
}

/// A well-formed self-targeted update goes through and lands in the log.
#[tokio::test(start_paused = true)]
async fn self_targeted_update_is_executed() {
    let harness = build_harness(
        "reflection-update",
        vec![AnalystType::Technical],
        false,
        None,
    );
    seed_bars(&harness.market, "AAPL", trading_date(), 100.0, 102.0);

    harness.provider.add_rule(
        "You are technical_analyst_agent reviewing",
        r#"{"tool_name": "search_and_update_analyst_memory",
            "params": {"query": "AAPL momentum lesson", "memory_id": "auto",
            "analyst_id": "technical_analyst_agent",
            "new_content": "AAPL momentum lesson: revised after a good call",
            "reason": "confirmed"}}"#,
    );
    harness.provider.add_rule(
        "reviewing your performance",
        r#"{"tool_name": "none", "params": {}}"#,
    );

    harness
        .services
        .memory
        .add(
            "AAPL momentum lesson: stale take",
            "technical_analyst_agent",
            BTreeMap::new(),
        )
        .await
        .unwrap();

    let mut state = DayState::new(
        trading_date(),
        vec!["AAPL".to_string()],
        EngineMode::Signal,
        false,
    );
    let mut round1 = BTreeMap::new();
    round1.insert("AAPL".to_string(), first_round_signal("AAPL", Signal::Bullish));
    state.analyst_signals.insert(
        "technical_analyst_agent".to_string(),
        AgentOutput::FirstRound(round1),
    );

    let engine = ReflectionEngine::new(harness.services.clone());
    let outcomes = engine.run_post_market(&state, &BTreeMap::new()).await;

    let technical = outcomes
        .iter()
        .find(|o| o.agent_id == "technical_analyst_agent")
        .unwrap();
    assert_eq!(technical.operations[0].operation_type, "update");
    assert!(technical.operations[0].result.starts_with("updated"));

    let records = harness
        .memory_backend
        .records_for("technical_analyst_agent")
        .await;
    assert_eq!(records.len(), 1);
    assert!(records[0].content.contains("revised after a good call"));
}
