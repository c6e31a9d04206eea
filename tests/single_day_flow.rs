mod support;

use quorumtrade::application::agents::persona::AnalystType;
use quorumtrade::application::orchestrator::{DayOrchestrator, DayRunConfig};
use quorumtrade::domain::state::{ApiKeys, EngineMode, ModelMetadata};
use quorumtrade::domain::types::{AgentOutput, RiskAssessment, RiskLevel, Signal, TradeAction};
use support::{add_happy_path_rules, build_harness, seed_bars, trading_date};

fn day_config(mode: EngineMode) -> DayRunConfig {
    DayRunConfig {
        date: trading_date(),
        tickers: vec!["AAPL".to_string()],
        mode,
        is_live_mode: false,
        api_keys: ApiKeys::default(),
        models: ModelMetadata::default(),
        portfolio: None,
    }
}

/// Two agreeing analysts in signal mode: the pipeline completes, the signal
/// map holds exactly the expected keys, and the PM goes long with real
/// conviction.
#[tokio::test(start_paused = true)]
async fn two_agreeing_analysts_produce_a_long_call() {
    let harness = build_harness(
        "single-day",
        vec![AnalystType::Fundamental, AnalystType::Technical],
        false,
        None,
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    // Flat, calm prices: low volatility, so the risk manager reads low risk.
    seed_bars(&harness.market, "AAPL", trading_date(), 100.0, 100.0);

    let orchestrator = DayOrchestrator::new(harness.services.clone());
    let outcome = orchestrator
        .run_day(day_config(EngineMode::Signal))
        .await
        .expect("day should complete");

    let keys: Vec<&str> = outcome
        .state
        .analyst_signals
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        keys,
        vec![
            "fundamental_analyst_agent",
            "fundamental_analyst_agent_round2",
            "risk_manager",
            "technical_analyst_agent",
            "technical_analyst_agent_round2",
        ]
    );

    // Causal ordering: every round-2 payload has its round-1 counterpart.
    for key in outcome.state.analyst_signals.keys() {
        if let Some(base) = key.strip_suffix("_round2") {
            assert!(
                outcome
                    .state
                    .analyst_signals
                    .get(base)
                    .and_then(AgentOutput::as_first_round)
                    .is_some(),
                "round 2 present without round 1 for {base}"
            );
        }
    }

    // Both analysts agree bullish at 80.
    for agent in ["fundamental_analyst_agent", "technical_analyst_agent"] {
        let round2 = outcome.state.analyst_signals[&format!("{agent}_round2")]
            .as_second_round()
            .unwrap();
        assert_eq!(round2.analyst_id, agent);
        assert_eq!(round2.ticker_signals[0].signal, Signal::Bullish);
        assert_eq!(round2.ticker_signals[0].confidence, 80.0);
    }

    let risk = outcome.state.analyst_signals["risk_manager"]
        .as_risk()
        .unwrap();
    match &risk["AAPL"] {
        RiskAssessment::Basic(basic) => {
            assert_eq!(basic.risk_level, RiskLevel::Low);
            assert_eq!(basic.current_price, 100.0);
        }
        other => panic!("expected basic risk assessment, got {other:?}"),
    }

    let decision = &outcome.final_decisions["AAPL"];
    assert_eq!(decision.action, TradeAction::Long);
    assert!(decision.confidence >= 60.0);
    // Direction mode: no share quantities.
    assert_eq!(decision.quantity, 0);
    assert!(!outcome.trades_deferred);
    assert!(outcome.execution.is_none());
}

/// The full analyst set is accounted for: every configured analyst is either
/// fully merged or explicitly marked failed, never partially present.
#[tokio::test(start_paused = true)]
async fn portfolio_manager_never_sees_a_partial_analyst_set() {
    let harness = build_harness(
        "partial-set",
        vec![AnalystType::Fundamental, AnalystType::Technical, AnalystType::Sentiment],
        false,
        None,
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    seed_bars(&harness.market, "AAPL", trading_date(), 100.0, 100.0);

    let orchestrator = DayOrchestrator::new(harness.services.clone());
    let outcome = orchestrator
        .run_day(day_config(EngineMode::Signal))
        .await
        .unwrap();

    for analyst in [
        AnalystType::Fundamental,
        AnalystType::Technical,
        AnalystType::Sentiment,
    ] {
        let output = outcome
            .state
            .analyst_signals
            .get(&analyst.agent_id())
            .expect("analyst key present");
        match output {
            AgentOutput::FirstRound(map) => assert!(!map.is_empty()),
            AgentOutput::Failed(failure) => {
                assert!(failure.status == "error" || failure.status == "no_result");
            }
            other => panic!("unexpected shape for {}: {other:?}", analyst.agent_id()),
        }
    }
}

/// Identical inputs and a deterministic model stub give identical day
/// results, modulo clock-stamped fields.
#[tokio::test(start_paused = true)]
async fn orchestration_is_idempotent_with_deterministic_stub() {
    let harness = build_harness(
        "idempotent",
        vec![AnalystType::Fundamental, AnalystType::Technical],
        false,
        None,
    );
    add_happy_path_rules(&harness.provider, "AAPL");
    seed_bars(&harness.market, "AAPL", trading_date(), 100.0, 100.0);

    let orchestrator = DayOrchestrator::new(harness.services.clone());
    let first = orchestrator
        .run_day(day_config(EngineMode::Signal))
        .await
        .unwrap();
    let second = orchestrator
        .run_day(day_config(EngineMode::Signal))
        .await
        .unwrap();

    let decisions_first = serde_json::to_value(&first.final_decisions).unwrap();
    let decisions_second = serde_json::to_value(&second.final_decisions).unwrap();
    assert_eq!(decisions_first, decisions_second);

    let mut signals_first = serde_json::to_value(&first.state.analyst_signals).unwrap();
    let mut signals_second = serde_json::to_value(&second.state.analyst_signals).unwrap();
    // Round-2 payloads carry a wall-clock timestamp; everything else must be
    // byte-identical.
    for value in [&mut signals_first, &mut signals_second] {
        if let serde_json::Value::Object(map) = value {
            for entry in map.values_mut() {
                if let serde_json::Value::Object(inner) = entry {
                    inner.remove("timestamp");
                }
            }
        }
    }
    assert_eq!(signals_first, signals_second);
    assert_eq!(first.state.current_prices, second.state.current_prices);
}
