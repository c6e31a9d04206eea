#![allow(dead_code)]

use chrono::NaiveDate;
use quorumtrade::application::agents::persona::{AnalystType, PersonaCatalog};
use quorumtrade::application::gateway::ModelGateway;
use quorumtrade::application::memory::MemoryStore;
use quorumtrade::application::services::{EngineSettings, ServiceRegistry};
use quorumtrade::domain::llm::Provider;
use quorumtrade::domain::ports::{DashboardSink, ExchangeCalendar};
use quorumtrade::infrastructure::calendar::WeekdayCalendar;
use quorumtrade::infrastructure::mock::{FixtureMarketData, ScriptedChatProvider, make_bars};
use quorumtrade::infrastructure::{InMemoryMemoryBackend, PersistenceService};
use std::path::PathBuf;
use std::sync::Arc;

pub fn temp_base(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("quorumtrade-{tag}-{}", uuid::Uuid::new_v4()))
}

pub fn trading_date() -> NaiveDate {
    // A Monday.
    NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
}

/// Fills the fixture with weekday bars covering a generous lookback through
/// `end`, with constant open/close per bar.
pub fn seed_bars(market: &FixtureMarketData, ticker: &str, end: NaiveDate, open: f64, close: f64) {
    let start = end.checked_sub_days(chrono::Days::new(240)).unwrap();
    market.set_bars(ticker, make_bars(ticker, start, end, |_| (open, close)));
}

pub struct TestHarness {
    pub services: Arc<ServiceRegistry>,
    pub provider: Arc<ScriptedChatProvider>,
    pub market: Arc<FixtureMarketData>,
    pub memory_backend: Arc<InMemoryMemoryBackend>,
    pub base_dir: PathBuf,
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.base_dir).ok();
    }
}

pub fn build_harness(
    tag: &str,
    analyst_types: Vec<AnalystType>,
    enable_communications: bool,
    dashboard: Option<Arc<dyn DashboardSink>>,
) -> TestHarness {
    let provider = Arc::new(ScriptedChatProvider::new());
    let market = Arc::new(FixtureMarketData::empty());
    let memory_backend = Arc::new(InMemoryMemoryBackend::new());
    let base_dir = temp_base(tag);

    let gateway = Arc::new(
        ModelGateway::new().with_provider(Provider::OpenAi, provider.clone()),
    );
    let settings = EngineSettings {
        analyst_types,
        enable_communications,
        enable_notifications: true,
        ..EngineSettings::default()
    };

    let services = Arc::new(ServiceRegistry::new(
        gateway,
        Arc::new(MemoryStore::new(memory_backend.clone())),
        market.clone(),
        Some(Arc::new(WeekdayCalendar) as Arc<dyn ExchangeCalendar>),
        dashboard,
        Arc::new(PersistenceService::new(&base_dir, "default")),
        Arc::new(PersonaCatalog::builtin()),
        settings,
    ));

    TestHarness {
        services,
        provider,
        market,
        memory_backend,
        base_dir,
    }
}

/// Wires the deterministic happy path: every analyst selects one momentum
/// tool, synthesizes bullish at 80, declines to notify, confirms bullish in
/// round 2, and the PM goes long.
pub fn add_happy_path_rules(provider: &ScriptedChatProvider, ticker: &str) {
    provider.add_rule(
        "Available analysis tools",
        r#"{"selected_tools": [{"tool_name": "analyze_momentum", "reason": "price action first"}],
            "analysis_strategy": "momentum check", "synthesis_approach": "weighted"}"#,
    );
    provider.add_rule(
        "Tool outputs:",
        r#"{"signal": "bullish", "confidence": 80, "reasoning": "tools agree on upside"}"#,
    );
    provider.add_rule(
        "Should the other agents be alerted",
        r#"{"should_notify": false, "content": "", "urgency": "low", "category": ""}"#,
    );
    provider.add_rule(
        "second analysis round",
        format!(
            r#"{{"analyst_id": "", "analyst_name": "",
                "ticker_signals": [{{"ticker": "{ticker}", "signal": "bullish",
                "confidence": 80, "reasoning": "peers agree"}}]}}"#
        ),
    );
    provider.add_rule(
        "portfolio manager deciding trades",
        format!(
            r#"{{"decisions": {{"{ticker}": {{"action": "long", "quantity": 10,
                "confidence": 75, "reasoning": "strong consensus"}}}}}}"#
        ),
    );
    provider.add_rule(
        "reviewing your performance",
        r#"{"tool_name": "none", "params": {}}"#,
    );
}
