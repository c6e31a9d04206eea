use crate::domain::ports::{DashboardSink, DashboardStats, PerformanceSnapshot};
use crate::domain::state::EngineMode;
use crate::domain::types::{AgentOutput, PreMarketResult, Signal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::application::agents::portfolio_manager::PORTFOLIO_MANAGER_ID;

/// How many days back the recent-performance side channel reaches.
const RECENT_DAYS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionRow {
    date: NaiveDate,
    ticker: String,
    action: String,
    quantity: u64,
    confidence: f64,
    #[serde(default)]
    scored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignalRow {
    date: NaiveDate,
    agent_id: String,
    ticker: String,
    signal: String,
    #[serde(default)]
    scored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TradeRow {
    date: NaiveDate,
    ticker: String,
    action: String,
    quantity: u64,
    price: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct HitCount {
    correct: u64,
    total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InternalState {
    days: Vec<NaiveDate>,
    decisions: Vec<DecisionRow>,
    signals: Vec<SignalRow>,
    trades: Vec<TradeRow>,
    signal_counts: BTreeMap<String, BTreeMap<String, u64>>,
    agent_hits: BTreeMap<String, HitCount>,
    win_rates: BTreeMap<String, f64>,
}

/// File-backed dashboard sink. Records each day's decisions and signals,
/// scores them once realized returns come in, and serves the
/// recent-performance side channel (including per-agent win rates) back to
/// the portfolio manager.
pub struct FileDashboardSink {
    dir: PathBuf,
    state: Mutex<InternalState>,
}

impl FileDashboardSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let state = Self::load_state(&dir).unwrap_or_default();
        Self {
            dir,
            state: Mutex::new(state),
        }
    }

    fn load_state(dir: &PathBuf) -> Option<InternalState> {
        let content = fs::read_to_string(dir.join("_internal_state.json")).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_file(&self, name: &str, value: &impl Serialize) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("failed to create {:?}", self.dir))?;
        let path = self.dir.join(name);
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialize {name}"))?;
        fs::write(&path, content).with_context(|| format!("failed to write {path:?}"))?;
        Ok(())
    }

    fn write_leaderboard(&self, state: &InternalState) -> Result<()> {
        self.write_file(
            "leaderboard.json",
            &serde_json::json!({
                "signal_counts": state.signal_counts,
                "win_rates": state.win_rates,
            }),
        )
    }
}

#[async_trait]
impl DashboardSink for FileDashboardSink {
    async fn update_from_day_result(
        &self,
        date: NaiveDate,
        pre_market: &PreMarketResult,
        mode: EngineMode,
    ) -> Result<DashboardStats> {
        let mut state = self.state.lock().await;
        if !state.days.contains(&date) {
            state.days.push(date);
        }

        state.decisions.retain(|row| row.date != date);
        for (ticker, decision) in &pre_market.decisions {
            state.decisions.push(DecisionRow {
                date,
                ticker: ticker.clone(),
                action: decision.action.to_string(),
                quantity: decision.quantity,
                confidence: decision.confidence,
                scored: false,
            });
        }

        if let Some(execution) = &pre_market.execution {
            state.trades.retain(|row| row.date != date);
            for fill in &execution.executed {
                state.trades.push(TradeRow {
                    date,
                    ticker: fill.ticker.clone(),
                    action: fill.action.to_string(),
                    quantity: fill.filled_quantity,
                    price: fill.price,
                });
            }
        }

        state.signals.retain(|row| row.date != date);
        for (agent_id, output) in &pre_market.signals {
            if let AgentOutput::FirstRound(map) = output {
                for (ticker, signal) in map {
                    state.signals.push(SignalRow {
                        date,
                        agent_id: agent_id.clone(),
                        ticker: ticker.clone(),
                        signal: signal.signal.to_string(),
                        scored: false,
                    });
                }
                let counts = state.signal_counts.entry(agent_id.clone()).or_default();
                for signal in map.values() {
                    *counts.entry(signal.signal.to_string()).or_default() += 1;
                }
            }
        }

        let stats = DashboardStats {
            days_recorded: state.days.len(),
            trades_recorded: state.trades.len(),
        };

        self.write_file(
            "summary.json",
            &serde_json::json!({
                "mode": mode,
                "days": state.days,
                "last_updated": date,
            }),
        )?;
        self.write_file(
            "holdings.json",
            &pre_market
                .execution
                .as_ref()
                .map(|execution| execution.portfolio.positions.clone())
                .unwrap_or_default(),
        )?;
        self.write_file("stats.json", &stats)?;
        self.write_file("trades.json", &state.trades)?;
        self.write_leaderboard(&state)?;
        self.write_file("_internal_state.json", &*state)?;

        debug!("Dashboard: updated for {}", date);
        Ok(stats)
    }

    /// Scores the day's recorded signals and decisions against realized
    /// returns and refreshes the per-agent win rates. Rows are scored at
    /// most once.
    async fn record_realized_returns(
        &self,
        date: NaiveDate,
        returns: &BTreeMap<String, f64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        {
            let InternalState {
                decisions,
                signals,
                agent_hits,
                win_rates,
                ..
            } = &mut *state;

            for row in signals.iter_mut().filter(|r| r.date == date && !r.scored) {
                let Some(actual) = returns.get(&row.ticker) else {
                    continue;
                };
                let hit = agent_hits.entry(row.agent_id.clone()).or_default();
                hit.total += 1;
                if Signal::parse_loose(&row.signal).matches_return(*actual) {
                    hit.correct += 1;
                }
                row.scored = true;
            }

            for row in decisions.iter_mut().filter(|r| r.date == date && !r.scored) {
                let Some(actual) = returns.get(&row.ticker) else {
                    continue;
                };
                let hit = agent_hits
                    .entry(PORTFOLIO_MANAGER_ID.to_string())
                    .or_default();
                hit.total += 1;
                if Signal::parse_loose(&row.action).matches_return(*actual) {
                    hit.correct += 1;
                }
                row.scored = true;
            }

            *win_rates = agent_hits
                .iter()
                .filter(|(_, hit)| hit.total > 0)
                .map(|(agent, hit)| (agent.clone(), hit.correct as f64 / hit.total as f64))
                .collect();
        }

        self.write_leaderboard(&state)?;
        self.write_file("_internal_state.json", &*state)?;

        debug!("Dashboard: scored outcomes for {}", date);
        Ok(())
    }

    async fn recent_performance(&self) -> Option<PerformanceSnapshot> {
        let state = self.state.lock().await;
        if state.days.is_empty() {
            return None;
        }

        let mut recent_days = state.days.clone();
        recent_days.sort();
        let cutoff_index = recent_days.len().saturating_sub(RECENT_DAYS);
        let cutoff = recent_days[cutoff_index];

        let recent_decisions = state
            .decisions
            .iter()
            .filter(|row| row.date >= cutoff)
            .map(|row| (row.date, row.ticker.clone(), row.action.clone(), row.confidence))
            .collect();

        Some(PerformanceSnapshot {
            recent_decisions,
            win_rates: state.win_rates.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{
        CommunicationLogs, FirstRoundSignal, PortfolioDecision, SynthesisDetails, ToolAnalysis,
        ToolSelectionSummary, TradeAction,
    };

    fn bullish_signal(ticker: &str) -> FirstRoundSignal {
        FirstRoundSignal {
            ticker: ticker.to_string(),
            signal: Signal::Bullish,
            confidence: 70.0,
            reasoning: "up".to_string(),
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

    fn pre_market(
        decisions: BTreeMap<String, PortfolioDecision>,
        signals: BTreeMap<String, AgentOutput>,
    ) -> PreMarketResult {
        PreMarketResult {
            signals,
            initial_decisions: decisions.clone(),
            decisions,
            current_prices: BTreeMap::new(),
            communication_logs: CommunicationLogs::default(),
            trades_deferred: false,
            execution: None,
        }
    }

    #[tokio::test]
    async fn update_writes_data_files_and_tracks_days() {
        let dir = std::env::temp_dir().join(format!("quorumtrade-dash-{}", uuid::Uuid::new_v4()));
        let sink = FileDashboardSink::new(&dir);

        let mut decisions = BTreeMap::new();
        decisions.insert(
            "AAPL".to_string(),
            PortfolioDecision {
                action: TradeAction::Long,
                quantity: 5,
                confidence: 80.0,
                reasoning: "test".to_string(),
            },
        );

        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let stats = sink
            .update_from_day_result(
                date,
                &pre_market(decisions, BTreeMap::new()),
                EngineMode::Portfolio,
            )
            .await
            .unwrap();

        assert_eq!(stats.days_recorded, 1);
        for name in [
            "summary.json",
            "holdings.json",
            "stats.json",
            "trades.json",
            "leaderboard.json",
            "_internal_state.json",
        ] {
            assert!(dir.join(name).exists(), "{name} missing");
        }

        let snapshot = sink.recent_performance().await.unwrap();
        assert_eq!(snapshot.recent_decisions.len(), 1);
        assert_eq!(snapshot.recent_decisions[0].1, "AAPL");

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn realized_returns_produce_win_rates_once() {
        let dir = std::env::temp_dir().join(format!("quorumtrade-dash-{}", uuid::Uuid::new_v4()));
        let sink = FileDashboardSink::new(&dir);
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();

        let mut decisions = BTreeMap::new();
        decisions.insert(
            "AAPL".to_string(),
            PortfolioDecision {
                action: TradeAction::Long,
                quantity: 5,
                confidence: 80.0,
                reasoning: "test".to_string(),
            },
        );
        let mut signals = BTreeMap::new();
        let mut round1 = BTreeMap::new();
        round1.insert("AAPL".to_string(), bullish_signal("AAPL"));
        signals.insert(
            "technical_analyst_agent".to_string(),
            AgentOutput::FirstRound(round1),
        );

        sink.update_from_day_result(date, &pre_market(decisions, signals), EngineMode::Signal)
            .await
            .unwrap();

        // AAPL closed up 2%: the long call and the bullish signal both score.
        let mut returns = BTreeMap::new();
        returns.insert("AAPL".to_string(), 0.02);
        sink.record_realized_returns(date, &returns).await.unwrap();

        let snapshot = sink.recent_performance().await.unwrap();
        assert_eq!(snapshot.win_rates["portfolio_manager"], 1.0);
        assert_eq!(snapshot.win_rates["technical_analyst_agent"], 1.0);

        // Re-feeding the same day is a no-op: rows score at most once.
        sink.record_realized_returns(date, &returns).await.unwrap();
        let internal: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("_internal_state.json")).unwrap())
                .unwrap();
        assert_eq!(internal["agent_hits"]["technical_analyst_agent"]["total"], 1);
        assert_eq!(internal["agent_hits"]["portfolio_manager"]["total"], 1);

        let leaderboard: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("leaderboard.json")).unwrap())
                .unwrap();
        assert_eq!(leaderboard["win_rates"]["technical_analyst_agent"], 1.0);

        fs::remove_dir_all(dir).ok();
    }
}
