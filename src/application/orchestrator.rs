use crate::application::agents::analyst::{AnalystAgent, AnalystDependencies};
use crate::application::agents::persona::AnalystType;
use crate::application::agents::portfolio_manager::{PORTFOLIO_MANAGER_ID, PortfolioManagerAgent};
use crate::application::agents::risk_manager::{
    RISK_MANAGER_ID, RiskManagerAgent, current_prices_from_risk,
};
use crate::application::communication::{CommunicationCoordinator, CommunicationOutcome};
use crate::application::execution::execute_decisions;
use crate::application::services::ServiceRegistry;
use crate::domain::errors::EngineError;
use crate::domain::portfolio::Portfolio;
use crate::domain::state::{ApiKeys, DayState, EngineMode, ModelMetadata};
use crate::domain::types::{
    AgentFailure, AgentOutput, DayResult, ExecutionReport, PortfolioDecision, PreMarketResult,
};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// How many times round 1 is re-run when its payload is unusable for round 2.
const MAX_FIRST_ROUND_RERUNS: usize = 10;
/// Notifications surfaced to each round-2 analyst.
const RECENT_NOTIFICATIONS: usize = 20;

/// Inputs for one orchestrated day.
#[derive(Debug, Clone)]
pub struct DayRunConfig {
    pub date: NaiveDate,
    pub tickers: Vec<String>,
    pub mode: EngineMode,
    pub is_live_mode: bool,
    pub api_keys: ApiKeys,
    pub models: ModelMetadata,
    pub portfolio: Option<Portfolio>,
}

/// Everything one day produced. In live mode `trades_deferred` is set and
/// `execution` stays empty until `execute_deferred_trades` runs post-close.
#[derive(Debug)]
pub struct DayOutcome {
    pub state: DayState,
    pub initial_decisions: BTreeMap<String, PortfolioDecision>,
    pub final_decisions: BTreeMap<String, PortfolioDecision>,
    pub execution: Option<ExecutionReport>,
    pub trades_deferred: bool,
}

impl DayOutcome {
    pub fn pre_market_result(&self) -> PreMarketResult {
        PreMarketResult {
            signals: self.state.analyst_signals.clone(),
            decisions: self.final_decisions.clone(),
            initial_decisions: self.initial_decisions.clone(),
            current_prices: self.state.current_prices.clone(),
            communication_logs: self.state.communication_logs.clone(),
            trades_deferred: self.trades_deferred,
            execution: self.execution.clone(),
        }
    }

    pub fn into_day_result(self) -> DayResult {
        DayResult {
            date: self.state.trading_date,
            pre_market: self.pre_market_result(),
            post_market: None,
        }
    }
}

/// Runs the full analyst -> risk -> portfolio-manager pipeline for one day,
/// enforcing phase ordering and the deferred-execution contract.
pub struct DayOrchestrator {
    services: Arc<ServiceRegistry>,
}

impl DayOrchestrator {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }

    fn build_analyst(services: &Arc<ServiceRegistry>, analyst_type: AnalystType) -> AnalystAgent {
        AnalystAgent::new(
            analyst_type,
            AnalystDependencies {
                gateway: services.gateway.clone(),
                selector: services.selector.clone(),
                memory: services.memory.clone(),
                notifications: services.notifications.clone(),
                personas: services.personas.clone(),
                calendar: services.calendar.clone(),
                enable_notifications: services.settings.enable_notifications,
            },
        )
    }

    pub fn build_state(&self, config: &DayRunConfig) -> DayState {
        let mut state = DayState::new(
            config.date,
            config.tickers.clone(),
            config.mode,
            config.is_live_mode,
        );
        state.api_keys = config.api_keys.clone();
        state.models = config.models.clone();
        state.portfolio = config.portfolio.clone();
        state
    }

    pub async fn run_day(&self, config: DayRunConfig) -> Result<DayOutcome, EngineError> {
        if config.tickers.is_empty() {
            return Err(EngineError::DayFailed {
                date: config.date.to_string(),
                reason: "no tickers to analyze".to_string(),
            });
        }

        let mut state = self.build_state(&config);
        info!(
            "Orchestrator: {} in {} mode (live: {}), {} tickers",
            state.trading_date,
            state.mode,
            state.is_live_mode,
            state.tickers.len()
        );

        // Agents register with the hub before any broadcast can happen.
        for analyst_type in &self.services.settings.analyst_types {
            self.services
                .notifications
                .register(analyst_type.agent_id())
                .await;
        }
        self.services.notifications.register(PORTFOLIO_MANAGER_ID).await;

        // Phase A: analyst round 1 over independent state snapshots. The
        // canonical map is only touched here, serially, as tasks finish.
        self.run_first_round_phase(&mut state).await;

        // Phase B: optional second round, gated on notifications being on.
        if self.services.settings.enable_notifications {
            self.run_second_round_phase(&mut state).await;
        }

        // Phase C: risk manager, sequential.
        let risk_agent = RiskManagerAgent::new(
            self.services.market_data.clone(),
            self.services.calendar.clone(),
        );
        let assessments = risk_agent.execute(&state).await;
        state.current_prices = current_prices_from_risk(&assessments);
        state
            .analyst_signals
            .insert(RISK_MANAGER_ID.to_string(), AgentOutput::Risk(assessments));

        // Phase D: portfolio manager, optional communication, execution.
        let pm = PortfolioManagerAgent::new(
            self.services.gateway.clone(),
            self.services.memory.clone(),
            self.services.dashboard.clone(),
        );
        let initial_decisions = pm.execute(&state).await;
        let mut final_decisions = initial_decisions.clone();

        if self.services.settings.enable_communications {
            let coordinator = CommunicationCoordinator::new(
                self.services.gateway.clone(),
                self.services.memory.clone(),
                self.services.settings.chat.clone(),
            );
            let CommunicationOutcome {
                updated_signals,
                should_reinvoke_pm,
                logs,
            } = coordinator.run(&state, &initial_decisions).await;

            state.analyst_signals = updated_signals;
            state.communication_logs = logs;

            if let Err(e) = self
                .services
                .persistence
                .write_communication_log(state.trading_date, &state.communication_logs)
            {
                warn!("Orchestrator: communication log write failed: {}", e);
            }

            // The coordinator only reports; re-invoking the PM is owned here.
            if should_reinvoke_pm {
                info!("Orchestrator: signals adjusted in communication, re-running PM");
                final_decisions = pm.execute(&state).await;
            }
        }

        if state.is_live_mode {
            // Deferred-execution contract: stop before touching the
            // portfolio; trades run post-close against closing prices.
            info!("Orchestrator: live mode, deferring trade execution");
            return Ok(DayOutcome {
                state,
                initial_decisions,
                final_decisions,
                execution: None,
                trades_deferred: true,
            });
        }

        let execution = self.execute_trades(&mut state, &final_decisions);
        Ok(DayOutcome {
            state,
            initial_decisions,
            final_decisions,
            execution,
            trades_deferred: false,
        })
    }

    /// Post-close half of the deferred-execution contract: re-date the state,
    /// re-run the risk manager with `is_live_mode = false` so `current_prices`
    /// become closing prices, then execute.
    pub async fn execute_deferred_trades(
        &self,
        state: &mut DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
        close_date: NaiveDate,
    ) -> Result<Option<ExecutionReport>, EngineError> {
        state.end_date = close_date;
        state.is_live_mode = false;

        let risk_agent = RiskManagerAgent::new(
            self.services.market_data.clone(),
            self.services.calendar.clone(),
        );
        let assessments = risk_agent.execute(state).await;
        state.current_prices = current_prices_from_risk(&assessments);
        state
            .analyst_signals
            .insert(RISK_MANAGER_ID.to_string(), AgentOutput::Risk(assessments));

        Ok(self.execute_trades(state, decisions))
    }

    fn execute_trades(
        &self,
        state: &mut DayState,
        decisions: &BTreeMap<String, PortfolioDecision>,
    ) -> Option<ExecutionReport> {
        if state.mode != EngineMode::Portfolio {
            return None;
        }
        let portfolio = state.portfolio.as_mut()?;
        Some(execute_decisions(
            portfolio,
            decisions,
            &state.current_prices,
            state.trading_date,
        ))
    }

    async fn run_first_round_phase(&self, state: &mut DayState) {
        let semaphore = Arc::new(Semaphore::new(self.services.settings.worker_pool_size));
        let mut handles = Vec::new();

        for &analyst_type in &self.services.settings.analyst_types {
            let services = self.services.clone();
            let snapshot = state.clone();
            let semaphore = semaphore.clone();
            handles.push((
                analyst_type,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    let agent = Self::build_analyst(&services, analyst_type);
                    agent.run_first_round(&snapshot).await
                }),
            ));
        }

        for (analyst_type, handle) in handles {
            let agent_id = analyst_type.agent_id();
            let output = match handle.await {
                Ok(Ok(map)) if !map.is_empty() => AgentOutput::FirstRound(map),
                Ok(Ok(_)) => {
                    warn!("Orchestrator: {} produced no result", agent_id);
                    AgentOutput::Failed(AgentFailure {
                        status: "no_result".to_string(),
                        message: "analyst returned an empty result".to_string(),
                    })
                }
                Ok(Err(e)) => {
                    error!("Orchestrator: {} failed: {}", agent_id, e);
                    AgentOutput::Failed(AgentFailure {
                        status: "error".to_string(),
                        message: e.to_string(),
                    })
                }
                Err(join_error) => {
                    error!("Orchestrator: {} task panicked: {}", agent_id, join_error);
                    AgentOutput::Failed(AgentFailure {
                        status: "error".to_string(),
                        message: join_error.to_string(),
                    })
                }
            };
            state.analyst_signals.insert(agent_id, output);
        }
    }

    async fn run_second_round_phase(&self, state: &mut DayState) {
        // Round-1 payloads must be usable before round 2 may read them.
        for &analyst_type in &self.services.settings.analyst_types {
            let agent_id = analyst_type.agent_id();
            let valid = state
                .analyst_signals
                .get(&agent_id)
                .and_then(AgentOutput::as_first_round)
                .map(AnalystAgent::validate_first_round)
                .unwrap_or(false);
            if valid {
                continue;
            }

            let mut recovered = false;
            for attempt in 1..=MAX_FIRST_ROUND_RERUNS {
                warn!(
                    "Orchestrator: re-running round 1 for {} (attempt {}/{})",
                    agent_id, attempt, MAX_FIRST_ROUND_RERUNS
                );
                let agent = Self::build_analyst(&self.services, analyst_type);
                match agent.run_first_round(state).await {
                    Ok(map) if AnalystAgent::validate_first_round(&map) => {
                        state
                            .analyst_signals
                            .insert(agent_id.clone(), AgentOutput::FirstRound(map));
                        recovered = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Orchestrator: rerun of {} failed: {}", agent_id, e);
                        continue;
                    }
                }
            }
            if !recovered {
                error!(
                    "Orchestrator: aborting second round for {} after {} reruns",
                    agent_id, MAX_FIRST_ROUND_RERUNS
                );
                state.analyst_signals.insert(
                    agent_id,
                    AgentOutput::Failed(AgentFailure {
                        status: "error".to_string(),
                        message: format!(
                            "first round invalid after {MAX_FIRST_ROUND_RERUNS} reruns"
                        ),
                    }),
                );
            }
        }

        let notifications = self.services.notifications.recent(RECENT_NOTIFICATIONS).await;
        let semaphore = Arc::new(Semaphore::new(self.services.settings.worker_pool_size));
        let mut handles = Vec::new();

        for &analyst_type in &self.services.settings.analyst_types {
            let agent_id = analyst_type.agent_id();
            let has_first_round = state
                .analyst_signals
                .get(&agent_id)
                .and_then(AgentOutput::as_first_round)
                .is_some();
            if !has_first_round {
                continue;
            }

            let services = self.services.clone();
            let snapshot = state.clone();
            let notifications = notifications.clone();
            let semaphore = semaphore.clone();
            handles.push((
                analyst_type,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    let agent = Self::build_analyst(&services, analyst_type);
                    agent.run_second_round(&snapshot, &notifications).await
                }),
            ));
        }

        for (analyst_type, handle) in handles {
            let agent_id = analyst_type.agent_id();
            match handle.await {
                Ok(analysis) if !analysis.ticker_signals.is_empty() => {
                    state.analyst_signals.insert(
                        format!("{agent_id}_round2"),
                        AgentOutput::SecondRound(analysis),
                    );
                }
                Ok(_) => {
                    warn!("Orchestrator: {} round 2 produced no signals", agent_id);
                }
                Err(join_error) => {
                    error!(
                        "Orchestrator: {} round 2 task panicked: {}",
                        agent_id, join_error
                    );
                }
            }
        }
    }
}
