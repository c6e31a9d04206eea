use crate::application::orchestrator::{DayOrchestrator, DayRunConfig};
use crate::application::reflection::ReflectionEngine;
use crate::application::services::ServiceRegistry;
use crate::domain::portfolio::Portfolio;
use crate::domain::state::{ApiKeys, EngineMode, ModelMetadata};
use crate::domain::types::{DayResult, PostMarketResult};
use crate::infrastructure::calendar::naive_trading_days;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub tickers: Vec<String>,
    pub mode: EngineMode,
    pub initial_cash: Decimal,
    pub margin_requirement: f64,
    pub is_live_mode: bool,
    pub api_keys: ApiKeys,
    pub models: ModelMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DayResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub tickers: Vec<String>,
    pub mode: EngineMode,
    pub total_days: usize,
    pub successful_days: usize,
    pub failed_days: usize,
    pub daily_results: Vec<DaySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_portfolio: Option<Portfolio>,
}

/// Iterates trading days, carrying portfolio and memory forward, persisting
/// per-day snapshots and feeding the dashboard sink. A failed day never
/// advances the portfolio and never stops the batch.
pub struct MultiDayDriver {
    services: Arc<ServiceRegistry>,
    orchestrator: DayOrchestrator,
    reflection: ReflectionEngine,
}

impl MultiDayDriver {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            orchestrator: DayOrchestrator::new(services.clone()),
            reflection: ReflectionEngine::new(services.clone()),
            services,
        }
    }

    async fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if let Some(calendar) = &self.services.calendar {
            match calendar.trading_days(start, end).await {
                Ok(days) if !days.is_empty() => return days,
                Ok(_) => {}
                Err(e) => warn!("Driver: calendar failed ({}), using weekday fallback", e),
            }
        }
        naive_trading_days(start, end)
    }

    fn recover_portfolio(&self, config: &SessionConfig) -> Portfolio {
        match self.services.persistence.load_latest_snapshot() {
            Ok(Some((date, portfolio))) => {
                info!("Driver: recovered portfolio snapshot from {}", date);
                portfolio
            }
            Ok(None) => Portfolio::new(config.initial_cash, config.margin_requirement),
            Err(e) => {
                warn!("Driver: snapshot recovery failed ({}), starting fresh", e);
                Portfolio::new(config.initial_cash, config.margin_requirement)
            }
        }
    }

    pub async fn run(&self, config: SessionConfig) -> SessionSummary {
        let session_id = Uuid::new_v4().to_string();
        let days = self.trading_days(config.start_date, config.end_date).await;
        info!(
            "Driver: session {} over {} trading days ({}..{})",
            session_id,
            days.len(),
            config.start_date,
            config.end_date
        );

        let mut portfolio = match config.mode {
            EngineMode::Portfolio => Some(self.recover_portfolio(&config)),
            EngineMode::Signal => None,
        };

        let mut daily_results = Vec::new();
        let mut successful_days = 0usize;
        let mut failed_days = 0usize;

        for date in &days {
            match self.run_one_day(&config, *date, portfolio.clone()).await {
                Ok((day_result, updated_portfolio)) => {
                    successful_days += 1;
                    if let Some(updated) = updated_portfolio {
                        self.persist_snapshot(*date, &updated);
                        portfolio = Some(updated);
                    }
                    daily_results.push(DaySummary {
                        date: *date,
                        status: "success".to_string(),
                        error: None,
                        result: Some(day_result),
                    });
                }
                Err(e) => {
                    // The carry-in portfolio is untouched; the next day starts
                    // from the same state.
                    error!("Driver: day {} failed: {}", date, e);
                    failed_days += 1;
                    daily_results.push(DaySummary {
                        date: *date,
                        status: "failed".to_string(),
                        error: Some(e.to_string()),
                        result: None,
                    });
                }
            }
        }

        SessionSummary {
            session_id,
            start_date: config.start_date,
            end_date: config.end_date,
            tickers: config.tickers.clone(),
            mode: config.mode,
            total_days: days.len(),
            successful_days,
            failed_days,
            daily_results,
            final_portfolio: portfolio,
        }
    }

    async fn run_one_day(
        &self,
        config: &SessionConfig,
        date: NaiveDate,
        portfolio: Option<Portfolio>,
    ) -> anyhow::Result<(DayResult, Option<Portfolio>)> {
        let day_config = DayRunConfig {
            date,
            tickers: config.tickers.clone(),
            mode: config.mode,
            is_live_mode: config.is_live_mode,
            api_keys: config.api_keys.clone(),
            models: config.models.clone(),
            portfolio,
        };

        let mut outcome = self.orchestrator.run_day(day_config).await?;

        if outcome.trades_deferred {
            // Post-close half of the live-mode split. A live deployment calls
            // this after the close; the driver runs it in sequence.
            let decisions = outcome.final_decisions.clone();
            outcome.execution = self
                .orchestrator
                .execute_deferred_trades(&mut outcome.state, &decisions, date)
                .await?;
            outcome.trades_deferred = false;
        }

        let updated_portfolio = outcome
            .execution
            .as_ref()
            .map(|report| report.portfolio.clone());

        let pre_market = outcome.pre_market_result();
        if let Some(dashboard) = &self.services.dashboard {
            if let Err(e) = dashboard
                .update_from_day_result(date, &pre_market, config.mode)
                .await
            {
                warn!("Driver: dashboard update failed: {}", e);
            }
        }

        // One realized-returns fetch serves both the dashboard's win-rate
        // scoring and the reflection pass.
        let realized_returns = self.reflection.realized_returns(&outcome.state).await;
        if let Some(dashboard) = &self.services.dashboard {
            if let Err(e) = dashboard
                .record_realized_returns(date, &realized_returns)
                .await
            {
                warn!("Driver: dashboard outcome scoring failed: {}", e);
            }
        }

        let reflection_results = self
            .reflection
            .reflect_with_returns(&outcome.state, &outcome.final_decisions, &realized_returns)
            .await;

        let day_result = DayResult {
            date,
            pre_market,
            post_market: Some(PostMarketResult { reflection_results }),
        };

        Ok((day_result, updated_portfolio))
    }

    fn persist_snapshot(&self, date: NaiveDate, portfolio: &Portfolio) {
        if let Err(e) = self
            .services
            .persistence
            .write_portfolio_snapshot(date, portfolio)
        {
            warn!("Driver: snapshot write failed for {}: {}", date, e);
        }
    }
}
