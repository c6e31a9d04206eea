use crate::domain::errors::MemoryError;
use crate::domain::llm::{ChatRequest, ChatResponse};
use crate::domain::state::EngineMode;
use crate::domain::types::{
    CompanyNews, FinancialMetrics, InsiderTrade, MemoryRecord, PreMarketResult, PriceBar,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One LLM provider binding. The gateway routes calls by provider id.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Whether the binding honors a `json_object` response format. Providers
    /// without it fall through to plain-text extraction.
    fn supports_json_mode(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn prices(&self, ticker: &str, start: NaiveDate, end: NaiveDate)
    -> Result<Vec<PriceBar>>;

    async fn financial_metrics(
        &self,
        ticker: &str,
        end: NaiveDate,
        period: &str,
        limit: usize,
    ) -> Result<Vec<FinancialMetrics>>;

    async fn insider_trades(
        &self,
        ticker: &str,
        start: Option<NaiveDate>,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<InsiderTrade>>;

    async fn company_news(
        &self,
        ticker: &str,
        start: Option<NaiveDate>,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<CompanyNews>>;

    async fn market_cap(&self, ticker: &str, end: NaiveDate) -> Result<Option<f64>>;
}

/// Optional exchange-calendar collaborator. The driver falls back to a naive
/// weekday calendar when none is wired.
#[async_trait]
pub trait ExchangeCalendar: Send + Sync {
    async fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>>;
    async fn last_trading_day(&self, date: NaiveDate) -> Result<NaiveDate>;
}

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn add(&self, record: MemoryRecord) -> Result<String, MemoryError>;
    async fn search(
        &self,
        query: &str,
        user_id: &str,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;
    async fn update(
        &self,
        id: &str,
        new_content: String,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), MemoryError>;
    async fn delete(&self, id: &str) -> Result<(), MemoryError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    pub days_recorded: usize,
    pub trades_recorded: usize,
}

/// Decision history the portfolio manager reads back from the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// `(date, ticker, action, confidence)` for the last few trading days.
    pub recent_decisions: Vec<(NaiveDate, String, String, f64)>,
    /// Per-agent hit rate in [0, 1].
    pub win_rates: BTreeMap<String, f64>,
}

/// Fire-and-forget dashboard sink. Failures are warned about and swallowed by
/// the caller; the pipeline always makes forward progress.
#[async_trait]
pub trait DashboardSink: Send + Sync {
    async fn update_from_day_result(
        &self,
        date: NaiveDate,
        pre_market: &PreMarketResult,
        mode: EngineMode,
    ) -> Result<DashboardStats>;

    /// Realized open->close returns for a completed day. Lets the sink score
    /// the signals and decisions it recorded earlier; sinks that don't keep
    /// score ignore it.
    async fn record_realized_returns(
        &self,
        _date: NaiveDate,
        _returns: &BTreeMap<String, f64>,
    ) -> Result<()> {
        Ok(())
    }

    /// Recent-performance side channel consumed by the portfolio manager.
    async fn recent_performance(&self) -> Option<PerformanceSnapshot> {
        None
    }
}
