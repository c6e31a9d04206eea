use crate::domain::llm::{ChatRequest, ChatResponse};
use crate::domain::ports::{
    ChatProvider, DashboardSink, DashboardStats, MarketDataProvider, PerformanceSnapshot,
};
use crate::domain::state::EngineMode;
use crate::domain::types::{
    CompanyNews, FinancialMetrics, InsiderTrade, PreMarketResult, PriceBar,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate, Weekday};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Deterministic chat provider for tests.
///
/// Responses resolve in two stages: an explicit FIFO queue (consumed first,
/// entries may be errors to simulate transport failures), then marker rules
/// matched as substrings against the concatenated request messages. Useful
/// markers emitted by the engine's prompts:
/// `"Available analysis tools"` (tool selection), `"Tool outputs:"`
/// (synthesis), `"second analysis round"` (round 2), `"Should the other
/// agents be alerted"` (notification), `"portfolio manager deciding trades"`
/// (PM decision), `"private chat or a group meeting"` (communication
/// decision), `"reviewing your performance"` (reflection).
pub struct ScriptedChatProvider {
    queue: Mutex<VecDeque<Result<String, String>>>,
    rules: Mutex<Vec<(String, String)>>,
    requests: Mutex<Vec<String>>,
    default_response: String,
    calls: AtomicU64,
}

impl ScriptedChatProvider {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            rules: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            default_response: "{}".to_string(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_rule(self, marker: impl Into<String>, response: impl Into<String>) -> Self {
        self.add_rule(marker, response);
        self
    }

    pub fn add_rule(&self, marker: impl Into<String>, response: impl Into<String>) {
        self.rules
            .lock()
            .unwrap()
            .push((marker.into(), response.into()));
    }

    /// Queues one response (or transport error) consumed before any rule.
    pub fn push_response(&self, response: Result<String, String>) {
        self.queue.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Every prompt seen so far, concatenated per call. Lets tests assert on
    /// what the engine actually showed the model.
    pub fn recorded_requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for ScriptedChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for ScriptedChatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let haystack: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.requests.lock().unwrap().push(haystack.clone());

        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return match next {
                Ok(content) => Ok(ChatResponse {
                    content,
                    usage: None,
                }),
                Err(e) => anyhow::bail!(e),
            };
        }

        let rules = self.rules.lock().unwrap();
        for (marker, response) in rules.iter() {
            if haystack.contains(marker.as_str()) {
                return Ok(ChatResponse {
                    content: response.clone(),
                    usage: None,
                });
            }
        }

        Ok(ChatResponse {
            content: self.default_response.clone(),
            usage: None,
        })
    }

    fn supports_json_mode(&self) -> bool {
        true
    }
}

/// Builds weekday bars for `start..=end`; `open_close` maps the bar index to
/// that day's open and close.
pub fn make_bars(
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    open_close: impl Fn(usize) -> (f64, f64),
) -> Vec<PriceBar> {
    let mut bars = Vec::new();
    let mut day = start;
    let mut index = 0usize;
    while day <= end {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            let (open, close) = open_close(index);
            bars.push(PriceBar {
                ticker: ticker.to_string(),
                date: day,
                open,
                high: open.max(close) * 1.01,
                low: open.min(close) * 0.99,
                close,
                volume: 1_000_000.0,
            });
            index += 1;
        }
        day = match day.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    bars
}

/// In-memory market data fixture with programmable bars, metrics, news,
/// insider trades and market caps.
pub struct FixtureMarketData {
    bars: RwLock<BTreeMap<String, Vec<PriceBar>>>,
    metrics: RwLock<BTreeMap<String, Vec<FinancialMetrics>>>,
    news: RwLock<BTreeMap<String, Vec<CompanyNews>>>,
    insiders: RwLock<BTreeMap<String, Vec<InsiderTrade>>>,
    caps: RwLock<BTreeMap<String, f64>>,
}

impl FixtureMarketData {
    pub fn empty() -> Self {
        Self {
            bars: RwLock::new(BTreeMap::new()),
            metrics: RwLock::new(BTreeMap::new()),
            news: RwLock::new(BTreeMap::new()),
            insiders: RwLock::new(BTreeMap::new()),
            caps: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn set_bars(&self, ticker: &str, bars: Vec<PriceBar>) {
        self.bars.write().unwrap().insert(ticker.to_string(), bars);
    }

    pub fn set_metrics(&self, ticker: &str, metrics: Vec<FinancialMetrics>) {
        self.metrics
            .write()
            .unwrap()
            .insert(ticker.to_string(), metrics);
    }

    pub fn set_news(&self, ticker: &str, news: Vec<CompanyNews>) {
        self.news.write().unwrap().insert(ticker.to_string(), news);
    }

    pub fn set_insiders(&self, ticker: &str, trades: Vec<InsiderTrade>) {
        self.insiders
            .write()
            .unwrap()
            .insert(ticker.to_string(), trades);
    }

    pub fn set_market_cap(&self, ticker: &str, cap: f64) {
        self.caps.write().unwrap().insert(ticker.to_string(), cap);
    }
}

#[async_trait]
impl MarketDataProvider for FixtureMarketData {
    async fn prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        Ok(self
            .bars
            .read()
            .unwrap()
            .get(ticker)
            .map(|bars| {
                bars.iter()
                    .filter(|bar| bar.date >= start && bar.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn financial_metrics(
        &self,
        ticker: &str,
        _end: NaiveDate,
        _period: &str,
        limit: usize,
    ) -> Result<Vec<FinancialMetrics>> {
        Ok(self
            .metrics
            .read()
            .unwrap()
            .get(ticker)
            .map(|m| m.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insider_trades(
        &self,
        ticker: &str,
        _start: Option<NaiveDate>,
        _end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<InsiderTrade>> {
        Ok(self
            .insiders
            .read()
            .unwrap()
            .get(ticker)
            .map(|t| t.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn company_news(
        &self,
        ticker: &str,
        _start: Option<NaiveDate>,
        _end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<CompanyNews>> {
        Ok(self
            .news
            .read()
            .unwrap()
            .get(ticker)
            .map(|n| n.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn market_cap(&self, ticker: &str, _end: NaiveDate) -> Result<Option<f64>> {
        Ok(self.caps.read().unwrap().get(ticker).copied())
    }
}

/// Dashboard sink that records updates without touching the filesystem.
pub struct CollectingDashboard {
    pub updates: Mutex<Vec<NaiveDate>>,
}

impl CollectingDashboard {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
        }
    }
}

impl Default for CollectingDashboard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DashboardSink for CollectingDashboard {
    async fn update_from_day_result(
        &self,
        date: NaiveDate,
        _pre_market: &PreMarketResult,
        _mode: EngineMode,
    ) -> Result<DashboardStats> {
        let mut updates = self.updates.lock().unwrap();
        updates.push(date);
        Ok(DashboardStats {
            days_recorded: updates.len(),
            trades_recorded: 0,
        })
    }

    async fn recent_performance(&self) -> Option<PerformanceSnapshot> {
        None
    }
}
