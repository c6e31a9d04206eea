use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Directional view at the analyst/tool layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

/// Return threshold for calling a directional view correct.
pub const RETURN_CORRECTNESS_THRESHOLD: f64 = 0.005;

impl Signal {
    /// Direction-vs-outcome check: bullish needs the realized return above
    /// +0.5%, bearish below -0.5%, neutral within the band.
    pub fn matches_return(&self, actual_return: f64) -> bool {
        match self {
            Signal::Bullish => actual_return > RETURN_CORRECTNESS_THRESHOLD,
            Signal::Bearish => actual_return < -RETURN_CORRECTNESS_THRESHOLD,
            Signal::Neutral => actual_return.abs() <= RETURN_CORRECTNESS_THRESHOLD,
        }
    }

    /// Accepts the encodings seen in model output (`BUY`, `long`, `bullish`, ...).
    /// Anything unrecognized maps to neutral.
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "bullish" | "buy" | "long" => Signal::Bullish,
            "bearish" | "sell" | "short" => Signal::Bearish,
            _ => Signal::Neutral,
        }
    }

    pub fn from_action(action: TradeAction) -> Self {
        match action {
            TradeAction::Long => Signal::Bullish,
            TradeAction::Short => Signal::Bearish,
            TradeAction::Hold => Signal::Neutral,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Bullish => write!(f, "bullish"),
            Signal::Bearish => write!(f, "bearish"),
            Signal::Neutral => write!(f, "neutral"),
        }
    }
}

/// Directional view at the portfolio-manager/executor layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Long,
    Short,
    #[default]
    Hold,
}

impl TradeAction {
    pub fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::Bullish => TradeAction::Long,
            Signal::Bearish => TradeAction::Short,
            Signal::Neutral => TradeAction::Hold,
        }
    }

    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" | "bullish" => TradeAction::Long,
            "short" | "sell" | "bearish" => TradeAction::Short,
            _ => TradeAction::Hold,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Long => write!(f, "long"),
            TradeAction::Short => write!(f, "short"),
            TradeAction::Hold => write!(f, "hold"),
        }
    }
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 100.0) }
}

/// One daily OHLCV bar from the market-data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Financial metrics for one report period. Fields are optional because no
/// upstream source fills all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialMetrics {
    pub ticker: String,
    pub report_period: String,
    pub period: String,
    pub market_cap: Option<f64>,
    pub enterprise_value: Option<f64>,
    pub price_to_earnings_ratio: Option<f64>,
    pub price_to_book_ratio: Option<f64>,
    pub price_to_sales_ratio: Option<f64>,
    pub enterprise_value_to_ebitda_ratio: Option<f64>,
    pub gross_margin: Option<f64>,
    pub operating_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub return_on_equity: Option<f64>,
    pub return_on_assets: Option<f64>,
    pub return_on_invested_capital: Option<f64>,
    pub asset_turnover: Option<f64>,
    pub inventory_turnover: Option<f64>,
    pub receivables_turnover: Option<f64>,
    pub working_capital_turnover: Option<f64>,
    pub current_ratio: Option<f64>,
    pub quick_ratio: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub earnings_growth: Option<f64>,
    pub book_value_growth: Option<f64>,
    pub earnings_per_share_growth: Option<f64>,
    pub free_cash_flow_growth: Option<f64>,
    pub payout_ratio: Option<f64>,
    pub earnings_per_share: Option<f64>,
    pub book_value_per_share: Option<f64>,
    pub free_cash_flow_per_share: Option<f64>,
    pub free_cash_flow: Option<f64>,
    pub net_income: Option<f64>,
    pub depreciation_and_amortization: Option<f64>,
    pub capital_expenditure: Option<f64>,
    pub working_capital: Option<f64>,
    pub ebitda: Option<f64>,
    pub shareholders_equity: Option<f64>,
    pub outstanding_shares: Option<f64>,
}

/// One insider transaction. Negative `transaction_shares` is a sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsiderTrade {
    pub ticker: String,
    pub insider_name: Option<String>,
    pub transaction_date: Option<NaiveDate>,
    pub transaction_shares: Option<f64>,
    pub transaction_price_per_share: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyNews {
    pub ticker: String,
    pub title: String,
    pub date: Option<NaiveDate>,
    pub source: Option<String>,
    pub url: Option<String>,
}

/// Output of a single analysis tool. Immutable once produced; tool failures
/// are folded into `error` with a neutral signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub signal: Signal,
    pub confidence: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn failed(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            signal: Signal::Neutral,
            confidence: 0.0,
            metrics: BTreeMap::new(),
            reasoning: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Fundamental,
    Technical,
    Sentiment,
    Valuation,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCategory::Fundamental => write!(f, "fundamental"),
            ToolCategory::Technical => write!(f, "technical"),
            ToolCategory::Sentiment => write!(f, "sentiment"),
            ToolCategory::Valuation => write!(f, "valuation"),
        }
    }
}

/// A tool picked by the selector, with the model's stated reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedTool {
    pub tool_name: String,
    #[serde(default)]
    pub reason: String,
}

/// The selector's plan for one (persona, ticker) analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelectionPlan {
    pub selected_tools: Vec<SelectedTool>,
    #[serde(default)]
    pub analysis_strategy: String,
    #[serde(default)]
    pub synthesis_approach: String,
    #[serde(default)]
    pub tool_count: usize,
}

/// How the per-ticker tool runs went, kept alongside the synthesized signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAnalysis {
    pub tool_results: Vec<ToolResult>,
    pub successful: usize,
    pub failed: usize,
    pub synthesis_details: SynthesisDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisDetails {
    #[serde(default)]
    pub tool_impact_analysis: BTreeMap<String, String>,
    pub synthesis_method: String,
}

/// Round-1 analyst output for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstRoundSignal {
    pub ticker: String,
    pub signal: Signal,
    pub confidence: f64,
    pub reasoning: String,
    pub tool_selection: ToolSelectionSummary,
    pub tool_analysis: ToolAnalysis,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelectionSummary {
    pub strategy: String,
    pub selected_tools: Vec<String>,
    pub count: usize,
}

/// One per-ticker entry in a round-2 payload. Canonical analyst→PM shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSignal {
    pub ticker: String,
    pub signal: Signal,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Round-2 analyst output: the revised per-ticker view after seeing peers
/// and notifications. `ticker_signals` must be non-empty (gateway guard).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondRoundAnalysis {
    #[serde(default)]
    pub analyst_id: String,
    #[serde(default)]
    pub analyst_name: String,
    pub ticker_signals: Vec<TickerSignal>,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    VeryHigh,
    Unknown,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::VeryHigh => write!(f, "very_high"),
            RiskLevel::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityInfo {
    pub annualized_volatility: f64,
    pub daily_volatility: f64,
    pub volatility_percentile: f64,
    pub data_points: usize,
}

/// Risk manager output in basic (signal) mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicRiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: u32,
    pub current_price: f64,
    pub volatility_info: VolatilityInfo,
    pub risk_assessment: String,
}

/// Risk manager output in portfolio mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRiskAssessment {
    pub current_price: f64,
    pub max_shares: u64,
    pub remaining_position_limit: f64,
    pub volatility_metrics: VolatilityInfo,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RiskAssessment {
    Basic(BasicRiskAssessment),
    Position(PositionRiskAssessment),
}

impl RiskAssessment {
    pub fn current_price(&self) -> f64 {
        match self {
            RiskAssessment::Basic(a) => a.current_price,
            RiskAssessment::Position(a) => a.current_price,
        }
    }
}

/// Portfolio manager output for one ticker. `quantity` is zero in
/// direction-only (signal) mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
    pub action: TradeAction,
    pub quantity: u64,
    pub confidence: f64,
    pub reasoning: String,
}

impl PortfolioDecision {
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            quantity: 0,
            confidence: 0.0,
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// In-process broadcast between agents. Best-effort, never persisted beyond
/// episodic memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub sender_agent: String,
    pub content: String,
    pub urgency: Urgency,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    PrivateChat,
    Meeting,
    None,
}

impl Default for CommunicationType {
    fn default() -> Self {
        CommunicationType::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationDecision {
    pub should_communicate: bool,
    #[serde(default)]
    pub communication_type: CommunicationType,
    #[serde(default)]
    pub target_analysts: Vec<String>,
    #[serde(default)]
    pub discussion_topic: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: String,
    pub content: String,
    pub round: u32,
    pub timestamp: DateTime<Utc>,
}

/// An adjustment an analyst made to one of its signals mid-dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalAdjustment {
    pub analyst_id: String,
    pub ticker: String,
    pub signal: Signal,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub topic: String,
    pub participants: Vec<String>,
    pub turns: Vec<TranscriptTurn>,
    #[serde(default)]
    pub signal_adjustments: Vec<SignalAdjustment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunicationLogs {
    pub private_chats: Vec<Transcript>,
    pub meetings: Vec<Transcript>,
    pub communication_decisions: Vec<CommunicationDecision>,
}

/// One episodic memory record, scoped to `user_id` (an agent id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Status captured for an agent that produced nothing mergeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailure {
    pub status: String,
    pub message: String,
}

/// One entry in the day state's `analyst_signals` map. Keys are agent ids
/// (plus `<agent_id>_round2` for second-round payloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentOutput {
    FirstRound(BTreeMap<String, FirstRoundSignal>),
    SecondRound(SecondRoundAnalysis),
    Risk(BTreeMap<String, RiskAssessment>),
    Failed(AgentFailure),
}

impl AgentOutput {
    pub fn as_first_round(&self) -> Option<&BTreeMap<String, FirstRoundSignal>> {
        match self {
            AgentOutput::FirstRound(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_second_round(&self) -> Option<&SecondRoundAnalysis> {
        match self {
            AgentOutput::SecondRound(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_risk(&self) -> Option<&BTreeMap<String, RiskAssessment>> {
        match self {
            AgentOutput::Risk(map) => Some(map),
            _ => None,
        }
    }
}

/// A fill the trade executor applied to the portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFill {
    pub ticker: String,
    pub action: TradeAction,
    pub requested_quantity: u64,
    pub filled_quantity: u64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedTrade {
    pub ticker: String,
    pub action: TradeAction,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub date: NaiveDate,
    pub executed: Vec<TradeFill>,
    pub skipped: Vec<SkippedTrade>,
    pub portfolio: crate::domain::portfolio::Portfolio,
}

/// Pre-market half of a day result: everything up to (and including, in
/// backtest mode) trade execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreMarketResult {
    pub signals: BTreeMap<String, AgentOutput>,
    pub decisions: BTreeMap<String, PortfolioDecision>,
    pub initial_decisions: BTreeMap<String, PortfolioDecision>,
    pub current_prices: BTreeMap<String, f64>,
    pub communication_logs: CommunicationLogs,
    pub trades_deferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMarketResult {
    pub reflection_results: Vec<ReflectionOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayResult {
    pub date: NaiveDate,
    pub pre_market: PreMarketResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_market: Option<PostMarketResult>,
}

/// What one agent's reflection did to its memory after the day closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    pub agent_id: String,
    pub operations: Vec<MemoryOpRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOpRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub operation_type: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub result: String,
    pub context: String,
}
