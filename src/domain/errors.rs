use thiserror::Error;

/// Errors raised by the model gateway while calling providers and coercing
/// structured output.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("Transport failure calling {provider}/{model}: {reason}")]
    Transport {
        provider: String,
        model: String,
        reason: String,
    },

    #[error("Unparseable model response: {reason}")]
    Parse { reason: String },

    #[error("Structured response rejected by guard: {reason}")]
    GuardRejected { reason: String },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

impl GatewayError {
    /// Transport and structural failures are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport { .. }
                | GatewayError::Parse { .. }
                | GatewayError::GuardRejected { .. }
        )
    }
}

/// Errors surfaced by the episodic memory store.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory record not found: {id}")]
    NotFound { id: String },

    #[error("Memory backend failure: {reason}")]
    Backend { reason: String },
}

/// Failures inside a single analysis tool. These never cross the executor
/// boundary: the executor folds them into a neutral `ToolResult`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Missing required parameter '{param}' for tool {tool}")]
    MissingParam { tool: String, param: String },

    #[error("No data available for {ticker}: {reason}")]
    NoData { ticker: String, reason: String },

    #[error("Upstream data error for {ticker}: {reason}")]
    Upstream { ticker: String, reason: String },
}

/// Pipeline-level failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Analyst {agent_id} failed: {reason}")]
    AgentFailed { agent_id: String, reason: String },

    #[error("Analyst {agent_id} produced no usable first-round output after {attempts} attempts")]
    FirstRoundInvalid { agent_id: String, attempts: usize },

    #[error("No price data for {ticker} in range {start}..{end}")]
    NoPriceData {
        ticker: String,
        start: String,
        end: String,
    },

    #[error("Day {date} failed: {reason}")]
    DayFailed { date: String, reason: String },

    #[error("Persistence failure: {reason}")]
    Persistence { reason: String },
}
