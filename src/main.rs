use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use quorumtrade::application::agents::persona::PersonaCatalog;
use quorumtrade::application::driver::{MultiDayDriver, SessionConfig};
use quorumtrade::application::gateway::ModelGateway;
use quorumtrade::application::memory::MemoryStore;
use quorumtrade::application::services::ServiceRegistry;
use quorumtrade::config::EngineConfig;
use quorumtrade::domain::llm::Provider;
use quorumtrade::domain::ports::{DashboardSink, ExchangeCalendar};
use quorumtrade::infrastructure::calendar::WeekdayCalendar;
use quorumtrade::infrastructure::dashboard::FileDashboardSink;
use quorumtrade::infrastructure::llm::{AnthropicProvider, OpenAiProvider};
use quorumtrade::infrastructure::market_data::FinancialDatasetsClient;
use quorumtrade::infrastructure::{InMemoryMemoryBackend, PersistenceService};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Multi-agent trading analysis engine.
#[derive(Debug, Parser)]
#[command(name = "quorumtrade", version)]
struct Cli {
    /// First trading day to analyze (YYYY-MM-DD).
    #[arg(long)]
    start_date: NaiveDate,

    /// Last trading day to analyze (YYYY-MM-DD).
    #[arg(long)]
    end_date: NaiveDate,

    /// Comma-separated ticker universe.
    #[arg(long, value_delimiter = ',', required = true)]
    tickers: Vec<String>,

    /// Engine mode: signal or portfolio (overrides MODE).
    #[arg(long)]
    mode: Option<String>,

    /// Generate decisions pre-market, execute after the close.
    #[arg(long)]
    live: bool,

    /// Starting cash for a fresh portfolio (overrides INITIAL_CASH).
    #[arg(long)]
    initial_cash: Option<f64>,

    /// Margin requirement in [0, 1] (overrides MARGIN_REQUIREMENT).
    #[arg(long)]
    margin_requirement: Option<f64>,

    /// Disable the post-analysis communication phase.
    #[arg(long)]
    no_communications: bool,

    /// Disable notifications and the second analyst round.
    #[arg(long)]
    no_notifications: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;

    if let Some(mode) = &cli.mode {
        config.mode = mode.parse()?;
    }
    if cli.live {
        config.is_live_mode = true;
    }
    if let Some(cash) = cli.initial_cash {
        config.initial_cash =
            Decimal::from_f64(cash).context("--initial-cash is not a valid number")?;
    }
    if let Some(margin) = cli.margin_requirement {
        anyhow::ensure!(
            (0.0..=1.0).contains(&margin),
            "--margin-requirement must be in [0, 1]"
        );
        config.margin_requirement = margin;
    }
    if cli.no_communications {
        config.enable_communications = false;
    }
    if cli.no_notifications {
        config.enable_notifications = false;
    }

    info!(
        "Starting {} analysis {}..{} over {:?}",
        config.mode, cli.start_date, cli.end_date, cli.tickers
    );

    let http = config.http_settings();
    let mut gateway = ModelGateway::new();
    if let Some(key) = &config.openai_api_key {
        gateway.register(
            Provider::OpenAi,
            Arc::new(OpenAiProvider::new(key, config.openai_base_url.clone(), &http)),
        );
        gateway.register(
            Provider::Compatible,
            Arc::new(OpenAiProvider::new(key, config.openai_base_url.clone(), &http)),
        );
    }
    if let Some(key) = &config.anthropic_api_key {
        gateway.register(
            Provider::Anthropic,
            Arc::new(AnthropicProvider::new(key, config.anthropic_base_url.clone(), &http)),
        );
    }

    let persistence = Arc::new(PersistenceService::new(
        config.base_dir.clone(),
        config.config_name.clone(),
    ));
    let dashboard = Arc::new(FileDashboardSink::new(persistence.dashboard_dir()));
    let market_data = Arc::new(FinancialDatasetsClient::new(
        config.financial_api_key.clone().unwrap_or_default(),
        config.market_data_base_url.clone(),
        &http,
    ));
    let personas = Arc::new(PersonaCatalog::load_or_builtin(
        config.personas_file.as_deref(),
    ));

    let services = Arc::new(ServiceRegistry::new(
        Arc::new(gateway),
        Arc::new(MemoryStore::new(Arc::new(InMemoryMemoryBackend::new()))),
        market_data,
        Some(Arc::new(WeekdayCalendar) as Arc<dyn ExchangeCalendar>),
        Some(dashboard as Arc<dyn DashboardSink>),
        persistence,
        personas,
        config.engine_settings(),
    ));

    let driver = MultiDayDriver::new(services);
    let summary = driver
        .run(SessionConfig {
            start_date: cli.start_date,
            end_date: cli.end_date,
            tickers: cli.tickers,
            mode: config.mode,
            initial_cash: config.initial_cash,
            margin_requirement: config.margin_requirement,
            is_live_mode: config.is_live_mode,
            api_keys: config.api_keys(),
            models: config.model_metadata(),
        })
        .await;

    info!(
        "Session {} finished: {}/{} days succeeded",
        summary.session_id, summary.successful_days, summary.total_days
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
