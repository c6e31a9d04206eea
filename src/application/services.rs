use crate::application::agents::persona::{AnalystType, PersonaCatalog};
use crate::application::communication::{ChatSettings, NotificationHub};
use crate::application::gateway::ModelGateway;
use crate::application::memory::MemoryStore;
use crate::application::selector::ToolSelector;
use crate::application::tools::ToolExecutor;
use crate::domain::ports::{DashboardSink, ExchangeCalendar, MarketDataProvider};
use crate::domain::state::ReviewMode;
use crate::infrastructure::persistence::PersistenceService;
use std::sync::Arc;

/// Session-level behavior switches consumed across the pipeline.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub analyst_types: Vec<AnalystType>,
    pub enable_communications: bool,
    pub enable_notifications: bool,
    pub chat: ChatSettings,
    pub review_mode: ReviewMode,
    /// Concurrent analyst tasks per round.
    pub worker_pool_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            analyst_types: vec![
                AnalystType::Fundamental,
                AnalystType::Technical,
                AnalystType::Sentiment,
                AnalystType::Valuation,
            ],
            enable_communications: true,
            enable_notifications: true,
            chat: ChatSettings::default(),
            review_mode: ReviewMode::IndividualReview,
            worker_pool_size: 4,
        }
    }
}

/// Dependency-injected collaborator bundle. Components receive this instead
/// of reaching for globals; tests wire mocks through the same paths.
pub struct ServiceRegistry {
    pub gateway: Arc<ModelGateway>,
    pub memory: Arc<MemoryStore>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub calendar: Option<Arc<dyn ExchangeCalendar>>,
    pub dashboard: Option<Arc<dyn DashboardSink>>,
    pub persistence: Arc<PersistenceService>,
    pub notifications: Arc<NotificationHub>,
    pub personas: Arc<PersonaCatalog>,
    pub selector: Arc<ToolSelector>,
    pub settings: EngineSettings,
}

impl ServiceRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<ModelGateway>,
        memory: Arc<MemoryStore>,
        market_data: Arc<dyn MarketDataProvider>,
        calendar: Option<Arc<dyn ExchangeCalendar>>,
        dashboard: Option<Arc<dyn DashboardSink>>,
        persistence: Arc<PersistenceService>,
        personas: Arc<PersonaCatalog>,
        settings: EngineSettings,
    ) -> Self {
        let selector = Arc::new(ToolSelector::new(
            gateway.clone(),
            Arc::new(ToolExecutor::new(market_data.clone())),
        ));
        Self {
            gateway,
            memory,
            market_data,
            calendar,
            dashboard,
            persistence,
            notifications: Arc::new(NotificationHub::new()),
            personas,
            selector,
            settings,
        }
    }
}
