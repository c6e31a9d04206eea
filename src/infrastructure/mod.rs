pub mod calendar;
pub mod dashboard;
pub mod http;
pub mod llm;
pub mod market_data;
pub mod memory_backend;
pub mod mock;
pub mod persistence;

pub use memory_backend::InMemoryMemoryBackend;
pub use persistence::PersistenceService;
