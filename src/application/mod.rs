// Agent modules - the decision-making agents
pub mod agents;

// Inter-agent communication and notifications
pub mod communication;

// LLM access
pub mod gateway;

// Episodic memory facade
pub mod memory;

// Analysis tools and selection
pub mod selector;
pub mod tools;

// Per-day pipeline and cross-day driver
pub mod driver;
pub mod execution;
pub mod orchestrator;
pub mod reflection;

// Dependency wiring
pub mod services;
