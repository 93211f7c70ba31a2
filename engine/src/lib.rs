pub mod analytics;
pub mod api;
pub mod engine;
pub mod orchestrator;
pub mod registry;

pub use analytics::AnalyticsSink;
pub use engine::Engine;
pub use orchestrator::Orchestrator;
pub use registry::ConnectionRegistry;
