pub mod inference;
pub mod models;
pub mod persist;
pub mod redact;
pub mod runner;

pub use inference::InferenceWorkerPool;
pub use models::{ModelRegistry, TemplateModel};
pub use persist::PersistWorkerPool;
pub use redact::RegexSecretDetector;
pub use runner::ProcessorRunner;
