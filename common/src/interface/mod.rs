pub mod data_store;
pub mod inference;

pub use data_store::PersistenceGateway;
pub use inference::{CompletionPrompt, InferenceModel, ModelOutput, SecretDetector};
