pub mod behavioral_telemetry;
pub mod chat_query;
pub mod completion_query;
pub mod config;
pub mod context;
pub mod contextual_telemetry;
pub mod generation;
pub mod ground_truth;
pub mod meta_query;
pub mod project;
pub mod session;
pub mod user;
