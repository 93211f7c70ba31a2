mod file;

pub use file::FileConfigProvider;

use crate::model::config::Config;
use async_trait::async_trait;
use tokio::sync::watch;

/// Source of application configuration. Implementations may support change
/// notification via `watch`.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load_config(&self) -> Result<Config, String>;
    async fn watch(&self) -> Result<watch::Receiver<Config>, String>;
}
