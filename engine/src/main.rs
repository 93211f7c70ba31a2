use common::Config;
use engine::Engine;
use log::info;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let logger = config
        .logger
        .clone()
        .unwrap_or(common::model::config::LoggerConfig {
            level: "info".to_string(),
            dir: None,
        });
    utils::logger::init_logger(&logger.level, logger.dir.as_deref());
    info!("Starting tandem engine ({})", config.name);

    let engine = match Engine::build(config).await {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Engine bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.run().await {
        log::error!("Engine exited with error: {}", e);
        std::process::exit(1);
    }
}
