use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use warren_client::{manager_client, Config, ConfigFile};

/// Default config file name, overridable with `WARREN_CONFIG`.
const DEFAULT_CONFIG: &str = "warren-agent.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file_path = std::env::var("WARREN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        match ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!("warning: failed to load {config_file_path}: {e}"),
        }
    }

    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    manager_client::run(Arc::new(config)).await;
    Ok(())
}
