use clap::Parser;
use tracing_subscriber::EnvFilter;

use warren_server::{Config, ConfigFile, Server};

/// Default config file name, mirrored after the `WARREND_CONFIG` env override.
const DEFAULT_CONFIG: &str = "warrend.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config file as env-var defaults (before clap parsing), same
    // ordering the client binary uses.
    let config_file_path = std::env::var("WARREND_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
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

    let server = Server::new(config);
    server.run().await?;

    // The listeners and watchers all run on their own spawned tasks; block
    // here for the process lifetime.
    std::future::pending::<()>().await;
    Ok(())
}
