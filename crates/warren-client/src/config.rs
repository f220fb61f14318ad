use std::path::Path;

use clap::Parser;
use serde::Deserialize;

/// warren reverse-tunnel client: dials the manager, then dials a relay
/// connection per `NewReplier` request.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address the server's manager link listens on
    #[arg(long, env = "WARREN_MANAGER_HOST")]
    pub manager_host: String,

    /// Port the server's manager link listens on
    #[arg(long, env = "WARREN_MANAGER_PORT")]
    pub manager_port: u16,

    /// Address the server's relay link listens on
    #[arg(long, env = "WARREN_RELAY_HOST")]
    pub relay_host: String,

    /// Port the server's relay link listens on
    #[arg(long, env = "WARREN_RELAY_PORT")]
    pub relay_port: u16,

    /// Shared token presented in every AuthRequire
    #[arg(long, env = "WARREN_AUTH_TOKEN")]
    pub auth_token: String,

    /// Log filter passed to `tracing_subscriber::EnvFilter`
    #[arg(long, env = "WARREN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Optional TOML overlay, loaded before clap parsing — same shape as the
/// server's `ConfigFile`.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub manager_host: Option<String>,
    pub manager_port: Option<u16>,
    pub relay_host: Option<String>,
    pub relay_port: Option<u16>,
    pub auth_token: Option<String>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn inject_env(&self) {
        macro_rules! inject {
            ($key:literal, $val:expr) => {
                if let Some(v) = $val {
                    std::env::set_var($key, v.to_string());
                }
            };
        }
        inject!("WARREN_MANAGER_HOST", &self.manager_host);
        inject!("WARREN_MANAGER_PORT", self.manager_port);
        inject!("WARREN_RELAY_HOST", &self.relay_host);
        inject!("WARREN_RELAY_PORT", self.relay_port);
        inject!("WARREN_AUTH_TOKEN", &self.auth_token);
        inject!("WARREN_LOG_LEVEL", &self.log_level);
    }
}
