use std::path::Path;

use clap::Parser;
use serde::Deserialize;

/// warren reverse-tunnel server: accepts a manager link, pools relay
/// connections and serves proxy ports that hand traffic down the tunnel.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address the manager link listens on
    #[arg(long, env = "WARREND_MANAGER_HOST", default_value = "0.0.0.0")]
    pub manager_host: String,

    /// Port the manager link listens on
    #[arg(long, env = "WARREND_MANAGER_PORT", default_value_t = 7001)]
    pub manager_port: u16,

    /// Address relay links connect back to
    #[arg(long, env = "WARREND_RELAY_HOST", default_value = "0.0.0.0")]
    pub relay_host: String,

    /// Port relay links connect back to
    #[arg(long, env = "WARREND_RELAY_PORT", default_value_t = 7002)]
    pub relay_port: u16,

    /// Shared token every manager/relay link must present in AuthRequire
    #[arg(long, env = "WARREND_AUTH_TOKEN")]
    pub auth_token: String,

    /// Seconds a freshly accepted link gets to complete the auth handshake
    #[arg(long, env = "WARREND_AUTH_TIMEOUT_SECS", default_value_t = 2)]
    pub auth_timeout_secs: u64,

    /// Idle relay connections to pre-warm every time a manager connects
    #[arg(long, env = "WARREND_IDLE_REPLIER_NUM", default_value_t = 5)]
    pub idle_replier_num: u32,

    /// Proxy ports to open at startup, `target_host:target_port@bind_port`
    /// (bind_port 0 picks an ephemeral port). Repeat the flag for more than
    /// one.
    #[arg(long = "internal-endpoint", env = "WARREND_INTERNAL_ENDPOINTS", value_delimiter = ',')]
    pub internal_endpoints: Vec<String>,

    /// Log filter passed to `tracing_subscriber::EnvFilter`
    #[arg(long, env = "WARREND_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// One `target_host:target_port@bind_port` entry from `--internal-endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEndpointSpec {
    pub target_host: String,
    pub target_port: u16,
    pub bind_port: u16,
}

impl std::str::FromStr for InternalEndpointSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, bind) = s
            .split_once('@')
            .ok_or_else(|| format!("{s:?} is missing the @bind_port suffix"))?;
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| format!("{s:?} is missing :target_port"))?;
        Ok(InternalEndpointSpec {
            target_host: host.to_string(),
            target_port: port.parse().map_err(|_| format!("{port:?} is not a valid port"))?,
            bind_port: bind.parse().map_err(|_| format!("{bind:?} is not a valid port"))?,
        })
    }
}

impl Config {
    pub fn parsed_internal_endpoints(&self) -> Result<Vec<InternalEndpointSpec>, String> {
        self.internal_endpoints.iter().map(|s| s.parse()).collect()
    }
}

/// Optional TOML overlay, loaded before clap parsing; its values are
/// injected as env vars ahead of `Config::parse`.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub manager_host: Option<String>,
    pub manager_port: Option<u16>,
    pub relay_host: Option<String>,
    pub relay_port: Option<u16>,
    pub auth_token: Option<String>,
    pub auth_timeout_secs: Option<u64>,
    pub idle_replier_num: Option<u32>,
    #[serde(default)]
    pub internal_endpoints: Vec<String>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Set `WARREND_*` env vars for any field present in the file, so a
    /// subsequent `Config::parse()` picks them up as defaults. CLI flags
    /// still win, since clap only falls back to `env` when the flag is
    /// absent.
    pub fn inject_env(&self) {
        macro_rules! inject {
            ($key:literal, $val:expr) => {
                if let Some(v) = $val {
                    std::env::set_var($key, v.to_string());
                }
            };
        }
        inject!("WARREND_MANAGER_HOST", &self.manager_host);
        inject!("WARREND_MANAGER_PORT", self.manager_port);
        inject!("WARREND_RELAY_HOST", &self.relay_host);
        inject!("WARREND_RELAY_PORT", self.relay_port);
        inject!("WARREND_AUTH_TOKEN", &self.auth_token);
        inject!("WARREND_AUTH_TIMEOUT_SECS", self.auth_timeout_secs);
        inject!("WARREND_IDLE_REPLIER_NUM", self.idle_replier_num);
        inject!("WARREND_LOG_LEVEL", &self.log_level);
        if !self.internal_endpoints.is_empty() {
            std::env::set_var("WARREND_INTERNAL_ENDPOINTS", self.internal_endpoints.join(","));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_endpoint_spec_parses_host_port_bind() {
        let spec: InternalEndpointSpec = "127.0.0.1:8080@9000".parse().unwrap();
        assert_eq!(spec.target_host, "127.0.0.1");
        assert_eq!(spec.target_port, 8080);
        assert_eq!(spec.bind_port, 9000);
    }

    #[test]
    fn internal_endpoint_spec_rejects_missing_bind_port() {
        assert!("127.0.0.1:8080".parse::<InternalEndpointSpec>().is_err());
    }
}
