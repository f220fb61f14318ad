use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::manager::ManagerServer;
use crate::pool::{PoolEvent, RelayPool};
use crate::proxy::{ProxyPortInfo, ProxyServer};
use crate::relay::RelayServer;

/// Everything the admin surface (`CreateProxyPort` / `RemoveProxyPort` /
/// `ListProxyPorts` / `SubscribePoolChanges`) needs. Built once at startup
/// and handed to whatever external layer (HTTP/WS, CLI, tests) drives it —
/// the core itself never exposes a transport for these operations.
pub struct Server {
    broadcaster: Arc<Broadcaster>,
    pool: Arc<RelayPool>,
    manager: Arc<ManagerServer>,
    relay: Arc<RelayServer>,
    pub proxy: Arc<ProxyServer>,
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Arc<Self> {
        let broadcaster = Broadcaster::new();
        let pool = RelayPool::new();
        let auth_timeout = Duration::from_secs(config.auth_timeout_secs);

        let manager = ManagerServer::new(
            broadcaster.clone(),
            pool.clone(),
            config.auth_token.clone(),
            auth_timeout,
            config.idle_replier_num,
        );
        let relay = RelayServer::new(
            broadcaster.clone(),
            pool.clone(),
            config.auth_token.clone(),
            auth_timeout,
        );
        let proxy = ProxyServer::new(broadcaster.clone(), pool.clone());

        Arc::new(Server { broadcaster, pool, manager, relay, proxy, config })
    }

    /// Start the manager/relay listeners and the background watchers that
    /// react to a manager going away, then pre-create every
    /// `internal_endpoints` entry from config. Returns once the listeners
    /// are bound; they keep running on their own spawned tasks.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let manager = self.manager.clone();
        let manager_host = self.config.manager_host.clone();
        let manager_port = self.config.manager_port;
        tokio::spawn(async move {
            if let Err(e) = manager.serve(&manager_host, manager_port).await {
                error!(error = %e, "manager listener exited");
            }
        });

        let relay = self.relay.clone();
        let relay_host = self.config.relay_host.clone();
        let relay_port = self.config.relay_port;
        tokio::spawn(async move {
            if let Err(e) = relay.serve(&relay_host, relay_port).await {
                error!(error = %e, "relay listener exited");
            }
        });

        tokio::spawn(self.relay.clone().run_close_watcher());
        tokio::spawn(self.proxy.clone().run_close_watcher());

        for spec in self.config.parsed_internal_endpoints().map_err(anyhow::Error::msg)? {
            let endpoint = format!("{}:{}", spec.target_host, spec.target_port);
            match self.proxy.create_proxy_port(endpoint.clone(), spec.bind_port).await {
                Ok(info) => info!(endpoint = %endpoint, bound = %info.bound_addr, "internal proxy port ready"),
                Err(e) => error!(endpoint = %endpoint, error = %e, "failed to create internal proxy port"),
            }
        }

        Ok(())
    }

    pub async fn create_proxy_port(&self, endpoint: impl Into<String>, bind_port: u16) -> Result<ProxyPortInfo, String> {
        self.proxy.create_proxy_port(endpoint, bind_port).await
    }

    pub fn remove_proxy_port(&self, server_id: u64) -> Result<(), &'static str> {
        self.proxy.remove_proxy_port(server_id)
    }

    pub fn list_proxy_ports(&self) -> Vec<ProxyPortInfo> {
        self.proxy.list_proxy_ports()
    }

    pub fn subscribe_pool_changes(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }
}
