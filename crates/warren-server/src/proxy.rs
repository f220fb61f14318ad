use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};

use warren_core::writer::{spawn_raw_writer, RawSender};
use warren_core::{Side, Tunnel, TunnelCloseReason, TunnelEndpoint};

use crate::broadcaster::Broadcaster;
use crate::pool::RelayPool;

const READ_CHUNK: usize = 16 * 1024;

/// Inner, lock-guarded state of a [`ProxyLink`]. Holding the buffer and the
/// tunnel reference behind one lock is what makes "push to buffer" and
/// "drain buffer into the newly built tunnel" race-free: whichever side
/// takes the lock first decides whether a byte goes into the buffer or
/// straight to the tunnel, with no window where a byte could land in the
/// buffer after it was already drained.
struct ProxyLinkState {
    buffer: Vec<Bytes>,
    tunnel: Option<Arc<Tunnel>>,
}

/// One inbound user connection on a proxy port's bound address. Unframed —
/// every byte read from the socket is either buffered (no tunnel yet) or
/// forwarded straight into the tunnel.
pub struct ProxyLink {
    pub id: u64,
    pub peer_addr: SocketAddr,
    data_tx: RawSender,
    state: Mutex<ProxyLinkState>,
    shutdown: Notify,
}

impl ProxyLink {
    fn new(id: u64, peer_addr: SocketAddr, data_tx: RawSender) -> Arc<Self> {
        Arc::new(ProxyLink {
            id,
            peer_addr,
            data_tx,
            state: Mutex::new(ProxyLinkState { buffer: Vec::new(), tunnel: None }),
            shutdown: Notify::new(),
        })
    }

    /// A chunk read off the user socket. Buffered until the tunnel exists,
    /// forwarded directly afterwards — in both cases, strictly in arrival
    /// order.
    fn deliver_inbound(&self, chunk: Bytes) {
        let mut state = self.state.lock().unwrap();
        match &state.tunnel {
            Some(tunnel) => {
                let tunnel = tunnel.clone();
                drop(state);
                tunnel.write(Side::Client, chunk);
            }
            None => state.buffer.push(chunk),
        }
    }

    /// Force this link's connection task to stop, whether or not a tunnel
    /// was ever built onto it (cancelled relay wait, or a manager-loss
    /// broadcast closing an already-tunneled link).
    pub fn force_close(&self) {
        let mut state = self.state.lock().unwrap();
        state.buffer.clear();
        if let Some(tunnel) = state.tunnel.take() {
            drop(state);
            tunnel.close(Side::Client, Some(TunnelCloseReason::PeerClosed));
        }
        self.shutdown.notify_one();
    }

    async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

impl TunnelEndpoint for ProxyLink {
    fn on_tunnel_build(&self, tunnel: Arc<Tunnel>) {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            state.tunnel = Some(tunnel.clone());
            std::mem::take(&mut state.buffer)
        };
        for chunk in buffered {
            tunnel.write(Side::Client, chunk);
        }
    }

    fn on_tunnel_write(&self, data: Bytes) {
        let _ = self.data_tx.send(data);
    }

    fn on_tunnel_close(&self, _reason: Option<TunnelCloseReason>) {
        self.shutdown.notify_one();
    }
}

/// A live proxy port: `(serverId, endpoint, boundAddr)` plus its live proxy
/// links.
pub struct ProxyPort {
    pub server_id: u64,
    pub endpoint: String,
    pub bound_addr: SocketAddr,
    pub created_at: SystemTime,
    links: Mutex<HashMap<u64, Arc<ProxyLink>>>,
    next_link_id: AtomicU64,
    shutdown: Notify,
}

enum ProxyPortSlot {
    /// Sentinel installed while a listener is binding, to serialize
    /// concurrent `create_proxy_port` calls for the same endpoint.
    Creating,
    Ready(Arc<ProxyPort>),
}

#[derive(Debug, Clone)]
pub struct ProxyPortInfo {
    pub server_id: u64,
    pub endpoint: String,
    pub bound_addr: SocketAddr,
    pub created_at: SystemTime,
}

impl From<&ProxyPort> for ProxyPortInfo {
    fn from(port: &ProxyPort) -> Self {
        ProxyPortInfo {
            server_id: port.server_id,
            endpoint: port.endpoint.clone(),
            bound_addr: port.bound_addr,
            created_at: port.created_at,
        }
    }
}

/// Owns the proxy-port registry: the admin surface's
/// `CreateProxyPort`/`RemoveProxyPort`/`ListProxyPorts` live here.
pub struct ProxyServer {
    broadcaster: Arc<Broadcaster>,
    pool: Arc<RelayPool>,
    registry: Mutex<HashMap<String, ProxyPortSlot>>,
    next_id: AtomicU64,
}

impl ProxyServer {
    pub fn new(broadcaster: Arc<Broadcaster>, pool: Arc<RelayPool>) -> Arc<Self> {
        Arc::new(ProxyServer {
            broadcaster,
            pool,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// `CreateProxyPort(endpoint, bindPort)`. Binds `0.0.0.0:bind_port`
    /// (`0` picks an ephemeral port) and spawns its accept loop.
    pub async fn create_proxy_port(
        self: &Arc<Self>,
        endpoint: impl Into<String>,
        bind_port: u16,
    ) -> Result<ProxyPortInfo, String> {
        let endpoint = endpoint.into();

        {
            let mut registry = self.registry.lock().unwrap();
            match registry.get(&endpoint) {
                Some(ProxyPortSlot::Ready(existing)) => return Ok(ProxyPortInfo::from(existing.as_ref())),
                Some(ProxyPortSlot::Creating) => {
                    return Err(format!("proxy port for {endpoint} is already being created"));
                }
                None => {
                    registry.insert(endpoint.clone(), ProxyPortSlot::Creating);
                }
            }
        }

        let bind_addr = format!("0.0.0.0:{bind_port}");
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                self.registry.lock().unwrap().remove(&endpoint);
                return Err(format!("failed to bind {bind_addr}: {e}"));
            }
        };
        let bound_addr = listener
            .local_addr()
            .map_err(|e| format!("failed to read bound address for {bind_addr}: {e}"))?;

        let server_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let port = Arc::new(ProxyPort {
            server_id,
            endpoint: endpoint.clone(),
            bound_addr,
            created_at: SystemTime::now(),
            links: Mutex::new(HashMap::new()),
            next_link_id: AtomicU64::new(0),
            shutdown: Notify::new(),
        });

        self.registry
            .lock()
            .unwrap()
            .insert(endpoint.clone(), ProxyPortSlot::Ready(port.clone()));

        tracing::info!(server_id, %endpoint, %bound_addr, "proxy port created");

        let this = self.clone();
        let accept_port = port.clone();
        tokio::spawn(async move { this.accept_loop(listener, accept_port).await });

        Ok(ProxyPortInfo::from(port.as_ref()))
    }

    /// `RemoveProxyPort(serverId)`. Stops accepting, closes the listener
    /// (by letting the accept task exit), and closes every live proxy link.
    /// Does not wait for in-flight tunnels to drain — bytes in flight at
    /// removal time may be lost.
    pub fn remove_proxy_port(&self, server_id: u64) -> Result<(), &'static str> {
        let mut registry = self.registry.lock().unwrap();
        let endpoint = registry.iter().find_map(|(k, v)| match v {
            ProxyPortSlot::Ready(p) if p.server_id == server_id => Some(k.clone()),
            _ => None,
        });
        let Some(endpoint) = endpoint else { return Err("notfound") };
        let Some(ProxyPortSlot::Ready(port)) = registry.remove(&endpoint) else {
            return Err("notfound");
        };
        drop(registry);

        port.shutdown.notify_one();
        let links: Vec<_> = port.links.lock().unwrap().values().cloned().collect();
        for link in links {
            link.force_close();
        }
        tracing::info!(server_id, %endpoint, "proxy port removed");
        Ok(())
    }

    /// Every proxy accept already races its own `pool.get()` against the
    /// broadcaster's close signal (cancelling a pending relay wait), but a
    /// link that already has a tunnel built is blocked on its user socket's
    /// read loop instead — this watcher is what closes those when the
    /// manager they depend on disappears.
    pub async fn run_close_watcher(self: Arc<Self>) {
        let mut rx = self.broadcaster.subscribe_close();
        loop {
            match rx.recv().await {
                Ok(_) => self.close_all_live(),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn close_all_live(&self) {
        let ports: Vec<_> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .filter_map(|slot| match slot {
                ProxyPortSlot::Ready(p) => Some(p.clone()),
                ProxyPortSlot::Creating => None,
            })
            .collect();
        for port in ports {
            let links: Vec<_> = port.links.lock().unwrap().values().cloned().collect();
            for link in links {
                link.force_close();
            }
        }
    }

    pub fn list_proxy_ports(&self) -> Vec<ProxyPortInfo> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter_map(|slot| match slot {
                ProxyPortSlot::Ready(p) => Some(ProxyPortInfo::from(p.as_ref())),
                ProxyPortSlot::Creating => None,
            })
            .collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, port: Arc<ProxyPort>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, endpoint = %port.endpoint, "proxy accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    let port = port.clone();
                    tokio::spawn(async move { this.handle_connection(stream, peer_addr, port).await });
                }
                _ = port.shutdown.notified() => {
                    tracing::debug!(endpoint = %port.endpoint, "proxy port listener stopping");
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr, port: Arc<ProxyPort>) {
        let Some(manager) = self.broadcaster.current_manager() else {
            tracing::debug!(%peer_addr, endpoint = %port.endpoint, "proxy accept with no active manager, rejecting");
            return;
        };
        // Opportunistic top-up: best-effort, ignored on failure.
        let _ = manager.apply_new_replier(1);

        let id = port.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (mut read_half, write_half) = tokio::io::split(stream);
        let (data_tx, writer_handle) = spawn_raw_writer(write_half);
        let link = ProxyLink::new(id, peer_addr, data_tx);
        port.links.lock().unwrap().insert(id, link.clone());

        let reader_link = link.clone();
        let read_handle = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    result = read_half.read(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => break,
                            Ok(n) => reader_link.deliver_inbound(Bytes::copy_from_slice(&buf[..n])),
                        }
                    }
                    _ = reader_link.wait_shutdown() => break,
                }
            }
        });

        let mut close_rx = self.broadcaster.subscribe_close();
        let relay = tokio::select! {
            relay = self.pool.get() => Some(relay),
            _ = close_rx.recv() => None,
        };

        match relay {
            Some(relay) => {
                let tunnel = Tunnel::with_endpoint(
                    relay as Arc<dyn TunnelEndpoint>,
                    link.clone() as Arc<dyn TunnelEndpoint>,
                    port.endpoint.clone(),
                );
                tunnel.build();
            }
            None => {
                tracing::debug!(%peer_addr, endpoint = %port.endpoint, "manager lost while waiting for a relay");
                link.force_close();
            }
        }

        let _ = read_handle.await;
        link.force_close();
        writer_handle.abort();
        port.links.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn new_link() -> (Arc<ProxyLink>, mpsc::UnboundedReceiver<Bytes>) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let link = ProxyLink::new(0, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), data_tx);
        (link, data_rx)
    }

    struct Recorder {
        written: Mutex<Vec<Bytes>>,
    }

    impl TunnelEndpoint for Recorder {
        fn on_tunnel_build(&self, _tunnel: Arc<Tunnel>) {}
        fn on_tunnel_write(&self, data: Bytes) {
            self.written.lock().unwrap().push(data);
        }
        fn on_tunnel_close(&self, _reason: Option<TunnelCloseReason>) {}
    }

    #[test]
    fn bytes_arriving_before_build_are_flushed_in_order() {
        let (link, _rx) = new_link();
        link.deliver_inbound(Bytes::from_static(b"a"));
        link.deliver_inbound(Bytes::from_static(b"b"));
        link.deliver_inbound(Bytes::from_static(b"c"));

        let other = Arc::new(Recorder { written: Mutex::new(Vec::new()) });
        let tunnel = Tunnel::new(other.clone(), link.clone());
        tunnel.build();

        assert_eq!(
            other.written.lock().unwrap().as_slice(),
            [Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]
        );
    }

    #[test]
    fn bytes_after_build_go_straight_through_without_touching_the_buffer() {
        let (link, _rx) = new_link();
        let other = Arc::new(Recorder { written: Mutex::new(Vec::new()) });
        let tunnel = Tunnel::new(other.clone(), link.clone());
        tunnel.build();

        link.deliver_inbound(Bytes::from_static(b"live"));
        assert_eq!(other.written.lock().unwrap().as_slice(), [Bytes::from_static(b"live")]);
        assert!(link.state.lock().unwrap().buffer.is_empty());
    }

    #[test]
    fn force_close_clears_the_buffer() {
        let (link, _rx) = new_link();
        link.deliver_inbound(Bytes::from_static(b"stale"));
        link.force_close();
        assert!(link.state.lock().unwrap().buffer.is_empty());
    }
}
