use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use warren_core::codec::FrameEvent;
use warren_core::writer::{spawn_writer, FrameSender};
use warren_core::{authenticate, AuthError, Command, Frame, FrameCodec, Side, Tunnel, TunnelCell, TunnelCloseReason, TunnelEndpoint};

use crate::broadcaster::Broadcaster;
use crate::error::ServerError;
use crate::pool::RelayPool;

/// An authenticated relay socket: idle in the pool, or servicing exactly one
/// tunnel for its whole lifetime.
pub struct RelayLink {
    pub id: u64,
    pub peer_addr: SocketAddr,
    frame_tx: FrameSender,
    tunnel: TunnelCell,
    shutdown: Notify,
}

impl RelayLink {
    fn new(id: u64, peer_addr: SocketAddr, frame_tx: FrameSender) -> Arc<Self> {
        Arc::new(RelayLink {
            id,
            peer_addr,
            frame_tx,
            tunnel: TunnelCell::new(),
            shutdown: Notify::new(),
        })
    }

    /// Force this relay's connection-handling task to stop and close the
    /// socket, whether or not it's mid-tunnel.
    pub fn close_transport(&self) {
        self.shutdown.notify_one();
    }

    async fn wait_closed(&self) {
        self.shutdown.notified().await;
    }
}

impl TunnelEndpoint for RelayLink {
    fn on_tunnel_build(&self, tunnel: Arc<Tunnel>) {
        let endpoint = tunnel.endpoint_label().unwrap_or_default().to_string();
        let _ = self
            .frame_tx
            .send(Frame::new(Command::NewTunnel).with_header("Endpoint", endpoint));
    }

    fn on_tunnel_write(&self, data: Bytes) {
        let _ = self.frame_tx.send(Frame::new(Command::Forward).with_body(data));
    }

    fn on_tunnel_close(&self, _reason: Option<TunnelCloseReason>) {
        // A relay serves exactly one tunnel; once it closes the socket is
        // spent and should go away entirely, not return to the pool.
        self.close_transport();
    }
}

/// Listens on the relay port. Every accepted connection must present the
/// current manager's session id in `AuthRequire`; once authenticated it is
/// enqueued in the shared pool until a proxy accept pulls it out.
pub struct RelayServer {
    broadcaster: Arc<Broadcaster>,
    pool: Arc<RelayPool>,
    auth_token: String,
    auth_timeout: Duration,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Arc<RelayLink>>>,
}

impl RelayServer {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        pool: Arc<RelayPool>,
        auth_token: String,
        auth_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(RelayServer {
            broadcaster,
            pool,
            auth_token,
            auth_timeout,
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
        })
    }

    pub async fn serve(self: Arc<Self>, host: &str, port: u16) -> Result<(), ServerError> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::RelayBind { addr: addr.clone(), source })?;
        info!(%addr, "relay listener bound");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "relay accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move { this.handle_connection(stream, peer_addr).await });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let Some(manager) = self.broadcaster.current_manager() else {
            debug!(%peer_addr, "relay connect with no active manager, rejecting");
            return;
        };

        let mut framed = Framed::new(stream, FrameCodec::new());
        let expected_session = manager.session_id().to_string();
        let result = authenticate(&mut framed, &self.auth_token, self.auth_timeout, |headers| {
            let presented = headers
                .iter()
                .rev()
                .find(|(k, _)| k == "ManagerSessionId")
                .map(|(_, v)| v.as_str())
                .unwrap_or("");
            if presented == expected_session {
                Ok(())
            } else {
                Err(AuthError::SessionExpired)
            }
        })
        .await;

        match result {
            Ok(_headers) => {}
            Err(AuthError::SessionExpired) => {
                use futures_util::SinkExt;
                let _ = framed.send(Frame::new(Command::ManagerEpochChange)).await;
                debug!(%peer_addr, "relay session id stale, epoch changed");
                return;
            }
            Err(e) => {
                debug!(%peer_addr, error = %e, "relay auth failed");
                return;
            }
        }

        configure_tcp_keepalive(framed.get_ref());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, mut events) = framed.split();
        let (frame_tx, _writer_handle) = spawn_writer(sink);
        let link = RelayLink::new(id, peer_addr, frame_tx);

        self.live.lock().unwrap().insert(id, link.clone());
        self.pool.put(link.clone());
        debug!(id, %peer_addr, "relay authenticated and pooled");

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        None => break,
                        Some(Ok(FrameEvent::Command { command, .. })) => {
                            match command {
                                Command::Forward => {}
                                Command::ClientReady => debug!(id, "relay client ready"),
                                Command::CloseTunnel => {}
                                other => {
                                    warn!(id, ?other, "unexpected command on relay link, closing");
                                    break;
                                }
                            }
                        }
                        Some(Ok(FrameEvent::Body(chunk))) => {
                            link.tunnel.write(Side::Server, chunk);
                        }
                        Some(Err(e)) => {
                            warn!(id, error = %e, "relay codec error");
                            break;
                        }
                    }
                }
                _ = link.wait_closed() => {
                    break;
                }
            }
        }

        self.live.lock().unwrap().remove(&id);
        self.pool.remove(&link);
        link.tunnel.close(Side::Server, Some(TunnelCloseReason::PeerClosed));
        debug!(id, %peer_addr, "relay connection closed");
    }

    /// React to the broadcaster's close signal (manager superseded or lost):
    /// every live relay — idle in the pool or mid-tunnel — belongs to an
    /// epoch that's now gone, so all of them are torn down.
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
        for relay in self.pool.drain() {
            relay.close_transport();
        }
        let live: Vec<_> = self.live.lock().unwrap().values().cloned().collect();
        for relay in live {
            relay.close_transport();
        }
    }
}

fn configure_tcp_keepalive(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(2))
        .with_interval(Duration::from_secs(6));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive on relay socket");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    /// A `RelayLink` with its writer channel immediately disconnected — used
    /// by pool tests that only care about FIFO identity, not wire traffic.
    pub fn dummy_relay_link(id: u64) -> Arc<RelayLink> {
        let (tx, _rx) = mpsc::unbounded_channel();
        RelayLink::new(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), tx)
    }
}
