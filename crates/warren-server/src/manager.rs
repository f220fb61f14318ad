use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use warren_core::codec::FrameEvent;
use warren_core::writer::{spawn_writer, FrameSender};
use warren_core::{authenticate, Command, Frame, FrameCodec, SessionId};

use crate::broadcaster::Broadcaster;
use crate::error::ServerError;
use crate::pool::RelayPool;

/// Raised when a frame can't be queued on a manager link's writer — the link
/// is on its way out (writer task already exited). Call sites treat this as
/// best-effort and ignore it; `NewReplier` pushes are fire-and-forget.
#[derive(Debug, Clone, Copy)]
pub struct ManagerUnavailable;

/// The single active control connection from a client. Owns the session id
/// relay links must present and the channel used to push it frames.
pub struct ManagerLink {
    pub id: u64,
    pub peer_addr: SocketAddr,
    session_id: SessionId,
    frame_tx: FrameSender,
    kicked: Notify,
}

impl ManagerLink {
    fn new(id: u64, peer_addr: SocketAddr, session_id: SessionId, frame_tx: FrameSender) -> Arc<Self> {
        Arc::new(ManagerLink {
            id,
            peer_addr,
            session_id,
            frame_tx,
            kicked: Notify::new(),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// `ApplyNewReplier(n)` — ask this manager to open `n` more relay
    /// sockets. Best-effort: a link that's already gone just returns an
    /// error the caller ignores.
    pub fn apply_new_replier(&self, n: u32) -> Result<(), ManagerUnavailable> {
        let frame = Frame::new(Command::NewReplier)
            .with_header("ReplierNum", n.to_string())
            .with_header("ManagerSessionId", self.session_id.to_string());
        self.frame_tx.send(frame).map_err(|_| ManagerUnavailable)
    }

    /// Send `ManagerKickOut` and wake this link's connection task so it
    /// closes the transport. Called when a newer manager supersedes it.
    fn kick_out(&self) {
        let _ = self.frame_tx.send(Frame::new(Command::ManagerKickOut));
        self.kicked.notify_one();
    }

    async fn wait_kicked(&self) {
        self.kicked.notified().await;
    }
}

/// Listens on the manager port. At most one manager link is "current" at a
/// time; a fresh auth success immediately supersedes whoever held that spot.
pub struct ManagerServer {
    broadcaster: Arc<Broadcaster>,
    pool: Arc<RelayPool>,
    auth_token: String,
    auth_timeout: Duration,
    idle_replier_num: u32,
    next_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl ManagerServer {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        pool: Arc<RelayPool>,
        auth_token: String,
        auth_timeout: Duration,
        idle_replier_num: u32,
    ) -> Arc<Self> {
        Arc::new(ManagerServer {
            broadcaster,
            pool,
            auth_token,
            auth_timeout,
            idle_replier_num,
            next_id: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
        })
    }

    pub async fn serve(self: Arc<Self>, host: &str, port: u16) -> Result<(), ServerError> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::ManagerBind { addr: addr.clone(), source })?;
        info!(%addr, "manager listener bound");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "manager accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move { this.handle_connection(stream, peer_addr).await });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let mut framed = Framed::new(stream, FrameCodec::new());

        if let Err(e) = authenticate(&mut framed, &self.auth_token, self.auth_timeout, |_| Ok(())).await {
            debug!(%peer_addr, error = %e, "manager auth failed");
            return;
        }
        configure_tcp_keepalive(framed.get_ref());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = SessionId::generate();

        let (sink, mut events) = framed.split();
        let (frame_tx, _writer_handle) = spawn_writer(sink);
        let link = ManagerLink::new(id, peer_addr, session_id, frame_tx);

        // Drain the pool before this manager's first NewReplier frame goes
        // out, so no stale-epoch relay can be pulled into a tunnel
        // requested under the new manager.
        for relay in self.pool.drain() {
            relay.close_transport();
        }

        if let Some(previous) = self.broadcaster.set_manager(link.clone()) {
            previous.kick_out();
            self.broadcaster.fire_manager_close(previous);
        }

        info!(id, epoch, %peer_addr, "manager authenticated");

        if self.idle_replier_num > 0 {
            let _ = link.apply_new_replier(self.idle_replier_num);
        }

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        None => break,
                        Some(Ok(FrameEvent::Command { command: Command::CloseTunnel, .. })) => {}
                        Some(Ok(FrameEvent::Command { command, .. })) => {
                            debug!(id, ?command, "unexpected command on manager link, ignoring");
                        }
                        Some(Ok(FrameEvent::Body(_))) => {}
                        Some(Err(e)) => {
                            warn!(id, error = %e, "manager link codec error");
                            break;
                        }
                    }
                }
                _ = link.wait_kicked() => {
                    debug!(id, "manager link kicked out");
                    break;
                }
            }
        }

        if self.broadcaster.clear_manager_if(&link) {
            self.broadcaster.fire_manager_close(link.clone());
        }
        debug!(id, %peer_addr, "manager connection closed");
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
        warn!(error = %e, "failed to set TCP keepalive on manager socket");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    /// A `ManagerLink` with its writer channel immediately disconnected —
    /// enough to exercise `Broadcaster` bookkeeping without a real socket.
    pub fn dummy_manager_link(id: u64) -> Arc<ManagerLink> {
        let (tx, _rx) = mpsc::unbounded_channel();
        ManagerLink::new(
            id,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            SessionId::generate(),
            tx,
        )
    }
}
