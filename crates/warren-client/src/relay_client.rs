use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use warren_core::codec::FrameEvent;
use warren_core::writer::{spawn_raw_writer, spawn_writer, FrameSender, RawSender};
use warren_core::{Command, Frame, FrameCodec, Side, Tunnel, TunnelCloseReason, TunnelEndpoint};

use crate::config::Config;
use crate::error::ClientError;

const READ_CHUNK: usize = 16 * 1024;
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct RelayClientLinkState {
    buffer: Vec<Bytes>,
    tunnel: Option<Arc<Tunnel>>,
}

/// The WAN-facing leg of a client-side tunnel: the relay socket dialed back
/// to the server. Buffers `Forward` bodies that arrive before the matching
/// local dial completes — the same single-lock buffer-or-forward trick as
/// the server's `ProxyLink`, since the race it closes is identical.
struct RelayClientLink {
    frame_tx: FrameSender,
    state: Mutex<RelayClientLinkState>,
    shutdown: Notify,
}

impl RelayClientLink {
    fn new(frame_tx: FrameSender) -> Arc<Self> {
        Arc::new(RelayClientLink {
            frame_tx,
            state: Mutex::new(RelayClientLinkState { buffer: Vec::new(), tunnel: None }),
            shutdown: Notify::new(),
        })
    }

    fn deliver_inbound(&self, chunk: Bytes) {
        let mut state = self.state.lock().unwrap();
        match &state.tunnel {
            Some(tunnel) => {
                let tunnel = tunnel.clone();
                drop(state);
                tunnel.write(Side::Server, chunk);
            }
            None => state.buffer.push(chunk),
        }
    }

    /// Stop this relay connection's read loop. Called either because the
    /// tunnel built onto it just closed, or because the local dial that was
    /// meant to produce that tunnel never got the chance to.
    fn force_close(&self) {
        self.shutdown.notify_one();
    }

    async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

impl TunnelEndpoint for RelayClientLink {
    fn on_tunnel_build(&self, tunnel: Arc<Tunnel>) {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            state.tunnel = Some(tunnel.clone());
            std::mem::take(&mut state.buffer)
        };
        for chunk in buffered {
            tunnel.write(Side::Server, chunk);
        }
    }

    fn on_tunnel_write(&self, data: Bytes) {
        let _ = self.frame_tx.send(Frame::new(Command::Forward).with_body(data));
    }

    fn on_tunnel_close(&self, _reason: Option<TunnelCloseReason>) {
        // One relay socket serves exactly one tunnel; once it closes this
        // connection is spent.
        self.force_close();
    }
}

/// The LAN-facing leg: the raw socket dialed to the endpoint the server
/// asked for in `NewTunnel`.
struct LocalDialLink {
    data_tx: RawSender,
}

impl TunnelEndpoint for LocalDialLink {
    fn on_tunnel_build(&self, _tunnel: Arc<Tunnel>) {}

    fn on_tunnel_write(&self, data: Bytes) {
        let _ = self.data_tx.send(data);
    }

    fn on_tunnel_close(&self, _reason: Option<TunnelCloseReason>) {}
}

/// Dial the relay port, authenticate with the session id the manager
/// handed out, and service exactly one tunnel for the lifetime of the
/// socket.
pub async fn run(config: Arc<Config>, session_id: String) {
    if let Err(e) = connect_and_run(&config, &session_id).await {
        warn!(error = %e, "relay connection ended");
    }
}

async fn connect_and_run(config: &Config, session_id: &str) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.relay_host, config.relay_port);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| ClientError::RelayDial { addr: addr.clone(), source })?;
    configure_tcp_keepalive(&stream);

    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(
            Frame::new(Command::AuthRequire)
                .with_header("AuthToken", config.auth_token.clone())
                .with_header("ManagerSessionId", session_id.to_string()),
        )
        .await?;
    framed.send(Frame::new(Command::ClientReady)).await?;

    let (sink, mut events) = framed.split();
    let (frame_tx, _writer_handle) = spawn_writer(sink);
    let relay_link = RelayClientLink::new(frame_tx);
    let mut tunnel_built = false;

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    None => break,
                    Some(Ok(FrameEvent::Command { command, headers })) => match command {
                        Command::AuthSuccess => debug!("relay link authenticated"),
                        Command::ManagerEpochChange => {
                            debug!("relay session id stale, manager epoch changed");
                            return Ok(());
                        }
                        Command::NewTunnel => {
                            if tunnel_built {
                                anyhow::bail!("second NewTunnel on one relay socket");
                            }
                            tunnel_built = true;
                            let endpoint = headers
                                .iter()
                                .rev()
                                .find(|(k, _)| k == "Endpoint")
                                .map(|(_, v)| v.clone())
                                .unwrap_or_default();
                            dial_local_endpoint(endpoint, relay_link.clone());
                        }
                        other => debug!(?other, "unexpected command on relay client, ignoring"),
                    },
                    Some(Ok(FrameEvent::Body(chunk))) => relay_link.deliver_inbound(chunk),
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            _ = relay_link.wait_shutdown() => break,
        }
    }

    Ok(())
}

/// Dial the endpoint the server just announced and, once connected, build
/// the local tunnel. Dial failure closes only the relay transport — no
/// tunnel exists yet at that point, so there's nothing to leave half-open.
fn dial_local_endpoint(endpoint: String, relay_link: Arc<RelayClientLink>) {
    tokio::spawn(async move {
        let stream = match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%endpoint, error = %e, "failed to dial local endpoint");
                relay_link.force_close();
                return;
            }
            Err(_) => {
                warn!(%endpoint, "timed out dialing local endpoint");
                relay_link.force_close();
                return;
            }
        };

        let (mut read_half, write_half) = tokio::io::split(stream);
        let (data_tx, writer_handle) = spawn_raw_writer(write_half);
        let local_link = Arc::new(LocalDialLink { data_tx });

        let tunnel = Tunnel::new(relay_link.clone(), local_link);
        tunnel.build();

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tunnel.write(Side::Client, Bytes::copy_from_slice(&buf[..n])),
            }
        }
        tunnel.close(Side::Client, Some(TunnelCloseReason::PeerClosed));
        writer_handle.abort();
    });
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
