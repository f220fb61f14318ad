use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::error::TunnelCloseReason;

/// Which end of a [`Tunnel`] a call is being made on behalf of. The tunnel
/// only ever has two endpoints, so routing a write or close means handing it
/// to whichever endpoint is *not* `self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Server => Side::Client,
            Side::Client => Side::Server,
        }
    }
}

/// The receiving half of a tunnel pairing. A manager/relay link, a proxy
/// link, or a local-dial point all implement this to get data and close
/// notifications pushed to them.
pub trait TunnelEndpoint: Send + Sync {
    fn on_tunnel_build(&self, tunnel: Arc<Tunnel>);
    fn on_tunnel_write(&self, data: Bytes);
    fn on_tunnel_close(&self, reason: Option<TunnelCloseReason>);
}

/// Pairs two endpoints so data written by one is delivered to the other.
/// Closing is one-shot: the first `close()` wins, every later call
/// (including one from the other side) is a no-op.
pub struct Tunnel {
    server: Arc<dyn TunnelEndpoint>,
    client: Arc<dyn TunnelEndpoint>,
    connected: AtomicBool,
    endpoint: Option<String>,
}

impl Tunnel {
    pub fn new(server: Arc<dyn TunnelEndpoint>, client: Arc<dyn TunnelEndpoint>) -> Arc<Self> {
        Arc::new(Tunnel {
            server,
            client,
            connected: AtomicBool::new(true),
            endpoint: None,
        })
    }

    /// Same as [`Tunnel::new`], carrying the destination `host:port` label a
    /// proxy port copies onto every tunnel it builds — the relay side reads
    /// it back off the built tunnel to announce `NewTunnel { Endpoint }`.
    pub fn with_endpoint(
        server: Arc<dyn TunnelEndpoint>,
        client: Arc<dyn TunnelEndpoint>,
        endpoint: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Tunnel {
            server,
            client,
            connected: AtomicBool::new(true),
            endpoint: Some(endpoint.into()),
        })
    }

    pub fn endpoint_label(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn endpoint(&self, side: Side) -> &Arc<dyn TunnelEndpoint> {
        match side {
            Side::Server => &self.server,
            Side::Client => &self.client,
        }
    }

    /// Notify both endpoints that the tunnel between them now exists.
    pub fn build(self: &Arc<Self>) {
        self.server.on_tunnel_build(self.clone());
        self.client.on_tunnel_build(self.clone());
    }

    /// `sender`'s data, delivered to the other endpoint. Silently dropped
    /// once the tunnel has been closed.
    pub fn write(&self, sender: Side, data: Bytes) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        self.endpoint(sender.other()).on_tunnel_write(data);
    }

    /// Tear down the tunnel. Only the first caller's `reason` is delivered;
    /// everyone after that (regardless of which side calls) gets nothing.
    pub fn close(&self, sender: Side, reason: Option<TunnelCloseReason>) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.endpoint(sender.other()).on_tunnel_close(reason);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

enum TunnelSlot {
    /// The default every [`TunnelCell`] starts in, before a real tunnel has
    /// been built onto it. Writes and builds through it are a programming
    /// error and panic loudly; closes are a harmless no-op.
    FakeClosed,
    Active(Arc<Tunnel>),
}

/// A swappable slot holding "the tunnel currently attached to this
/// endpoint". Endpoints that live longer than any single tunnel (a relay
/// link that may carry many short-lived tunnels over its lifetime) hold one
/// of these rather than an `Arc<Tunnel>` directly.
pub struct TunnelCell(ArcSwap<TunnelSlot>);

impl Default for TunnelCell {
    fn default() -> Self {
        TunnelCell(ArcSwap::new(Arc::new(TunnelSlot::FakeClosed)))
    }
}

impl TunnelCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tunnel: Arc<Tunnel>) {
        self.0.store(Arc::new(TunnelSlot::Active(tunnel)));
    }

    /// # Panics
    /// Panics if no tunnel has ever been built onto this cell.
    pub fn write(&self, sender: Side, data: Bytes) {
        match &*self.0.load() {
            TunnelSlot::FakeClosed => panic!("write on a tunnel cell with no tunnel built"),
            TunnelSlot::Active(t) => t.write(sender, data),
        }
    }

    pub fn close(&self, sender: Side, reason: Option<TunnelCloseReason>) {
        if let TunnelSlot::Active(t) = &*self.0.load() {
            t.close(sender, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        built: Mutex<bool>,
        written: Mutex<Vec<Bytes>>,
        closed: Mutex<Option<Option<String>>>,
    }

    impl TunnelEndpoint for Recorder {
        fn on_tunnel_build(&self, _tunnel: Arc<Tunnel>) {
            *self.built.lock().unwrap() = true;
        }
        fn on_tunnel_write(&self, data: Bytes) {
            self.written.lock().unwrap().push(data);
        }
        fn on_tunnel_close(&self, reason: Option<TunnelCloseReason>) {
            *self.closed.lock().unwrap() = Some(reason.map(|r| r.to_string()));
        }
    }

    #[test]
    fn write_is_delivered_to_the_opposite_side() {
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let tunnel = Tunnel::new(server.clone(), client.clone());
        tunnel.build();

        tunnel.write(Side::Server, Bytes::from_static(b"to-client"));
        tunnel.write(Side::Client, Bytes::from_static(b"to-server"));

        assert_eq!(client.written.lock().unwrap().as_slice(), [Bytes::from_static(b"to-client")]);
        assert_eq!(server.written.lock().unwrap().as_slice(), [Bytes::from_static(b"to-server")]);
        assert!(*server.built.lock().unwrap());
        assert!(*client.built.lock().unwrap());
    }

    #[test]
    fn close_is_one_shot_and_only_notifies_the_other_side_once() {
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let tunnel = Tunnel::new(server.clone(), client.clone());

        tunnel.close(Side::Server, Some(TunnelCloseReason::PeerClosed));
        assert_eq!(
            client.closed.lock().unwrap().clone(),
            Some(Some("peer closed".to_string()))
        );
        assert!(server.closed.lock().unwrap().is_none());

        // a second close, even from the other side, is swallowed.
        tunnel.close(Side::Client, Some(TunnelCloseReason::ManagerLost));
        assert!(server.closed.lock().unwrap().is_none());
        assert!(!tunnel.is_connected());
    }

    #[test]
    fn write_after_close_is_dropped_silently() {
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let tunnel = Tunnel::new(server.clone(), client.clone());
        tunnel.close(Side::Server, None);
        tunnel.write(Side::Client, Bytes::from_static(b"too-late"));
        assert!(client.written.lock().unwrap().is_empty());
    }

    #[test]
    fn fake_closed_cell_allows_close_but_panics_on_write() {
        let cell = TunnelCell::new();
        cell.close(Side::Server, None);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cell.write(Side::Server, Bytes::from_static(b"x"));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn cell_routes_through_whichever_tunnel_was_last_set() {
        let server = Arc::new(Recorder::default());
        let client = Arc::new(Recorder::default());
        let tunnel = Tunnel::new(server.clone(), client.clone());

        let cell = TunnelCell::new();
        cell.set(tunnel);
        cell.write(Side::Server, Bytes::from_static(b"hi"));
        assert_eq!(client.written.lock().unwrap().as_slice(), [Bytes::from_static(b"hi")]);
    }
}
