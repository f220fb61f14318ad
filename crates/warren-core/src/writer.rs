use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::Frame;

/// Sender half — cloned freely by whatever parts of a link want to queue an
/// outgoing frame.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// Spawn a dedicated writer task owning `sink`, so every other task on this
/// link writes by handing a `Frame` to the returned channel instead of
/// fighting over the socket directly.
pub fn spawn_writer<S>(mut sink: S) -> (FrameSender, JoinHandle<()>)
where
    S: Sink<Frame> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(error = %e, "writer task failed to send frame, closing link");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}

/// Sender half for an unframed byte stream — used by the raw legs of a
/// tunnel (a proxy link's user socket, a client's local-dial socket) where
/// there is no [`Frame`] to encode, only bytes to forward.
pub type RawSender = mpsc::UnboundedSender<Bytes>;

/// Same shape as [`spawn_writer`] but for a raw `AsyncWrite` half instead of
/// a framed `Sink`. Used wherever a tunnel endpoint needs to push bytes onto
/// a plain TCP socket rather than encode a [`Frame`].
pub fn spawn_raw_writer<W>(mut sink: W) -> (RawSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let handle = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = sink.write_all(&chunk).await {
                warn!(error = %e, "raw writer task failed to write, closing socket");
                break;
            }
        }
        debug!("raw writer task exiting");
        let _ = sink.shutdown().await;
    });

    (tx, handle)
}
