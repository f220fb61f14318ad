use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use warren_core::codec::FrameEvent;
use warren_core::{Command, Frame, FrameCodec};

use crate::config::Config;
use crate::error::ClientError;
use crate::relay_client;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Holds the manager link open for the process lifetime: connect,
/// authenticate, dispatch `NewReplier`/`ManagerKickOut`, reconnect on loss.
/// Connect-and-run, then sleep and redial on anything short of a kickout.
pub async fn run(config: Arc<Config>) {
    loop {
        match connect_and_run(&config).await {
            Ok(()) => info!("manager link closed, reconnecting"),
            Err(e) => warn!(error = %e, "manager link lost, reconnecting"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_run(config: &Arc<Config>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.manager_host, config.manager_port);
    info!(%addr, "connecting to manager");
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| ClientError::ManagerDial { addr: addr.clone(), source })?;
    configure_tcp_keepalive(&stream);

    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(Frame::new(Command::AuthRequire).with_header("AuthToken", config.auth_token.clone()))
        .await?;

    match framed.next().await {
        Some(Ok(FrameEvent::Command { command: Command::AuthSuccess, .. })) => {
            info!("manager link authenticated");
        }
        Some(Ok(FrameEvent::Command { command, .. })) => {
            anyhow::bail!("expected AuthSuccess, got {command}");
        }
        Some(Ok(FrameEvent::Body(_))) => anyhow::bail!("unexpected body before AuthSuccess"),
        Some(Err(e)) => return Err(e.into()),
        None => anyhow::bail!("manager closed the connection during auth"),
    }

    while let Some(event) = framed.next().await {
        match event? {
            FrameEvent::Command { command, headers } => match command {
                Command::NewReplier => {
                    let n: u32 = headers
                        .iter()
                        .rev()
                        .find(|(k, _)| k == "ReplierNum")
                        .and_then(|(_, v)| v.parse().ok())
                        .unwrap_or(0);
                    let session_id = headers
                        .iter()
                        .rev()
                        .find(|(k, _)| k == "ManagerSessionId")
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default();
                    debug!(n, "spawning relay dials");
                    for _ in 0..n {
                        tokio::spawn(relay_client::run(config.clone(), session_id.clone()));
                    }
                }
                Command::ManagerKickOut => {
                    info!("kicked out by a newer manager, exiting");
                    std::process::exit(0);
                }
                other => debug!(?other, "unexpected command on manager link, ignoring"),
            },
            FrameEvent::Body(_) => {}
        }
    }

    Ok(())
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
