use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::{FrameCodec, FrameEvent};
use crate::command::Command;
use crate::error::{AuthError, CodecError};
use crate::frame::Frame;

/// Handshake state for an authenticated link. Nothing in this crate holds
/// one across calls — `authenticate` runs the whole transition in one shot
/// and returns `Ok`/`Err`, so the state is encoded in the control flow
/// rather than a stored field: a link object that exists at all has reached
/// `AuthSuccess`, and `AuthFail`/`Expired` are terminal `Err` variants the
/// caller closes the transport on without ever constructing a link. Kept as
/// a public type for callers (tests, future admin-surface status reporting)
/// that want to name these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    WaitAuth,
    AuthSuccess,
    AuthFail,
    Expired,
}

/// Runs the `AuthRequire` → `AuthSuccess` handshake on a freshly accepted
/// link, racing it against `timeout`. A non-auth command, a bad token, or
/// the clock running out are all link-fatal — the caller closes the
/// transport on any `Err`.
///
/// `extra_check` lets a specific link kind reject an otherwise-valid token;
/// the relay server uses it to confirm `ManagerSessionId` still names the
/// current manager epoch. Pass `|_| Ok(())` for links with no extra check.
///
/// On success, returns the headers carried on the `AuthRequire` frame so
/// the caller can read kind-specific fields without re-parsing.
pub async fn authenticate<IO, F>(
    io: &mut Framed<IO, FrameCodec>,
    expected_token: &str,
    timeout: Duration,
    extra_check: F,
) -> Result<Vec<(String, String)>, AuthError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&[(String, String)]) -> Result<(), AuthError>,
{
    let (command, headers) = match tokio::time::timeout(timeout, next_command(io)).await {
        Ok(Some(result)) => result?,
        Ok(None) => return Err(AuthError::Timeout),
        Err(_elapsed) => return Err(AuthError::Timeout),
    };

    if command != Command::AuthRequire {
        return Err(AuthError::UnexpectedCommand);
    }

    let presented = headers
        .iter()
        .rev()
        .find(|(k, _)| k == "AuthToken")
        .map(|(_, v)| v.as_str())
        .unwrap_or("");

    if !tokens_match(presented, expected_token) {
        return Err(AuthError::TokenMismatch);
    }

    extra_check(&headers)?;

    io.send(Frame::new(Command::AuthSuccess)).await?;
    Ok(headers)
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

async fn next_command<IO>(
    io: &mut Framed<IO, FrameCodec>,
) -> Option<Result<(Command, Vec<(String, String)>), CodecError>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match io.next().await? {
            Ok(FrameEvent::Command { command, headers }) => return Some(Ok((command, headers))),
            Ok(FrameEvent::Body(_)) => continue,
            Err(e) => return Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_pair() -> (Framed<tokio::io::DuplexStream, FrameCodec>, Framed<tokio::io::DuplexStream, FrameCodec>) {
        let (a, b) = tokio::io::duplex(4096);
        (Framed::new(a, FrameCodec::new()), Framed::new(b, FrameCodec::new()))
    }

    #[tokio::test]
    async fn valid_token_succeeds_and_replies_with_auth_success() {
        let (mut server_side, mut client_side) = framed_pair();

        let server = tokio::spawn(async move {
            authenticate(&mut server_side, "s3cret", Duration::from_secs(1), |_| Ok(())).await
        });

        client_side
            .send(Frame::new(Command::AuthRequire).with_header("AuthToken", "s3cret"))
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(result.is_ok());

        match client_side.next().await.unwrap().unwrap() {
            FrameEvent::Command { command, .. } => assert_eq!(command, Command::AuthSuccess),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let (mut server_side, mut client_side) = framed_pair();

        let server = tokio::spawn(async move {
            authenticate(&mut server_side, "s3cret", Duration::from_secs(1), |_| Ok(())).await
        });

        client_side
            .send(Frame::new(Command::AuthRequire).with_header("AuthToken", "wrong"))
            .await
            .unwrap();

        assert!(matches!(server.await.unwrap(), Err(AuthError::TokenMismatch)));
    }

    #[tokio::test]
    async fn non_auth_command_first_is_rejected() {
        let (mut server_side, mut client_side) = framed_pair();

        let server = tokio::spawn(async move {
            authenticate(&mut server_side, "s3cret", Duration::from_secs(1), |_| Ok(())).await
        });

        client_side.send(Frame::new(Command::ClientReady)).await.unwrap();

        assert!(matches!(server.await.unwrap(), Err(AuthError::UnexpectedCommand)));
    }

    #[tokio::test]
    async fn silence_past_the_deadline_times_out() {
        let (mut server_side, _client_side) = framed_pair();
        let result = authenticate(&mut server_side, "s3cret", Duration::from_millis(10), |_| Ok(())).await;
        assert!(matches!(result, Err(AuthError::Timeout)));
    }

    #[tokio::test]
    async fn extra_check_can_reject_an_otherwise_valid_token() {
        let (mut server_side, mut client_side) = framed_pair();

        let server = tokio::spawn(async move {
            authenticate(&mut server_side, "s3cret", Duration::from_secs(1), |_headers| {
                Err(AuthError::SessionExpired)
            })
            .await
        });

        client_side
            .send(Frame::new(Command::AuthRequire).with_header("AuthToken", "s3cret"))
            .await
            .unwrap();

        assert!(matches!(server.await.unwrap(), Err(AuthError::SessionExpired)));
    }
}
