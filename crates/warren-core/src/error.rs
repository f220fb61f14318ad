use std::fmt;

/// Errors raised while decoding a byte stream into frames. All of these are
/// link-fatal: the caller closes the transport and does not attempt to
/// resynchronise.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("header block ended without a Command header")]
    MissingCommand,
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("ContentLength must be a positive integer, got {0}")]
    InvalidContentLength(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raised by the auth handshake. All variants are link-fatal.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth handshake timed out")]
    Timeout,
    #[error("auth token mismatch")]
    TokenMismatch,
    #[error("manager session id did not match the current epoch")]
    SessionExpired,
    #[error("a command other than AuthRequire was received before auth completed")]
    UnexpectedCommand,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Carried through `Tunnel::close` purely for logging; never propagated
/// back across the tunnel boundary as an error.
#[derive(Debug, Clone)]
pub enum TunnelCloseReason {
    PeerClosed,
    Io(String),
    ManagerLost,
}

impl fmt::Display for TunnelCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelCloseReason::PeerClosed => write!(f, "peer closed"),
            TunnelCloseReason::Io(e) => write!(f, "io error: {e}"),
            TunnelCloseReason::ManagerLost => write!(f, "manager link lost"),
        }
    }
}
