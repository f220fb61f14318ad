//! Wire protocol, frame codec, tunnel pairing and the auth handshake shared
//! by the warren server and client binaries.

pub mod auth;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod session;
pub mod tunnel;
pub mod writer;

pub use auth::{authenticate, AuthState};
pub use codec::{FrameCodec, FrameEvent};
pub use command::Command;
pub use error::{AuthError, CodecError, TunnelCloseReason};
pub use frame::Frame;
pub use session::SessionId;
pub use tunnel::{Side, Tunnel, TunnelCell, TunnelEndpoint};
