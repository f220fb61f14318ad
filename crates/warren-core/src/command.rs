use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

/// The closed set of commands carried by frames in either direction.
///
/// Closed deliberately: an unrecognised `Command:` header is a protocol
/// error, not a forward-compatible unknown variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    AuthRequire,
    AuthSuccess,
    ManagerKickOut,
    ManagerEpochChange,
    NewReplier,
    ClientReady,
    NewTunnel,
    /// Reserved: parsed but never emitted by either side. No handler treats
    /// it as anything but a no-op; see `DESIGN.md` for why it stays in the
    /// closed set anyway.
    CloseTunnel,
    Forward,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::AuthRequire => "AuthRequire",
            Command::AuthSuccess => "AuthSuccess",
            Command::ManagerKickOut => "ManagerKickOut",
            Command::ManagerEpochChange => "ManagerEpochChange",
            Command::NewReplier => "NewReplier",
            Command::ClientReady => "ClientReady",
            Command::NewTunnel => "NewTunnel",
            Command::CloseTunnel => "CloseTunnel",
            Command::Forward => "Forward",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AuthRequire" => Ok(Command::AuthRequire),
            "AuthSuccess" => Ok(Command::AuthSuccess),
            "ManagerKickOut" => Ok(Command::ManagerKickOut),
            "ManagerEpochChange" => Ok(Command::ManagerEpochChange),
            "NewReplier" => Ok(Command::NewReplier),
            "ClientReady" => Ok(Command::ClientReady),
            "NewTunnel" => Ok(Command::NewTunnel),
            "CloseTunnel" => Ok(Command::CloseTunnel),
            "Forward" => Ok(Command::Forward),
            other => Err(CodecError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let all = [
            Command::AuthRequire,
            Command::AuthSuccess,
            Command::ManagerKickOut,
            Command::ManagerEpochChange,
            Command::NewReplier,
            Command::ClientReady,
            Command::NewTunnel,
            Command::CloseTunnel,
            Command::Forward,
        ];
        for cmd in all {
            assert_eq!(cmd, cmd.as_str().parse().unwrap());
        }
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(matches!(
            "Frobnicate".parse::<Command>(),
            Err(CodecError::UnknownCommand(s)) if s == "Frobnicate"
        ));
    }
}
