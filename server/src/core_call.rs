//! Operator control instructions delivered to client threads.

use relay_protocol::{ClientId, LobbyId, PAUSE, START};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// Id value meaning "any lobby" or "any client".
pub const ANY: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCommand {
    Start,
    Pause,
    Kick,
}

impl CoreCommand {
    /// Protocol character sent inside a `{0|..}` frame, if the command has one.
    pub fn control_char(self) -> Option<char> {
        match self {
            CoreCommand::Start => Some(START),
            CoreCommand::Pause => Some(PAUSE),
            CoreCommand::Kick => None,
        }
    }
}

impl FromStr for CoreCommand {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(CoreCommand::Start),
            "pause" => Ok(CoreCommand::Pause),
            "kick" => Ok(CoreCommand::Kick),
            other => Err(RelayError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for CoreCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoreCommand::Start => "start",
            CoreCommand::Pause => "pause",
            CoreCommand::Kick => "kick",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreCall {
    pub lobby_id: LobbyId,
    pub client_id: ClientId,
    pub command: CoreCommand,
}

impl CoreCall {
    pub fn new(lobby_id: LobbyId, client_id: ClientId, command: CoreCommand) -> Self {
        Self {
            lobby_id,
            client_id,
            command,
        }
    }

    pub fn matches(&self, lobby_id: LobbyId, client_id: ClientId) -> bool {
        (self.lobby_id == ANY || self.lobby_id == lobby_id)
            && (self.client_id == ANY || self.client_id == client_id)
    }
}
