//! Error types shared by the lobby, registry and operator front ends.

use relay_protocol::{ClientId, LobbyId, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("lobby {0} is full")]
    LobbyFull(LobbyId),

    #[error("lobby limit of {0} reached")]
    LobbyLimit(usize),

    #[error("the main lobby cannot be dropped")]
    MainLobbyProtected,

    #[error("lobby {0} is shutting down")]
    LobbyStopped(LobbyId),

    #[error("no lobby matches '{0}'")]
    UnknownLobby(String),

    #[error("lobby name '{0}' is already taken")]
    NameTaken(String),

    #[error("no client with id {0}")]
    UnknownClient(ClientId),

    #[error("client {0} is offline")]
    ClientOffline(ClientId),

    #[error("unknown command '{0}', try 'help'")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid setting: {0}")]
    InvalidSetting(&'static str),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
