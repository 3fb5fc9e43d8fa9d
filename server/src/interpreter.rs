//! Operator command language shared by the console and rcon
//!
//! Commands are whitespace separated words with case-insensitive verbs. Every
//! command returns a one-line (or, for listings, multi-line) status text, or a
//! [`RelayError`] that the front end prints instead.

use relay_protocol::{ClientId, LobbyId};
use std::fmt::Write;

use crate::core_call::{CoreCommand, ANY};
use crate::error::RelayError;
use crate::registry::Registry;

const HELP: &str = "\
commands:
  help
  lobby create [name] [capacity]
  lobby list
  lobby info <lobby>
  lobby drop <lobby>
  lobby start <lobby|0>
  lobby pause <lobby|0>
  lobby summon <client> [lobby]
  client list
  client kick <client>
  client drop <client>";

pub fn execute(registry: &Registry, line: &str) -> Result<String, RelayError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((verb, args)) = words.split_first() else {
        return Ok(String::new());
    };

    match verb.to_ascii_lowercase().as_str() {
        "help" => Ok(HELP.to_string()),
        "lobby" => lobby_command(registry, args),
        "client" => client_command(registry, args),
        other => Err(RelayError::UnknownCommand(other.to_string())),
    }
}

fn lobby_command(registry: &Registry, args: &[&str]) -> Result<String, RelayError> {
    let Some((action, rest)) = args.split_first() else {
        return Err(RelayError::Usage("lobby <create|list|info|drop|start|pause|summon> ..."));
    };

    match action.to_ascii_lowercase().as_str() {
        "create" => {
            let (name, capacity) = parse_create(rest)?;
            let lobby = registry.add_lobby(name, capacity)?;
            Ok(format!("created lobby {}", lobby.id()))
        }
        "list" => Ok(list_lobbies(registry)),
        "info" => {
            let [target] = rest else {
                return Err(RelayError::Usage("lobby info <lobby>"));
            };
            lobby_info(registry, registry.resolve_lobby(target)?)
        }
        "drop" => {
            let [target] = rest else {
                return Err(RelayError::Usage("lobby drop <lobby>"));
            };
            let id = registry.resolve_lobby(target)?;
            registry.drop_lobby(id)?;
            Ok(format!("dropped lobby {}", id))
        }
        "start" | "pause" => {
            let [target] = rest else {
                return Err(RelayError::Usage("lobby <start|pause> <lobby|0>"));
            };
            let command: CoreCommand = action.parse()?;
            let lobby_id = resolve_lobby_or_any(registry, target)?;
            let reached = registry.broadcast_core_call(lobby_id, ANY, command)?;
            Ok(format!("{} sent to {} lobbies", command, reached))
        }
        "summon" => {
            let (client, target) = match rest {
                [client] => (*client, None),
                [client, lobby] => (*client, Some(registry.resolve_lobby(lobby)?)),
                _ => return Err(RelayError::Usage("lobby summon <client> [lobby]")),
            };
            registry.summon(parse_client(client)?, target)
        }
        other => Err(RelayError::UnknownCommand(format!("lobby {}", other))),
    }
}

fn client_command(registry: &Registry, args: &[&str]) -> Result<String, RelayError> {
    match args {
        [action] if action.eq_ignore_ascii_case("list") => Ok(list_clients(registry)),
        [action, client] => {
            let id = parse_client(client)?;
            match action.to_ascii_lowercase().as_str() {
                "kick" => {
                    let lobby_id = registry
                        .find_client(id)
                        .and_then(|c| c.lobby_id)
                        .ok_or(RelayError::UnknownClient(id))?;
                    registry.broadcast_core_call(lobby_id, id, CoreCommand::Kick)?;
                    Ok(format!("kick sent to client {}", id))
                }
                "drop" => {
                    registry.drop_client(id)?;
                    Ok(format!("dropped client {}", id))
                }
                other => Err(RelayError::UnknownCommand(format!("client {}", other))),
            }
        }
        _ => Err(RelayError::Usage("client <list|kick|drop> [client]")),
    }
}

/// `[name] [capacity]`: a lone number is a capacity, not a name.
fn parse_create(args: &[&str]) -> Result<(Option<String>, Option<usize>), RelayError> {
    const USAGE: &str = "lobby create [name] [capacity]";
    match args {
        [] => Ok((None, None)),
        [single] => match single.parse::<usize>() {
            Ok(capacity) => Ok((None, Some(capacity))),
            Err(_) => Ok((Some(single.to_string()), None)),
        },
        [name, capacity] => {
            let capacity = capacity
                .parse::<usize>()
                .map_err(|_| RelayError::Usage(USAGE))?;
            Ok((Some(name.to_string()), Some(capacity)))
        }
        _ => Err(RelayError::Usage(USAGE)),
    }
}

fn resolve_lobby_or_any(registry: &Registry, text: &str) -> Result<LobbyId, RelayError> {
    if text == "0" {
        return Ok(ANY);
    }
    registry.resolve_lobby(text)
}

fn parse_client(text: &str) -> Result<ClientId, RelayError> {
    match text.parse::<ClientId>() {
        Ok(0) | Err(_) => Err(RelayError::Usage("<client> is a positive numeric id")),
        Ok(id) => Ok(id),
    }
}

fn list_lobbies(registry: &Registry) -> String {
    let mut out = String::new();
    for lobby in registry.lobbies() {
        let capacity = match lobby.capacity() {
            0 => "unlimited".to_string(),
            n => n.to_string(),
        };
        let _ = writeln!(
            out,
            "lobby {} [{}] {}/{}",
            lobby.id(),
            lobby.name().unwrap_or("-"),
            lobby.population(),
            capacity
        );
    }
    out.truncate(out.trim_end().len());
    out
}

fn lobby_info(registry: &Registry, id: LobbyId) -> Result<String, RelayError> {
    let lobby = registry
        .find_lobby(id)
        .ok_or_else(|| RelayError::UnknownLobby(id.to_string()))?;
    let members: Vec<String> = lobby.member_ids().iter().map(|id| id.to_string()).collect();
    Ok(format!(
        "lobby {} [{}] capacity {} members: {}",
        lobby.id(),
        lobby.name().unwrap_or("-"),
        lobby.capacity(),
        if members.is_empty() {
            "none".to_string()
        } else {
            members.join(" ")
        }
    ))
}

fn list_clients(registry: &Registry) -> String {
    let clients = registry.clients();
    if clients.is_empty() {
        return "no clients connected".to_string();
    }
    let mut out = String::new();
    for client in clients {
        let lobby = client
            .lobby_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "client {} from {} in lobby {}{}",
            client.id,
            client.peer,
            lobby,
            if client.online { "" } else { " (leaving)" }
        );
    }
    out.truncate(out.trim_end().len());
    out
}
