//! Lobby registry and client directory for the relay server
//!
//! This module owns every live lobby and knows where every connected client is:
//! - Lobby lifecycle (create, look up by id or name, drop)
//! - Admission of freshly accepted connections into the main lobby
//! - Moving clients between lobbies without ever leaving them in two
//! - Fanning operator core calls out to one or all lobbies
//!
//! Locks held by the registry are always released before a lobby is paused,
//! so a lobby coordinator can never wait on a thread that waits on the registry.

use log::{info, warn};
use relay_protocol::{welcome_message, ClientId, LobbyId};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::client::{Client, ClientShared};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::core_call::{CoreCall, CoreCommand, ANY};
use crate::error::RelayError;
use crate::interpreter;
use crate::lobby::{DropMode, Lobby, LobbySettings};

/// Name reserved for the lobby every new connection lands in
pub const MAIN_LOBBY_NAME: &str = "main";

/// Point-in-time view of one connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub id: ClientId,
    /// `None` while the client is between two lobbies
    pub lobby_id: Option<LobbyId>,
    pub online: bool,
    pub peer: SocketAddr,
}

#[derive(Default)]
struct Lobbies {
    by_id: BTreeMap<LobbyId, Arc<Lobby>>,
    by_name: HashMap<String, LobbyId>,
}

/// Owns all lobbies and tracks every connected client
///
/// The registry is always shared as `Arc<Registry>`; client threads hold a
/// `Weak` reference to it so in-band `#join`/`#leave` calls can be resolved
/// without keeping the registry alive past shutdown.
pub struct Registry {
    config: ServerConfig,
    seed: u32,
    main_id: LobbyId,
    lobbies: RwLock<Lobbies>,
    clients: Mutex<HashMap<ClientId, Weak<ClientShared>>>,
    next_lobby_id: AtomicU32,
    next_client_id: AtomicU32,
    me: Weak<Registry>,
}

impl Registry {
    /// Creates the registry together with its main lobby
    ///
    /// The main lobby takes the first lobby id and the reserved name
    /// [`MAIN_LOBBY_NAME`]; it is unlimited regardless of `lobby_capacity`.
    pub fn new(config: ServerConfig, seed: u32) -> Result<Arc<Registry>, RelayError> {
        let main_id = config.lobby_start_id_at;
        let main = Lobby::start(
            main_id,
            Some(MAIN_LOBBY_NAME.to_string()),
            0,
            LobbySettings::from(&config),
        )?;

        let mut lobbies = Lobbies::default();
        lobbies.by_name.insert(MAIN_LOBBY_NAME.to_string(), main_id);
        lobbies.by_id.insert(main_id, Arc::new(main));

        Ok(Arc::new_cyclic(|me| Registry {
            next_lobby_id: AtomicU32::new(main_id.wrapping_add(1)),
            next_client_id: AtomicU32::new(config.client_start_id_at),
            config,
            seed,
            main_id,
            lobbies: RwLock::new(lobbies),
            clients: Mutex::new(HashMap::new()),
            me: me.clone(),
        }))
    }

    fn read_lobbies(&self) -> RwLockReadGuard<'_, Lobbies> {
        self.lobbies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lobbies(&self) -> RwLockWriteGuard<'_, Lobbies> {
        self.lobbies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn directory(&self) -> MutexGuard<'_, HashMap<ClientId, Weak<ClientShared>>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Seed handed to every client in its welcome message
    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn main_lobby_id(&self) -> LobbyId {
        self.main_id
    }

    pub fn main_lobby(&self) -> Result<Arc<Lobby>, RelayError> {
        self.find_lobby(self.main_id)
            .ok_or(RelayError::LobbyStopped(self.main_id))
    }

    /// Creates a lobby and starts its coordinator
    ///
    /// Fails when `lobby_max_count` (main lobby included) is reached or the
    /// name is already in use. Without an explicit capacity the configured
    /// `lobby_capacity` applies.
    pub fn add_lobby(
        &self,
        name: Option<String>,
        capacity: Option<usize>,
    ) -> Result<Arc<Lobby>, RelayError> {
        let mut lobbies = self.write_lobbies();

        let limit = self.config.lobby_max_count;
        if limit > 0 && lobbies.by_id.len() >= limit {
            return Err(RelayError::LobbyLimit(limit));
        }
        if let Some(name) = &name {
            if lobbies.by_name.contains_key(name) || name.parse::<LobbyId>().is_ok() {
                return Err(RelayError::NameTaken(name.clone()));
            }
        }

        let id = self.next_lobby_id.fetch_add(1, Ordering::SeqCst);
        let lobby = Arc::new(Lobby::start(
            id,
            name.clone(),
            capacity.unwrap_or(self.config.lobby_capacity),
            LobbySettings::from(&self.config),
        )?);
        if let Some(name) = name {
            lobbies.by_name.insert(name, id);
        }
        lobbies.by_id.insert(id, Arc::clone(&lobby));
        Ok(lobby)
    }

    /// Stops a lobby and terminates its members. The main lobby is refused.
    pub fn drop_lobby(&self, id: LobbyId) -> Result<(), RelayError> {
        if id == self.main_id {
            return Err(RelayError::MainLobbyProtected);
        }

        let lobby = {
            let mut lobbies = self.write_lobbies();
            let lobby = lobbies
                .by_id
                .remove(&id)
                .ok_or_else(|| RelayError::UnknownLobby(id.to_string()))?;
            if let Some(name) = lobby.name() {
                lobbies.by_name.remove(name);
            }
            lobby
        };

        lobby.shutdown();
        info!("Lobby#{} dropped", id);
        Ok(())
    }

    pub fn find_lobby(&self, id: LobbyId) -> Option<Arc<Lobby>> {
        self.read_lobbies().by_id.get(&id).cloned()
    }

    /// Resolves a numeric id or a name tag to a live lobby id
    pub fn resolve_lobby(&self, text: &str) -> Result<LobbyId, RelayError> {
        let lobbies = self.read_lobbies();
        let found = match text.parse::<LobbyId>() {
            Ok(id) => lobbies.by_id.contains_key(&id).then_some(id),
            Err(_) => lobbies.by_name.get(text).copied(),
        };
        found.ok_or_else(|| RelayError::UnknownLobby(text.to_string()))
    }

    /// All live lobbies ordered by id
    pub fn lobbies(&self) -> Vec<Arc<Lobby>> {
        self.read_lobbies().by_id.values().cloned().collect()
    }

    pub fn lobby_count(&self) -> usize {
        self.read_lobbies().by_id.len()
    }

    /// Hands an accepted connection its id and welcome, then places it in
    /// the main lobby
    ///
    /// A client the main lobby rejects is terminated, so no partial state is
    /// left behind.
    pub fn admit(&self, mut connection: Connection) -> Result<ClientId, RelayError> {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        connection.send(&welcome_message(id, self.seed))?;

        let client = Client::spawn(
            id,
            connection,
            self.me.clone(),
            self.config.poll_interval(),
        )?;
        self.directory()
            .insert(id, Arc::downgrade(client.shared()));

        let main = match self.main_lobby() {
            Ok(main) => main,
            Err(e) => {
                client.terminate();
                return Err(e);
            }
        };
        if let Err((e, client)) = main.add_client(client, true) {
            warn!("Client#{}: rejected by main lobby: {}", id, e);
            client.terminate();
            return Err(e);
        }
        Ok(id)
    }

    /// Called by a client thread on its way out
    pub(crate) fn forget_client(&self, id: ClientId) {
        self.directory().remove(&id);
    }

    /// Number of connected clients across every lobby
    pub fn connected_count(&self) -> usize {
        self.directory()
            .values()
            .filter(|client| client.strong_count() > 0)
            .count()
    }

    pub fn find_client(&self, id: ClientId) -> Option<ClientSummary> {
        let shared = self.directory().get(&id)?.upgrade()?;
        Some(summarize(&shared))
    }

    /// Every connected client ordered by id
    pub fn clients(&self) -> Vec<ClientSummary> {
        let mut clients: Vec<ClientSummary> = self
            .directory()
            .values()
            .filter_map(Weak::upgrade)
            .map(|shared| summarize(&shared))
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Moves a client from `source` into `target`, or into the main lobby
    ///
    /// The client is detached first and then added to the target. If the
    /// target refuses it (full, stopped) the client is terminated, so after
    /// this call it is attached to exactly one lobby or gone.
    pub fn move_client(
        &self,
        source: LobbyId,
        target: Option<LobbyId>,
        client_id: ClientId,
    ) -> Result<String, RelayError> {
        let target_id = target.unwrap_or(self.main_id);
        if source == target_id {
            return Ok(format!("client {} is already in lobby {}", client_id, target_id));
        }

        let source_lobby = self
            .find_lobby(source)
            .ok_or_else(|| RelayError::UnknownLobby(source.to_string()))?;
        let target_lobby = self
            .find_lobby(target_id)
            .ok_or_else(|| RelayError::UnknownLobby(target_id.to_string()))?;

        let client = source_lobby
            .drop_client(client_id, DropMode::Detach)
            .ok_or(RelayError::UnknownClient(client_id))?;

        match target_lobby.add_client(client, true) {
            Ok(()) => {
                info!(
                    "Client#{}: moved from lobby {} to lobby {}",
                    client_id, source, target_id
                );
                Ok(format!(
                    "moved client {} from lobby {} to lobby {}",
                    client_id, source, target_id
                ))
            }
            Err((e, client)) => {
                warn!("Client#{}: move to lobby {} failed: {}", client_id, target_id, e);
                client.terminate();
                Err(e)
            }
        }
    }

    /// Moves a client wherever it currently is into `target` (main if `None`)
    pub fn summon(&self, client_id: ClientId, target: Option<LobbyId>) -> Result<String, RelayError> {
        let source = self.current_lobby(client_id)?;
        self.move_client(source, target, client_id)
    }

    /// Terminates a client wherever it currently is
    pub fn drop_client(&self, client_id: ClientId) -> Result<(), RelayError> {
        let source = self.current_lobby(client_id)?;
        let lobby = self
            .find_lobby(source)
            .ok_or_else(|| RelayError::UnknownLobby(source.to_string()))?;
        lobby.drop_client(client_id, DropMode::Terminate);
        Ok(())
    }

    fn current_lobby(&self, client_id: ClientId) -> Result<LobbyId, RelayError> {
        let summary = self
            .find_client(client_id)
            .ok_or(RelayError::UnknownClient(client_id))?;
        if !summary.online {
            return Err(RelayError::ClientOffline(client_id));
        }
        summary.lobby_id.ok_or(RelayError::ClientOffline(client_id))
    }

    /// Queues a core call on one lobby, or on every lobby when `lobby_id` is 0
    ///
    /// `client_id` 0 addresses every client in the targeted lobbies. Returns
    /// the number of lobbies the call was queued on.
    pub fn broadcast_core_call(
        &self,
        lobby_id: LobbyId,
        client_id: ClientId,
        command: CoreCommand,
    ) -> Result<usize, RelayError> {
        let targets = if lobby_id == ANY {
            self.lobbies()
        } else {
            vec![self
                .find_lobby(lobby_id)
                .ok_or_else(|| RelayError::UnknownLobby(lobby_id.to_string()))?]
        };

        for lobby in &targets {
            lobby.queue_core_call(CoreCall::new(lobby_id, client_id, command));
        }
        Ok(targets.len())
    }

    /// Runs one operator command line
    pub fn execute(&self, line: &str) -> Result<String, RelayError> {
        interpreter::execute(self, line)
    }

    /// Stops every lobby, the main lobby included. Used on process exit.
    pub fn shutdown(&self) {
        let lobbies = std::mem::take(&mut *self.write_lobbies());
        for lobby in lobbies.by_id.into_values() {
            lobby.shutdown();
        }
        info!("Registry shut down");
    }
}

fn summarize(shared: &ClientShared) -> ClientSummary {
    ClientSummary {
        id: shared.id(),
        lobby_id: shared.lobby_id(),
        online: shared.is_online(),
        peer: shared.peer(),
    }
}
