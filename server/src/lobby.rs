//! # Lobby
//!
//! A lobby is a group of clients kept in lockstep by one coordinator thread.
//! Every iteration the coordinator runs a single barrier for its current
//! phase and then flips the phase, so a full round is a receive barrier
//! followed by a send barrier:
//!
//! 1. **Receive**: publish `Receiving`, harvest the frame of every client that
//!    reports `Received` and advance it to `DoneReceiving`. Clients still
//!    missing when the deadline passes get one replay of the last control
//!    command and the partial queue, then they are dropped.
//! 2. **Send**: hand every client the same snapshot (harvested frames plus
//!    departure notices), publish `Sending` and collect `Sent` reports with
//!    the same deadline and straggler policy.
//!
//! ## Membership
//!
//! The member list belongs to the coordinator. Other threads edit it only
//! while holding a [`PauseGuard`](crate::sync::PauseGuard), which parks the
//! coordinator at the top of its loop, never in the middle of a scan.

use log::{debug, error, info, warn};
use relay_protocol::{encode_frames, ClientId, Frame, LobbyId};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::client::{Client, ClientState};
use crate::config::ServerConfig;
use crate::core_call::CoreCall;
use crate::error::RelayError;
use crate::session_log::SessionLog;
use crate::sync::{LobbySync, Phase};

/// Timing and recording settings a coordinator runs with
#[derive(Debug, Clone)]
pub struct LobbySettings {
    pub tick_interval: Duration,
    /// How long a barrier waits before dropping stragglers
    pub barrier_timeout: Duration,
    /// Longest single wait between two barrier scans
    pub timeout_delay: Duration,
    pub session_dir: Option<PathBuf>,
}

impl From<&ServerConfig> for LobbySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            barrier_timeout: config.barrier_timeout(),
            timeout_delay: config.timeout_delay().max(Duration::from_millis(1)),
            session_dir: config.session_dir(),
        }
    }
}

/// How [`Lobby::drop_client`] releases a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    /// Unlink only; the connection survives and the client is handed back.
    Detach,
    /// Unlink and end the connection.
    Terminate,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the lobby handle and its coordinator thread
struct LobbyShared {
    id: LobbyId,
    members: Mutex<Vec<Client>>,
    population: AtomicUsize,
    /// `{id|D}` frames waiting for the next send snapshot
    notices: Mutex<Vec<Frame>>,
    /// Core calls waiting to be fanned out to members
    core_calls: Mutex<Vec<CoreCall>>,
}

impl LobbyShared {
    fn announce_departure(&self, client_id: ClientId) {
        lock(&self.notices).push(Frame::disconnect(client_id));
    }

    fn update_population(&self, members: &[Client]) {
        self.population.store(members.len(), Ordering::SeqCst);
    }
}

pub struct Lobby {
    id: LobbyId,
    name: Option<String>,
    /// 0 means unlimited
    capacity: usize,
    sync: Arc<LobbySync>,
    shared: Arc<LobbyShared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Lobby {
    /// Creates the lobby and starts its coordinator thread.
    pub fn start(
        id: LobbyId,
        name: Option<String>,
        capacity: usize,
        settings: LobbySettings,
    ) -> Result<Lobby, RelayError> {
        let sync = Arc::new(LobbySync::new());
        let shared = Arc::new(LobbyShared {
            id,
            members: Mutex::new(Vec::new()),
            population: AtomicUsize::new(0),
            notices: Mutex::new(Vec::new()),
            core_calls: Mutex::new(Vec::new()),
        });

        let session = settings
            .session_dir
            .as_deref()
            .and_then(|dir| match SessionLog::create(dir, id) {
                Ok(log) => {
                    info!("Lobby#{}: recording session to {}", id, log.path().display());
                    Some(log)
                }
                Err(e) => {
                    warn!("Lobby#{}: session log unavailable: {}", id, e);
                    None
                }
            });

        let coordinator = Coordinator {
            shared: Arc::clone(&shared),
            sync: Arc::clone(&sync),
            settings,
            command_queue: Vec::new(),
            last_control: None,
            session,
            tick: 0,
        };
        let handle = thread::Builder::new()
            .name(format!("lobby-{}", id))
            .spawn(move || coordinator.run())?;

        info!(
            "Lobby#{} created (name: {}, capacity: {})",
            id,
            name.as_deref().unwrap_or("-"),
            capacity
        );

        Ok(Lobby {
            id,
            name,
            capacity,
            sync,
            shared,
            coordinator: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> LobbyId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn population(&self) -> usize {
        self.shared.population.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.sync.is_running()
    }

    /// Ids of the current members in join order. Waits for the barrier in
    /// progress, if any.
    pub fn member_ids(&self) -> Vec<ClientId> {
        lock(&self.shared.members).iter().map(Client::id).collect()
    }

    /// Links a client into the lobby. On rejection the client is handed back
    /// untouched so the caller decides what happens to it.
    pub fn add_client(&self, client: Client, respect_limit: bool) -> Result<(), (RelayError, Client)> {
        let guard = self.sync.pause();
        if !guard.lobby_running() {
            return Err((RelayError::LobbyStopped(self.id), client));
        }
        if !client.is_online() {
            return Err((RelayError::ClientOffline(client.id()), client));
        }

        let mut members = lock(&self.shared.members);
        if respect_limit && self.capacity > 0 && members.len() >= self.capacity {
            return Err((RelayError::LobbyFull(self.id), client));
        }

        let initial = entry_state(client.state(), self.sync.next_phase());
        client.attach(self.id, Arc::clone(&self.sync), initial);
        info!("Lobby#{}: client {} joined", self.id, client.id());
        members.push(client);
        self.shared.update_population(&members);
        Ok(())
    }

    /// Unlinks a member. Peers get `{id|D}` with the next snapshot; a detached
    /// client is returned and will purge its own view of this lobby.
    pub fn drop_client(&self, client_id: ClientId, mode: DropMode) -> Option<Client> {
        let _guard = self.sync.pause();
        let mut members = lock(&self.shared.members);
        let index = members.iter().position(|c| c.id() == client_id)?;
        let client = members.remove(index);
        self.shared.update_population(&members);
        drop(members);

        if !client.has_announced() {
            self.shared.announce_departure(client_id);
        }
        match mode {
            DropMode::Detach => {
                client.detach(true);
                info!("Lobby#{}: client {} detached", self.id, client_id);
                Some(client)
            }
            DropMode::Terminate => {
                client.terminate();
                info!("Lobby#{}: client {} dropped", self.id, client_id);
                None
            }
        }
    }

    /// Queues a control instruction; the coordinator hands it to matching
    /// members at the top of its next iteration.
    pub fn queue_core_call(&self, call: CoreCall) {
        lock(&self.shared.core_calls).push(call);
    }

    /// Stops the coordinator and waits for it. Every member is terminated.
    pub fn shutdown(&self) {
        self.sync.stop();
        let handle = lock(&self.coordinator).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Lobby#{}: coordinator panicked", self.id);
            }
            info!("Lobby#{} shut down", self.id);
        }
    }
}

impl Drop for Lobby {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Where a joining client enters the cycle, given its own progress and the
/// barrier the coordinator runs next
///
/// A client whose message was already read is owed a reply: it counts as done
/// for a receive barrier and is served by the next send. Any other client owes
/// a message, so it sits out a pending send and is read first.
fn entry_state(current: ClientState, next: Phase) -> ClientState {
    match (current, next) {
        (ClientState::Received | ClientState::DoneReceiving, _) => ClientState::DoneReceiving,
        (_, Phase::Sending) => ClientState::DoneSending,
        (_, Phase::Receiving | Phase::Idle) => ClientState::Idle,
    }
}

/// State owned by the coordinator thread
struct Coordinator {
    shared: Arc<LobbyShared>,
    sync: Arc<LobbySync>,
    settings: LobbySettings,
    /// Frames harvested in the last receive barrier
    command_queue: Vec<Frame>,
    last_control: Option<char>,
    session: Option<SessionLog>,
    tick: u64,
}

impl Coordinator {
    fn run(mut self) {
        let id = self.shared.id;
        debug!("Lobby#{}: coordinator started", id);

        let shared = Arc::clone(&self.shared);
        while self.sync.hold_while_paused() {
            let mut members = lock(&shared.members);
            self.process_drop_list(&mut members);
            self.fan_out_core_calls(&members);

            if !members.is_empty() {
                let phase = self.sync.next_phase();
                match phase {
                    Phase::Receiving | Phase::Idle => self.receive_barrier(&mut members),
                    Phase::Sending => self.send_barrier(&mut members),
                }
                shared.update_population(&members);
                self.sync.set_next_phase(phase.toggled());
                self.tick += 1;
            }
            drop(members);

            thread::sleep(self.settings.tick_interval);
        }

        let mut members = lock(&shared.members);
        for client in members.drain(..) {
            client.terminate();
        }
        shared.update_population(&members);
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.flush() {
                warn!("Lobby#{}: session log flush failed: {}", id, e);
            }
        }
        debug!("Lobby#{}: coordinator stopped", id);
    }

    /// Unlinks clients that asked to leave.
    fn process_drop_list(&mut self, members: &mut Vec<Client>) {
        for request in self.sync.take_drop_list() {
            let Some(index) = members.iter().position(|c| c.id() == request.client_id) else {
                continue;
            };
            let client = members.remove(index);
            if request.announce {
                self.shared.announce_departure(client.id());
            }
            client.terminate();
            info!("Lobby#{}: client {} left", self.shared.id, client.id());
        }
    }

    fn fan_out_core_calls(&mut self, members: &[Client]) {
        let calls = std::mem::take(&mut *lock(&self.shared.core_calls));
        for call in calls {
            if let Some(c) = call.command.control_char() {
                self.last_control = Some(c);
            }
            for client in members.iter().filter(|c| call.matches(self.shared.id, c.id())) {
                client.enqueue_core_call(call);
            }
            debug!("Lobby#{}: core call {} for client {}", self.shared.id, call.command, call.client_id);
        }
    }

    fn receive_barrier(&mut self, members: &mut Vec<Client>) {
        self.command_queue.clear();
        self.sync.publish_phase(Phase::Receiving);

        let complete = self.await_members(members, ClientState::Received, ClientState::DoneReceiving);
        if !complete {
            self.replay_to_stragglers(members);
            self.drop_stragglers(members, ClientState::DoneReceiving);
        }

        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.flush() {
                warn!("Lobby#{}: session log flush failed: {}", self.shared.id, e);
            }
        }
        self.sync.publish_phase(Phase::Idle);
    }

    fn send_barrier(&mut self, members: &mut Vec<Client>) {
        let notices = std::mem::take(&mut *lock(&self.shared.notices));
        let snapshot: Arc<[Frame]> = self
            .command_queue
            .iter()
            .cloned()
            .chain(notices)
            .collect();
        // Every client holds the snapshot before anyone is told to send.
        for client in members.iter() {
            client.set_outgoing(Arc::clone(&snapshot));
        }
        self.sync.publish_phase(Phase::Sending);

        if !self.await_members(members, ClientState::Sent, ClientState::DoneSending) {
            self.drop_stragglers(members, ClientState::DoneSending);
        }
        self.sync.publish_phase(Phase::Idle);
    }

    /// Advances every member that reached `reported` to `done`, harvesting
    /// inbound frames on the way. Members that entered already `done` count
    /// as finished. Returns `false` if the deadline passed, or only offline
    /// members are left, before all members were done.
    fn await_members(&mut self, members: &[Client], reported: ClientState, done: ClientState) -> bool {
        let deadline = Instant::now() + self.settings.barrier_timeout;

        loop {
            let epoch = self.sync.progress_epoch();
            for client in members.iter().filter(|c| c.state() == reported) {
                if reported == ClientState::Received {
                    if let Some(frame) = client.take_inbound() {
                        self.harvest(frame);
                    }
                }
                client.set_state(done);
            }

            let mut pending = members.iter().filter(|c| c.state() != done).peekable();
            if pending.peek().is_none() {
                return true;
            }
            // A client that went offline outside a read or write never reports.
            if pending.all(|c| !c.is_online() && !in_flight(c.state(), reported)) {
                debug!("Lobby#{}: only offline members left in barrier", self.shared.id);
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.sync
                .wait_for_progress(epoch, self.settings.timeout_delay.min(deadline - now));
        }
    }

    fn harvest(&mut self, frame: Frame) {
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.record(self.tick, &frame) {
                warn!("Lobby#{}: session log write failed: {}", self.shared.id, e);
                self.session = None;
            }
        }
        self.command_queue.push(frame);
    }

    /// Last chance for clients stuck waiting on something they missed.
    fn replay_to_stragglers(&self, members: &[Client]) {
        let mut frames = Vec::with_capacity(self.command_queue.len() + 1);
        if let Some(c) = self.last_control {
            frames.push(Frame::control(c.to_string()));
        }
        frames.extend(self.command_queue.iter().cloned());
        let replay = encode_frames(&frames);

        for client in members.iter().filter(|c| c.state() == ClientState::Receiving) {
            if let Err(e) = client.nudge(&replay) {
                debug!("Lobby#{}: replay to client {} failed: {}", self.shared.id, client.id(), e);
            }
        }
    }

    fn drop_stragglers(&mut self, members: &mut Vec<Client>, expected: ClientState) {
        let (kept, stragglers): (Vec<Client>, Vec<Client>) =
            members.drain(..).partition(|c| c.state() == expected);
        *members = kept;

        for client in stragglers {
            warn!(
                "Lobby#{}: client {} timed out in state {:?}, dropping",
                self.shared.id,
                client.id(),
                client.state()
            );
            if !client.has_announced() {
                self.shared.announce_departure(client.id());
            }
            client.terminate();
        }
    }
}

fn in_flight(state: ClientState, reported: ClientState) -> bool {
    matches!(state, ClientState::Receiving | ClientState::Sending) || state == reported
}
