//! Per-connection client thread and the state it shares with its lobby
//!
//! Each connected socket gets one OS thread that alternates between reading a
//! frame and writing the lobby's aggregated frames back, following whatever
//! phase its current lobby publishes. The lobby coordinator reads and advances
//! the client's progress state; the client thread never touches the lobby's
//! member list.
//!
//! ## Lifecycle
//!
//! A client thread that goes offline asks its lobby to unlink it, then waits
//! until the lobby has cleared its attachment before closing the socket and
//! exiting. The `Client` value (shared state plus thread handle) is owned by
//! the lobby's member list, so it is released by the coordinator, never by the
//! thread itself.

use log::{debug, info, warn};
use relay_protocol::{check_payload, encode_frames, ApiCall, ClientId, Frame, LobbyId, ProtocolError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::connection::{Connection, SocketHandle};
use crate::core_call::{CoreCall, CoreCommand};
use crate::registry::Registry;
use crate::sync::{DropRequest, LobbySync, Phase};

/// A client's own view of its progress through the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing in flight
    Idle,
    Receiving,
    Received,
    DoneReceiving,
    Sending,
    Sent,
    DoneSending,
}

#[derive(Clone)]
struct Attachment {
    lobby_id: LobbyId,
    sync: Arc<LobbySync>,
}

struct Progress {
    state: ClientState,
    inbound: Option<Frame>,
    outgoing: Arc<[Frame]>,
    purge: bool,
}

pub(crate) struct ClientShared {
    id: ClientId,
    peer: SocketAddr,
    attachment: Mutex<Option<Attachment>>,
    progress: Mutex<Progress>,
    controls: Mutex<VecDeque<CoreCall>>,
    online: AtomicBool,
    /// Set once peers were told about this client leaving
    announced: AtomicBool,
    socket: SocketHandle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ClientShared {
    pub(crate) fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn lobby_id(&self) -> Option<LobbyId> {
        lock(&self.attachment).as_ref().map(|a| a.lobby_id)
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn attachment(&self) -> Option<Attachment> {
        lock(&self.attachment).clone()
    }

    fn state(&self) -> ClientState {
        lock(&self.progress).state
    }

    fn set_state(&self, state: ClientState) {
        lock(&self.progress).state = state;
    }
}

/// An owned client: the shared state and the thread serving it
pub struct Client {
    shared: Arc<ClientShared>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Starts the client thread. The client stays idle until a lobby attaches it.
    pub fn spawn(
        id: ClientId,
        connection: Connection,
        registry: Weak<Registry>,
        poll_interval: Duration,
    ) -> std::io::Result<Client> {
        let shared = Arc::new(ClientShared {
            id,
            peer: connection.peer_addr(),
            attachment: Mutex::new(None),
            progress: Mutex::new(Progress {
                state: ClientState::Idle,
                inbound: None,
                outgoing: Arc::from(Vec::new()),
                purge: false,
            }),
            controls: Mutex::new(VecDeque::new()),
            online: AtomicBool::new(true),
            announced: AtomicBool::new(false),
            socket: connection.handle(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            connection,
            registry,
            poll_interval,
            pending_control: String::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("client-{}", id))
            .spawn(move || worker.run())?;

        Ok(Client {
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    pub fn lobby_id(&self) -> Option<LobbyId> {
        self.shared.lobby_id()
    }

    pub fn is_online(&self) -> bool {
        self.shared.is_online()
    }

    /// Whether the client already sent its own `{id|D}` to its peers.
    pub fn has_announced(&self) -> bool {
        self.shared.announced.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.shared.attachment).is_some()
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn set_state(&self, state: ClientState) {
        self.shared.set_state(state);
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    /// Takes the frame read this phase, if any.
    pub fn take_inbound(&self) -> Option<Frame> {
        lock(&self.shared.progress).inbound.take()
    }

    pub fn set_outgoing(&self, frames: Arc<[Frame]>) {
        lock(&self.shared.progress).outgoing = frames;
    }

    pub fn enqueue_core_call(&self, call: CoreCall) {
        lock(&self.shared.controls).push_back(call);
    }

    /// Links the client to a lobby, starting it in `state` so it joins the
    /// lobby's cycle at the right point.
    pub fn attach(&self, lobby_id: LobbyId, sync: Arc<LobbySync>, state: ClientState) {
        {
            let mut progress = lock(&self.shared.progress);
            progress.state = state;
            progress.inbound = None;
            progress.outgoing = Arc::from(Vec::new());
        }
        *lock(&self.shared.attachment) = Some(Attachment { lobby_id, sync });
    }

    /// Unlinks the client. With `purge`, its next outbound message starts with
    /// `{*|D}` so it forgets the peers of the lobby it left.
    pub fn detach(&self, purge: bool) {
        *lock(&self.shared.attachment) = None;
        if purge {
            lock(&self.shared.progress).purge = true;
        }
    }

    /// Ends the connection for good: the thread unwinds and the socket closes.
    pub fn terminate(&self) {
        self.shared.online.store(false, Ordering::SeqCst);
        *lock(&self.shared.attachment) = None;
        self.shared.socket.close();
    }

    /// Writes a message straight to the socket, bypassing the client thread.
    pub fn nudge(&self, text: &str) -> std::io::Result<()> {
        self.shared.socket.nudge(text)
    }

    /// Detaches the thread handle, for when the caller wants to wait on it.
    pub fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

/// State private to the client thread
struct Worker {
    shared: Arc<ClientShared>,
    connection: Connection,
    registry: Weak<Registry>,
    poll_interval: Duration,
    /// Control characters collected since the last send
    pending_control: String,
}

impl Worker {
    fn run(mut self) {
        let id = self.shared.id;
        info!("Client#{}: thread started for {}", id, self.shared.peer);

        while self.shared.is_online() {
            self.listen_for_core_calls();
            if !self.shared.is_online() {
                break;
            }

            let Some(attachment) = self.shared.attachment() else {
                thread::sleep(self.poll_interval);
                continue;
            };

            let (phase, epoch) = attachment.sync.phase();
            match (phase, self.shared.state()) {
                (Phase::Receiving, ClientState::Idle | ClientState::DoneSending) => {
                    self.receive(&attachment)
                }
                (Phase::Sending, ClientState::Idle | ClientState::DoneReceiving) => {
                    self.send(&attachment)
                }
                _ => attachment
                    .sync
                    .wait_for_phase_change(epoch, self.poll_interval),
            }
        }

        self.unwind();
    }

    fn listen_for_core_calls(&mut self) {
        let calls: Vec<CoreCall> = lock(&self.shared.controls).drain(..).collect();
        if calls.is_empty() {
            return;
        }

        let id = self.shared.id;
        let lobby_id = self.shared.lobby_id().unwrap_or_default();
        for call in calls.iter().filter(|c| c.matches(lobby_id, id)) {
            match call.command {
                CoreCommand::Kick => {
                    info!("Client#{}: kicked", id);
                    self.shared.online.store(false, Ordering::SeqCst);
                }
                command => {
                    if let Some(c) = command.control_char() {
                        self.pending_control.push(c);
                    }
                }
            }
        }
    }

    fn receive(&mut self, attachment: &Attachment) {
        let id = self.shared.id;
        self.shared.set_state(ClientState::Receiving);

        let mut api_call = None;
        let frame = match self.connection.receive() {
            Ok(Some(payload)) => match ApiCall::parse(&payload) {
                Some(call) => {
                    api_call = Some(call);
                    None
                }
                None if payload.is_empty() => None,
                None => match check_payload(&payload) {
                    Ok(()) => Some(Frame::new(id, payload)),
                    Err(e) => {
                        warn!("Client#{}: payload discarded: {}", id, e);
                        None
                    }
                },
            },
            Ok(None) => {
                info!("Client#{}: connection closed by peer", id);
                Some(self.go_offline())
            }
            Err(e) => {
                warn!("Client#{}: receive failed: {}", id, e);
                Some(self.go_offline())
            }
        };

        {
            let mut progress = lock(&self.shared.progress);
            progress.inbound = frame;
            progress.state = ClientState::Received;
        }
        attachment.sync.notify_progress();

        if let Some(call) = api_call {
            self.perform_api_call(call, attachment.lobby_id);
        }
    }

    fn go_offline(&mut self) -> Frame {
        self.shared.online.store(false, Ordering::SeqCst);
        self.shared.announced.store(true, Ordering::SeqCst);
        Frame::disconnect(self.shared.id)
    }

    fn send(&mut self, attachment: &Attachment) {
        self.shared.set_state(ClientState::Sending);
        // Calls fanned out just before this phase was published.
        self.listen_for_core_calls();

        let message = self.compose();
        if let Err(e) = self.connection.send(&message) {
            warn!("Client#{}: send failed: {}", self.shared.id, e);
            self.shared.online.store(false, Ordering::SeqCst);
        }
        self.pending_control.clear();

        self.shared.set_state(ClientState::Sent);
        attachment.sync.notify_progress();
    }

    /// Purge notice, then operator controls, then every peer frame.
    fn compose(&self) -> String {
        let (outgoing, purge) = {
            let mut progress = lock(&self.shared.progress);
            let purge = std::mem::take(&mut progress.purge);
            (Arc::clone(&progress.outgoing), purge)
        };

        let mut frames = Vec::with_capacity(outgoing.len() + 2);
        if purge {
            frames.push(Frame::purge());
        }
        if !self.pending_control.is_empty() {
            frames.push(Frame::control(self.pending_control.clone()));
        }
        let id = self.shared.id;
        frames.extend(
            outgoing
                .iter()
                .filter(|frame| frame.sender_id() != Some(id))
                .cloned(),
        );
        encode_frames(&frames)
    }

    fn perform_api_call(&self, call: Result<ApiCall, ProtocolError>, lobby_id: LobbyId) {
        let id = self.shared.id;
        let Some(registry) = self.registry.upgrade() else {
            debug!("Client#{}: api call ignored, no registry", id);
            return;
        };

        let result = match call {
            Ok(ApiCall::Join(target)) => registry
                .resolve_lobby(&target)
                .and_then(|target| registry.move_client(lobby_id, Some(target), id)),
            Ok(ApiCall::Leave) => registry.move_client(lobby_id, None, id),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(message) => info!("Client#{}: {}", id, message),
            Err(e) => warn!("Client#{}: api call failed: {}", id, e),
        }
    }

    /// Two-phase exit: ask the lobby to unlink us, wait until it has, then
    /// release the socket.
    fn unwind(self) {
        let id = self.shared.id;
        let mut requested: Option<Arc<LobbySync>> = None;

        while let Some(attachment) = self.shared.attachment() {
            let already_asked = requested
                .as_ref()
                .is_some_and(|sync| Arc::ptr_eq(sync, &attachment.sync));
            if !already_asked {
                attachment.sync.request_drop(DropRequest {
                    client_id: id,
                    announce: !self.shared.announced.load(Ordering::SeqCst),
                });
                requested = Some(attachment.sync);
            }
            thread::sleep(self.poll_interval);
        }

        self.shared.socket.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.forget_client(id);
        }
        info!("Client#{}: thread exited", id);
    }
}
