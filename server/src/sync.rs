//! Shared signal block between a lobby coordinator and its client threads
//!
//! All fields live behind one mutex and every change is announced on one
//! condition variable, so waiters never miss an update and never observe a
//! half-written state. Waits are always bounded by a timeout, which keeps the
//! worst-case reaction time equal to the configured poll interval even if a
//! notification is missed.

use relay_protocol::ClientId;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Phase published by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Between barriers; clients have nothing to do
    Idle,
    Receiving,
    Sending,
}

impl Phase {
    pub fn toggled(self) -> Phase {
        match self {
            Phase::Receiving => Phase::Sending,
            Phase::Sending | Phase::Idle => Phase::Receiving,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    Requested,
    Confirmed,
}

/// A client that asked to be unlinked by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropRequest {
    pub client_id: ClientId,
    /// Whether peers still need a `{id|D}` for this client
    pub announce: bool,
}

#[derive(Debug)]
struct SyncState {
    phase: Phase,
    phase_epoch: u64,
    next_phase: Phase,
    progress_epoch: u64,
    /// Mutators currently waiting for or holding a pause
    pause_requests: usize,
    pause_confirmed: bool,
    drop_list: Vec<DropRequest>,
    running: bool,
}

#[derive(Debug)]
pub struct LobbySync {
    state: Mutex<SyncState>,
    changed: Condvar,
    /// Serialises mutators so only one edits membership at a time
    mutation: Mutex<()>,
}

impl Default for LobbySync {
    fn default() -> Self {
        Self::new()
    }
}

impl LobbySync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyncState {
                phase: Phase::Idle,
                phase_epoch: 0,
                next_phase: Phase::Receiving,
                progress_epoch: 0,
                pause_requests: 0,
                pause_confirmed: false,
                drop_list: Vec::new(),
                running: true,
            }),
            changed: Condvar::new(),
            mutation: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, SyncState>,
        timeout: Duration,
    ) -> MutexGuard<'a, SyncState> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn publish_phase(&self, phase: Phase) {
        let mut state = self.lock();
        state.phase = phase;
        state.phase_epoch += 1;
        drop(state);
        self.changed.notify_all();
    }

    /// Current phase and the epoch it was published in
    pub fn phase(&self) -> (Phase, u64) {
        let state = self.lock();
        (state.phase, state.phase_epoch)
    }

    /// Sleeps until a phase newer than `epoch` is published, the lobby stops,
    /// or `timeout` runs out.
    pub fn wait_for_phase_change(&self, epoch: u64, timeout: Duration) {
        let state = self.lock();
        if state.phase_epoch != epoch || !state.running {
            return;
        }
        drop(self.wait_timeout(state, timeout));
    }

    pub fn next_phase(&self) -> Phase {
        self.lock().next_phase
    }

    pub fn set_next_phase(&self, phase: Phase) {
        self.lock().next_phase = phase;
    }

    /// Called by a client thread after it changed its own state.
    pub fn notify_progress(&self) {
        self.lock().progress_epoch += 1;
        self.changed.notify_all();
    }

    pub fn progress_epoch(&self) -> u64 {
        self.lock().progress_epoch
    }

    pub fn wait_for_progress(&self, epoch: u64, timeout: Duration) {
        let state = self.lock();
        if state.progress_epoch != epoch || !state.running {
            return;
        }
        drop(self.wait_timeout(state, timeout));
    }

    /// Asks the coordinator to stop at the top of its loop and blocks until it
    /// has, or until the lobby stops. Membership may be edited while the
    /// returned guard is alive; dropping it resumes the coordinator once no
    /// other mutator is queued behind it.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.lock().pause_requests += 1;
        self.changed.notify_all();

        let mutation = self
            .mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut state = self.lock();
        while !state.pause_confirmed && state.running {
            state = self.wait_timeout(state, Duration::from_millis(1));
        }
        drop(state);

        PauseGuard {
            sync: self,
            _mutation: mutation,
        }
    }

    pub fn pause_state(&self) -> PauseState {
        let state = self.lock();
        match (state.pause_requests, state.pause_confirmed) {
            (0, _) => PauseState::Running,
            (_, false) => PauseState::Requested,
            (_, true) => PauseState::Confirmed,
        }
    }

    /// Coordinator side of the handshake. Returns `false` once the lobby stops.
    pub fn hold_while_paused(&self) -> bool {
        let mut state = self.lock();
        while state.running && state.pause_requests > 0 {
            if !state.pause_confirmed {
                state.pause_confirmed = true;
                self.changed.notify_all();
            }
            state = self.wait_timeout(state, Duration::from_millis(1));
        }
        state.pause_confirmed = false;
        state.running
    }

    pub fn request_drop(&self, request: DropRequest) {
        let mut state = self.lock();
        if !state.drop_list.contains(&request) {
            state.drop_list.push(request);
        }
    }

    pub fn take_drop_list(&self) -> Vec<DropRequest> {
        std::mem::take(&mut self.lock().drop_list)
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        state.running = false;
        state.phase = Phase::Idle;
        state.phase_epoch += 1;
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }
}

/// Proof that the coordinator is parked; see [`LobbySync::pause`].
pub struct PauseGuard<'a> {
    sync: &'a LobbySync,
    _mutation: MutexGuard<'a, ()>,
}

impl PauseGuard<'_> {
    /// `false` when the pause ended because the lobby stopped.
    pub fn lobby_running(&self) -> bool {
        self.sync.is_running()
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.sync.lock();
        state.pause_requests = state.pause_requests.saturating_sub(1);
        drop(state);
        self.sync.changed.notify_all();
    }
}
