//! Server configuration
//!
//! Every setting has a default so a config file only needs the values it
//! changes. The binary loads an optional JSON file first and then applies
//! command-line overrides on top.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RelayError;

/// Runtime settings for the relay and every lobby it creates
///
/// Limits use 0 to mean "unlimited", matching the way operators are used to
/// writing them in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the game listener binds to
    pub host: String,
    /// Game client port
    pub port: u16,
    /// Pause between two coordinator iterations, in milliseconds
    pub clock_speed_ms: u64,
    /// How many times a barrier re-checks its members before giving up
    pub timeout_tries: u32,
    /// Pause between two barrier checks, in milliseconds
    pub timeout_delay_ms: u64,
    /// Upper bound on how long an idle client thread sleeps between checks
    pub poll_interval_ms: u64,
    /// Maximum connected game clients across all lobbies
    pub max_connections: usize,
    /// Maximum number of live lobbies, main lobby included
    pub lobby_max_count: usize,
    /// Capacity given to lobbies created without an explicit one
    pub lobby_capacity: usize,
    pub lobby_start_id_at: u32,
    pub client_start_id_at: u32,
    /// Record every harvested frame to a per-lobby file
    pub session_logging: bool,
    pub session_path: PathBuf,
    pub rcon_enable: bool,
    pub rcon_port: u16,
    pub rcon_password: String,
    pub rcon_max_connections: usize,
    /// Seed handed to every client in the welcome message; random when unset
    pub seed: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 15000,
            clock_speed_ms: 100,
            timeout_tries: 100,
            timeout_delay_ms: 5,
            poll_interval_ms: 1,
            max_connections: 0,
            lobby_max_count: 0,
            lobby_capacity: 0,
            lobby_start_id_at: 1,
            client_start_id_at: 1,
            session_logging: false,
            session_path: PathBuf::from("sessions"),
            rcon_enable: false,
            rcon_port: 15001,
            rcon_password: String::new(),
            rcon_max_connections: 1,
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Rejects combinations the server must not start with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.rcon_enable && self.rcon_password.is_empty() {
            return Err(RelayError::InvalidSetting("rcon needs a non-empty password"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.clock_speed_ms)
    }

    pub fn timeout_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_delay_ms)
    }

    /// Total time a barrier may wait before dropping stragglers
    pub fn barrier_timeout(&self) -> Duration {
        self.timeout_delay() * self.timeout_tries
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.session_logging.then(|| self.session_path.clone())
    }
}
