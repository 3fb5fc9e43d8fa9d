//! # Lockstep Relay Server Library
//!
//! This library implements a relay server for lockstep multiplayer games.
//! Connected clients are grouped into independent lobbies, and within each
//! lobby every member exchanges one opaque payload per tick through the
//! `{id|payload}` text protocol defined in `relay_protocol`.
//!
//! ## Core Responsibilities
//!
//! ### Lockstep Synchronization
//! Each lobby runs a coordinator thread that alternates a receive barrier and
//! a send barrier. Every member thread reads one frame during the receive
//! barrier and writes the aggregated frames of its peers during the send
//! barrier. Slow or dead clients are dropped once a barrier's deadline passes,
//! so one broken connection never stalls the group.
//!
//! ### Membership Management
//! Clients join the main lobby on connect and can move between lobbies while
//! the barrier loop is live. Every membership edit parks the coordinator at
//! the top of its loop first, so the member list is never changed mid-scan.
//!
//! ### Operator Control
//! Start, pause and kick instructions (core calls) are queued on a lobby and
//! delivered to its client threads, which turn them into `{0|S}` / `{0|P}`
//! control frames or disconnect themselves.
//!
//! ## Threading Model
//!
//! Game traffic runs on plain OS threads: one per client and one per lobby
//! coordinator, all synchronized through [`sync::LobbySync`] (a mutex plus a
//! condition variable with bounded waits). The remote console runs on tokio
//! and reaches the blocking core through `spawn_blocking`.
//!
//! ## Module Organization
//!
//! - `connection`: blocking socket wrapper and the single teardown handle
//! - `sync`: phase, pause handshake and drop list shared by a lobby and its clients
//! - `client`: per-connection state machine and thread
//! - `core_call`: operator control instructions
//! - `lobby`: coordinator loop, barriers and membership edits
//! - `registry`: all lobbies, the client directory and moves between lobbies
//! - `interpreter`: operator command language
//! - `listener`: game port acceptor
//! - `rcon`: password-protected remote console
//! - `framed`: NUL-terminated messages over tokio streams
//! - `session_log`: per-lobby record of harvested frames
//! - `config`, `error`: settings and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_server::config::ServerConfig;
//! use relay_server::listener::Acceptor;
//! use relay_server::registry::Registry;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let acceptor = Acceptor::bind(("0.0.0.0", config.port))?;
//!
//!     // The registry creates the main lobby every new client lands in
//!     let registry = Registry::new(config, 1234)?;
//!     let handle = acceptor.spawn(Arc::clone(&registry))?;
//!
//!     registry.execute("lobby create arena 4")?;
//!
//!     // ... serve until asked to stop
//!     handle.stop();
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod core_call;
pub mod error;
pub mod framed;
pub mod interpreter;
pub mod listener;
pub mod lobby;
pub mod rcon;
pub mod registry;
pub mod session_log;
pub mod sync;
