//! Remote console
//!
//! A password-protected TCP front end for the command interpreter. Sessions use
//! the same NUL-terminated messages as game clients: the first message is the
//! password, every later message is one command whose status line is written
//! back. Commands run on tokio's blocking pool because lobby edits wait for a
//! coordinator to pause.

use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

use crate::framed::{read_message, write_message};
use crate::registry::Registry;

pub const APPROVED: &str = "Connection approved";
pub const DENIED: &str = "Permission denied";

pub struct RconServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    password: Arc<str>,
    max_sessions: usize,
    active: Arc<AtomicUsize>,
}

impl RconServer {
    /// Binds the console. An empty password is refused, since it would let
    /// any first message log in.
    pub async fn bind(addr: &str, registry: Arc<Registry>) -> io::Result<Self> {
        let config = registry.config();
        if config.rcon_password.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rcon password is empty",
            ));
        }
        let listener = TcpListener::bind(addr).await?;
        let password = Arc::from(config.rcon_password.as_str());
        let max_sessions = config.rcon_max_connections;

        Ok(Self {
            listener,
            registry,
            password,
            max_sessions,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts sessions until the task is dropped.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("Rcon listening on {}", addr);
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Rcon accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            if self.max_sessions > 0 && self.active.load(Ordering::SeqCst) >= self.max_sessions {
                warn!("Rcon: refusing {}, session limit reached", peer);
                drop(stream);
                continue;
            }

            self.active.fetch_add(1, Ordering::SeqCst);
            let registry = Arc::clone(&self.registry);
            let password = Arc::clone(&self.password);
            let active = Arc::clone(&self.active);
            tokio::spawn(async move {
                if let Err(e) = handle_session(stream, registry, password).await {
                    debug!("Rcon session {} ended: {}", peer, e);
                }
                active.fetch_sub(1, Ordering::SeqCst);
                info!("Rcon: {} disconnected", peer);
            });
        }
    }
}

async fn handle_session(stream: TcpStream, registry: Arc<Registry>, password: Arc<str>) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(attempt) = read_message(&mut reader).await? else {
        return Ok(());
    };
    if attempt != *password {
        warn!("Rcon: {} failed to authenticate", peer);
        write_message(&mut write_half, DENIED).await?;
        return Ok(());
    }
    write_message(&mut write_half, APPROVED).await?;
    info!("Rcon: {} authenticated", peer);

    while let Some(line) = read_message(&mut reader).await? {
        let command = line.trim().to_string();
        if command.eq_ignore_ascii_case("quit") || command.eq_ignore_ascii_case("exit") {
            break;
        }
        info!("Rcon: {} ran '{}'", peer, command);

        let registry = Arc::clone(&registry);
        let reply = match tokio::task::spawn_blocking(move || registry.execute(&command)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => format!("error: {}", e),
            Err(e) => format!("error: command failed: {}", e),
        };
        write_message(&mut write_half, &reply).await?;
    }
    Ok(())
}
