//! Game client acceptor
//!
//! Accepts TCP connections on a background thread and hands each one to the
//! registry, which welcomes it and places it in the main lobby. The listener
//! runs non-blocking so the thread notices a stop request between accepts.

use log::{debug, error, info, warn};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::connection::Connection;
use crate::registry::Registry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(20);

pub struct Acceptor {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Acceptor {
    /// Binds the game port. Failing here is fatal for the server.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Starts the accept loop on its own thread.
    pub fn spawn(self, registry: Arc<Registry>) -> io::Result<AcceptorHandle> {
        let keep_running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&keep_running);
        let addr = self.addr;
        let thread = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || self.run(registry, flag))?;

        info!("Accepting game clients on {}", addr);
        Ok(AcceptorHandle {
            keep_running,
            thread: Some(thread),
        })
    }

    fn run(self, registry: Arc<Registry>, keep_running: Arc<AtomicBool>) {
        while keep_running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => admit(&registry, stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
        debug!("Acceptor on {} stopped", self.addr);
    }
}

fn admit(registry: &Registry, stream: TcpStream, peer: SocketAddr) {
    let limit = registry.config().max_connections;
    if limit > 0 && registry.connected_count() >= limit {
        warn!("Refusing {}: connection limit of {} reached", peer, limit);
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    let connection = match stream
        .set_nonblocking(false)
        .and_then(|()| Connection::new(stream))
    {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Could not set up connection from {}: {}", peer, e);
            return;
        }
    };

    match registry.admit(connection) {
        Ok(id) => info!("Client {} connected from {}", id, peer),
        Err(e) => warn!("Connection from {} rejected: {}", peer, e),
    }
}

/// Stops the accept loop when asked
pub struct AcceptorHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AcceptorHandle {
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use relay_protocol::{parse_welcome, read_message, write_message};
    use std::io::BufReader;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition never held");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_accepts_and_welcomes() {
        let config = ServerConfig {
            clock_speed_ms: 5,
            ..ServerConfig::default()
        };
        let registry = Registry::new(config, 99).unwrap();
        let acceptor = Acceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr();
        let handle = acceptor.spawn(Arc::clone(&registry)).unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(stream);
        let welcome = read_message(&mut reader).unwrap().unwrap();
        let (id, seed) = parse_welcome(&welcome).unwrap();
        assert_eq!(id, 1);
        assert_eq!(seed, 99);

        wait_until(|| registry.find_client(id).is_some());
        handle.stop();
        registry.shutdown();
    }

    #[test]
    fn test_connection_limit_refuses() {
        let config = ServerConfig {
            clock_speed_ms: 5,
            max_connections: 1,
            ..ServerConfig::default()
        };
        let registry = Registry::new(config, 0).unwrap();
        let acceptor = Acceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr();
        let handle = acceptor.spawn(Arc::clone(&registry)).unwrap();

        let mut first = TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            write_message(&mut first, "").unwrap();
        }
        let mut first_reader = BufReader::new(first.try_clone().unwrap());
        assert!(read_message(&mut first_reader).unwrap().is_some());
        wait_until(|| registry.connected_count() == 1);

        let second = TcpStream::connect(addr).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut second_reader = BufReader::new(second);
        // Closed without a welcome.
        assert!(matches!(read_message(&mut second_reader), Ok(None) | Err(_)));

        handle.stop();
        registry.shutdown();
    }
}
