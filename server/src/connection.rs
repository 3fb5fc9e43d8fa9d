//! Blocking socket wrapper used by client threads
//!
//! A `Connection` is owned by exactly one client thread. Everything other
//! threads may need to do to that socket (write a replay, close it to unblock
//! a read) goes through a cloned `SocketHandle`, which also guarantees the
//! socket is shut down at most once.

use log::debug;
use relay_protocol::{read_message, write_message};
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Read and write halves of one accepted TCP stream
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    handle: SocketHandle,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let handle = SocketHandle {
            inner: Arc::new(HandleInner {
                stream: Mutex::new(stream.try_clone()?),
                closed: AtomicBool::new(false),
                peer,
            }),
        };

        Ok(Self {
            reader,
            writer: stream,
            handle,
        })
    }

    /// Blocks until one full message arrives. `Ok(None)` means the peer hung up.
    pub fn receive(&mut self) -> io::Result<Option<String>> {
        if self.handle.is_closed() {
            return Ok(None);
        }
        read_message(&mut self.reader)
    }

    pub fn send(&mut self, text: &str) -> io::Result<()> {
        if self.handle.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket already closed",
            ));
        }
        write_message(&mut self.writer, text)
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.inner.peer
    }
}

struct HandleInner {
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
    peer: SocketAddr,
}

#[derive(Clone)]
pub struct SocketHandle {
    inner: Arc<HandleInner>,
}

impl SocketHandle {
    /// Shuts the socket down. Only the first call does anything.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self
            .inner
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!("Shutdown of {} failed: {}", self.inner.peer, e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Writes a message from outside the owning client thread.
    pub fn nudge(&self, text: &str) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket already closed",
            ));
        }
        let mut stream = self
            .inner
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        write_message(&mut *stream, text)
    }
}
