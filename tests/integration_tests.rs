//! Integration tests for the lockstep relay
//!
//! These tests start a real acceptor on loopback and drive it with blocking
//! TCP clients that follow the lockstep discipline: send one message, then
//! read one aggregated reply.

use relay_protocol::{parse_frames, parse_welcome, read_message, write_message, ClientId, Frame};
use relay_server::config::ServerConfig;
use relay_server::core_call::CoreCommand;
use relay_server::listener::{Acceptor, AcceptorHandle};
use relay_server::registry::Registry;
use std::collections::VecDeque;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Empty turns every test client queues on connect so it keeps up with
/// barriers while other clients are being admitted.
const PRIMED_TURNS: usize = 3;

struct TestServer {
    registry: Arc<Registry>,
    acceptor: Option<AcceptorHandle>,
    addr: SocketAddr,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let acceptor = Acceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr();
        let registry = Registry::new(config, 4242).unwrap();
        let acceptor = acceptor.spawn(Arc::clone(&registry)).unwrap();
        Self {
            registry,
            acceptor: Some(acceptor),
            addr,
        }
    }

    fn connect(&self) -> TestClient {
        self.connect_primed(PRIMED_TURNS)
    }

    /// A client that queues nothing ahead: it only writes when it has read
    /// the reply to its previous message.
    fn connect_strict(&self) -> TestClient {
        self.connect_primed(0)
    }

    fn connect_primed(&self, turns: usize) -> TestClient {
        let mut writer = TcpStream::connect(self.addr).unwrap();
        writer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..turns {
            write_message(&mut writer, "").unwrap();
        }

        let mut reader = BufReader::new(writer.try_clone().unwrap());
        let welcome = read_message(&mut reader).unwrap().unwrap();
        let (id, seed) = parse_welcome(&welcome).unwrap();
        assert_eq!(seed, 4242);

        let client = TestClient { id, reader, writer };
        wait_until(|| self.registry.find_client(id).and_then(|c| c.lobby_id).is_some());
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.stop();
        }
        self.registry.shutdown();
    }
}

struct TestClient {
    id: ClientId,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TestClient {
    /// One lockstep turn: send a message, then read the reply.
    fn turn(&mut self, text: &str) -> Vec<Frame> {
        write_message(&mut self.writer, text).unwrap();
        let reply = read_message(&mut self.reader).unwrap().unwrap();
        parse_frames(&reply).unwrap()
    }

    /// Hands the client to a background thread that keeps playing turns
    /// with `payload`, so it never becomes a straggler.
    fn autoplay(self, payload: &str) -> Autoplayer {
        let state = Arc::new(PlayerState {
            payload: payload.to_string(),
            outbox: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let id = self.id;
        let socket = self.writer.try_clone().unwrap();
        let thread = {
            let state = Arc::clone(&state);
            thread::spawn(move || play(self, state))
        };
        Autoplayer {
            id,
            state,
            socket,
            thread: Some(thread),
        }
    }
}

struct PlayerState {
    payload: String,
    /// One-off messages sent instead of the payload on the next turns
    outbox: Mutex<VecDeque<String>>,
    seen: Mutex<Vec<Frame>>,
    stop: AtomicBool,
    closed: AtomicBool,
}

fn play(mut client: TestClient, state: Arc<PlayerState>) {
    while !state.stop.load(Ordering::SeqCst) {
        let text = state
            .outbox
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| state.payload.clone());
        if write_message(&mut client.writer, &text).is_err() {
            break;
        }
        match read_message(&mut client.reader) {
            Ok(Some(reply)) => state
                .seen
                .lock()
                .unwrap()
                .extend(parse_frames(&reply).unwrap()),
            _ => break,
        }
    }
    state.closed.store(true, Ordering::SeqCst);
}

struct Autoplayer {
    id: ClientId,
    state: Arc<PlayerState>,
    socket: TcpStream,
    thread: Option<thread::JoinHandle<()>>,
}

impl Autoplayer {
    fn queue(&self, text: &str) {
        self.state.outbox.lock().unwrap().push_back(text.to_string());
    }

    fn saw(&self, frame: &Frame) -> bool {
        self.state.seen.lock().unwrap().contains(frame)
    }

    fn count(&self, frame: &Frame) -> usize {
        self.state
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|f| *f == frame)
            .count()
    }

    fn saw_own_frame(&self) -> bool {
        self.state
            .seen
            .lock()
            .unwrap()
            .iter()
            .any(|f| f.sender_id() == Some(self.id))
    }

    /// `true` once the server has closed the connection.
    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Autoplayer {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        let _ = self.socket.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        clock_speed_ms: 5,
        timeout_tries: 20,
        timeout_delay_ms: 5,
        ..ServerConfig::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "condition never held"
        );
        thread::sleep(Duration::from_millis(2));
    }
}

/// LOCKSTEP SCENARIOS
mod lockstep_tests {
    use super::*;

    /// A payload sent by one member reaches the other tagged with its id
    #[test]
    fn payload_reaches_peer_tagged_with_sender() {
        let server = TestServer::start(test_config());
        let a = server.connect().autoplay("5:10");
        let b = server.connect().autoplay("");

        wait_until(|| b.saw(&Frame::new(a.id, "5:10")));
        // A client never gets its own frames back.
        assert!(!a.saw_own_frame());
        assert!(!b.saw_own_frame());
    }

    /// A client that stops answering is dropped and its peers are told
    #[test]
    fn silent_client_dropped_and_announced() {
        let server = TestServer::start(test_config());
        let a = server.connect().autoplay("1:1");
        let silent = server.connect();
        let main = server.registry.main_lobby().unwrap();

        wait_until(|| a.saw(&Frame::disconnect(silent.id)));
        wait_until(|| main.population() == 1);
        assert_eq!(main.member_ids(), vec![a.id]);
        wait_until(|| server.registry.find_client(silent.id).is_none());
    }

    /// A client hanging up produces exactly one departure notice
    #[test]
    fn hangup_announced_once() {
        let server = TestServer::start(test_config());
        let a = server.connect().autoplay("");
        let b = server.connect();
        let b_id = b.id;
        drop(b);

        wait_until(|| a.saw(&Frame::disconnect(b_id)));
        // Give a duplicate notice time to show up.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(a.count(&Frame::disconnect(b_id)), 1);
    }

    /// Operator start reaches every member of the lobby as `{0|S}`
    #[test]
    fn core_call_start_reaches_lobby() {
        let server = TestServer::start(test_config());
        let a = server.connect().autoplay("");
        let b = server.connect().autoplay("");

        server
            .registry
            .broadcast_core_call(1, 0, CoreCommand::Start)
            .unwrap();

        wait_until(|| a.saw(&Frame::control("S")) && b.saw(&Frame::control("S")));
    }

    /// Kicking a client disconnects it and tells its peers
    #[test]
    fn kick_disconnects_client() {
        let server = TestServer::start(test_config());
        let a = server.connect().autoplay("");
        let b = server.connect().autoplay("");

        server
            .registry
            .execute(&format!("client kick {}", b.id))
            .unwrap();

        wait_until(|| b.is_closed());
        wait_until(|| a.saw(&Frame::disconnect(b.id)));
        wait_until(|| server.registry.main_lobby().unwrap().population() == 1);
    }
}

/// MULTI-LOBBY TESTS
mod lobby_tests {
    use super::*;

    /// `#join` moves a client, announces it to the old lobby and purges it
    #[test]
    fn join_moves_client_between_lobbies() {
        let server = TestServer::start(test_config());
        let side = server.registry.add_lobby(Some("side".into()), None).unwrap();
        assert_eq!(side.id(), 2);

        let mover = server.connect().autoplay("");
        let stayer = server.connect().autoplay("");
        let main = server.registry.main_lobby().unwrap();
        let before = side.population();

        mover.queue("#join 2");
        wait_until(|| side.population() == before + 1);
        assert_eq!(side.member_ids(), vec![mover.id]);
        assert_eq!(main.member_ids(), vec![stayer.id]);

        wait_until(|| mover.saw(&Frame::purge()));
        wait_until(|| stayer.saw(&Frame::disconnect(mover.id)));

        // Membership stays consistent with every client's own view.
        let mut total = 0;
        for lobby in server.registry.lobbies() {
            let members = lobby.member_ids();
            total += members.len();
            for id in members {
                let summary = server.registry.find_client(id).unwrap();
                assert_eq!(summary.lobby_id, Some(lobby.id()));
            }
        }
        assert_eq!(total, server.registry.connected_count());
    }

    /// A client that never sends ahead keeps its turns across `#join` and
    /// `#leave`
    #[test]
    fn strict_client_moves_without_timing_out() {
        let server = TestServer::start(test_config());
        let side = server.registry.add_lobby(Some("side".into()), None).unwrap();
        let main = server.registry.main_lobby().unwrap();
        let mut client = server.connect_strict();

        for _ in 0..5 {
            client.turn("");
        }

        let reply = client.turn("#join side");
        assert_eq!(reply, vec![Frame::purge()]);
        assert_eq!(side.member_ids(), vec![client.id]);
        for _ in 0..3 {
            assert_eq!(client.turn("1:1"), Vec::<Frame>::new());
        }

        let reply = client.turn("#leave");
        assert_eq!(reply, vec![Frame::purge()]);
        assert_eq!(main.member_ids(), vec![client.id]);
        assert_eq!(side.population(), 0);
        client.turn("");
        assert_eq!(
            server.registry.find_client(client.id).unwrap().lobby_id,
            Some(1)
        );
    }

    /// A strict client joining a busy lobby mid-cycle is served in order
    #[test]
    fn strict_client_joins_busy_lobby() {
        let server = TestServer::start(test_config());
        let arena = server.registry.add_lobby(Some("arena".into()), None).unwrap();
        let resident = server.connect().autoplay("");
        resident.queue("#join arena");
        wait_until(|| arena.population() == 1);

        let mut client = server.connect_strict();
        client.turn("");
        client.turn("#join arena");
        assert_eq!(arena.population(), 2);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.extend(client.turn("9:9"));
        }
        assert_eq!(arena.population(), 2);
        wait_until(|| resident.saw(&Frame::new(client.id, "9:9")));
        assert!(!seen.iter().any(|f| f.sender_id() == Some(client.id)));
    }

    /// `#leave` returns a client to the main lobby
    #[test]
    fn leave_returns_to_main() {
        let server = TestServer::start(test_config());
        let side = server.registry.add_lobby(Some("side".into()), None).unwrap();
        let client = server.connect().autoplay("");

        client.queue("#join side");
        wait_until(|| side.population() == 1);

        client.queue("#leave");
        wait_until(|| side.population() == 0);
        let main = server.registry.main_lobby().unwrap();
        wait_until(|| main.member_ids() == vec![client.id]);
    }

    /// Joining a full lobby terminates the client instead of orphaning it
    #[test]
    fn join_full_lobby_terminates() {
        let server = TestServer::start(test_config());
        let duel = server.registry.add_lobby(Some("duel".into()), Some(1)).unwrap();
        let first = server.connect().autoplay("");
        let second = server.connect().autoplay("");

        first.queue("#join duel");
        wait_until(|| duel.population() == 1);

        second.queue("#join duel");
        wait_until(|| server.registry.find_client(second.id).is_none());
        wait_until(|| second.is_closed());

        assert_eq!(duel.member_ids(), vec![first.id]);
        assert_eq!(server.registry.main_lobby().unwrap().population(), 0);
        assert!(!first.is_closed());
    }

    /// Unknown `#` calls are swallowed, never broadcast
    #[test]
    fn api_calls_never_broadcast() {
        let server = TestServer::start(test_config());
        let a = server.connect().autoplay("");
        let b = server.connect().autoplay("");

        a.queue("#dance");
        a.queue("#join nowhere");
        a.queue("marker");
        wait_until(|| b.saw(&Frame::new(a.id, "marker")));
        assert!(!b.saw(&Frame::new(a.id, "#dance")));
        assert!(!b.saw(&Frame::new(a.id, "#join nowhere")));
        assert_eq!(
            server.registry.find_client(a.id).unwrap().lobby_id,
            Some(1)
        );
    }

    /// The main lobby survives every attempt to drop it
    #[test]
    fn main_lobby_cannot_be_dropped() {
        let server = TestServer::start(test_config());
        assert!(server.registry.execute("lobby drop main").is_err());
        assert!(server.registry.execute("lobby drop 1").is_err());
        assert!(server.registry.main_lobby().unwrap().is_running());
    }

    /// Dropping a lobby disconnects its members
    #[test]
    fn dropping_lobby_disconnects_members() {
        let server = TestServer::start(test_config());
        let side = server.registry.add_lobby(Some("side".into()), None).unwrap();
        let client = server.connect().autoplay("");
        client.queue("#join side");
        wait_until(|| side.population() == 1);
        drop(side);

        assert_eq!(
            server.registry.execute("lobby drop side").unwrap(),
            "dropped lobby 2"
        );
        wait_until(|| server.registry.find_client(client.id).is_none());
        wait_until(|| client.is_closed());
        assert_eq!(server.registry.lobby_count(), 1);
    }

    /// Operator summon moves a client wherever it is
    #[test]
    fn summon_moves_client() {
        let server = TestServer::start(test_config());
        server.registry.execute("lobby create arena").unwrap();
        let client = server.connect().autoplay("");

        let status = server
            .registry
            .execute(&format!("lobby summon {} arena", client.id))
            .unwrap();
        assert_eq!(
            status,
            format!("moved client {} from lobby 1 to lobby 2", client.id)
        );
        assert_eq!(
            server.registry.find_client(client.id).unwrap().lobby_id,
            Some(2)
        );
        wait_until(|| client.saw(&Frame::purge()));
    }
}

/// OPERATOR FRONT END TESTS
mod rcon_tests {
    use super::*;
    use relay_server::framed;
    use relay_server::rcon::{RconServer, APPROVED};
    use tokio::io::BufReader as AsyncBufReader;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn rcon_lists_lobbies() {
        let config = ServerConfig {
            rcon_password: "letmein".to_string(),
            ..test_config()
        };
        let registry = Registry::new(config, 0).unwrap();
        let rcon = RconServer::bind("127.0.0.1:0", Arc::clone(&registry))
            .await
            .unwrap();
        let addr = rcon.local_addr().unwrap();
        tokio::spawn(rcon.run());

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = AsyncBufReader::new(read_half);

        assert_ok!(framed::write_message(&mut write_half, "letmein").await);
        let reply = framed::read_message(&mut reader).await.unwrap();
        assert_eq!(reply.as_deref(), Some(APPROVED));

        assert_ok!(framed::write_message(&mut write_half, "lobby create arena 3").await);
        assert_ok!(framed::read_message(&mut reader).await);
        assert_ok!(framed::write_message(&mut write_half, "lobby list").await);
        let listing = framed::read_message(&mut reader).await.unwrap().unwrap();
        assert!(listing.contains("lobby 1 [main]"));
        assert!(listing.contains("lobby 2 [arena] 0/3"));

        registry.shutdown();
    }
}

/// SESSION LOGGING TESTS
mod session_tests {
    use super::*;

    #[test]
    fn harvested_frames_are_recorded() {
        let dir = std::env::temp_dir().join(format!("relay-it-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = ServerConfig {
            session_logging: true,
            session_path: dir.clone(),
            ..test_config()
        };
        let server = TestServer::start(config);
        let a = server.connect().autoplay("7:7");
        let b = server.connect().autoplay("");
        wait_until(|| b.saw(&Frame::new(a.id, "7:7")));
        let a_id = a.id;
        drop(a);
        drop(b);
        drop(server);

        let logs: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(logs.len(), 1);
        let text = std::fs::read_to_string(&logs[0]).unwrap();
        assert!(text.contains(&format!("{{{}|7:7}}", a_id)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
