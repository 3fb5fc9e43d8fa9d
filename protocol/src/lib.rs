//! Wire format shared by the relay server and its clients.
//!
//! A message is a run of text terminated by a single NUL byte. Inside a
//! message, the server speaks in frames of the form `{senderId|payload}`;
//! clients send raw payload text and the server tags it with their id.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

pub type ClientId = u32;
pub type LobbyId = u32;

/// Largest message the server accepts from a client, terminator excluded.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Sender id reserved for frames that originate from the server itself.
pub const SERVER_SENDER: ClientId = 0;

pub const DISCONNECT: &str = "D";
pub const START: char = 'S';
pub const PAUSE: char = 'P';
pub const API_PREFIX: char = '#';

const TERMINATOR: u8 = 0;
const WELCOME_TEXT: &str = "Successfully connected to server";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame at byte {0}")]
    MalformedFrame(usize),
    #[error("invalid sender '{0}'")]
    InvalidSender(String),
    #[error("malformed welcome message")]
    MalformedWelcome,
    #[error("unknown api call '{0}'")]
    UnknownApiCall(String),
    #[error("'#join' needs a lobby id or name")]
    MissingLobby,
    #[error("payload contains a frame delimiter")]
    ReservedCharacter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    Client(ClientId),
    /// `*`: addressed to everyone, used for the purge notice.
    Wildcard,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Client(id) => write!(f, "{}", id),
            Sender::Wildcard => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: Sender,
    pub payload: String,
}

impl Frame {
    pub fn new(sender: ClientId, payload: impl Into<String>) -> Self {
        Self {
            sender: Sender::Client(sender),
            payload: payload.into(),
        }
    }

    /// `{id|D}`: the client left this lobby.
    pub fn disconnect(id: ClientId) -> Self {
        Self::new(id, DISCONNECT)
    }

    /// `{*|D}`: forget everything known about every other client.
    pub fn purge() -> Self {
        Self {
            sender: Sender::Wildcard,
            payload: DISCONNECT.to_string(),
        }
    }

    /// `{0|SP..}`: operator control characters.
    pub fn control(chars: impl Into<String>) -> Self {
        Self::new(SERVER_SENDER, chars)
    }

    pub fn sender_id(&self) -> Option<ClientId> {
        match self.sender {
            Sender::Client(id) => Some(id),
            Sender::Wildcard => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.payload == DISCONNECT
    }

    pub fn encode_into(&self, out: &mut String) {
        out.push('{');
        out.push_str(&self.sender.to_string());
        out.push('|');
        out.push_str(&self.payload);
        out.push('}');
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}|{}}}", self.sender, self.payload)
    }
}

pub fn encode_frames<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> String {
    let mut out = String::new();
    for frame in frames {
        frame.encode_into(&mut out);
    }
    out
}

/// Rejects client payloads that would break out of their own frame.
pub fn check_payload(payload: &str) -> Result<(), ProtocolError> {
    if payload.contains(['{', '}']) {
        return Err(ProtocolError::ReservedCharacter);
    }
    Ok(())
}

/// Splits a message back into frames. Text between frames is not allowed.
pub fn parse_frames(text: &str) -> Result<Vec<Frame>, ProtocolError> {
    let mut frames = Vec::new();
    let mut rest = text;
    let mut offset = 0;

    while !rest.is_empty() {
        if !rest.starts_with('{') {
            return Err(ProtocolError::MalformedFrame(offset));
        }
        let close = rest.find('}').ok_or(ProtocolError::MalformedFrame(offset))?;
        let body = &rest[1..close];
        let (sender, payload) = body
            .split_once('|')
            .ok_or(ProtocolError::MalformedFrame(offset))?;
        if payload.contains('{') {
            return Err(ProtocolError::MalformedFrame(offset));
        }

        let sender = match sender {
            "*" => Sender::Wildcard,
            id => Sender::Client(
                id.parse()
                    .map_err(|_| ProtocolError::InvalidSender(id.to_string()))?,
            ),
        };
        frames.push(Frame {
            sender,
            payload: payload.to_string(),
        });

        offset += close + 1;
        rest = &rest[close + 1..];
    }

    Ok(frames)
}

/// Reads one NUL-terminated message.
///
/// Returns `Ok(None)` when the peer closed the stream before sending anything,
/// which callers treat the same as a zero-byte `recv`.
pub fn read_message<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let read = reader
        .take(MAX_MESSAGE_LEN as u64 + 1)
        .read_until(TERMINATOR, &mut buf)?;

    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&TERMINATOR) {
        buf.pop();
    } else if buf.len() > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message exceeds {} bytes", MAX_MESSAGE_LEN),
        ));
    } else {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed mid-message",
        ));
    }

    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub fn write_message<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes())?;
    writer.write_all(&[TERMINATOR])?;
    writer.flush()
}

pub fn welcome_message(client_id: ClientId, seed: u32) -> String {
    format!("{}|{}|{}", WELCOME_TEXT, client_id, seed)
}

/// Returns `(client_id, seed)` from a welcome message.
pub fn parse_welcome(text: &str) -> Result<(ClientId, u32), ProtocolError> {
    let mut parts = text.split('|');
    if parts.next() != Some(WELCOME_TEXT) {
        return Err(ProtocolError::MalformedWelcome);
    }
    let id = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::MalformedWelcome)?;
    let seed = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::MalformedWelcome)?;
    if parts.next().is_some() {
        return Err(ProtocolError::MalformedWelcome);
    }
    Ok((id, seed))
}

/// In-band requests a client can make by starting its payload with `#`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Join(String),
    Leave,
}

impl ApiCall {
    /// `None` means the payload is ordinary game data.
    pub fn parse(payload: &str) -> Option<Result<ApiCall, ProtocolError>> {
        let call = payload.strip_prefix(API_PREFIX)?;
        let mut words = call.split_whitespace();
        let verb = words.next().unwrap_or_default();

        let parsed = match verb.to_ascii_lowercase().as_str() {
            "join" => match words.next() {
                Some(lobby) => Ok(ApiCall::Join(lobby.to_string())),
                None => Err(ProtocolError::MissingLobby),
            },
            "leave" => Ok(ApiCall::Leave),
            _ => Err(ProtocolError::UnknownApiCall(call.to_string())),
        };
        Some(parsed)
    }
}
