use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PRINT_PORT_FLAG: &str = "--print-port";
pub const EVENT_PATH: &str = "/ws/chat";
pub const FILE_MARKER: &str = "[file]";
pub const MAX_HANDSHAKE_LINE_BYTES: usize = 1024;
pub const MAX_EVENT_FRAME_BYTES: usize = 256 * 1024;

pub type PeerId = String;
pub type FileId = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("handshake line is empty")]
    EmptyHandshake,
    #[error("handshake line exceeds {MAX_HANDSHAKE_LINE_BYTES} bytes (got {0})")]
    HandshakeTooLong(usize),
    #[error("handshake announced port 0")]
    InvalidPort,
    #[error("event frame exceeds {MAX_EVENT_FRAME_BYTES} bytes (got {0})")]
    FrameTooLarge(usize),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Fixed avatar palette. A peer gets one value when it is first observed and
/// keeps it for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Avatar {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
    Brown,
    Black,
}

impl Avatar {
    pub const PALETTE: [Avatar; 8] = [
        Avatar::Red,
        Avatar::Orange,
        Avatar::Yellow,
        Avatar::Green,
        Avatar::Blue,
        Avatar::Purple,
        Avatar::Brown,
        Avatar::Black,
    ];

    /// Deterministic pick from the palette, keyed by the peer id.
    pub fn for_peer(peer_id: &str) -> Self {
        let digest = Sha256::digest(peer_id.as_bytes());
        Self::PALETTE[usize::from(digest[0]) % Self::PALETTE.len()]
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Avatar::Red => "🔴",
            Avatar::Orange => "🟠",
            Avatar::Yellow => "🟡",
            Avatar::Green => "🟢",
            Avatar::Blue => "🔵",
            Avatar::Purple => "🟣",
            Avatar::Brown => "🟤",
            Avatar::Black => "⚫",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Avatar::Red => "red",
            Avatar::Orange => "orange",
            Avatar::Yellow => "yellow",
            Avatar::Green => "green",
            Avatar::Blue => "blue",
            Avatar::Purple => "purple",
            Avatar::Brown => "brown",
            Avatar::Black => "black",
        }
    }

    /// Accepts either the glyph the backend renders or the lowercase name.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        Self::PALETTE
            .into_iter()
            .find(|avatar| avatar.glyph() == token || avatar.name() == token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub avatar: Avatar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    #[serde(alias = "other")]
    Them,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: FileId,
    pub name: String,
}

impl FileDescriptor {
    /// Text form carried by a plain chat message: `[file]<name>:<id>`.
    pub fn marker_text(&self) -> String {
        format!("{FILE_MARKER}{}:{}", self.name, self.id)
    }

    /// Ids are backend-generated and never contain `:`, so the split happens
    /// at the last colon and names may contain colons.
    pub fn from_marker_text(text: &str) -> Option<Self> {
        let rest = text.strip_prefix(FILE_MARKER)?;
        let (name, id) = rest.rsplit_once(':')?;
        if name.is_empty() || id.trim().is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_owned(),
            name: name.to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    File(FileDescriptor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    FileDescriptor,
}

impl MessageBody {
    pub fn from_wire_text(text: String) -> Self {
        match FileDescriptor::from_marker_text(&text) {
            Some(descriptor) => MessageBody::File(descriptor),
            None => MessageBody::Text(text),
        }
    }

    pub fn wire_text(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::File(descriptor) => descriptor.marker_text(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text(_) => MessageKind::Text,
            MessageBody::File(_) => MessageKind::FileDescriptor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub body: MessageBody,
}

impl Message {
    pub fn text(&self) -> String {
        self.body.wire_text()
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn file(&self) -> Option<&FileDescriptor> {
        match &self.body {
            MessageBody::File(descriptor) => Some(descriptor),
            MessageBody::Text(_) => None,
        }
    }
}

/// A message as the REST surface returns it. Older backends used integer ids
/// and `"other"` for the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_record_sender")]
    pub sender: Sender,
}

fn default_record_sender() -> Sender {
    Sender::Me
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Message {
            id: record.id,
            sender: record.sender,
            body: MessageBody::from_wire_text(record.text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    pub sender: Sender,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(
        default,
        deserialize_with = "deserialize_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<PeerId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// `GET /users` payload. The current contract is a mapping keyed by peer id;
/// the list form is what the first backend generation served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirectoryRecord {
    Map(BTreeMap<PeerId, PeerRecord>),
    List(Vec<PeerRecord>),
}

impl DirectoryRecord {
    /// Flattens both shapes into `(id, record)` pairs. List entries without
    /// an id cannot be addressed and are skipped.
    pub fn into_entries(self) -> Vec<(PeerId, PeerRecord)> {
        match self {
            DirectoryRecord::Map(map) => map.into_iter().collect(),
            DirectoryRecord::List(list) => list
                .into_iter()
                .filter_map(|record| record.id.clone().map(|id| (id, record)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "userName")]
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "userName")]
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFileRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: FileId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl From<SharedFileRecord> for FileDescriptor {
    fn from(record: SharedFileRecord) -> Self {
        FileDescriptor {
            id: record.id,
            name: record.name,
        }
    }
}

/// Push events delivered on the event endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    PeerJoined {
        #[serde(deserialize_with = "deserialize_id")]
        peer_id: PeerId,
        peer_name: String,
    },
    Message {
        #[serde(deserialize_with = "deserialize_id")]
        from: PeerId,
        text: String,
    },
    #[serde(other)]
    Unknown,
}

pub fn decode_event(frame: &str) -> Result<ChatEvent, CoreError> {
    if frame.len() > MAX_EVENT_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge(frame.len()));
    }
    serde_json::from_str(frame).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn encode_event(event: &ChatEvent) -> Result<String, CoreError> {
    serde_json::to_string(event).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// The single line a backend prints after `--print-port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAnnouncement {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

pub fn parse_port_announcement(line: &str) -> Result<PortAnnouncement, CoreError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CoreError::EmptyHandshake);
    }
    if line.len() > MAX_HANDSHAKE_LINE_BYTES {
        return Err(CoreError::HandshakeTooLong(line.len()));
    }

    let announcement: PortAnnouncement =
        serde_json::from_str(line).map_err(|err| CoreError::Serialization(err.to_string()))?;
    if announcement.port == 0 {
        return Err(CoreError::InvalidPort);
    }
    Ok(announcement)
}

pub fn encode_port_announcement(announcement: &PortAnnouncement) -> Result<String, CoreError> {
    serde_json::to_string(announcement).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Loopback address of a running backend. Discovered once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendEndpoint {
    port: u16,
}

impl BackendEndpoint {
    pub const HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Self::HOST, self.port))
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", Self::HOST, self.port)
    }

    pub fn event_url(&self) -> String {
        format!("ws://{}:{}{}", Self::HOST, self.port, EVENT_PATH)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Unsigned(value) => value.to_string(),
            RawId::Signed(value) => value.to_string(),
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(RawId::into_string)
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}
