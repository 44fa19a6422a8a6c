//! Authoritative client-side model of the peer directory and conversations.
//!
//! The engine is the only writer. REST snapshots, REST command results and
//! pushed events all go through `&mut self` methods, so applying them in the
//! order they are called is the whole ordering story.

use std::collections::BTreeMap;

use ghostframe_core::{
    Avatar, ChatEvent, Message, MessageBody, OutgoingMessage, Peer, PeerId, Sender,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiClient, ApiError},
    session::{Session, SessionError, SessionManager},
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not logged in")]
    NoSession,
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("display name must not be empty")]
    EmptyName,
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("login rejected: {0}")]
    Auth(#[source] ApiError),
    #[error("unknown peer {0}")]
    NotFound(PeerId),
    #[error("failed to send to {peer_id}: {source}")]
    Send {
        peer_id: PeerId,
        #[source]
        source: ApiError,
    },
    #[error("failed to load directory: {0}")]
    Directory(#[source] ApiError),
    #[error("failed to load history for {peer_id}: {source}")]
    History {
        peer_id: PeerId,
        #[source]
        source: ApiError,
    },
}

impl From<SessionError> for SyncError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Inactive => SyncError::NoSession,
            SessionError::AlreadyActive => SyncError::AlreadyLoggedIn,
        }
    }
}

/// What an applied event changed, for whoever renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    PeerJoined(Peer),
    MessageReceived { peer_id: PeerId, message: Message },
}

/// Result of a logout. The event channel tied to the old session must be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "the event channel must be closed after logout"]
pub struct LoggedOut {
    pub display_name: String,
    pub backend_acknowledged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub session: Option<Session>,
    pub peers: Vec<Peer>,
    pub conversations: BTreeMap<PeerId, Vec<Message>>,
}

#[derive(Debug)]
pub struct SyncEngine {
    api: ApiClient,
    sessions: SessionManager,
    peers: BTreeMap<PeerId, Peer>,
    conversations: BTreeMap<PeerId, Vec<Message>>,
    next_local_id: u64,
}

impl SyncEngine {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            sessions: SessionManager::new(),
            peers: BTreeMap::new(),
            conversations: BTreeMap::new(),
            next_local_id: 0,
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub async fn login(&mut self, display_name: &str) -> Result<Session, SyncError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(SyncError::EmptyName);
        }
        if self.sessions.is_active() {
            return Err(SyncError::AlreadyLoggedIn);
        }

        self.api
            .login(display_name)
            .await
            .map_err(SyncError::Auth)?;
        Ok(self.sessions.activate(display_name)?)
    }

    /// Clears local state even when the backend cannot be reached.
    pub async fn logout(&mut self) -> Result<LoggedOut, SyncError> {
        let display_name = self.sessions.require()?.display_name().to_owned();

        let backend_acknowledged = match self.api.logout().await {
            Ok(()) => true,
            Err(err) => {
                warn!("backend logout failed; clearing local session anyway: {}", err);
                false
            }
        };

        self.sessions.clear();
        self.peers.clear();
        self.conversations.clear();
        info!(display_name = %display_name, backend_acknowledged, "logged out");

        Ok(LoggedOut {
            display_name,
            backend_acknowledged,
        })
    }

    /// Replaces the directory with the backend's view. Known peers keep their avatar.
    pub async fn load_directory(&mut self) -> Result<&BTreeMap<PeerId, Peer>, SyncError> {
        self.sessions.require()?;
        let directory = self.api.users().await.map_err(SyncError::Directory)?;

        let mut peers = BTreeMap::new();
        for (id, record) in directory.into_entries() {
            let avatar = self
                .peers
                .get(&id)
                .map(|known| known.avatar)
                .or_else(|| record.avatar.as_deref().and_then(Avatar::from_token))
                .unwrap_or_else(|| Avatar::for_peer(&id));
            peers.insert(
                id.clone(),
                Peer {
                    id,
                    display_name: record.name,
                    avatar,
                },
            );
        }

        info!(peers = peers.len(), "directory loaded");
        self.peers = peers;
        Ok(&self.peers)
    }

    /// Replaces the conversation with the fetched history.
    pub async fn load_history(&mut self, peer_id: &str) -> Result<&[Message], SyncError> {
        self.sessions.require()?;
        let records = self.api.messages(peer_id).await.map_err(|source| {
            if source.is_not_found() {
                SyncError::NotFound(peer_id.to_owned())
            } else {
                SyncError::History {
                    peer_id: peer_id.to_owned(),
                    source,
                }
            }
        })?;

        let history: Vec<Message> = records.into_iter().map(Message::from).collect();
        debug!(peer_id, messages = history.len(), "history loaded");
        let conversation = self.conversations.entry(peer_id.to_owned()).or_default();
        *conversation = history;
        Ok(conversation.as_slice())
    }

    pub async fn send(&mut self, peer_id: &str, text: &str) -> Result<Message, SyncError> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.send_body(peer_id, MessageBody::Text(text.to_owned()))
            .await
    }

    /// Appends the message only after the backend accepted it.
    pub async fn send_body(
        &mut self,
        peer_id: &str,
        body: MessageBody,
    ) -> Result<Message, SyncError> {
        self.sessions.require()?;

        let outgoing = OutgoingMessage {
            text: body.wire_text(),
            sender: Sender::Me,
        };
        let created = self
            .api
            .post_message(peer_id, &outgoing)
            .await
            .map_err(|source| SyncError::Send {
                peer_id: peer_id.to_owned(),
                source,
            })?;

        let id = match created {
            Some(record) => record.id,
            None => self.mint_local_id(),
        };
        let message = Message {
            id,
            sender: Sender::Me,
            body,
        };
        self.conversations
            .entry(peer_id.to_owned())
            .or_default()
            .push(message.clone());
        debug!(peer_id, message_id = %message.id, "message sent");
        Ok(message)
    }

    pub fn apply_event(&mut self, event: ChatEvent) -> Option<SyncUpdate> {
        if !self.sessions.is_active() {
            debug!(?event, "discarding event without an active session");
            return None;
        }

        match event {
            ChatEvent::PeerJoined { peer_id, peer_name } => {
                if self.peers.contains_key(&peer_id) {
                    return None;
                }
                let peer = Peer {
                    avatar: Avatar::for_peer(&peer_id),
                    id: peer_id.clone(),
                    display_name: peer_name,
                };
                info!(peer_id = %peer.id, name = %peer.display_name, "peer joined");
                self.peers.insert(peer_id, peer.clone());
                Some(SyncUpdate::PeerJoined(peer))
            }
            ChatEvent::Message { from, text } => {
                let message = Message {
                    id: self.mint_local_id(),
                    sender: Sender::Them,
                    body: MessageBody::from_wire_text(text),
                };
                self.conversations
                    .entry(from.clone())
                    .or_default()
                    .push(message.clone());
                Some(SyncUpdate::MessageReceived {
                    peer_id: from,
                    message,
                })
            }
            ChatEvent::Unknown => {
                debug!("ignoring event of unknown type");
                None
            }
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.sessions.current()
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, Peer> {
        &self.peers
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// `None` until the peer id has been observed somewhere.
    pub fn conversation(&self, peer_id: &str) -> Option<&[Message]> {
        match self.conversations.get(peer_id) {
            Some(messages) => Some(messages.as_slice()),
            None => self.peers.contains_key(peer_id).then_some(&[][..]),
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            session: self.sessions.current().cloned(),
            peers: self.peers.values().cloned().collect(),
            conversations: self.conversations.clone(),
        }
    }

    fn mint_local_id(&mut self) -> String {
        self.next_local_id += 1;
        format!("local-{}", self.next_local_id)
    }
}
