//! The single push connection to the backend's event endpoint.
//!
//! Frames are decoded into [`ChatEvent`]s and handed to every subscriber in
//! arrival order. Events that arrive before the first subscriber are held and
//! replayed to it. The channel never reconnects; callers watch
//! [`EventChannel::closed`] and decide for themselves.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use ghostframe_core::{BackendEndpoint, ChatEvent, MAX_EVENT_FRAME_BYTES, decode_event};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Events held for a first subscriber; older ones are dropped past this.
pub const MAX_PENDING_EVENTS: usize = 1024;

pub type EventHandler = Box<dyn Fn(&ChatEvent) + Send + Sync + 'static>;

type EventStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("connecting to {url} timed out after {waited:?}")]
    ConnectTimeout { url: String, waited: Duration },
}

#[derive(Default)]
struct Dispatch {
    handlers: Vec<EventHandler>,
    pending: VecDeque<ChatEvent>,
}

struct Shared {
    dispatch: Mutex<Dispatch>,
    closed: AtomicBool,
    state: watch::Sender<ChannelState>,
}

impl Shared {
    fn mark_closed(&self) -> bool {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        self.state.send_replace(ChannelState::Closed);
        !was_closed
    }

    fn dispatch(&self, event: ChatEvent) {
        let Ok(mut dispatch) = self.dispatch.lock() else {
            warn!("event handler list poisoned; dropping event");
            return;
        };
        if dispatch.handlers.is_empty() {
            if dispatch.pending.len() >= MAX_PENDING_EVENTS {
                warn!("no subscriber yet; dropping oldest pending event");
                dispatch.pending.pop_front();
            }
            dispatch.pending.push_back(event);
            return;
        }
        for handler in dispatch.handlers.iter() {
            handler(&event);
        }
    }
}

pub struct EventChannel {
    url: String,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventChannel {
    pub async fn open(endpoint: BackendEndpoint) -> Result<Self, ChannelError> {
        Self::open_with_timeout(endpoint, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        endpoint: BackendEndpoint,
        connect_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let url = endpoint.event_url();
        info!(url = %url, "opening event channel");

        let (stream, _) = match timeout(connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(source)) => return Err(ChannelError::Connect { url, source }),
            Err(_) => {
                return Err(ChannelError::ConnectTimeout {
                    url,
                    waited: connect_timeout,
                });
            }
        };

        let (state, _) = watch::channel(ChannelState::Open);
        let shared = Arc::new(Shared {
            dispatch: Mutex::new(Dispatch::default()),
            closed: AtomicBool::new(false),
            state,
        });
        let reader = tokio::spawn(read_events(stream, Arc::clone(&shared)));
        info!(url = %url, "event channel open");

        Ok(Self {
            url,
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Registers a handler for every subsequent event. The first handler also
    /// receives, in order, whatever arrived between `open` and now.
    ///
    /// Handlers run on the reader task and must not subscribe from inside.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        let Ok(mut dispatch) = self.shared.dispatch.lock() else {
            warn!("event handler list poisoned; subscription ignored");
            return;
        };
        let pending = std::mem::take(&mut dispatch.pending);
        if !self.shared.closed.load(Ordering::Acquire) {
            for event in &pending {
                handler(event);
            }
        }
        dispatch.handlers.push(Box::new(handler));
    }

    /// Forwards every event into a queue owned by the caller. The queue ends
    /// once the channel is closed and dropped.
    pub fn subscribe_queue(&self) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Stops dispatching and releases the connection. Idempotent.
    pub fn close(&self) {
        let first = self.shared.mark_closed();
        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        if first {
            info!(url = %self.url, "event channel closed");
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Resolves once the channel is closed, by either side.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == ChannelState::Closed).await;
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_events(mut stream: EventStream, shared: Arc<Shared>) {
    while let Some(next) = stream.next().await {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        let frame = match next {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    warn!("dropping non-utf8 event frame: {}", err);
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(?frame, "backend closed event channel");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!("event channel read failed: {}", err);
                break;
            }
        };

        if frame.len() > MAX_EVENT_FRAME_BYTES {
            warn!(bytes = frame.len(), "dropping oversized event frame");
            continue;
        }

        match decode_event(&frame) {
            Ok(event) => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.dispatch(event);
            }
            Err(err) => warn!("dropping malformed event frame: {}", err),
        }
    }

    if shared.mark_closed() {
        info!("event channel closed by backend");
    }
}
