//! Typed observer registry and mesh events
//!
//! Every observable thing in the mesh goes through an [`Observers`]
//! registry: handlers are added and removed by [`HandlerId`], any number of
//! them may listen to the same event, and a handler that wants async
//! processing can take a channel instead of a closure.

use crate::media::TrackKind;
use crate::session::NegotiationState;
use crate::transport::RemoteTrack;
use crate::Error;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Registration token returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Multi-subscriber registry for events of type `T`
pub struct Observers<T> {
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<HandlerId, Handler<T>>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Observers<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; handlers run in registration order
    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, Arc::new(handler));
        id
    }

    /// Register a channel that receives a clone of every event
    pub fn subscribe_channel(&self) -> (HandlerId, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a handler. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    /// Deliver an event to every handler
    pub fn emit(&self, event: &T) {
        // Snapshot first so handlers may (un)subscribe while running
        let handlers: Vec<Handler<T>> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// Everything an application can observe on a [`Mesh`](crate::Mesh)
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The bus assigned our peer id and an initial context
    ContextCreated {
        /// Local peer id
        peer_id: String,
        /// Initial context id
        context: String,
    },
    /// The bus acknowledged a context change
    ContextChanged {
        /// New context id
        context: String,
    },
    /// Transport connectivity established
    PeerConnected {
        /// Remote peer id
        peer_id: String,
    },
    /// Transport connectivity lost or failed
    PeerDisconnected {
        /// Remote peer id
        peer_id: String,
    },
    /// Session closed and removed
    PeerClosed {
        /// Remote peer id
        peer_id: String,
    },
    /// Session state machine moved
    NegotiationStateChanged {
        /// Remote peer id
        peer_id: String,
        /// Previous state
        from: NegotiationState,
        /// New state
        to: NegotiationState,
    },
    /// The remote peer started sending a track
    RemoteTrack {
        /// Remote peer id
        peer_id: String,
        /// Track details
        track: RemoteTrack,
    },
    /// A remote track ended
    RemoteTrackLost {
        /// Remote peer id
        peer_id: String,
        /// Remote track id
        track_id: String,
    },
    /// A local stream was recorded for the first time
    LocalStream {
        /// Stream id
        stream_id: String,
        /// Kinds of the tracks it holds
        kinds: Vec<TrackKind>,
    },
    /// A data channel instance opened
    ChannelOpen {
        /// Remote peer id
        peer_id: String,
        /// Channel label
        label: String,
    },
    /// A data channel instance closed
    ChannelClosed {
        /// Remote peer id
        peer_id: String,
        /// Channel label
        label: String,
    },
    /// Message received on a data channel
    ChannelMessage {
        /// Remote peer id
        peer_id: String,
        /// Channel label
        label: String,
        /// Payload
        data: Bytes,
    },
    /// A non-fatal error
    Error {
        /// Session the error relates to, if any
        peer_id: Option<String>,
        /// The error
        error: Arc<Error>,
    },
}

impl MeshEvent {
    /// Wrap an error into an event
    pub fn error(peer_id: Option<&str>, error: Error) -> Self {
        MeshEvent::Error {
            peer_id: peer_id.map(str::to_string),
            error: Arc::new(error),
        }
    }
}

/// Registry of [`MeshEvent`] observers
pub type EventHub = Observers<MeshEvent>;
