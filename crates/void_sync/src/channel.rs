//! Messaging channel boundary
//!
//! Fire-and-forget named remote calls tagged with the sender's identity.
//! The engine never assumes delivery or cross-call ordering.
//!
//! [`LoopbackHub`] is the in-process transport: every send is broadcast to
//! all connected endpoints, the sender included, so self-echo suppression
//! is exercised exactly as it is over a real multicast transport.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Transport failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Identity of a channel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Create a new random peer ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named call with string arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub name: String,
    pub args: Vec<String>,
}

impl RemoteCall {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Bytes this call occupies on the wire (name plus arguments)
    pub fn wire_size(&self) -> usize {
        self.name.len() + self.args.iter().map(String::len).sum::<usize>()
    }
}

/// A received call with its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: PeerId,
    pub call: RemoteCall,
}

/// Best-effort named-call transport
pub trait MessagingChannel {
    /// Identity attached to every call sent from this endpoint
    fn local_id(&self) -> PeerId;

    /// Send a call to every peer. No delivery guarantee.
    fn send(&self, call: RemoteCall) -> Result<(), ChannelError>;

    /// Next received call, if any
    fn try_recv(&self) -> Option<Envelope>;
}

type PeerList = Arc<Mutex<Vec<(PeerId, Sender<Envelope>)>>>;

/// In-process broadcast hub
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    peers: PeerList,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new endpoint with a fresh identity
    pub fn connect(&self) -> LoopbackEndpoint {
        let (tx, rx) = unbounded();
        let id = PeerId::new();
        self.peers.lock().push((id, tx));
        LoopbackEndpoint {
            id,
            peers: Arc::clone(&self.peers),
            inbox: rx,
        }
    }

    /// Number of connected endpoints
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

/// One endpoint of a [`LoopbackHub`]
#[derive(Debug)]
pub struct LoopbackEndpoint {
    id: PeerId,
    peers: PeerList,
    inbox: Receiver<Envelope>,
}

impl LoopbackEndpoint {
    /// Number of calls waiting in this endpoint's inbox
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Drain every waiting call
    pub fn drain(&self) -> Vec<Envelope> {
        self.inbox.try_iter().collect()
    }
}

impl MessagingChannel for LoopbackEndpoint {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn send(&self, call: RemoteCall) -> Result<(), ChannelError> {
        let envelope = Envelope {
            sender: self.id,
            call,
        };
        let mut peers = self.peers.lock();
        // endpoints that were dropped are pruned on the next send
        peers.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
        Ok(())
    }

    fn try_recv(&self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        let id = self.id;
        self.peers.lock().retain(|(peer, _)| *peer != id);
    }
}
