//! # Void Sync - Live Scene Replication
//!
//! Keeps runtime peers in step with an authoring scene graph while it is
//! being edited.
//!
//! ## Pipeline
//!
//! ```text
//! host events / tick
//!        │
//!        ▼
//! EntityTracker ──▶ PendingChangeBuffer ──▶ Dispatcher ──▶ MessagingChannel
//!   (diff)            (coalesce, rate)        (encode)            │
//!                                                │                ▼
//!                                             Journal          Receiver ──▶ Applier
//! ```
//!
//! The [`IdentityRegistry`] gives shared resources a path-independent
//! identity so they survive renames and reparents of their owners.
//!
//! ## Example
//!
//! ```ignore
//! use void_sync::{LoopbackHub, SyncConfig, SyncSession};
//!
//! let hub = LoopbackHub::new();
//! let endpoint = hub.connect();
//! let mut session = SyncSession::new(SyncConfig::default())?;
//! session.start(&mut scene);
//!
//! // every frame
//! session.tick(&mut scene, &endpoint, Instant::now());
//! session.receive(&endpoint);
//!
//! // when editing ends
//! if let Some(journal) = session.stop() {
//!     journal.replay(Some(&mut persistent), HandlerChain::default())?;
//! }
//! ```

pub mod apply;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod journal;
pub mod op;
pub mod path;
pub mod protocol;
pub mod receiver;
pub mod session;
pub mod tracker;

pub use apply::{Applier, ApplyOutcome, PathCache, RemoteIdentity};
pub use buffer::{Change, PendingChangeBuffer, PendingChangeSet};
pub use channel::{ChannelError, Envelope, LoopbackEndpoint, LoopbackHub, MessagingChannel, PeerId, RemoteCall};
pub use config::{ConfigError, SyncConfig};
pub use dispatch::{CallStats, DispatchMetrics, Dispatcher};
pub use error::{PropertyError, SyncError, SyncResult};
pub use identity::{slot_resource_id, AnchorId, IdentityRegistry};
pub use journal::{Journal, JournalEntry, ReplayReport};
pub use op::{decode, encode, encode_ack, ChangeOp, Decoded, IdentityAck, OpCategory, OutgoingOp, Subject, WireMessage};
pub use protocol::{ActivationHandler, ApplyReport, HandlerChain, PropertyHandler, Refresh};
pub use receiver::{ReceiveStats, Receiver};
pub use session::{HostEvent, SyncSession, TickReport};
pub use tracker::{EntityTracker, NodeSnapshot};
