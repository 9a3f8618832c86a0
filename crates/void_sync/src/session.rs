//! Authoring-side sync session
//!
//! One [`SyncSession`] owns everything a replication run needs: tracker,
//! pending buffer, identity registry, dispatcher and journal. The host
//! drives it from two places on its own thread:
//!
//! - [`SyncSession::on_event`] from its mutation callbacks
//! - [`SyncSession::tick`] from its periodic update
//!
//! Nothing here blocks; every step works on what is already in memory.

use std::time::{Duration, Instant};

use void_scene::{NodeId, SceneGraph};

use crate::buffer::PendingChangeBuffer;
use crate::channel::MessagingChannel;
use crate::config::{ConfigError, SyncConfig};
use crate::dispatch::{DispatchMetrics, Dispatcher};
use crate::identity::IdentityRegistry;
use crate::journal::Journal;
use crate::op::{decode, ChangeOp, OutgoingOp, Subject, WireMessage};
use crate::protocol::HandlerChain;
use crate::tracker::EntityTracker;

/// A push notification from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    NodeCreated(NodeId),
    NodeChanged(NodeId),
    NodeDestroyed(NodeId),
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Changes queued by scanning and polling
    pub changes: usize,
    /// Ops handed to the dispatcher
    pub ops: usize,
    /// Calls given to the channel
    pub sent: usize,
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |last| now.duration_since(last) >= interval)
}

/// Session-scoped replication context
#[derive(Debug)]
pub struct SyncSession {
    config: SyncConfig,
    chain: HandlerChain,
    tracker: EntityTracker,
    buffer: PendingChangeBuffer,
    registry: IdentityRegistry,
    dispatcher: Dispatcher,
    journal: Journal,
    /// Unregistrations raised outside a tick
    released: Vec<OutgoingOp>,
    running: bool,
    last_poll: Option<Instant>,
    last_sweep: Option<Instant>,
}

impl SyncSession {
    /// Create a stopped session
    pub fn new(config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tolerance = config.tolerance();
        Ok(Self {
            chain: HandlerChain::default(),
            tracker: EntityTracker::new(tolerance),
            buffer: PendingChangeBuffer::new(config.transform_interval()),
            registry: IdentityRegistry::new(tolerance),
            dispatcher: Dispatcher::new(&config),
            journal: Journal::new(config.session.clone(), String::new()),
            released: Vec::new(),
            running: false,
            last_poll: None,
            last_sweep: None,
            config,
        })
    }

    /// Replace the default handler chain
    pub fn with_handlers(mut self, chain: HandlerChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Take the baseline snapshot and start tracking.
    ///
    /// Everything already in the scene is assumed present on the peers;
    /// only later edits are replicated. Shared resources are registered.
    pub fn start(&mut self, scene: &mut dyn SceneGraph) {
        if self.running {
            log::debug!("session '{}' already running", self.config.session);
            return;
        }
        self.tracker.capture_all(scene, &self.chain);
        for node in scene.walk() {
            self.registry.discover(scene, &self.chain, node);
        }
        self.journal = Journal::new(self.config.session.clone(), scene.container());
        self.last_poll = None;
        self.last_sweep = None;
        self.running = true;
        log::info!(
            "sync session '{}' started on '{}' ({} nodes, {} resources)",
            self.config.session,
            scene.container(),
            self.tracker.len(),
            self.registry.len()
        );
    }

    /// Handle a host mutation callback; returns the number of changes queued
    pub fn on_event(&mut self, scene: &mut dyn SceneGraph, event: HostEvent) -> usize {
        if !self.running {
            return 0;
        }
        match event {
            HostEvent::NodeCreated(node) | HostEvent::NodeChanged(node) => {
                let changes = self.tracker.observe(scene, &self.chain, node, &mut self.buffer);
                if scene.is_alive(node) {
                    self.registry.discover(scene, &self.chain, node);
                } else {
                    self.released.extend(self.registry.release_owner(node));
                }
                changes
            }
            HostEvent::NodeDestroyed(node) => {
                self.released.extend(self.registry.release_owner(node));
                self.tracker.destroyed(node, &mut self.buffer)
            }
        }
    }

    /// Detect, flush and send
    pub fn tick(&mut self, scene: &mut dyn SceneGraph, channel: &dyn MessagingChannel, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        if !self.running {
            return report;
        }

        if self.config.scan_nodes_on_tick {
            report.changes += self.tracker.scan(scene, &self.chain, &mut self.buffer);
            for node in scene.walk() {
                self.registry.discover(scene, &self.chain, node);
            }
        }

        let mut identity_ops = std::mem::take(&mut self.released);
        if due(self.last_poll, self.config.resource_poll_interval(), now) {
            self.last_poll = Some(now);
            let updates = self.registry.poll_properties(scene, &self.chain);
            report.changes += updates.len();
            identity_ops.extend(updates);
        }
        if due(self.last_sweep, self.config.sweep_interval(), now) {
            self.last_sweep = Some(now);
            identity_ops.extend(self.registry.sweep(scene));
        }

        let mut ops = self.buffer.flush(scene, now);
        for outgoing in &ops {
            if let (Subject::Node(node), ChangeOp::DeleteNode { .. }) = (&outgoing.subject, &outgoing.op) {
                identity_ops.extend(self.registry.release_owner(*node));
            }
        }
        ops.extend(identity_ops);
        // unacknowledged registrations go out again every tick
        ops.extend(self.registry.pending_registrations(scene));

        for outgoing in &ops {
            match self.dispatcher.submit(&outgoing.op) {
                Ok(_) => {
                    report.ops += 1;
                    if self.config.journal_enabled {
                        self.journal.record(outgoing);
                    }
                }
                Err(e) => log::warn!("dropping {}: {}", outgoing.op.describe(), e),
            }
        }

        report.sent = self.dispatcher.pump(channel, now);
        if report.ops > 0 {
            log::debug!(
                "tick: {} changes, {} ops, {} sent, {} waiting",
                report.changes,
                report.ops,
                report.sent,
                self.dispatcher.backlog_len()
            );
        }
        report
    }

    /// Handle replies from peers; returns the number of acknowledgements
    pub fn receive(&mut self, channel: &dyn MessagingChannel) -> usize {
        let mut acks = 0;
        while let Some(envelope) = channel.try_recv() {
            if envelope.sender == channel.local_id() {
                continue;
            }
            match decode(&envelope.call) {
                Ok(decoded) if decoded.session != self.config.session => {}
                Ok(decoded) => match decoded.message {
                    WireMessage::Ack(ack) => {
                        if self.running {
                            self.registry.acknowledge(&ack);
                        }
                        acks += 1;
                    }
                    WireMessage::Op(op) => {
                        log::debug!("authoring side ignores remote {}", op.call_name());
                    }
                },
                Err(e) => log::warn!("dropping call from {}: {}", envelope.sender, e),
            }
        }
        acks
    }

    /// Stop tracking. Unflushed changes and unsent calls are discarded.
    ///
    /// Returns the journal when it holds anything worth replaying. Calling
    /// this on a stopped session does nothing.
    pub fn stop(&mut self) -> Option<Journal> {
        if !self.running {
            return None;
        }
        self.running = false;
        self.buffer.clear();
        self.dispatcher.clear_backlog();
        self.tracker.clear();
        self.registry.clear();
        self.released.clear();

        let journal = std::mem::replace(
            &mut self.journal,
            Journal::new(self.config.session.clone(), String::new()),
        );
        log::info!("sync session '{}' stopped, {} journal entries", self.config.session, journal.len());
        if journal.is_empty() {
            None
        } else {
            Some(journal)
        }
    }

    pub fn tracker(&self) -> &EntityTracker {
        &self.tracker
    }

    pub fn buffer(&self) -> &PendingChangeBuffer {
        &self.buffer
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        self.dispatcher.metrics()
    }

    pub fn reset_metrics(&mut self) {
        self.dispatcher.reset_metrics();
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if self.running {
            log::debug!("sync session '{}' dropped while running", self.config.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackHub;
    use void_scene::MemoryScene;

    #[test]
    fn test_rejects_invalid_config() {
        assert!(SyncSession::new(SyncConfig::default().with_max_calls_per_second(0)).is_err());
    }

    #[test]
    fn test_existing_nodes_are_baseline() {
        let hub = LoopbackHub::new();
        let endpoint = hub.connect();
        let mut scene = MemoryScene::new("Main");
        scene.create_node("Root", None, None).unwrap();
        let mut session = SyncSession::new(SyncConfig::default()).unwrap();

        session.start(&mut scene);
        let report = session.tick(&mut scene, &endpoint, Instant::now());
        assert_eq!(report.ops, 0);
    }

    #[test]
    fn test_stop_discards_and_is_idempotent() {
        let hub = LoopbackHub::new();
        let endpoint = hub.connect();
        let mut scene = MemoryScene::new("Main");
        let root = scene.create_node("Root", None, None).unwrap();
        let mut session = SyncSession::new(SyncConfig::default()).unwrap();
        session.start(&mut scene);

        scene.set_active(root, false).unwrap();
        session.on_event(&mut scene, HostEvent::NodeChanged(root));
        assert!(!session.buffer().is_empty());

        assert!(session.stop().is_none());
        assert!(session.buffer().is_empty());
        assert!(session.stop().is_none());
        assert_eq!(session.tick(&mut scene, &endpoint, Instant::now()), TickReport::default());
    }

    #[test]
    fn test_journal_returned_on_stop() {
        let hub = LoopbackHub::new();
        let endpoint = hub.connect();
        let mut scene = MemoryScene::new("Main");
        let root = scene.create_node("Root", None, None).unwrap();
        let mut session = SyncSession::new(SyncConfig::default()).unwrap();
        session.start(&mut scene);

        scene.set_name(root, "Stage").unwrap();
        session.tick(&mut scene, &endpoint, Instant::now());

        let journal = session.stop().unwrap();
        assert_eq!(journal.container(), "Main");
        assert_eq!(journal.len(), 1);
    }
}
