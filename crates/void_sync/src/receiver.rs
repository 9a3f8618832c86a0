//! Runtime-side receiver
//!
//! Drains the channel, drops the peer's own broadcasts and calls for other
//! sessions, and hands every remaining op to the [`Applier`]. Identity
//! registrations are answered with an acknowledgement.

use void_scene::SceneGraph;

use crate::apply::{Applier, ApplyOutcome};
use crate::channel::{Envelope, MessagingChannel};
use crate::op::{decode, encode_ack, ChangeOp, IdentityAck, WireMessage};
use crate::protocol::HandlerChain;

/// Counters for received calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    /// Own broadcasts discarded
    pub echoes: u64,
    /// Calls qualified with another session
    pub foreign: u64,
    /// Calls that failed to decode
    pub malformed: u64,
    pub acks_sent: u64,
}

impl ReceiveStats {
    fn merge(&mut self, other: ReceiveStats) {
        self.received += other.received;
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.echoes += other.echoes;
        self.foreign += other.foreign;
        self.malformed += other.malformed;
        self.acks_sent += other.acks_sent;
    }
}

/// Applies remote ops to a local scene
#[derive(Debug)]
pub struct Receiver {
    session: String,
    applier: Applier,
    totals: ReceiveStats,
}

impl Receiver {
    pub fn new(session: impl Into<String>, chain: HandlerChain) -> Self {
        Self {
            session: session.into(),
            applier: Applier::new(chain),
            totals: ReceiveStats::default(),
        }
    }

    /// Build the path cache before the first op arrives
    pub fn warm(&mut self, scene: &dyn SceneGraph) {
        self.applier.warm(scene);
    }

    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    /// Counters since construction
    pub fn totals(&self) -> ReceiveStats {
        self.totals
    }

    /// Handle everything waiting on the channel
    pub fn poll(&mut self, scene: &mut dyn SceneGraph, channel: &dyn MessagingChannel) -> ReceiveStats {
        let mut stats = ReceiveStats::default();
        while let Some(envelope) = channel.try_recv() {
            self.handle(scene, channel, envelope, &mut stats);
        }
        if stats.received > 0 {
            log::debug!(
                "received {} calls: {} applied, {} skipped, {} echoes",
                stats.received,
                stats.applied,
                stats.skipped,
                stats.echoes
            );
        }
        self.totals.merge(stats);
        stats
    }

    fn handle(
        &mut self,
        scene: &mut dyn SceneGraph,
        channel: &dyn MessagingChannel,
        envelope: Envelope,
        stats: &mut ReceiveStats,
    ) {
        stats.received += 1;
        if envelope.sender == channel.local_id() {
            stats.echoes += 1;
            return;
        }

        let decoded = match decode(&envelope.call) {
            Ok(decoded) => decoded,
            Err(e) => {
                stats.malformed += 1;
                log::warn!("dropping call from {}: {}", envelope.sender, e);
                return;
            }
        };
        if decoded.session != self.session {
            stats.foreign += 1;
            log::debug!("ignoring {} for session '{}'", envelope.call.name, decoded.session);
            return;
        }

        let op = match decoded.message {
            WireMessage::Op(op) => op,
            WireMessage::Ack(ack) => {
                log::debug!("ignoring ack for {} on the receiving side", ack.resource_id);
                return;
            }
        };

        let outcome = self.applier.apply(scene, &op);
        match &outcome {
            ApplyOutcome::Applied => stats.applied += 1,
            ApplyOutcome::Skipped(_) => stats.skipped += 1,
        }

        if let ChangeOp::RegisterIdentity { resource_id, .. } = &op {
            let ack = IdentityAck {
                resource_id: resource_id.clone(),
                success: outcome.is_applied(),
                error: match outcome {
                    ApplyOutcome::Applied => None,
                    ApplyOutcome::Skipped(reason) => Some(reason),
                },
            };
            match encode_ack(&ack, &self.session).map(|call| channel.send(call)) {
                Ok(Ok(())) => stats.acks_sent += 1,
                Ok(Err(e)) => log::warn!("ack for {} not sent: {}", ack.resource_id, e),
                Err(e) => log::warn!("ack for {} not encoded: {}", ack.resource_id, e),
            }
        }
    }
}
