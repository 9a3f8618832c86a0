//! Replication dispatcher
//!
//! Encodes flushed ops into remote calls and sends them under a per-second
//! call budget. Calls over budget wait in a backlog for the next window;
//! nothing is dropped for being late.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::channel::{MessagingChannel, RemoteCall};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::op::{encode, ChangeOp};

const WINDOW: Duration = Duration::from_secs(1);

/// Count and size of calls sent under one name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub count: u64,
    pub bytes: u64,
}

impl CallStats {
    fn record(&mut self, bytes: usize) {
        self.count += 1;
        self.bytes += bytes as u64;
    }
}

/// Diagnostics gathered by the dispatcher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchMetrics {
    per_call: BTreeMap<String, CallStats>,
    total: CallStats,
    /// Sends the channel refused
    pub send_failures: u64,
    /// Largest backlog seen
    pub peak_backlog: usize,
}

impl DispatchMetrics {
    fn record(&mut self, call: &RemoteCall) {
        let bytes = call.wire_size();
        self.per_call.entry(call.name.clone()).or_default().record(bytes);
        self.total.record(bytes);
    }

    /// Stats for one call name
    pub fn call(&self, name: &str) -> Option<CallStats> {
        self.per_call.get(name).copied()
    }

    /// Stats per call name, sorted by name
    pub fn calls(&self) -> impl Iterator<Item = (&str, CallStats)> {
        self.per_call.iter().map(|(name, stats)| (name.as_str(), *stats))
    }

    pub fn total(&self) -> CallStats {
        self.total
    }
}

/// Packages ops as calls and sends them within budget
#[derive(Debug)]
pub struct Dispatcher {
    session: String,
    dry_run: bool,
    budget: u32,
    backlog: VecDeque<RemoteCall>,
    metrics: DispatchMetrics,
    window_start: Option<Instant>,
    sent_in_window: u32,
}

impl Dispatcher {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            session: config.session.clone(),
            dry_run: config.dry_run,
            budget: config.max_calls_per_second.max(1),
            backlog: VecDeque::new(),
            metrics: DispatchMetrics::default(),
            window_start: None,
            sent_in_window: 0,
        }
    }

    /// Encode an op and queue it; returns its wire size.
    ///
    /// In dry-run mode the call is measured and recorded but never queued.
    /// A registration for a resource that already has one waiting takes
    /// that call's place, so retries never pile up behind the budget.
    pub fn submit(&mut self, op: &ChangeOp) -> SyncResult<usize> {
        let call = encode(op, &self.session)?;
        if !self.dry_run && matches!(op, ChangeOp::RegisterIdentity { .. }) {
            let waiting = self
                .backlog
                .iter_mut()
                .find(|queued| queued.name == call.name && queued.args.get(1) == call.args.get(1));
            if let Some(waiting) = waiting {
                let size = call.wire_size();
                *waiting = call;
                return Ok(size);
            }
        }
        Ok(self.queue(call))
    }

    fn queue(&mut self, call: RemoteCall) -> usize {
        let size = call.wire_size();
        if self.dry_run {
            log::debug!("dry run: {} ({} bytes)", call.name, size);
            self.metrics.record(&call);
        } else {
            self.backlog.push_back(call);
            self.metrics.peak_backlog = self.metrics.peak_backlog.max(self.backlog.len());
        }
        size
    }

    /// Send as much of the backlog as this window's budget allows.
    /// Returns the number of calls handed to the channel.
    pub fn pump(&mut self, channel: &dyn MessagingChannel, now: Instant) -> usize {
        let window_over = self
            .window_start
            .map_or(true, |start| now.duration_since(start) >= WINDOW);
        if window_over {
            self.window_start = Some(now);
            self.sent_in_window = 0;
        }

        let mut sent = 0;
        while self.sent_in_window < self.budget {
            let Some(call) = self.backlog.pop_front() else {
                break;
            };
            self.sent_in_window += 1;
            let name = call.name.clone();
            self.metrics.record(&call);
            match channel.send(call) {
                Ok(()) => sent += 1,
                Err(e) => {
                    // best effort: a refused call is not retried
                    self.metrics.send_failures += 1;
                    log::warn!("failed to send {}: {}", name, e);
                }
            }
        }

        if !self.backlog.is_empty() {
            log::debug!("{} calls deferred to the next window", self.backlog.len());
        }
        sent
    }

    /// Calls waiting for budget
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Drop everything not yet sent
    pub fn clear_backlog(&mut self) {
        self.backlog.clear();
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = DispatchMetrics::default();
    }
}
