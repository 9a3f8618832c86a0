//! Session journal and replay
//!
//! Every dispatched op is also recorded here, coalesced the way the
//! pending buffer coalesces: a later op for the same (subject, category,
//! signature) replaces the earlier one, and property maps merge key-wise.
//! Entries stay in dispatch order, so replaying the selected entries in
//! order against the persistent copy of the scene reproduces the session.
//!
//! Dropping a recorded move (rename or reparent) changes the paths every
//! later entry was recorded against. Those paths are rewritten so that the
//! journal still replays from start to end.

use void_scene::{PropertyMap, SceneGraph};

use crate::apply::{Applier, ApplyOutcome};
use crate::error::{SyncError, SyncResult};
use crate::op::{ChangeOp, OpCategory, OutgoingOp, Subject};
use crate::path;
use crate::protocol::HandlerChain;

/// One recorded op
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub subject: Subject,
    pub op: ChangeOp,
    pub description: String,
    /// Whether replay includes this entry
    pub selected: bool,
}

impl JournalEntry {
    fn new(subject: Subject, op: ChangeOp) -> Self {
        Self {
            subject,
            description: op.describe(),
            // registry bookkeeping is opt-in
            selected: !op.is_identity(),
            op,
        }
    }

    fn same_facet(&self, subject: &Subject, signature: Option<&void_scene::FacetSignature>) -> bool {
        self.subject == *subject && signature.is_some() && self.op.signature() == signature
    }
}

/// Outcome of a replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub skipped: usize,
    pub unselected: usize,
}

/// Coalesced record of one session's dispatched ops
#[derive(Debug, Clone, PartialEq)]
pub struct Journal {
    session: String,
    container: String,
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new(session: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            container: container.into(),
            entries: Vec::new(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Container the ops were recorded against
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Include or exclude an entry from replay
    pub fn set_selected(&mut self, index: usize, selected: bool) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.selected = selected;
                true
            }
            None => false,
        }
    }

    pub fn select_all(&mut self, selected: bool) {
        for entry in &mut self.entries {
            entry.selected = selected;
        }
    }

    pub fn selected_count(&self) -> usize {
        self.entries.iter().filter(|e| e.selected).count()
    }

    /// Record a dispatched op
    pub fn record(&mut self, outgoing: &OutgoingOp) {
        let subject = &outgoing.subject;
        let mut op = outgoing.op.clone();
        let category = op.category();
        let signature = op.signature().cloned();
        let existing = self.entries.iter().position(|e| {
            e.subject == *subject && e.op.category() == category && e.op.signature() == signature.as_ref()
        });

        match category {
            OpCategory::Create => {}

            OpCategory::Delete => {
                let created = self
                    .entries
                    .iter()
                    .any(|e| e.subject == *subject && e.op.category() == OpCategory::Create);
                // moves stay unless the node never existed before this session
                let doomed: Vec<usize> = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.subject == *subject && (created || e.op.path_move().is_none()))
                    .map(|(i, _)| i)
                    .collect();
                for index in doomed.into_iter().rev() {
                    self.remove_entry(index);
                }
                if created {
                    return;
                }
            }

            OpCategory::FacetAdd => {
                let stale: Vec<usize> = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.same_facet(subject, signature.as_ref()))
                    .map(|(i, _)| i)
                    .collect();
                for index in stale.into_iter().rev() {
                    self.entries.remove(index);
                }
            }

            OpCategory::FacetRemove => {
                let added = self.entries.iter().any(|e| {
                    e.same_facet(subject, signature.as_ref()) && e.op.category() == OpCategory::FacetAdd
                });
                self.entries
                    .retain(|e| !e.same_facet(subject, signature.as_ref()));
                if added {
                    return;
                }
            }

            OpCategory::Properties | OpCategory::FacetUpdate | OpCategory::IdentityUpdate => {
                if category == OpCategory::FacetUpdate {
                    let add = self.entries.iter_mut().find(|e| {
                        e.same_facet(subject, signature.as_ref()) && e.op.category() == OpCategory::FacetAdd
                    });
                    if let Some(add) = add {
                        if let (Some(target), Some(delta)) = (properties_mut(&mut add.op), properties_mut(&mut op)) {
                            for (key, value) in std::mem::take(delta) {
                                if value.is_null() {
                                    target.remove(&key);
                                } else {
                                    target.insert(key, value);
                                }
                            }
                        }
                        add.description = add.op.describe();
                        return;
                    }
                }
                if let Some(index) = existing {
                    let (mut old, _) = self.remove_entry(index);
                    if let (Some(merged), Some(latest)) = (properties_mut(&mut old.op), properties_mut(&mut op)) {
                        merged.extend(std::mem::take(latest));
                        *latest = std::mem::take(merged);
                    }
                }
            }

            _ => {
                if let Some(index) = existing {
                    let (_, rebase) = self.remove_entry(index);
                    if let Some((from, to)) = rebase {
                        op.rebase_paths(&from, &to);
                        if matches!(op.path_move(), Some((old, new)) if old == new) {
                            log::debug!("journal: {} cancels out", op.describe());
                            return;
                        }
                    }
                }
            }
        }

        self.entries.push(JournalEntry::new(subject.clone(), op));
    }

    /// Remove an entry. When it was a move, later entries are rewritten as
    /// if it never happened, and the returned pair maps paths of the
    /// current scene onto that history.
    fn remove_entry(&mut self, index: usize) -> (JournalEntry, Option<(String, String)>) {
        let removed = self.entries.remove(index);
        let Some((old, new)) = removed.op.path_move() else {
            return (removed, None);
        };

        let (mut from, mut to) = (new, old);
        for entry in &mut self.entries[index..] {
            let before = entry.op.path_move();
            entry.op.rebase_paths(&from, &to);
            entry.description = entry.op.describe();
            if let (Some((b_old, b_new)), Some((a_old, a_new))) = (before, entry.op.path_move()) {
                from = path::rebase(&from, &b_old, &b_new).unwrap_or(from);
                to = path::rebase(&to, &a_old, &a_new).unwrap_or(to);
            }
        }
        (removed, Some((from, to)))
    }

    /// Re-apply the selected entries, in order, as one undoable unit.
    ///
    /// Fails before touching anything if the target is missing, not
    /// loaded, or a different container than the one recorded.
    pub fn replay(&self, target: Option<&mut dyn SceneGraph>, chain: HandlerChain) -> SyncResult<ReplayReport> {
        let scene = target.ok_or_else(|| {
            SyncError::ReplayPrecondition(format!("container '{}' is not available", self.container))
        })?;
        if !scene.is_loaded() {
            return Err(SyncError::ReplayPrecondition(format!(
                "container '{}' is not loaded",
                self.container
            )));
        }
        if scene.container() != self.container {
            return Err(SyncError::ReplayPrecondition(format!(
                "journal was recorded against '{}', target is '{}'",
                self.container,
                scene.container()
            )));
        }

        let mut applier = Applier::new(chain);
        applier.warm(scene);
        let mut report = ReplayReport::default();

        scene.begin_undo_group(&format!("Replay session '{}'", self.session));
        for entry in &self.entries {
            if !entry.selected {
                report.unselected += 1;
                continue;
            }
            match applier.apply(scene, &entry.op) {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Skipped(_) => report.skipped += 1,
            }
        }
        scene.end_undo_group();

        log::info!(
            "replayed session '{}' into '{}': {} applied, {} skipped",
            self.session,
            self.container,
            report.applied,
            report.skipped
        );
        Ok(report)
    }
}

fn properties_mut(op: &mut ChangeOp) -> Option<&mut PropertyMap> {
    match op {
        ChangeOp::PatchNodeProperties { properties, .. }
        | ChangeOp::AddFacet { properties, .. }
        | ChangeOp::UpdateFacetProperties { properties, .. }
        | ChangeOp::UpdateIdentityProperties { properties, .. } => Some(properties),
        _ => None,
    }
}
