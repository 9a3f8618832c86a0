//! Pending change buffer
//!
//! Detected changes are queued per node and coalesced until the next flush.
//! Each category holds at most one value (latest wins); node property
//! patches and facet maps merge key-wise.
//!
//! Paths are resolved at flush time, not at enqueue time, so a Transform
//! queued before a rename addresses the renamed node. Flush order:
//!
//! 1. renames, shallowest first, addressed by the name the peer still knows
//! 2. reparents
//! 3. creates and deletes, in the order they happened
//! 4. everything else per node; Transform only once per interval

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use void_scene::{FacetSignature, NodeId, PropertyMap, SceneGraph, Transform};

use crate::op::{ChangeOp, OutgoingOp};
use crate::path;

/// A detected difference for one node
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Node appeared
    Created,
    /// Node disappeared. `path` is its last observed path, used when the
    /// parent is gone too.
    Destroyed {
        name: String,
        parent: Option<NodeId>,
        path: String,
    },
    /// Name changed; carries the previous name
    Renamed { old_name: String },
    /// Parent changed; carries the previous parent
    Reparented {
        old_parent: Option<NodeId>,
        old_parent_path: Option<String>,
    },
    Activation(bool),
    Transform(Transform),
    /// Node-level properties (tag, layer, static flag)
    Properties(PropertyMap),
    /// Opaque full-state blob
    FullState(Vec<u8>),
    FacetAdded(FacetSignature, PropertyMap),
    /// Changed keys, with `Null` for removed keys
    FacetUpdated(FacetSignature, PropertyMap),
    FacetRemoved(FacetSignature),
}

#[derive(Debug, Clone, PartialEq)]
struct OldParent {
    node: Option<NodeId>,
    path: Option<String>,
}

/// Everything queued for one node
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PendingChangeSet {
    created: bool,
    rename: Option<String>,
    reparent: Option<OldParent>,
    activation: Option<bool>,
    transform: Option<Transform>,
    full_state: Option<Vec<u8>>,
    properties: PropertyMap,
    facet_adds: BTreeMap<FacetSignature, PropertyMap>,
    facet_updates: BTreeMap<FacetSignature, PropertyMap>,
    facet_removes: BTreeSet<FacetSignature>,
}

impl PendingChangeSet {
    pub fn is_empty(&self) -> bool {
        !self.created
            && self.rename.is_none()
            && self.reparent.is_none()
            && self.activation.is_none()
            && self.transform.is_none()
            && self.full_state.is_none()
            && self.properties.is_empty()
            && self.facet_adds.is_empty()
            && self.facet_updates.is_empty()
            && self.facet_removes.is_empty()
    }

    /// Queued transform, if any
    pub fn transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    /// Merged node property patch
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Queued facet update for a signature
    pub fn facet_update(&self, signature: &FacetSignature) -> Option<&PropertyMap> {
        self.facet_updates.get(signature)
    }

    pub fn has_facet_add(&self, signature: &FacetSignature) -> bool {
        self.facet_adds.contains_key(signature)
    }

    pub fn has_facet_remove(&self, signature: &FacetSignature) -> bool {
        self.facet_removes.contains(signature)
    }

    fn apply(&mut self, change: Change) {
        match change {
            Change::Created => self.created = true,
            // a node created in this window is sent whole from live state
            Change::Renamed { .. } | Change::Reparented { .. } | Change::Activation(_)
            | Change::Transform(_) | Change::FullState(_)
                if self.created => {}
            Change::Renamed { old_name } => {
                self.rename.get_or_insert(old_name);
            }
            Change::Reparented {
                old_parent,
                old_parent_path,
            } => {
                self.reparent.get_or_insert(OldParent {
                    node: old_parent,
                    path: old_parent_path,
                });
            }
            Change::Activation(active) => self.activation = Some(active),
            Change::Transform(transform) => self.transform = Some(transform),
            Change::FullState(state) => self.full_state = Some(state),
            Change::Properties(properties) => self.properties.extend(properties),
            Change::FacetAdded(signature, properties) => {
                self.facet_removes.remove(&signature);
                self.facet_updates.remove(&signature);
                self.facet_adds.insert(signature, properties);
            }
            Change::FacetUpdated(signature, delta) => {
                if let Some(added) = self.facet_adds.get_mut(&signature) {
                    for (key, value) in delta {
                        if value.is_null() {
                            added.remove(&key);
                        } else {
                            added.insert(key, value);
                        }
                    }
                } else {
                    self.facet_updates.entry(signature).or_default().extend(delta);
                }
            }
            Change::FacetRemoved(signature) => {
                // added and removed in the same window: the peer never sees it
                if self.facet_adds.remove(&signature).is_none() {
                    self.facet_updates.remove(&signature);
                    self.facet_removes.insert(signature);
                }
            }
            Change::Destroyed { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Structural {
    Create(NodeId),
    Delete {
        node: NodeId,
        name: String,
        parent: Option<NodeId>,
        fallback_path: String,
    },
}

/// Per-node coalescing queue with Transform rate limiting
#[derive(Debug, Clone)]
pub struct PendingChangeBuffer {
    entries: HashMap<NodeId, PendingChangeSet>,
    order: Vec<NodeId>,
    structural: Vec<Structural>,
    last_transform: HashMap<NodeId, Instant>,
    interval: Duration,
}

impl PendingChangeBuffer {
    /// Create a buffer with the given per-node Transform interval
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            structural: Vec::new(),
            last_transform: HashMap::new(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queue a change, coalescing with what is already pending
    pub fn enqueue(&mut self, node: NodeId, change: Change) {
        match change {
            Change::Destroyed { name, parent, path } => self.enqueue_delete(node, name, parent, path),
            Change::Created => {
                self.entry(node).apply(Change::Created);
                self.structural.push(Structural::Create(node));
            }
            other => self.entry(node).apply(other),
        }
    }

    fn entry(&mut self, node: NodeId) -> &mut PendingChangeSet {
        if !self.entries.contains_key(&node) {
            self.order.push(node);
        }
        self.entries.entry(node).or_default()
    }

    fn enqueue_delete(&mut self, node: NodeId, name: String, parent: Option<NodeId>, path: String) {
        self.last_transform.remove(&node);
        let pending = self.take_entry(node).unwrap_or_default();

        if pending.created {
            // created and destroyed in one window
            self.structural.retain(|s| *s != Structural::Create(node));
            return;
        }

        // address the node by the name and parent the peer still knows
        let name = pending.rename.unwrap_or(name);
        let (parent, fallback_path) = match pending.reparent {
            Some(old) => {
                let fallback = path::join(old.path.as_deref(), &name);
                (old.node, fallback)
            }
            None => (parent, path::join(path::parent(&path), &name)),
        };
        self.structural.push(Structural::Delete {
            node,
            name,
            parent,
            fallback_path,
        });
    }

    fn take_entry(&mut self, node: NodeId) -> Option<PendingChangeSet> {
        let entry = self.entries.remove(&node)?;
        self.order.retain(|n| *n != node);
        Some(entry)
    }

    /// Drop everything queued for a node without emitting anything
    pub fn discard(&mut self, node: NodeId) {
        self.take_entry(node);
        self.last_transform.remove(&node);
        self.structural.retain(|s| match s {
            Structural::Create(n) => *n != node,
            Structural::Delete { .. } => true,
        });
    }

    /// Drop all queued changes and rate-limit history
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.structural.clear();
        self.last_transform.clear();
    }

    /// Queued changes for a node
    pub fn pending(&self, node: NodeId) -> Option<&PendingChangeSet> {
        self.entries.get(&node)
    }

    /// Nodes with queued changes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.structural.is_empty()
    }

    /// Path of `node` as the peer currently knows it: pending renames and
    /// reparents not yet sent are undone.
    fn remote_path(&self, scene: &dyn SceneGraph, node: NodeId) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let entry = self.entries.get(&id);
            let name = match entry.and_then(|e| e.rename.clone()) {
                Some(old) => old,
                None => scene.info(id)?.name,
            };
            segments.push(name);

            current = match entry.and_then(|e| e.reparent.as_ref()) {
                Some(old) => match old.node.filter(|p| scene.is_alive(*p)) {
                    Some(p) => Some(p),
                    None => {
                        if let Some(prefix) = &old.path {
                            segments.push(prefix.clone());
                        }
                        None
                    }
                },
                None => scene.parent(id),
            };
        }
        segments.reverse();
        Some(segments.join("/"))
    }

    fn by_depth(&self, scene: &dyn SceneGraph, pick: impl Fn(&PendingChangeSet) -> bool) -> Vec<NodeId> {
        let mut nodes: Vec<(usize, NodeId)> = self
            .order
            .iter()
            .filter(|n| self.entries.get(*n).map_or(false, &pick) && scene.is_alive(**n))
            .filter_map(|n| scene.path_of(*n).map(|p| (path::depth(&p), *n)))
            .collect();
        nodes.sort_by_key(|(depth, _)| *depth);
        nodes.into_iter().map(|(_, n)| n).collect()
    }

    /// Emit everything that is due
    pub fn flush(&mut self, scene: &dyn SceneGraph, now: Instant) -> Vec<OutgoingOp> {
        let mut out = Vec::new();
        self.flush_renames(scene, &mut out);
        self.flush_reparents(scene, &mut out);
        self.flush_structural(scene, &mut out);
        self.flush_entries(scene, now, &mut out);

        if !out.is_empty() {
            log::debug!(
                "flushed {} ops, {} nodes still pending",
                out.len(),
                self.entries.len()
            );
        }
        out
    }

    fn flush_renames(&mut self, scene: &dyn SceneGraph, out: &mut Vec<OutgoingOp>) {
        for node in self.by_depth(scene, |e| e.rename.is_some()) {
            let Some(path) = self.remote_path(scene, node) else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&node) {
                entry.rename = None;
            }
            let Some(info) = scene.info(node) else {
                continue;
            };
            if path::leaf(&path) != info.name {
                out.push(OutgoingOp::node(
                    node,
                    ChangeOp::RenameNode {
                        path,
                        new_name: info.name,
                    },
                ));
            }
        }
    }

    fn flush_reparents(&mut self, scene: &dyn SceneGraph, out: &mut Vec<OutgoingOp>) {
        for node in self.by_depth(scene, |e| e.reparent.is_some()) {
            let Some(path) = self.remote_path(scene, node) else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&node) {
                entry.reparent = None;
            }
            let new_parent_path = scene
                .parent(node)
                .and_then(|p| self.remote_path(scene, p));
            if path::join(new_parent_path.as_deref(), path::leaf(&path)) != path {
                out.push(OutgoingOp::node(
                    node,
                    ChangeOp::ReparentNode {
                        path,
                        new_parent_path,
                    },
                ));
            }
        }
    }

    fn flush_structural(&mut self, scene: &dyn SceneGraph, out: &mut Vec<OutgoingOp>) {
        for item in std::mem::take(&mut self.structural) {
            match item {
                Structural::Create(node) => {
                    if let Some(entry) = self.entries.get_mut(&node) {
                        entry.created = false;
                    }
                    match create_op(scene, node) {
                        Some(op) => out.push(OutgoingOp::node(node, op)),
                        None => log::warn!("created node {:?} vanished before flush", node),
                    }
                }
                Structural::Delete {
                    node,
                    name,
                    parent,
                    fallback_path,
                } => {
                    let path = parent
                        .filter(|p| scene.is_alive(*p))
                        .and_then(|p| self.remote_path(scene, p))
                        .map(|parent_path| path::join(Some(&parent_path), &name))
                        .unwrap_or(fallback_path);
                    out.push(OutgoingOp::node(node, ChangeOp::DeleteNode { path }));
                }
            }
        }
    }

    fn flush_entries(&mut self, scene: &dyn SceneGraph, now: Instant, out: &mut Vec<OutgoingOp>) {
        for node in self.order.clone() {
            if !scene.is_alive(node) {
                self.take_entry(node);
                continue;
            }
            let (Some(path), Some(entry)) = (scene.path_of(node), self.entries.get_mut(&node)) else {
                continue;
            };

            if let Some(active) = entry.activation.take() {
                out.push(OutgoingOp::node(node, ChangeOp::SetActive { path: path.clone(), active }));
            }
            if !entry.properties.is_empty() {
                out.push(OutgoingOp::node(
                    node,
                    ChangeOp::PatchNodeProperties {
                        path: path.clone(),
                        properties: std::mem::take(&mut entry.properties),
                    },
                ));
            }
            if let Some(state) = entry.full_state.take() {
                out.push(OutgoingOp::node(node, ChangeOp::ReplaceNodeState { path: path.clone(), state }));
            }
            // highest ordinal first so earlier removals do not shift later ones
            for signature in std::mem::take(&mut entry.facet_removes).into_iter().rev() {
                out.push(OutgoingOp::node(
                    node,
                    ChangeOp::RemoveFacet {
                        path: path.clone(),
                        signature,
                    },
                ));
            }
            for (signature, properties) in std::mem::take(&mut entry.facet_adds) {
                out.push(OutgoingOp::node(
                    node,
                    ChangeOp::AddFacet {
                        path: path.clone(),
                        signature,
                        properties,
                    },
                ));
            }
            for (signature, properties) in std::mem::take(&mut entry.facet_updates) {
                out.push(OutgoingOp::node(
                    node,
                    ChangeOp::UpdateFacetProperties {
                        path: path.clone(),
                        signature,
                        properties,
                    },
                ));
            }

            if let Some(transform) = entry.transform {
                let due = self
                    .last_transform
                    .get(&node)
                    .map_or(true, |last| now.saturating_duration_since(*last) >= self.interval);
                if due {
                    entry.transform = None;
                    self.last_transform.insert(node, now);
                    out.push(OutgoingOp::node(node, ChangeOp::UpdateTransform { path, transform }));
                }
            }

            if entry.is_empty() {
                self.take_entry(node);
            }
        }
    }
}

/// Build a CreateNode op from live state
fn create_op(scene: &dyn SceneGraph, node: NodeId) -> Option<ChangeOp> {
    let info = scene.info(node)?;
    let path = scene.path_of(node)?;
    let opaque_state = match scene.serialize_state(node) {
        Ok(state) => Some(state),
        Err(e) => {
            log::warn!("{}: sending create without state: {}", path, e);
            None
        }
    };
    Some(ChangeOp::CreateNode {
        path,
        name: info.name,
        parent_path: info.parent.and_then(|p| scene.path_of(p)),
        transform: scene.transform(node).unwrap_or_default(),
        active: info.active,
        shape_hint: scene.shape_hint(node),
        opaque_state,
    })
}
