//! Entity state tracker
//!
//! Keeps one snapshot per observed node and turns differences between the
//! snapshot and live state into [`Change`]s for the pending buffer.
//!
//! Comparison is category-aware: positions and scales by distance,
//! rotations by angle, everything else exactly. Values that drift by less
//! than the tolerance are not written back into the snapshot, so slow
//! drift still accumulates into a detected change. Drift also keeps the
//! full-state blob quiet: a blob that moved only because of it is taken
//! as the new baseline without being sent.

use std::collections::{BTreeMap, HashMap};

use void_scene::{FacetSignature, NodeId, PropertyMap, SceneGraph, Tolerance, Transform, Value};

use crate::buffer::{Change, PendingChangeBuffer};
use crate::protocol::HandlerChain;

/// Node property key for the tag
pub const TAG_KEY: &str = "tag";
/// Node property key for the layer
pub const LAYER_KEY: &str = "layer";
/// Node property key for the static flag
pub const STATIC_KEY: &str = "isStatic";

/// Captured state of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub name: String,
    pub parent: Option<NodeId>,
    pub active: bool,
    pub transform: Transform,
    pub tag: String,
    pub layer: u32,
    pub is_static: bool,
    /// Opaque full-state blob; `None` when serialization failed
    pub state: Option<Vec<u8>>,
    pub facets: BTreeMap<FacetSignature, PropertyMap>,
    /// Live transform at the last look, drift included
    pub seen_transform: Transform,
    /// Live facet values at the last look, drift included
    pub seen_facets: BTreeMap<FacetSignature, PropertyMap>,
}

impl NodeSnapshot {
    /// Node-level properties as a patch
    pub fn node_properties(&self) -> PropertyMap {
        let mut properties = PropertyMap::new();
        properties.insert(TAG_KEY.to_string(), Value::String(self.tag.clone()));
        properties.insert(LAYER_KEY.to_string(), Value::Int(i64::from(self.layer)));
        properties.insert(STATIC_KEY.to_string(), Value::Bool(self.is_static));
        properties
    }
}

/// Read the syncable state of every facet on a node
pub fn capture_facets(
    scene: &dyn SceneGraph,
    chain: &HandlerChain,
    node: NodeId,
) -> BTreeMap<FacetSignature, PropertyMap> {
    scene
        .facet_signatures(node)
        .into_iter()
        .filter_map(|(signature, index)| {
            scene
                .facet(node, index)
                .map(|facet| (signature, chain.extract(facet)))
        })
        .collect()
}

/// Changed keys between two property maps; removed keys map to `Null`
pub fn diff_properties(old: &PropertyMap, new: &PropertyMap, tolerance: Tolerance) -> PropertyMap {
    let mut delta: PropertyMap = new
        .iter()
        .filter(|(key, value)| old.get(*key).map_or(true, |prev| !prev.approx_eq(value, tolerance)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for key in old.keys() {
        if !new.contains_key(key) {
            delta.insert(key.clone(), Value::Null);
        }
    }
    delta
}

/// Per-node snapshots and diffing
#[derive(Debug, Clone)]
pub struct EntityTracker {
    snapshots: HashMap<NodeId, NodeSnapshot>,
    tolerance: Tolerance,
}

impl EntityTracker {
    pub fn new(tolerance: Tolerance) -> Self {
        Self {
            snapshots: HashMap::new(),
            tolerance,
        }
    }

    /// Number of tracked nodes
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshot(&self, node: NodeId) -> Option<&NodeSnapshot> {
        self.snapshots.get(&node)
    }

    /// Drop every snapshot
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    fn capture(&self, scene: &dyn SceneGraph, chain: &HandlerChain, node: NodeId) -> Option<NodeSnapshot> {
        let info = scene.info(node)?;
        let state = match scene.serialize_state(node) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("{:?}: full state unavailable: {}", node, e);
                None
            }
        };
        let transform = scene.transform(node).unwrap_or_default();
        let facets = capture_facets(scene, chain, node);
        Some(NodeSnapshot {
            name: info.name,
            parent: info.parent,
            active: info.active,
            transform,
            tag: info.tag,
            layer: info.layer,
            is_static: info.is_static,
            state,
            seen_transform: transform,
            seen_facets: facets.clone(),
            facets,
        })
    }

    /// Snapshot every live node without emitting anything
    pub fn capture_all(&mut self, scene: &dyn SceneGraph, chain: &HandlerChain) {
        self.snapshots.clear();
        for node in scene.walk() {
            if let Some(snapshot) = self.capture(scene, chain, node) {
                self.snapshots.insert(node, snapshot);
            }
        }
        log::debug!("captured {} nodes in '{}'", self.snapshots.len(), scene.container());
    }

    /// Path of a node as last observed
    pub fn snapshot_path(&self, node: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let snapshot = self.snapshots.get(&id)?;
            names.push(snapshot.name.as_str());
            current = snapshot.parent;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Full pass: detect destroyed, new and changed nodes
    pub fn scan(&mut self, scene: &dyn SceneGraph, chain: &HandlerChain, buffer: &mut PendingChangeBuffer) -> usize {
        let mut changes = self.sweep_destroyed(scene, buffer);
        for node in scene.walk() {
            changes += self.observe(scene, chain, node, buffer);
        }
        changes
    }

    /// Re-read one node; returns the number of changes queued
    pub fn observe(
        &mut self,
        scene: &dyn SceneGraph,
        chain: &HandlerChain,
        node: NodeId,
        buffer: &mut PendingChangeBuffer,
    ) -> usize {
        if !scene.is_alive(node) {
            return self.destroyed(node, buffer);
        }
        if self.snapshots.contains_key(&node) {
            return self.diff(scene, chain, node, buffer);
        }

        let Some(snapshot) = self.capture(scene, chain, node) else {
            return 0;
        };
        buffer.enqueue(node, Change::Created);
        buffer.enqueue(node, Change::Properties(snapshot.node_properties()));
        let mut changes = 2;
        for (signature, properties) in &snapshot.facets {
            buffer.enqueue(node, Change::FacetAdded(signature.clone(), properties.clone()));
            changes += 1;
        }
        self.snapshots.insert(node, snapshot);
        changes
    }

    /// Handle a node that no longer exists. Descendants are forgotten
    /// silently; the peer removes them with their ancestor.
    pub fn destroyed(&mut self, node: NodeId, buffer: &mut PendingChangeBuffer) -> usize {
        let Some(path) = self.snapshot_path(node) else {
            return 0;
        };
        for descendant in self.descendants(node) {
            self.snapshots.remove(&descendant);
            buffer.discard(descendant);
        }
        let Some(snapshot) = self.snapshots.remove(&node) else {
            return 0;
        };
        buffer.enqueue(
            node,
            Change::Destroyed {
                name: snapshot.name,
                parent: snapshot.parent,
                path,
            },
        );
        1
    }

    fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut frontier = vec![node];
        while let Some(parent) = frontier.pop() {
            for (id, snapshot) in &self.snapshots {
                if snapshot.parent == Some(parent) && !out.contains(id) {
                    out.push(*id);
                    frontier.push(*id);
                }
            }
        }
        out
    }

    fn sweep_destroyed(&mut self, scene: &dyn SceneGraph, buffer: &mut PendingChangeBuffer) -> usize {
        let dead: Vec<NodeId> = self
            .snapshots
            .keys()
            .copied()
            .filter(|n| !scene.is_alive(*n))
            .collect();

        let mut changes = 0;
        // topmost dead nodes first; they take their dead descendants along
        for node in &dead {
            let parent_dead = self
                .snapshots
                .get(node)
                .and_then(|s| s.parent)
                .map_or(false, |p| self.snapshots.contains_key(&p) && !scene.is_alive(p));
            if !parent_dead {
                changes += self.destroyed(*node, buffer);
            }
        }
        for node in dead {
            if self.snapshots.contains_key(&node) {
                changes += self.destroyed(node, buffer);
            }
        }
        changes
    }

    fn diff(&mut self, scene: &dyn SceneGraph, chain: &HandlerChain, node: NodeId, buffer: &mut PendingChangeBuffer) -> usize {
        let Some(info) = scene.info(node) else {
            return 0;
        };
        let transform = scene.transform(node).unwrap_or_default();
        let facets = capture_facets(scene, chain, node);
        let old_parent_path = self
            .snapshots
            .get(&node)
            .and_then(|s| s.parent)
            .and_then(|p| self.snapshot_path(p));
        let tolerance = self.tolerance;

        let Some(snapshot) = self.snapshots.get_mut(&node) else {
            return 0;
        };
        let mut changes = Vec::new();
        let drifted = transform != snapshot.seen_transform || facets != snapshot.seen_facets;
        snapshot.seen_transform = transform;
        snapshot.seen_facets = facets.clone();

        if info.name != snapshot.name {
            changes.push(Change::Renamed {
                old_name: std::mem::replace(&mut snapshot.name, info.name.clone()),
            });
        }
        if info.parent != snapshot.parent {
            changes.push(Change::Reparented {
                old_parent: snapshot.parent,
                old_parent_path,
            });
            snapshot.parent = info.parent;
        }
        if info.active != snapshot.active {
            snapshot.active = info.active;
            changes.push(Change::Activation(info.active));
        }
        if !transform.approx_eq(&snapshot.transform, tolerance) {
            snapshot.transform = transform;
            changes.push(Change::Transform(transform));
        }

        let mut properties = PropertyMap::new();
        if info.tag != snapshot.tag {
            snapshot.tag = info.tag.clone();
            properties.insert(TAG_KEY.to_string(), Value::String(info.tag));
        }
        if info.layer != snapshot.layer {
            snapshot.layer = info.layer;
            properties.insert(LAYER_KEY.to_string(), Value::Int(i64::from(info.layer)));
        }
        if info.is_static != snapshot.is_static {
            snapshot.is_static = info.is_static;
            properties.insert(STATIC_KEY.to_string(), Value::Bool(info.is_static));
        }
        if !properties.is_empty() {
            changes.push(Change::Properties(properties));
        }

        let mut next_facets = BTreeMap::new();
        for (signature, current) in facets {
            match snapshot.facets.remove(&signature) {
                None => {
                    changes.push(Change::FacetAdded(signature.clone(), current.clone()));
                    next_facets.insert(signature, current);
                }
                Some(previous) => {
                    let delta = diff_properties(&previous, &current, tolerance);
                    if delta.is_empty() {
                        next_facets.insert(signature, previous);
                    } else {
                        changes.push(Change::FacetUpdated(signature.clone(), delta));
                        next_facets.insert(signature, current);
                    }
                }
            }
        }
        for signature in std::mem::replace(&mut snapshot.facets, next_facets).into_keys() {
            changes.push(Change::FacetRemoved(signature));
        }

        // the full-state blob only speaks when nothing finer-grained did,
        // and not when sub-tolerance drift explains the difference
        match scene.serialize_state(node) {
            Ok(state) => {
                if changes.is_empty() && !drifted && snapshot.state.as_ref() != Some(&state) {
                    changes.push(Change::FullState(state.clone()));
                }
                snapshot.state = Some(state);
            }
            Err(e) => {
                if changes.is_empty() {
                    log::warn!("{}: full state dropped: {}", snapshot.name, e);
                }
            }
        }

        let count = changes.len();
        for change in changes {
            buffer.enqueue(node, change);
        }
        count
    }
}
