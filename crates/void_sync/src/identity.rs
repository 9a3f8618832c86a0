//! Stable identity registry
//!
//! Shared resources (materials, meshes, clips) are referenced from node
//! slots and outlive renames and reparents of their owners. The registry
//! gives each owner a durable 128-bit anchor stored on the node itself, and
//! names every tracked resource either by its persisted asset id or by
//! `anchor:slot`.
//!
//! Registration is a request/acknowledge round trip. Unacknowledged
//! registrations are re-sent every tick until acknowledged or unregistered.
//!
//! The registry is written for more than one caller: every operation runs
//! under one lock, so two paths racing to anchor the same owner agree on a
//! single anchor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use void_scene::{NodeId, PropertyMap, ResourceHandle, SceneGraph, SceneResult, Tolerance};

use crate::op::{ChangeOp, IdentityAck, OutgoingOp};
use crate::protocol::HandlerChain;
use crate::tracker::diff_properties;

/// Durable, path-independent owner identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorId(Uuid);

impl AnchorId {
    /// Create a new random anchor
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from the 128-bit value stored on a node
    pub fn from_u128(bits: u128) -> Self {
        Self(Uuid::from_u128(bits))
    }

    /// The value stored on the node
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// Parse the textual form produced by `Display`
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AnchorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Resource id for a runtime-only resource
pub fn slot_resource_id(anchor: AnchorId, slot: usize) -> String {
    format!("{}:{}", anchor, slot)
}

#[derive(Debug, Clone)]
struct TrackedResource {
    owner: NodeId,
    anchor: AnchorId,
    slot: usize,
    handle: ResourceHandle,
    type_hint: String,
    acknowledged: bool,
    properties: PropertyMap,
}

/// Where a tracked resource stands against its owner's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Current,
    Rederived,
    Gone,
}

#[derive(Debug, Default)]
struct RegistryState {
    anchors: HashMap<AnchorId, NodeId>,
    resources: BTreeMap<String, TrackedResource>,
}

impl RegistryState {
    fn anchor_node(&mut self, scene: &mut dyn SceneGraph, node: NodeId) -> SceneResult<AnchorId> {
        if let Some(bits) = scene.anchor(node) {
            let anchor = AnchorId::from_u128(bits);
            match self.anchors.get(&anchor).copied() {
                Some(owner) if owner != node && scene.is_alive(owner) => {
                    // duplicated owner carried the anchor along; the newcomer yields
                    log::warn!(
                        "anchor {} already owned by {:?}; regenerating for {:?}",
                        anchor,
                        owner,
                        node
                    );
                }
                _ => {
                    self.anchors.insert(anchor, node);
                    return Ok(anchor);
                }
            }
        }

        let mut anchor = AnchorId::new();
        while self.anchors.contains_key(&anchor) {
            anchor = AnchorId::new();
        }
        scene.set_anchor(node, Some(anchor.as_u128()))?;
        self.anchors.insert(anchor, node);
        Ok(anchor)
    }

    /// Check a tracked resource against the slot it came from. A slot
    /// that now holds another resource under the same id is adopted and
    /// queued for re-registration.
    fn refresh(&mut self, scene: &dyn SceneGraph, id: &str) -> Liveness {
        let Some(tracked) = self.resources.get(id) else {
            return Liveness::Gone;
        };
        if scene.is_alive(tracked.owner) && slot_handle(scene, tracked.owner, tracked.slot) == Some(tracked.handle) {
            return Liveness::Current;
        }

        let (anchor, slot) = (tracked.anchor, tracked.slot);
        let found = self
            .anchors
            .get(&anchor)
            .copied()
            .filter(|owner| scene.is_alive(*owner))
            .and_then(|owner| slot_handle(scene, owner, slot).map(|handle| (owner, handle)))
            // a replacement with its own asset id is tracked under that id
            .filter(|(_, handle)| {
                scene
                    .resource_asset_id(*handle)
                    .unwrap_or_else(|| slot_resource_id(anchor, slot))
                    == id
            });
        let Some((owner, handle)) = found else {
            return Liveness::Gone;
        };

        if let Some(tracked) = self.resources.get_mut(id) {
            tracked.owner = owner;
            tracked.handle = handle;
            tracked.type_hint = scene
                .resource(handle)
                .map(|f| f.type_tag().to_string())
                .unwrap_or_default();
            tracked.acknowledged = false;
            // empty baseline: the next poll reports every property of the replacement
            tracked.properties.clear();
        }
        log::debug!("re-derived resource {} from {:?} slot {}", id, owner, slot);
        Liveness::Rederived
    }

    fn unregister_where(&mut self, dead: impl Fn(&TrackedResource) -> bool) -> Vec<OutgoingOp> {
        let ids: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, r)| dead(r))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.resources.remove(&id).map(|_| unregister_op(id)))
            .collect()
    }
}

fn unregister_op(resource_id: String) -> OutgoingOp {
    OutgoingOp::resource(ChangeOp::UnregisterIdentity { resource_id })
}

fn slot_handle(scene: &dyn SceneGraph, node: NodeId, slot: usize) -> Option<ResourceHandle> {
    scene
        .resource_slots(node)
        .get(slot)
        .copied()
        .flatten()
        .filter(|h| scene.resource_alive(*h))
}

/// Anchors and tracked resources
#[derive(Debug)]
pub struct IdentityRegistry {
    state: Mutex<RegistryState>,
    tolerance: Tolerance,
}

impl IdentityRegistry {
    pub fn new(tolerance: Tolerance) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            tolerance,
        }
    }

    /// Anchor for a node, assigning one if needed.
    ///
    /// Repeated calls for the same node return the same anchor. A node
    /// carrying an anchor already owned by another live node gets a fresh
    /// one.
    pub fn register_anchor(&self, scene: &mut dyn SceneGraph, node: NodeId) -> SceneResult<AnchorId> {
        self.state.lock().anchor_node(scene, node)
    }

    /// Owner currently mapped to an anchor
    pub fn anchor_owner(&self, anchor: AnchorId) -> Option<NodeId> {
        self.state.lock().anchors.get(&anchor).copied()
    }

    /// Start tracking the resource in a node slot; returns its id
    pub fn track(
        &self,
        scene: &mut dyn SceneGraph,
        chain: &HandlerChain,
        node: NodeId,
        slot: usize,
    ) -> Option<String> {
        let handle = slot_handle(scene, node, slot)?;
        let mut state = self.state.lock();
        let anchor = match state.anchor_node(scene, node) {
            Ok(anchor) => anchor,
            Err(e) => {
                log::warn!("cannot anchor {:?}: {}", node, e);
                return None;
            }
        };
        let id = scene
            .resource_asset_id(handle)
            .unwrap_or_else(|| slot_resource_id(anchor, slot));

        let fresh = !state.resources.contains_key(&id) || state.refresh(scene, &id) == Liveness::Gone;
        if fresh {
            let facet = scene.resource(handle);
            let tracked = TrackedResource {
                owner: node,
                anchor,
                slot,
                handle,
                type_hint: facet.map(|f| f.type_tag().to_string()).unwrap_or_default(),
                acknowledged: false,
                properties: facet.map(|f| chain.extract(f)).unwrap_or_default(),
            };
            log::debug!("tracking resource {} ({:?} slot {})", id, node, slot);
            state.resources.insert(id.clone(), tracked);
        }
        Some(id)
    }

    /// Track every occupied slot of a node; returns how many are new
    pub fn discover(&self, scene: &mut dyn SceneGraph, chain: &HandlerChain, node: NodeId) -> usize {
        let before = self.len();
        for slot in 0..scene.resource_slots(node).len() {
            self.track(scene, chain, node, slot);
        }
        self.len() - before
    }

    /// Live handle for a resource id.
    ///
    /// When the direct mapping is stale (the slot was reassigned, the
    /// resource recreated) the resource is re-derived from owner and slot
    /// and queued for re-registration. Dead entries are dropped.
    pub fn resolve(&self, scene: &dyn SceneGraph, resource_id: &str) -> Option<ResourceHandle> {
        let mut state = self.state.lock();
        match state.refresh(scene, resource_id) {
            Liveness::Gone => {
                state.resources.remove(resource_id);
                None
            }
            Liveness::Current | Liveness::Rederived => state.resources.get(resource_id).map(|r| r.handle),
        }
    }

    /// Registration requests for everything not yet acknowledged
    pub fn pending_registrations(&self, scene: &dyn SceneGraph) -> Vec<OutgoingOp> {
        let state = self.state.lock();
        state
            .resources
            .iter()
            .filter(|(_, r)| !r.acknowledged && scene.is_alive(r.owner))
            .map(|(id, r)| {
                OutgoingOp::resource(ChangeOp::RegisterIdentity {
                    resource_id: id.clone(),
                    owner_anchor: r.anchor.to_string(),
                    owner_path: scene.path_of(r.owner).unwrap_or_default(),
                    slot_index: r.slot,
                    type_hint: r.type_hint.clone(),
                })
            })
            .collect()
    }

    /// Handle a registration reply
    pub fn acknowledge(&self, ack: &IdentityAck) {
        let mut state = self.state.lock();
        let Some(tracked) = state.resources.get_mut(&ack.resource_id) else {
            log::debug!("ack for untracked resource {}", ack.resource_id);
            return;
        };
        if ack.success {
            tracked.acknowledged = true;
        } else {
            log::warn!(
                "registration of {} rejected: {}; retrying",
                ack.resource_id,
                ack.error.as_deref().unwrap_or("no reason given")
            );
        }
    }

    pub fn is_acknowledged(&self, resource_id: &str) -> bool {
        self.state
            .lock()
            .resources
            .get(resource_id)
            .map_or(false, |r| r.acknowledged)
    }

    /// Drop an owner's anchor and resources after it was destroyed
    pub fn release_owner(&self, node: NodeId) -> Vec<OutgoingOp> {
        let mut state = self.state.lock();
        state.anchors.retain(|_, owner| *owner != node);
        state.unregister_where(|r| r.owner == node)
    }

    /// Liveness sweep: forget dead anchors and resources whose owner or
    /// slot is gone
    pub fn sweep(&self, scene: &dyn SceneGraph) -> Vec<OutgoingOp> {
        let mut state = self.state.lock();
        state.anchors.retain(|_, owner| scene.is_alive(*owner));
        let ids: Vec<String> = state.resources.keys().cloned().collect();
        let mut ops = Vec::new();
        for id in ids {
            if state.refresh(scene, &id) == Liveness::Gone && state.resources.remove(&id).is_some() {
                ops.push(unregister_op(id));
            }
        }
        if !ops.is_empty() {
            log::debug!("identity sweep released {} resources", ops.len());
        }
        ops
    }

    /// Re-snapshot tracked resources and report property changes.
    ///
    /// A resource replaced in its slot is re-derived first, so its
    /// properties are reported in full and it registers again. Resources
    /// that are gone are left for the sweep.
    pub fn poll_properties(&self, scene: &dyn SceneGraph, chain: &HandlerChain) -> Vec<OutgoingOp> {
        let mut state = self.state.lock();
        let ids: Vec<String> = state.resources.keys().cloned().collect();
        for id in &ids {
            state.refresh(scene, id);
        }

        let mut ops = Vec::new();
        for (id, tracked) in state.resources.iter_mut() {
            if !scene.resource_alive(tracked.handle) {
                continue;
            }
            let Some(facet) = scene.resource(tracked.handle) else {
                continue;
            };
            let current = chain.extract(facet);
            let delta = diff_properties(&tracked.properties, &current, self.tolerance);
            if !delta.is_empty() {
                tracked.properties = current;
                ops.push(OutgoingOp::resource(ChangeOp::UpdateIdentityProperties {
                    resource_id: id.clone(),
                    properties: delta,
                }));
            }
        }
        ops
    }

    /// Tracked resource ids
    pub fn resource_ids(&self) -> Vec<String> {
        self.state.lock().resources.keys().cloned().collect()
    }

    /// Number of tracked resources
    pub fn len(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.anchors.clear();
        state.resources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use void_scene::{MemoryFacet, MemoryScene, SceneGraph, Value, ValueKind};

    fn material(color: [f32; 4]) -> MemoryFacet {
        MemoryFacet::new("Material").with_property("color", ValueKind::Color, Value::Color(color))
    }

    fn setup() -> (MemoryScene, NodeId, IdentityRegistry, HandlerChain) {
        let mut scene = MemoryScene::new("Main");
        let crate_node = scene.create_node("Crate", None, None).unwrap();
        let mat = scene.create_resource(material([1.0, 0.0, 0.0, 1.0]), None);
        scene.assign_resource(crate_node, 0, Some(mat)).unwrap();
        (scene, crate_node, IdentityRegistry::new(Tolerance::default()), HandlerChain::default())
    }

    #[test]
    fn test_anchor_stable_and_distinct() {
        let (mut scene, a, registry, _) = setup();
        let b = scene.create_node("Other", None, None).unwrap();

        let first = registry.register_anchor(&mut scene, a).unwrap();
        assert_eq!(registry.register_anchor(&mut scene, a).unwrap(), first);
        assert_eq!(scene.anchor(a), Some(first.as_u128()));
        assert_ne!(registry.register_anchor(&mut scene, b).unwrap(), first);
    }

    #[test]
    fn test_duplicate_anchor_regenerated() {
        let (mut scene, a, registry, _) = setup();
        let original = registry.register_anchor(&mut scene, a).unwrap();
        let copy = scene.duplicate_node(a).unwrap();
        assert_eq!(scene.anchor(copy), Some(original.as_u128()));

        let regenerated = registry.register_anchor(&mut scene, copy).unwrap();
        assert_ne!(regenerated, original);
        assert_eq!(registry.anchor_owner(original), Some(a));
        assert_eq!(registry.anchor_owner(regenerated), Some(copy));
        // subsequent lookups stay unique
        assert_eq!(registry.register_anchor(&mut scene, copy).unwrap(), regenerated);
    }

    #[test]
    fn test_resource_ids() {
        let (mut scene, node, registry, chain) = setup();
        let id = registry.track(&mut scene, &chain, node, 0).unwrap();
        let anchor = AnchorId::from_u128(scene.anchor(node).unwrap());
        assert_eq!(id, slot_resource_id(anchor, 0));

        let stored = scene.create_resource(material([0.0; 4]), Some("guid-42".into()));
        scene.assign_resource(node, 1, Some(stored)).unwrap();
        assert_eq!(registry.track(&mut scene, &chain, node, 1).as_deref(), Some("guid-42"));
        assert!(registry.track(&mut scene, &chain, node, 5).is_none());
    }

    #[test]
    fn test_retry_until_acknowledged() {
        let (mut scene, node, registry, chain) = setup();
        let id = registry.track(&mut scene, &chain, node, 0).unwrap();

        assert_eq!(registry.pending_registrations(&scene).len(), 1);
        registry.acknowledge(&IdentityAck {
            resource_id: id.clone(),
            success: false,
            error: Some("busy".into()),
        });
        assert_eq!(registry.pending_registrations(&scene).len(), 1);

        registry.acknowledge(&IdentityAck {
            resource_id: id.clone(),
            success: true,
            error: None,
        });
        assert!(registry.is_acknowledged(&id));
        assert!(registry.pending_registrations(&scene).is_empty());
    }

    #[test]
    fn test_resolve_rederives_replaced_resource() {
        let (mut scene, node, registry, chain) = setup();
        let id = registry.track(&mut scene, &chain, node, 0).unwrap();
        registry.acknowledge(&IdentityAck {
            resource_id: id.clone(),
            success: true,
            error: None,
        });

        let old = scene.resource_slots(node)[0].unwrap();
        scene.destroy_resource(old);
        let replacement = scene.create_resource(material([0.0, 1.0, 0.0, 1.0]), None);
        scene.assign_resource(node, 0, Some(replacement)).unwrap();

        assert_eq!(registry.resolve(&scene, &id), Some(replacement));
        // re-registration is queued
        assert!(!registry.is_acknowledged(&id));
    }

    #[test]
    fn test_poll_picks_up_replaced_resource() {
        let (mut scene, node, registry, chain) = setup();
        let id = registry.track(&mut scene, &chain, node, 0).unwrap();
        registry.acknowledge(&IdentityAck {
            resource_id: id.clone(),
            success: true,
            error: None,
        });

        let old = scene.resource_slots(node)[0].unwrap();
        scene.destroy_resource(old);
        let replacement = scene.create_resource(material([0.0, 1.0, 0.0, 1.0]), None);
        scene.assign_resource(node, 0, Some(replacement)).unwrap();

        let ops = registry.poll_properties(&scene, &chain);
        let [OutgoingOp { op: ChangeOp::UpdateIdentityProperties { resource_id, properties }, .. }] = ops.as_slice() else {
            panic!("expected one identity update, got {:?}", ops);
        };
        assert_eq!(*resource_id, id);
        assert_eq!(properties.get("color"), Some(&Value::Color([0.0, 1.0, 0.0, 1.0])));
        assert_eq!(registry.pending_registrations(&scene).len(), 1);
        assert!(registry.sweep(&scene).is_empty());
    }

    #[test]
    fn test_sweep_releases_dead_owner() {
        let (mut scene, node, registry, chain) = setup();
        let id = registry.track(&mut scene, &chain, node, 0).unwrap();
        scene.destroy_node(node).unwrap();

        let ops = registry.sweep(&scene);
        assert_eq!(
            ops,
            vec![OutgoingOp::resource(ChangeOp::UnregisterIdentity { resource_id: id })]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_poll_reports_resource_edits() {
        let (mut scene, node, registry, chain) = setup();
        let id = registry.track(&mut scene, &chain, node, 0).unwrap();
        assert!(registry.poll_properties(&scene, &chain).is_empty());

        let handle = registry.resolve(&scene, &id).unwrap();
        scene
            .resource_mut(handle)
            .unwrap()
            .set("color", Value::Color([0.0, 0.0, 1.0, 1.0]))
            .unwrap();
        let ops = registry.poll_properties(&scene, &chain);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0].op, ChangeOp::UpdateIdentityProperties { .. }));
    }
}
