//! Op applicator - applies received change ops to a scene graph
//!
//! Targets are resolved through a path cache built by a full walk and
//! refreshed lazily on a miss. Every op is applied best-effort: a missing
//! target or a bad value is logged and the op is skipped, never raised.
//! Applying the same op twice leaves the scene as applying it once.

use std::collections::HashMap;

use void_scene::{NodeId, PropertyMap, SceneGraph, Value, ValueKind};

use crate::identity::AnchorId;
use crate::op::ChangeOp;
use crate::path;
use crate::protocol::{coerce, HandlerChain};
use crate::tracker::{LAYER_KEY, STATIC_KEY, TAG_KEY};

/// Result of applying one op
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// The op did nothing; the reason was logged
    Skipped(String),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

fn skipped(reason: String) -> ApplyOutcome {
    log::warn!("{}", reason);
    ApplyOutcome::Skipped(reason)
}

/// Path to node lookups for one container
#[derive(Debug, Default)]
pub struct PathCache {
    container: Option<String>,
    nodes: HashMap<String, NodeId>,
    /// Lookups answered by the cache
    pub hits: u64,
    /// Lookups that fell back to a graph search
    pub misses: u64,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a full walk of the scene
    pub fn warm(&mut self, scene: &dyn SceneGraph) {
        self.nodes.clear();
        self.container = Some(scene.container().to_string());
        for node in scene.walk() {
            if let Some(path) = scene.path_of(node) {
                // first match wins for duplicate paths, as in find_by_path
                self.nodes.entry(path).or_insert(node);
            }
        }
        log::debug!("path cache warmed for '{}': {} nodes", scene.container(), self.nodes.len());
    }

    /// Resolve a path, validating cached entries against the live graph
    pub fn resolve(&mut self, scene: &dyn SceneGraph, path: &str) -> Option<NodeId> {
        if self.container.as_deref() != Some(scene.container()) {
            self.warm(scene);
        }

        if let Some(&node) = self.nodes.get(path) {
            if scene.is_alive(node) && scene.path_of(node).as_deref() == Some(path) {
                self.hits += 1;
                return Some(node);
            }
            self.nodes.remove(path);
        }

        self.misses += 1;
        let node = scene.find_by_path(path)?;
        self.nodes.insert(path.to_string(), node);
        Some(node)
    }

    pub fn insert(&mut self, path: String, node: NodeId) {
        self.nodes.insert(path, node);
    }

    /// Drop every entry at or below a path
    pub fn invalidate(&mut self, path: &str) {
        self.nodes.retain(|cached, _| path::rebase(cached, path, "").is_none());
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// What the runtime knows about a registered resource
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteIdentity {
    pub owner_anchor: Option<AnchorId>,
    pub owner_path: String,
    pub slot: usize,
    pub type_hint: String,
}

/// Applies ops to a scene
#[derive(Debug)]
pub struct Applier {
    chain: HandlerChain,
    cache: PathCache,
    identities: HashMap<String, RemoteIdentity>,
}

impl Applier {
    pub fn new(chain: HandlerChain) -> Self {
        Self {
            chain,
            cache: PathCache::new(),
            identities: HashMap::new(),
        }
    }

    /// Build the path cache eagerly
    pub fn warm(&mut self, scene: &dyn SceneGraph) {
        self.cache.warm(scene);
    }

    pub fn cache(&self) -> &PathCache {
        &self.cache
    }

    /// A registered resource
    pub fn identity(&self, resource_id: &str) -> Option<&RemoteIdentity> {
        self.identities.get(resource_id)
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    fn node(&mut self, scene: &dyn SceneGraph, path: &str) -> Result<NodeId, ApplyOutcome> {
        self.cache
            .resolve(scene, path)
            .ok_or_else(|| skipped(format!("target {} not found", path)))
    }

    /// Apply one op
    pub fn apply(&mut self, scene: &mut dyn SceneGraph, op: &ChangeOp) -> ApplyOutcome {
        match self.try_apply(scene, op) {
            Ok(()) => ApplyOutcome::Applied,
            Err(outcome) => outcome,
        }
    }

    fn try_apply(&mut self, scene: &mut dyn SceneGraph, op: &ChangeOp) -> Result<(), ApplyOutcome> {
        match op {
            ChangeOp::CreateNode {
                path,
                name,
                parent_path,
                transform,
                active,
                shape_hint,
                opaque_state,
            } => {
                let node = match self.cache.resolve(scene, path) {
                    Some(existing) => {
                        log::debug!("{} already exists, updating in place", path);
                        existing
                    }
                    None => {
                        let parent = match parent_path {
                            Some(parent_path) => {
                                let parent = self.cache.resolve(scene, parent_path);
                                if parent.is_none() {
                                    log::warn!("parent {} of {} not found, creating at top level", parent_path, path);
                                }
                                parent
                            }
                            None => None,
                        };
                        let node = scene
                            .create_node(name, parent, *shape_hint)
                            .map_err(|e| skipped(format!("cannot create {}: {}", path, e)))?;
                        if let Some(actual) = scene.path_of(node) {
                            self.cache.insert(actual, node);
                        }
                        node
                    }
                };

                // each field independently; one failure leaves the others in place
                if let Some(state) = opaque_state {
                    if let Err(e) = scene.restore_state(node, state) {
                        log::warn!("{}: state not restored: {}", path, e);
                    }
                }
                if let Err(e) = scene.set_transform(node, *transform) {
                    log::warn!("{}: transform not applied: {}", path, e);
                }
                if let Err(e) = scene.set_active(node, *active) {
                    log::warn!("{}: activation not applied: {}", path, e);
                }
            }

            ChangeOp::DeleteNode { path } => {
                let node = self.node(scene, path)?;
                scene
                    .destroy_node(node)
                    .map_err(|e| skipped(format!("cannot delete {}: {}", path, e)))?;
                self.cache.invalidate(path);
            }

            ChangeOp::RenameNode { path, new_name } => {
                let node = self.node(scene, path)?;
                scene
                    .set_name(node, new_name)
                    .map_err(|e| skipped(format!("cannot rename {}: {}", path, e)))?;
                self.cache.invalidate(path);
            }

            ChangeOp::SetActive { path, active } => {
                let node = self.node(scene, path)?;
                scene
                    .set_active(node, *active)
                    .map_err(|e| skipped(format!("{}: {}", path, e)))?;
            }

            ChangeOp::UpdateTransform { path, transform } => {
                let node = self.node(scene, path)?;
                scene
                    .set_transform(node, *transform)
                    .map_err(|e| skipped(format!("{}: {}", path, e)))?;
            }

            ChangeOp::PatchNodeProperties { path, properties } => {
                let node = self.node(scene, path)?;
                patch_node(scene, node, path, properties);
            }

            ChangeOp::ReplaceNodeState { path, state } => {
                let node = self.node(scene, path)?;
                scene
                    .restore_state(node, state)
                    .map_err(|e| skipped(format!("{}: state not restored: {}", path, e)))?;
            }

            ChangeOp::ReparentNode {
                path,
                new_parent_path,
            } => {
                let node = self.node(scene, path)?;
                let parent = match new_parent_path {
                    Some(parent_path) => {
                        let parent = self.cache.resolve(scene, parent_path);
                        if parent.is_none() {
                            log::warn!("new parent {} of {} not found, moving to top level", parent_path, path);
                        }
                        parent
                    }
                    None => None,
                };
                scene
                    .set_parent(node, parent)
                    .map_err(|e| skipped(format!("cannot reparent {}: {}", path, e)))?;
                self.cache.invalidate(path);
            }

            ChangeOp::AddFacet {
                path,
                signature,
                properties,
            } => {
                let node = self.node(scene, path)?;
                let index = match scene.find_facet(node, signature) {
                    Some(index) => index,
                    None => {
                        let index = scene
                            .add_facet(node, &signature.type_tag)
                            .map_err(|e| skipped(format!("{}: cannot add {}: {}", path, signature, e)))?;
                        if scene.find_facet(node, signature) != Some(index) {
                            log::warn!("{}: {} landed at a different ordinal", path, signature);
                        }
                        index
                    }
                };
                self.apply_facet(scene, node, index, path, properties);
            }

            ChangeOp::UpdateFacetProperties {
                path,
                signature,
                properties,
            } => {
                let node = self.node(scene, path)?;
                let index = scene
                    .find_facet(node, signature)
                    .ok_or_else(|| skipped(format!("{}: facet {} not found", path, signature)))?;
                self.apply_facet(scene, node, index, path, properties);
            }

            ChangeOp::RemoveFacet { path, signature } => {
                let node = self.node(scene, path)?;
                let index = scene
                    .find_facet(node, signature)
                    .ok_or_else(|| skipped(format!("{}: facet {} not found", path, signature)))?;
                scene
                    .remove_facet(node, index)
                    .map_err(|e| skipped(format!("{}: cannot remove {}: {}", path, signature, e)))?;
            }

            ChangeOp::RegisterIdentity {
                resource_id,
                owner_anchor,
                owner_path,
                slot_index,
                type_hint,
            } => {
                let anchor = match AnchorId::parse(owner_anchor) {
                    Ok(anchor) => Some(anchor),
                    Err(e) => {
                        log::warn!("{}: unreadable anchor '{}': {}", resource_id, owner_anchor, e);
                        None
                    }
                };
                let owner = self
                    .resolve_owner(scene, anchor, owner_path)
                    .ok_or_else(|| skipped(format!("owner {} of {} not found", owner_path, resource_id)))?;
                if let Some(anchor) = anchor {
                    if scene.anchor(owner).is_none() {
                        if let Err(e) = scene.set_anchor(owner, Some(anchor.as_u128())) {
                            log::warn!("{}: anchor not stored: {}", owner_path, e);
                        }
                    }
                }
                self.identities.insert(
                    resource_id.clone(),
                    RemoteIdentity {
                        owner_anchor: anchor,
                        owner_path: owner_path.clone(),
                        slot: *slot_index,
                        type_hint: type_hint.clone(),
                    },
                );
            }

            ChangeOp::UnregisterIdentity { resource_id } => {
                self.identities
                    .remove(resource_id)
                    .ok_or_else(|| skipped(format!("resource {} was not registered", resource_id)))?;
            }

            ChangeOp::UpdateIdentityProperties {
                resource_id,
                properties,
            } => {
                let identity = self
                    .identities
                    .get(resource_id)
                    .cloned()
                    .ok_or_else(|| skipped(format!("resource {} is not registered", resource_id)))?;
                let owner = self
                    .resolve_owner(scene, identity.owner_anchor, &identity.owner_path)
                    .ok_or_else(|| skipped(format!("owner of {} not found", resource_id)))?;
                if let Some(path) = scene.path_of(owner) {
                    // keep following the owner across moves
                    if let Some(entry) = self.identities.get_mut(resource_id) {
                        entry.owner_path = path;
                    }
                }
                let handle = scene
                    .resource_slots(owner)
                    .get(identity.slot)
                    .copied()
                    .flatten()
                    .ok_or_else(|| skipped(format!("slot {} of {} is empty", identity.slot, resource_id)))?;
                let facet = scene
                    .resource_mut(handle)
                    .ok_or_else(|| skipped(format!("resource {} is gone", resource_id)))?;
                self.chain.apply(facet, properties);
            }
        }
        Ok(())
    }

    fn apply_facet(
        &self,
        scene: &mut dyn SceneGraph,
        node: NodeId,
        index: usize,
        path: &str,
        properties: &PropertyMap,
    ) {
        match scene.facet_mut(node, index) {
            Some(facet) => {
                let report = self.chain.apply(facet, properties);
                if !report.is_clean() {
                    log::debug!("{}: {} of {} keys failed", path, report.failures.len(), properties.len());
                }
            }
            None => log::warn!("{}: facet {} vanished", path, index),
        }
    }

    /// Owner by path, falling back to an anchor search
    fn resolve_owner(&mut self, scene: &dyn SceneGraph, anchor: Option<AnchorId>, path: &str) -> Option<NodeId> {
        if let Some(node) = self.cache.resolve(scene, path) {
            let matches = match (anchor, scene.anchor(node)) {
                (Some(expected), Some(actual)) => expected.as_u128() == actual,
                _ => true,
            };
            if matches {
                return Some(node);
            }
        }
        let bits = anchor?.as_u128();
        scene.walk().into_iter().find(|n| scene.anchor(*n) == Some(bits))
    }
}

/// Write node-level properties key by key
fn patch_node(scene: &mut dyn SceneGraph, node: NodeId, path: &str, properties: &PropertyMap) {
    let mut keys: Vec<&String> = properties.keys().collect();
    keys.sort();
    for key in keys {
        let value = &properties[key];
        if value.is_null() {
            continue;
        }
        let result = match key.as_str() {
            TAG_KEY => coerce(key, value.clone(), &ValueKind::String)
                .map_err(|e| e.to_string())
                .and_then(|v| match v {
                    Value::String(tag) => scene.set_tag(node, &tag).map_err(|e| e.to_string()),
                    _ => Err("tag must be a string".to_string()),
                }),
            LAYER_KEY => coerce(key, value.clone(), &ValueKind::Int)
                .map_err(|e| e.to_string())
                .and_then(|v| match v.as_int().map(u32::try_from) {
                    Some(Ok(layer)) => scene.set_layer(node, layer).map_err(|e| e.to_string()),
                    _ => Err(format!("layer out of range: {:?}", v)),
                }),
            STATIC_KEY => coerce(key, value.clone(), &ValueKind::Bool)
                .map_err(|e| e.to_string())
                .and_then(|v| match v {
                    Value::Bool(flag) => scene.set_static(node, flag).map_err(|e| e.to_string()),
                    _ => Err("isStatic must be a bool".to_string()),
                }),
            _ => Err("unknown node property".to_string()),
        };
        if let Err(e) = result {
            log::warn!("{}.{}: {}", path, key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use void_scene::{FacetSignature, MemoryFacet, MemoryScene, PrimitiveShape, Transform, ValueKind};

    fn create(path: &str, parent: Option<&str>) -> ChangeOp {
        ChangeOp::CreateNode {
            path: path.to_string(),
            name: path::leaf(path).to_string(),
            parent_path: parent.map(str::to_string),
            transform: Transform::from_position([1.0, 2.0, 3.0]),
            active: true,
            shape_hint: Some(PrimitiveShape::Cube),
            opaque_state: None,
        }
    }

    fn runtime() -> (MemoryScene, Applier) {
        let mut scene = MemoryScene::new("Main");
        scene.create_node("Root", None, None).unwrap();
        let mut applier = Applier::new(HandlerChain::default());
        applier.warm(&scene);
        (scene, applier)
    }

    #[test]
    fn test_create_is_idempotent() {
        let (mut scene, mut applier) = runtime();
        let op = create("Root/Cube", Some("Root"));

        assert!(applier.apply(&mut scene, &op).is_applied());
        assert!(applier.apply(&mut scene, &op).is_applied());
        assert_eq!(scene.node_count(), 2);

        let cube = scene.find_by_path("Root/Cube").unwrap();
        assert_eq!(scene.shape_hint(cube), Some(PrimitiveShape::Cube));
        assert_eq!(scene.transform(cube).unwrap().position, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_create_with_missing_parent_goes_top_level() {
        let (mut scene, mut applier) = runtime();
        applier.apply(&mut scene, &create("Ghost/Cube", Some("Ghost")));
        assert!(scene.find_by_path("Cube").is_some());
    }

    #[test]
    fn test_missing_target_is_skipped() {
        let (mut scene, mut applier) = runtime();
        let outcome = applier.apply(
            &mut scene,
            &ChangeOp::SetActive {
                path: "Root/Nope".into(),
                active: false,
            },
        );
        assert!(matches!(outcome, ApplyOutcome::Skipped(_)));
    }

    #[test]
    fn test_rename_refreshes_cache() {
        let (mut scene, mut applier) = runtime();
        applier.apply(&mut scene, &create("Root/Cube", Some("Root")));
        applier.apply(
            &mut scene,
            &ChangeOp::RenameNode {
                path: "Root/Cube".into(),
                new_name: "Box".into(),
            },
        );

        let moved = applier.apply(
            &mut scene,
            &ChangeOp::UpdateTransform {
                path: "Root/Box".into(),
                transform: Transform::from_position([5.0, 0.0, 0.0]),
            },
        );
        assert!(moved.is_applied());
        let stale = applier.apply(
            &mut scene,
            &ChangeOp::SetActive {
                path: "Root/Cube".into(),
                active: false,
            },
        );
        assert!(!stale.is_applied());
    }

    #[test]
    fn test_node_properties_patch() {
        let (mut scene, mut applier) = runtime();
        let mut properties = PropertyMap::new();
        properties.insert(TAG_KEY.into(), Value::from("Player"));
        properties.insert(LAYER_KEY.into(), Value::Float(3.0));
        properties.insert(STATIC_KEY.into(), Value::Bool(true));
        properties.insert("bogus".into(), Value::Int(1));

        applier.apply(
            &mut scene,
            &ChangeOp::PatchNodeProperties {
                path: "Root".into(),
                properties,
            },
        );
        let info = scene.info(scene.find_by_path("Root").unwrap()).unwrap();
        assert_eq!(info.tag, "Player");
        assert_eq!(info.layer, 3);
        assert!(info.is_static);
    }

    #[test]
    fn test_facet_ops() {
        let (mut scene, mut applier) = runtime();
        scene.register_template(MemoryFacet::new("Light").with_property("intensity", ValueKind::Float, 1.0));
        let signature = FacetSignature::new("Light", 0);
        let mut properties = PropertyMap::new();
        properties.insert("intensity".into(), Value::Float(4.0));

        let add = ChangeOp::AddFacet {
            path: "Root".into(),
            signature: signature.clone(),
            properties: properties.clone(),
        };
        applier.apply(&mut scene, &add);
        applier.apply(&mut scene, &add);
        let root = scene.find_by_path("Root").unwrap();
        assert_eq!(scene.facet_count(root), 1);
        assert_eq!(scene.facet(root, 0).unwrap().get("intensity"), Some(Value::Float(4.0)));

        applier.apply(
            &mut scene,
            &ChangeOp::RemoveFacet {
                path: "Root".into(),
                signature: signature.clone(),
            },
        );
        assert_eq!(scene.facet_count(root), 0);
        let update = applier.apply(
            &mut scene,
            &ChangeOp::UpdateFacetProperties {
                path: "Root".into(),
                signature,
                properties,
            },
        );
        assert!(!update.is_applied());
    }

    #[test]
    fn test_identity_follows_anchor() {
        let (mut scene, mut applier) = runtime();
        let root = scene.find_by_path("Root").unwrap();
        let material = scene.create_resource(
            MemoryFacet::new("Material").with_property("roughness", ValueKind::Float, 0.5),
            None,
        );
        scene.assign_resource(root, 0, Some(material)).unwrap();
        let anchor = AnchorId::new();

        applier.apply(
            &mut scene,
            &ChangeOp::RegisterIdentity {
                resource_id: "mat".into(),
                owner_anchor: anchor.to_string(),
                owner_path: "Root".into(),
                slot_index: 0,
                type_hint: "Material".into(),
            },
        );
        assert_eq!(scene.anchor(root), Some(anchor.as_u128()));

        // the owner moves without the runtime being told
        scene.set_name(root, "Stage").unwrap();
        let mut properties = PropertyMap::new();
        properties.insert("roughness".into(), Value::Float(0.9));
        let outcome = applier.apply(
            &mut scene,
            &ChangeOp::UpdateIdentityProperties {
                resource_id: "mat".into(),
                properties,
            },
        );
        assert!(outcome.is_applied());
        assert_eq!(scene.resource(material).unwrap().get("roughness"), Some(Value::Float(0.9)));
        assert_eq!(applier.identity("mat").unwrap().owner_path, "Stage");
    }
}
