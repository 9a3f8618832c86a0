//! In-memory scene graph
//!
//! A complete [`SceneGraph`] over plain data. Used by hosts that have no
//! native graph of their own and by every sync test. Facets are
//! schema-driven property bags; new facets added by type tag are cloned
//! from registered templates.

use crate::graph::{
    Facet, Node, NodeId, NodeInfo, PrimitiveShape, PropertyInfo, Resource, ResourceHandle, SceneError,
    SceneGraph, SceneResult, Transform,
};
use crate::handle::Arena;
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A schema-driven property bag
#[derive(Debug, Clone)]
pub struct MemoryFacet {
    type_tag: String,
    schema: Vec<PropertyInfo>,
    values: HashMap<String, Value>,
    enabled: Option<bool>,
    dirty_marks: u32,
    enable_toggles: u32,
}

impl MemoryFacet {
    /// Create an empty facet of the given type
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            schema: Vec::new(),
            values: HashMap::new(),
            enabled: None,
            dirty_marks: 0,
            enable_toggles: 0,
        }
    }

    /// Declare a writable property with its initial value
    pub fn with_property(mut self, name: &str, kind: ValueKind, initial: impl Into<Value>) -> Self {
        self.schema.push(PropertyInfo::new(name, kind));
        self.values.insert(name.to_string(), initial.into());
        self
    }

    /// Declare a read-only property with its value
    pub fn with_read_only(mut self, name: &str, kind: ValueKind, value: impl Into<Value>) -> Self {
        self.schema.push(PropertyInfo::read_only(name, kind));
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Give the facet an activation state
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Drop a property from the schema (simulates a type change on reload)
    pub fn remove_property(&mut self, name: &str) {
        self.schema.retain(|p| p.name != name);
        self.values.remove(name);
    }

    /// How many times the facet has been invalidated
    pub fn dirty_marks(&self) -> u32 {
        self.dirty_marks
    }

    /// How many activation writes the facet has received
    pub fn enable_toggles(&self) -> u32 {
        self.enable_toggles
    }
}

impl Facet for MemoryFacet {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    fn properties(&self) -> Vec<PropertyInfo> {
        self.schema.clone()
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: Value) -> SceneResult<()> {
        let info = self
            .schema
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SceneError::UnknownProperty(name.to_string()))?;
        if !info.writable {
            return Err(SceneError::ReadOnly(name.to_string()));
        }
        if !value.matches_kind(&info.kind) {
            return Err(SceneError::TypeMismatch {
                name: name.to_string(),
                expected: info.kind.name(),
            });
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) -> bool {
        match self.enabled.as_mut() {
            Some(state) => {
                *state = enabled;
                self.enable_toggles += 1;
                true
            }
            None => false,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty_marks += 1;
    }
}

/// A shared resource (material, mesh, audio clip) referenced by node slots
#[derive(Debug, Clone)]
pub struct MemoryResource {
    pub facet: MemoryFacet,
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone)]
struct MemoryNode {
    name: String,
    active: bool,
    tag: String,
    layer: u32,
    is_static: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    transform: Transform,
    facets: Vec<MemoryFacet>,
    anchor: Option<u128>,
    slots: Vec<Option<ResourceHandle>>,
    shape: Option<PrimitiveShape>,
    serializable: bool,
}

impl MemoryNode {
    fn new(name: &str, parent: Option<NodeId>, shape: Option<PrimitiveShape>) -> Self {
        Self {
            name: name.to_string(),
            active: true,
            tag: "Untagged".to_string(),
            layer: 0,
            is_static: false,
            parent,
            children: Vec::new(),
            transform: Transform::IDENTITY,
            facets: Vec::new(),
            anchor: None,
            slots: Vec::new(),
            shape,
            serializable: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SceneState {
    nodes: Arena<MemoryNode, Node>,
    roots: Vec<NodeId>,
    resources: Arena<MemoryResource, Resource>,
}

/// Full-state blob layout. BTreeMap keeps the encoding deterministic so two
/// serializations of an unchanged node compare equal.
#[derive(Debug, Serialize, Deserialize)]
struct NodeStateBlob {
    active: bool,
    tag: String,
    layer: u32,
    is_static: bool,
    transform: Transform,
    facets: Vec<FacetStateBlob>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FacetStateBlob {
    type_tag: String,
    enabled: Option<bool>,
    values: BTreeMap<String, Value>,
}

/// An in-memory scene container
#[derive(Debug, Clone)]
pub struct MemoryScene {
    container: String,
    loaded: bool,
    state: SceneState,
    templates: HashMap<String, MemoryFacet>,
    undo_stack: Vec<(String, SceneState)>,
    open_group: Option<(String, SceneState)>,
    group_depth: usize,
}

impl MemoryScene {
    /// Create an empty, loaded container
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            loaded: true,
            state: SceneState::default(),
            templates: HashMap::new(),
            undo_stack: Vec::new(),
            open_group: None,
            group_depth: 0,
        }
    }

    /// Mark the container loaded or unloaded
    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// Register the facet that `add_facet` clones for a type tag
    pub fn register_template(&mut self, template: MemoryFacet) {
        self.templates
            .insert(template.type_tag.clone(), template);
    }

    /// Attach a prepared facet; returns its index
    pub fn attach_facet(&mut self, node: NodeId, facet: MemoryFacet) -> SceneResult<usize> {
        let n = self.node_mut(node)?;
        n.facets.push(facet);
        Ok(n.facets.len() - 1)
    }

    /// Concrete access to a facet, for inspection
    pub fn memory_facet(&self, node: NodeId, index: usize) -> Option<&MemoryFacet> {
        self.state.nodes.get(node)?.facets.get(index)
    }

    /// Create a shared resource
    pub fn create_resource(&mut self, facet: MemoryFacet, asset_id: Option<String>) -> ResourceHandle {
        self.state
            .resources
            .insert(MemoryResource { facet, asset_id })
    }

    /// Destroy a shared resource; slots referencing it become dangling
    pub fn destroy_resource(&mut self, handle: ResourceHandle) -> bool {
        self.state.resources.remove(handle).is_some()
    }

    /// Put a resource into a node slot, growing the slot list as needed
    pub fn assign_resource(&mut self, node: NodeId, slot: usize, handle: Option<ResourceHandle>) -> SceneResult<()> {
        let n = self.node_mut(node)?;
        if n.slots.len() <= slot {
            n.slots.resize(slot + 1, None);
        }
        n.slots[slot] = handle;
        Ok(())
    }

    /// Concrete access to a resource, for inspection
    pub fn memory_resource(&self, handle: ResourceHandle) -> Option<&MemoryResource> {
        self.state.resources.get(handle)
    }

    /// Copy a node (with facets, slots and anchor) as a sibling
    pub fn duplicate_node(&mut self, node: NodeId) -> SceneResult<NodeId> {
        let mut copy = self.node(node)?.clone();
        copy.children.clear();
        let parent = copy.parent;
        let id = self.state.nodes.insert(copy);
        self.link(id, parent);
        Ok(id)
    }

    /// Make `serialize_state` fail for a node
    pub fn set_serializable(&mut self, node: NodeId, serializable: bool) -> SceneResult<()> {
        self.node_mut(node)?.serializable = serializable;
        Ok(())
    }

    /// Revert the most recent undo group
    pub fn undo(&mut self) -> Option<String> {
        let (label, state) = self.undo_stack.pop()?;
        self.state = state;
        Some(label)
    }

    /// Number of undo groups recorded
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of live nodes
    pub fn node_count(&self) -> usize {
        self.state.nodes.len()
    }

    fn node(&self, id: NodeId) -> SceneResult<&MemoryNode> {
        self.state.nodes.get(id).ok_or(SceneError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> SceneResult<&mut MemoryNode> {
        self.state
            .nodes
            .get_mut(id)
            .ok_or(SceneError::NodeNotFound(id))
    }

    fn link(&mut self, id: NodeId, parent: Option<NodeId>) {
        let parent = parent.filter(|p| self.state.nodes.contains(*p));
        match parent.and_then(|p| self.state.nodes.get_mut(p)) {
            Some(p) => p.children.push(id),
            None => self.state.roots.push(id),
        }
        if let Some(n) = self.state.nodes.get_mut(id) {
            n.parent = parent;
        }
    }

    fn unlink(&mut self, id: NodeId) {
        let parent = self.state.nodes.get(id).and_then(|n| n.parent);
        match parent.and_then(|p| self.state.nodes.get_mut(p)) {
            Some(p) => p.children.retain(|c| *c != id),
            None => self.state.roots.retain(|c| *c != id),
        }
    }

    fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.state.nodes.get(id).and_then(|n| n.parent);
        }
        false
    }

    fn facet_from_template(&self, type_tag: &str) -> MemoryFacet {
        self.templates
            .get(type_tag)
            .cloned()
            .unwrap_or_else(|| MemoryFacet::new(type_tag))
    }
}

impl SceneGraph for MemoryScene {
    fn container(&self) -> &str {
        &self.container
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn roots(&self) -> Vec<NodeId> {
        self.state.roots.clone()
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.state
            .nodes
            .get(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.state.nodes.contains(node)
    }

    fn info(&self, node: NodeId) -> Option<NodeInfo> {
        let n = self.state.nodes.get(node)?;
        Some(NodeInfo {
            name: n.name.clone(),
            active: n.active,
            tag: n.tag.clone(),
            layer: n.layer,
            is_static: n.is_static,
            parent: n.parent,
        })
    }

    fn transform(&self, node: NodeId) -> Option<Transform> {
        self.state.nodes.get(node).map(|n| n.transform)
    }

    fn shape_hint(&self, node: NodeId) -> Option<PrimitiveShape> {
        self.state.nodes.get(node)?.shape
    }

    fn create_node(
        &mut self,
        name: &str,
        parent: Option<NodeId>,
        shape: Option<PrimitiveShape>,
    ) -> SceneResult<NodeId> {
        if let Some(p) = parent {
            self.node(p)?;
        }
        let id = self
            .state
            .nodes
            .insert(MemoryNode::new(name, parent, shape));
        self.link(id, parent);
        Ok(id)
    }

    fn destroy_node(&mut self, node: NodeId) -> SceneResult<()> {
        self.node(node)?;
        self.unlink(node);
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.state.nodes.remove(id) {
                stack.extend(n.children);
            }
        }
        Ok(())
    }

    fn set_name(&mut self, node: NodeId, name: &str) -> SceneResult<()> {
        self.node_mut(node)?.name = name.to_string();
        Ok(())
    }

    fn set_active(&mut self, node: NodeId, active: bool) -> SceneResult<()> {
        self.node_mut(node)?.active = active;
        Ok(())
    }

    fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>) -> SceneResult<()> {
        self.node(node)?;
        if let Some(p) = parent {
            self.node(p)?;
            if self.is_descendant(p, node) {
                return Err(SceneError::Cycle { child: node, parent: p });
            }
        }
        self.unlink(node);
        self.link(node, parent);
        Ok(())
    }

    fn set_transform(&mut self, node: NodeId, transform: Transform) -> SceneResult<()> {
        self.node_mut(node)?.transform = transform;
        Ok(())
    }

    fn set_tag(&mut self, node: NodeId, tag: &str) -> SceneResult<()> {
        self.node_mut(node)?.tag = tag.to_string();
        Ok(())
    }

    fn set_layer(&mut self, node: NodeId, layer: u32) -> SceneResult<()> {
        self.node_mut(node)?.layer = layer;
        Ok(())
    }

    fn set_static(&mut self, node: NodeId, is_static: bool) -> SceneResult<()> {
        self.node_mut(node)?.is_static = is_static;
        Ok(())
    }

    fn facet_count(&self, node: NodeId) -> usize {
        self.state.nodes.get(node).map_or(0, |n| n.facets.len())
    }

    fn facet(&self, node: NodeId, index: usize) -> Option<&dyn Facet> {
        self.state
            .nodes
            .get(node)?
            .facets
            .get(index)
            .map(|f| f as &dyn Facet)
    }

    fn facet_mut(&mut self, node: NodeId, index: usize) -> Option<&mut dyn Facet> {
        self.state
            .nodes
            .get_mut(node)?
            .facets
            .get_mut(index)
            .map(|f| f as &mut dyn Facet)
    }

    fn add_facet(&mut self, node: NodeId, type_tag: &str) -> SceneResult<usize> {
        let facet = self.facet_from_template(type_tag);
        self.attach_facet(node, facet)
    }

    fn remove_facet(&mut self, node: NodeId, index: usize) -> SceneResult<()> {
        let n = self.node_mut(node)?;
        if index >= n.facets.len() {
            return Err(SceneError::FacetNotFound { node, index });
        }
        n.facets.remove(index);
        Ok(())
    }

    fn serialize_state(&self, node: NodeId) -> SceneResult<Vec<u8>> {
        let n = self.node(node)?;
        if !n.serializable {
            return Err(SceneError::Serialization(format!(
                "node '{}' refused serialization",
                n.name
            )));
        }
        let blob = NodeStateBlob {
            active: n.active,
            tag: n.tag.clone(),
            layer: n.layer,
            is_static: n.is_static,
            transform: n.transform,
            facets: n
                .facets
                .iter()
                .map(|f| FacetStateBlob {
                    type_tag: f.type_tag.clone(),
                    enabled: f.enabled,
                    values: f.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                })
                .collect(),
        };
        serde_json::to_vec(&blob).map_err(|e| SceneError::Serialization(e.to_string()))
    }

    fn restore_state(&mut self, node: NodeId, state: &[u8]) -> SceneResult<()> {
        let blob: NodeStateBlob =
            serde_json::from_slice(state).map_err(|e| SceneError::Serialization(e.to_string()))?;

        let templates: Vec<MemoryFacet> = blob
            .facets
            .iter()
            .map(|f| self.facet_from_template(&f.type_tag))
            .collect();

        let n = self.node_mut(node)?;
        n.active = blob.active;
        n.tag = blob.tag;
        n.layer = blob.layer;
        n.is_static = blob.is_static;
        n.transform = blob.transform;

        let mut facets = Vec::with_capacity(blob.facets.len());
        for (i, (saved, template)) in blob.facets.into_iter().zip(templates).enumerate() {
            // reuse the live facet (keeps its schema) when the type still matches
            let mut facet = match n.facets.get(i) {
                Some(existing) if existing.type_tag == saved.type_tag => existing.clone(),
                _ => template,
            };
            facet.enabled = saved.enabled;
            for (key, value) in saved.values {
                if facet.schema.iter().all(|p| p.name != key) {
                    log::debug!("restore_state: '{}' has no property '{}'", facet.type_tag, key);
                    continue;
                }
                facet.values.insert(key, value);
            }
            facets.push(facet);
        }
        n.facets = facets;
        Ok(())
    }

    fn anchor(&self, node: NodeId) -> Option<u128> {
        self.state.nodes.get(node)?.anchor
    }

    fn set_anchor(&mut self, node: NodeId, anchor: Option<u128>) -> SceneResult<()> {
        self.node_mut(node)?.anchor = anchor;
        Ok(())
    }

    fn resource_slots(&self, node: NodeId) -> Vec<Option<ResourceHandle>> {
        self.state
            .nodes
            .get(node)
            .map(|n| n.slots.clone())
            .unwrap_or_default()
    }

    fn resource(&self, handle: ResourceHandle) -> Option<&dyn Facet> {
        self.state
            .resources
            .get(handle)
            .map(|r| &r.facet as &dyn Facet)
    }

    fn resource_mut(&mut self, handle: ResourceHandle) -> Option<&mut dyn Facet> {
        self.state
            .resources
            .get_mut(handle)
            .map(|r| &mut r.facet as &mut dyn Facet)
    }

    fn resource_alive(&self, handle: ResourceHandle) -> bool {
        self.state.resources.contains(handle)
    }

    fn resource_asset_id(&self, handle: ResourceHandle) -> Option<String> {
        self.state
            .resources
            .get(handle)?
            .asset_id
            .clone()
    }

    fn begin_undo_group(&mut self, label: &str) {
        if self.group_depth == 0 {
            self.open_group = Some((label.to_string(), self.state.clone()));
        }
        self.group_depth += 1;
    }

    fn end_undo_group(&mut self) {
        if self.group_depth == 0 {
            log::warn!("end_undo_group without a matching begin");
            return;
        }
        self.group_depth -= 1;
        if self.group_depth == 0 {
            if let Some(group) = self.open_group.take() {
                self.undo_stack.push(group);
            }
        }
    }
}
