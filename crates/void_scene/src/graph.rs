//! The scene graph boundary
//!
//! The sync engine never owns nodes, facets or resources. It reads and
//! mutates them through [`SceneGraph`], which the host implements over its
//! native graph. [`crate::memory::MemoryScene`] is the in-process
//! implementation.

use crate::handle::Handle;
use crate::value::{PropertyMap, Tolerance, Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Marker for node handles
#[derive(Debug)]
pub enum Node {}

/// Marker for resource handles
#[derive(Debug)]
pub enum Resource {}

/// Handle to a node owned by the scene
pub type NodeId = Handle<Node>;

/// Handle to a shared resource owned by the scene
pub type ResourceHandle = Handle<Resource>;

/// Errors reported by a scene graph implementation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SceneError {
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),

    #[error("resource not found: {0:?}")]
    ResourceNotFound(ResourceHandle),

    #[error("facet index {index} out of range on {node:?}")]
    FacetNotFound { node: NodeId, index: usize },

    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    #[error("property '{0}' is read-only")]
    ReadOnly(String),

    #[error("property '{name}' expects {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("reparenting {child:?} under {parent:?} would create a cycle")]
    Cycle { child: NodeId, parent: NodeId },

    #[error("state serialization failed: {0}")]
    Serialization(String),
}

/// Result type for scene operations
pub type SceneResult<T> = Result<T, SceneError>;

/// Local transform of a node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Translation [x, y, z]
    pub position: [f32; 3],
    /// Rotation quaternion [x, y, z, w]
    pub rotation: [f32; 4],
    /// Scale [x, y, z]
    pub scale: [f32; 3],
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: [0.0, 0.0, 0.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale: [1.0, 1.0, 1.0],
    };

    /// Identity rotation and scale at a position
    pub fn from_position(position: [f32; 3]) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Compare position/scale by distance and rotation by angle
    pub fn approx_eq(&self, other: &Transform, tol: Tolerance) -> bool {
        tol.points_equal(self.position, other.position)
            && tol.points_equal(self.scale, other.scale)
            && tol.rotations_equal(self.rotation, other.rotation)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Shapes a receiver can instantiate for a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveShape {
    Cube,
    Sphere,
    Capsule,
    Cylinder,
    Plane,
    Quad,
}

impl PrimitiveShape {
    /// Recognize a shape hint, case-insensitively
    pub fn parse(hint: &str) -> Option<Self> {
        match hint.to_ascii_lowercase().as_str() {
            "cube" => Some(Self::Cube),
            "sphere" => Some(Self::Sphere),
            "capsule" => Some(Self::Capsule),
            "cylinder" => Some(Self::Cylinder),
            "plane" => Some(Self::Plane),
            "quad" => Some(Self::Quad),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cube => "Cube",
            Self::Sphere => "Sphere",
            Self::Capsule => "Capsule",
            Self::Cylinder => "Cylinder",
            Self::Plane => "Plane",
            Self::Quad => "Quad",
        }
    }
}

/// Identity of a facet on its node: type tag plus ordinal among siblings of
/// the same type. Stable only while same-type sibling order is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FacetSignature {
    #[serde(rename = "typeTag")]
    pub type_tag: String,
    pub index: usize,
}

impl FacetSignature {
    pub fn new(type_tag: impl Into<String>, index: usize) -> Self {
        Self {
            type_tag: type_tag.into(),
            index,
        }
    }
}

impl fmt::Display for FacetSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_tag, self.index)
    }
}

/// Runtime metadata for one facet property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyInfo {
    pub name: String,
    pub kind: ValueKind,
    pub readable: bool,
    pub writable: bool,
}

impl PropertyInfo {
    /// A readable and writable property
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            readable: true,
            writable: true,
        }
    }

    /// A readable, non-writable property
    pub fn read_only(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            writable: false,
            ..Self::new(name, kind)
        }
    }
}

/// A typed property bag attached to a node, or a shared resource.
///
/// Implementations expose runtime type metadata through
/// [`Facet::properties`]; the generic sync handler relies on it.
pub trait Facet {
    /// Type tag (e.g. "Light", "Collider")
    fn type_tag(&self) -> &str;

    /// Property metadata, in declaration order
    fn properties(&self) -> Vec<PropertyInfo>;

    /// Read a property
    fn get(&self, name: &str) -> Option<Value>;

    /// Write a property. The value must already match the declared kind.
    fn set(&mut self, name: &str, value: Value) -> SceneResult<()>;

    /// Activation state for facets that can be switched off
    fn enabled(&self) -> Option<bool> {
        None
    }

    /// Returns false when the facet has no activation state
    fn set_enabled(&mut self, _enabled: bool) -> bool {
        false
    }

    /// Invalidate any cached derived state (layout, mesh, text)
    fn mark_dirty(&mut self) {}
}

/// Identity and flag fields of a node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub active: bool,
    pub tag: String,
    pub layer: u32,
    pub is_static: bool,
    pub parent: Option<NodeId>,
}

/// Host scene graph operations
pub trait SceneGraph {
    /// Name of the container (scene) this graph represents
    fn container(&self) -> &str;

    /// Whether the container is loaded and can be mutated
    fn is_loaded(&self) -> bool {
        true
    }

    /// Top-level nodes, in order
    fn roots(&self) -> Vec<NodeId>;

    /// Children of a node, in order
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    fn is_alive(&self, node: NodeId) -> bool;

    fn info(&self, node: NodeId) -> Option<NodeInfo>;

    fn transform(&self, node: NodeId) -> Option<Transform>;

    /// Primitive the node was created from, when the host knows it
    fn shape_hint(&self, _node: NodeId) -> Option<PrimitiveShape> {
        None
    }

    fn create_node(
        &mut self,
        name: &str,
        parent: Option<NodeId>,
        shape: Option<PrimitiveShape>,
    ) -> SceneResult<NodeId>;

    /// Destroy a node and its descendants
    fn destroy_node(&mut self, node: NodeId) -> SceneResult<()>;

    fn set_name(&mut self, node: NodeId, name: &str) -> SceneResult<()>;

    fn set_active(&mut self, node: NodeId, active: bool) -> SceneResult<()>;

    /// Move a node; `None` makes it top-level
    fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>) -> SceneResult<()>;

    fn set_transform(&mut self, node: NodeId, transform: Transform) -> SceneResult<()>;

    fn set_tag(&mut self, node: NodeId, tag: &str) -> SceneResult<()>;

    fn set_layer(&mut self, node: NodeId, layer: u32) -> SceneResult<()>;

    fn set_static(&mut self, node: NodeId, is_static: bool) -> SceneResult<()>;

    fn facet_count(&self, node: NodeId) -> usize;

    fn facet(&self, node: NodeId, index: usize) -> Option<&dyn Facet>;

    fn facet_mut(&mut self, node: NodeId, index: usize) -> Option<&mut dyn Facet>;

    /// Attach a new facet of the given type; returns its index on the node
    fn add_facet(&mut self, node: NodeId, type_tag: &str) -> SceneResult<usize>;

    fn remove_facet(&mut self, node: NodeId, index: usize) -> SceneResult<()>;

    /// Opaque full-state blob for a node. Encoding is owned by the host.
    fn serialize_state(&self, node: NodeId) -> SceneResult<Vec<u8>>;

    fn restore_state(&mut self, node: NodeId, state: &[u8]) -> SceneResult<()>;

    /// Durable 128-bit anchor attached to the node, if any
    fn anchor(&self, node: NodeId) -> Option<u128>;

    fn set_anchor(&mut self, node: NodeId, anchor: Option<u128>) -> SceneResult<()>;

    /// Resource slots owned by the node, in order
    fn resource_slots(&self, node: NodeId) -> Vec<Option<ResourceHandle>>;

    fn resource(&self, handle: ResourceHandle) -> Option<&dyn Facet>;

    fn resource_mut(&mut self, handle: ResourceHandle) -> Option<&mut dyn Facet>;

    fn resource_alive(&self, handle: ResourceHandle) -> bool;

    /// Persisted asset id (GUID/content hash) for resources loaded from storage
    fn resource_asset_id(&self, handle: ResourceHandle) -> Option<String>;

    /// Open a group of mutations undone together
    fn begin_undo_group(&mut self, _label: &str) {}

    fn end_undo_group(&mut self) {}

    // ------------------------------------------------------------------
    // Provided helpers
    // ------------------------------------------------------------------

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.info(node).and_then(|info| info.parent)
    }

    /// Slash-separated path of names from the top level ("Root/Cube")
    fn path_of(&self, node: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let info = self.info(id)?;
            names.push(info.name);
            current = info.parent;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Resolve a path by walking names from the top level. With duplicate
    /// sibling names the first match wins.
    fn find_by_path(&self, path: &str) -> Option<NodeId> {
        let mut candidates = self.roots();
        let mut found = None;
        for segment in path.split('/') {
            let next = candidates
                .iter()
                .copied()
                .find(|id| self.info(*id).map_or(false, |info| info.name == segment))?;
            found = Some(next);
            candidates = self.children(next);
        }
        found
    }

    /// All live nodes, depth-first preorder
    fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.roots().into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).into_iter().rev());
        }
        out
    }

    /// Signatures of every facet on the node, with their indices
    fn facet_signatures(&self, node: NodeId) -> Vec<(FacetSignature, usize)> {
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut out = Vec::new();
        for index in 0..self.facet_count(node) {
            if let Some(facet) = self.facet(node, index) {
                let tag = facet.type_tag().to_string();
                let ordinal = seen.entry(tag.clone()).or_insert(0);
                out.push((FacetSignature::new(tag, *ordinal), index));
                *ordinal += 1;
            }
        }
        out
    }

    /// Index of the facet with the given signature
    fn find_facet(&self, node: NodeId, signature: &FacetSignature) -> Option<usize> {
        self.facet_signatures(node)
            .into_iter()
            .find(|(sig, _)| sig == signature)
            .map(|(_, index)| index)
    }
}

/// Read every readable, supported property of a facet
pub fn read_all(facet: &dyn Facet) -> PropertyMap {
    facet
        .properties()
        .into_iter()
        .filter(|p| p.readable && p.kind.is_supported())
        .filter_map(|p| facet.get(&p.name).map(|v| (p.name, v)))
        .collect()
}
