//! # Void Scene - Scene Graph Boundary
//!
//! The live sync engine reads and mutates the host's object graph only
//! through the types in this crate.
//!
//! ## Key Concepts
//!
//! - **Value**: closed sum type of syncable property values, with a null
//!   sentinel for deleted keys
//! - **Handle**: generational, liveness-checked reference to a node or
//!   resource the scene owns
//! - **SceneGraph**: host operations (enumerate, mutate, serialize state)
//! - **Facet**: typed property bag with runtime property metadata
//! - **MemoryScene**: in-process graph for hosts without their own

pub mod value;
pub mod handle;
pub mod graph;
pub mod memory;

pub use value::{angle_between_deg, PropertyMap, Tolerance, Value, ValueKind};
pub use handle::{Arena, Handle};
pub use graph::{
    read_all, Facet, FacetSignature, NodeId, NodeInfo, PrimitiveShape, PropertyInfo,
    ResourceHandle, SceneError, SceneGraph, SceneResult, Transform,
};
pub use memory::{MemoryFacet, MemoryResource, MemoryScene};
