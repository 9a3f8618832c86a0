//! Change operations and their wire form
//!
//! A [`ChangeOp`] is one replicated mutation, addressed by node path (or by
//! resource id for identity ops). On the wire every op is a
//! [`RemoteCall`] whose name is the op's call name and whose arguments are
//! `[session, target, json payload]`. Opaque state blobs travel as base64
//! strings inside the JSON.

use serde::{Deserialize, Serialize};
use void_scene::{FacetSignature, NodeId, PrimitiveShape, PropertyMap, Transform};

use crate::channel::RemoteCall;
use crate::error::{SyncError, SyncResult};
use crate::path;

/// Call name of the registration acknowledgement
pub const ACK_CALL: &str = "IdentityRegisterAck";

/// A replicated mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum ChangeOp {
    #[serde(rename_all = "camelCase")]
    CreateNode {
        path: String,
        name: String,
        parent_path: Option<String>,
        #[serde(flatten)]
        transform: Transform,
        active: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shape_hint: Option<PrimitiveShape>,
        #[serde(default, with = "blob_opt", skip_serializing_if = "Option::is_none")]
        opaque_state: Option<Vec<u8>>,
    },

    DeleteNode { path: String },

    #[serde(rename_all = "camelCase")]
    RenameNode { path: String, new_name: String },

    SetActive { path: String, active: bool },

    #[serde(rename = "Transform")]
    UpdateTransform {
        path: String,
        #[serde(flatten)]
        transform: Transform,
    },

    #[serde(rename = "PropertyPatch")]
    PatchNodeProperties { path: String, properties: PropertyMap },

    #[serde(rename = "ReplaceState")]
    ReplaceNodeState {
        path: String,
        #[serde(with = "blob")]
        state: Vec<u8>,
    },

    #[serde(rename_all = "camelCase")]
    ReparentNode {
        path: String,
        new_parent_path: Option<String>,
    },

    #[serde(rename = "FacetAdd")]
    AddFacet {
        path: String,
        signature: FacetSignature,
        properties: PropertyMap,
    },

    #[serde(rename = "FacetUpdate")]
    UpdateFacetProperties {
        path: String,
        signature: FacetSignature,
        properties: PropertyMap,
    },

    #[serde(rename = "FacetRemove")]
    RemoveFacet {
        path: String,
        signature: FacetSignature,
    },

    #[serde(rename = "IdentityRegister", rename_all = "camelCase")]
    RegisterIdentity {
        resource_id: String,
        owner_anchor: String,
        owner_path: String,
        slot_index: usize,
        type_hint: String,
    },

    #[serde(rename = "IdentityUnregister", rename_all = "camelCase")]
    UnregisterIdentity { resource_id: String },

    #[serde(rename = "IdentityUpdate", rename_all = "camelCase")]
    UpdateIdentityProperties {
        resource_id: String,
        properties: PropertyMap,
    },
}

/// Coalescing category of an op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCategory {
    Create,
    Delete,
    Rename,
    Activation,
    Transform,
    Properties,
    FullState,
    Reparent,
    FacetAdd,
    FacetUpdate,
    FacetRemove,
    IdentityRegister,
    IdentityUnregister,
    IdentityUpdate,
}

impl ChangeOp {
    /// Name of the remote call carrying this op
    pub fn call_name(&self) -> &'static str {
        match self {
            Self::CreateNode { .. } => "CreateNode",
            Self::DeleteNode { .. } => "DeleteNode",
            Self::RenameNode { .. } => "RenameNode",
            Self::SetActive { .. } => "SetActive",
            Self::UpdateTransform { .. } => "Transform",
            Self::PatchNodeProperties { .. } => "PropertyPatch",
            Self::ReplaceNodeState { .. } => "ReplaceState",
            Self::ReparentNode { .. } => "ReparentNode",
            Self::AddFacet { .. } => "FacetAdd",
            Self::UpdateFacetProperties { .. } => "FacetUpdate",
            Self::RemoveFacet { .. } => "FacetRemove",
            Self::RegisterIdentity { .. } => "IdentityRegister",
            Self::UnregisterIdentity { .. } => "IdentityUnregister",
            Self::UpdateIdentityProperties { .. } => "IdentityUpdate",
        }
    }

    pub fn category(&self) -> OpCategory {
        match self {
            Self::CreateNode { .. } => OpCategory::Create,
            Self::DeleteNode { .. } => OpCategory::Delete,
            Self::RenameNode { .. } => OpCategory::Rename,
            Self::SetActive { .. } => OpCategory::Activation,
            Self::UpdateTransform { .. } => OpCategory::Transform,
            Self::PatchNodeProperties { .. } => OpCategory::Properties,
            Self::ReplaceNodeState { .. } => OpCategory::FullState,
            Self::ReparentNode { .. } => OpCategory::Reparent,
            Self::AddFacet { .. } => OpCategory::FacetAdd,
            Self::UpdateFacetProperties { .. } => OpCategory::FacetUpdate,
            Self::RemoveFacet { .. } => OpCategory::FacetRemove,
            Self::RegisterIdentity { .. } => OpCategory::IdentityRegister,
            Self::UnregisterIdentity { .. } => OpCategory::IdentityUnregister,
            Self::UpdateIdentityProperties { .. } => OpCategory::IdentityUpdate,
        }
    }

    /// Node path or resource id the op addresses
    pub fn target(&self) -> &str {
        match self {
            Self::CreateNode { path, .. }
            | Self::DeleteNode { path }
            | Self::RenameNode { path, .. }
            | Self::SetActive { path, .. }
            | Self::UpdateTransform { path, .. }
            | Self::PatchNodeProperties { path, .. }
            | Self::ReplaceNodeState { path, .. }
            | Self::ReparentNode { path, .. }
            | Self::AddFacet { path, .. }
            | Self::UpdateFacetProperties { path, .. }
            | Self::RemoveFacet { path, .. } => path,
            Self::RegisterIdentity { resource_id, .. }
            | Self::UnregisterIdentity { resource_id }
            | Self::UpdateIdentityProperties { resource_id, .. } => resource_id,
        }
    }

    /// Facet signature for facet ops
    pub fn signature(&self) -> Option<&FacetSignature> {
        match self {
            Self::AddFacet { signature, .. }
            | Self::UpdateFacetProperties { signature, .. }
            | Self::RemoveFacet { signature, .. } => Some(signature),
            _ => None,
        }
    }

    /// Registry bookkeeping rather than a scene edit
    pub fn is_identity(&self) -> bool {
        matches!(
            self.category(),
            OpCategory::IdentityRegister | OpCategory::IdentityUnregister | OpCategory::IdentityUpdate
        )
    }

    /// For ops that move a node: its path before and after
    pub fn path_move(&self) -> Option<(String, String)> {
        match self {
            Self::RenameNode { path, new_name } => {
                Some((path.clone(), path::join(path::parent(path), new_name)))
            }
            Self::ReparentNode {
                path,
                new_parent_path,
            } => Some((
                path.clone(),
                path::join(new_parent_path.as_deref(), path::leaf(path)),
            )),
            _ => None,
        }
    }

    /// Rewrite every path this op mentions that lies under `from`
    pub fn rebase_paths(&mut self, from: &str, to: &str) {
        fn rewrite(p: &mut String, from: &str, to: &str) {
            if let Some(rebased) = path::rebase(p, from, to) {
                *p = rebased;
            }
        }

        match self {
            Self::CreateNode {
                path, parent_path, ..
            } => {
                rewrite(path, from, to);
                if let Some(parent) = parent_path {
                    rewrite(parent, from, to);
                }
            }
            Self::ReparentNode {
                path,
                new_parent_path,
            } => {
                rewrite(path, from, to);
                if let Some(parent) = new_parent_path {
                    rewrite(parent, from, to);
                }
            }
            Self::RegisterIdentity { owner_path, .. } => rewrite(owner_path, from, to),
            Self::UnregisterIdentity { .. } | Self::UpdateIdentityProperties { .. } => {}
            Self::DeleteNode { path }
            | Self::RenameNode { path, .. }
            | Self::SetActive { path, .. }
            | Self::UpdateTransform { path, .. }
            | Self::PatchNodeProperties { path, .. }
            | Self::ReplaceNodeState { path, .. }
            | Self::AddFacet { path, .. }
            | Self::UpdateFacetProperties { path, .. }
            | Self::RemoveFacet { path, .. } => rewrite(path, from, to),
        }
    }

    /// Human-readable one-liner for journals and logs
    pub fn describe(&self) -> String {
        match self {
            Self::CreateNode { path, shape_hint, .. } => match shape_hint {
                Some(shape) => format!("Create {} ({})", path, shape.as_str()),
                None => format!("Create {}", path),
            },
            Self::DeleteNode { path } => format!("Delete {}", path),
            Self::RenameNode { path, new_name } => format!("Rename {} to '{}'", path, new_name),
            Self::SetActive { path, active } => {
                format!("{} {}", if *active { "Activate" } else { "Deactivate" }, path)
            }
            Self::UpdateTransform { path, transform } => {
                let [x, y, z] = transform.position;
                format!("Move {} to ({:.3}, {:.3}, {:.3})", path, x, y, z)
            }
            Self::PatchNodeProperties { path, properties } => {
                format!("Set {} on {}", sorted_keys(properties), path)
            }
            Self::ReplaceNodeState { path, state } => {
                format!("Replace state of {} ({} bytes)", path, state.len())
            }
            Self::ReparentNode {
                path,
                new_parent_path,
            } => format!(
                "Move {} under {}",
                path,
                new_parent_path.as_deref().unwrap_or("top level")
            ),
            Self::AddFacet { path, signature, .. } => format!("Add {} to {}", signature, path),
            Self::UpdateFacetProperties {
                path,
                signature,
                properties,
            } => format!("Set {} on {} {}", sorted_keys(properties), path, signature),
            Self::RemoveFacet { path, signature } => format!("Remove {} from {}", signature, path),
            Self::RegisterIdentity {
                resource_id,
                owner_path,
                slot_index,
                ..
            } => format!("Register {} ({} slot {})", resource_id, owner_path, slot_index),
            Self::UnregisterIdentity { resource_id } => format!("Unregister {}", resource_id),
            Self::UpdateIdentityProperties {
                resource_id,
                properties,
            } => format!("Set {} on resource {}", sorted_keys(properties), resource_id),
        }
    }
}

fn sorted_keys(properties: &PropertyMap) -> String {
    let mut keys: Vec<&str> = properties.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys.join(", ")
}

/// Reply to an identity registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityAck {
    pub resource_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Anything that can arrive over the channel
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Op(ChangeOp),
    Ack(IdentityAck),
}

/// A decoded call
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub session: String,
    pub message: WireMessage,
}

/// What a flushed op is about, for journal coalescing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    Node(NodeId),
    Resource(String),
}

/// An op leaving the buffer or registry, with its subject
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingOp {
    pub subject: Subject,
    pub op: ChangeOp,
}

impl OutgoingOp {
    pub fn node(node: NodeId, op: ChangeOp) -> Self {
        Self {
            subject: Subject::Node(node),
            op,
        }
    }

    pub fn resource(op: ChangeOp) -> Self {
        Self {
            subject: Subject::Resource(op.target().to_string()),
            op,
        }
    }
}

/// Package an op as a remote call
pub fn encode(op: &ChangeOp, session: &str) -> SyncResult<RemoteCall> {
    let mut tagged = match serde_json::to_value(op)? {
        serde_json::Value::Object(map) => map,
        _ => {
            return Err(SyncError::Codec {
                name: op.call_name().to_string(),
                reason: "op did not serialize to an object".to_string(),
            })
        }
    };
    let payload = tagged.remove("payload").unwrap_or(serde_json::Value::Null);
    Ok(RemoteCall::new(
        op.call_name(),
        vec![session.to_string(), op.target().to_string(), payload.to_string()],
    ))
}

/// Package an acknowledgement as a remote call
pub fn encode_ack(ack: &IdentityAck, session: &str) -> SyncResult<RemoteCall> {
    Ok(RemoteCall::new(
        ACK_CALL,
        vec![
            session.to_string(),
            ack.resource_id.clone(),
            serde_json::to_string(ack)?,
        ],
    ))
}

/// Unpack a remote call
pub fn decode(call: &RemoteCall) -> SyncResult<Decoded> {
    let malformed = |reason: String| SyncError::Codec {
        name: call.name.clone(),
        reason,
    };

    let [session, _target, payload] = call.args.as_slice() else {
        return Err(malformed(format!("expected 3 arguments, got {}", call.args.len())));
    };

    let message = if call.name == ACK_CALL {
        WireMessage::Ack(serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?)
    } else {
        let payload: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
        let tagged = serde_json::json!({ "name": call.name, "payload": payload });
        WireMessage::Op(serde_json::from_value(tagged).map_err(|e| malformed(e.to_string()))?)
    };

    Ok(Decoded {
        session: session.clone(),
        message,
    })
}

mod blob {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod blob_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
