//! Error types for the sync engine

use thiserror::Error;
use void_scene::SceneError;

use crate::channel::ChannelError;
use crate::config::ConfigError;

/// Engine-level errors.
///
/// Most per-item failures never reach this type: they are caught at the
/// smallest granularity, logged, and reported in the returned report
/// structs. What propagates is construction and replay preconditions.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("replay precondition failed: {0}")]
    ReplayPrecondition(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("malformed call '{name}': {reason}")]
    Codec { name: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a single property could not be applied
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PropertyError {
    #[error("no writable property '{0}'")]
    NotWritable(String),

    #[error("property '{0}' is excluded from sync")]
    Denied(String),

    #[error("cannot convert {found} to {expected} for '{name}'")]
    Coercion {
        name: String,
        expected: &'static str,
        found: String,
    },

    #[error("facet has no activation state")]
    NoActivation,

    #[error(transparent)]
    Scene(#[from] SceneError),
}
