//! Dynamic property values
//!
//! Values are the closed set of property representations that can cross
//! the sync channel without requiring concrete facet types. `Null` is the
//! deletion sentinel: a key mapped to `Null` in a delta means "this key no
//! longer exists". Nullable properties carry their payload in `Optional`.

use glam::{Quat, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A map of property name to value, as extracted from a facet
pub type PropertyMap = HashMap<String, Value>;

/// A dynamic value that can represent any supported property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Deleted key sentinel
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (i64 for wide compatibility)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Enum variant, by name
    Enum(String),
    /// 2D vector
    Vec2([f32; 2]),
    /// 3D vector / point
    Vec3([f32; 3]),
    /// 4D vector
    Vec4([f32; 4]),
    /// Rotation quaternion [x, y, z, w]
    Quat([f32; 4]),
    /// Linear RGBA color
    Color([f32; 4]),
    /// Rectangle [x, y, width, height]
    Rect([f32; 4]),
    /// Axis-aligned bounds
    Bounds {
        /// Center point
        center: [f32; 3],
        /// Half extents
        extents: [f32; 3],
    },
    /// 4x4 matrix (column-major)
    Matrix([f32; 16]),
    /// Nullable wrapper
    Optional(Option<Box<Value>>),
}

/// Tolerances used when comparing values for change detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Maximum distance between two points/vectors considered equal
    pub position: f32,
    /// Maximum angle (degrees) between two rotations considered equal
    pub rotation_deg: f32,
}

impl Tolerance {
    /// Exact comparison
    pub const EXACT: Self = Self {
        position: 0.0,
        rotation_deg: 0.0,
    };

    /// Create a tolerance pair
    pub fn new(position: f32, rotation_deg: f32) -> Self {
        Self {
            position,
            rotation_deg,
        }
    }

    /// Whether two points are within positional tolerance
    pub fn points_equal(&self, a: [f32; 3], b: [f32; 3]) -> bool {
        let d = Vec3::from_array(a).distance(Vec3::from_array(b));
        d <= self.position
    }

    /// Whether two rotations are within angular tolerance
    pub fn rotations_equal(&self, a: [f32; 4], b: [f32; 4]) -> bool {
        angle_between_deg(a, b) <= self.rotation_deg
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::new(1e-4, 0.01)
    }
}

/// Angular distance in degrees between two quaternions, ignoring sign
pub fn angle_between_deg(a: [f32; 4], b: [f32; 4]) -> f32 {
    let qa = Quat::from_array(a).normalize();
    let qb = Quat::from_array(b).normalize();
    let dot = qa.dot(qb).abs().min(1.0);
    (2.0 * dot.acos()).to_degrees()
}

/// The declared type of a facet property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    String,
    /// Enum with its allowed variant names
    Enum(Vec<String>),
    Vec2,
    Vec3,
    Vec4,
    Quat,
    Color,
    Rect,
    Bounds,
    Matrix,
    /// Nullable wrapper around an inner kind
    Nullable(Box<ValueKind>),
    /// A property whose type is outside the syncable domain (object
    /// references, delegates, native handles)
    Unsupported,
}

impl ValueKind {
    /// Whether values of this kind can be synced
    pub fn is_supported(&self) -> bool {
        match self {
            Self::Unsupported => false,
            Self::Nullable(inner) => inner.is_supported(),
            _ => true,
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Enum(_) => "enum",
            Self::Vec2 => "vec2",
            Self::Vec3 => "vec3",
            Self::Vec4 => "vec4",
            Self::Quat => "quat",
            Self::Color => "color",
            Self::Rect => "rect",
            Self::Bounds => "bounds",
            Self::Matrix => "matrix",
            Self::Nullable(_) => "nullable",
            Self::Unsupported => "unsupported",
        }
    }
}

impl Value {
    /// Check if value is the deletion sentinel
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this value is a valid instance of `kind`
    pub fn matches_kind(&self, kind: &ValueKind) -> bool {
        match (self, kind) {
            (Self::Bool(_), ValueKind::Bool)
            | (Self::Int(_), ValueKind::Int)
            | (Self::Float(_), ValueKind::Float)
            | (Self::String(_), ValueKind::String)
            | (Self::Vec2(_), ValueKind::Vec2)
            | (Self::Vec3(_), ValueKind::Vec3)
            | (Self::Vec4(_), ValueKind::Vec4)
            | (Self::Quat(_), ValueKind::Quat)
            | (Self::Color(_), ValueKind::Color)
            | (Self::Rect(_), ValueKind::Rect)
            | (Self::Bounds { .. }, ValueKind::Bounds)
            | (Self::Matrix(_), ValueKind::Matrix) => true,
            (Self::Enum(name), ValueKind::Enum(variants)) => variants.iter().any(|v| v == name),
            (Self::Optional(None), ValueKind::Nullable(_)) => true,
            (Self::Optional(Some(inner)), ValueKind::Nullable(k)) => inner.matches_kind(k),
            _ => false,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as vec3
    pub fn as_vec3(&self) -> Option<[f32; 3]> {
        match self {
            Self::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two values using category tolerances.
    ///
    /// Vectors and points compare by distance, quaternions by angle.
    /// Everything else compares exactly.
    pub fn approx_eq(&self, other: &Value, tol: Tolerance) -> bool {
        match (self, other) {
            (Self::Vec2(a), Self::Vec2(b)) => {
                Vec2::from_array(*a).distance(Vec2::from_array(*b)) <= tol.position
            }
            (Self::Vec3(a), Self::Vec3(b)) => tol.points_equal(*a, *b),
            (Self::Vec4(a), Self::Vec4(b)) => {
                Vec4::from_array(*a).distance(Vec4::from_array(*b)) <= tol.position
            }
            (Self::Quat(a), Self::Quat(b)) => tol.rotations_equal(*a, *b),
            (
                Self::Bounds { center: c1, extents: e1 },
                Self::Bounds { center: c2, extents: e2 },
            ) => tol.points_equal(*c1, *c2) && tol.points_equal(*e1, *e2),
            (Self::Optional(Some(a)), Self::Optional(Some(b))) => a.approx_eq(b, tol),
            _ => self == other,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<[f32; 2]> for Value {
    fn from(v: [f32; 2]) -> Self {
        Self::Vec2(v)
    }
}

impl From<[f32; 3]> for Value {
    fn from(v: [f32; 3]) -> Self {
        Self::Vec3(v)
    }
}

impl From<[f32; 4]> for Value {
    fn from(v: [f32; 4]) -> Self {
        Self::Vec4(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        Self::Optional(v.map(|inner| Box::new(inner.into())))
    }
}
