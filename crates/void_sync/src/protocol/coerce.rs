//! Value coercion toward a declared property kind
//!
//! Incoming values were extracted on another peer, possibly from a
//! slightly different facet type. Coercion tries, in order: pass-through,
//! nullable wrapping, enum parsing, numeric conversion, and array-shaped
//! reconstruction between vector/color/quaternion/rect forms.

use void_scene::{Value, ValueKind};

use crate::error::PropertyError;

/// Convert `value` so it is a valid instance of `kind`
pub fn coerce(name: &str, value: Value, kind: &ValueKind) -> Result<Value, PropertyError> {
    if value.matches_kind(kind) {
        return Ok(value);
    }

    let fail = |found: &Value| PropertyError::Coercion {
        name: name.to_string(),
        expected: kind.name(),
        found: describe(found),
    };

    match kind {
        ValueKind::Nullable(inner) => match value {
            Value::Null | Value::Optional(None) => Ok(Value::Optional(None)),
            Value::Optional(Some(boxed)) => {
                coerce(name, *boxed, inner).map(|v| Value::Optional(Some(Box::new(v))))
            }
            other => coerce(name, other, inner).map(|v| Value::Optional(Some(Box::new(v)))),
        },
        ValueKind::Enum(variants) => {
            let parsed = match &value {
                Value::String(s) | Value::Enum(s) => variants
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(s))
                    .cloned(),
                Value::Int(i) => usize::try_from(*i).ok().and_then(|i| variants.get(i).cloned()),
                _ => None,
            };
            parsed.map(Value::Enum).ok_or_else(|| fail(&value))
        }
        ValueKind::Float => match &value {
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => s.trim().parse().map(Value::Float).map_err(|_| fail(&value)),
            Value::Optional(Some(inner)) => coerce(name, (**inner).clone(), kind),
            _ => Err(fail(&value)),
        },
        ValueKind::Int => match &value {
            Value::Float(f) if f.is_finite() => Ok(Value::Int(f.round() as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::String(s) => s.trim().parse().map(Value::Int).map_err(|_| fail(&value)),
            Value::Optional(Some(inner)) => coerce(name, (**inner).clone(), kind),
            _ => Err(fail(&value)),
        },
        ValueKind::Bool => match &value {
            Value::Int(i) => Ok(Value::Bool(*i != 0)),
            Value::Float(f) => Ok(Value::Bool(*f != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(fail(&value)),
            },
            _ => Err(fail(&value)),
        },
        ValueKind::String => match &value {
            Value::Enum(s) => Ok(Value::String(s.clone())),
            Value::Int(i) => Ok(Value::String(i.to_string())),
            Value::Float(f) => Ok(Value::String(f.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(fail(&value)),
        },
        ValueKind::Vec2 | ValueKind::Vec3 | ValueKind::Vec4 | ValueKind::Quat | ValueKind::Color | ValueKind::Rect => {
            let components = components(&value).ok_or_else(|| fail(&value))?;
            rebuild(kind, &components).ok_or_else(|| fail(&value))
        }
        _ => Err(fail(&value)),
    }
}

/// Flatten array-shaped values into their components
fn components(value: &Value) -> Option<Vec<f32>> {
    match value {
        Value::Vec2(v) => Some(v.to_vec()),
        Value::Vec3(v) => Some(v.to_vec()),
        Value::Vec4(v) | Value::Quat(v) | Value::Color(v) | Value::Rect(v) => Some(v.to_vec()),
        Value::Float(f) => Some(vec![*f as f32]),
        _ => None,
    }
}

/// Reconstruct a value of `kind` from components, padding or truncating.
///
/// Missing color alpha and quaternion w default to 1; other missing
/// components default to 0. A single scalar never widens to a vector.
fn rebuild(kind: &ValueKind, c: &[f32]) -> Option<Value> {
    if c.len() < 2 {
        return None;
    }
    let at = |i: usize, fallback: f32| c.get(i).copied().unwrap_or(fallback);
    Some(match kind {
        ValueKind::Vec2 => Value::Vec2([c[0], c[1]]),
        ValueKind::Vec3 => Value::Vec3([c[0], c[1], at(2, 0.0)]),
        ValueKind::Vec4 => Value::Vec4([c[0], c[1], at(2, 0.0), at(3, 0.0)]),
        ValueKind::Rect => Value::Rect([c[0], c[1], at(2, 0.0), at(3, 0.0)]),
        ValueKind::Color => Value::Color([c[0], c[1], at(2, 0.0), at(3, 1.0)]),
        ValueKind::Quat if c.len() == 4 => Value::Quat([c[0], c[1], c[2], c[3]]),
        _ => return None,
    })
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Int(_) => "int".to_string(),
        Value::Float(_) => "float".to_string(),
        Value::String(s) => format!("string '{}'", s),
        Value::Enum(s) => format!("enum '{}'", s),
        Value::Vec2(_) => "vec2".to_string(),
        Value::Vec3(_) => "vec3".to_string(),
        Value::Vec4(_) => "vec4".to_string(),
        Value::Quat(_) => "quat".to_string(),
        Value::Color(_) => "color".to_string(),
        Value::Rect(_) => "rect".to_string(),
        Value::Bounds { .. } => "bounds".to_string(),
        Value::Matrix(_) => "matrix".to_string(),
        Value::Optional(_) => "nullable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through() {
        let v = Value::Vec3([1.0, 2.0, 3.0]);
        assert_eq!(coerce("p", v.clone(), &ValueKind::Vec3).unwrap(), v);
    }

    #[test]
    fn test_numeric_conversion() {
        assert_eq!(coerce("n", Value::Int(3), &ValueKind::Float).unwrap(), Value::Float(3.0));
        assert_eq!(coerce("n", Value::Float(2.6), &ValueKind::Int).unwrap(), Value::Int(3));
        assert_eq!(coerce("n", Value::from(" 1.5 "), &ValueKind::Float).unwrap(), Value::Float(1.5));
        assert!(coerce("n", Value::from("fast"), &ValueKind::Float).is_err());
    }

    #[test]
    fn test_enum_parse() {
        let kind = ValueKind::Enum(vec!["Soft".into(), "Hard".into()]);
        assert_eq!(coerce("s", Value::from("hard"), &kind).unwrap(), Value::Enum("Hard".into()));
        assert_eq!(coerce("s", Value::Int(0), &kind).unwrap(), Value::Enum("Soft".into()));
        assert!(matches!(
            coerce("s", Value::from("none"), &kind),
            Err(PropertyError::Coercion { .. })
        ));
    }

    #[test]
    fn test_array_reconstruction() {
        assert_eq!(
            coerce("c", Value::Vec3([1.0, 0.5, 0.0]), &ValueKind::Color).unwrap(),
            Value::Color([1.0, 0.5, 0.0, 1.0])
        );
        assert_eq!(
            coerce("v", Value::Vec4([1.0, 2.0, 3.0, 4.0]), &ValueKind::Vec2).unwrap(),
            Value::Vec2([1.0, 2.0])
        );
        assert!(coerce("q", Value::Vec3([0.0, 0.0, 0.0]), &ValueKind::Quat).is_err());
        assert!(coerce("v", Value::Float(1.0), &ValueKind::Vec3).is_err());
    }

    #[test]
    fn test_nullable_wrapping() {
        let kind = ValueKind::Nullable(Box::new(ValueKind::Float));
        assert_eq!(coerce("o", Value::Null, &kind).unwrap(), Value::Optional(None));
        assert_eq!(
            coerce("o", Value::Int(2), &kind).unwrap(),
            Value::Optional(Some(Box::new(Value::Float(2.0))))
        );
    }
}
