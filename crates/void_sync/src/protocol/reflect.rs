//! Introspection-based property access
//!
//! Works on any facet through its runtime property metadata. This is the
//! last handler in every chain, and the building block the specialized
//! handlers delegate to.

use void_scene::{Facet, PropertyMap, Value};

use super::coerce::coerce;
use super::handlers::{ApplyReport, PropertyHandler};
use crate::error::PropertyError;

/// Names never synced: identity fields and back-references that would
/// make the extracted graph cyclic.
pub const DENIED_PROPERTIES: &[&str] = &[
    "name",
    "tag",
    "node",
    "owner",
    "parent",
    "root",
    "transform",
    "hideFlags",
    "id",
    "instance_id",
];

/// Whether a property name is excluded from sync
pub fn is_denied(name: &str) -> bool {
    DENIED_PROPERTIES.contains(&name)
}

/// Read every readable, supported, non-denied property
pub fn extract_properties(facet: &dyn Facet) -> PropertyMap {
    facet
        .properties()
        .into_iter()
        .filter(|p| p.readable && p.kind.is_supported() && !is_denied(&p.name))
        .filter_map(|p| facet.get(&p.name).map(|v| (p.name, v)))
        .collect()
}

/// Write one property, coercing toward its declared kind
pub fn apply_property(facet: &mut dyn Facet, name: &str, value: Value) -> Result<(), PropertyError> {
    if is_denied(name) {
        return Err(PropertyError::Denied(name.to_string()));
    }
    let info = facet
        .properties()
        .into_iter()
        .find(|p| p.name == name && p.writable && p.kind.is_supported())
        .ok_or_else(|| PropertyError::NotWritable(name.to_string()))?;
    let value = coerce(name, value, &info.kind)?;
    facet.set(name, value)?;
    Ok(())
}

/// Apply a map key by key; one failing key never stops the others.
///
/// Null values mark keys removed on the sending side. A typed facet cannot
/// drop a declared property, so they are skipped.
pub fn apply_properties(facet: &mut dyn Facet, properties: &PropertyMap) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut keys: Vec<&String> = properties.keys().collect();
    keys.sort();
    for key in keys {
        let value = &properties[key];
        if value.is_null() {
            report.skipped += 1;
            continue;
        }
        match apply_property(facet, key, value.clone()) {
            Ok(()) => report.applied += 1,
            Err(e) => {
                log::warn!("{}.{}: {}", facet.type_tag(), key, e);
                report.failures.push((key.clone(), e));
            }
        }
    }
    report
}

/// Fallback handler for any facet type
#[derive(Debug, Default, Clone, Copy)]
pub struct ReflectHandler;

impl PropertyHandler for ReflectHandler {
    fn name(&self) -> &str {
        "reflect"
    }

    fn can_handle(&self, _type_tag: &str) -> bool {
        true
    }

    fn extract(&self, facet: &dyn Facet) -> PropertyMap {
        extract_properties(facet)
    }

    fn apply(&self, facet: &mut dyn Facet, properties: &PropertyMap) -> ApplyReport {
        apply_properties(facet, properties)
    }
}
