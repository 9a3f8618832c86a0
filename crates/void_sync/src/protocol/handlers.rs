//! Capability handlers and the handler chain

use void_scene::{Facet, PropertyMap, Value};

use super::reflect::{apply_properties, extract_properties, ReflectHandler};
use crate::error::PropertyError;

/// Synthesized key carrying a facet's activation state
pub const ENABLED_KEY: &str = "enabled";

/// Outcome of applying a property map to one facet
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyReport {
    /// Keys written
    pub applied: usize,
    /// Keys ignored (deletion markers)
    pub skipped: usize,
    /// Keys that failed, with the reason
    pub failures: Vec<(String, PropertyError)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }
}

/// Extracts and applies the syncable properties of some facet types
pub trait PropertyHandler {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Whether this handler understands facets with the given type tag
    fn can_handle(&self, type_tag: &str) -> bool;

    fn extract(&self, facet: &dyn Facet) -> PropertyMap;

    fn apply(&self, facet: &mut dyn Facet, properties: &PropertyMap) -> ApplyReport;

    /// Invalidate derived state after a successful apply
    fn refresh(&self, _facet: &mut dyn Facet) {}
}

/// How a facet type rebuilds its derived state after property writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Writes take effect on their own
    None,
    /// Set the facet's dirty flag (layout, text, meshes)
    MarkDirty,
    /// Disable then re-enable an enabled facet (lights, renderers)
    Pulse,
}

/// Handler for activation-style facets.
///
/// Extracts like [`ReflectHandler`] plus a synthesized `enabled` boolean,
/// and applies a type-specific refresh afterwards.
#[derive(Debug, Clone)]
pub struct ActivationHandler {
    name: String,
    type_tags: Vec<String>,
    refresh: Refresh,
}

impl ActivationHandler {
    pub fn new(name: impl Into<String>, type_tags: &[&str], refresh: Refresh) -> Self {
        Self {
            name: name.into(),
            type_tags: type_tags.iter().map(|t| t.to_string()).collect(),
            refresh,
        }
    }
}

impl PropertyHandler for ActivationHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, type_tag: &str) -> bool {
        self.type_tags.iter().any(|t| t == type_tag)
    }

    fn extract(&self, facet: &dyn Facet) -> PropertyMap {
        let mut properties = extract_properties(facet);
        if let Some(enabled) = facet.enabled() {
            properties.insert(ENABLED_KEY.to_string(), Value::Bool(enabled));
        }
        properties
    }

    fn apply(&self, facet: &mut dyn Facet, properties: &PropertyMap) -> ApplyReport {
        let mut rest = properties.clone();
        let enabled = rest.remove(ENABLED_KEY);
        let mut report = apply_properties(facet, &rest);

        match enabled {
            Some(Value::Bool(on)) => {
                if facet.set_enabled(on) {
                    report.applied += 1;
                } else {
                    report.failures.push((ENABLED_KEY.to_string(), PropertyError::NoActivation));
                }
            }
            Some(Value::Null) | None => {}
            Some(other) => report.failures.push((
                ENABLED_KEY.to_string(),
                PropertyError::Coercion {
                    name: ENABLED_KEY.to_string(),
                    expected: "bool",
                    found: format!("{:?}", other),
                },
            )),
        }
        report
    }

    fn refresh(&self, facet: &mut dyn Facet) {
        match self.refresh {
            Refresh::None => {}
            Refresh::MarkDirty => facet.mark_dirty(),
            Refresh::Pulse => {
                if facet.enabled() == Some(true) {
                    facet.set_enabled(false);
                    facet.set_enabled(true);
                }
            }
        }
    }
}

/// Ordered handlers, most specific first, ending in the reflect fallback
pub struct HandlerChain {
    handlers: Vec<Box<dyn PropertyHandler + Send + Sync>>,
    fallback: ReflectHandler,
}

impl HandlerChain {
    /// A chain holding only the reflect fallback
    pub fn reflect_only() -> Self {
        Self {
            handlers: Vec::new(),
            fallback: ReflectHandler,
        }
    }

    /// Add a handler after the ones already registered, ahead of the fallback
    pub fn register(&mut self, handler: impl PropertyHandler + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Builder form of [`HandlerChain::register`]
    pub fn with(mut self, handler: impl PropertyHandler + Send + Sync + 'static) -> Self {
        self.register(handler);
        self
    }

    /// The handler responsible for a type tag
    pub fn handler_for(&self, type_tag: &str) -> &dyn PropertyHandler {
        self.handlers
            .iter()
            .find(|h| h.can_handle(type_tag))
            .map(|h| h.as_ref() as &dyn PropertyHandler)
            .unwrap_or(&self.fallback)
    }

    pub fn extract(&self, facet: &dyn Facet) -> PropertyMap {
        self.handler_for(facet.type_tag()).extract(facet)
    }

    /// Apply and, if anything was written, refresh the facet
    pub fn apply(&self, facet: &mut dyn Facet, properties: &PropertyMap) -> ApplyReport {
        let handler = self.handler_for(facet.type_tag());
        let report = handler.apply(facet, properties);
        if report.applied > 0 {
            handler.refresh(facet);
        }
        report
    }

    /// Number of registered handlers, not counting the fallback
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self::reflect_only()
            .with(ActivationHandler::new(
                "layout",
                &["Layout", "Text", "Canvas", "Mesh"],
                Refresh::MarkDirty,
            ))
            .with(ActivationHandler::new(
                "render",
                &["Light", "Renderer", "Camera", "ParticleSystem"],
                Refresh::Pulse,
            ))
            .with(ActivationHandler::new(
                "behaviour",
                &["Behaviour", "Collider", "AudioSource", "Animator", "Rigidbody"],
                Refresh::None,
            ))
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}
