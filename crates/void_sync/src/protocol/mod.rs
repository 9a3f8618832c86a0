//! Property sync protocol
//!
//! Facets are read and written through an ordered chain of capability
//! handlers. Specialized handlers come first; the introspection-based
//! [`ReflectHandler`] catches every other type.

pub mod coerce;
pub mod handlers;
pub mod reflect;

pub use coerce::coerce;
pub use handlers::{ActivationHandler, ApplyReport, HandlerChain, PropertyHandler, Refresh, ENABLED_KEY};
pub use reflect::{is_denied, ReflectHandler, DENIED_PROPERTIES};
