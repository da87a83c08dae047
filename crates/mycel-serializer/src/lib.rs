//! mycel-serializer: self-describing value envelope for the mycel fabric.
//!
//! Provides the `AnyValue` wire container (category-tagged header, CBOR
//! payloads, optional outer envelope encryption, lazy decrypt-on-access),
//! the process-wide type registry, and the seal/open traits for field-level
//! encryption companions.

pub mod error;
pub mod registry;
pub mod seal;
pub mod value;
pub mod wire;

// Re-export commonly used items at crate root.
pub use error::{ValueError, ValueResult};
pub use seal::{open_label_group, seal_label_group, OpenFields, SealFields, SerializationContext};
pub use value::{AnyValue, LazyHolder};
pub use wire::ValueCategory;
