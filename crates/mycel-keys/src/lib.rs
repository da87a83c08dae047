//! mycel-keys: keystore capability surface and label resolution.
//!
//! The serializer consumes envelope encryption through the abstract
//! [`EnvelopeCrypto`] trait and resolves field-encryption labels to key
//! material through [`LabelResolver`]. A real keystore lives elsewhere;
//! [`MemoryKeystore`] is a self-contained implementation for tests and
//! development.

pub mod error;
pub mod keystore;
pub mod label;
pub mod memory;

// Re-export commonly used items at crate root.
pub use error::{KeyError, KeyResult};
pub use keystore::{EnvelopeCrypto, KeystoreAdmin, KeystoreCaps};
pub use label::{
    validate_label_config, LabelKeyInfo, LabelKeyword, LabelResolver, LabelResolverConfig,
    LabelValue,
};
pub use memory::MemoryKeystore;
