//! Abstract keystore capability consumed by the value serializer.
//!
//! The serializer only ever calls the four [`EnvelopeCrypto`] methods; the
//! administrative surface is part of the keystore contract but is driven by
//! the embedding node, never by serialization itself.

use crate::error::KeyResult;
use std::path::PathBuf;

/// Capability snapshot reported by a keystore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeystoreCaps {
    pub can_encrypt: bool,
    pub can_decrypt: bool,
    pub has_network_keys: bool,
    pub has_profile_keys: bool,
}

/// Envelope encryption capability.
///
/// `encrypt_with_envelope` seals a payload for an optional network key plus
/// any number of profile keys and returns an opaque CBOR envelope blob;
/// `decrypt_envelope` reverses it. These are the only operations that may
/// block; everything else in serialization is pure in-memory work.
pub trait EnvelopeCrypto: Send + Sync {
    fn encrypt_with_envelope(
        &self,
        data: &[u8],
        network_public_key: Option<&[u8]>,
        profile_public_keys: &[Vec<u8>],
    ) -> KeyResult<Vec<u8>>;

    fn decrypt_envelope(&self, envelope: &[u8]) -> KeyResult<Vec<u8>>;

    /// Opaque lifecycle state, for diagnostics.
    fn keystore_state(&self) -> i32;

    fn keystore_caps(&self) -> KeystoreCaps;
}

/// Administrative keystore surface. Not invoked by the serializer core.
pub trait KeystoreAdmin {
    /// Create the named symmetric key if absent; returns the key material.
    fn ensure_symmetric_key(&self, key_name: &str) -> KeyResult<Vec<u8>>;

    fn set_local_node_info(&self, node_public_key: Vec<u8>);

    fn set_persistence_dir(&self, dir: PathBuf);

    fn enable_auto_persist(&self, enabled: bool);

    fn wipe_persistence(&self) -> KeyResult<()>;

    fn flush_state(&self) -> KeyResult<()>;

    /// Associate an encryption label with a named key.
    fn set_label_mapping(&self, label: String, key_name: String);
}
