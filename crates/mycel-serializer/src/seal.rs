//! Field-level encryption companions.
//!
//! A labelled struct seals into a parallel companion record whose protected
//! fields are replaced by per-label envelopes (conventionally named with an
//! `_encrypted` suffix). The companion opens back into the plain struct with
//! a keystore. [`seal_label_group`] / [`open_label_group`] do the per-label
//! envelope work so companion impls stay small.

use crate::error::{ValueError, ValueResult};
use mycel_keys::{EnvelopeCrypto, LabelResolver};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Everything serialization needs to encrypt: the keystore, the label
/// resolver for field groups, and the recipient keys of the outer envelope.
#[derive(Clone)]
pub struct SerializationContext {
    pub keystore: Arc<dyn EnvelopeCrypto>,
    pub resolver: Arc<LabelResolver>,
    pub network_public_key: Option<Vec<u8>>,
    pub profile_public_keys: Vec<Vec<u8>>,
}

/// A labelled struct that can produce its encrypted companion.
pub trait SealFields: Sized {
    type Sealed;

    fn seal(
        &self,
        keystore: &dyn EnvelopeCrypto,
        resolver: &LabelResolver,
    ) -> ValueResult<Self::Sealed>;
}

/// A companion record that can recover the plain struct.
///
/// Implementations should degrade per field: a label the keystore cannot
/// open leaves that field at its default rather than failing the whole
/// record, so readable fields survive.
pub trait OpenFields: Sized {
    type Plain;

    fn open(&self, keystore: &dyn EnvelopeCrypto) -> ValueResult<Self::Plain>;
}

/// Encrypt one label group: CBOR-encode `fields`, then envelope the bytes
/// for the label's resolved keys.
pub fn seal_label_group<T: Serialize>(
    fields: &T,
    label: &str,
    keystore: &dyn EnvelopeCrypto,
    resolver: &LabelResolver,
) -> ValueResult<Vec<u8>> {
    let info = resolver
        .resolve_label_info(label)
        .ok_or_else(|| ValueError::Crypto(format!("no key mapping for label '{label}'")))?;
    let mut plain = Vec::new();
    ciborium::into_writer(fields, &mut plain)?;
    Ok(keystore.encrypt_with_envelope(
        &plain,
        info.network_public_key.as_deref(),
        &info.profile_public_keys,
    )?)
}

/// Decrypt one label group back into its field value.
pub fn open_label_group<T: DeserializeOwned>(
    envelope: &[u8],
    keystore: &dyn EnvelopeCrypto,
) -> ValueResult<T> {
    let plain = keystore.decrypt_envelope(envelope)?;
    Ok(ciborium::from_reader(plain.as_slice())?)
}
