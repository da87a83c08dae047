//! Label-to-key resolution.
//!
//! A system-wide [`LabelResolverConfig`] names the encryption labels a
//! network knows about; at request time it is combined with the caller's
//! profile public keys into a [`LabelResolver`] that hands the serializer
//! concrete key material per label.

use crate::error::{KeyError, KeyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a label sources user keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKeyword {
    /// Use the profile keys of the caller making the request.
    CurrentUser,
    /// Reserved for future custom key selection.
    Custom,
}

/// One label's entry in the system configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LabelValue {
    pub network_public_key: Option<Vec<u8>>,
    pub user_key_spec: Option<LabelKeyword>,
}

/// System-wide label configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelResolverConfig {
    pub label_mappings: HashMap<String, LabelValue>,
}

/// Resolved key material for one label.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelKeyInfo {
    pub network_public_key: Option<Vec<u8>>,
    pub profile_public_keys: Vec<Vec<u8>>,
}

/// Per-request resolver mapping labels to concrete keys.
#[derive(Debug, Clone, Default)]
pub struct LabelResolver {
    mapping: HashMap<String, LabelKeyInfo>,
}

impl LabelResolver {
    /// Build a resolver from the system config and the caller's profile
    /// public keys.
    ///
    /// `CurrentUser` labels pick up the caller's profile keys (which may be
    /// empty); `Custom` labels keep an empty profile key list. A label that
    /// specifies neither a network public key nor a user key spec is a
    /// configuration error.
    pub fn new(
        config: &LabelResolverConfig,
        profile_public_keys: &[Vec<u8>],
    ) -> KeyResult<Self> {
        let mut mapping = HashMap::new();
        for (label, value) in &config.label_mappings {
            if value.network_public_key.is_none() && value.user_key_spec.is_none() {
                return Err(KeyError::Config(format!(
                    "Label '{label}' must specify either network_public_key or user_key_spec (or both)"
                )));
            }
            let profile_keys = match value.user_key_spec {
                Some(LabelKeyword::CurrentUser) => profile_public_keys.to_vec(),
                Some(LabelKeyword::Custom) | None => Vec::new(),
            };
            mapping.insert(
                label.clone(),
                LabelKeyInfo {
                    network_public_key: value.network_public_key.clone(),
                    profile_public_keys: profile_keys,
                },
            );
        }
        Ok(Self { mapping })
    }

    /// Key material for `label`, if configured.
    pub fn resolve_label_info(&self, label: &str) -> Option<&LabelKeyInfo> {
        self.mapping.get(label)
    }

    /// All configured labels, sorted.
    pub fn available_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.mapping.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn can_resolve(&self, label: &str) -> bool {
        self.mapping.contains_key(label)
    }
}

/// Reject empty configurations and empty network public keys.
pub fn validate_label_config(config: &LabelResolverConfig) -> KeyResult<()> {
    if config.label_mappings.is_empty() {
        return Err(KeyError::Config(
            "label resolver config has no label mappings".into(),
        ));
    }
    for (label, value) in &config.label_mappings {
        if let Some(key) = &value.network_public_key {
            if key.is_empty() {
                return Err(KeyError::Config(format!(
                    "label '{label}' has an empty network public key"
                )));
            }
        }
    }
    Ok(())
}
