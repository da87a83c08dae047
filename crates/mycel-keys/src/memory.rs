//! In-memory keystore for tests and development.
//!
//! Seals payloads with ChaCha20-Poly1305 under a random per-store key.
//! The envelope is a CBOR record carrying the key fingerprint, nonce,
//! ciphertext and the recipient keys it was addressed to. No key exchange
//! or persistence happens here; recipients are recorded, not used.

use crate::error::{KeyError, KeyResult};
use crate::keystore::{EnvelopeCrypto, KeystoreAdmin, KeystoreCaps};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// CBOR envelope record produced by [`MemoryKeystore::encrypt_with_envelope`].
#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeRecord {
    key_id: String,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    recipients: Vec<Vec<u8>>,
}

/// Dev/test keystore holding a single random symmetric key in memory.
pub struct MemoryKeystore {
    key_bytes: [u8; 32],
    /// Hex SHA-256 fingerprint of the store key.
    key_id: String,
    rng: SystemRandom,
    encrypt_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
    admin: Mutex<AdminState>,
}

#[derive(Debug, Default)]
struct AdminState {
    node_public_key: Option<Vec<u8>>,
    persistence_dir: Option<PathBuf>,
    auto_persist: bool,
    label_mappings: HashMap<String, String>,
    symmetric_keys: HashMap<String, Vec<u8>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes).expect("RNG failure");
        let key_id = hex::encode(Sha256::digest(key_bytes));
        Self {
            key_bytes,
            key_id,
            rng,
            encrypt_calls: AtomicUsize::new(0),
            decrypt_calls: AtomicUsize::new(0),
            admin: Mutex::new(AdminState::default()),
        }
    }

    /// Hex fingerprint identifying this store's key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Number of envelope encryptions performed. Handy in tests asserting
    /// lazy behaviour.
    pub fn encrypt_count(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    /// Number of envelope decryptions performed.
    pub fn decrypt_count(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    /// Node public key last set through the admin surface.
    pub fn local_node_public_key(&self) -> Option<Vec<u8>> {
        self.admin_state().node_public_key.clone()
    }

    /// Label-to-key associations set through the admin surface.
    pub fn label_mappings(&self) -> HashMap<String, String> {
        self.admin_state().label_mappings.clone()
    }

    /// Persistence directory and auto-persist flag last applied.
    pub fn persistence_settings(&self) -> (Option<PathBuf>, bool) {
        let state = self.admin_state();
        (state.persistence_dir.clone(), state.auto_persist)
    }

    fn cipher_key(&self) -> KeyResult<LessSafeKey> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &self.key_bytes)
            .map_err(|_| KeyError::Crypto("invalid key material".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn admin_state(&self) -> std::sync::MutexGuard<'_, AdminState> {
        self.admin.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCrypto for MemoryKeystore {
    fn encrypt_with_envelope(
        &self,
        data: &[u8],
        network_public_key: Option<&[u8]>,
        profile_public_keys: &[Vec<u8>],
    ) -> KeyResult<Vec<u8>> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| KeyError::Crypto("nonce generation failed".into()))?;

        let mut in_out = data.to_vec();
        self.cipher_key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| KeyError::Crypto("envelope encryption failed".into()))?;

        let mut recipients: Vec<Vec<u8>> = Vec::new();
        if let Some(key) = network_public_key {
            recipients.push(key.to_vec());
        }
        recipients.extend(profile_public_keys.iter().cloned());

        let record = EnvelopeRecord {
            key_id: self.key_id.clone(),
            nonce: nonce_bytes.to_vec(),
            ciphertext: in_out,
            recipients,
        };
        let mut out = Vec::new();
        ciborium::into_writer(&record, &mut out)
            .map_err(|e| KeyError::Crypto(format!("envelope encoding failed: {e}")))?;
        Ok(out)
    }

    fn decrypt_envelope(&self, envelope: &[u8]) -> KeyResult<Vec<u8>> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);

        let record: EnvelopeRecord = ciborium::from_reader(envelope)
            .map_err(|e| KeyError::Crypto(format!("malformed envelope: {e}")))?;
        if record.key_id != self.key_id {
            return Err(KeyError::Crypto(format!(
                "envelope was sealed for key '{}', not this store",
                &record.key_id[..record.key_id.len().min(16)]
            )));
        }
        if record.nonce.len() != NONCE_LEN {
            return Err(KeyError::Crypto("invalid envelope nonce".into()));
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&record.nonce);

        let mut in_out = record.ciphertext;
        let plain = self
            .cipher_key()?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| KeyError::Crypto("envelope decryption failed".into()))?;
        Ok(plain.to_vec())
    }

    fn keystore_state(&self) -> i32 {
        1 // ready as soon as constructed
    }

    fn keystore_caps(&self) -> KeystoreCaps {
        KeystoreCaps {
            can_encrypt: true,
            can_decrypt: true,
            has_network_keys: false,
            has_profile_keys: false,
        }
    }
}

impl KeystoreAdmin for MemoryKeystore {
    fn ensure_symmetric_key(&self, key_name: &str) -> KeyResult<Vec<u8>> {
        let mut state = self.admin_state();
        if let Some(key) = state.symmetric_keys.get(key_name) {
            return Ok(key.clone());
        }
        let mut key = vec![0u8; 32];
        self.rng
            .fill(&mut key)
            .map_err(|_| KeyError::Crypto("key generation failed".into()))?;
        state.symmetric_keys.insert(key_name.to_string(), key.clone());
        Ok(key)
    }

    fn set_local_node_info(&self, node_public_key: Vec<u8>) {
        self.admin_state().node_public_key = Some(node_public_key);
    }

    fn set_persistence_dir(&self, dir: PathBuf) {
        self.admin_state().persistence_dir = Some(dir);
    }

    fn enable_auto_persist(&self, enabled: bool) {
        self.admin_state().auto_persist = enabled;
    }

    fn wipe_persistence(&self) -> KeyResult<()> {
        self.admin_state().persistence_dir = None;
        Ok(())
    }

    fn flush_state(&self) -> KeyResult<()> {
        Ok(()) // nothing persists
    }

    fn set_label_mapping(&self, label: String, key_name: String) {
        self.admin_state().label_mappings.insert(label, key_name);
    }
}
