//! Process-wide type registry.
//!
//! Maps wire names to decoders, encryptors, decryptors and JSON converters,
//! and keeps the bidirectional wire-name / Rust-type-name tables. Primitives
//! are pre-seeded on first access. Dynamic behaviour is a table of plain
//! function pointers keyed by wire name; generic registration functions
//! capture the monomorphised code.

use crate::error::{ValueError, ValueResult};
use crate::seal::{OpenFields, SealFields, SerializationContext};
use mycel_keys::EnvelopeCrypto;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Type-erased value handle stored inside an eager `AnyValue`.
pub type ArcAny = Arc<dyn Any + Send + Sync>;

/// Decode a plain payload into a type-erased value.
pub type DecodeFn = fn(&[u8]) -> ValueResult<ArcAny>;

/// Produce the encrypted-companion CBOR for a value.
pub type EncryptFn = fn(&ArcAny, &SerializationContext) -> ValueResult<Vec<u8>>;

/// Open an encrypted-companion payload back into the plain value.
pub type DecryptFn = fn(&[u8], &dyn EnvelopeCrypto) -> ValueResult<ArcAny>;

/// Convert a plain payload to a JSON value.
pub type JsonFn = fn(&[u8]) -> ValueResult<serde_json::Value>;

#[derive(Default)]
struct TypeRegistry {
    wire_by_rust: HashMap<String, String>,
    rust_by_wire: HashMap<String, String>,
    decoders: HashMap<String, DecodeFn>,
    encryptors: HashMap<String, EncryptFn>,
    decryptors: HashMap<String, DecryptFn>,
    json_converters: HashMap<String, JsonFn>,
    /// Rust types registered as encrypted companions.
    companions: HashSet<TypeId>,
}

macro_rules! seed_scalar {
    ($reg:expr, $t:ty, $name:expr) => {
        $reg.seed($name, std::any::type_name::<$t>(), decode_cbor::<$t>, json_from_cbor::<$t>);
    };
}

impl TypeRegistry {
    fn seeded() -> Self {
        let mut reg = TypeRegistry::default();
        seed_scalar!(reg, String, "string");
        seed_scalar!(reg, bool, "bool");
        seed_scalar!(reg, i8, "i8");
        seed_scalar!(reg, i16, "i16");
        seed_scalar!(reg, i32, "i32");
        seed_scalar!(reg, i64, "i64");
        seed_scalar!(reg, i128, "i128");
        seed_scalar!(reg, u8, "u8");
        seed_scalar!(reg, u16, "u16");
        seed_scalar!(reg, u32, "u32");
        seed_scalar!(reg, u64, "u64");
        seed_scalar!(reg, u128, "u128");
        seed_scalar!(reg, f32, "f32");
        seed_scalar!(reg, f64, "f64");
        seed_scalar!(reg, char, "char");
        // bytes payloads are raw, not CBOR-wrapped
        reg.seed("bytes", std::any::type_name::<Vec<u8>>(), decode_raw_bytes, json_raw_bytes);
        reg.seed(
            "json",
            std::any::type_name::<serde_json::Value>(),
            decode_cbor::<serde_json::Value>,
            json_from_any_cbor,
        );
        // default converters for undeclared records and containers
        reg.json_converters.insert("struct".to_string(), json_from_any_cbor);
        reg
    }

    fn seed(&mut self, wire: &str, rust: &str, decode: DecodeFn, json: JsonFn) {
        self.wire_by_rust.insert(rust.to_string(), wire.to_string());
        self.rust_by_wire.insert(wire.to_string(), rust.to_string());
        self.decoders.insert(wire.to_string(), decode);
        self.json_converters.insert(wire.to_string(), json);
    }
}

fn registry() -> &'static RwLock<TypeRegistry> {
    static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(TypeRegistry::seeded()))
}

fn read() -> RwLockReadGuard<'static, TypeRegistry> {
    registry().read().unwrap_or_else(|e| e.into_inner())
}

fn write() -> RwLockWriteGuard<'static, TypeRegistry> {
    registry().write().unwrap_or_else(|e| e.into_inner())
}

// ── Registration ─────────────────────────────────────────────────────

/// Register a plain (unlabelled) struct under a wire name.
pub fn register_struct<T>(wire_name: &str)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut reg = write();
    reg.seed(
        wire_name,
        std::any::type_name::<T>(),
        decode_cbor::<T>,
        json_from_cbor::<T>,
    );
}

/// Register a labelled struct together with its encrypted companion.
///
/// Wires the seal/open pair into the encryptor and decryptor tables and
/// marks the companion type, so typed access can refuse plain bodies
/// requested as the companion.
pub fn register_sealed<T>(wire_name: &str)
where
    T: SealFields + Serialize + DeserializeOwned + Send + Sync + 'static,
    <T as SealFields>::Sealed:
        OpenFields<Plain = T> + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    register_struct::<T>(wire_name);
    let mut reg = write();
    reg.encryptors.insert(wire_name.to_string(), encrypt_sealed::<T>);
    reg.decryptors.insert(wire_name.to_string(), decrypt_sealed::<T>);
    reg.companions.insert(TypeId::of::<T::Sealed>());
}

/// Map a Rust type name to a wire name without any behaviour.
pub fn register_wire_name(rust_name: &str, wire_name: &str) {
    let mut reg = write();
    reg.wire_by_rust.insert(rust_name.to_string(), wire_name.to_string());
    reg.rust_by_wire.insert(wire_name.to_string(), rust_name.to_string());
}

pub fn register_type(wire_name: &str, decoder: DecodeFn) {
    write().decoders.insert(wire_name.to_string(), decoder);
}

pub fn register_encrypt(wire_name: &str, f: EncryptFn) {
    write().encryptors.insert(wire_name.to_string(), f);
}

pub fn register_decrypt(wire_name: &str, f: DecryptFn) {
    write().decryptors.insert(wire_name.to_string(), f);
}

pub fn register_to_json(wire_name: &str, f: JsonFn) {
    write().json_converters.insert(wire_name.to_string(), f);
}

/// Reset the registry to its pre-seeded state. Intended for tests.
pub fn clear_registry() {
    *write() = TypeRegistry::seeded();
}

// ── Lookups ──────────────────────────────────────────────────────────

/// Decoder registered for a wire name.
pub fn resolve_type(wire_name: &str) -> Option<DecodeFn> {
    read().decoders.get(wire_name).copied()
}

pub fn lookup_wire_name(rust_name: &str) -> Option<String> {
    read().wire_by_rust.get(rust_name).cloned()
}

pub fn lookup_rust_name(wire_name: &str) -> Option<String> {
    read().rust_by_wire.get(wire_name).cloned()
}

pub fn lookup_encryptor_by_type_name(wire_name: &str) -> Option<EncryptFn> {
    read().encryptors.get(wire_name).copied()
}

pub fn lookup_decryptor_by_type_name(wire_name: &str) -> Option<DecryptFn> {
    read().decryptors.get(wire_name).copied()
}

/// JSON converter for a wire name. Parameterised container names fall back
/// to the generic CBOR-to-JSON conversion.
pub fn get_json_converter_by_wire_name(wire_name: &str) -> Option<JsonFn> {
    if let Some(f) = read().json_converters.get(wire_name).copied() {
        return Some(f);
    }
    if wire_name.starts_with("list<") || wire_name.starts_with("map<") {
        return Some(json_from_any_cbor);
    }
    None
}

pub fn get_json_converter_by_rust_name(rust_name: &str) -> Option<JsonFn> {
    let wire = lookup_wire_name(rust_name)?;
    get_json_converter_by_wire_name(&wire)
}

/// Whether `id` is a registered encrypted-companion type.
pub fn is_companion_type(id: TypeId) -> bool {
    read().companions.contains(&id)
}

// ── Erased function bodies ───────────────────────────────────────────

fn decode_cbor<T>(data: &[u8]) -> ValueResult<ArcAny>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let value: T = ciborium::from_reader(data)?;
    Ok(Arc::new(value))
}

fn decode_raw_bytes(data: &[u8]) -> ValueResult<ArcAny> {
    Ok(Arc::new(data.to_vec()))
}

fn json_from_cbor<T>(data: &[u8]) -> ValueResult<serde_json::Value>
where
    T: Serialize + DeserializeOwned,
{
    let value: T = ciborium::from_reader(data)?;
    serde_json::to_value(&value).map_err(|e| ValueError::Type(format!("JSON conversion failed: {e}")))
}

fn json_raw_bytes(data: &[u8]) -> ValueResult<serde_json::Value> {
    serde_json::to_value(data).map_err(|e| ValueError::Type(format!("JSON conversion failed: {e}")))
}

/// Generic CBOR payload to JSON, for containers and undeclared records.
fn json_from_any_cbor(data: &[u8]) -> ValueResult<serde_json::Value> {
    let value: ciborium::Value = ciborium::from_reader(data)?;
    cbor_to_json(&value)
}

/// Structural CBOR-to-JSON conversion. Map keys must be text; byte strings
/// become arrays of numbers.
pub(crate) fn cbor_to_json(value: &ciborium::Value) -> ValueResult<serde_json::Value> {
    use ciborium::Value as Cbor;
    use serde_json::Value as Json;

    Ok(match value {
        Cbor::Null => Json::Null,
        Cbor::Bool(b) => Json::Bool(*b),
        Cbor::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                Json::from(v)
            } else if let Ok(v) = u64::try_from(n) {
                Json::from(v)
            } else {
                return Err(ValueError::Type(format!("integer {n} does not fit JSON")));
            }
        }
        Cbor::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| ValueError::Type("non-finite float cannot convert to JSON".into()))?,
        Cbor::Text(t) => Json::String(t.clone()),
        Cbor::Bytes(b) => Json::Array(b.iter().map(|&x| Json::from(x)).collect()),
        Cbor::Array(items) => Json::Array(
            items
                .iter()
                .map(cbor_to_json)
                .collect::<ValueResult<Vec<_>>>()?,
        ),
        Cbor::Map(entries) => {
            let mut object = serde_json::Map::new();
            for (key, value) in entries {
                let Cbor::Text(key) = key else {
                    return Err(ValueError::Type("map key is not a string".into()));
                };
                object.insert(key.clone(), cbor_to_json(value)?);
            }
            Json::Object(object)
        }
        Cbor::Tag(_, inner) => cbor_to_json(inner)?,
        _ => return Err(ValueError::Type("unsupported CBOR shape for JSON".into())),
    })
}

fn encrypt_sealed<T>(value: &ArcAny, ctx: &SerializationContext) -> ValueResult<Vec<u8>>
where
    T: SealFields + Send + Sync + 'static,
    T::Sealed: Serialize,
{
    let plain = value.downcast_ref::<T>().ok_or_else(|| {
        ValueError::Type("encryptor invoked with a mismatched value type".into())
    })?;
    let sealed = plain.seal(ctx.keystore.as_ref(), &ctx.resolver)?;
    let mut out = Vec::new();
    ciborium::into_writer(&sealed, &mut out)?;
    Ok(out)
}

fn decrypt_sealed<T>(data: &[u8], keystore: &dyn EnvelopeCrypto) -> ValueResult<ArcAny>
where
    T: SealFields + Send + Sync + 'static,
    T::Sealed: OpenFields<Plain = T> + DeserializeOwned,
{
    let sealed: T::Sealed = ciborium::from_reader(data)?;
    Ok(Arc::new(sealed.open(keystore)?))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        name: String,
    }

    #[test]
    fn primitives_are_pre_seeded() {
        let _guard = test_support::registry_lock();

        for name in [
            "string", "bool", "i8", "i16", "i32", "i64", "i128", "u8", "u16", "u32", "u64",
            "u128", "f32", "f64", "char", "bytes", "json",
        ] {
            assert!(resolve_type(name).is_some(), "missing decoder for {name}");
            assert!(
                get_json_converter_by_wire_name(name).is_some(),
                "missing JSON converter for {name}"
            );
        }
        assert_eq!(
            lookup_wire_name(std::any::type_name::<i64>()).as_deref(),
            Some("i64")
        );
        assert_eq!(
            lookup_rust_name("string").as_deref(),
            Some(std::any::type_name::<String>())
        );
    }

    #[test]
    fn registered_struct_decodes_and_converts() {
        let _guard = test_support::registry_lock();
        register_struct::<Sample>("sample");

        let sample = Sample {
            id: 7,
            name: "seven".into(),
        };
        let mut body = Vec::new();
        ciborium::into_writer(&sample, &mut body).unwrap();

        let decode = resolve_type("sample").unwrap();
        let erased = decode(&body).unwrap();
        assert_eq!(erased.downcast_ref::<Sample>(), Some(&sample));

        let convert = get_json_converter_by_wire_name("sample").unwrap();
        let json = convert(&body).unwrap();
        assert_eq!(json["name"], "seven");
    }

    #[test]
    fn container_names_fall_back_to_generic_json() {
        let _guard = test_support::registry_lock();

        let items = vec![1i64, 2, 3];
        let mut body = Vec::new();
        ciborium::into_writer(&items, &mut body).unwrap();

        let convert = get_json_converter_by_wire_name("list<i64>").unwrap();
        assert_eq!(convert(&body).unwrap(), serde_json::json!([1, 2, 3]));
        assert!(get_json_converter_by_wire_name("mystery").is_none());
    }

    #[test]
    fn clear_resets_to_seeded_state() {
        let _guard = test_support::registry_lock();
        register_struct::<Sample>("sample_to_clear");
        assert!(resolve_type("sample_to_clear").is_some());

        clear_registry();
        assert!(resolve_type("sample_to_clear").is_none());
        assert!(resolve_type("string").is_some());
    }

    #[test]
    fn bytes_decoder_is_raw() {
        let _guard = test_support::registry_lock();

        let decode = resolve_type("bytes").unwrap();
        let erased = decode(&[1, 2, 3]).unwrap();
        assert_eq!(erased.downcast_ref::<Vec<u8>>(), Some(&vec![1u8, 2, 3]));
    }
}
