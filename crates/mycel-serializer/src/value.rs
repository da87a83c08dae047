//! Self-describing value container with lazy decrypt-on-access.
//!
//! An `AnyValue` carries a category byte, a wire type name and either an
//! eager native value or a lazy slice of the buffer it was deserialized
//! from. Complex categories decode (and, when enveloped, decrypt) on first
//! typed access only; the plaintext and decoded value are memoised per
//! instance.

use crate::error::{ValueError, ValueResult};
use crate::registry::{self, ArcAny};
use crate::seal::SerializationContext;
use crate::wire::{encode_header, parse_header, ValueCategory};
use ciborium::Value as Cbor;
use mycel_keys::EnvelopeCrypto;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Category-tagged, self-describing value.
#[derive(Clone)]
pub struct AnyValue {
    category: ValueCategory,
    wire_name: String,
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Null,
    Eager(EagerValue),
    /// A container built from already-wrapped elements; serialized by the
    /// container-recurse rule.
    ListAny(Vec<AnyValue>),
    MapAny(HashMap<String, AnyValue>),
    Lazy(Arc<LazyHolder>),
}

/// Eager native value: the erased value plus the encode function captured
/// at construction.
#[derive(Clone)]
struct EagerValue {
    value: ArcAny,
    rust_type: &'static str,
    encode: fn(&ArcAny, Option<&SerializationContext>) -> ValueResult<Vec<u8>>,
}

/// Lazy payload: a slice of the original deserialization buffer, decrypted
/// and decoded on first typed access.
pub struct LazyHolder {
    type_name: String,
    buffer: Arc<[u8]>,
    encrypted: bool,
    start: usize,
    end: usize,
    keystore: Option<Arc<dyn EnvelopeCrypto>>,
    plaintext: OnceLock<Vec<u8>>,
    decoded: OnceLock<ArcAny>,
}

impl LazyHolder {
    fn from_payload(
        type_name: &str,
        payload: Vec<u8>,
        keystore: Option<Arc<dyn EnvelopeCrypto>>,
    ) -> Self {
        let end = payload.len();
        Self {
            type_name: type_name.to_string(),
            buffer: payload.into(),
            encrypted: false,
            start: 0,
            end,
            keystore,
            plaintext: OnceLock::new(),
            decoded: OnceLock::new(),
        }
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    /// Plain payload bytes, decrypting the outer envelope at most once.
    fn plaintext(&self) -> ValueResult<&[u8]> {
        if !self.encrypted {
            return Ok(self.payload());
        }
        if let Some(plain) = self.plaintext.get() {
            return Ok(plain);
        }
        let keystore = self.keystore.as_deref().ok_or_else(|| {
            ValueError::Crypto("Data is encrypted but no keystore provided".into())
        })?;
        let plain = keystore.decrypt_envelope(self.payload())?;
        debug!(type_name = %self.type_name, bytes = plain.len(), "envelope decrypted");
        Ok(self.plaintext.get_or_init(|| plain))
    }
}

impl AnyValue {
    // ── Constructors ─────────────────────────────────────────────────

    pub fn null() -> Self {
        Self {
            category: ValueCategory::Null,
            wire_name: "null".to_string(),
            repr: Repr::Null,
        }
    }

    fn scalar<T>(value: T, wire_name: &str) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self {
            category: ValueCategory::Primitive,
            wire_name: wire_name.to_string(),
            repr: Repr::Eager(EagerValue {
                value: Arc::new(value),
                rust_type: type_name::<T>(),
                encode: encode_cbor::<T>,
            }),
        }
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Self {
            category: ValueCategory::Bytes,
            wire_name: "bytes".to_string(),
            repr: Repr::Eager(EagerValue {
                value: Arc::new(data),
                rust_type: type_name::<Vec<u8>>(),
                encode: encode_raw_bytes,
            }),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            category: ValueCategory::Json,
            wire_name: "json".to_string(),
            repr: Repr::Eager(EagerValue {
                value: Arc::new(value),
                rust_type: type_name::<serde_json::Value>(),
                encode: encode_cbor::<serde_json::Value>,
            }),
        }
    }

    /// A homogeneous list of native values. The element wire name comes
    /// from the registry; unregistered element types serialize under
    /// `list<any>`.
    pub fn list<T>(items: Vec<T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let elem = registry::lookup_wire_name(type_name::<T>()).unwrap_or_else(|| "any".into());
        Self {
            category: ValueCategory::List,
            wire_name: format!("list<{elem}>"),
            repr: Repr::Eager(EagerValue {
                value: Arc::new(items),
                rust_type: type_name::<Vec<T>>(),
                encode: encode_list::<T>,
            }),
        }
    }

    /// A string-keyed map of native values.
    pub fn map<T>(entries: HashMap<String, T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let elem = registry::lookup_wire_name(type_name::<T>()).unwrap_or_else(|| "any".into());
        Self {
            category: ValueCategory::Map,
            wire_name: format!("map<string,{elem}>"),
            repr: Repr::Eager(EagerValue {
                value: Arc::new(entries),
                rust_type: type_name::<HashMap<String, T>>(),
                encode: encode_map::<T>,
            }),
        }
    }

    /// A record value. Registered types serialize under their registered
    /// wire name, everything else under `struct`.
    pub fn strukt<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let wire =
            registry::lookup_wire_name(type_name::<T>()).unwrap_or_else(|| "struct".into());
        Self {
            category: ValueCategory::Struct,
            wire_name: wire,
            repr: Repr::Eager(EagerValue {
                value: Arc::new(value),
                rust_type: type_name::<T>(),
                encode: encode_struct::<T>,
            }),
        }
    }

    /// A list of already-wrapped values. Homogeneous element names yield
    /// `list<E>`, mixed ones `list<any>`.
    pub fn from_any_list(items: Vec<AnyValue>) -> Self {
        let wire_name = match items.split_first() {
            Some((first, rest)) if rest.iter().all(|v| v.wire_name == first.wire_name) => {
                format!("list<{}>", first.wire_name)
            }
            Some(_) => "list<any>".to_string(),
            None => "list<any>".to_string(),
        };
        Self {
            category: ValueCategory::List,
            wire_name,
            repr: Repr::ListAny(items),
        }
    }

    /// A string-keyed map of already-wrapped values.
    pub fn from_any_map(entries: HashMap<String, AnyValue>) -> Self {
        let mut names = entries.values().map(|v| v.wire_name.as_str());
        let wire_name = match names.next() {
            Some(first) => {
                if names.all(|n| n == first) {
                    format!("map<string,{first}>")
                } else {
                    "map<string,any>".to_string()
                }
            }
            None => "map<string,any>".to_string(),
        };
        Self {
            category: ValueCategory::Map,
            wire_name,
            repr: Repr::MapAny(entries),
        }
    }

    /// Wrap a JSON value by structure: numbers become `i64`/`u64`/`f64`
    /// primitives, arrays and objects become wrapped containers.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => Self::null(),
            Json::Bool(b) => Self::from(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::from(i)
                } else if let Some(u) = n.as_u64() {
                    Self::from(u)
                } else {
                    Self::from(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Self::from(s),
            Json::Array(items) => {
                Self::from_any_list(items.into_iter().map(Self::from_json).collect())
            }
            Json::Object(entries) => Self::from_any_map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn category(&self) -> ValueCategory {
        self.category
    }

    /// The wire type name this value serializes under.
    pub fn wire_name(&self) -> &str {
        &self.wire_name
    }

    pub fn is_null(&self) -> bool {
        matches!(self.repr, Repr::Null)
    }

    /// Whether the value still holds an undecoded payload slice.
    pub fn is_lazy(&self) -> bool {
        matches!(self.repr, Repr::Lazy(_))
    }

    // ── Wire form ────────────────────────────────────────────────────

    /// Serialize to wire bytes. With a context, complex categories are
    /// wrapped in the keystore's outer envelope and labelled structs are
    /// replaced by their encrypted companions.
    pub fn serialize(&self, ctx: Option<&SerializationContext>) -> ValueResult<Vec<u8>> {
        let mut out = Vec::new();
        match &self.repr {
            Repr::Null => encode_header(&mut out, ValueCategory::Null, false, "null")?,
            Repr::Lazy(holder) => {
                // already in wire form: re-emit the stored payload unchanged
                encode_header(&mut out, self.category, holder.encrypted, &holder.type_name)?;
                out.extend_from_slice(holder.payload());
            }
            Repr::Eager(eager) => {
                let body = (eager.encode)(&eager.value, ctx)?;
                self.frame_body(&mut out, body, ctx)?;
            }
            Repr::ListAny(items) => {
                let body = encode_any_list(items, ctx)?;
                self.frame_body(&mut out, body, ctx)?;
            }
            Repr::MapAny(entries) => {
                let body = encode_any_map(entries, ctx)?;
                self.frame_body(&mut out, body, ctx)?;
            }
        }
        Ok(out)
    }

    fn frame_body(
        &self,
        out: &mut Vec<u8>,
        body: Vec<u8>,
        ctx: Option<&SerializationContext>,
    ) -> ValueResult<()> {
        match ctx {
            Some(ctx) if self.category.supports_envelope() => {
                let envelope = ctx.keystore.encrypt_with_envelope(
                    &body,
                    ctx.network_public_key.as_deref(),
                    &ctx.profile_public_keys,
                )?;
                encode_header(out, self.category, true, &self.wire_name)?;
                out.extend_from_slice(&envelope);
            }
            _ => {
                encode_header(out, self.category, false, &self.wire_name)?;
                out.extend_from_slice(&body);
            }
        }
        Ok(())
    }

    /// Reconstruct a value from wire bytes. Payloads stay lazy; the
    /// keystore handle is kept for decrypt-on-access.
    pub fn deserialize(
        data: &[u8],
        keystore: Option<Arc<dyn EnvelopeCrypto>>,
    ) -> ValueResult<Self> {
        let header = parse_header(data)?;
        if header.category == ValueCategory::Null {
            return Ok(Self::null());
        }
        if header.is_encrypted {
            if keystore.is_none() {
                return Err(ValueError::Crypto(
                    "Data is encrypted but no keystore provided".into(),
                ));
            }
            if !header.category.supports_envelope() {
                return Err(ValueError::Wire(format!(
                    "category {:?} does not support encrypted payloads",
                    header.category
                )));
            }
        }
        let holder = LazyHolder {
            type_name: header.type_name.clone(),
            buffer: Arc::from(data),
            encrypted: header.is_encrypted,
            start: header.payload_start,
            end: data.len(),
            keystore,
            plaintext: OnceLock::new(),
            decoded: OnceLock::new(),
        };
        Ok(Self {
            category: header.category,
            wire_name: header.type_name,
            repr: Repr::Lazy(Arc::new(holder)),
        })
    }

    // ── Typed access ─────────────────────────────────────────────────

    /// Read the value as `T`, decoding and decrypting on demand.
    pub fn as_type<T>(&self) -> ValueResult<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match &self.repr {
            Repr::Null => Err(ValueError::Type(format!(
                "null value cannot be read as {}",
                type_name::<T>()
            ))),
            Repr::Eager(eager) => {
                eager.value.downcast_ref::<T>().cloned().ok_or_else(|| {
                    ValueError::Type(format!(
                        "value of type {} cannot be read as {}",
                        eager.rust_type,
                        type_name::<T>()
                    ))
                })
            }
            Repr::ListAny(items) => {
                let any: &dyn Any = items;
                any.downcast_ref::<T>().cloned().ok_or_else(|| {
                    ValueError::Type(
                        "wrapped list can only be read via as_list or as_any_value_array".into(),
                    )
                })
            }
            Repr::MapAny(entries) => {
                let any: &dyn Any = entries;
                any.downcast_ref::<T>().cloned().ok_or_else(|| {
                    ValueError::Type(
                        "wrapped map can only be read via as_map or as_any_value_map".into(),
                    )
                })
            }
            Repr::Lazy(holder) => self.decode_lazy::<T>(holder),
        }
    }

    fn decode_lazy<T>(&self, holder: &LazyHolder) -> ValueResult<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(decoded) = holder.decoded.get() {
            if let Some(value) = decoded.downcast_ref::<T>() {
                return Ok(value.clone());
            }
        }
        let plain = holder.plaintext()?;

        if self.category == ValueCategory::Bytes {
            let boxed: Box<dyn Any> = Box::new(plain.to_vec());
            return boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                ValueError::Type(format!("bytes value cannot be read as {}", type_name::<T>()))
            });
        }

        match ciborium::from_reader::<T, _>(plain) {
            Ok(value) => {
                if registry::is_companion_type(TypeId::of::<T>())
                    && !has_encrypted_field_shape(plain)
                {
                    return Err(ValueError::InvalidTypeForPlainBody(format!(
                        "plain '{}' body requested as companion {}",
                        holder.type_name,
                        type_name::<T>()
                    )));
                }
                let _ = holder.decoded.set(Arc::new(value.clone()));
                Ok(value)
            }
            Err(decode_err) => {
                if has_encrypted_field_shape(plain) {
                    let decrypt = registry::lookup_decryptor_by_type_name(&holder.type_name)
                        .ok_or_else(|| {
                            ValueError::Type(format!(
                                "no decryptor registered for '{}'",
                                holder.type_name
                            ))
                        })?;
                    let keystore = holder.keystore.as_deref().ok_or_else(|| {
                        ValueError::Crypto("Data is encrypted but no keystore provided".into())
                    })?;
                    let erased = decrypt(plain, keystore)?;
                    let value = erased.downcast_ref::<T>().cloned().ok_or_else(|| {
                        ValueError::Type(format!(
                            "decryptor for '{}' did not produce {}",
                            holder.type_name,
                            type_name::<T>()
                        ))
                    })?;
                    let _ = holder.decoded.set(erased);
                    return Ok(value);
                }
                if registry::is_companion_type(TypeId::of::<T>()) {
                    return Err(ValueError::InvalidTypeForPlainBody(format!(
                        "plain '{}' body requested as companion {}",
                        holder.type_name,
                        type_name::<T>()
                    )));
                }
                Err(ValueError::Codec(format!(
                    "cannot decode '{}' payload as {}: {decode_err}",
                    holder.type_name,
                    type_name::<T>()
                )))
            }
        }
    }

    /// Read a list with explicit element type `E`.
    ///
    /// Falls back through three layouts: plain elements, per-element
    /// encrypted blobs with a registered element decryptor, and finally
    /// element-wise wrapped access.
    pub fn as_list<E>(&self) -> ValueResult<Vec<E>>
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match &self.repr {
            Repr::ListAny(items) => items.iter().map(|v| v.as_type::<E>()).collect(),
            Repr::Eager(eager) => {
                eager.value.downcast_ref::<Vec<E>>().cloned().ok_or_else(|| {
                    ValueError::Type(format!(
                        "value of type {} cannot be read as Vec<{}>",
                        eager.rust_type,
                        type_name::<E>()
                    ))
                })
            }
            Repr::Lazy(holder) => {
                let plain = holder.plaintext()?;
                if let Ok(items) = ciborium::from_reader::<Vec<E>, _>(plain) {
                    return Ok(items);
                }
                let value: Cbor = ciborium::from_reader(plain)?;
                let Cbor::Array(elements) = value else {
                    return Err(ValueError::Type(format!(
                        "'{}' payload is not an array",
                        holder.type_name
                    )));
                };
                let blobs: Vec<&[u8]> = elements
                    .iter()
                    .filter_map(|e| match e {
                        Cbor::Bytes(b) => Some(b.as_slice()),
                        _ => None,
                    })
                    .collect();
                if !elements.is_empty() && blobs.len() == elements.len() {
                    if let Some(decrypt) = element_decryptor::<E>() {
                        let keystore = holder.keystore.as_deref().ok_or_else(|| {
                            ValueError::Crypto(
                                "Data is encrypted but no keystore provided".into(),
                            )
                        })?;
                        let mut out = Vec::with_capacity(blobs.len());
                        for blob in blobs {
                            let erased = decrypt(blob, keystore)?;
                            out.push(erased.downcast_ref::<E>().cloned().ok_or_else(|| {
                                ValueError::Type(format!(
                                    "element decryptor did not produce {}",
                                    type_name::<E>()
                                ))
                            })?);
                        }
                        return Ok(out);
                    }
                }
                let elem_wire = element_wire_name(&self.wire_name);
                elements
                    .iter()
                    .map(|element| {
                        wrap_element(element, &elem_wire, holder.keystore.clone())?
                            .as_type::<E>()
                    })
                    .collect()
            }
            _ => Err(ValueError::Type(format!(
                "{:?} value is not a list",
                self.category
            ))),
        }
    }

    /// Read a string-keyed map with explicit value type `V`. Same fallback
    /// chain as [`as_list`](Self::as_list).
    pub fn as_map<V>(&self) -> ValueResult<HashMap<String, V>>
    where
        V: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match &self.repr {
            Repr::MapAny(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.as_type::<V>()?)))
                .collect(),
            Repr::Eager(eager) => eager
                .value
                .downcast_ref::<HashMap<String, V>>()
                .cloned()
                .ok_or_else(|| {
                    ValueError::Type(format!(
                        "value of type {} cannot be read as HashMap<String, {}>",
                        eager.rust_type,
                        type_name::<V>()
                    ))
                }),
            Repr::Lazy(holder) => {
                let plain = holder.plaintext()?;
                if let Ok(entries) = ciborium::from_reader::<HashMap<String, V>, _>(plain) {
                    return Ok(entries);
                }
                let value: Cbor = ciborium::from_reader(plain)?;
                let Cbor::Map(pairs) = value else {
                    return Err(ValueError::Type(format!(
                        "'{}' payload is not a map",
                        holder.type_name
                    )));
                };
                let mut text_pairs = Vec::with_capacity(pairs.len());
                for (key, val) in &pairs {
                    let Cbor::Text(key) = key else {
                        return Err(ValueError::Type("map key is not a string".into()));
                    };
                    text_pairs.push((key.clone(), val));
                }
                let all_bytes = !text_pairs.is_empty()
                    && text_pairs.iter().all(|(_, v)| matches!(v, Cbor::Bytes(_)));
                if all_bytes {
                    if let Some(decrypt) = element_decryptor::<V>() {
                        let keystore = holder.keystore.as_deref().ok_or_else(|| {
                            ValueError::Crypto(
                                "Data is encrypted but no keystore provided".into(),
                            )
                        })?;
                        let mut out = HashMap::with_capacity(text_pairs.len());
                        for (key, val) in &text_pairs {
                            let Cbor::Bytes(blob) = val else { continue };
                            let erased = decrypt(blob, keystore)?;
                            let value =
                                erased.downcast_ref::<V>().cloned().ok_or_else(|| {
                                    ValueError::Type(format!(
                                        "element decryptor did not produce {}",
                                        type_name::<V>()
                                    ))
                                })?;
                            out.insert(key.clone(), value);
                        }
                        return Ok(out);
                    }
                }
                let elem_wire = element_wire_name(&self.wire_name);
                text_pairs
                    .into_iter()
                    .map(|(key, val)| {
                        let wrapped = wrap_element(val, &elem_wire, holder.keystore.clone())?;
                        Ok((key, wrapped.as_type::<V>()?))
                    })
                    .collect()
            }
            _ => Err(ValueError::Type(format!(
                "{:?} value is not a map",
                self.category
            ))),
        }
    }

    /// Canonical wrapped access to a list: elements stay lazy and are not
    /// decrypted.
    pub fn as_any_value_array(&self) -> ValueResult<Vec<AnyValue>> {
        match &self.repr {
            Repr::ListAny(items) => Ok(items.clone()),
            Repr::Eager(eager) => {
                let body = (eager.encode)(&eager.value, None)?;
                let value: Cbor = ciborium::from_reader(body.as_slice())?;
                let Cbor::Array(elements) = value else {
                    return Err(ValueError::Type("value is not a list".into()));
                };
                let elem_wire = element_wire_name(&self.wire_name);
                elements
                    .iter()
                    .map(|element| wrap_element(element, &elem_wire, None))
                    .collect()
            }
            Repr::Lazy(holder) => {
                let plain = holder.plaintext()?;
                let value: Cbor = ciborium::from_reader(plain)?;
                let Cbor::Array(elements) = value else {
                    return Err(ValueError::Type(format!(
                        "'{}' payload is not an array",
                        holder.type_name
                    )));
                };
                let elem_wire = element_wire_name(&self.wire_name);
                elements
                    .iter()
                    .map(|element| wrap_element(element, &elem_wire, holder.keystore.clone()))
                    .collect()
            }
            _ => Err(ValueError::Type(format!(
                "{:?} value is not a list",
                self.category
            ))),
        }
    }

    /// Canonical wrapped access to a map: values stay lazy and are not
    /// decrypted.
    pub fn as_any_value_map(&self) -> ValueResult<HashMap<String, AnyValue>> {
        match &self.repr {
            Repr::MapAny(entries) => Ok(entries.clone()),
            Repr::Eager(eager) => {
                let body = (eager.encode)(&eager.value, None)?;
                wrap_map_payload(&body, &element_wire_name(&self.wire_name), None)
            }
            Repr::Lazy(holder) => {
                let plain = holder.plaintext()?;
                wrap_map_payload(
                    plain,
                    &element_wire_name(&self.wire_name),
                    holder.keystore.clone(),
                )
            }
            _ => Err(ValueError::Type(format!(
                "{:?} value is not a map",
                self.category
            ))),
        }
    }

    /// Convert to JSON using the registered converter for this wire name,
    /// falling back to structural CBOR conversion.
    pub fn to_json(&self) -> ValueResult<serde_json::Value> {
        match &self.repr {
            Repr::Null => Ok(serde_json::Value::Null),
            Repr::ListAny(items) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.to_json())
                    .collect::<ValueResult<Vec<_>>>()?,
            )),
            Repr::MapAny(entries) => {
                let mut object = serde_json::Map::new();
                for (key, value) in entries {
                    object.insert(key.clone(), value.to_json()?);
                }
                Ok(serde_json::Value::Object(object))
            }
            Repr::Eager(eager) => {
                let body = (eager.encode)(&eager.value, None)?;
                self.body_to_json(&body)
            }
            Repr::Lazy(holder) => {
                let plain = holder.plaintext()?;
                self.body_to_json(plain)
            }
        }
    }

    fn body_to_json(&self, body: &[u8]) -> ValueResult<serde_json::Value> {
        if let Some(convert) = registry::get_json_converter_by_wire_name(&self.wire_name) {
            if let Ok(value) = convert(body) {
                return Ok(value);
            }
        }
        if self.category == ValueCategory::Bytes {
            return serde_json::to_value(body)
                .map_err(|e| ValueError::Type(format!("JSON conversion failed: {e}")));
        }
        let value: Cbor = ciborium::from_reader(body)?;
        registry::cbor_to_json(&value)
    }

    /// CBOR representation by the container-recurse rule: primitives as
    /// scalars, structs as objects, nested containers as arrays/objects.
    fn to_cbor_value(&self) -> ValueResult<Cbor> {
        match &self.repr {
            Repr::Null => Ok(Cbor::Null),
            Repr::ListAny(items) => Ok(Cbor::Array(
                items
                    .iter()
                    .map(|v| v.to_cbor_value())
                    .collect::<ValueResult<Vec<_>>>()?,
            )),
            Repr::MapAny(entries) => Ok(Cbor::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((Cbor::Text(k.clone()), v.to_cbor_value()?)))
                    .collect::<ValueResult<Vec<_>>>()?,
            )),
            Repr::Eager(eager) => {
                let body = (eager.encode)(&eager.value, None)?;
                if self.category == ValueCategory::Bytes {
                    Ok(Cbor::Bytes(body))
                } else {
                    Ok(ciborium::from_reader(body.as_slice())?)
                }
            }
            Repr::Lazy(holder) => {
                let plain = holder.plaintext()?;
                if self.category == ValueCategory::Bytes {
                    Ok(Cbor::Bytes(plain.to_vec()))
                } else {
                    Ok(ciborium::from_reader(plain)?)
                }
            }
        }
    }

    /// Encryptor registered for this value's type, if it can be applied
    /// element-wise.
    fn element_encryptor(&self) -> Option<registry::EncryptFn> {
        match &self.repr {
            Repr::Eager(_) => registry::lookup_encryptor_by_type_name(&self.wire_name),
            _ => None,
        }
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match &self.repr {
            Repr::Null => "null",
            Repr::Eager(_) => "eager",
            Repr::ListAny(_) => "list",
            Repr::MapAny(_) => "map",
            Repr::Lazy(_) => "lazy",
        };
        f.debug_struct("AnyValue")
            .field("category", &self.category)
            .field("type_name", &self.wire_name)
            .field("repr", &repr)
            .finish()
    }
}

// ── From impls ───────────────────────────────────────────────────────

macro_rules! impl_from_scalar {
    ($($t:ty => $name:expr),+ $(,)?) => {
        $(
            impl From<$t> for AnyValue {
                fn from(value: $t) -> Self {
                    AnyValue::scalar(value, $name)
                }
            }
        )+
    };
}

impl_from_scalar!(
    bool => "bool",
    i8 => "i8", i16 => "i16", i32 => "i32", i64 => "i64", i128 => "i128",
    u8 => "u8", u16 => "u16", u32 => "u32", u64 => "u64", u128 => "u128",
    f32 => "f32", f64 => "f64",
    char => "char",
);

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        AnyValue::scalar(value, "string")
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::scalar(value.to_string(), "string")
    }
}

impl From<Vec<u8>> for AnyValue {
    fn from(value: Vec<u8>) -> Self {
        AnyValue::bytes(value)
    }
}

impl From<serde_json::Value> for AnyValue {
    fn from(value: serde_json::Value) -> Self {
        AnyValue::json(value)
    }
}

// ── Encode functions captured by eager values ────────────────────────

fn downcast<T: Send + Sync + 'static>(value: &ArcAny) -> ValueResult<&T> {
    value.downcast_ref::<T>().ok_or_else(|| {
        ValueError::Type(format!("stored value is not a {}", type_name::<T>()))
    })
}

fn encode_cbor<T>(value: &ArcAny, _ctx: Option<&SerializationContext>) -> ValueResult<Vec<u8>>
where
    T: Serialize + Send + Sync + 'static,
{
    let mut out = Vec::new();
    ciborium::into_writer(downcast::<T>(value)?, &mut out)?;
    Ok(out)
}

fn encode_raw_bytes(
    value: &ArcAny,
    _ctx: Option<&SerializationContext>,
) -> ValueResult<Vec<u8>> {
    Ok(downcast::<Vec<u8>>(value)?.clone())
}

fn encode_struct<T>(value: &ArcAny, ctx: Option<&SerializationContext>) -> ValueResult<Vec<u8>>
where
    T: Serialize + Send + Sync + 'static,
{
    if let Some(ctx) = ctx {
        if let Some(wire) = registry::lookup_wire_name(type_name::<T>()) {
            if let Some(encrypt) = registry::lookup_encryptor_by_type_name(&wire) {
                return encrypt(value, ctx);
            }
        }
    }
    encode_cbor::<T>(value, None)
}

fn encode_list<T>(value: &ArcAny, ctx: Option<&SerializationContext>) -> ValueResult<Vec<u8>>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    if let Some(ctx) = ctx {
        if let Some(encrypt) = element_encryptor_for::<T>() {
            let items = downcast::<Vec<T>>(value)?;
            let mut blobs = Vec::with_capacity(items.len());
            for item in items {
                let erased: ArcAny = Arc::new(item.clone());
                blobs.push(Cbor::Bytes(encrypt(&erased, ctx)?));
            }
            let mut out = Vec::new();
            ciborium::into_writer(&Cbor::Array(blobs), &mut out)?;
            return Ok(out);
        }
    }
    encode_cbor::<Vec<T>>(value, None)
}

fn encode_map<T>(value: &ArcAny, ctx: Option<&SerializationContext>) -> ValueResult<Vec<u8>>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    if let Some(ctx) = ctx {
        if let Some(encrypt) = element_encryptor_for::<T>() {
            let entries = downcast::<HashMap<String, T>>(value)?;
            let mut pairs = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                let erased: ArcAny = Arc::new(item.clone());
                pairs.push((Cbor::Text(key.clone()), Cbor::Bytes(encrypt(&erased, ctx)?)));
            }
            let mut out = Vec::new();
            ciborium::into_writer(&Cbor::Map(pairs), &mut out)?;
            return Ok(out);
        }
    }
    encode_cbor::<HashMap<String, T>>(value, None)
}

fn element_encryptor_for<T: 'static>() -> Option<registry::EncryptFn> {
    let wire = registry::lookup_wire_name(type_name::<T>())?;
    registry::lookup_encryptor_by_type_name(&wire)
}

fn element_decryptor<T: 'static>() -> Option<registry::DecryptFn> {
    let wire = registry::lookup_wire_name(type_name::<T>())?;
    registry::lookup_decryptor_by_type_name(&wire)
}

/// Serialize a wrapped list by the container-recurse rule. With a context,
/// element-level encryption applies only when every element's type has a
/// registered encryptor; otherwise the container falls back to plain
/// element serialization.
fn encode_any_list(
    items: &[AnyValue],
    ctx: Option<&SerializationContext>,
) -> ValueResult<Vec<u8>> {
    if let Some(ctx) = ctx {
        let encryptors: Option<Vec<_>> =
            items.iter().map(|item| item.element_encryptor()).collect();
        if let (Some(encryptors), false) = (encryptors, items.is_empty()) {
            let mut blobs = Vec::with_capacity(items.len());
            for (item, encrypt) in items.iter().zip(encryptors) {
                let Repr::Eager(eager) = &item.repr else {
                    return Err(ValueError::Type(
                        "element encryption requires eager elements".into(),
                    ));
                };
                blobs.push(Cbor::Bytes(encrypt(&eager.value, ctx)?));
            }
            let mut out = Vec::new();
            ciborium::into_writer(&Cbor::Array(blobs), &mut out)?;
            return Ok(out);
        }
    }
    let values = items
        .iter()
        .map(|item| item.to_cbor_value())
        .collect::<ValueResult<Vec<_>>>()?;
    let mut out = Vec::new();
    ciborium::into_writer(&Cbor::Array(values), &mut out)?;
    Ok(out)
}

fn encode_any_map(
    entries: &HashMap<String, AnyValue>,
    ctx: Option<&SerializationContext>,
) -> ValueResult<Vec<u8>> {
    if let Some(ctx) = ctx {
        let encryptors: Option<Vec<_>> = entries
            .values()
            .map(|item| item.element_encryptor())
            .collect();
        if let (Some(encryptors), false) = (encryptors, entries.is_empty()) {
            let mut pairs = Vec::with_capacity(entries.len());
            for ((key, item), encrypt) in entries.iter().zip(encryptors) {
                let Repr::Eager(eager) = &item.repr else {
                    return Err(ValueError::Type(
                        "element encryption requires eager elements".into(),
                    ));
                };
                pairs.push((Cbor::Text(key.clone()), Cbor::Bytes(encrypt(&eager.value, ctx)?)));
            }
            let mut out = Vec::new();
            ciborium::into_writer(&Cbor::Map(pairs), &mut out)?;
            return Ok(out);
        }
    }
    let pairs = entries
        .iter()
        .map(|(key, item)| Ok((Cbor::Text(key.clone()), item.to_cbor_value()?)))
        .collect::<ValueResult<Vec<_>>>()?;
    let mut out = Vec::new();
    ciborium::into_writer(&Cbor::Map(pairs), &mut out)?;
    Ok(out)
}

/// Element type of a parameterised container name; `any` when unknown.
fn element_wire_name(container: &str) -> String {
    if let Some(inner) = container.strip_prefix("list<").and_then(|s| s.strip_suffix('>')) {
        return inner.to_string();
    }
    if let Some(inner) = container.strip_prefix("map<").and_then(|s| s.strip_suffix('>')) {
        if let Some((_key, value)) = inner.split_once(',') {
            return value.to_string();
        }
    }
    "any".to_string()
}

/// Wrap one decoded container element as an `AnyValue`, preserving lazy
/// semantics: the element is re-framed as its own payload slice and decoded
/// only when accessed. Encrypted element blobs stay sealed under the
/// element's wire name.
fn wrap_element(
    value: &Cbor,
    elem_wire: &str,
    keystore: Option<Arc<dyn EnvelopeCrypto>>,
) -> ValueResult<AnyValue> {
    let reencode = |value: &Cbor| -> ValueResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(value, &mut out)?;
        Ok(out)
    };

    let (category, wire_name, payload) = match value {
        Cbor::Null => return Ok(AnyValue::null()),
        Cbor::Bytes(b) if elem_wire == "bytes" || elem_wire == "any" => {
            return Ok(AnyValue::bytes(b.clone()))
        }
        // a per-element encrypted blob: keep it sealed under its wire name
        Cbor::Bytes(b) => (ValueCategory::Struct, elem_wire.to_string(), b.clone()),
        Cbor::Bool(_) => (ValueCategory::Primitive, "bool".to_string(), reencode(value)?),
        // bare integers default to i64
        Cbor::Integer(_) => (ValueCategory::Primitive, "i64".to_string(), reencode(value)?),
        Cbor::Float(_) => (ValueCategory::Primitive, "f64".to_string(), reencode(value)?),
        Cbor::Text(_) => (
            ValueCategory::Primitive,
            "string".to_string(),
            reencode(value)?,
        ),
        Cbor::Array(_) => (ValueCategory::List, "list<any>".to_string(), reencode(value)?),
        Cbor::Map(_) if elem_wire != "any" => {
            (ValueCategory::Struct, elem_wire.to_string(), reencode(value)?)
        }
        Cbor::Map(_) => (
            ValueCategory::Map,
            "map<string,any>".to_string(),
            reencode(value)?,
        ),
        _ => {
            return Err(ValueError::Type(
                "unsupported element shape in container".into(),
            ))
        }
    };
    Ok(AnyValue {
        category,
        wire_name: wire_name.clone(),
        repr: Repr::Lazy(Arc::new(LazyHolder::from_payload(
            &wire_name, payload, keystore,
        ))),
    })
}

fn wrap_map_payload(
    payload: &[u8],
    elem_wire: &str,
    keystore: Option<Arc<dyn EnvelopeCrypto>>,
) -> ValueResult<HashMap<String, AnyValue>> {
    let value: Cbor = ciborium::from_reader(payload)?;
    let Cbor::Map(pairs) = value else {
        return Err(ValueError::Type("payload is not a map".into()));
    };
    let mut out = HashMap::with_capacity(pairs.len());
    for (key, val) in &pairs {
        let Cbor::Text(key) = key else {
            return Err(ValueError::Type("map key is not a string".into()));
        };
        out.insert(key.clone(), wrap_element(val, elem_wire, keystore.clone())?);
    }
    Ok(out)
}

fn has_encrypted_field_shape(data: &[u8]) -> bool {
    let Ok(value) = ciborium::from_reader::<Cbor, _>(data) else {
        return false;
    };
    match value {
        Cbor::Map(entries) => entries
            .iter()
            .any(|(k, _)| matches!(k, Cbor::Text(t) if t.ends_with("_encrypted"))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support;
    use crate::seal::{open_label_group, seal_label_group, OpenFields, SealFields};
    use mycel_keys::{
        LabelKeyword, LabelResolver, LabelResolverConfig, LabelValue, MemoryKeystore,
    };
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        y: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserProfile {
        id: String,
        name: String,
        ssn: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserProfileSealed {
        id: String,
        name_encrypted: Vec<u8>,
        ssn_encrypted: Vec<u8>,
    }

    impl SealFields for UserProfile {
        type Sealed = UserProfileSealed;

        fn seal(
            &self,
            keystore: &dyn EnvelopeCrypto,
            resolver: &LabelResolver,
        ) -> ValueResult<UserProfileSealed> {
            Ok(UserProfileSealed {
                id: self.id.clone(),
                name_encrypted: seal_label_group(&self.name, "user", keystore, resolver)?,
                ssn_encrypted: seal_label_group(&self.ssn, "system", keystore, resolver)?,
            })
        }
    }

    impl OpenFields for UserProfileSealed {
        type Plain = UserProfile;

        fn open(&self, keystore: &dyn EnvelopeCrypto) -> ValueResult<UserProfile> {
            // unreadable labels degrade to the field default
            Ok(UserProfile {
                id: self.id.clone(),
                name: open_label_group(&self.name_encrypted, keystore).unwrap_or_default(),
                ssn: open_label_group(&self.ssn_encrypted, keystore).unwrap_or_default(),
            })
        }
    }

    fn test_context() -> (Arc<MemoryKeystore>, SerializationContext) {
        let keystore = Arc::new(MemoryKeystore::new());
        let mut config = LabelResolverConfig::default();
        config.label_mappings.insert(
            "user".to_string(),
            LabelValue {
                network_public_key: None,
                user_key_spec: Some(LabelKeyword::CurrentUser),
            },
        );
        config.label_mappings.insert(
            "system".to_string(),
            LabelValue {
                network_public_key: Some(vec![9u8; 32]),
                user_key_spec: None,
            },
        );
        let resolver = LabelResolver::new(&config, &[vec![1u8; 32]]).unwrap();
        let ctx = SerializationContext {
            keystore: keystore.clone(),
            resolver: Arc::new(resolver),
            network_public_key: Some(vec![9u8; 32]),
            profile_public_keys: vec![vec![1u8; 32]],
        };
        (keystore, ctx)
    }

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            name: format!("{id} name"),
            ssn: format!("{id}-123-45"),
        }
    }

    #[test]
    fn string_wire_layout() {
        let bytes = AnyValue::from("hello").serialize(None).unwrap();
        // cat=1, is_enc=0, tname_len=6, "string", then CBOR "hello"
        assert_eq!(
            &bytes[..9],
            &[0x01, 0x00, 0x06, b's', b't', b'r', b'i', b'n', b'g']
        );
        assert_eq!(bytes[9], 0x65);

        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(value.as_type::<String>().unwrap(), "hello");
    }

    #[test]
    fn null_round_trip() {
        let bytes = AnyValue::null().serialize(None).unwrap();
        assert_eq!(bytes, [0x00, 0x00, 0x04, b'n', b'u', b'l', b'l']);

        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn primitive_round_trips() {
        let bytes = AnyValue::from(42i64).serialize(None).unwrap();
        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(value.wire_name(), "i64");
        assert_eq!(value.as_type::<i64>().unwrap(), 42);

        let bytes = AnyValue::from(true).serialize(None).unwrap();
        assert!(AnyValue::deserialize(&bytes, None)
            .unwrap()
            .as_type::<bool>()
            .unwrap());

        let bytes = AnyValue::from(1.5f64).serialize(None).unwrap();
        assert_eq!(
            AnyValue::deserialize(&bytes, None)
                .unwrap()
                .as_type::<f64>()
                .unwrap(),
            1.5
        );

        let bytes = AnyValue::from('x').serialize(None).unwrap();
        assert_eq!(
            AnyValue::deserialize(&bytes, None)
                .unwrap()
                .as_type::<char>()
                .unwrap(),
            'x'
        );

        let bytes = AnyValue::from(7u32).serialize(None).unwrap();
        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(value.wire_name(), "u32");
        assert_eq!(value.as_type::<u32>().unwrap(), 7);
    }

    #[test]
    fn bytes_payload_is_raw() {
        let data = vec![0xDEu8, 0xAD, 0xBE, 0xEF];
        let bytes = AnyValue::bytes(data.clone()).serialize(None).unwrap();
        // header: cat=5, enc=0, len=5, "bytes", then the raw payload
        assert_eq!(&bytes[..3], &[0x05, 0x00, 0x05]);
        assert_eq!(&bytes[8..], data.as_slice());

        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(value.as_type::<Vec<u8>>().unwrap(), data);
    }

    #[test]
    fn json_round_trip() {
        let json = serde_json::json!({"name": "mycel", "port": 9000, "tags": ["p2p", "mesh"]});
        let bytes = AnyValue::json(json.clone()).serialize(None).unwrap();

        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(value.category(), ValueCategory::Json);
        assert_eq!(value.as_type::<serde_json::Value>().unwrap(), json);
    }

    #[test]
    fn list_round_trip() {
        let value = AnyValue::list(vec![1i64, 2, 3]);
        assert_eq!(value.wire_name(), "list<i64>");

        let bytes = value.serialize(None).unwrap();
        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.as_list::<i64>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn map_round_trip() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), "1".to_string());
        entries.insert("b".to_string(), "2".to_string());
        let value = AnyValue::map(entries.clone());
        assert_eq!(value.wire_name(), "map<string,string>");

        let bytes = value.serialize(None).unwrap();
        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.as_map::<String>().unwrap(), entries);
    }

    #[test]
    fn unregistered_struct_round_trip() {
        let _guard = test_support::registry_lock();
        let point = Point { x: 3, y: -4 };
        let value = AnyValue::strukt(point.clone());
        assert_eq!(value.wire_name(), "struct");

        let bytes = value.serialize(None).unwrap();
        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.as_type::<Point>().unwrap(), point);
    }

    #[test]
    fn wrapped_list_names_and_elements() {
        let homogeneous = AnyValue::from_any_list(vec![
            AnyValue::from("a"),
            AnyValue::from("b"),
        ]);
        assert_eq!(homogeneous.wire_name(), "list<string>");

        let mixed = AnyValue::from_any_list(vec![AnyValue::from("a"), AnyValue::from(1i64)]);
        assert_eq!(mixed.wire_name(), "list<any>");

        let bytes = mixed.serialize(None).unwrap();
        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        let elements = decoded.as_any_value_array().unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].as_type::<String>().unwrap(), "a");
        assert_eq!(elements[1].as_type::<i64>().unwrap(), 1);
    }

    #[test]
    fn wrapped_map_round_trip() {
        let mut entries = HashMap::new();
        entries.insert("name".to_string(), AnyValue::from("mycel"));
        entries.insert("port".to_string(), AnyValue::from(9000i64));
        let value = AnyValue::from_any_map(entries);

        let bytes = value.serialize(None).unwrap();
        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        let wrapped = decoded.as_any_value_map().unwrap();
        assert_eq!(wrapped["name"].as_type::<String>().unwrap(), "mycel");
        assert_eq!(wrapped["port"].as_type::<i64>().unwrap(), 9000);
    }

    #[test]
    fn context_envelopes_complex_categories_only() {
        let (_keystore, ctx) = test_context();

        let plain = AnyValue::from(5i64).serialize(Some(&ctx)).unwrap();
        assert_eq!(plain[1], 0); // primitives are never enveloped

        let raw = AnyValue::bytes(vec![1, 2]).serialize(Some(&ctx)).unwrap();
        assert_eq!(raw[1], 0);

        for value in [
            AnyValue::list(vec![1i64, 2]),
            AnyValue::json(serde_json::json!({"k": 1})),
            AnyValue::strukt(Point { x: 1, y: 2 }),
        ] {
            let bytes = value.serialize(Some(&ctx)).unwrap();
            assert_eq!(bytes[1], 1, "{} should be enveloped", value.wire_name());
        }
    }

    #[test]
    fn enveloped_round_trip() {
        let (keystore, ctx) = test_context();

        let bytes = AnyValue::list(vec![10i64, 20]).serialize(Some(&ctx)).unwrap();
        let decoded =
            AnyValue::deserialize(&bytes, Some(keystore.clone() as Arc<dyn EnvelopeCrypto>))
                .unwrap();
        assert_eq!(decoded.as_list::<i64>().unwrap(), vec![10, 20]);
    }

    #[test]
    fn encrypted_data_requires_keystore() {
        let (_keystore, ctx) = test_context();

        let bytes = AnyValue::strukt(Point { x: 1, y: 2 })
            .serialize(Some(&ctx))
            .unwrap();
        let err = AnyValue::deserialize(&bytes, None).unwrap_err();
        assert!(err
            .to_string()
            .contains("Data is encrypted but no keystore provided"));
    }

    #[test]
    fn lazy_struct_decrypts_once_on_first_access() {
        let (keystore, ctx) = test_context();

        let point = Point { x: 8, y: 9 };
        let bytes = AnyValue::strukt(point.clone()).serialize(Some(&ctx)).unwrap();

        let value =
            AnyValue::deserialize(&bytes, Some(keystore.clone() as Arc<dyn EnvelopeCrypto>))
                .unwrap();
        assert!(value.is_lazy());
        assert_eq!(keystore.decrypt_count(), 0);

        assert_eq!(value.as_type::<Point>().unwrap(), point);
        assert_eq!(keystore.decrypt_count(), 1);

        // plaintext and decoded value are memoised
        assert_eq!(value.as_type::<Point>().unwrap(), point);
        assert_eq!(keystore.decrypt_count(), 1);
    }

    #[test]
    fn sealed_struct_round_trip() {
        let _guard = test_support::registry_lock();
        registry::register_sealed::<UserProfile>("user_profile");

        let (keystore, ctx) = test_context();
        let original = profile("u1");

        let bytes = AnyValue::strukt(original.clone())
            .serialize(Some(&ctx))
            .unwrap();
        assert_eq!(bytes[0], 4); // Struct
        assert_eq!(bytes[1], 1); // enveloped
        assert_eq!(&bytes[3..3 + 12], b"user_profile");

        let value =
            AnyValue::deserialize(&bytes, Some(keystore.clone() as Arc<dyn EnvelopeCrypto>))
                .unwrap();
        assert_eq!(keystore.decrypt_count(), 0);

        let opened = value.as_type::<UserProfile>().unwrap();
        assert_eq!(opened, original);
        let after_first = keystore.decrypt_count();
        assert!(after_first >= 1);

        // second access comes from the decoded cache
        assert_eq!(value.as_type::<UserProfile>().unwrap(), original);
        assert_eq!(keystore.decrypt_count(), after_first);
    }

    #[test]
    fn sealed_struct_reads_as_companion() {
        let _guard = test_support::registry_lock();
        registry::register_sealed::<UserProfile>("user_profile");

        let (keystore, ctx) = test_context();
        let bytes = AnyValue::strukt(profile("u2"))
            .serialize(Some(&ctx))
            .unwrap();

        let value =
            AnyValue::deserialize(&bytes, Some(keystore as Arc<dyn EnvelopeCrypto>)).unwrap();
        let sealed = value.as_type::<UserProfileSealed>().unwrap();
        assert_eq!(sealed.id, "u2");
        assert!(!sealed.name_encrypted.is_empty());
    }

    #[test]
    fn plain_body_rejected_as_companion() {
        let _guard = test_support::registry_lock();
        registry::register_sealed::<UserProfile>("user_profile");

        // no context: the struct serializes as its plain CBOR body
        let bytes = AnyValue::strukt(profile("u3")).serialize(None).unwrap();
        assert_eq!(bytes[1], 0);

        let value = AnyValue::deserialize(&bytes, None).unwrap();
        let err = value.as_type::<UserProfileSealed>().unwrap_err();
        assert!(matches!(err, ValueError::InvalidTypeForPlainBody(_)));
    }

    #[test]
    fn element_encryption_in_lists() {
        let _guard = test_support::registry_lock();
        registry::register_sealed::<UserProfile>("user_profile");

        let (keystore, ctx) = test_context();
        let people = vec![profile("a"), profile("b")];

        let value = AnyValue::list(people.clone());
        assert_eq!(value.wire_name(), "list<user_profile>");

        let bytes = value.serialize(Some(&ctx)).unwrap();
        let decoded =
            AnyValue::deserialize(&bytes, Some(keystore.clone() as Arc<dyn EnvelopeCrypto>))
                .unwrap();

        // typed access decrypts each element
        assert_eq!(decoded.as_list::<UserProfile>().unwrap(), people);

        // wrapped access keeps the elements sealed until each is read
        let wrapped = decoded.as_any_value_array().unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[0].wire_name(), "user_profile");
        assert_eq!(wrapped[0].as_type::<UserProfile>().unwrap(), people[0]);
    }

    #[test]
    fn element_encryption_in_maps() {
        let _guard = test_support::registry_lock();
        registry::register_sealed::<UserProfile>("user_profile");

        let (keystore, ctx) = test_context();
        let mut people = HashMap::new();
        people.insert("first".to_string(), profile("a"));
        people.insert("second".to_string(), profile("b"));

        let bytes = AnyValue::map(people.clone()).serialize(Some(&ctx)).unwrap();
        let decoded =
            AnyValue::deserialize(&bytes, Some(keystore as Arc<dyn EnvelopeCrypto>)).unwrap();
        assert_eq!(decoded.as_map::<UserProfile>().unwrap(), people);
    }

    #[test]
    fn registered_struct_uses_its_wire_name() {
        let _guard = test_support::registry_lock();
        registry::register_struct::<Point>("point");

        let value = AnyValue::strukt(Point { x: 1, y: 2 });
        assert_eq!(value.wire_name(), "point");

        registry::clear_registry();
    }

    #[test]
    fn from_json_detection() {
        let value = AnyValue::from_json(serde_json::json!({
            "name": "mycel",
            "port": 9000,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": {"on": true}
        }));
        assert_eq!(value.category(), ValueCategory::Map);

        let entries = value.as_any_value_map().unwrap();
        assert_eq!(entries["name"].wire_name(), "string");
        assert_eq!(entries["port"].wire_name(), "i64");
        assert_eq!(entries["ratio"].wire_name(), "f64");
        assert_eq!(entries["tags"].category(), ValueCategory::List);
        assert_eq!(entries["nested"].category(), ValueCategory::Map);
    }

    #[test]
    fn to_json_conversions() {
        assert_eq!(AnyValue::null().to_json().unwrap(), serde_json::Value::Null);
        assert_eq!(
            AnyValue::from(3i64).to_json().unwrap(),
            serde_json::json!(3)
        );
        assert_eq!(
            AnyValue::list(vec![1i64, 2]).to_json().unwrap(),
            serde_json::json!([1, 2])
        );
        assert_eq!(
            AnyValue::strukt(Point { x: 1, y: 2 }).to_json().unwrap(),
            serde_json::json!({"x": 1, "y": 2})
        );
        assert_eq!(
            AnyValue::bytes(vec![1, 2, 3]).to_json().unwrap(),
            serde_json::json!([1, 2, 3])
        );
    }

    #[test]
    fn lazy_value_reserializes_unchanged() {
        let bytes = AnyValue::list(vec![1i64, 2, 3]).serialize(None).unwrap();
        let value = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(value.serialize(None).unwrap(), bytes);
    }

    #[test]
    fn eager_type_mismatch_is_an_error() {
        let value = AnyValue::from(1i64);
        let err = value.as_type::<String>().unwrap_err();
        assert!(matches!(err, ValueError::Type(_)));
    }
}
