//! Fixed wire header for serialized values.
//!
//! Layout: `[category u8][is_encrypted u8][type_name_len u8][type_name][payload]`
//!
//! All integers are little-endian; the three header integers are single
//! bytes, so the layout is endian-free in practice. A null value carries the
//! type name `"null"` and an empty payload.

use crate::error::{ValueError, ValueResult};

/// Category byte of a wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueCategory {
    Null = 0,
    Primitive = 1,
    List = 2,
    Map = 3,
    Struct = 4,
    Bytes = 5,
    Json = 6,
}

impl ValueCategory {
    /// Whether this category may carry an outer encryption envelope.
    pub fn supports_envelope(&self) -> bool {
        matches!(
            self,
            ValueCategory::List | ValueCategory::Map | ValueCategory::Struct | ValueCategory::Json
        )
    }
}

impl From<ValueCategory> for u8 {
    fn from(c: ValueCategory) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for ValueCategory {
    type Error = ValueError;
    fn try_from(v: u8) -> Result<Self, ValueError> {
        match v {
            0 => Ok(Self::Null),
            1 => Ok(Self::Primitive),
            2 => Ok(Self::List),
            3 => Ok(Self::Map),
            4 => Ok(Self::Struct),
            5 => Ok(Self::Bytes),
            6 => Ok(Self::Json),
            _ => Err(ValueError::Wire(format!("unknown category byte 0x{v:02x}"))),
        }
    }
}

/// Parsed wire header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    pub category: ValueCategory,
    pub is_encrypted: bool,
    pub type_name: String,
    /// Offset of the payload in the buffer the header was parsed from.
    pub payload_start: usize,
}

/// Append a wire header to `out`.
pub fn encode_header(
    out: &mut Vec<u8>,
    category: ValueCategory,
    is_encrypted: bool,
    type_name: &str,
) -> ValueResult<()> {
    let name = type_name.as_bytes();
    if name.len() > u8::MAX as usize {
        return Err(ValueError::Wire(format!(
            "type name '{type_name}' exceeds 255 bytes"
        )));
    }
    out.push(category as u8);
    out.push(is_encrypted as u8);
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    Ok(())
}

/// Parse the header at the front of `data`.
pub fn parse_header(data: &[u8]) -> ValueResult<WireHeader> {
    if data.len() < 3 {
        return Err(ValueError::Wire(format!(
            "header too short: {} bytes",
            data.len()
        )));
    }
    let category = ValueCategory::try_from(data[0])?;
    let is_encrypted = match data[1] {
        0 => false,
        1 => true,
        v => {
            return Err(ValueError::Wire(format!(
                "invalid encryption flag 0x{v:02x}"
            )))
        }
    };
    let name_len = data[2] as usize;
    if data.len() < 3 + name_len {
        return Err(ValueError::Wire(format!(
            "type name length {name_len} exceeds remaining {} bytes",
            data.len() - 3
        )));
    }
    let type_name = std::str::from_utf8(&data[3..3 + name_len])
        .map_err(|_| ValueError::Wire("type name is not valid UTF-8".into()))?
        .to_string();
    Ok(WireHeader {
        category,
        is_encrypted,
        type_name,
        payload_start: 3 + name_len,
    })
}
