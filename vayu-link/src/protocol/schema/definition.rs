//! Message definitions loaded from MAVLink XML
//!
//! Wire layout: base fields stably sorted by element size (largest first),
//! then extension fields in declaration order. All values little-endian.

use crate::core::types::FieldValue;
use crate::error::SchemaError;
use crate::protocol::frame::{Crc16, MAX_PAYLOAD_LEN};
use serde_json::{Map, Value};

/// Scalar element type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
}

impl PrimitiveType {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "char" => Self::Char,
            "int8_t" => Self::Int8,
            "uint8_t" | "uint8_t_mavlink_version" => Self::UInt8,
            "int16_t" => Self::Int16,
            "uint16_t" => Self::UInt16,
            "int32_t" => Self::Int32,
            "uint32_t" => Self::UInt32,
            "int64_t" => Self::Int64,
            "uint64_t" => Self::UInt64,
            "float" => Self::Float,
            "double" => Self::Double,
            _ => return None,
        })
    }

    /// Type name as it enters the CRC extra
    pub fn name(self) -> &'static str {
        match self {
            Self::Char => "char",
            Self::Int8 => "int8_t",
            Self::UInt8 => "uint8_t",
            Self::Int16 => "int16_t",
            Self::UInt16 => "uint16_t",
            Self::Int32 => "int32_t",
            Self::UInt32 => "uint32_t",
            Self::Int64 => "int64_t",
            Self::UInt64 => "uint64_t",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    /// Element size in bytes
    pub fn size(self) -> usize {
        match self {
            Self::Char | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double => 8,
        }
    }
}

/// One field of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: PrimitiveType,
    /// Element count for array fields
    pub array_len: Option<u8>,
    pub extension: bool,
    /// Byte offset in the (untruncated) payload
    pub offset: usize,
}

impl FieldDef {
    /// Parse `type` attribute values like `uint16_t`, `char[16]`, `float[4]`
    fn new(name: &str, type_str: &str, extension: bool) -> Result<Self, SchemaError> {
        let (base, array_len) = match type_str.split_once('[') {
            Some((base, rest)) => {
                let len = rest
                    .strip_suffix(']')
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| SchemaError::UnknownFieldType(type_str.to_string()))?;
                (base, Some(len))
            }
            None => (type_str, None),
        };
        let ty = PrimitiveType::from_name(base)
            .ok_or_else(|| SchemaError::UnknownFieldType(type_str.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            ty,
            array_len,
            extension,
            offset: 0,
        })
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.ty.size() * self.array_len.map_or(1, usize::from)
    }
}

/// One message of the runtime schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDef {
    pub id: u32,
    pub name: String,
    /// Declaration order, offsets filled in
    pub fields: Vec<FieldDef>,
    pub crc_extra: u8,
    /// Untruncated payload length, extensions included
    pub payload_len: usize,
}

impl MessageDef {
    /// Build from parsed fields (declaration order)
    pub fn new(id: u32, name: &str, mut fields: Vec<FieldDef>) -> Self {
        let mut wire: Vec<usize> = (0..fields.len()).filter(|&i| !fields[i].extension).collect();
        // Stable sort keeps declaration order among equal sizes.
        wire.sort_by(|&a, &b| fields[b].ty.size().cmp(&fields[a].ty.size()));

        let mut crc = Crc16::new();
        crc.accumulate_slice(name.as_bytes());
        crc.accumulate(b' ');
        for &i in &wire {
            let field = &fields[i];
            crc.accumulate_slice(field.ty.name().as_bytes());
            crc.accumulate(b' ');
            crc.accumulate_slice(field.name.as_bytes());
            crc.accumulate(b' ');
            if let Some(len) = field.array_len {
                crc.accumulate(len);
            }
        }
        let crc = crc.value();
        let crc_extra = ((crc & 0xFF) ^ (crc >> 8)) as u8;

        wire.extend((0..fields.len()).filter(|&i| fields[i].extension));

        let mut offset = 0;
        for &i in &wire {
            fields[i].offset = offset;
            offset += fields[i].size();
        }

        Self {
            id,
            name: name.to_string(),
            fields,
            crc_extra,
            payload_len: offset,
        }
    }

    /// Parse a `<message>` element
    pub(crate) fn from_xml(node: roxmltree::Node<'_, '_>) -> Result<Self, SchemaError> {
        let name = node
            .attribute("name")
            .ok_or_else(|| SchemaError::InvalidDefinition("message without name".to_string()))?;
        let id = node
            .attribute("id")
            .and_then(|id| id.trim().parse::<u32>().ok())
            .filter(|&id| id <= 0x00FF_FFFF)
            .ok_or_else(|| SchemaError::InvalidDefinition(format!("{}: invalid id", name)))?;

        let mut fields = Vec::new();
        let mut extension = false;
        for child in node.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "extensions" => extension = true,
                "field" => {
                    let (Some(type_str), Some(field_name)) =
                        (child.attribute("type"), child.attribute("name"))
                    else {
                        return Err(SchemaError::InvalidDefinition(format!(
                            "{}: field without type or name",
                            name
                        )));
                    };
                    fields.push(FieldDef::new(field_name, type_str, extension)?);
                }
                _ => {}
            }
        }

        if fields.is_empty() {
            return Err(SchemaError::InvalidDefinition(format!(
                "{}: no fields",
                name
            )));
        }

        let def = Self::new(id, name, fields);
        if def.payload_len > MAX_PAYLOAD_LEN {
            return Err(SchemaError::InvalidDefinition(format!(
                "{}: payload of {} bytes exceeds {}",
                name, def.payload_len, MAX_PAYLOAD_LEN
            )));
        }
        Ok(def)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `target_system` / `target_component` of a raw payload, 0 when absent
    pub fn target_ids(&self, payload: &[u8]) -> (u8, u8) {
        let read = |name: &str| {
            self.field(name)
                .filter(|f| f.ty.size() == 1 && f.array_len.is_none())
                .and_then(|f| payload.get(f.offset).copied())
                .unwrap_or(0)
        };
        (read("target_system"), read("target_component"))
    }

    /// Decode a payload into fields in declaration order
    ///
    /// Truncated payloads are zero-extended; bytes beyond the known fields
    /// are ignored.
    pub fn decode(&self, payload: &[u8]) -> Vec<(String, FieldValue)> {
        let mut full = vec![0u8; self.payload_len];
        let n = payload.len().min(self.payload_len);
        full[..n].copy_from_slice(&payload[..n]);

        self.fields
            .iter()
            .map(|field| {
                let bytes = &full[field.offset..field.offset + field.size()];
                (field.name.clone(), decode_field(field, bytes))
            })
            .collect()
    }

    /// Encode a JSON object into an untruncated payload
    ///
    /// Missing fields are zero. `null` is accepted for floats (NaN).
    pub fn encode(&self, values: &Map<String, Value>) -> Result<Vec<u8>, SchemaError> {
        let mut payload = vec![0u8; self.payload_len];
        for field in &self.fields {
            let Some(value) = values.get(&field.name) else {
                continue;
            };
            let out = &mut payload[field.offset..field.offset + field.size()];
            encode_field(field, value, out)?;
        }
        Ok(payload)
    }
}

fn decode_field(field: &FieldDef, bytes: &[u8]) -> FieldValue {
    let size = field.ty.size();
    match (field.ty, field.array_len) {
        (PrimitiveType::Char, Some(_)) => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            FieldValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        (ty, None) => scalar(ty, bytes),
        (ty, Some(_)) => {
            let elements = bytes.chunks_exact(size).map(|chunk| scalar(ty, chunk));
            match ty {
                PrimitiveType::Float | PrimitiveType::Double => FieldValue::FloatArray(
                    elements
                        .map(|v| match v {
                            FieldValue::Float(f) => Some(f),
                            _ => None,
                        })
                        .collect(),
                ),
                PrimitiveType::Int8
                | PrimitiveType::Int16
                | PrimitiveType::Int32
                | PrimitiveType::Int64 => FieldValue::IntArray(
                    elements
                        .filter_map(|v| match v {
                            FieldValue::Int(i) => Some(i),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => FieldValue::UIntArray(elements.filter_map(|v| v.as_u64()).collect()),
            }
        }
    }
}

fn scalar(ty: PrimitiveType, b: &[u8]) -> FieldValue {
    match ty {
        PrimitiveType::Char | PrimitiveType::UInt8 => FieldValue::UInt(b[0] as u64),
        PrimitiveType::Int8 => FieldValue::Int(b[0] as i8 as i64),
        PrimitiveType::Int16 => FieldValue::Int(i16::from_le_bytes([b[0], b[1]]) as i64),
        PrimitiveType::UInt16 => FieldValue::UInt(u16::from_le_bytes([b[0], b[1]]) as u64),
        PrimitiveType::Int32 => {
            FieldValue::Int(i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
        }
        PrimitiveType::UInt32 => {
            FieldValue::UInt(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
        }
        PrimitiveType::Int64 => FieldValue::Int(i64::from_le_bytes(eight(b))),
        PrimitiveType::UInt64 => FieldValue::UInt(u64::from_le_bytes(eight(b))),
        PrimitiveType::Float => {
            FieldValue::from_float(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
        }
        PrimitiveType::Double => FieldValue::from_float(f64::from_le_bytes(eight(b))),
    }
}

fn eight(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

fn encode_field(field: &FieldDef, value: &Value, out: &mut [u8]) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidFieldValue {
        field: field.name.clone(),
        reason: reason.to_string(),
    };

    match (field.ty, field.array_len, value) {
        (PrimitiveType::Char, Some(len), Value::String(s)) => {
            let bytes = s.as_bytes();
            if bytes.len() > len as usize {
                return Err(invalid("string too long"));
            }
            out[..bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        (ty, Some(len), Value::Array(items)) => {
            if items.len() > len as usize {
                return Err(invalid("too many elements"));
            }
            let size = ty.size();
            for (item, slot) in items.iter().zip(out.chunks_exact_mut(size)) {
                encode_scalar(ty, item, slot).map_err(|reason| invalid(reason))?;
            }
            Ok(())
        }
        (_, Some(_), _) => Err(invalid("expected array")),
        (ty, None, value) => encode_scalar(ty, value, out).map_err(|reason| invalid(reason)),
    }
}

fn encode_scalar(ty: PrimitiveType, value: &Value, out: &mut [u8]) -> Result<(), &'static str> {
    macro_rules! int {
        ($t:ty) => {{
            let v: $t = if let Some(v) = value.as_i64() {
                <$t>::try_from(v).map_err(|_| "out of range")?
            } else if let Some(v) = value.as_u64() {
                <$t>::try_from(v).map_err(|_| "out of range")?
            } else {
                return Err("expected integer");
            };
            out.copy_from_slice(&v.to_le_bytes());
        }};
    }

    match ty {
        PrimitiveType::Char | PrimitiveType::UInt8 => int!(u8),
        PrimitiveType::Int8 => int!(i8),
        PrimitiveType::Int16 => int!(i16),
        PrimitiveType::UInt16 => int!(u16),
        PrimitiveType::Int32 => int!(i32),
        PrimitiveType::UInt32 => int!(u32),
        PrimitiveType::Int64 => int!(i64),
        PrimitiveType::UInt64 => int!(u64),
        PrimitiveType::Float => {
            let v = float_value(value)? as f32;
            out.copy_from_slice(&v.to_le_bytes());
        }
        PrimitiveType::Double => {
            let v = float_value(value)?;
            out.copy_from_slice(&v.to_le_bytes());
        }
    }
    Ok(())
}

fn float_value(value: &Value) -> Result<f64, &'static str> {
    match value {
        Value::Null => Ok(f64::NAN),
        v => v.as_f64().ok_or("expected number"),
    }
}
