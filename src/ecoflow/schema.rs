//! Static field tables describing the `pdata` payloads, and the tag-driven
//! codec that turns payload bytes into named values.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};

use super::units::{self, Converter, NormalizationRule};
use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Int,
    UInt,
    Float,
    Bool,
    Enum,
    Text,
    Bytes,
    Message(Arc<PayloadSchema>),
}

impl FieldKind {
    fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldKind::Int | FieldKind::UInt | FieldKind::Float | FieldKind::Bool | FieldKind::Enum
        )
    }
}

/// One field of a payload plus the metadata used when it is published.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub tag: u32,
    pub name: String,
    pub kind: FieldKind,
    pub repeated: bool,
    pub unit: Option<String>,
    pub divisor: Option<u32>,
    pub converter: Option<Converter>,
    pub settable: bool,
    pub display_name: Option<String>,
    /// Owning node; fields without one are decoded but never published.
    pub node: Option<String>,
    /// Explicit property id, otherwise derived from the name.
    pub id: Option<String>,
}

impl FieldDescriptor {
    pub fn new(tag: u32, name: &str, kind: FieldKind) -> Self {
        Self {
            tag,
            name: name.to_string(),
            kind,
            repeated: false,
            unit: None,
            divisor: None,
            converter: None,
            settable: false,
            display_name: None,
            node: None,
            id: None,
        }
    }

    pub fn node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn divisor(mut self, divisor: u32) -> Self {
        self.divisor = Some(divisor.max(1));
        self
    }

    pub fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    /// Name-derived normalization with this descriptor's static metadata on top.
    pub fn rule(&self) -> NormalizationRule {
        let mut rule = units::resolve(&self.name).with_overrides(self.unit.as_deref(), self.divisor);
        if let Some(converter) = self.converter {
            rule.converter = converter;
        }
        rule
    }

    /// Published datatype is float whenever the raw value gets divided.
    pub fn is_float(&self) -> bool {
        self.kind == FieldKind::Float || self.rule().divisor > 1
    }

    pub fn property_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => property_id(&self.name),
        }
    }
}

/// `pv1InputWatts` → `pv1-input-watts`, `bmsMaster.soc` → `bms-master-soc`
pub fn property_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !id.ends_with('-') {
                id.push('-');
            }
            id.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() {
            id.push(c);
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    id.trim_matches('-').to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    pub name: String,
    pub node_type: String,
    pub retain: bool,
}

impl NodeSpec {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            node_type: id.to_string(),
            retain: true,
        }
    }

    pub fn no_retain(mut self) -> Self {
        self.retain = false;
        self
    }
}

/// A published property computed as the sum of other fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFieldSpec {
    pub name: String,
    pub node: String,
    pub sources: Vec<String>,
    pub unit: String,
    pub display_name: Option<String>,
}

impl DerivedFieldSpec {
    pub fn sum(name: &str, node: &str, sources: &[&str], unit: &str) -> Self {
        Self {
            name: name.to_string(),
            node: node.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            unit: unit.to_string(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PayloadSchema {
    pub name: String,
    pub fields: Vec<Arc<FieldDescriptor>>,
    pub nodes: Vec<NodeSpec>,
    pub derived: Vec<DerivedFieldSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Message(Vec<DecodedField>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Named member of a nested message.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Message(fields) => find(fields, name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub descriptor: Arc<FieldDescriptor>,
    pub value: Value,
}

pub fn find<'a>(fields: &'a [DecodedField], name: &str) -> Option<&'a Value> {
    fields
        .iter()
        .find(|f| f.descriptor.name == name)
        .map(|f| &f.value)
}

impl PayloadSchema {
    pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            fields: fields.into_iter().map(Arc::new).collect(),
            nodes: Vec::new(),
            derived: Vec::new(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeSpec>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_derived(mut self, derived: Vec<DerivedFieldSpec>) -> Self {
        self.derived = derived;
        self
    }

    pub fn field(&self, name: &str) -> Option<&Arc<FieldDescriptor>> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_by_tag(&self, tag: u32) -> Option<&Arc<FieldDescriptor>> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    /// Decode payload bytes. Unknown tags are skipped; for singular fields the
    /// last occurrence wins.
    pub fn decode(&self, mut buf: &[u8]) -> Result<Vec<DecodedField>, DecodeError> {
        let mut out: Vec<DecodedField> = Vec::new();
        while buf.has_remaining() {
            let (tag, wire_type) =
                decode_key(&mut buf).map_err(|source| DecodeError::Field { tag: 0, source })?;
            let Some(descriptor) = self.field_by_tag(tag) else {
                skip_field(tag, wire_type, &mut buf)?;
                continue;
            };
            let values = read_values(descriptor, wire_type, &mut buf)?;
            let existing = out.iter_mut().find(|f| f.descriptor.tag == tag);
            if descriptor.repeated {
                match existing {
                    Some(DecodedField {
                        value: Value::List(items),
                        ..
                    }) => items.extend(values),
                    _ => out.push(DecodedField {
                        descriptor: descriptor.clone(),
                        value: Value::List(values),
                    }),
                }
            } else if let Some(value) = values.into_iter().last() {
                match existing {
                    Some(field) => field.value = value,
                    None => out.push(DecodedField {
                        descriptor: descriptor.clone(),
                        value,
                    }),
                }
            }
        }
        Ok(out)
    }

    /// Encode named values; names this schema doesn't know are ignored.
    pub fn encode(&self, values: &[(&str, Value)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (name, value) in values {
            if let Some(descriptor) = self.field(name) {
                write_value(descriptor, value, &mut buf);
            }
        }
        buf
    }
}

fn read_values(
    descriptor: &FieldDescriptor,
    wire_type: WireType,
    buf: &mut &[u8],
) -> Result<Vec<Value>, DecodeError> {
    let tag = descriptor.tag;
    match (wire_type, &descriptor.kind) {
        (WireType::Varint, kind) if kind.is_numeric() && *kind != FieldKind::Float => {
            let raw = decode_varint(buf).map_err(|source| DecodeError::Field { tag, source })?;
            Ok(vec![varint_value(kind, raw)])
        }
        (WireType::ThirtyTwoBit, FieldKind::Float) => {
            if buf.remaining() < 4 {
                return Err(DecodeError::Truncated { tag });
            }
            Ok(vec![Value::Float(buf.get_f32_le() as f64)])
        }
        (WireType::LengthDelimited, kind) => {
            let mut chunk = take_chunk(tag, buf)?;
            match kind {
                FieldKind::Text => Ok(vec![Value::Text(
                    String::from_utf8_lossy(chunk).into_owned(),
                )]),
                FieldKind::Bytes => Ok(vec![Value::Bytes(chunk.to_vec())]),
                FieldKind::Message(schema) => Ok(vec![Value::Message(schema.decode(chunk)?)]),
                FieldKind::Float => {
                    let mut items = Vec::with_capacity(chunk.len() / 4);
                    while chunk.remaining() >= 4 {
                        items.push(Value::Float(chunk.get_f32_le() as f64));
                    }
                    Ok(items)
                }
                // packed scalars
                kind => {
                    let mut items = Vec::new();
                    while chunk.has_remaining() {
                        let raw = decode_varint(&mut chunk)
                            .map_err(|source| DecodeError::Field { tag, source })?;
                        items.push(varint_value(kind, raw));
                    }
                    Ok(items)
                }
            }
        }
        (wire_type, _) => Err(DecodeError::WireType {
            tag,
            wire_type: wire_type as u8,
        }),
    }
}

fn varint_value(kind: &FieldKind, raw: u64) -> Value {
    match kind {
        FieldKind::Bool => Value::Bool(raw != 0),
        FieldKind::UInt => Value::Int(raw as u32 as i64),
        // int32 and enums are sign-extended on the wire
        _ => Value::Int(raw as i32 as i64),
    }
}

fn take_chunk<'a>(tag: u32, buf: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let len = decode_varint(buf).map_err(|source| DecodeError::Field { tag, source })? as usize;
    if buf.len() < len {
        return Err(DecodeError::Truncated { tag });
    }
    let (chunk, rest) = buf.split_at(len);
    *buf = rest;
    Ok(chunk)
}

fn skip_field(tag: u32, wire_type: WireType, buf: &mut &[u8]) -> Result<(), DecodeError> {
    let len = match wire_type {
        WireType::Varint => {
            decode_varint(buf).map_err(|source| DecodeError::Field { tag, source })?;
            return Ok(());
        }
        WireType::SixtyFourBit => 8,
        WireType::ThirtyTwoBit => 4,
        WireType::LengthDelimited => {
            take_chunk(tag, buf)?;
            return Ok(());
        }
        other => {
            return Err(DecodeError::WireType {
                tag,
                wire_type: other as u8,
            });
        }
    };
    if buf.remaining() < len {
        return Err(DecodeError::Truncated { tag });
    }
    buf.advance(len);
    Ok(())
}

fn write_value(descriptor: &FieldDescriptor, value: &Value, buf: &mut Vec<u8>) {
    let tag = descriptor.tag;
    match (&descriptor.kind, value) {
        (_, Value::List(items)) => {
            for item in items {
                write_value(descriptor, item, buf);
            }
        }
        (FieldKind::Float, v) => {
            let f = match v {
                Value::Float(f) => *f,
                Value::Int(i) => *i as f64,
                _ => return,
            };
            encode_key(tag, WireType::ThirtyTwoBit, buf);
            buf.put_f32_le(f as f32);
        }
        (FieldKind::Message(schema), Value::Message(fields)) => {
            let pairs: Vec<(&str, Value)> = fields
                .iter()
                .map(|f| (f.descriptor.name.as_str(), f.value.clone()))
                .collect();
            let nested = schema.encode(&pairs);
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(nested.len() as u64, buf);
            buf.extend_from_slice(&nested);
        }
        (FieldKind::Text, Value::Text(s)) => {
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(s.len() as u64, buf);
            buf.extend_from_slice(s.as_bytes());
        }
        (FieldKind::Bytes, Value::Bytes(b)) => {
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(b.len() as u64, buf);
            buf.extend_from_slice(b);
        }
        (FieldKind::UInt, Value::Int(v)) => {
            encode_key(tag, WireType::Varint, buf);
            encode_varint(*v as u32 as u64, buf);
        }
        (FieldKind::Int | FieldKind::Enum, Value::Int(v)) => {
            encode_key(tag, WireType::Varint, buf);
            encode_varint(*v as i32 as i64 as u64, buf);
        }
        (FieldKind::Bool, v) => {
            if let Some(v) = v.as_i64() {
                encode_key(tag, WireType::Varint, buf);
                encode_varint((v != 0) as u64, buf);
            }
        }
        _ => {}
    }
}

/// Payload schemas keyed by (function code, command code).
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(u32, u32), Arc<PayloadSchema>>,
}

impl SchemaRegistry {
    pub fn register(&mut self, cmd_func: u32, cmd_ids: &[u32], schema: &Arc<PayloadSchema>) {
        for &cmd_id in cmd_ids {
            self.schemas.insert((cmd_func, cmd_id), schema.clone());
        }
    }

    pub fn lookup(&self, cmd_func: u32, cmd_id: u32) -> Option<&Arc<PayloadSchema>> {
        self.schemas.get(&(cmd_func, cmd_id))
    }
}
