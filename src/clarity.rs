//! Clarity consensus value codec.
//!
//! Print events arrive as hex-serialized Clarity values; read-only calls and
//! contract-call payloads are built from the same wire form. The plain-JSON
//! projection flattens `{type,value}` shapes into what the rest of the node
//! works with: uints as decimal strings, buffers as hex, tuples as objects.

use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

use crate::address::PrincipalId;
use crate::error::WatchtowerError;

const TYPE_INT: u8 = 0x00;
const TYPE_UINT: u8 = 0x01;
const TYPE_BUFFER: u8 = 0x02;
const TYPE_BOOL_TRUE: u8 = 0x03;
const TYPE_BOOL_FALSE: u8 = 0x04;
const TYPE_PRINCIPAL_STANDARD: u8 = 0x05;
const TYPE_PRINCIPAL_CONTRACT: u8 = 0x06;
const TYPE_RESPONSE_OK: u8 = 0x07;
const TYPE_RESPONSE_ERR: u8 = 0x08;
const TYPE_OPTIONAL_NONE: u8 = 0x09;
const TYPE_OPTIONAL_SOME: u8 = 0x0a;
const TYPE_LIST: u8 = 0x0b;
const TYPE_TUPLE: u8 = 0x0c;
const TYPE_STRING_ASCII: u8 = 0x0d;
const TYPE_STRING_UTF8: u8 = 0x0e;

/// Nesting limit while deserializing untrusted payloads.
const MAX_DEPTH: usize = 64;

fn decode_err(msg: impl Into<String>) -> WatchtowerError {
    WatchtowerError::Ingest(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarityValue {
    Int(i128),
    UInt(u128),
    Buffer(Vec<u8>),
    Bool(bool),
    Principal(PrincipalId),
    ResponseOk(Box<ClarityValue>),
    ResponseErr(Box<ClarityValue>),
    OptionalNone,
    OptionalSome(Box<ClarityValue>),
    List(Vec<ClarityValue>),
    Tuple(BTreeMap<String, ClarityValue>),
    StringAscii(String),
    StringUtf8(String),
}

impl ClarityValue {
    pub fn some(value: ClarityValue) -> Self {
        ClarityValue::OptionalSome(Box::new(value))
    }

    pub fn optional(value: Option<ClarityValue>) -> Self {
        match value {
            Some(v) => ClarityValue::some(v),
            None => ClarityValue::OptionalNone,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        match self {
            ClarityValue::Int(v) => {
                out.push(TYPE_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ClarityValue::UInt(v) => {
                out.push(TYPE_UINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ClarityValue::Buffer(bytes) => {
                out.push(TYPE_BUFFER);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            ClarityValue::Bool(true) => out.push(TYPE_BOOL_TRUE),
            ClarityValue::Bool(false) => out.push(TYPE_BOOL_FALSE),
            ClarityValue::Principal(principal) => {
                out.extend_from_slice(&principal.serialize_clarity());
            }
            ClarityValue::ResponseOk(inner) => {
                out.push(TYPE_RESPONSE_OK);
                inner.serialize_into(out);
            }
            ClarityValue::ResponseErr(inner) => {
                out.push(TYPE_RESPONSE_ERR);
                inner.serialize_into(out);
            }
            ClarityValue::OptionalNone => out.push(TYPE_OPTIONAL_NONE),
            ClarityValue::OptionalSome(inner) => {
                out.push(TYPE_OPTIONAL_SOME);
                inner.serialize_into(out);
            }
            ClarityValue::List(items) => {
                out.push(TYPE_LIST);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.serialize_into(out);
                }
            }
            ClarityValue::Tuple(entries) => {
                out.push(TYPE_TUPLE);
                out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for (name, value) in entries {
                    out.push(name.len() as u8);
                    out.extend_from_slice(name.as_bytes());
                    value.serialize_into(out);
                }
            }
            ClarityValue::StringAscii(s) => {
                out.push(TYPE_STRING_ASCII);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            ClarityValue::StringUtf8(s) => {
                out.push(TYPE_STRING_UTF8);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.serialize()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WatchtowerError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let value = cursor.read_value(0)?;
        if cursor.pos != bytes.len() {
            return Err(decode_err(format!(
                "trailing bytes after clarity value: {} of {}",
                cursor.pos,
                bytes.len()
            )));
        }
        Ok(value)
    }

    pub fn from_hex(input: &str) -> Result<Self, WatchtowerError> {
        let stripped = input.strip_prefix("0x").unwrap_or(input);
        let bytes = hex::decode(stripped)
            .map_err(|e| decode_err(format!("invalid clarity hex: {e}")))?;
        Self::deserialize(&bytes)
    }

    /// Flatten to the plain JSON shape used across the node: uints and ints
    /// as decimal strings, buffers as `0x`-hex, `some`/`none` unwrapped.
    pub fn to_plain_json(&self) -> Json {
        match self {
            ClarityValue::Int(v) => json!(v.to_string()),
            ClarityValue::UInt(v) => json!(v.to_string()),
            ClarityValue::Buffer(bytes) => json!(format!("0x{}", hex::encode(bytes))),
            ClarityValue::Bool(b) => json!(b),
            ClarityValue::Principal(p) => json!(p.to_string()),
            ClarityValue::ResponseOk(inner) => json!({"ok": inner.to_plain_json()}),
            ClarityValue::ResponseErr(inner) => json!({"err": inner.to_plain_json()}),
            ClarityValue::OptionalNone => Json::Null,
            ClarityValue::OptionalSome(inner) => inner.to_plain_json(),
            ClarityValue::List(items) => {
                Json::Array(items.iter().map(|i| i.to_plain_json()).collect())
            }
            ClarityValue::Tuple(entries) => {
                let mut map = serde_json::Map::new();
                for (name, value) in entries {
                    map.insert(name.clone(), value.to_plain_json());
                }
                Json::Object(map)
            }
            ClarityValue::StringAscii(s) | ClarityValue::StringUtf8(s) => json!(s),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn read_u8(&mut self) -> Result<u8, WatchtowerError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| decode_err("unexpected end of clarity value"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_slice(&mut self, len: usize) -> Result<&[u8], WatchtowerError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| decode_err("clarity value length overruns payload"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, WatchtowerError> {
        let slice = self.read_slice(4)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn read_principal(&mut self, contract: bool) -> Result<PrincipalId, WatchtowerError> {
        let version = self.read_u8()?;
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(self.read_slice(20)?);
        let contract_name = if contract {
            let len = self.read_u8()? as usize;
            let raw = self.read_slice(len)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| decode_err("contract name is not utf8"))?;
            Some(name.to_string())
        } else {
            None
        };
        Ok(PrincipalId {
            version,
            hash160,
            contract_name,
        })
    }

    fn read_value(&mut self, depth: usize) -> Result<ClarityValue, WatchtowerError> {
        if depth > MAX_DEPTH {
            return Err(decode_err("clarity value nests too deeply"));
        }
        let tag = self.read_u8()?;
        let value = match tag {
            TYPE_INT => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(self.read_slice(16)?);
                ClarityValue::Int(i128::from_be_bytes(buf))
            }
            TYPE_UINT => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(self.read_slice(16)?);
                ClarityValue::UInt(u128::from_be_bytes(buf))
            }
            TYPE_BUFFER => {
                let len = self.read_u32()? as usize;
                ClarityValue::Buffer(self.read_slice(len)?.to_vec())
            }
            TYPE_BOOL_TRUE => ClarityValue::Bool(true),
            TYPE_BOOL_FALSE => ClarityValue::Bool(false),
            TYPE_PRINCIPAL_STANDARD => ClarityValue::Principal(self.read_principal(false)?),
            TYPE_PRINCIPAL_CONTRACT => ClarityValue::Principal(self.read_principal(true)?),
            TYPE_RESPONSE_OK => ClarityValue::ResponseOk(Box::new(self.read_value(depth + 1)?)),
            TYPE_RESPONSE_ERR => ClarityValue::ResponseErr(Box::new(self.read_value(depth + 1)?)),
            TYPE_OPTIONAL_NONE => ClarityValue::OptionalNone,
            TYPE_OPTIONAL_SOME => ClarityValue::OptionalSome(Box::new(self.read_value(depth + 1)?)),
            TYPE_LIST => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                ClarityValue::List(items)
            }
            TYPE_TUPLE => {
                let count = self.read_u32()? as usize;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let name_len = self.read_u8()? as usize;
                    let raw = self.read_slice(name_len)?;
                    let name = std::str::from_utf8(raw)
                        .map_err(|_| decode_err("tuple key is not utf8"))?
                        .to_string();
                    let value = self.read_value(depth + 1)?;
                    entries.insert(name, value);
                }
                ClarityValue::Tuple(entries)
            }
            TYPE_STRING_ASCII => {
                let len = self.read_u32()? as usize;
                let raw = self.read_slice(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| decode_err("string-ascii is not ascii"))?;
                if !s.is_ascii() {
                    return Err(decode_err("string-ascii contains non-ascii bytes"));
                }
                ClarityValue::StringAscii(s.to_string())
            }
            TYPE_STRING_UTF8 => {
                let len = self.read_u32()? as usize;
                let raw = self.read_slice(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| decode_err("string-utf8 is not utf8"))?;
                ClarityValue::StringUtf8(s.to_string())
            }
            other => {
                return Err(decode_err(format!("unknown clarity type tag 0x{other:02x}")));
            }
        };
        Ok(value)
    }
}
