use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use crc::Crc;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// The closed set of field types the wire codec supports. Every field of every schema
///  has one of these types; there is no extension mechanism, by intent - new structured
///  data means a new field of an existing type, not a new codec.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FieldType {
    Bool,
    I32,
    I64,
    F64,
    Str,
    Bytes,
}

/// A typed field value. All wire encodings are big-endian and self-delimiting: there is
///  no per-message length prefix, so a decoder must be able to tell where each field
///  ends from the field alone.
#[derive(Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::I32(_) => FieldType::I32,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::F64(_) => FieldType::F64,
            FieldValue::Str(_) => FieldType::Str,
            FieldValue::Bytes(_) => FieldType::Bytes,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            FieldValue::Bool(b) => buf.put_u8(u8::from(*b)),
            FieldValue::I32(n) => buf.put_i32(*n),
            FieldValue::I64(n) => buf.put_i64(*n),
            FieldValue::F64(x) => buf.put_f64(*x),
            FieldValue::Str(s) => {
                let len: u16 = s.len().try_into()
                    .map_err(|_| anyhow!("string field exceeds wire size limit: {} bytes", s.len()))?;
                buf.put_u16(len);
                buf.put_slice(s.as_bytes());
            }
            FieldValue::Bytes(b) => {
                let len: u32 = b.len().try_into()
                    .map_err(|_| anyhow!("byte field exceeds wire size limit: {} bytes", b.len()))?;
                buf.put_u32(len);
                buf.put_slice(b);
            }
        }
        Ok(())
    }

    pub fn try_deser(field_type: FieldType, buf: &mut impl Buf) -> anyhow::Result<FieldValue> {
        let value = match field_type {
            FieldType::Bool => match buf.try_get_u8()? {
                0 => FieldValue::Bool(false),
                1 => FieldValue::Bool(true),
                n => return Err(anyhow!("invalid boolean encoding: {}", n)),
            },
            FieldType::I32 => FieldValue::I32(buf.try_get_i32()?),
            FieldType::I64 => FieldValue::I64(buf.try_get_i64()?),
            FieldType::F64 => FieldValue::F64(buf.try_get_f64()?),
            FieldType::Str => {
                let len = buf.try_get_u16()? as usize;
                if buf.remaining() < len {
                    return Err(anyhow!("string field truncated"));
                }
                let raw = buf.copy_to_bytes(len);
                FieldValue::Str(String::from_utf8(raw.to_vec())?)
            }
            FieldType::Bytes => {
                let len = buf.try_get_u32()? as usize;
                if buf.remaining() < len {
                    return Err(anyhow!("byte field truncated"));
                }
                FieldValue::Bytes(buf.copy_to_bytes(len).to_vec())
            }
        };
        Ok(value)
    }
}

impl Debug for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::I32(n) => write!(f, "{}", n),
            FieldValue::I64(n) => write!(f, "{}", n),
            FieldValue::F64(x) => write!(f, "{}", x),
            FieldValue::Str(s) => write!(f, "{:?}", s),
            FieldValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}
impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::I32(value)
    }
}
impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}
impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::F64(value)
    }
}
impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}
impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

const SCHEMA_ID_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// A [SchemaId] is the first four bytes of every encoded message, identifying the schema
///  for deserialization and dispatch on the receiving side. It is a hash of the schema
///  name, so the name itself never travels on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SchemaId(pub u32);

impl SchemaId {
    pub fn of_name(name: &str) -> SchemaId {
        SchemaId(SCHEMA_ID_CRC.checksum(name.as_bytes()))
    }
}
impl Debug for SchemaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema {name:?} is already registered")]
    DuplicateName { name: String },
    #[error("schema {new:?} hashes to the same id as already-registered {existing:?}")]
    IdCollision { new: String, existing: String },
    #[error("field {field:?} is not declared in schema {schema:?}")]
    UndeclaredField { schema: String, field: String },
    #[error("field {field:?} of schema {schema:?} is declared {expected:?}, got {actual:?}")]
    TypeMismatch {
        schema: String,
        field: String,
        expected: FieldType,
        actual: FieldType,
    },
    #[error("field {field:?} of schema {schema:?} is not set")]
    FieldNotSet { schema: String, field: String },
}

/// Named, versioned-by-name description of a message's typed fields. Field order is
///  significant: it is the wire order.
#[derive(Debug)]
pub struct MessageSchema {
    name: String,
    id: SchemaId,
    fields: Vec<(String, FieldType)>,
    internal_only: bool,
    priority: u8,
    lossy: bool,
}

impl MessageSchema {
    pub const DEFAULT_PRIORITY: u8 = 3;

    pub fn new(name: impl Into<String>) -> MessageSchema {
        let name = name.into();
        let id = SchemaId::of_name(&name);
        MessageSchema {
            name,
            id,
            fields: Vec::new(),
            internal_only: false,
            priority: Self::DEFAULT_PRIORITY,
            lossy: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> MessageSchema {
        let name = name.into();
        assert!(
            !self.fields.iter().any(|(n, _)| n == &name),
            "duplicate field {:?} in schema {:?}", name, self.name
        );
        self.fields.push((name, field_type));
        self
    }

    /// messages of this schema exist only inside the node and are never accepted from
    ///  the network
    pub fn internal_only(mut self) -> MessageSchema {
        self.internal_only = true;
        self
    }

    /// messages of this schema may be dropped under load without breaking the protocol
    pub fn lossy(mut self) -> MessageSchema {
        self.lossy = true;
        self
    }

    /// lower is more urgent
    pub fn priority(mut self, priority: u8) -> MessageSchema {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn fields(&self) -> &[(String, FieldType)] {
        &self.fields
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    pub fn is_internal_only(&self) -> bool {
        self.internal_only
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    pub fn get_priority(&self) -> u8 {
        self.priority
    }
}

/// Registry of all schemas a node speaks. Callers build it once during startup and
///  share it read-only afterwards; there is deliberately no process-global instance.
#[derive(Default)]
pub struct MessageRegistry {
    by_id: FxHashMap<SchemaId, Arc<MessageSchema>>,
}

impl MessageRegistry {
    pub fn new() -> MessageRegistry {
        Default::default()
    }

    pub fn register(&mut self, schema: MessageSchema) -> Result<Arc<MessageSchema>, SchemaError> {
        if let Some(existing) = self.by_id.get(&schema.id) {
            return if existing.name == schema.name {
                Err(SchemaError::DuplicateName { name: schema.name })
            } else {
                Err(SchemaError::IdCollision {
                    new: schema.name,
                    existing: existing.name.clone(),
                })
            };
        }
        let schema = Arc::new(schema);
        self.by_id.insert(schema.id, schema.clone());
        Ok(schema)
    }

    pub fn lookup(&self, id: SchemaId) -> Option<&Arc<MessageSchema>> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::bool_true(FieldValue::Bool(true), b"\x01".as_slice())]
    #[case::bool_false(FieldValue::Bool(false), b"\x00".as_slice())]
    #[case::i32(FieldValue::I32(0x01020304), b"\x01\x02\x03\x04".as_slice())]
    #[case::i32_negative(FieldValue::I32(-1), b"\xff\xff\xff\xff".as_slice())]
    #[case::i64(FieldValue::I64(1), b"\0\0\0\0\0\0\0\x01".as_slice())]
    #[case::f64(FieldValue::F64(1.0), b"\x3f\xf0\0\0\0\0\0\0".as_slice())]
    #[case::str(FieldValue::Str("ab".to_string()), b"\0\x02ab".as_slice())]
    #[case::str_empty(FieldValue::Str("".to_string()), b"\0\0".as_slice())]
    #[case::bytes(FieldValue::Bytes(vec![9, 8]), b"\0\0\0\x02\x09\x08".as_slice())]
    fn test_field_value_ser(#[case] value: FieldValue, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        value.ser(&mut buf).unwrap();
        assert_eq!(&buf, expected);

        let mut read_back = &buf[..];
        let actual = FieldValue::try_deser(value.field_type(), &mut read_back).unwrap();
        assert_eq!(actual, value);
        assert!(read_back.is_empty());
    }

    #[rstest]
    #[case::bool_empty(FieldType::Bool, b"".as_slice())]
    #[case::bool_invalid(FieldType::Bool, b"\x02".as_slice())]
    #[case::i32_short(FieldType::I32, b"\x01\x02".as_slice())]
    #[case::str_truncated_body(FieldType::Str, b"\0\x05ab".as_slice())]
    #[case::str_invalid_utf8(FieldType::Str, b"\0\x02\xff\xff".as_slice())]
    #[case::bytes_truncated(FieldType::Bytes, b"\0\0\0\x09ab".as_slice())]
    fn test_field_value_deser_malformed(#[case] field_type: FieldType, #[case] mut buf: &[u8]) {
        assert!(FieldValue::try_deser(field_type, &mut buf).is_err());
    }

    #[test]
    fn test_schema_id_of_name() {
        assert_eq!(SchemaId::of_name("ping"), SchemaId::of_name("ping"));
        assert_ne!(SchemaId::of_name("ping"), SchemaId::of_name("pong"));
    }

    #[test]
    fn test_registry_duplicate_name() {
        let mut registry = MessageRegistry::new();
        registry.register(MessageSchema::new("ping").field("seq", FieldType::I32)).unwrap();

        match registry.register(MessageSchema::new("ping")) {
            Err(SchemaError::DuplicateName { name }) => assert_eq!(name, "ping"),
            other => panic!("expected duplicate name error, got {:?}", other.map(|s| s.name().to_string())),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = MessageRegistry::new();
        let ping = registry.register(MessageSchema::new("ping")).unwrap();

        assert!(Arc::ptr_eq(registry.lookup(ping.id()).unwrap(), &ping));
        assert!(registry.lookup(SchemaId::of_name("pong")).is_none());
    }

    #[test]
    fn test_schema_accessors() {
        let schema = MessageSchema::new("probe")
            .field("uid", FieldType::I64)
            .field("htl", FieldType::I32)
            .internal_only()
            .lossy()
            .priority(1);

        assert_eq!(schema.name(), "probe");
        assert_eq!(schema.field_type("uid"), Some(FieldType::I64));
        assert_eq!(schema.field_type("nope"), None);
        assert!(schema.is_internal_only());
        assert!(schema.is_lossy());
        assert_eq!(schema.get_priority(), 1);
        assert_eq!(schema.fields().len(), 2);
    }
}
