use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::comm::peer::PeerHandle;
use crate::comm::schema::{FieldValue, MessageRegistry, MessageSchema, SchemaError, SchemaId};

/// A typed message envelope: a schema reference plus values for the schema's fields.
///
/// A message is created either by a sender (then it has no source) or by the decoder
///  from network bytes (then it carries the source peer). Once all fields are set it is
///  never mutated again, and it is garbage as soon as it has been delivered.
pub struct Message {
    schema: Arc<MessageSchema>,
    source: Option<PeerHandle>,
    fields: FxHashMap<String, FieldValue>,
    received_byte_count: usize,
    local_arrival: Instant,
}

impl Message {
    pub fn new(schema: &Arc<MessageSchema>) -> Message {
        Message {
            schema: schema.clone(),
            source: None,
            fields: FxHashMap::default(),
            received_byte_count: 0,
            local_arrival: Instant::now(),
        }
    }

    /// Decode a single message from raw network bytes.
    ///
    /// This is the untrusted path: any kind of malformed input - an unknown schema id,
    ///  an id resolving to an internal-only schema, a buffer that ends mid-field - is
    ///  logged and answered with `None`. Nothing a peer sends can surface an error to
    ///  the rest of the node.
    ///
    /// `received_byte_count` is the wire size including transport overhead, kept for
    ///  byte accounting when the message is eventually delivered.
    pub fn decode(
        registry: &MessageRegistry,
        mut buf: &[u8],
        source: Option<PeerHandle>,
        received_byte_count: usize,
    ) -> Option<Message> {
        let id = match buf.try_get_u32() {
            Ok(id) => SchemaId(id),
            Err(_) => {
                debug!("message too short for a schema id - discarding");
                return None;
            }
        };
        let Some(schema) = registry.lookup(id) else {
            debug!("unknown schema id {:?} - discarding", id);
            return None;
        };
        if schema.is_internal_only() {
            warn!(
                "received internal-only message {:?} from the network - discarding",
                schema.name()
            );
            return None;
        }

        let mut fields = FxHashMap::default();
        for (name, field_type) in schema.fields() {
            match FieldValue::try_deser(*field_type, &mut buf) {
                Ok(value) => {
                    fields.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!(
                        "message of schema {:?} from {:?} ends prematurely in field {:?}: {} - discarding",
                        schema.name(), source, name, e
                    );
                    return None;
                }
            }
        }
        if buf.has_remaining() {
            debug!(
                "{} trailing bytes after message of schema {:?} - ignoring them",
                buf.remaining(), schema.name()
            );
        }

        Some(Message {
            schema: schema.clone(),
            source,
            fields,
            received_byte_count,
            local_arrival: Instant::now(),
        })
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<(), SchemaError> {
        let value = value.into();
        let Some(expected) = self.schema.field_type(name) else {
            return Err(SchemaError::UndeclaredField {
                schema: self.schema.name().to_string(),
                field: name.to_string(),
            });
        };
        if value.field_type() != expected {
            return Err(SchemaError::TypeMismatch {
                schema: self.schema.name().to_string(),
                field: name.to_string(),
                expected,
                actual: value.field_type(),
            });
        }
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Write the wire representation: the 4-byte schema id followed by every declared
    ///  field in declaration order. There is no length prefix - the per-field codecs
    ///  are self-delimiting.
    pub fn encode(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        buf.put_u32(self.schema.id().0);
        for (name, _) in self.schema.fields() {
            let Some(value) = self.fields.get(name) else {
                return Err(SchemaError::FieldNotSet {
                    schema: self.schema.name().to_string(),
                    field: name.clone(),
                }
                .into());
            };
            value.ser(buf)?;
        }
        Ok(())
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    /// None means the message originated locally
    pub fn source(&self) -> Option<&PeerHandle> {
        self.source.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.fields.get(name) {
            Some(FieldValue::I32(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::I64(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.fields.get(name) {
            Some(FieldValue::F64(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.fields.get(name) {
            Some(FieldValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn received_byte_count(&self) -> usize {
        self.received_byte_count
    }

    pub fn local_arrival(&self) -> Instant {
        self.local_arrival
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.local_arrival)
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {{", self.schema.name())?;
        let mut comma = "";
        for (name, _) in self.schema.fields() {
            write!(f, "{}{}=", comma, name)?;
            match self.fields.get(name) {
                Some(value) => write!(f, "{:?}", value)?,
                None => write!(f, "<unset>")?,
            }
            comma = ", ";
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use crate::comm::schema::{FieldType, MessageSchema};
    use crate::test_util::test_peer_from_number;

    use super::*;

    fn test_registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register(
            MessageSchema::new("ping")
                .field("seq", FieldType::I32)
                .field("payload", FieldType::Bytes),
        ).unwrap();
        registry.register(
            MessageSchema::new("all_types")
                .field("flag", FieldType::Bool)
                .field("small", FieldType::I32)
                .field("big", FieldType::I64)
                .field("ratio", FieldType::F64)
                .field("label", FieldType::Str)
                .field("blob", FieldType::Bytes),
        ).unwrap();
        registry.register(MessageSchema::new("local_housekeeping").internal_only()).unwrap();
        registry
    }

    #[test]
    fn test_round_trip() {
        let registry = test_registry();
        let schema = registry.lookup(SchemaId::of_name("all_types")).unwrap();

        let mut m = Message::new(schema);
        m.set("flag", true).unwrap();
        m.set("small", -17).unwrap();
        m.set("big", 1i64 << 40).unwrap();
        m.set("ratio", 0.25).unwrap();
        m.set("label", "hello").unwrap();
        m.set("blob", vec![1u8, 2, 3]).unwrap();

        let mut buf = BytesMut::new();
        m.encode(&mut buf).unwrap();

        let peer = test_peer_from_number(1);
        let decoded = Message::decode(&registry, &buf, Some(peer.clone()), buf.len()).unwrap();

        assert!(Arc::ptr_eq(decoded.schema(), schema));
        assert_eq!(decoded.source(), Some(&peer));
        assert_eq!(decoded.get_bool("flag"), Some(true));
        assert_eq!(decoded.get_i32("small"), Some(-17));
        assert_eq!(decoded.get_i64("big"), Some(1i64 << 40));
        assert_eq!(decoded.get_f64("ratio"), Some(0.25));
        assert_eq!(decoded.get_str("label"), Some("hello"));
        assert_eq!(decoded.get_bytes("blob"), Some([1u8, 2, 3].as_slice()));
        assert_eq!(decoded.received_byte_count(), buf.len());
    }

    #[test]
    fn test_set_undeclared_field() {
        let registry = test_registry();
        let schema = registry.lookup(SchemaId::of_name("ping")).unwrap();

        let mut m = Message::new(schema);
        match m.set("nope", 1) {
            Err(SchemaError::UndeclaredField { field, .. }) => assert_eq!(field, "nope"),
            other => panic!("expected undeclared field error, got {:?}", other),
        }
    }

    #[test]
    fn test_set_type_mismatch() {
        let registry = test_registry();
        let schema = registry.lookup(SchemaId::of_name("ping")).unwrap();

        let mut m = Message::new(schema);
        match m.set("seq", "seven") {
            Err(SchemaError::TypeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, FieldType::I32);
                assert_eq!(actual, FieldType::Str);
            }
            other => panic!("expected type mismatch error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_with_unset_field() {
        let registry = test_registry();
        let schema = registry.lookup(SchemaId::of_name("ping")).unwrap();

        let mut m = Message::new(schema);
        m.set("seq", 7).unwrap();

        let mut buf = BytesMut::new();
        assert!(m.encode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_unknown_id_is_silent() {
        let registry = test_registry();
        let buf = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        assert!(Message::decode(&registry, &buf, None, buf.len()).is_none());
    }

    #[test]
    fn test_decode_internal_only_is_silent() {
        let registry = test_registry();

        let mut buf = BytesMut::new();
        buf.put_u32(SchemaId::of_name("local_housekeeping").0);
        assert!(Message::decode(&registry, &buf, None, buf.len()).is_none());
    }

    #[test]
    fn test_decode_truncated_is_silent() {
        let registry = test_registry();
        let schema = registry.lookup(SchemaId::of_name("ping")).unwrap();

        let mut m = Message::new(schema);
        m.set("seq", 7).unwrap();
        m.set("payload", vec![1u8; 64]).unwrap();

        let mut buf = BytesMut::new();
        m.encode(&mut buf).unwrap();

        for len in 0..buf.len() {
            assert!(
                Message::decode(&registry, &buf[..len], None, len).is_none(),
                "truncation to {} bytes should fail silently", len
            );
        }
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let registry = test_registry();
        let schema = registry.lookup(SchemaId::of_name("ping")).unwrap();

        let mut m = Message::new(schema);
        m.set("seq", 7).unwrap();
        m.set("payload", Vec::new()).unwrap();

        let mut buf = BytesMut::new();
        m.encode(&mut buf).unwrap();
        buf.put_slice(b"extra");

        let decoded = Message::decode(&registry, &buf, None, buf.len()).unwrap();
        assert_eq!(decoded.get_i32("seq"), Some(7));
    }
}
