//! Value transcoding: the extensible serializer for state mappings.
//!
//! The base set (null, bool, integer, float, string, sequence, mapping)
//! maps directly onto canonical JSON. Custom values ride through the tree
//! as [`Value::Custom`] nodes and serialize as the two-field envelope
//! `{"_type_": name, "_data_": base}`, recursively.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sequent_types::{Extension, StateMap, Value};
use uuid::Uuid;

use crate::CodecError;

const TYPE_KEY: &str = "_type_";
const DATA_KEY: &str = "_data_";

//─────────────────────────────
//  Transcoding trait
//─────────────────────────────

/// A named codec for one custom value type.
///
/// Encode turns the concrete value into a base-representable [`Value`];
/// decode reverses it, returning a [`Value::Custom`] node of the same
/// concrete type.
pub trait Transcoding: Send + Sync {
    /// Unique short name, stored on the wire.
    fn name(&self) -> &str;

    /// The concrete Rust type this transcoding handles.
    fn handled_type(&self) -> TypeId;

    /// Rust type name, for error messages only.
    fn type_name(&self) -> &str;

    /// Encode the custom value into base-representable form.
    fn encode(&self, value: &dyn Extension) -> Result<Value, CodecError>;

    /// Decode base-representable form back into the custom value.
    fn decode(&self, data: &Value) -> Result<Value, CodecError>;
}

//─────────────────────────────
//  Built-in transcodings
//─────────────────────────────

/// Transcoding for [`uuid::Uuid`] values, encoded as 32-char hex.
pub struct UuidTranscoding;

impl Transcoding for UuidTranscoding {
    fn name(&self) -> &str {
        "uuid_hex"
    }

    fn handled_type(&self) -> TypeId {
        TypeId::of::<Uuid>()
    }

    fn type_name(&self) -> &str {
        "uuid::Uuid"
    }

    fn encode(&self, value: &dyn Extension) -> Result<Value, CodecError> {
        let id = downcast::<Uuid>(value, self.type_name())?;
        Ok(Value::Str(id.simple().to_string()))
    }

    fn decode(&self, data: &Value) -> Result<Value, CodecError> {
        let text = data
            .as_str()
            .ok_or_else(|| CodecError::Integrity("uuid_hex data is not a string".into()))?;
        let id = Uuid::parse_str(text)
            .map_err(|e| CodecError::Integrity(format!("invalid uuid_hex value: {e}")))?;
        Ok(Value::custom(id))
    }
}

/// Transcoding for [`chrono::DateTime<Utc>`] values, encoded as RFC 3339
/// with nanosecond precision.
pub struct TimestampTranscoding;

impl Transcoding for TimestampTranscoding {
    fn name(&self) -> &str {
        "datetime_iso"
    }

    fn handled_type(&self) -> TypeId {
        TypeId::of::<DateTime<Utc>>()
    }

    fn type_name(&self) -> &str {
        "chrono::DateTime<Utc>"
    }

    fn encode(&self, value: &dyn Extension) -> Result<Value, CodecError> {
        let ts = downcast::<DateTime<Utc>>(value, self.type_name())?;
        Ok(Value::Str(ts.to_rfc3339_opts(SecondsFormat::Nanos, true)))
    }

    fn decode(&self, data: &Value) -> Result<Value, CodecError> {
        let text = data
            .as_str()
            .ok_or_else(|| CodecError::Integrity("datetime_iso data is not a string".into()))?;
        let ts = DateTime::parse_from_rfc3339(text)
            .map_err(|e| CodecError::Integrity(format!("invalid datetime_iso value: {e}")))?;
        Ok(Value::custom(ts.with_timezone(&Utc)))
    }
}

fn downcast<'a, T: Extension>(
    value: &'a dyn Extension,
    type_name: &str,
) -> Result<&'a T, CodecError> {
    value
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::UnsupportedType {
            type_name: type_name.to_owned(),
        })
}

//─────────────────────────────
//  Transcoder
//─────────────────────────────

/// Builder collecting transcodings before the registry is frozen.
#[derive(Default)]
pub struct TranscoderBuilder {
    transcodings: Vec<Arc<dyn Transcoding>>,
}

impl TranscoderBuilder {
    /// Start with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transcoding. Later registrations win on name or type
    /// collisions.
    pub fn register(mut self, transcoding: impl Transcoding + 'static) -> Self {
        self.transcodings.push(Arc::new(transcoding));
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> Transcoder {
        let mut by_name = HashMap::new();
        let mut by_type = HashMap::new();
        for t in self.transcodings {
            by_name.insert(t.name().to_owned(), Arc::clone(&t));
            by_type.insert(t.handled_type(), t);
        }
        Transcoder { by_name, by_type }
    }
}

/// Serializes value trees to canonical bytes and back, resolving custom
/// nodes through the registered transcodings.
///
/// Immutable after construction; share behind an `Arc`.
pub struct Transcoder {
    by_name: HashMap<String, Arc<dyn Transcoding>>,
    by_type: HashMap<TypeId, Arc<dyn Transcoding>>,
}

impl Transcoder {
    /// A transcoder with the built-in transcodings (`uuid_hex`,
    /// `datetime_iso`) registered.
    pub fn with_defaults() -> Self {
        TranscoderBuilder::new()
            .register(UuidTranscoding)
            .register(TimestampTranscoding)
            .build()
    }

    /// Encode a value tree to canonical bytes.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let wire = self.to_wire(value)?;
        serde_json::to_vec(&wire).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Decode canonical bytes back into a value tree.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let wire: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::Integrity(format!("malformed state payload: {e}")))?;
        self.from_wire(&wire)
    }

    fn to_wire(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Int(i) => Ok(serde_json::Value::from(*i)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    CodecError::Serialization("non-finite float in state mapping".into())
                }),
            Value::Str(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Seq(items) => {
                let out: Result<Vec<_>, _> = items.iter().map(|v| self.to_wire(v)).collect();
                Ok(serde_json::Value::Array(out?))
            }
            Value::Map(map) => {
                if is_envelope_shaped(map) {
                    return Err(CodecError::ReservedEnvelope);
                }
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.to_wire(v)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Value::Custom(ext) => {
                let transcoding = self
                    .by_type
                    .get(&ext.as_any().type_id())
                    .ok_or_else(|| CodecError::UnsupportedType {
                        type_name: format!("{ext:?}"),
                    })?;
                let data = transcoding.encode(ext.as_ref())?;
                let mut envelope = serde_json::Map::with_capacity(2);
                envelope.insert(
                    TYPE_KEY.to_owned(),
                    serde_json::Value::String(transcoding.name().to_owned()),
                );
                envelope.insert(DATA_KEY.to_owned(), self.to_wire(&data)?);
                Ok(serde_json::Value::Object(envelope))
            }
        }
    }

    fn from_wire(&self, wire: &serde_json::Value) -> Result<Value, CodecError> {
        match wire {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(CodecError::Integrity(format!("unrepresentable number {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Array(items) => {
                let out: Result<Vec<_>, _> = items.iter().map(|v| self.from_wire(v)).collect();
                Ok(Value::Seq(out?))
            }
            serde_json::Value::Object(obj) => {
                if obj.len() == 2 && obj.contains_key(TYPE_KEY) && obj.contains_key(DATA_KEY) {
                    let name = obj[TYPE_KEY].as_str().ok_or_else(|| {
                        CodecError::Integrity("transcoding envelope name is not a string".into())
                    })?;
                    let transcoding = self.by_name.get(name).ok_or_else(|| {
                        CodecError::UnknownTranscoding { name: name.to_owned() }
                    })?;
                    let data = self.from_wire(&obj[DATA_KEY])?;
                    return transcoding.decode(&data);
                }
                let mut out = StateMap::new();
                for (k, v) in obj {
                    out.insert(k.clone(), self.from_wire(v)?);
                }
                Ok(Value::Map(out))
            }
        }
    }
}

fn is_envelope_shaped(map: &StateMap) -> bool {
    map.len() == 2 && map.contains_key(TYPE_KEY) && map.contains_key(DATA_KEY)
}
