//! Deserialization capability. The "specific vs generic" value-class choice
//! (§9 "Dynamic dispatch") is modeled as two concrete factories rather than a
//! runtime flag: the caller picks which one to hand to [`SchemaRegistry`] at
//! construction time, and the choice is then baked into that registry's
//! `V` for the lifetime of the consumer.

use crate::metadata::Schema;
use crate::model::CheckpointVector;
use std::sync::Arc;

/// Decodes bytes written against `writer_schema`, as `reader_schema`, into a
/// concrete `V`. Instances are schema-pair-specific and are cached by
/// [`SchemaRegistry`](crate::schema_registry::SchemaRegistry).
pub trait Deserializer<V>: Send + Sync {
    fn deserialize(&self, bytes: &[u8]) -> crate::Result<V>;
}

/// Builds a [`Deserializer<V>`] for a given writer/reader schema pair.
/// Implementations decide how `V` is actually produced: specific
/// (compile-time known struct, via `serde`) or generic (a dynamic document).
pub trait DeserializerFactory<V>: Send + Sync {
    fn create(&self, writer_schema: &Schema, reader_schema: &Schema) -> Arc<dyn Deserializer<V>>;
}

/// Records which deserializer family a [`SchemaRegistry`](crate::schema_registry::SchemaRegistry)
/// was built with. Purely informational (used in logging and diagnostics) —
/// the actual dispatch is static, resolved by which `DeserializerFactory<V>`
/// was supplied at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeserializerMode {
    Specific,
    Generic,
}

/// A `DeserializerFactory` that decodes directly into a compile-time known
/// `V: serde::de::DeserializeOwned` via a caller-supplied decode function.
/// Stands in for what upstream calls "specific" deserialization against a
/// generated class.
pub struct SpecificDeserializerFactory<V> {
    decode: Arc<dyn Fn(&Schema, &Schema, &[u8]) -> crate::Result<V> + Send + Sync>,
}

impl<V> SpecificDeserializerFactory<V> {
    pub fn new(decode: impl Fn(&Schema, &Schema, &[u8]) -> crate::Result<V> + Send + Sync + 'static) -> Self {
        Self {
            decode: Arc::new(decode),
        }
    }
}

impl<V: Send + Sync + 'static> DeserializerFactory<V> for SpecificDeserializerFactory<V> {
    fn create(&self, writer_schema: &Schema, reader_schema: &Schema) -> Arc<dyn Deserializer<V>> {
        Arc::new(SpecificDeserializer {
            writer_schema: writer_schema.clone(),
            reader_schema: reader_schema.clone(),
            decode: self.decode.clone(),
        })
    }
}

struct SpecificDeserializer<V> {
    writer_schema: Schema,
    reader_schema: Schema,
    decode: Arc<dyn Fn(&Schema, &Schema, &[u8]) -> crate::Result<V> + Send + Sync>,
}

impl<V: Send + Sync> Deserializer<V> for SpecificDeserializer<V> {
    fn deserialize(&self, bytes: &[u8]) -> crate::Result<V> {
        (self.decode)(&self.writer_schema, &self.reader_schema, bytes)
    }
}

/// A `DeserializerFactory<serde_json::Value>` that decodes into a dynamic
/// document without a compile-time schema — upstream's "generic record."
/// The wire layout itself is assumed given (§1); this stands in for whatever
/// self-describing decode the real payload format supports.
pub struct GenericDeserializerFactory {
    decode: Arc<dyn Fn(&[u8]) -> crate::Result<serde_json::Value> + Send + Sync>,
}

impl GenericDeserializerFactory {
    pub fn new(decode: impl Fn(&[u8]) -> crate::Result<serde_json::Value> + Send + Sync + 'static) -> Self {
        Self {
            decode: Arc::new(decode),
        }
    }
}

impl DeserializerFactory<serde_json::Value> for GenericDeserializerFactory {
    fn create(&self, _writer_schema: &Schema, _reader_schema: &Schema) -> Arc<dyn Deserializer<serde_json::Value>> {
        Arc::new(GenericDeserializer {
            decode: self.decode.clone(),
        })
    }
}

struct GenericDeserializer {
    decode: Arc<dyn Fn(&[u8]) -> crate::Result<serde_json::Value> + Send + Sync>,
}

impl Deserializer<serde_json::Value> for GenericDeserializer {
    fn deserialize(&self, bytes: &[u8]) -> crate::Result<serde_json::Value> {
        (self.decode)(bytes)
    }
}

/// The fully-decoded value of a change-capture topic envelope: both sides of
/// the mutation plus the checkpoint vector used for stale-record filtering.
/// This is the reader type the fixed `RecordChangeEvent` protocol schema
/// (§4.6) decodes into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordChangeEvent<V> {
    pub before: Option<V>,
    pub after: Option<V>,
    pub replication_checkpoint_vector: CheckpointVector,
}

/// Fixed schema id naming the `RecordChangeEvent` protocol schema. Not
/// resolved through `MetadataClient` — it is a constant of the change-capture
/// wire protocol itself, per §4.6 ("reader schema is the fixed
/// `RecordChangeEvent` protocol schema").
pub const RECORD_CHANGE_EVENT_SCHEMA_ID: crate::broker::SchemaId = -1;
