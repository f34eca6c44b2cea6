//! Caches key/value/replication-metadata schemas and resolves deserializers
//! by schema id, read-through against a [`MetadataClient`]. Schemas are
//! cached for the consumer's lifetime; deserializers are cached per
//! (writer, reader) schema id pair, mirroring the keyed-cache-behind-a-lock
//! shape `gazette::router::Router` uses for its dialed channel cache.

use crate::broker::SchemaId;
use crate::deserializer::{Deserializer, DeserializerFactory, DeserializerMode, RecordChangeEvent};
use crate::metadata::{MetadataClient, Schema};
use crate::model::{CheckpointVector, StoreName};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Decodes a replication metadata payload, read against the schema named by
/// its `replication_metadata_version_id`, into the checkpoint vector used for
/// stale-record filtering (§4.4). The wire layout is assumed given (§1); this
/// crate only needs the decoded component vector.
pub type RmdDecodeFn = dyn Fn(&Schema, &[u8]) -> crate::Result<CheckpointVector> + Send + Sync;

pub struct SchemaRegistry<M, V> {
    store: StoreName,
    metadata: Arc<M>,
    value_factory: Arc<dyn DeserializerFactory<V>>,
    change_event_factory: Arc<dyn DeserializerFactory<RecordChangeEvent<V>>>,
    rmd_decode: Arc<RmdDecodeFn>,
    mode: DeserializerMode,

    key_schema: RwLock<Option<Schema>>,
    value_schemas: RwLock<HashMap<SchemaId, Schema>>,
    rmd_schemas: RwLock<HashMap<i32, Schema>>,
    deserializers: RwLock<HashMap<(SchemaId, SchemaId), Arc<dyn Deserializer<V>>>>,
    change_event_deserializer: RwLock<Option<Arc<dyn Deserializer<RecordChangeEvent<V>>>>>,
    change_event_schema: Schema,
}

impl<M, V> SchemaRegistry<M, V>
where
    M: MetadataClient,
    V: Send + Sync + 'static,
{
    pub fn new(
        store: StoreName,
        metadata: Arc<M>,
        mode: DeserializerMode,
        value_factory: Arc<dyn DeserializerFactory<V>>,
        change_event_factory: Arc<dyn DeserializerFactory<RecordChangeEvent<V>>>,
        rmd_decode: Arc<RmdDecodeFn>,
    ) -> Self {
        Self {
            store,
            metadata,
            value_factory,
            change_event_factory,
            rmd_decode,
            mode,
            key_schema: RwLock::new(None),
            value_schemas: RwLock::new(HashMap::new()),
            rmd_schemas: RwLock::new(HashMap::new()),
            deserializers: RwLock::new(HashMap::new()),
            change_event_deserializer: RwLock::new(None),
            // Fixed protocol schema shared by all change-capture topics;
            // not fetched from MetadataClient (§4.6).
            change_event_schema: Schema::new(serde_json::json!({
                "type": "record",
                "name": "RecordChangeEvent",
            })),
        }
    }

    pub fn mode(&self) -> DeserializerMode {
        self.mode
    }

    pub async fn key_schema(&self) -> crate::Result<Schema> {
        if let Some(schema) = self.key_schema.read().unwrap().clone() {
            return Ok(schema);
        }
        let schema = self
            .metadata
            .get_key_schema(&self.store)
            .await
            .map_err(|e| wrap_metadata_error(&self.store, e))?;
        *self.key_schema.write().unwrap() = Some(schema.clone());
        Ok(schema)
    }

    pub async fn value_schema(&self, schema_id: SchemaId) -> crate::Result<Schema> {
        if let Some(schema) = self.value_schemas.read().unwrap().get(&schema_id).cloned() {
            return Ok(schema);
        }
        let schema = self
            .metadata
            .get_value_schema(&self.store, schema_id)
            .await
            .map_err(|e| wrap_metadata_error(&self.store, e))?;
        self.value_schemas
            .write()
            .unwrap()
            .insert(schema_id, schema.clone());
        Ok(schema)
    }

    pub async fn latest_value_schema_id(&self) -> crate::Result<SchemaId> {
        self.metadata
            .latest_value_schema_id(&self.store)
            .await
            .map_err(|e| wrap_metadata_error(&self.store, e))
    }

    pub async fn replication_metadata_schema(&self, rmd_id: i32) -> crate::Result<Schema> {
        if let Some(schema) = self.rmd_schemas.read().unwrap().get(&rmd_id).cloned() {
            return Ok(schema);
        }
        let schema = self
            .metadata
            .get_replication_metadata_schema(&self.store, rmd_id)
            .await
            .map_err(|e| wrap_metadata_error(&self.store, e))?;
        self.rmd_schemas.write().unwrap().insert(rmd_id, schema.clone());
        Ok(schema)
    }

    /// Resolves (and caches) the deserializer decoding a value written
    /// against `writer_schema_id`, read as `reader_schema_id`.
    pub async fn deserializer(
        &self,
        writer_schema_id: SchemaId,
        reader_schema_id: SchemaId,
    ) -> crate::Result<Arc<dyn Deserializer<V>>> {
        let key = (writer_schema_id, reader_schema_id);
        if let Some(d) = self.deserializers.read().unwrap().get(&key).cloned() {
            return Ok(d);
        }
        let writer_schema = self.value_schema(writer_schema_id).await?;
        let reader_schema = self.value_schema(reader_schema_id).await?;
        let deserializer = self.value_factory.create(&writer_schema, &reader_schema);
        self.deserializers
            .write()
            .unwrap()
            .insert(key, deserializer.clone());
        Ok(deserializer)
    }

    /// Decodes `payload` (written under `rmd_id`) into the checkpoint vector
    /// used for stale-record filtering, fetching and caching the replication
    /// metadata schema as needed.
    pub async fn decode_replication_metadata(
        &self,
        rmd_id: i32,
        payload: &[u8],
    ) -> crate::Result<CheckpointVector> {
        let schema = self.replication_metadata_schema(rmd_id).await?;
        (self.rmd_decode)(&schema, payload)
    }

    /// Resolves (and caches) the deserializer for change-capture topic
    /// envelopes, which always read against the fixed `RecordChangeEvent`
    /// protocol schema regardless of which value schema ids it embeds.
    pub fn change_event_deserializer(&self) -> Arc<dyn Deserializer<RecordChangeEvent<V>>> {
        if let Some(d) = self.change_event_deserializer.read().unwrap().clone() {
            return d;
        }
        let d = self
            .change_event_factory
            .create(&self.change_event_schema, &self.change_event_schema);
        *self.change_event_deserializer.write().unwrap() = Some(d.clone());
        d
    }
}

fn wrap_metadata_error<E: std::error::Error + Send + Sync + 'static>(
    store: &StoreName,
    source: E,
) -> crate::Error {
    crate::Error::MetadataUnreachable {
        store: store.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserializer::SpecificDeserializerFactory;
    use crate::metadata::{CompressionMode, StoreInfo, VersionInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("fake metadata error")]
    struct FakeError;

    struct CountingMetadata {
        value_schema_calls: AtomicUsize,
    }

    impl MetadataClient for CountingMetadata {
        type Error = FakeError;

        async fn get_store(&self, _store: &StoreName) -> Result<StoreInfo, Self::Error> {
            Ok(StoreInfo {
                current_version: 1,
                partition_count: 1,
                versions: vec![VersionInfo {
                    version: 1,
                    compression: CompressionMode::None,
                }],
            })
        }

        async fn get_key_schema(&self, _store: &StoreName) -> Result<Schema, Self::Error> {
            Ok(Schema::new(serde_json::json!({"type": "string"})))
        }

        async fn get_value_schema(&self, _store: &StoreName, _schema_id: SchemaId) -> Result<Schema, Self::Error> {
            self.value_schema_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Schema::new(serde_json::json!({"type": "string"})))
        }

        async fn latest_value_schema_id(&self, _store: &StoreName) -> Result<SchemaId, Self::Error> {
            Ok(1)
        }

        async fn get_replication_metadata_schema(
            &self,
            _store: &StoreName,
            _rmd_id: i32,
        ) -> Result<Schema, Self::Error> {
            Ok(Schema::new(serde_json::json!({"type": "array"})))
        }
    }

    fn registry(metadata: Arc<CountingMetadata>) -> SchemaRegistry<CountingMetadata, String> {
        SchemaRegistry::new(
            StoreName("s".to_string()),
            metadata,
            DeserializerMode::Specific,
            Arc::new(SpecificDeserializerFactory::new(|_w, _r, bytes| {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            })),
            Arc::new(SpecificDeserializerFactory::new(|_w, _r, _bytes| {
                Ok(RecordChangeEvent {
                    before: None,
                    after: None,
                    replication_checkpoint_vector: CheckpointVector::default(),
                })
            })),
            Arc::new(|_schema, _bytes| Ok(CheckpointVector::default())),
        )
    }

    #[tokio::test]
    async fn value_schema_is_fetched_once_and_cached() {
        let metadata = Arc::new(CountingMetadata {
            value_schema_calls: AtomicUsize::new(0),
        });
        let registry = registry(metadata.clone());

        registry.value_schema(7).await.unwrap();
        registry.value_schema(7).await.unwrap();
        registry.value_schema(8).await.unwrap();

        assert_eq!(metadata.value_schema_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn change_event_deserializer_is_fixed_regardless_of_value_schema_id() {
        let metadata = Arc::new(CountingMetadata {
            value_schema_calls: AtomicUsize::new(0),
        });
        let registry = registry(metadata);
        let first = registry.change_event_deserializer();
        let second = registry.change_event_deserializer();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
