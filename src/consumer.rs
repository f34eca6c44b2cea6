//! The core poll loop and version-switch state machine (§4.6). Owns the
//! schema registry, chunk assembler, coordinate tracker, and topic manager;
//! `poll` is the only place all four collaborate in one call.

use crate::broker::{
    ControlMessage, DataRecord, MessageValue, PubSubConsumer, CHUNK_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID,
    EARLIEST_OFFSET,
};
use crate::chunk::ChunkAssembler;
use crate::compressor::{CompressorRegistry, DictionaryReader, NoopCompressor};
use crate::config::ConsumerConfig;
use crate::coordinate::CoordinateTracker;
use crate::deserializer::{DeserializerFactory, RecordChangeEvent};
use crate::error::Partition;
use crate::metadata::MetadataClient;
use crate::model::{is_change_capture_topic, ChangeEvent, CheckpointVector, Coordinate};
use crate::schema_registry::{RmdDecodeFn, SchemaRegistry};
use crate::topic_manager::{broker_err, version_from_topic, TopicPartitionManager};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A decoded change event with a raw, undecoded key: this crate treats key
/// bytes as opaque (the control-plane key schema exists for callers that
/// need it, but no operation in §4 or §6 decodes a key on the hot path).
pub type Event<V> = ChangeEvent<Vec<u8>, V>;

pub struct ChangeConsumer<V, P, M, D> {
    config: ConsumerConfig,
    broker: Arc<P>,
    registry: SchemaRegistry<M, V>,
    topics: TopicPartitionManager<P, M, D>,
    assembler: Mutex<ChunkAssembler>,
    coordinates: Mutex<CoordinateTracker>,
    last_offsets: Mutex<HashMap<Partition, (String, i64)>>,
}

impl<V, P, M, D> ChangeConsumer<V, P, M, D>
where
    V: Send + Sync + 'static,
    P: PubSubConsumer,
    M: MetadataClient,
    D: DictionaryReader,
{
    pub fn new(
        config: ConsumerConfig,
        broker: Arc<P>,
        metadata: Arc<M>,
        dictionary_reader: Arc<D>,
        value_factory: Arc<dyn DeserializerFactory<V>>,
        change_event_factory: Arc<dyn DeserializerFactory<RecordChangeEvent<V>>>,
        rmd_decode: Arc<RmdDecodeFn>,
    ) -> Self {
        let compressors = Arc::new(CompressorRegistry::new(dictionary_reader));
        let topics = TopicPartitionManager::new(
            config.store_name.clone(),
            config.change_capture_topic_suffix.clone(),
            broker.clone(),
            metadata.clone(),
            compressors,
        );
        let registry = SchemaRegistry::new(
            config.store_name.clone(),
            metadata,
            config.deserializer_mode,
            value_factory,
            change_event_factory,
            rmd_decode,
        );
        Self {
            config,
            broker,
            registry,
            topics,
            assembler: Mutex::new(ChunkAssembler::new()),
            coordinates: Mutex::new(CoordinateTracker::new()),
            last_offsets: Mutex::new(HashMap::new()),
        }
    }

    pub fn partition_count(&self) -> i32 {
        self.config.partition_count
    }

    pub async fn subscribe(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.subscribe(partitions, None).await?;
        self.reset_coordinates(partitions);
        Ok(())
    }

    pub async fn subscribe_all(&self) -> crate::Result<()> {
        self.topics.subscribe_all(self.config.partition_count).await?;
        let partitions: Vec<Partition> = (0..self.config.partition_count).collect();
        self.reset_coordinates(&partitions);
        Ok(())
    }

    pub async fn unsubscribe(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.unsubscribe(partitions).await?;
        self.reset_coordinates(partitions);
        Ok(())
    }

    pub async fn unsubscribe_all(&self) -> crate::Result<()> {
        self.topics.unsubscribe_all().await?;
        let partitions: Vec<Partition> = (0..self.config.partition_count).collect();
        self.reset_coordinates(&partitions);
        Ok(())
    }

    pub async fn seek_to_beginning_of_push(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.seek_to_beginning_of_push(partitions).await?;
        self.reset_coordinates(partitions);
        Ok(())
    }

    pub async fn seek_to_end_of_push(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.seek_to_end_of_push(partitions).await?;
        self.reset_coordinates(partitions);
        Ok(())
    }

    pub async fn seek_to_tail(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.seek_to_tail(partitions).await?;
        self.reset_coordinates(partitions);
        Ok(())
    }

    pub async fn seek_to_timestamp(&self, partition: Partition, timestamp: i64) -> crate::Result<()> {
        let mut timestamps = HashMap::new();
        timestamps.insert(partition, timestamp);
        self.seek_to_timestamps(&timestamps).await
    }

    pub async fn seek_to_timestamps(&self, timestamps: &HashMap<Partition, i64>) -> crate::Result<()> {
        self.topics.seek_to_timestamps(timestamps).await?;
        let partitions: Vec<Partition> = timestamps.keys().copied().collect();
        self.reset_coordinates(&partitions);
        Ok(())
    }

    pub async fn seek_to_checkpoint(&self, coordinates: &[Coordinate]) -> crate::Result<()> {
        self.topics.seek_to_checkpoint(coordinates).await?;
        let partitions: Vec<Partition> = coordinates.iter().map(|c| c.partition).collect();
        self.reset_coordinates(&partitions);
        Ok(())
    }

    pub async fn pause(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.pause(partitions).await
    }

    pub async fn resume(&self, partitions: &[Partition]) -> crate::Result<()> {
        self.topics.resume(partitions).await
    }

    pub async fn get_latest_coordinate(&self, partition: Partition) -> crate::Result<Coordinate> {
        if let Some((topic, offset)) = self.last_offsets.lock().unwrap().get(&partition).cloned() {
            return Ok(Coordinate { topic, partition, offset });
        }
        match self.topics.current_topic(partition).await {
            Some(topic) => Ok(Coordinate {
                topic,
                partition,
                offset: EARLIEST_OFFSET,
            }),
            None => Err(crate::Error::UnknownPartition(partition)),
        }
    }

    pub async fn close(&self) -> crate::Result<()> {
        self.topics.unsubscribe_all().await?;
        self.broker.close().await.map_err(broker_err)
    }

    /// Polls the broker once and returns the kept events across all assigned
    /// partitions (§4.6). A control message that triggers a topic switch on
    /// its partition stops processing the remainder of that partition's
    /// batch; other partitions continue normally.
    pub async fn poll(&self, timeout: Duration) -> crate::Result<Vec<Event<V>>> {
        let batches = self.broker.poll(timeout).await.map_err(broker_err)?;
        let mut out = Vec::new();

        for (tp, envelopes) in batches {
            for envelope in envelopes {
                self.record_offset(tp.partition, &tp.topic, envelope.offset);

                match &envelope.value {
                    MessageValue::Control(control) => {
                        tracing::trace!(partition = tp.partition, topic = %tp.topic, offset = envelope.offset, "control envelope");
                        let switched = self.handle_control(tp.partition, &tp.topic, control).await?;
                        if switched {
                            break;
                        }
                    }
                    MessageValue::Data(record) => {
                        tracing::trace!(
                            partition = tp.partition,
                            topic = %tp.topic,
                            offset = envelope.offset,
                            payload_size = envelope.payload_size,
                            "data envelope"
                        );
                        if let Some(event) = self
                            .decode_data(tp.partition, &tp.topic, envelope.key.clone(), envelope.offset, envelope.timestamp, envelope.payload_size, record)
                            .await?
                        {
                            out.push(event);
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    async fn handle_control(
        &self,
        partition: Partition,
        current_topic: &str,
        control: &ControlMessage,
    ) -> crate::Result<bool> {
        match control {
            ControlMessage::EndOfPush => {
                let version = version_from_topic(&self.config.store_name, current_topic)
                    .ok_or(crate::Error::Protocol("END_OF_PUSH observed on a topic with no parseable version"))?;
                let target = self
                    .config
                    .store_name
                    .change_capture_topic(version, &self.config.change_capture_topic_suffix);
                tracing::info!(partition, from_topic = current_topic, to_topic = %target, "end of push");
                let switched = self.topics.switch_if_needed(partition, &target).await?;
                self.clear_assembler(partition);
                if switched {
                    self.last_offsets.lock().unwrap().remove(&partition);
                }
                Ok(switched)
            }
            ControlMessage::VersionSwap {
                new_serving_version_topic,
                local_high_watermarks,
            } => {
                // The new topic keeps whatever suffix the partition is currently reading
                // under: a swap observed on a version topic (e.g. right after
                // seek_to_beginning_of_push) must land on the new version topic, not
                // skip straight to its change-capture topic.
                let current_suffix = if is_change_capture_topic(current_topic, &self.config.change_capture_topic_suffix) {
                    self.config.change_capture_topic_suffix.as_str()
                } else {
                    ""
                };
                let target = format!("{}{}", new_serving_version_topic, current_suffix);
                self.coordinates
                    .lock()
                    .unwrap()
                    .update_on_version_swap(partition, local_high_watermarks.clone());
                tracing::info!(partition, from_topic = current_topic, to_topic = %target, "version swap");
                let switched = self.topics.switch_if_needed(partition, &target).await?;
                self.clear_assembler(partition);
                if switched {
                    self.last_offsets.lock().unwrap().remove(&partition);
                }
                Ok(switched)
            }
            ControlMessage::StartOfPush { .. } => {
                tracing::trace!(partition, topic = current_topic, "start of push observed");
                Ok(false)
            }
            ControlMessage::Other => {
                tracing::warn!(partition, topic = current_topic, "ignoring unknown control message");
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn decode_data(
        &self,
        partition: Partition,
        topic: &str,
        key: Vec<u8>,
        offset: i64,
        timestamp: i64,
        payload_size: usize,
        record: &DataRecord,
    ) -> crate::Result<Option<Event<V>>> {
        match record {
            DataRecord::Delete(delete) => {
                let vector = self
                    .registry
                    .decode_replication_metadata(
                        delete.replication_metadata_version_id,
                        &delete.replication_metadata_payload,
                    )
                    .await?;
                if self.should_filter(partition, &vector) {
                    return Ok(None);
                }
                Ok(Some(ChangeEvent {
                    key,
                    before: None,
                    after: None,
                    partition,
                    offset,
                    timestamp,
                    payload_size,
                }))
            }

            DataRecord::Put(put) => {
                if is_change_capture_topic(topic, &self.config.change_capture_topic_suffix) {
                    return Err(crate::Error::Protocol(
                        "PUT record observed on a change-capture topic, expected RECORD_CHANGE",
                    ));
                }
                let writer_schema_id = match put.schema_id {
                    CHUNK_SCHEMA_ID => None,
                    CHUNK_MANIFEST_SCHEMA_ID => put.manifest.as_ref().map(|m| m.value_schema_id),
                    id => Some(id),
                };
                let deserializer = match writer_schema_id {
                    Some(id) => Some(self.registry.deserializer(id, id).await?),
                    None => None,
                };
                let compressor = self.topics.compressor_for(partition, topic).await?;
                let fragment_key = put.fragment_key.as_deref().unwrap_or(&key);

                let value = {
                    let mut assembler = self.assembler.lock().unwrap();
                    assembler.buffer_and_assemble(
                        partition,
                        &key,
                        fragment_key,
                        put.schema_id,
                        &put.value_bytes,
                        put.manifest.as_ref(),
                        compressor.as_ref(),
                        deserializer.as_deref(),
                    )?
                };
                let value = match value {
                    Some(v) => v,
                    None => return Ok(None),
                };

                let vector = self
                    .registry
                    .decode_replication_metadata(put.replication_metadata_version_id, &put.replication_metadata_payload)
                    .await?;
                if self.should_filter(partition, &vector) {
                    return Ok(None);
                }
                Ok(Some(ChangeEvent {
                    key,
                    before: None,
                    after: Some(value),
                    partition,
                    offset,
                    timestamp,
                    payload_size,
                }))
            }

            DataRecord::RecordChange(raw) => {
                if !is_change_capture_topic(topic, &self.config.change_capture_topic_suffix) {
                    return Err(crate::Error::Protocol(
                        "RECORD_CHANGE observed on a version topic, expected PUT or DELETE",
                    ));
                }
                let change_deserializer = self.registry.change_event_deserializer();
                let fragment_key = raw.fragment_key.as_deref().unwrap_or(&key);

                let event = {
                    let mut assembler = self.assembler.lock().unwrap();
                    assembler.buffer_and_assemble(
                        partition,
                        &key,
                        fragment_key,
                        raw.schema_id,
                        &raw.value_bytes,
                        raw.manifest.as_ref(),
                        &NoopCompressor,
                        Some(change_deserializer.as_ref()),
                    )?
                };
                let event: RecordChangeEvent<V> = match event {
                    Some(e) => e,
                    None => return Ok(None),
                };

                if self.should_filter(partition, &event.replication_checkpoint_vector) {
                    return Ok(None);
                }
                Ok(Some(ChangeEvent {
                    key,
                    before: event.before,
                    after: event.after,
                    partition,
                    offset,
                    timestamp,
                    payload_size,
                }))
            }
        }
    }

    fn should_filter(&self, partition: Partition, vector: &CheckpointVector) -> bool {
        let filtered = self.coordinates.lock().unwrap().should_filter(partition, vector);
        if filtered {
            tracing::warn!(partition, ?vector, "filtering stale record");
        }
        filtered
    }

    fn clear_assembler(&self, partition: Partition) {
        self.assembler.lock().unwrap().clear_partition(partition);
    }

    fn reset_coordinates(&self, partitions: &[Partition]) {
        let mut coordinates = self.coordinates.lock().unwrap();
        let mut last_offsets = self.last_offsets.lock().unwrap();
        for &partition in partitions {
            coordinates.reset(partition);
            last_offsets.remove(&partition);
        }
    }

    fn record_offset(&self, partition: Partition, topic: &str, offset: i64) {
        self.last_offsets
            .lock()
            .unwrap()
            .insert(partition, (topic.to_string(), offset));
    }
}
