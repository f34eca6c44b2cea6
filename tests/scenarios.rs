//! End-to-end scenarios (S1-S6) against in-memory fakes of the broker and
//! metadata-client collaborators. No network, no external broker.

use change_capture::broker::{
    ControlMessage, DataRecord, DeleteRecord, Envelope, MessageValue, PubSubConsumer, PutRecord, RawRecordChange,
    TopicPartition, CHUNK_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID, EARLIEST_OFFSET,
};
use change_capture::chunk::ChunkManifest;
use change_capture::compressor::DictionaryReader;
use change_capture::deserializer::{DeserializerMode, RecordChangeEvent, SpecificDeserializerFactory};
use change_capture::metadata::{CompressionMode, MetadataClient, Schema, StoreInfo, VersionInfo};
use change_capture::{ChangeConsumer, ConsumerConfig, StoreName};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
struct FakeError(String);

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FakeError {}

/// An in-memory broker: each topic is an append-only log of envelopes.
/// `subscribe` records a read cursor per topic-partition; `poll` drains
/// everything at or after the cursor and advances it.
#[derive(Default)]
struct FakeBroker {
    logs: Mutex<HashMap<String, Vec<Envelope>>>,
    cursors: Mutex<HashMap<TopicPartition, i64>>,
}

impl FakeBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends `envelope` to `topic`, assigning it the next offset.
    fn push(&self, topic: &str, mut envelope: Envelope) -> i64 {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(topic.to_string()).or_default();
        let offset = log.len() as i64;
        envelope.offset = offset;
        log.push(envelope);
        offset
    }
}

impl PubSubConsumer for FakeBroker {
    type Error = FakeError;

    async fn subscribe(&self, tp: TopicPartition, from_offset: i64) -> Result<(), Self::Error> {
        let cursor = if from_offset == EARLIEST_OFFSET { 0 } else { from_offset + 1 };
        self.cursors.lock().unwrap().insert(tp, cursor);
        Ok(())
    }

    async fn unsubscribe(&self, tp: TopicPartition) -> Result<(), Self::Error> {
        self.cursors.lock().unwrap().remove(&tp);
        Ok(())
    }

    async fn batch_unsubscribe(&self, tps: HashSet<TopicPartition>) -> Result<(), Self::Error> {
        let mut cursors = self.cursors.lock().unwrap();
        for tp in tps {
            cursors.remove(&tp);
        }
        Ok(())
    }

    async fn pause(&self, _tp: TopicPartition) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn resume(&self, _tp: TopicPartition) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn assignment(&self) -> Result<HashSet<TopicPartition>, Self::Error> {
        Ok(self.cursors.lock().unwrap().keys().cloned().collect())
    }

    async fn poll(&self, _timeout: Duration) -> Result<HashMap<TopicPartition, Vec<Envelope>>, Self::Error> {
        let logs = self.logs.lock().unwrap();
        let mut cursors = self.cursors.lock().unwrap();
        let mut out = HashMap::new();
        for (tp, cursor) in cursors.iter_mut() {
            let Some(log) = logs.get(&tp.topic) else { continue };
            let batch: Vec<Envelope> = log.iter().filter(|e| e.offset >= *cursor).cloned().collect();
            if let Some(last) = batch.last() {
                *cursor = last.offset + 1;
            }
            if !batch.is_empty() {
                out.insert(tp.clone(), batch);
            }
        }
        Ok(out)
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64, Self::Error> {
        Ok(self.logs.lock().unwrap().get(&tp.topic).map_or(0, |l| l.len() as i64))
    }

    async fn offset_for_time(&self, tp: &TopicPartition, timestamp: i64) -> Result<Option<i64>, Self::Error> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(&tp.topic)
            .and_then(|log| log.iter().find(|e| e.timestamp >= timestamp).map(|e| e.offset)))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct FakeMetadata {
    store_info: Mutex<StoreInfo>,
}

impl FakeMetadata {
    fn new(current_version: u64) -> Arc<Self> {
        Arc::new(Self {
            store_info: Mutex::new(StoreInfo {
                current_version,
                partition_count: 1,
                versions: vec![VersionInfo {
                    version: current_version,
                    compression: CompressionMode::None,
                }],
            }),
        })
    }

    fn advance_version(&self, version: u64) {
        let mut info = self.store_info.lock().unwrap();
        info.current_version = version;
        info.versions.push(VersionInfo {
            version,
            compression: CompressionMode::None,
        });
    }
}

impl MetadataClient for FakeMetadata {
    type Error = FakeError;

    async fn get_store(&self, _store: &StoreName) -> Result<StoreInfo, Self::Error> {
        Ok(self.store_info.lock().unwrap().clone())
    }

    async fn get_key_schema(&self, _store: &StoreName) -> Result<Schema, Self::Error> {
        Ok(Schema::new(serde_json::json!({"type": "string"})))
    }

    async fn get_value_schema(&self, _store: &StoreName, _schema_id: i32) -> Result<Schema, Self::Error> {
        Ok(Schema::new(serde_json::json!({"type": "string"})))
    }

    async fn latest_value_schema_id(&self, _store: &StoreName) -> Result<i32, Self::Error> {
        Ok(1)
    }

    async fn get_replication_metadata_schema(&self, _store: &StoreName, _rmd_id: i32) -> Result<Schema, Self::Error> {
        Ok(Schema::new(serde_json::json!({"type": "array", "items": "long"})))
    }
}

struct FakeDictionaryReader;

impl DictionaryReader for FakeDictionaryReader {
    type Error = FakeError;

    async fn read_dictionary(&self, _topic: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(None)
    }
}

fn value_factory() -> Arc<SpecificDeserializerFactory<String>> {
    Arc::new(SpecificDeserializerFactory::new(|_writer, _reader, bytes| {
        String::from_utf8(bytes.to_vec()).map_err(|e| change_capture::Error::Codec(e.to_string()))
    }))
}

fn change_event_factory() -> Arc<SpecificDeserializerFactory<RecordChangeEvent<String>>> {
    Arc::new(SpecificDeserializerFactory::new(|_writer, _reader, bytes| {
        let doc: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| change_capture::Error::Codec(e.to_string()))?;
        Ok(RecordChangeEvent {
            before: doc.get("before").and_then(|v| v.as_str()).map(str::to_string),
            after: doc.get("after").and_then(|v| v.as_str()).map(str::to_string),
            replication_checkpoint_vector: change_capture::CheckpointVector::new(
                doc.get("checkpoint_vector")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|n| n.as_i64()).collect())
                    .unwrap_or_default(),
            ),
        })
    }))
}

fn rmd_decode() -> Arc<change_capture::schema_registry::RmdDecodeFn> {
    Arc::new(|_schema, bytes| {
        if bytes.is_empty() {
            return Ok(change_capture::CheckpointVector::new(vec![]));
        }
        let components: Vec<i64> =
            serde_json::from_slice(bytes).map_err(|e| change_capture::Error::Codec(e.to_string()))?;
        Ok(change_capture::CheckpointVector::new(components))
    })
}

fn record_change_bytes(before: Option<&str>, after: Option<&str>, vector: &[i64]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "before": before,
        "after": after,
        "checkpoint_vector": vector,
    }))
    .unwrap()
}

fn data_envelope(key: &[u8], value: MessageValue) -> Envelope {
    Envelope {
        key: key.to_vec(),
        value,
        offset: 0,
        timestamp: 0,
        payload_size: 0,
    }
}

type TestConsumer = ChangeConsumer<String, FakeBroker, FakeMetadata, FakeDictionaryReader>;

fn build_consumer(store: &str, broker: Arc<FakeBroker>, metadata: Arc<FakeMetadata>) -> TestConsumer {
    let config = ConsumerConfig::new(StoreName(store.to_string()), 1, DeserializerMode::Specific);
    ChangeConsumer::new(
        config,
        broker,
        metadata,
        Arc::new(FakeDictionaryReader),
        value_factory(),
        change_event_factory(),
        rmd_decode(),
    )
}

#[tokio::test]
async fn s1_put_then_delete_on_version_topic() {
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata);

    consumer.subscribe(&[0]).await.unwrap();

    broker.push(
        "s_v1",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::Put(PutRecord {
                schema_id: 7,
                value_bytes: b"V1".to_vec(),
                replication_metadata_version_id: 1,
                replication_metadata_payload: vec![],
                fragment_key: None,
                manifest: None,
            })),
        ),
    );
    broker.push(
        "s_v1",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::Delete(DeleteRecord {
                replication_metadata_version_id: 1,
                replication_metadata_payload: vec![],
            })),
        ),
    );

    let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].key, b"\x01");
    assert_eq!(events[0].after.as_deref(), Some("V1"));
    assert!(events[0].before.is_none());
    assert!(events[1].is_delete());
}

#[tokio::test]
async fn s2_end_of_push_switches_to_change_capture_topic() {
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata);

    consumer.subscribe(&[0]).await.unwrap();

    for key in [b'\x01', b'\x02'] {
        broker.push(
            "s_v1",
            data_envelope(
                &[key],
                MessageValue::Data(DataRecord::Put(PutRecord {
                    schema_id: 7,
                    value_bytes: b"V".to_vec(),
                    replication_metadata_version_id: 1,
                    replication_metadata_payload: vec![],
                    fragment_key: None,
                    manifest: None,
                })),
            ),
        );
    }
    broker.push("s_v1", data_envelope(b"", MessageValue::Control(ControlMessage::EndOfPush)));

    let first = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(first.len(), 2);

    // This poll observes only the END_OF_PUSH control message and switches
    // the partition onto the change-capture topic; it cannot also drain that
    // topic's backlog, since the broker only learns of the new subscription
    // as a side effect of processing the control message.
    let switch = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert!(switch.is_empty());
    assert_eq!(
        consumer.get_latest_coordinate(0).await.unwrap().topic,
        "s_v1_cc"
    );

    broker.push(
        "s_v1_cc",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::RecordChange(RawRecordChange {
                schema_id: 1,
                value_bytes: record_change_bytes(Some("V"), Some("V2"), &[1]),
                fragment_key: None,
                manifest: None,
            })),
        ),
    );

    let third = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].after.as_deref(), Some("V2"));
}

#[tokio::test]
async fn version_swap_observed_on_a_version_topic_targets_the_new_version_topic() {
    // A VERSION_SWAP can arrive while a partition is still on a plain version
    // topic (e.g. right after seek_to_beginning_of_push, before EndOfPush has
    // ever cut it over to a change-capture topic). The target must keep that
    // empty suffix rather than jumping straight to the new version's cc topic.
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata.clone());

    consumer.seek_to_beginning_of_push(&[0]).await.unwrap();
    metadata.advance_version(2);

    broker.push(
        "s_v1",
        data_envelope(
            b"",
            MessageValue::Control(ControlMessage::VersionSwap {
                new_serving_version_topic: "s_v2".to_string(),
                local_high_watermarks: change_capture::CheckpointVector::new(vec![7, 3]),
            }),
        ),
    );

    let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert!(events.is_empty());

    let coordinate = consumer.get_latest_coordinate(0).await.unwrap();
    assert_eq!(coordinate.topic, "s_v2");
}

#[tokio::test]
async fn s3_version_swap_advancing_watermark_updates_and_switches() {
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata.clone());

    consumer.seek_to_end_of_push(&[0]).await.unwrap();
    metadata.advance_version(2);

    broker.push(
        "s_v1_cc",
        data_envelope(
            b"",
            MessageValue::Control(ControlMessage::VersionSwap {
                new_serving_version_topic: "s_v2".to_string(),
                local_high_watermarks: change_capture::CheckpointVector::new(vec![7, 3]),
            }),
        ),
    );

    let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert!(events.is_empty());

    let coordinate = consumer.get_latest_coordinate(0).await.unwrap();
    assert_eq!(coordinate.topic, "s_v2_cc");
}

#[tokio::test]
async fn s4_version_swap_regressing_watermark_still_switches() {
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata.clone());

    consumer.seek_to_end_of_push(&[0]).await.unwrap();
    metadata.advance_version(2);

    // Establish an initial high-watermark of [5, 3] via a first swap back to v1_cc...
    broker.push(
        "s_v1_cc",
        data_envelope(
            b"",
            MessageValue::Control(ControlMessage::VersionSwap {
                new_serving_version_topic: "s_v1".to_string(),
                local_high_watermarks: change_capture::CheckpointVector::new(vec![5, 3]),
            }),
        ),
    );
    consumer.poll(Duration::from_millis(10)).await.unwrap();

    // ...then a regressing swap to v2 should still move the partition.
    broker.push(
        "s_v1_cc",
        data_envelope(
            b"",
            MessageValue::Control(ControlMessage::VersionSwap {
                new_serving_version_topic: "s_v2".to_string(),
                local_high_watermarks: change_capture::CheckpointVector::new(vec![4, 3]),
            }),
        ),
    );
    consumer.poll(Duration::from_millis(10)).await.unwrap();

    let coordinate = consumer.get_latest_coordinate(0).await.unwrap();
    assert_eq!(coordinate.topic, "s_v2_cc");

    // A record that only advanced past [4,3] but not [5,3] must still be filtered.
    broker.push(
        "s_v2_cc",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::RecordChange(RawRecordChange {
                schema_id: 1,
                value_bytes: record_change_bytes(None, Some("X"), &[5, 3]),
                fragment_key: None,
                manifest: None,
            })),
        ),
    );
    let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert!(events.is_empty(), "[5,3] did not advance past retained high-watermark [5,3]");
}

#[tokio::test]
async fn s5_stale_record_filter_after_cutover() {
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata.clone());

    consumer.seek_to_end_of_push(&[0]).await.unwrap();
    metadata.advance_version(2);
    broker.push(
        "s_v1_cc",
        data_envelope(
            b"",
            MessageValue::Control(ControlMessage::VersionSwap {
                new_serving_version_topic: "s_v2".to_string(),
                local_high_watermarks: change_capture::CheckpointVector::new(vec![7, 3]),
            }),
        ),
    );
    consumer.poll(Duration::from_millis(10)).await.unwrap();

    broker.push(
        "s_v2_cc",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::RecordChange(RawRecordChange {
                schema_id: 1,
                value_bytes: record_change_bytes(None, Some("stale"), &[6, 3]),
                fragment_key: None,
                manifest: None,
            })),
        ),
    );
    let filtered = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert!(filtered.is_empty());

    broker.push(
        "s_v2_cc",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::RecordChange(RawRecordChange {
                schema_id: 1,
                value_bytes: record_change_bytes(None, Some("fresh"), &[7, 4]),
                fragment_key: None,
                manifest: None,
            })),
        ),
    );
    let kept = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].after.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn s6_chunked_record_assembled_from_manifest() {
    init_tracing();
    let broker = FakeBroker::new();
    let metadata = FakeMetadata::new(1);
    let consumer = build_consumer("s", broker.clone(), metadata);

    consumer.subscribe(&[0]).await.unwrap();

    let parts: [&[u8]; 3] = [b"AB", b"CD", b"EF"];
    for (i, part) in parts.iter().enumerate() {
        broker.push(
            "s_v1",
            data_envelope(
                b"\x01",
                MessageValue::Data(DataRecord::Put(PutRecord {
                    schema_id: CHUNK_SCHEMA_ID,
                    value_bytes: part.to_vec(),
                    replication_metadata_version_id: 1,
                    replication_metadata_payload: vec![],
                    fragment_key: Some(vec![i as u8]),
                    manifest: None,
                })),
            ),
        );
    }

    let fragments_only = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert!(fragments_only.is_empty());

    broker.push(
        "s_v1",
        data_envelope(
            b"\x01",
            MessageValue::Data(DataRecord::Put(PutRecord {
                schema_id: CHUNK_MANIFEST_SCHEMA_ID,
                value_bytes: vec![],
                replication_metadata_version_id: 1,
                replication_metadata_payload: vec![],
                fragment_key: None,
                manifest: Some(ChunkManifest {
                    segment_keys: vec![vec![0], vec![1], vec![2]],
                    total_size: 6,
                    value_schema_id: 7,
                }),
            })),
        ),
    );

    let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].after.as_deref(), Some("ABCDEF"));
}
