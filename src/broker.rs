//! The `PubSubConsumer` collaborator: a typed view over whatever broker
//! (Kafka, Gazette journals, ...) actually carries the store's topics. This
//! crate never constructs one; callers supply an implementation.

use crate::model::CheckpointVector;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

/// Sentinel meaning "subscribe from the first available offset," as opposed
/// to a concrete offset meaning "resume after this offset."
pub const EARLIEST_OFFSET: i64 = -1;

pub type SchemaId = i32;

/// Reserved schema id marking an envelope as a chunk fragment awaiting a
/// terminating manifest.
pub const CHUNK_SCHEMA_ID: SchemaId = -10;
/// Reserved schema id marking an envelope as a chunk manifest.
pub const CHUNK_MANIFEST_SCHEMA_ID: SchemaId = -20;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: crate::error::Partition,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: crate::error::Partition) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// A single message read off a topic-partition.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub key: Vec<u8>,
    pub value: MessageValue,
    pub offset: i64,
    pub timestamp: i64,
    pub payload_size: usize,
}

#[derive(Clone, Debug)]
pub enum MessageValue {
    Control(ControlMessage),
    Data(DataRecord),
}

#[derive(Clone, Debug)]
pub enum ControlMessage {
    /// May carry a compression dictionary for the version topic it opens.
    StartOfPush {
        compression_dictionary: Option<Vec<u8>>,
    },
    EndOfPush,
    VersionSwap {
        new_serving_version_topic: String,
        local_high_watermarks: CheckpointVector,
    },
    /// A control type this crate does not act on; logged and skipped.
    Other,
}

#[derive(Clone, Debug)]
pub enum DataRecord {
    Put(PutRecord),
    Delete(DeleteRecord),
    /// A post-push mutation read from a change-capture topic. Change-capture
    /// topics carry this variant instead of `Put`/`Delete` because the
    /// before/after values and the checkpoint vector are already co-located
    /// in a single envelope value on that topic (see spec §4.6).
    RecordChange(RawRecordChange),
}

#[derive(Clone, Debug)]
pub struct PutRecord {
    /// `CHUNK_SCHEMA_ID` and `CHUNK_MANIFEST_SCHEMA_ID` are reserved; any
    /// other value names a real value schema.
    pub schema_id: SchemaId,
    pub value_bytes: Vec<u8>,
    pub replication_metadata_version_id: i32,
    pub replication_metadata_payload: Vec<u8>,
    /// Present when `schema_id == CHUNK_SCHEMA_ID`: the sub-key identifying
    /// this fragment within its logical key's assembly buffer.
    pub fragment_key: Option<Vec<u8>>,
    /// Present when `schema_id == CHUNK_MANIFEST_SCHEMA_ID`: the ordered
    /// fragment list and total assembled size.
    pub manifest: Option<crate::chunk::ChunkManifest>,
}

#[derive(Clone, Debug)]
pub struct DeleteRecord {
    pub replication_metadata_version_id: i32,
    pub replication_metadata_payload: Vec<u8>,
}

/// The not-yet-deserialized value of a change-capture topic envelope. Like
/// `PutRecord`, `schema_id` may be one of the chunk sentinels.
#[derive(Clone, Debug)]
pub struct RawRecordChange {
    pub schema_id: SchemaId,
    pub value_bytes: Vec<u8>,
    pub fragment_key: Option<Vec<u8>>,
    pub manifest: Option<crate::chunk::ChunkManifest>,
}

/// The pub/sub broker client this crate consumes from. Implementors own the
/// wire protocol, connection pooling, and retries; this trait only names the
/// operations the consumer core needs.
pub trait PubSubConsumer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn subscribe(
        &self,
        tp: TopicPartition,
        from_offset: i64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn unsubscribe(&self, tp: TopicPartition) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn batch_unsubscribe(
        &self,
        tps: HashSet<TopicPartition>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn pause(&self, tp: TopicPartition) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn resume(&self, tp: TopicPartition) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn assignment(&self) -> impl Future<Output = Result<HashSet<TopicPartition>, Self::Error>> + Send;

    fn poll(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<HashMap<TopicPartition, Vec<Envelope>>, Self::Error>> + Send;

    fn end_offset(&self, tp: &TopicPartition) -> impl Future<Output = Result<i64, Self::Error>> + Send;

    fn offset_for_time(
        &self,
        tp: &TopicPartition,
        timestamp: i64,
    ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
