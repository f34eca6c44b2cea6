//! Maintains the subscription set, pause/resume, seek primitives, and
//! partition→topic routing (§4.5). All mutating operations serialize on one
//! `tokio::sync::Mutex`, the same "single lock, not fine-grained" choice the
//! teacher's `Router` makes for its dial-state map and that §5/§9 call out
//! as deliberate here too.

use crate::broker::{PubSubConsumer, TopicPartition, EARLIEST_OFFSET};
use crate::compressor::{Compressor, CompressorRegistry, DictionaryReader};
use crate::error::Partition;
use crate::metadata::{CompressionMode, MetadataClient};
use crate::model::{is_change_capture_topic, Coordinate, StoreName, Version};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Subscription lifecycle for a single partition (§4.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionState {
    Unsubscribed,
    Subscribed { topic: String },
    Paused { topic: String },
}

impl PartitionState {
    fn topic(&self) -> Option<&str> {
        match self {
            PartitionState::Subscribed { topic } | PartitionState::Paused { topic } => Some(topic),
            PartitionState::Unsubscribed => None,
        }
    }
}

pub struct TopicPartitionManager<P, M, D> {
    store: StoreName,
    cc_suffix: String,
    broker: Arc<P>,
    metadata: Arc<M>,
    compressors: Arc<CompressorRegistry<D>>,
    state: Mutex<HashMap<Partition, PartitionState>>,
}

impl<P, M, D> TopicPartitionManager<P, M, D>
where
    P: PubSubConsumer,
    M: MetadataClient,
    D: DictionaryReader,
{
    pub fn new(
        store: StoreName,
        cc_suffix: String,
        broker: Arc<P>,
        metadata: Arc<M>,
        compressors: Arc<CompressorRegistry<D>>,
    ) -> Self {
        Self {
            store,
            cc_suffix,
            broker,
            metadata,
            compressors,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn cc_suffix(&self) -> &str {
        &self.cc_suffix
    }

    /// Current topic a partition is assigned to, if any.
    pub async fn current_topic(&self, partition: Partition) -> Option<String> {
        self.state
            .lock()
            .await
            .get(&partition)
            .and_then(PartitionState::topic)
            .map(str::to_string)
    }

    /// Resolves the compressor for `(partition, topic)` from the store's
    /// currently published compression mode, fetching a dictionary on first
    /// use. Used by the poll loop to decompress `PUT` values.
    pub async fn compressor_for(&self, partition: Partition, topic: &str) -> crate::Result<Arc<dyn Compressor>> {
        let store_info = self.fetch_store().await?;
        let mode = self.compression_mode(topic, &store_info);
        self.compressors.get(partition, topic, mode).await
    }

    pub async fn state_of(&self, partition: Partition) -> PartitionState {
        self.state
            .lock()
            .await
            .get(&partition)
            .cloned()
            .unwrap_or(PartitionState::Unsubscribed)
    }

    /// Subscribes `partitions` to `topic`, or to the store's current serving
    /// version topic if `topic` is absent. Refreshes metadata on every call.
    pub async fn subscribe(&self, partitions: &[Partition], topic: Option<String>) -> crate::Result<()> {
        let store_info = self.fetch_store().await?;
        let target = topic.unwrap_or_else(|| self.store.version_topic(store_info.current_version));
        let mode = self.compression_mode(&target, &store_info);

        let mut state = self.state.lock().await;
        for &partition in partitions {
            self.assign_locked(&mut state, partition, &target, EARLIEST_OFFSET).await?;
            self.compressors.get(partition, &target, mode.clone()).await?;
        }
        Ok(())
    }

    pub async fn subscribe_all(&self, partition_count: i32) -> crate::Result<()> {
        let partitions: Vec<Partition> = (0..partition_count).collect();
        self.subscribe(&partitions, None).await
    }

    pub async fn unsubscribe(&self, partitions: &[Partition]) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        for &partition in partitions {
            if let Some(prev) = state.remove(&partition) {
                if let Some(topic) = prev.topic() {
                    self.broker
                        .unsubscribe(TopicPartition::new(topic.to_string(), partition))
                        .await
                        .map_err(broker_err)?;
                }
            }
        }
        Ok(())
    }

    pub async fn unsubscribe_all(&self) -> crate::Result<()> {
        let partitions: Vec<Partition> = self.state.lock().await.keys().copied().collect();
        self.unsubscribe(&partitions).await
    }

    pub async fn seek_to_beginning_of_push(&self, partitions: &[Partition]) -> crate::Result<()> {
        let store_info = self.fetch_store().await?;
        let topic = self.store.version_topic(store_info.current_version);
        let mode = self.compression_mode(&topic, &store_info);

        let mut state = self.state.lock().await;
        for &partition in partitions {
            self.assign_locked(&mut state, partition, &topic, EARLIEST_OFFSET).await?;
            self.compressors.get(partition, &topic, mode.clone()).await?;
        }
        Ok(())
    }

    pub async fn seek_to_end_of_push(&self, partitions: &[Partition]) -> crate::Result<()> {
        let store_info = self.fetch_store().await?;
        let topic = self.store.change_capture_topic(store_info.current_version, &self.cc_suffix);

        let mut state = self.state.lock().await;
        for &partition in partitions {
            self.assign_locked(&mut state, partition, &topic, EARLIEST_OFFSET).await?;
            self.compressors.get(partition, &topic, CompressionMode::None).await?;
        }
        Ok(())
    }

    pub async fn seek_to_tail(&self, partitions: &[Partition]) -> crate::Result<()> {
        let store_info = self.fetch_store().await?;
        let topic = self.store.change_capture_topic(store_info.current_version, &self.cc_suffix);

        let mut state = self.state.lock().await;
        for &partition in partitions {
            let tp = TopicPartition::new(topic.clone(), partition);
            let end = self.broker.end_offset(&tp).await.map_err(broker_err)?;
            self.assign_locked(&mut state, partition, &topic, end).await?;
            self.compressors.get(partition, &topic, CompressionMode::None).await?;
        }
        Ok(())
    }

    pub async fn seek_to_timestamps(&self, timestamps: &HashMap<Partition, i64>) -> crate::Result<()> {
        let store_info = self.fetch_store().await?;
        let topic = self.store.change_capture_topic(store_info.current_version, &self.cc_suffix);

        let mut state = self.state.lock().await;
        for (&partition, &ts) in timestamps {
            let tp = TopicPartition::new(topic.clone(), partition);
            let offset = match self.broker.offset_for_time(&tp, ts).await.map_err(broker_err)? {
                Some(offset) => offset,
                None => self.broker.end_offset(&tp).await.map_err(broker_err)?,
            };
            self.assign_locked(&mut state, partition, &topic, offset).await?;
            self.compressors.get(partition, &topic, CompressionMode::None).await?;
        }
        Ok(())
    }

    /// Resumes each coordinate's partition at `offset - 1` so that the next
    /// poll yields the record at `offset` (the broker API's subscribe offset
    /// means "resume from", §4.5 / §9). The `EARLIEST_OFFSET` sentinel is
    /// passed through unchanged.
    pub async fn seek_to_checkpoint(&self, coordinates: &[Coordinate]) -> crate::Result<()> {
        let store_info = self.fetch_store().await?;
        let mut state = self.state.lock().await;
        for coordinate in coordinates {
            let resume_offset = if coordinate.offset == EARLIEST_OFFSET {
                EARLIEST_OFFSET
            } else {
                coordinate.offset - 1
            };
            self.assign_locked(&mut state, coordinate.partition, &coordinate.topic, resume_offset)
                .await?;
            let mode = self.compression_mode(&coordinate.topic, &store_info);
            self.compressors
                .get(coordinate.partition, &coordinate.topic, mode)
                .await?;
        }
        Ok(())
    }

    pub async fn pause(&self, partitions: &[Partition]) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        for &partition in partitions {
            if let Some(PartitionState::Subscribed { topic }) = state.get(&partition).cloned() {
                self.broker
                    .pause(TopicPartition::new(topic.clone(), partition))
                    .await
                    .map_err(broker_err)?;
                state.insert(partition, PartitionState::Paused { topic });
            }
        }
        Ok(())
    }

    pub async fn resume(&self, partitions: &[Partition]) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        for &partition in partitions {
            if let Some(PartitionState::Paused { topic }) = state.get(&partition).cloned() {
                self.broker
                    .resume(TopicPartition::new(topic.clone(), partition))
                    .await
                    .map_err(broker_err)?;
                state.insert(partition, PartitionState::Subscribed { topic });
            }
        }
        Ok(())
    }

    /// Switches `partition` onto `target_topic` at the earliest offset,
    /// unless it is already there (§4.6 "switch is a no-op if the partition
    /// is already on the target topic"). Used by the poll loop's control
    /// dispatch, as opposed to the explicit seek methods above which always
    /// reassign regardless of current topic.
    pub async fn switch_if_needed(&self, partition: Partition, target_topic: &str) -> crate::Result<bool> {
        let mut state = self.state.lock().await;
        if state.get(&partition).and_then(PartitionState::topic) == Some(target_topic) {
            return Ok(false);
        }
        self.assign_locked(&mut state, partition, target_topic, EARLIEST_OFFSET)
            .await?;
        let mode = if is_change_capture_topic(target_topic, &self.cc_suffix) {
            CompressionMode::None
        } else {
            self.compression_mode(target_topic, &self.fetch_store().await?)
        };
        self.compressors.get(partition, target_topic, mode).await?;
        Ok(true)
    }

    async fn assign_locked(
        &self,
        state: &mut HashMap<Partition, PartitionState>,
        partition: Partition,
        topic: &str,
        offset: i64,
    ) -> crate::Result<()> {
        if let Some(prev_topic) = state.get(&partition).and_then(PartitionState::topic) {
            if prev_topic != topic {
                self.broker
                    .unsubscribe(TopicPartition::new(prev_topic.to_string(), partition))
                    .await
                    .map_err(broker_err)?;
            }
        }
        self.broker
            .subscribe(TopicPartition::new(topic.to_string(), partition), offset)
            .await
            .map_err(broker_err)?;
        tracing::info!(partition, topic, offset, "subscribed partition");
        state.insert(partition, PartitionState::Subscribed { topic: topic.to_string() });
        Ok(())
    }

    async fn fetch_store(&self) -> crate::Result<crate::metadata::StoreInfo> {
        self.metadata.get_store(&self.store).await.map_err(|e| {
            crate::Error::MetadataUnreachable {
                store: self.store.to_string(),
                source: Box::new(e),
            }
        })
    }

    fn compression_mode(&self, topic: &str, store_info: &crate::metadata::StoreInfo) -> CompressionMode {
        if is_change_capture_topic(topic, &self.cc_suffix) {
            return CompressionMode::None;
        }
        match version_from_topic(&self.store, topic).and_then(|v| store_info.version(v)) {
            Some(info) => info.compression.clone(),
            None => CompressionMode::None,
        }
    }
}

pub(crate) fn version_from_topic(store: &StoreName, topic: &str) -> Option<Version> {
    topic
        .strip_prefix(&format!("{}_v", store.as_str()))?
        .parse()
        .ok()
}

pub(crate) fn broker_err<E: std::error::Error + Send + Sync + 'static>(source: E) -> crate::Error {
    crate::Error::Broker(Box::new(source))
}
