//! Construction-time configuration for a [`ChangeConsumer`](crate::consumer::ChangeConsumer).
//! No external config-file parsing — callers build this directly (§10.3).

use crate::deserializer::DeserializerMode;
use crate::model::{StoreName, CHANGE_CAPTURE_TOPIC_SUFFIX};

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub store_name: StoreName,
    pub partition_count: i32,
    pub change_capture_topic_suffix: String,
    pub deserializer_mode: DeserializerMode,
}

impl ConsumerConfig {
    /// Builds a config with the standard `_cc` change-capture suffix.
    pub fn new(store_name: StoreName, partition_count: i32, deserializer_mode: DeserializerMode) -> Self {
        Self {
            store_name,
            partition_count,
            change_capture_topic_suffix: CHANGE_CAPTURE_TOPIC_SUFFIX.to_string(),
            deserializer_mode,
        }
    }

    /// Overrides the change-capture topic suffix, e.g. for tests that need a
    /// distinct namespace per run.
    pub fn with_change_capture_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.change_capture_topic_suffix = suffix.into();
        self
    }
}
