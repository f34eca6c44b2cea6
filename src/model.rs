//! Store, topic, and event types shared across the consumer's components.

use crate::error::Partition;

/// Suffix appended to a version topic's name to name its change-capture topic.
pub const CHANGE_CAPTURE_TOPIC_SUFFIX: &str = "_cc";

/// Monotonically increasing store version. Each version materializes as one
/// version topic and optionally one change-capture topic.
pub type Version = u64;

/// Name of a logical store, e.g. "user-profiles".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreName(pub String);

impl StoreName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the version topic materializing `version` of this store.
    pub fn version_topic(&self, version: Version) -> String {
        format!("{}_v{}", self.0, version)
    }

    /// Name of the change-capture topic for `version` of this store, using
    /// `suffix` (normally [`CHANGE_CAPTURE_TOPIC_SUFFIX`], overridable per
    /// `ConsumerConfig` for testing).
    pub fn change_capture_topic(&self, version: Version, suffix: &str) -> String {
        format!("{}{}", self.version_topic(version), suffix)
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// True if `topic` names a change-capture topic under `suffix`.
pub fn is_change_capture_topic(topic: &str, suffix: &str) -> bool {
    topic.ends_with(suffix)
}

/// Opaque, serializable coordinate a caller persists to resume a partition
/// from a precise point in its change stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coordinate {
    pub topic: String,
    pub partition: Partition,
    pub offset: i64,
}

/// A per-region replication checkpoint vector. Monotonicity between two
/// vectors is checked component-wise: `a` has advanced past `b` iff some
/// component of `a` exceeds the corresponding component of `b`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CheckpointVector(pub Vec<i64>);

impl CheckpointVector {
    pub fn new(components: Vec<i64>) -> Self {
        Self(components)
    }

    /// True iff `self` has advanced past `other` in at least one component.
    /// Vectors of differing length compare missing components as zero,
    /// since a region absent from one side has not yet replicated anything.
    pub fn advanced_past(&self, other: &CheckpointVector) -> bool {
        let len = self.0.len().max(other.0.len());
        (0..len).any(|i| {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            a > b
        })
    }
}

/// A decoded change event, crossing version and physical-layout boundaries
/// transparently. `before` and `after` are both `None` for a delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent<K, V> {
    pub key: K,
    pub before: Option<V>,
    pub after: Option<V>,
    pub partition: Partition,
    pub offset: i64,
    pub timestamp: i64,
    pub payload_size: usize,
}

impl<K, V> ChangeEvent<K, V> {
    pub fn is_delete(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}
