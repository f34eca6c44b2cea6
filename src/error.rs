/// Partition number within a store's fixed-size partition space.
pub type Partition = i32;

/// Crate-wide error type. One variant per failure kind this component can
/// raise directly, plus transparent wrapping of whatever a `PubSubConsumer`
/// or `MetadataClient` implementation reports as its own transport error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("metadata lookup failed for store '{store}'")]
    MetadataUnreachable {
        store: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("broker operation failed")]
    Broker(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to read compression dictionary for partition {partition} of topic '{topic}'")]
    DictionaryUnreadable {
        partition: Partition,
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to deserialize record for key on partition {partition} at offset {offset}")]
    Deserialization {
        partition: Partition,
        offset: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("chunk assembly protocol violation on partition {partition}: {reason}")]
    AssemblerProtocol { partition: Partition, reason: String },

    #[error("partition {0} is not in the current assignment")]
    UnknownPartition(Partition),

    #[error("{0}")]
    Protocol(&'static str),

    #[error("codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, Error>;
