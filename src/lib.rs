//! A change-data-capture consumer for a partitioned, versioned key-value
//! store fed by an append-only log. Subscribes to a store's logical change
//! stream and yields decoded `(key, before, after)` events, transparently
//! crossing version boundaries and chunked physical layouts.
//!
//! The pub/sub broker and the schema/metadata control plane are external
//! collaborators, named here as the [`broker::PubSubConsumer`] and
//! [`metadata::MetadataClient`] traits. This crate owns only the assembler
//! and version-switch state machine sitting between them.

pub mod broker;
pub mod chunk;
pub mod compressor;
pub mod config;
pub mod consumer;
pub mod coordinate;
pub mod deserializer;
pub mod error;
pub mod metadata;
pub mod model;
pub mod schema_registry;
pub mod topic_manager;

pub use config::ConsumerConfig;
pub use consumer::{ChangeConsumer, Event};
pub use error::{Error, Result};
pub use model::{ChangeEvent, CheckpointVector, Coordinate, StoreName, Version};
