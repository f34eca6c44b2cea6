//! The `MetadataClient` collaborator: the control-plane client returning
//! store metadata and schemas. This crate never constructs one; callers
//! supply an implementation.

use crate::broker::SchemaId;
use crate::model::{StoreName, Version};
use std::future::Future;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    Gzip,
    ZstdWithDict,
}

#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub version: Version,
    pub compression: CompressionMode,
}

#[derive(Clone, Debug)]
pub struct StoreInfo {
    pub current_version: Version,
    pub partition_count: i32,
    pub versions: Vec<VersionInfo>,
}

impl StoreInfo {
    pub fn version(&self, version: Version) -> Option<&VersionInfo> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// An Avro-shaped schema document, immutable once returned by the registry.
/// The wire encoding of records against this schema is assumed given (§1) —
/// this crate cares only that schemas are comparable and cacheable by id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema(pub serde_json::Value);

impl Schema {
    pub fn new(document: serde_json::Value) -> Self {
        Self(document)
    }
}

pub trait MetadataClient: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get_store(&self, store: &StoreName) -> impl Future<Output = Result<StoreInfo, Self::Error>> + Send;

    fn get_key_schema(&self, store: &StoreName) -> impl Future<Output = Result<Schema, Self::Error>> + Send;

    fn get_value_schema(
        &self,
        store: &StoreName,
        schema_id: SchemaId,
    ) -> impl Future<Output = Result<Schema, Self::Error>> + Send;

    fn latest_value_schema_id(
        &self,
        store: &StoreName,
    ) -> impl Future<Output = Result<SchemaId, Self::Error>> + Send;

    fn get_replication_metadata_schema(
        &self,
        store: &StoreName,
        rmd_id: i32,
    ) -> impl Future<Output = Result<Schema, Self::Error>> + Send;
}
