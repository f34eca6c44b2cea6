//! Per-version compressor cache (§4.1). Change-capture topics are never
//! compressed; everything else is compressed per the version's declared
//! `CompressionMode`, with `ZstdWithDict` requiring a dictionary scanned out
//! of the version topic's `START_OF_PUSH` control message.

use crate::error::Partition;
use crate::metadata::CompressionMode;
use dashmap::DashMap;
use std::future::Future;
use std::io::Read;
use std::sync::Arc;

pub trait Compressor: Send + Sync {
    fn decompress(&self, bytes: &[u8]) -> crate::Result<Vec<u8>>;
}

pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn decompress(&self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn decompress(&self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| crate::Error::Codec(format!("gzip decode failed: {e}")))?;
        Ok(out)
    }
}

pub struct ZstdDictCompressor {
    dictionary: Vec<u8>,
}

impl ZstdDictCompressor {
    pub fn new(dictionary: Vec<u8>) -> Self {
        Self { dictionary }
    }
}

impl Compressor for ZstdDictCompressor {
    fn decompress(&self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        zstd::stream::read::Decoder::with_dictionary(bytes, &self.dictionary)
            .and_then(|mut d| d.read_to_end(&mut out))
            .map_err(|e| crate::Error::Codec(format!("zstd dictionary decode failed: {e}")))?;
        Ok(out)
    }
}

/// Scans a version topic for its compression dictionary. A real
/// implementation opens a short-lived broker connection and reads from
/// offset 0 looking for `START_OF_PUSH`, per §9's decision to avoid
/// perturbing the main poll loop's assignment.
pub trait DictionaryReader: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read_dictionary(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
}

/// Per-version compressor cache. Safe for concurrent read-during-write: a
/// lookup for one topic never blocks a concurrent insert for another (§5).
pub struct CompressorRegistry<D> {
    dictionary_reader: Arc<D>,
    cache: DashMap<String, Arc<dyn Compressor>>,
}

impl<D: DictionaryReader> CompressorRegistry<D> {
    pub fn new(dictionary_reader: Arc<D>) -> Self {
        Self {
            dictionary_reader,
            cache: DashMap::new(),
        }
    }

    pub async fn get(
        &self,
        partition: Partition,
        topic: &str,
        mode: CompressionMode,
    ) -> crate::Result<Arc<dyn Compressor>> {
        if let CompressionMode::None = mode {
            return Ok(self
                .cache
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(NoopCompressor))
                .clone());
        }
        if let Some(compressor) = self.cache.get(topic) {
            return Ok(compressor.clone());
        }

        let compressor: Arc<dyn Compressor> = match mode {
            CompressionMode::None => Arc::new(NoopCompressor),
            CompressionMode::Gzip => Arc::new(GzipCompressor),
            CompressionMode::ZstdWithDict => {
                let dictionary = self
                    .dictionary_reader
                    .read_dictionary(topic)
                    .await
                    .map_err(|e| crate::Error::DictionaryUnreadable {
                        partition,
                        topic: topic.to_string(),
                        source: Box::new(e),
                    })?
                    .ok_or_else(|| crate::Error::DictionaryUnreadable {
                        partition,
                        topic: topic.to_string(),
                        source: Box::new(crate::Error::Protocol(
                            "no START_OF_PUSH dictionary found before the requested offset",
                        )),
                    })?;
                tracing::info!(topic, dictionary_len = dictionary.len(), "fetched compression dictionary");
                Arc::new(ZstdDictCompressor::new(dictionary))
            }
        };

        self.cache.insert(topic.to_string(), compressor.clone());
        Ok(compressor)
    }

    /// Drops any cached compressor for `topic`, forcing a re-fetch of its
    /// dictionary on next use. Not driven by the poll loop directly, but
    /// useful for callers recovering from a `DictionaryUnreadable` error.
    pub fn evict(&self, topic: &str) {
        self.cache.remove(topic);
    }
}
