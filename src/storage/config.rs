//! Storage configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{
    CachedStorage, GcsConfig, GcsStorage, LocalStorage, MemoryStorage, PrefixedStorage, S3Config,
    S3Storage, StorageBackend, StorageError, StorageResult, TeeOptions,
};

/// Storage backend type
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageType {
    /// Local filesystem storage
    Local { path: PathBuf },
    /// In-process map, mostly for tests
    Memory,
    /// S3-compatible storage (AWS S3, MinIO, R2, etc.)
    S3(S3Config),
    /// Google Cloud Storage
    Gcs(GcsConfig),
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Local {
            path: std::env::temp_dir().join("tierstore"),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Storage backend type
    #[serde(flatten)]
    pub storage_type: StorageType,
    /// Confine the backend to this path prefix
    #[serde(default)]
    pub prefix: Option<String>,
}

impl StorageConfig {
    /// Create config for local storage at the given path
    pub fn local(path: PathBuf) -> Self {
        Self::from(StorageType::Local { path })
    }

    pub fn memory() -> Self {
        Self::from(StorageType::Memory)
    }

    /// Create config for AWS S3 storage
    pub fn s3(bucket: String, region: String) -> Self {
        Self::from(StorageType::S3(S3Config::aws(bucket, region)))
    }

    /// Create config for MinIO or other S3-compatible storage
    pub fn minio(bucket: String, endpoint: String) -> Self {
        Self::from(StorageType::S3(S3Config::minio(bucket, endpoint)))
    }

    pub fn gcs(bucket: String) -> Self {
        Self::from(StorageType::Gcs(GcsConfig::new(bucket)))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Build a storage backend from this config
    pub async fn build(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match &self.storage_type {
            StorageType::Local { path } => {
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|e| StorageError::from_io(e, &path.to_string_lossy()))?;
                Arc::new(LocalStorage::new(path.clone()))
            }
            StorageType::Memory => Arc::new(MemoryStorage::new()),
            StorageType::S3(config) => Arc::new(S3Storage::new(config.clone()).await),
            StorageType::Gcs(config) => Arc::new(GcsStorage::new(config.clone())?),
        };

        match self.prefix.as_deref() {
            Some(prefix) if !prefix.trim_matches('/').is_empty() => {
                Ok(Arc::new(PrefixedStorage::new(backend, prefix)))
            }
            _ => Ok(backend),
        }
    }
}

impl From<StorageType> for StorageConfig {
    fn from(storage_type: StorageType) -> Self {
        Self {
            storage_type,
            prefix: None,
        }
    }
}

/// Configuration for a [`CachedStorage`] chain, fastest tier first.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub tiers: Vec<StorageConfig>,
    /// Milliseconds a full backfill branch may hold up a read
    #[serde(default)]
    pub stall_timeout_ms: Option<u64>,
    /// Chunks buffered per backfill branch
    #[serde(default)]
    pub buffer_chunks: Option<usize>,
    /// Bytes per chunk
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

impl CacheConfig {
    pub fn new(tiers: Vec<StorageConfig>) -> Self {
        Self {
            tiers,
            stall_timeout_ms: None,
            buffer_chunks: None,
            chunk_size: None,
        }
    }

    pub fn tee_options(&self) -> TeeOptions {
        let defaults = TeeOptions::default();
        TeeOptions {
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size).max(1),
            buffer_chunks: self.buffer_chunks.unwrap_or(defaults.buffer_chunks).max(1),
            stall_timeout: self
                .stall_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stall_timeout),
        }
    }

    /// Build every tier and chain them
    pub async fn build(&self) -> StorageResult<CachedStorage> {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            tiers.push(tier.build().await?);
        }
        Ok(CachedStorage::new(tiers)?.with_tee_options(self.tee_options()))
    }
}
