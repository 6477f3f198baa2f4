//! Pluggable file storage.
//!
//! One async interface over local disk, memory, S3 and GCS, plus two
//! wrappers that work over any of them: path-prefix isolation and a
//! multi-tier read-through cache that backfills faster tiers while the
//! caller reads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tierstore::{CachedStorage, LocalStorage, S3Config, S3Storage, StorageBackend};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> tierstore::StorageResult<()> {
//! let local: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new("/var/cache/objects".into()));
//! let s3: Arc<dyn StorageBackend> =
//!     Arc::new(S3Storage::new(S3Config::aws("objects".into(), "us-east-1".into())).await);
//!
//! let cache = CachedStorage::new(vec![local, s3])?;
//! let file = cache.open("reports/2024.csv", &CancellationToken::new()).await?;
//! let bytes = file.read_to_end().await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

pub mod storage;

pub use storage::{
    write_all, BackfillError, BackfillHook, BoxWriter, ByteReader, CacheConfig, CachedStorage,
    FileWriter, GcsConfig, GcsStorage, LocalStorage, MemoryStorage, PrefixedStorage, S3Config,
    S3Storage, StorageBackend, StorageConfig, StorageError, StorageFile, StorageResult,
    StorageType, StreamingWriter, TeeOptions,
};
